//! A decorator that records verbs calls and polices the teardown order.
//!
//! Within one context, resources must go in the order
//! MR -> QP -> CQ -> PD -> context. A destroy call that would break that
//! order is refused with `EBUSY` before it reaches the wrapped provider.

use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::vec::Vec;

use spin::Mutex;

use crate::types::*;
use crate::verbs::Verbs;
use crate::{Error, KernelResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Resource {
    Mr(MrHandle),
    Qp(QpHandle),
    Cq(CqHandle),
    Pd(PdHandle),
    Context(ContextHandle),
}

impl Resource {
    /// Position in the teardown order, lower goes first
    pub fn rank(&self) -> u8 {
        match self {
            Resource::Mr(_) => 0,
            Resource::Qp(_) => 1,
            Resource::Cq(_) => 2,
            Resource::Pd(_) => 3,
            Resource::Context(_) => 4,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Create(Resource),
    Destroy(Resource),
    /// A destroy refused because an earlier-ranked resource was still alive
    OutOfOrder {
        target: Resource,
        blocker: Resource,
    },
    ModifyQp {
        qp: QpHandle,
        to: Option<QpState>,
        mask: QpAttrMask,
    },
    PostSend {
        qp: QpHandle,
        wr_id: u64,
    },
    PollCq {
        cq: CqHandle,
        found: usize,
    },
    /// Any call that failed in the wrapped provider
    Failed {
        call: &'static str,
        error: Error,
    },
}

struct Ledger {
    calls: Vec<Call>,
    /// live resource -> owning context
    live: BTreeMap<Resource, ContextHandle>,
}

pub struct AuditedVerbs<V> {
    inner: V,
    ledger: Mutex<Ledger>,
}

impl<V: Verbs> AuditedVerbs<V> {
    pub fn new(inner: V) -> Self {
        Self {
            inner,
            ledger: Mutex::new(Ledger {
                calls: Vec::new(),
                live: BTreeMap::new(),
            }),
        }
    }

    pub fn inner(&self) -> &V {
        &self.inner
    }

    pub fn calls(&self) -> Vec<Call> {
        self.ledger.lock().calls.clone()
    }

    /// Resources destroyed so far, in the order they went away
    pub fn destroyed(&self) -> Vec<Resource> {
        self.ledger
            .lock()
            .calls
            .iter()
            .filter_map(|c| match c {
                Call::Destroy(r) => Some(*r),
                _ => None,
            })
            .collect()
    }

    pub fn live_count(&self) -> usize {
        self.ledger.lock().live.len()
    }

    fn record(&self, call: Call) {
        self.ledger.lock().calls.push(call);
    }

    fn track<T>(
        &self,
        call: &'static str,
        res: KernelResult<T>,
        created: impl FnOnce(&T) -> (Resource, ContextHandle),
    ) -> KernelResult<T> {
        let mut ledger = self.ledger.lock();
        match &res {
            Ok(v) => {
                let (resource, ctx) = created(v);
                ledger.live.insert(resource, ctx);
                ledger.calls.push(Call::Create(resource));
            }
            Err(error) => ledger.calls.push(Call::Failed {
                call,
                error: *error,
            }),
        }
        res
    }

    fn owner_of(&self, resource: Resource) -> KernelResult<ContextHandle> {
        self.ledger
            .lock()
            .live
            .get(&resource)
            .copied()
            .ok_or(Error::EINVAL)
    }

    fn destroy(
        &self,
        call: &'static str,
        target: Resource,
        op: impl FnOnce() -> KernelResult<()>,
    ) -> KernelResult<()> {
        {
            let mut ledger = self.ledger.lock();
            if let Some(ctx) = ledger.live.get(&target).copied() {
                let blocker = ledger
                    .live
                    .iter()
                    .find(|(r, c)| **c == ctx && r.rank() < target.rank())
                    .map(|(r, _)| *r);
                if let Some(blocker) = blocker {
                    log::error!(
                        "teardown out of order: {:?} destroyed while {:?} is alive",
                        target,
                        blocker
                    );
                    ledger.calls.push(Call::OutOfOrder { target, blocker });
                    return Err(Error::EBUSY);
                }
            }
        }

        let res = op();
        let mut ledger = self.ledger.lock();
        match res {
            Ok(()) => {
                ledger.live.remove(&target);
                ledger.calls.push(Call::Destroy(target));
            }
            Err(error) => ledger.calls.push(Call::Failed { call, error }),
        }
        res
    }
}

impl<V: Verbs> Verbs for AuditedVerbs<V> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn fork_init(&self) -> KernelResult<()> {
        self.inner.fork_init()
    }

    fn device_names(&self) -> KernelResult<Vec<String>> {
        self.inner.device_names()
    }

    fn is_process_local(&self) -> bool {
        self.inner.is_process_local()
    }

    fn open_device(&self, index: usize) -> KernelResult<ContextHandle> {
        let res = self.inner.open_device(index);
        self.track("open_device", res, |ctx| (Resource::Context(*ctx), *ctx))
    }

    fn close_device(&self, ctx: ContextHandle) -> KernelResult<()> {
        self.destroy("close_device", Resource::Context(ctx), || {
            self.inner.close_device(ctx)
        })
    }

    fn query_port(&self, ctx: ContextHandle, port_num: u8) -> KernelResult<PortAttr> {
        self.inner.query_port(ctx, port_num)
    }

    fn alloc_pd(&self, ctx: ContextHandle) -> KernelResult<PdHandle> {
        let res = self.inner.alloc_pd(ctx);
        self.track("alloc_pd", res, |pd| (Resource::Pd(*pd), ctx))
    }

    fn dealloc_pd(&self, pd: PdHandle) -> KernelResult<()> {
        self.destroy("dealloc_pd", Resource::Pd(pd), || self.inner.dealloc_pd(pd))
    }

    fn create_cq(&self, ctx: ContextHandle, cqe: u32) -> KernelResult<CqHandle> {
        let res = self.inner.create_cq(ctx, cqe);
        self.track("create_cq", res, |cq| (Resource::Cq(*cq), ctx))
    }

    fn destroy_cq(&self, cq: CqHandle) -> KernelResult<()> {
        self.destroy("destroy_cq", Resource::Cq(cq), || self.inner.destroy_cq(cq))
    }

    fn create_qp(&self, pd: PdHandle, attr: &QpInitAttr) -> KernelResult<(QpHandle, u32)> {
        let ctx = self.owner_of(Resource::Pd(pd))?;
        let res = self.inner.create_qp(pd, attr);
        self.track("create_qp", res, |(qp, _)| (Resource::Qp(*qp), ctx))
    }

    fn destroy_qp(&self, qp: QpHandle) -> KernelResult<()> {
        self.destroy("destroy_qp", Resource::Qp(qp), || self.inner.destroy_qp(qp))
    }

    fn modify_qp(&self, qp: QpHandle, attr: &QpAttr, mask: QpAttrMask) -> KernelResult<()> {
        let res = self.inner.modify_qp(qp, attr, mask);
        match res {
            Ok(()) => self.record(Call::ModifyQp {
                qp,
                to: attr.qp_state,
                mask,
            }),
            Err(error) => self.record(Call::Failed {
                call: "modify_qp",
                error,
            }),
        }
        res
    }

    fn query_qp_state(&self, qp: QpHandle) -> KernelResult<QpState> {
        self.inner.query_qp_state(qp)
    }

    unsafe fn reg_mr(
        &self,
        pd: PdHandle,
        addr: *mut u8,
        length: usize,
        access: AccessFlags,
    ) -> KernelResult<MrInfo> {
        let ctx = self.owner_of(Resource::Pd(pd))?;
        let res = self.inner.reg_mr(pd, addr, length, access);
        self.track("reg_mr", res, |mr| (Resource::Mr(mr.handle), ctx))
    }

    fn dereg_mr(&self, mr: MrHandle) -> KernelResult<()> {
        self.destroy("dereg_mr", Resource::Mr(mr), || self.inner.dereg_mr(mr))
    }

    fn post_send(&self, qp: QpHandle, wr: &SendWr) -> KernelResult<()> {
        let res = self.inner.post_send(qp, wr);
        match res {
            Ok(()) => self.record(Call::PostSend {
                qp,
                wr_id: wr.wr_id,
            }),
            Err(error) => self.record(Call::Failed {
                call: "post_send",
                error,
            }),
        }
        res
    }

    fn poll_cq(&self, cq: CqHandle, completions: &mut [WorkCompletion]) -> KernelResult<usize> {
        let res = self.inner.poll_cq(cq, completions);
        if let Ok(found) = res {
            // empty polls are the common case while spinning
            if found > 0 {
                self.record(Call::PollCq { cq, found });
            }
        }
        res
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::soft::SoftFabric;
    use std::vec;

    #[test]
    fn out_of_order_destroy_is_refused() {
        let verbs = AuditedVerbs::new(SoftFabric::new());
        let ctx = verbs.open_device(0).expect("open");
        let pd = verbs.alloc_pd(ctx).expect("pd");
        let cq = verbs.create_cq(ctx, 4).expect("cq");
        let mut buf = vec![0u8; 8];
        let mr = unsafe { verbs.reg_mr(pd, buf.as_mut_ptr(), 8, AccessFlags::all_remote()) }
            .expect("mr");

        // the soft fabric itself would accept this one, the audit must not
        assert_eq!(verbs.destroy_cq(cq), Err(Error::EBUSY));
        assert!(verbs.calls().contains(&Call::OutOfOrder {
            target: Resource::Cq(cq),
            blocker: Resource::Mr(mr.handle),
        }));

        verbs.dereg_mr(mr.handle).expect("mr");
        verbs.destroy_cq(cq).expect("cq");
        verbs.dealloc_pd(pd).expect("pd");
        verbs.close_device(ctx).expect("ctx");
        assert_eq!(
            verbs.destroyed(),
            vec![
                Resource::Mr(mr.handle),
                Resource::Cq(cq),
                Resource::Pd(pd),
                Resource::Context(ctx)
            ]
        );
        assert_eq!(verbs.live_count(), 0);
    }

    #[test]
    fn contexts_are_audited_independently() {
        let verbs = AuditedVerbs::new(SoftFabric::new());
        let a = verbs.open_device(0).expect("open");
        let b = verbs.open_device(0).expect("open");
        let _pd = verbs.alloc_pd(a).expect("pd");
        verbs.close_device(b).expect("an unrelated context may close");
    }

    #[test]
    fn provider_failures_are_recorded() {
        let verbs = AuditedVerbs::new(SoftFabric::with_devices(0));
        assert_eq!(verbs.open_device(0), Err(Error::ENODEV));
        assert_eq!(
            verbs.calls(),
            vec![Call::Failed {
                call: "open_device",
                error: Error::ENODEV
            }]
        );
    }
}
