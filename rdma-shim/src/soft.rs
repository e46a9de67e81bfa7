//! An in-process RC fabric.
//!
//! Every device opened from one [`SoftFabric`] sits on the same subnet, and a
//! QP reaches its peer by `(lid, qpn)` like on a real port. One-sided
//! operations are executed synchronously inside `post_send`: the bytes move
//! before the call returns and the completion is already queued.

use alloc::collections::{BTreeMap, VecDeque};
use alloc::format;
use alloc::string::String;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, Ordering};

use spin::Mutex;

use crate::types::*;
use crate::verbs::Verbs;
use crate::{Error, KernelResult};

/// `IBV_PORT_ACTIVE`
pub const PORT_ACTIVE: u32 = 4;

/// The only port each soft device has
pub const SOFT_PORT: u8 = 1;

/// QP numbers of the `n`-th fabric of the process start at `0x100 + (n << 16)`
static FABRICS: AtomicU32 = AtomicU32::new(0);

struct SoftDevice {
    name: String,
    lid: u16,
}

struct SoftContext {
    device: usize,
}

struct SoftPd {
    ctx: ContextHandle,
}

struct SoftCq {
    ctx: ContextHandle,
    depth: usize,
    entries: VecDeque<WorkCompletion>,
}

struct SoftQp {
    pd: PdHandle,
    cq: CqHandle,
    qpn: u32,
    cap: QpCap,
    state: QpState,
    access: AccessFlags,
    dlid: Option<u16>,
    dest_qpn: Option<u32>,
    /// Completions queued but not yet polled
    pending: u32,
}

struct SoftMr {
    pd: PdHandle,
    addr: u64,
    length: usize,
    access: AccessFlags,
    lkey: u32,
    rkey: u32,
}

struct Tables {
    next_handle: u64,
    next_qpn: u32,
    next_key: u32,
    contexts: BTreeMap<ContextHandle, SoftContext>,
    pds: BTreeMap<PdHandle, SoftPd>,
    cqs: BTreeMap<CqHandle, SoftCq>,
    qps: BTreeMap<QpHandle, SoftQp>,
    mrs: BTreeMap<MrHandle, SoftMr>,
}

impl Tables {
    fn new(first_qpn: u32) -> Self {
        Self {
            next_handle: 0,
            next_qpn: first_qpn,
            next_key: 0x1000,
            contexts: BTreeMap::new(),
            pds: BTreeMap::new(),
            cqs: BTreeMap::new(),
            qps: BTreeMap::new(),
            mrs: BTreeMap::new(),
        }
    }

    fn fresh_handle(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }

    fn fresh_key(&mut self) -> u32 {
        self.next_key = self.next_key.wrapping_add(1);
        self.next_key
    }

    fn device_of_pd(&self, pd: PdHandle) -> Option<usize> {
        let ctx = self.pds.get(&pd)?.ctx;
        Some(self.contexts.get(&ctx)?.device)
    }
}

/// The software provider. Cheap to create, so tests usually own one each.
pub struct SoftFabric {
    devices: Vec<SoftDevice>,
    tables: Mutex<Tables>,
}

impl SoftFabric {
    /// A fabric with a single device `soft_0` at lid 1
    pub fn new() -> Self {
        Self::with_devices(1)
    }

    /// Device `i` is named `soft_i` and its port has lid `i + 1`
    pub fn with_devices(count: usize) -> Self {
        let devices = (0..count)
            .map(|i| SoftDevice {
                name: format!("soft_{}", i),
                lid: i as u16 + 1,
            })
            .collect();
        let nth = FABRICS.fetch_add(1, Ordering::Relaxed) & 0xff;
        Self {
            devices,
            tables: Mutex::new(Tables::new(0x100 + (nth << 16))),
        }
    }

    /// Number of contexts, PDs, CQs, QPs and MRs still alive
    pub fn live_resources(&self) -> usize {
        let t = self.tables.lock();
        t.contexts.len() + t.pds.len() + t.cqs.len() + t.qps.len() + t.mrs.len()
    }

    fn lid_of(&self, device: usize) -> Option<u16> {
        self.devices.get(device).map(|d| d.lid)
    }

    /// Run one work request to its completion status
    fn execute(&self, t: &Tables, qp: &SoftQp, wr: &SendWr) -> WcStatus {
        let len = wr.sge.length as usize;

        let local = t
            .mrs
            .values()
            .find(|mr| mr.pd == qp.pd && mr.lkey == wr.sge.lkey);
        let local = match local {
            Some(mr) if in_bounds(mr, wr.sge.addr, len) => mr,
            _ => return WcStatus::LocProtErr,
        };
        if wr.opcode == WrOpcode::RdmaRead && !local.access.contains(AccessFlags::LOCAL_WRITE) {
            return WcStatus::LocProtErr;
        }

        let my_lid = match t.device_of_pd(qp.pd).and_then(|d| self.lid_of(d)) {
            Some(lid) => lid,
            None => return WcStatus::GeneralErr,
        };
        let peer = t.qps.values().find(|p| {
            Some(p.qpn) == qp.dest_qpn
                && t.device_of_pd(p.pd).and_then(|d| self.lid_of(d)) == qp.dlid
        });
        let peer = match peer {
            Some(p)
                if matches!(p.state, QpState::ReadyToRecv | QpState::ReadyToSend)
                    && p.dest_qpn == Some(qp.qpn)
                    && p.dlid == Some(my_lid) =>
            {
                p
            }
            _ => return WcStatus::RetryExcErr,
        };

        let needed = match wr.opcode {
            WrOpcode::RdmaRead => AccessFlags::REMOTE_READ,
            WrOpcode::RdmaWrite => AccessFlags::REMOTE_WRITE,
        };
        if !peer.access.contains(needed) {
            return WcStatus::RemAccessErr;
        }
        let remote = t
            .mrs
            .values()
            .find(|mr| mr.pd == peer.pd && mr.rkey == wr.rkey);
        match remote {
            Some(mr) if mr.access.contains(needed) && in_bounds(mr, wr.remote_addr, len) => {}
            _ => return WcStatus::RemAccessErr,
        }

        let (src, dst) = match wr.opcode {
            WrOpcode::RdmaRead => (wr.remote_addr, wr.sge.addr),
            WrOpcode::RdmaWrite => (wr.sge.addr, wr.remote_addr),
        };
        // both ranges lie inside registered regions, which reg_mr requires to
        // stay valid until they are deregistered
        unsafe { core::ptr::copy(src as *const u8, dst as *mut u8, len) };
        WcStatus::Success
    }
}

impl Default for SoftFabric {
    fn default() -> Self {
        Self::new()
    }
}

fn in_bounds(mr: &SoftMr, addr: u64, len: usize) -> bool {
    let end = match addr.checked_add(len as u64) {
        Some(end) => end,
        None => return false,
    };
    addr >= mr.addr && end <= mr.addr + mr.length as u64
}

impl Verbs for SoftFabric {
    fn name(&self) -> &str {
        "soft"
    }

    fn fork_init(&self) -> KernelResult<()> {
        Ok(())
    }

    fn device_names(&self) -> KernelResult<Vec<String>> {
        Ok(self.devices.iter().map(|d| d.name.clone()).collect())
    }

    fn is_process_local(&self) -> bool {
        true
    }

    fn open_device(&self, index: usize) -> KernelResult<ContextHandle> {
        if index >= self.devices.len() {
            return Err(Error::ENODEV);
        }
        let mut t = self.tables.lock();
        let handle = ContextHandle(t.fresh_handle());
        t.contexts.insert(handle, SoftContext { device: index });
        Ok(handle)
    }

    fn close_device(&self, ctx: ContextHandle) -> KernelResult<()> {
        let mut t = self.tables.lock();
        if !t.contexts.contains_key(&ctx) {
            return Err(Error::EINVAL);
        }
        if t.pds.values().any(|pd| pd.ctx == ctx) || t.cqs.values().any(|cq| cq.ctx == ctx) {
            return Err(Error::EBUSY);
        }
        t.contexts.remove(&ctx);
        Ok(())
    }

    fn query_port(&self, ctx: ContextHandle, port_num: u8) -> KernelResult<PortAttr> {
        let t = self.tables.lock();
        let device = t.contexts.get(&ctx).ok_or(Error::EINVAL)?.device;
        if port_num != SOFT_PORT {
            return Err(Error::EINVAL);
        }
        Ok(PortAttr {
            lid: self.lid_of(device).ok_or(Error::ENODEV)?,
            active_mtu: Mtu::Mtu4096,
            state: PORT_ACTIVE,
        })
    }

    fn alloc_pd(&self, ctx: ContextHandle) -> KernelResult<PdHandle> {
        let mut t = self.tables.lock();
        if !t.contexts.contains_key(&ctx) {
            return Err(Error::EINVAL);
        }
        let handle = PdHandle(t.fresh_handle());
        t.pds.insert(handle, SoftPd { ctx });
        Ok(handle)
    }

    fn dealloc_pd(&self, pd: PdHandle) -> KernelResult<()> {
        let mut t = self.tables.lock();
        if !t.pds.contains_key(&pd) {
            return Err(Error::EINVAL);
        }
        if t.mrs.values().any(|mr| mr.pd == pd) || t.qps.values().any(|qp| qp.pd == pd) {
            return Err(Error::EBUSY);
        }
        t.pds.remove(&pd);
        Ok(())
    }

    fn create_cq(&self, ctx: ContextHandle, cqe: u32) -> KernelResult<CqHandle> {
        let mut t = self.tables.lock();
        if !t.contexts.contains_key(&ctx) || cqe == 0 {
            return Err(Error::EINVAL);
        }
        let handle = CqHandle(t.fresh_handle());
        t.cqs.insert(
            handle,
            SoftCq {
                ctx,
                depth: cqe as usize,
                entries: VecDeque::new(),
            },
        );
        Ok(handle)
    }

    fn destroy_cq(&self, cq: CqHandle) -> KernelResult<()> {
        let mut t = self.tables.lock();
        if !t.cqs.contains_key(&cq) {
            return Err(Error::EINVAL);
        }
        if t.qps.values().any(|qp| qp.cq == cq) {
            return Err(Error::EBUSY);
        }
        t.cqs.remove(&cq);
        Ok(())
    }

    fn create_qp(&self, pd: PdHandle, attr: &QpInitAttr) -> KernelResult<(QpHandle, u32)> {
        let mut t = self.tables.lock();
        let pd_ctx = t.pds.get(&pd).ok_or(Error::EINVAL)?.ctx;
        let cq_ctx = t.cqs.get(&attr.cq).ok_or(Error::EINVAL)?.ctx;
        if pd_ctx != cq_ctx || attr.cap.max_send_wr == 0 || attr.cap.max_send_sge == 0 {
            return Err(Error::EINVAL);
        }

        let handle = QpHandle(t.fresh_handle());
        let qpn = t.next_qpn;
        t.next_qpn += 1;
        t.qps.insert(
            handle,
            SoftQp {
                pd,
                cq: attr.cq,
                qpn,
                cap: attr.cap,
                state: QpState::Reset,
                access: AccessFlags::empty(),
                dlid: None,
                dest_qpn: None,
                pending: 0,
            },
        );
        Ok((handle, qpn))
    }

    fn destroy_qp(&self, qp: QpHandle) -> KernelResult<()> {
        self.tables
            .lock()
            .qps
            .remove(&qp)
            .map(|_| ())
            .ok_or(Error::EINVAL)
    }

    fn modify_qp(&self, qp: QpHandle, attr: &QpAttr, mask: QpAttrMask) -> KernelResult<()> {
        if mask != attr.implied_mask() {
            log::debug!(
                "soft: mask {:?} does not match the supplied attributes {:?}",
                mask,
                attr.implied_mask()
            );
            return Err(Error::EINVAL);
        }
        let target = attr.qp_state.ok_or(Error::EINVAL)?;

        let mut t = self.tables.lock();
        let current = t.qps.get(&qp).ok_or(Error::EINVAL)?.state;
        let (required, optional) = rc_transition_masks(current, target).ok_or(Error::EINVAL)?;
        if !mask.contains(required) || !(required | optional).contains(mask) {
            log::debug!(
                "soft: {:?} -> {:?} needs {:?}, got {:?}",
                current,
                target,
                required,
                mask
            );
            return Err(Error::EINVAL);
        }
        if attr.port_num.map_or(false, |p| p != SOFT_PORT) {
            return Err(Error::EINVAL);
        }
        if let (QpState::ReadyToRecv, Some(ah)) = (target, attr.ah_attr) {
            if !self.devices.iter().any(|d| d.lid == ah.dlid) {
                log::debug!("soft: no port answers lid {}", ah.dlid);
                return Err(Error::EINVAL);
            }
            let dest = attr.dest_qp_num.ok_or(Error::EINVAL)?;
            let known = t.qps.values().any(|p| {
                p.qpn == dest
                    && t.device_of_pd(p.pd).and_then(|d| self.lid_of(d)) == Some(ah.dlid)
            });
            if !known {
                log::debug!("soft: no qpn {:#x} behind lid {}", dest, ah.dlid);
                return Err(Error::EINVAL);
            }
        }

        let entry = t.qps.get_mut(&qp).ok_or(Error::EINVAL)?;
        if let Some(access) = attr.access_flags {
            entry.access = access;
        }
        if let Some(ah) = attr.ah_attr {
            entry.dlid = Some(ah.dlid);
        }
        if let Some(dest) = attr.dest_qp_num {
            entry.dest_qpn = Some(dest);
        }
        if target == QpState::Reset {
            entry.access = AccessFlags::empty();
            entry.dlid = None;
            entry.dest_qpn = None;
        }
        entry.state = target;
        Ok(())
    }

    fn query_qp_state(&self, qp: QpHandle) -> KernelResult<QpState> {
        self.tables
            .lock()
            .qps
            .get(&qp)
            .map(|e| e.state)
            .ok_or(Error::EINVAL)
    }

    unsafe fn reg_mr(
        &self,
        pd: PdHandle,
        addr: *mut u8,
        length: usize,
        access: AccessFlags,
    ) -> KernelResult<MrInfo> {
        if addr.is_null() || length == 0 {
            return Err(Error::EINVAL);
        }
        // remote write or atomic without local write is refused by real verbs too
        if access.intersects(AccessFlags::REMOTE_WRITE | AccessFlags::REMOTE_ATOMIC)
            && !access.contains(AccessFlags::LOCAL_WRITE)
        {
            return Err(Error::EINVAL);
        }

        let mut t = self.tables.lock();
        if !t.pds.contains_key(&pd) {
            return Err(Error::EINVAL);
        }
        let handle = MrHandle(t.fresh_handle());
        let lkey = t.fresh_key();
        let rkey = t.fresh_key();
        t.mrs.insert(
            handle,
            SoftMr {
                pd,
                addr: addr as u64,
                length,
                access,
                lkey,
                rkey,
            },
        );
        Ok(MrInfo {
            handle,
            addr: addr as u64,
            length,
            lkey,
            rkey,
        })
    }

    fn dereg_mr(&self, mr: MrHandle) -> KernelResult<()> {
        self.tables
            .lock()
            .mrs
            .remove(&mr)
            .map(|_| ())
            .ok_or(Error::EINVAL)
    }

    fn post_send(&self, qp: QpHandle, wr: &SendWr) -> KernelResult<()> {
        let mut t = self.tables.lock();
        let entry = t.qps.get(&qp).ok_or(Error::EINVAL)?;
        if entry.state != QpState::ReadyToSend {
            return Err(Error::EINVAL);
        }
        if entry.pending >= entry.cap.max_send_wr {
            return Err(Error::ENOMEM);
        }
        let cq = t.cqs.get(&entry.cq).ok_or(Error::EINVAL)?;
        if cq.entries.len() >= cq.depth {
            return Err(Error::ENOMEM);
        }

        let status = self.execute(&t, entry, wr);
        let cq_handle = entry.cq;
        let qpn = entry.qpn;

        let entry = t.qps.get_mut(&qp).ok_or(Error::EINVAL)?;
        if !status.is_success() {
            log::debug!("soft: wr {} on qpn {} failed: {}", wr.wr_id, qpn, status);
            entry.state = QpState::Error;
        }
        if wr.signaled || !status.is_success() {
            entry.pending += 1;
            let wc = WorkCompletion {
                wr_id: wr.wr_id,
                status,
                opcode: wr.opcode.into(),
                byte_len: if status.is_success() { wr.sge.length } else { 0 },
                qp_num: qpn,
            };
            t.cqs
                .get_mut(&cq_handle)
                .ok_or(Error::EINVAL)?
                .entries
                .push_back(wc);
        }
        Ok(())
    }

    fn poll_cq(&self, cq: CqHandle, completions: &mut [WorkCompletion]) -> KernelResult<usize> {
        let mut t = self.tables.lock();
        let mut n = 0;
        while n < completions.len() {
            let wc = match t.cqs.get_mut(&cq).ok_or(Error::EINVAL)?.entries.pop_front() {
                Some(wc) => wc,
                None => break,
            };
            if let Some(qp) = t.qps.values_mut().find(|qp| qp.qpn == wc.qp_num) {
                qp.pending = qp.pending.saturating_sub(1);
            }
            completions[n] = wc;
            n += 1;
        }
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::vec;

    const CAP: QpCap = QpCap {
        max_send_wr: 2,
        max_recv_wr: 2,
        max_send_sge: 1,
        max_recv_sge: 1,
    };

    struct Side {
        ctx: ContextHandle,
        pd: PdHandle,
        cq: CqHandle,
        qp: QpHandle,
        qpn: u32,
        lid: u16,
    }

    fn side(fabric: &SoftFabric, device: usize) -> Side {
        let ctx = fabric.open_device(device).expect("open");
        let pd = fabric.alloc_pd(ctx).expect("pd");
        let cq = fabric.create_cq(ctx, 16).expect("cq");
        let (qp, qpn) = fabric
            .create_qp(pd, &QpInitAttr { cq, cap: CAP })
            .expect("qp");
        let lid = fabric.query_port(ctx, SOFT_PORT).expect("port").lid;
        Side {
            ctx,
            pd,
            cq,
            qp,
            qpn,
            lid,
        }
    }

    fn init_attr() -> QpAttr {
        QpAttr {
            qp_state: Some(QpState::Init),
            pkey_index: Some(0),
            port_num: Some(SOFT_PORT),
            access_flags: Some(AccessFlags::all_remote()),
            ..Default::default()
        }
    }

    fn rtr_attr(dlid: u16, dest_qpn: u32) -> QpAttr {
        QpAttr {
            qp_state: Some(QpState::ReadyToRecv),
            ah_attr: Some(AhAttr {
                dlid,
                port_num: SOFT_PORT,
                ..Default::default()
            }),
            path_mtu: Some(Mtu::Mtu4096),
            dest_qp_num: Some(dest_qpn),
            rq_psn: Some(0),
            max_dest_rd_atomic: Some(1),
            min_rnr_timer: Some(12),
            ..Default::default()
        }
    }

    fn rts_attr() -> QpAttr {
        QpAttr {
            qp_state: Some(QpState::ReadyToSend),
            sq_psn: Some(0),
            timeout: Some(14),
            retry_cnt: Some(7),
            rnr_retry: Some(7),
            max_rd_atomic: Some(1),
            ..Default::default()
        }
    }

    fn modify(fabric: &SoftFabric, qp: QpHandle, attr: QpAttr) -> KernelResult<()> {
        fabric.modify_qp(qp, &attr, attr.implied_mask())
    }

    fn connect(fabric: &SoftFabric, a: &Side, b: &Side) {
        for (me, peer) in [(a, b), (b, a)] {
            modify(fabric, me.qp, init_attr()).expect("init");
            modify(fabric, me.qp, rtr_attr(peer.lid, peer.qpn)).expect("rtr");
            modify(fabric, me.qp, rts_attr()).expect("rts");
        }
    }

    fn write_wr(sge: Sge, remote_addr: u64, rkey: u32) -> SendWr {
        SendWr {
            wr_id: 7,
            opcode: WrOpcode::RdmaWrite,
            sge,
            remote_addr,
            rkey,
            signaled: true,
        }
    }

    #[test]
    fn write_moves_bytes_between_connected_qps() {
        let fabric = SoftFabric::with_devices(2);
        let (a, b) = (side(&fabric, 0), side(&fabric, 1));
        connect(&fabric, &a, &b);

        let mut src = vec![0u8; 32];
        let mut dst = vec![0u8; 32];
        src[8..12].copy_from_slice(&[1, 1, 1, 1]);
        let smr = unsafe { fabric.reg_mr(a.pd, src.as_mut_ptr(), 32, AccessFlags::all_remote()) }
            .expect("reg");
        let dmr = unsafe { fabric.reg_mr(b.pd, dst.as_mut_ptr(), 32, AccessFlags::all_remote()) }
            .expect("reg");

        let sge = Sge {
            addr: smr.addr + 8,
            length: 4,
            lkey: smr.lkey,
        };
        fabric
            .post_send(a.qp, &write_wr(sge, dmr.addr + 8, dmr.rkey))
            .expect("post");

        let mut wc = [WorkCompletion::default(); 2];
        assert_eq!(fabric.poll_cq(a.cq, &mut wc).expect("poll"), 1);
        assert_eq!(wc[0].status, WcStatus::Success);
        assert_eq!(wc[0].wr_id, 7);
        assert_eq!(wc[0].byte_len, 4);
        assert_eq!(&dst[..12], &[0, 0, 0, 0, 0, 0, 0, 0, 1, 1, 1, 1]);
        assert_eq!(fabric.poll_cq(a.cq, &mut wc).expect("poll"), 0);
    }

    #[test]
    fn mask_must_match_supplied_fields() {
        let fabric = SoftFabric::new();
        let a = side(&fabric, 0);

        let attr = init_attr();
        let short = QpAttrMask::STATE | QpAttrMask::PORT | QpAttrMask::ACCESS_FLAGS;
        assert_eq!(fabric.modify_qp(a.qp, &attr, short), Err(Error::EINVAL));

        let partial = QpAttr {
            pkey_index: None,
            ..init_attr()
        };
        assert_eq!(modify(&fabric, a.qp, partial), Err(Error::EINVAL));
        assert_eq!(fabric.query_qp_state(a.qp), Ok(QpState::Reset));
    }

    #[test]
    fn transitions_cannot_skip_states() {
        let fabric = SoftFabric::new();
        let a = side(&fabric, 0);
        assert_eq!(
            modify(&fabric, a.qp, rtr_attr(a.lid, a.qpn)),
            Err(Error::EINVAL)
        );
        modify(&fabric, a.qp, init_attr()).expect("init");
        assert_eq!(modify(&fabric, a.qp, rts_attr()), Err(Error::EINVAL));
        assert_eq!(fabric.query_qp_state(a.qp), Ok(QpState::Init));
    }

    #[test]
    fn rtr_towards_unknown_lid_fails() {
        let fabric = SoftFabric::new();
        let a = side(&fabric, 0);
        modify(&fabric, a.qp, init_attr()).expect("init");
        assert_eq!(
            modify(&fabric, a.qp, rtr_attr(0x7777, 1)),
            Err(Error::EINVAL)
        );
        assert_eq!(fabric.query_qp_state(a.qp), Ok(QpState::Init));
    }

    #[test]
    fn rtr_towards_unknown_qpn_fails() {
        let fabric = SoftFabric::new();
        let a = side(&fabric, 0);
        modify(&fabric, a.qp, init_attr()).expect("init");
        assert_eq!(
            modify(&fabric, a.qp, rtr_attr(a.lid, a.qpn + 1)),
            Err(Error::EINVAL)
        );
        assert_eq!(fabric.query_qp_state(a.qp), Ok(QpState::Init));
    }

    #[test]
    fn another_fabric_is_unreachable() {
        let here = SoftFabric::new();
        let there = SoftFabric::new();
        let a = side(&here, 0);
        let b = side(&there, 0);
        // same lid on both, but the QP numbers never overlap
        assert_eq!(a.lid, b.lid);
        assert_ne!(a.qpn, b.qpn);

        modify(&here, a.qp, init_attr()).expect("init");
        assert_eq!(
            modify(&here, a.qp, rtr_attr(b.lid, b.qpn)),
            Err(Error::EINVAL)
        );
        assert!(here.is_process_local());
    }

    #[test]
    fn post_requires_rts() {
        let fabric = SoftFabric::new();
        let a = side(&fabric, 0);
        let sge = Sge {
            addr: 0,
            length: 0,
            lkey: 0,
        };
        assert_eq!(
            fabric.post_send(a.qp, &write_wr(sge, 0, 0)),
            Err(Error::EINVAL)
        );
    }

    #[test]
    fn wrong_rkey_and_out_of_range_fail_without_touching_memory() {
        // (offset into the peer buffer, rkey mangling)
        for (offset, mangle) in [(14u64, 0u32), (0, 0xff)] {
            let fabric = SoftFabric::new();
            let (a, b) = (side(&fabric, 0), side(&fabric, 0));
            connect(&fabric, &a, &b);

            let mut src = vec![9u8; 16];
            let mut dst = vec![0u8; 16];
            let smr =
                unsafe { fabric.reg_mr(a.pd, src.as_mut_ptr(), 16, AccessFlags::all_remote()) }
                    .expect("reg");
            let dmr =
                unsafe { fabric.reg_mr(b.pd, dst.as_mut_ptr(), 16, AccessFlags::all_remote()) }
                    .expect("reg");
            let sge = Sge {
                addr: smr.addr,
                length: 4,
                lkey: smr.lkey,
            };

            fabric
                .post_send(a.qp, &write_wr(sge, dmr.addr + offset, dmr.rkey ^ mangle))
                .expect("post");
            let mut wc = [WorkCompletion::default(); 1];
            assert_eq!(fabric.poll_cq(a.cq, &mut wc).expect("poll"), 1);
            assert_eq!(wc[0].status, WcStatus::RemAccessErr);
            assert_eq!(fabric.query_qp_state(a.qp), Ok(QpState::Error));
            assert!(dst.iter().all(|b| *b == 0));
        }
    }

    #[test]
    fn peer_not_connected_back_is_a_retry_error() {
        let fabric = SoftFabric::new();
        let (a, b) = (side(&fabric, 0), side(&fabric, 0));
        modify(&fabric, a.qp, init_attr()).expect("init");
        modify(&fabric, a.qp, rtr_attr(b.lid, b.qpn)).expect("rtr");
        modify(&fabric, a.qp, rts_attr()).expect("rts");

        let mut buf = vec![0u8; 8];
        let mr = unsafe { fabric.reg_mr(a.pd, buf.as_mut_ptr(), 8, AccessFlags::all_remote()) }
            .expect("reg");
        let sge = Sge {
            addr: mr.addr,
            length: 4,
            lkey: mr.lkey,
        };
        fabric
            .post_send(a.qp, &write_wr(sge, 0, 0))
            .expect("post");
        let mut wc = [WorkCompletion::default(); 1];
        assert_eq!(fabric.poll_cq(a.cq, &mut wc).expect("poll"), 1);
        assert_eq!(wc[0].status, WcStatus::RetryExcErr);
    }

    #[test]
    fn destroy_with_dependents_is_busy() {
        let fabric = SoftFabric::new();
        let a = side(&fabric, 0);
        let mut buf = vec![0u8; 8];
        let mr = unsafe { fabric.reg_mr(a.pd, buf.as_mut_ptr(), 8, AccessFlags::all_remote()) }
            .expect("reg");

        assert_eq!(fabric.close_device(a.ctx), Err(Error::EBUSY));
        assert_eq!(fabric.dealloc_pd(a.pd), Err(Error::EBUSY));
        assert_eq!(fabric.destroy_cq(a.cq), Err(Error::EBUSY));

        fabric.dereg_mr(mr.handle).expect("mr");
        fabric.destroy_qp(a.qp).expect("qp");
        fabric.destroy_cq(a.cq).expect("cq");
        fabric.dealloc_pd(a.pd).expect("pd");
        fabric.close_device(a.ctx).expect("ctx");
        assert_eq!(fabric.live_resources(), 0);
    }

    #[test]
    fn unknown_device_index() {
        let fabric = SoftFabric::with_devices(0);
        assert!(fabric.device_names().expect("names").is_empty());
        assert_eq!(fabric.open_device(0), Err(Error::ENODEV));
    }
}
