//! The libibverbs provider.
//!
//! Handles are the raw verbs pointers. Data-path calls go through the
//! context's ops table, as the inline `ibv_post_send` / `ibv_poll_cq` do.

use alloc::string::String;
use alloc::vec::Vec;
use core::ffi::CStr;
use core::ptr::null_mut;

use libc::c_int;
use rust_user_rdma::*;

use crate::types::*;
use crate::verbs::Verbs;
use crate::{Error, KernelResult};

/// At most this many completions are fetched per `poll_cq` call
const POLL_BATCH: usize = 16;

/// The device list returned by `ibv_get_device_list`
struct DeviceList {
    raw: *mut *mut ibv_device,
    len: usize,
}

// the list is only read after creation and freed once in Drop
unsafe impl Send for DeviceList {}
unsafe impl Sync for DeviceList {}

impl DeviceList {
    fn get(&self, index: usize) -> Option<*mut ibv_device> {
        if index < self.len {
            Some(unsafe { *self.raw.add(index) })
        } else {
            None
        }
    }
}

pub struct IbvProvider {
    devices: DeviceList,
}

fn last_errno() -> Error {
    Error::from_kernel_errno(unsafe { *libc::__errno_location() })
}

fn check(ret: c_int) -> KernelResult<()> {
    if ret != 0 {
        Err(Error::from_kernel_errno(ret))
    } else {
        Ok(())
    }
}

fn non_null<T>(ptr: *mut T) -> KernelResult<u64> {
    if ptr.is_null() {
        Err(last_errno())
    } else {
        Ok(ptr as u64)
    }
}

fn mtu_from_raw(raw: u32) -> Mtu {
    match raw {
        1 => Mtu::Mtu256,
        2 => Mtu::Mtu512,
        3 => Mtu::Mtu1024,
        4 => Mtu::Mtu2048,
        _ => Mtu::Mtu4096,
    }
}

impl IbvProvider {
    /// Query the device list on this machine
    pub fn create() -> KernelResult<Self> {
        let mut n = 0i32;
        let raw = unsafe { ibv_get_device_list(&mut n as *mut _) };
        if raw.is_null() {
            log::error!("ibv_get_device_list failed");
            return Err(last_errno());
        }
        Ok(Self {
            devices: DeviceList {
                raw,
                len: n as usize,
            },
        })
    }
}

impl Drop for IbvProvider {
    fn drop(&mut self) {
        unsafe { ibv_free_device_list(self.devices.raw) };
    }
}

impl Verbs for IbvProvider {
    fn name(&self) -> &str {
        "ibverbs"
    }

    fn fork_init(&self) -> KernelResult<()> {
        check(unsafe { ibv_fork_init() })
    }

    fn device_names(&self) -> KernelResult<Vec<String>> {
        let mut names = Vec::with_capacity(self.devices.len);
        for i in 0..self.devices.len {
            let dev = self.devices.get(i).ok_or(Error::ENODEV)?;
            let name = unsafe { ibv_get_device_name(dev) };
            if name.is_null() {
                return Err(Error::ENODEV);
            }
            let name = unsafe { CStr::from_ptr(name) };
            names.push(String::from(name.to_str().map_err(|_| Error::EINVAL)?));
        }
        Ok(names)
    }

    fn open_device(&self, index: usize) -> KernelResult<ContextHandle> {
        let dev = self.devices.get(index).ok_or(Error::ENODEV)?;
        non_null(unsafe { ibv_open_device(dev) }).map(ContextHandle)
    }

    fn close_device(&self, ctx: ContextHandle) -> KernelResult<()> {
        check(unsafe { ibv_close_device(ctx.0 as *mut ibv_context) })
    }

    fn query_port(&self, ctx: ContextHandle, port_num: u8) -> KernelResult<PortAttr> {
        let mut attr: ibv_port_attr = Default::default();
        check(unsafe {
            ibv_query_port(
                ctx.0 as *mut ibv_context,
                port_num,
                &mut attr as *mut ibv_port_attr as *mut _,
            )
        })?;
        Ok(PortAttr {
            lid: attr.lid,
            active_mtu: mtu_from_raw(attr.active_mtu as u32),
            state: attr.state as u32,
        })
    }

    fn alloc_pd(&self, ctx: ContextHandle) -> KernelResult<PdHandle> {
        non_null(unsafe { ibv_alloc_pd(ctx.0 as *mut ibv_context) }).map(PdHandle)
    }

    fn dealloc_pd(&self, pd: PdHandle) -> KernelResult<()> {
        check(unsafe { ibv_dealloc_pd(pd.0 as *mut ibv_pd) })
    }

    fn create_cq(&self, ctx: ContextHandle, cqe: u32) -> KernelResult<CqHandle> {
        let cq = unsafe {
            ibv_create_cq(
                ctx.0 as *mut ibv_context,
                cqe as c_int,
                null_mut(),
                null_mut(),
                0,
            )
        };
        non_null(cq).map(CqHandle)
    }

    fn destroy_cq(&self, cq: CqHandle) -> KernelResult<()> {
        check(unsafe { ibv_destroy_cq(cq.0 as *mut ibv_cq) })
    }

    fn create_qp(&self, pd: PdHandle, attr: &QpInitAttr) -> KernelResult<(QpHandle, u32)> {
        let cq = attr.cq.0 as *mut ibv_cq;
        let mut init = ibv_qp_init_attr {
            send_cq: cq,
            recv_cq: cq,
            qp_type: ibv_qp_type::IBV_QPT_RC,
            sq_sig_all: 0,
            ..Default::default()
        };
        init.cap.max_send_wr = attr.cap.max_send_wr;
        init.cap.max_recv_wr = attr.cap.max_recv_wr;
        init.cap.max_send_sge = attr.cap.max_send_sge;
        init.cap.max_recv_sge = attr.cap.max_recv_sge;

        let qp = unsafe { ibv_create_qp(pd.0 as *mut ibv_pd, &mut init as *mut _) };
        let handle = non_null(qp)?;
        Ok((QpHandle(handle), unsafe { (*qp).qp_num }))
    }

    fn destroy_qp(&self, qp: QpHandle) -> KernelResult<()> {
        check(unsafe { ibv_destroy_qp(qp.0 as *mut ibv_qp) })
    }

    fn modify_qp(&self, qp: QpHandle, attr: &QpAttr, mask: QpAttrMask) -> KernelResult<()> {
        let mut raw: ibv_qp_attr = Default::default();
        if let Some(state) = attr.qp_state {
            raw.qp_state = state as u32;
        }
        if let Some(v) = attr.pkey_index {
            raw.pkey_index = v;
        }
        if let Some(v) = attr.port_num {
            raw.port_num = v;
        }
        if let Some(v) = attr.access_flags {
            raw.qp_access_flags = v.bits() as _;
        }
        if let Some(ah) = attr.ah_attr {
            raw.ah_attr.dlid = ah.dlid;
            raw.ah_attr.sl = ah.sl;
            raw.ah_attr.src_path_bits = ah.src_path_bits;
            raw.ah_attr.port_num = ah.port_num;
        }
        if let Some(mtu) = attr.path_mtu {
            raw.path_mtu = mtu as u32;
        }
        if let Some(v) = attr.dest_qp_num {
            raw.dest_qp_num = v;
        }
        if let Some(v) = attr.rq_psn {
            raw.rq_psn = v;
        }
        if let Some(v) = attr.max_dest_rd_atomic {
            raw.max_dest_rd_atomic = v;
        }
        if let Some(v) = attr.min_rnr_timer {
            raw.min_rnr_timer = v;
        }
        if let Some(v) = attr.sq_psn {
            raw.sq_psn = v;
        }
        if let Some(v) = attr.timeout {
            raw.timeout = v;
        }
        if let Some(v) = attr.retry_cnt {
            raw.retry_cnt = v;
        }
        if let Some(v) = attr.rnr_retry {
            raw.rnr_retry = v;
        }
        if let Some(v) = attr.max_rd_atomic {
            raw.max_rd_atomic = v;
        }
        check(unsafe {
            ibv_modify_qp(qp.0 as *mut ibv_qp, &mut raw as *mut _, mask.bits() as c_int)
        })
    }

    fn query_qp_state(&self, qp: QpHandle) -> KernelResult<QpState> {
        let mut attr: ibv_qp_attr = Default::default();
        let mut init: ibv_qp_init_attr = Default::default();
        check(unsafe {
            ibv_query_qp(
                qp.0 as *mut ibv_qp,
                &mut attr as *mut _,
                ibv_qp_attr_mask::IBV_QP_STATE as c_int,
                &mut init as *mut _,
            )
        })?;
        QpState::from_raw(attr.qp_state as u32).ok_or(Error::EINVAL)
    }

    unsafe fn reg_mr(
        &self,
        pd: PdHandle,
        addr: *mut u8,
        length: usize,
        access: AccessFlags,
    ) -> KernelResult<MrInfo> {
        let mr = ibv_reg_mr(pd.0 as *mut ibv_pd, addr as *mut _, length, access.bits() as _);
        let handle = non_null(mr)?;
        Ok(MrInfo {
            handle: MrHandle(handle),
            addr: addr as u64,
            length,
            lkey: (*mr).lkey,
            rkey: (*mr).rkey,
        })
    }

    fn dereg_mr(&self, mr: MrHandle) -> KernelResult<()> {
        check(unsafe { ibv_dereg_mr(mr.0 as *mut ibv_mr) })
    }

    fn post_send(&self, qp: QpHandle, wr: &SendWr) -> KernelResult<()> {
        let qp = qp.0 as *mut ibv_qp;
        let post_send_op = unsafe { (*(*qp).context).ops.post_send }.ok_or(Error::ENOSYS)?;

        let mut sge = ibv_sge {
            addr: wr.sge.addr,
            length: wr.sge.length,
            lkey: wr.sge.lkey,
        };
        let mut raw: ibv_send_wr = Default::default();
        raw.wr_id = wr.wr_id;
        raw.sg_list = &mut sge as *mut _;
        raw.num_sge = 1;
        raw.opcode = match wr.opcode {
            WrOpcode::RdmaWrite => ibv_wr_opcode::IBV_WR_RDMA_WRITE,
            WrOpcode::RdmaRead => ibv_wr_opcode::IBV_WR_RDMA_READ,
        };
        raw.send_flags = if wr.signaled {
            ibv_send_flags::IBV_SEND_SIGNALED
        } else {
            0
        } as _;
        unsafe {
            raw.wr.rdma.as_mut().remote_addr = wr.remote_addr;
            raw.wr.rdma.as_mut().rkey = wr.rkey;
        };

        let mut bad_wr: *mut ibv_send_wr = null_mut();
        check(unsafe { post_send_op(qp, &mut raw as *mut _, &mut bad_wr as *mut _) })
    }

    fn poll_cq(&self, cq: CqHandle, completions: &mut [WorkCompletion]) -> KernelResult<usize> {
        let cq = cq.0 as *mut ibv_cq;
        let poll_op = unsafe { (*(*cq).context).ops.poll_cq }.ok_or(Error::ENOSYS)?;

        let mut raw: [ibv_wc; POLL_BATCH] = [Default::default(); POLL_BATCH];
        let want = completions.len().min(POLL_BATCH);
        let ret = unsafe { poll_op(cq, want as c_int, raw.as_mut_ptr()) };
        if ret < 0 {
            return Err(Error::from_kernel_errno(ret));
        }
        let found = ret as usize;
        for (dst, wc) in completions.iter_mut().zip(raw[..found].iter()) {
            *dst = WorkCompletion {
                wr_id: wc.wr_id,
                status: WcStatus::from_raw(wc.status as u32),
                opcode: WcOpcode::from_raw(wc.opcode as u32),
                byte_len: wc.byte_len,
                qp_num: wc.qp_num,
            };
        }
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn has_rdma() {
        let provider = IbvProvider::create().expect("device list");
        // should have devices
        assert!(!provider.device_names().expect("names").is_empty());
    }
}
