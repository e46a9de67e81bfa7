use alloc::string::String;
use alloc::vec::Vec;

use crate::types::*;
use crate::KernelResult;

/// The verbs surface the connection logic consumes.
///
/// Every call is fallible. Implementations are expected to mirror libibverbs:
/// a destroy call on a resource that still has dependents fails with `EBUSY`,
/// a `modify_qp` whose mask does not match the supplied attributes fails with
/// `EINVAL`.
pub trait Verbs: Send + Sync {
    /// Short name of the provider, used in logs
    fn name(&self) -> &str;

    /// Make the provider's data structures fork()-safe (`ibv_fork_init`)
    fn fork_init(&self) -> KernelResult<()>;

    /// Names of the available devices, in the order `open_device` indexes them
    fn device_names(&self) -> KernelResult<Vec<String>>;

    /// True when only QPs of this process can be reached, so a peer in
    /// another process never shows up on the fabric
    fn is_process_local(&self) -> bool {
        false
    }

    fn open_device(&self, index: usize) -> KernelResult<ContextHandle>;
    fn close_device(&self, ctx: ContextHandle) -> KernelResult<()>;

    fn query_port(&self, ctx: ContextHandle, port_num: u8) -> KernelResult<PortAttr>;

    fn alloc_pd(&self, ctx: ContextHandle) -> KernelResult<PdHandle>;
    fn dealloc_pd(&self, pd: PdHandle) -> KernelResult<()>;

    fn create_cq(&self, ctx: ContextHandle, cqe: u32) -> KernelResult<CqHandle>;
    fn destroy_cq(&self, cq: CqHandle) -> KernelResult<()>;

    /// Create an RC QP in RESET, returns the handle and the QP number
    fn create_qp(&self, pd: PdHandle, attr: &QpInitAttr) -> KernelResult<(QpHandle, u32)>;
    fn destroy_qp(&self, qp: QpHandle) -> KernelResult<()>;
    fn modify_qp(&self, qp: QpHandle, attr: &QpAttr, mask: QpAttrMask) -> KernelResult<()>;
    fn query_qp_state(&self, qp: QpHandle) -> KernelResult<QpState>;

    /// Register `[addr, addr + length)` for the given access.
    ///
    /// # Safety
    /// The range must stay valid and must not move until `dereg_mr` returns.
    unsafe fn reg_mr(
        &self,
        pd: PdHandle,
        addr: *mut u8,
        length: usize,
        access: AccessFlags,
    ) -> KernelResult<MrInfo>;
    fn dereg_mr(&self, mr: MrHandle) -> KernelResult<()>;

    /// Enqueue one work request on the send queue; never blocks
    fn post_send(&self, qp: QpHandle, wr: &SendWr) -> KernelResult<()>;

    /// Fill `completions` with at most `completions.len()` entries, returns how many
    fn poll_cq(&self, cq: CqHandle, completions: &mut [WorkCompletion]) -> KernelResult<usize>;
}
