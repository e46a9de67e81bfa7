use core::ops::Range;

use rdma_shim::{log, Sge, SendWr, WorkCompletion, WrOpcode};

use crate::completion_queue::poll_one;
use crate::memory_region::MemoryRegion;
use crate::queue_pairs::QueuePair;
use crate::DatapathError;

// reliable connection post send requests
impl QueuePair {
    /// Post a one-sided RDMA read work request to the send queue.
    ///
    /// Param:
    /// - `mr`: Reference to MemoryRegion to store the data read from the remote side.
    /// - `range`: Specify which range of mr you want to store the read data.
    ///   Index the mr in byte dimension.
    /// - `signaled`: Whether signaled while post send read
    /// - `raddr`: Beginning address of remote side to read
    /// - `rkey`: Remote memory region key
    /// - `wr_id`: Carried back in the work completion
    #[inline]
    pub fn post_send_read(
        &self,
        mr: &MemoryRegion,
        range: Range<u64>,
        signaled: bool,
        raddr: u64,
        rkey: u32,
        wr_id: u64,
    ) -> Result<(), DatapathError> {
        self.post_send_inner(WrOpcode::RdmaRead, mr, range, signaled, raddr, rkey, wr_id)
    }

    /// Post a one-sided RDMA write work request to the send queue.
    ///
    /// Param:
    /// - `mr`: Reference to MemoryRegion holding the data to write.
    /// - `range`: Specify which range of mr is written to the remote side.
    /// - `signaled`: Whether signaled while post send write
    /// - `raddr`: Beginning address of remote side to write
    /// - `rkey`: Remote memory region key
    /// - `wr_id`: Carried back in the work completion
    #[inline]
    pub fn post_send_write(
        &self,
        mr: &MemoryRegion,
        range: Range<u64>,
        signaled: bool,
        raddr: u64,
        rkey: u32,
        wr_id: u64,
    ) -> Result<(), DatapathError> {
        self.post_send_inner(WrOpcode::RdmaWrite, mr, range, signaled, raddr, rkey, wr_id)
    }

    #[allow(clippy::too_many_arguments)]
    #[inline]
    fn post_send_inner(
        &self,
        opcode: WrOpcode,
        mr: &MemoryRegion,
        range: Range<u64>,
        signaled: bool,
        raddr: u64,
        rkey: u32,
        wr_id: u64,
    ) -> Result<(), DatapathError> {
        let laddr = mr.rdma_addr_of(&range)?;
        let wr = SendWr {
            wr_id,
            opcode,
            sge: Sge {
                addr: laddr,
                length: (range.end - range.start) as u32,
                lkey: mr.lkey().0,
            },
            remote_addr: raddr,
            rkey,
            signaled,
        };

        self.ctx.verbs().post_send(self.inner_qp, &wr).map_err(|e| {
            log::error!("post {:?} on qpn {} failed: {}", opcode, self.qpn, e);
            DatapathError::PostSendError(e)
        })
    }

    /// Poll the QP's CQ for one completion, at most `budget` times
    #[inline]
    pub fn poll_completion(&self, budget: usize) -> Result<WorkCompletion, DatapathError> {
        poll_one(&*self.cq, budget)
    }
}
