use alloc::sync::Arc;

use rdma_shim::{log, AccessFlags, Mtu, QpCap, QpInitAttr};

use crate::completion_queue::CompletionQueue;
use crate::config::QueuePairConfig;
use crate::consts::{MAX_CQ_ENTRIES, MAX_RD_ATOMIC};
use crate::context::Context;
use crate::queue_pairs::QueuePair;
use crate::ControlpathError;

/// Builder for RC queue pairs.
/// Store the necessary configuration parameters required
///
/// Set necessary fields and build the queue pair.
pub struct QueuePairBuilder {
    pub(super) ctx: Arc<Context>,
    pub(super) max_send_wr: u32,
    pub(super) max_recv_wr: u32,
    pub(super) max_cq_entries: u32,
    pub(super) max_send_sge: u32,
    pub(super) max_recv_sge: u32,

    // carried along to the connection phase
    pub(super) access: AccessFlags,

    pub(super) path_mtu: Mtu,
    pub(super) timeout: u8,
    pub(super) retry_count: u8,
    pub(super) rnr_retry: u8,
    pub(super) min_rnr_timer: u8,
    pub(super) max_rd_atomic: u8,
    pub(super) max_dest_rd_atomic: u8,
    pub(super) pkey_index: u16,
    pub(super) port_num: u8,
    pub(super) rq_psn: u32,
    pub(super) sq_psn: u32,
}

impl QueuePairBuilder {
    /// Create a QueuePairBuilder with the given `Context` which stores the device
    /// and protection domain information.
    ///
    /// Set the builder's necessary fields and build the queue pair that's needed.
    pub fn new(ctx: &Arc<Context>) -> Self {
        Self {
            ctx: ctx.clone(),
            max_send_wr: 2,
            max_recv_wr: 2,
            max_cq_entries: MAX_CQ_ENTRIES,
            max_send_sge: 1,
            max_recv_sge: 1,
            access: AccessFlags::all_remote(),
            path_mtu: Mtu::Mtu4096,
            timeout: 14,
            retry_count: 7,
            rnr_retry: 7,
            min_rnr_timer: 12,
            max_rd_atomic: MAX_RD_ATOMIC,
            max_dest_rd_atomic: MAX_RD_ATOMIC,
            pkey_index: 0,
            port_num: 1,
            rq_psn: 0,
            sq_psn: 0,
        }
    }

    /// A builder whose tunables come from `cfg`
    pub fn from_config(
        ctx: &Arc<Context>,
        cfg: &QueuePairConfig,
    ) -> Result<Self, ControlpathError> {
        let path_mtu =
            Mtu::from_bytes(cfg.path_mtu).ok_or(ControlpathError::InvalidArg("path MTU"))?;
        let mut builder = Self::new(ctx);
        builder
            .set_max_send_wr(cfg.max_send_wr)
            .set_max_recv_wr(cfg.max_recv_wr)
            .set_max_cq_entries(cfg.max_cq_entries)
            .set_path_mtu(path_mtu)
            .set_timeout(cfg.timeout)
            .set_retry_count(cfg.retry_count)
            .set_rnr_retry(cfg.rnr_retry)
            .set_min_rnr_timer(cfg.min_rnr_timer)
            .set_max_rd_atomic(cfg.max_rd_atomic)
            .set_port_num(cfg.port_num);
        Ok(builder)
    }

    /// Set `max_send_wr` for the new `QueuePair`
    ///
    /// Default value is 2
    pub fn set_max_send_wr(&mut self, max_wr: u32) -> &mut Self {
        self.max_send_wr = max_wr;
        self
    }

    /// Default value is 2
    pub fn set_max_recv_wr(&mut self, max_wr: u32) -> &mut Self {
        self.max_recv_wr = max_wr;
        self
    }

    /// Set the maximum number of completion queue entries for
    /// the new `QueuePair`'s completion queue
    ///
    /// Default value is 100
    pub fn set_max_cq_entries(&mut self, max_cq_entries: u32) -> &mut Self {
        self.max_cq_entries = max_cq_entries;
        self
    }

    pub fn set_max_send_sge(&mut self, max_send_sge: u32) -> &mut Self {
        self.max_send_sge = max_send_sge;
        self
    }

    pub fn set_max_recv_sge(&mut self, max_recv_sge: u32) -> &mut Self {
        self.max_recv_sge = max_recv_sge;
        self
    }

    /// Set the remote access granted at INIT.
    ///
    /// Default value is local write plus every remote permission.
    pub fn set_access(&mut self, access: AccessFlags) -> &mut Self {
        self.access = access;
        self
    }

    /// Set the minimum timeout that the new `QueuePair` waits for ACK/NACK from remote QP before
    /// retransmitting the packet, as `4.096 usec * 2 ^ timeout`.
    ///
    /// Default value is 14 (about 67 msec).
    pub fn set_timeout(&mut self, timeout: u8) -> &mut Self {
        self.timeout = timeout;
        self
    }

    /// Set the number of times that the new `QueuePair` tries to resend the packets
    /// before reporting an error.
    ///
    /// Default value is 7
    pub fn set_retry_count(&mut self, retry_count: u8) -> &mut Self {
        self.retry_count = retry_count;
        self
    }

    /// Set the number of times that the new `QueuePair` tries to resend the packets when
    /// an RNR NACK was sent by the remote QP before reporting an error.
    ///
    /// Default value is 7, which means retry forever
    pub fn set_rnr_retry(&mut self, rnr_retry: u8) -> &mut Self {
        self.rnr_retry = rnr_retry;
        self
    }

    /// Set the maximum payload size of a packet that can be transferred in the path.
    ///
    /// Default value is 4096 bytes
    pub fn set_path_mtu(&mut self, path_mtu: Mtu) -> &mut Self {
        self.path_mtu = path_mtu;
        self
    }

    /// Set the minimum RNR NAK Timer Field Value for the new `QueuePair`.
    ///
    /// Default value is 12 (0.64 milliseconds delay)
    pub fn set_min_rnr_timer(&mut self, min_rnr_timer: u8) -> &mut Self {
        self.min_rnr_timer = min_rnr_timer;
        self
    }

    pub fn set_pkey_index(&mut self, pkey_index: u16) -> &mut Self {
        self.pkey_index = pkey_index;
        self
    }

    /// Set the primary physical port number associated with this QP
    ///
    /// Default value is 1
    pub fn set_port_num(&mut self, port_num: u8) -> &mut Self {
        self.port_num = port_num;
        self
    }

    /// Set the number of RDMA read & atomic operations outstanding at any time,
    /// both as the initiator and as the target.
    ///
    /// Default value is 1
    pub fn set_max_rd_atomic(&mut self, max_rd_atomic: u8) -> &mut Self {
        self.max_rd_atomic = max_rd_atomic;
        self.max_dest_rd_atomic = max_rd_atomic;
        self
    }

    pub fn set_psn(&mut self, rq_psn: u32, sq_psn: u32) -> &mut Self {
        self.rq_psn = rq_psn;
        self.sq_psn = sq_psn;
        self
    }

    /// Build a reliable connection queue pair with the set parameters.
    ///
    /// One CQ serves both the send and the receive side. The QP is returned
    /// in RESET and needs to be brought up to be used.
    ///
    /// # Errors:
    /// - `CreationError` : error creating the completion queue or the queue pair
    ///
    pub fn build_rc(&self) -> Result<QueuePair, ControlpathError> {
        let cq = Arc::new(CompletionQueue::create(&self.ctx, self.max_cq_entries)?);

        let init_attr = QpInitAttr {
            cq: cq.raw_handle(),
            cap: QpCap {
                max_send_wr: self.max_send_wr,
                max_recv_wr: self.max_recv_wr,
                max_send_sge: self.max_send_sge,
                max_recv_sge: self.max_recv_sge,
            },
        };

        // on failure the CQ is released by its drop
        let (inner_qp, qpn) = self
            .ctx
            .verbs()
            .create_qp(self.ctx.get_pd(), &init_attr)
            .map_err(|e| {
                log::error!("failed to create the queue pair: {}", e);
                ControlpathError::CreationError("QP", e)
            })?;
        log::info!("Creating a queue pair, qpn {}", qpn);

        Ok(QueuePair {
            ctx: self.ctx.clone(),
            inner_qp,
            qpn,
            alive: true,
            cq,

            port_num: self.port_num,
            pkey_index: self.pkey_index,
            access: self.access,
            path_mtu: self.path_mtu,
            rq_psn: self.rq_psn,
            sq_psn: self.sq_psn,
            max_dest_rd_atomic: self.max_dest_rd_atomic,
            min_rnr_timer: self.min_rnr_timer,
            timeout: self.timeout,
            retry_count: self.retry_count,
            rnr_retry: self.rnr_retry,
            max_rd_atomic: self.max_rd_atomic,
        })
    }
}

#[cfg(test)]
mod tests {
    use alloc::sync::Arc;

    use rdma_shim::soft::SoftFabric;
    use rdma_shim::Mtu;

    use super::QueuePairBuilder;
    use crate::config::QueuePairConfig;
    use crate::{ControlpathError, QueuePairStatus, UDriver};

    #[test]
    fn from_config_applies_tunables() {
        let ctx = UDriver::with_provider(Arc::new(SoftFabric::new()))
            .expect("driver")
            .get_dev(0)
            .expect("dev")
            .open_context()
            .expect("ctx");
        let cfg = QueuePairConfig {
            path_mtu: 1024,
            timeout: 10,
            ..Default::default()
        };
        let qp = QueuePairBuilder::from_config(&ctx, &cfg)
            .expect("builder")
            .build_rc()
            .expect("qp");
        assert_eq!(qp.path_mtu(), Mtu::Mtu1024);
        assert_eq!(qp.timeout(), 10);
        assert_eq!(qp.status().expect("status"), QueuePairStatus::Reset);
        assert_eq!(qp.cq().capacity(), cfg.max_cq_entries);

        let bad = QueuePairConfig {
            path_mtu: 1000,
            ..Default::default()
        };
        assert!(matches!(
            QueuePairBuilder::from_config(&ctx, &bad),
            Err(ControlpathError::InvalidArg("path MTU"))
        ));
    }

    #[test]
    fn zero_sized_cq_fails_creation() {
        let fabric = Arc::new(SoftFabric::new());
        let ctx = UDriver::with_provider(fabric.clone())
            .expect("driver")
            .get_dev(0)
            .expect("dev")
            .open_context()
            .expect("ctx");
        let res = QueuePairBuilder::new(&ctx).set_max_cq_entries(0).build_rc();
        assert!(matches!(res, Err(ControlpathError::CreationError("CQ", _))));
        drop(ctx);
        assert_eq!(fabric.live_resources(), 0);
    }
}
