use alloc::sync::Arc;

use rdma_shim::{log, AccessFlags, AhAttr, Mtu, QpAttr, QpHandle, QpState};

use crate::completion_queue::CompletionQueue;
use crate::context::Context;
use crate::ControlpathError;

/// Queue pair builders
pub mod builder;
pub use builder::QueuePairBuilder;

/// Posting the one-sided operations
pub mod operations;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueuePairStatus {
    Reset,
    Init,
    ReadyToRecv,
    ReadyToSend,
    // There is some other states, but seems not necessary
    Error,
}

impl From<QpState> for QueuePairStatus {
    fn from(state: QpState) -> Self {
        match state {
            QpState::Reset => Self::Reset,
            QpState::Init => Self::Init,
            QpState::ReadyToRecv => Self::ReadyToRecv,
            QpState::ReadyToSend => Self::ReadyToSend,
            _ => Self::Error,
        }
    }
}

impl From<QueuePairStatus> for QpState {
    fn from(status: QueuePairStatus) -> Self {
        match status {
            QueuePairStatus::Reset => QpState::Reset,
            QueuePairStatus::Init => QpState::Init,
            QueuePairStatus::ReadyToRecv => QpState::ReadyToRecv,
            QueuePairStatus::ReadyToSend => QpState::ReadyToSend,
            QueuePairStatus::Error => QpState::Error,
        }
    }
}

/// An RC queue pair whose send and receive side share one CQ.
///
/// The QP owns the last reference to that CQ, so [`QueuePair::destroy`]
/// removes both in the required order: QP first, then CQ.
pub struct QueuePair {
    ctx: Arc<Context>,
    inner_qp: QpHandle,
    qpn: u32,
    alive: bool,

    cq: Arc<CompletionQueue>,

    // the following is just borrowed from the builder
    // as the QP requires them during connections
    port_num: u8,
    pkey_index: u16,
    access: AccessFlags,
    path_mtu: Mtu,
    rq_psn: u32,
    sq_psn: u32,
    max_dest_rd_atomic: u8,
    min_rnr_timer: u8,
    timeout: u8,
    retry_count: u8,
    rnr_retry: u8,
    max_rd_atomic: u8,
}

impl QueuePair {
    /// query the current status of the QP
    pub fn status(&self) -> Result<QueuePairStatus, ControlpathError> {
        self.ctx
            .verbs()
            .query_qp_state(self.inner_qp)
            .map(QueuePairStatus::from)
            .map_err(|e| ControlpathError::QueryError("QP status", e))
    }

    #[inline]
    pub fn qp_num(&self) -> u32 {
        self.qpn
    }

    #[inline]
    pub fn port_num(&self) -> u8 {
        self.port_num
    }

    #[inline]
    pub fn path_mtu(&self) -> Mtu {
        self.path_mtu
    }

    #[inline]
    pub fn timeout(&self) -> u8 {
        self.timeout
    }

    #[inline]
    pub fn max_rd_atomic(&self) -> u8 {
        self.max_rd_atomic
    }

    #[inline]
    pub fn ctx(&self) -> &Arc<Context> {
        &self.ctx
    }

    #[inline]
    pub fn cq(&self) -> &Arc<CompletionQueue> {
        &self.cq
    }

    /// The lid of the port this QP is bound to
    pub fn lid(&self) -> Result<u16, ControlpathError> {
        self.ctx
            .get_port_attr(self.port_num)
            .map(|attr| attr.lid)
            .map_err(|e| ControlpathError::QueryError("port lid", e))
    }

    /// RESET => INIT, granting the configured remote access
    pub fn modify_to_init(&self) -> Result<(), ControlpathError> {
        let attr = QpAttr {
            qp_state: Some(QpState::Init),
            pkey_index: Some(self.pkey_index),
            port_num: Some(self.port_num),
            access_flags: Some(self.access),
            ..Default::default()
        };
        self.transition(QueuePairStatus::Init, &attr)
    }

    /// INIT => RTR, pointing the QP at the peer `(remote_lid, remote_qpn)`.
    ///
    /// An unreachable peer address fails here.
    pub fn modify_to_rtr(&self, remote_lid: u16, remote_qpn: u32) -> Result<(), ControlpathError> {
        let attr = QpAttr {
            qp_state: Some(QpState::ReadyToRecv),
            ah_attr: Some(AhAttr {
                dlid: remote_lid,
                sl: 0,
                src_path_bits: 0,
                port_num: self.port_num,
            }),
            path_mtu: Some(self.path_mtu),
            dest_qp_num: Some(remote_qpn),
            rq_psn: Some(self.rq_psn),
            max_dest_rd_atomic: Some(self.max_dest_rd_atomic),
            min_rnr_timer: Some(self.min_rnr_timer),
            ..Default::default()
        };
        self.transition(QueuePairStatus::ReadyToRecv, &attr)
    }

    /// RTR => RTS
    pub fn modify_to_rts(&self) -> Result<(), ControlpathError> {
        let attr = QpAttr {
            qp_state: Some(QpState::ReadyToSend),
            sq_psn: Some(self.sq_psn),
            timeout: Some(self.timeout),
            retry_cnt: Some(self.retry_count),
            rnr_retry: Some(self.rnr_retry),
            max_rd_atomic: Some(self.max_rd_atomic),
            ..Default::default()
        };
        self.transition(QueuePairStatus::ReadyToSend, &attr)
    }

    /// Drive a RESET QP through INIT and RTR to RTS, connected to the peer.
    ///
    /// On failure the QP is left in ERROR.
    pub fn bring_up_rc(&self, remote_lid: u16, remote_qpn: u32) -> Result<(), ControlpathError> {
        let status = self.status()?;
        if status != QueuePairStatus::Reset {
            log::error!("Bring up rc, the QP is in {:?} rather than Reset", status);
            return Err(ControlpathError::InvalidArg("QP state for bring up"));
        }
        self.modify_to_init()?;
        self.modify_to_rtr(remote_lid, remote_qpn)?;
        self.modify_to_rts()?;
        log::info!("Modified the queue pair");
        Ok(())
    }

    /// One `modify_qp` whose mask names exactly the fields `attr` carries
    fn transition(&self, to: QueuePairStatus, attr: &QpAttr) -> Result<(), ControlpathError> {
        let from = self.status()?;
        let ret = self
            .ctx
            .verbs()
            .modify_qp(self.inner_qp, attr, attr.implied_mask());
        if let Err(errno) = ret {
            log::error!("Bring up rc inner, {:?} => {:?} error: {}", from, to, errno);
            self.force_error();
            return Err(ControlpathError::TransitionError { from, to, errno });
        }
        log::debug!("qpn {}: {:?} => {:?}", self.qpn, from, to);
        Ok(())
    }

    /// Best effort, the QP is unusable either way
    fn force_error(&self) {
        let attr = QpAttr {
            qp_state: Some(QpState::Error),
            ..Default::default()
        };
        if let Err(e) = self
            .ctx
            .verbs()
            .modify_qp(self.inner_qp, &attr, attr.implied_mask())
        {
            log::warn!("failed to move qpn {} to ERROR: {}", self.qpn, e);
        }
    }

    /// Destroy the QP, then the CQ it used
    pub fn destroy(mut self) -> Result<(), ControlpathError> {
        self.release_qp()?;
        let cq = self.cq.clone();
        // drops our own reference to the CQ
        drop(self);
        cq.destroy()
    }

    fn release_qp(&mut self) -> Result<(), ControlpathError> {
        if self.alive {
            self.ctx.verbs().destroy_qp(self.inner_qp).map_err(|e| {
                log::error!("failed to destroy qpn {}: {}", self.qpn, e);
                ControlpathError::DestroyError("QP", e)
            })?;
            self.alive = false;
        }
        Ok(())
    }
}

impl Drop for QueuePair {
    fn drop(&mut self) {
        if let Err(e) = self.release_qp() {
            log::warn!("QP leaked on drop: {}", e);
        }
    }
}

impl core::fmt::Debug for QueuePair {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("QueuePair")
            .field("qpn", &self.qpn)
            .field("port_num", &self.port_num)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use alloc::sync::Arc;

    use rdma_shim::audit::{AuditedVerbs, Call, Resource};
    use rdma_shim::soft::SoftFabric;
    use rdma_shim::QpAttrMask;

    use super::*;
    use crate::UDriver;

    fn rc_qp(driver: &Arc<UDriver>) -> QueuePair {
        let ctx = driver
            .get_dev(0)
            .expect("no rdma device available")
            .open_context()
            .expect("failed to create RDMA context");
        QueuePairBuilder::new(&ctx)
            .build_rc()
            .expect("failed to build RC QP")
    }

    #[test]
    fn queried_state_follows_each_transition() {
        let driver = UDriver::with_provider(Arc::new(SoftFabric::new())).expect("driver");
        let (a, b) = (rc_qp(&driver), rc_qp(&driver));
        assert_eq!(a.status().expect("status"), QueuePairStatus::Reset);

        a.modify_to_init().expect("init");
        assert_eq!(a.status().expect("status"), QueuePairStatus::Init);
        a.modify_to_rtr(b.lid().expect("lid"), b.qp_num()).expect("rtr");
        assert_eq!(a.status().expect("status"), QueuePairStatus::ReadyToRecv);
        a.modify_to_rts().expect("rts");
        assert_eq!(a.status().expect("status"), QueuePairStatus::ReadyToSend);
    }

    #[test]
    fn each_transition_sends_its_canonical_mask() {
        let audit = Arc::new(AuditedVerbs::new(SoftFabric::new()));
        let driver = UDriver::with_provider(audit.clone()).expect("driver");
        let (a, b) = (rc_qp(&driver), rc_qp(&driver));
        a.bring_up_rc(b.lid().expect("lid"), b.qp_num()).expect("bring up");

        let masks: alloc::vec::Vec<_> = audit
            .calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::ModifyQp { to, mask, .. } => Some((to, mask)),
                _ => None,
            })
            .collect();
        assert_eq!(
            masks,
            [
                (
                    Some(QpState::Init),
                    QpAttrMask::STATE
                        | QpAttrMask::PKEY_INDEX
                        | QpAttrMask::PORT
                        | QpAttrMask::ACCESS_FLAGS
                ),
                (
                    Some(QpState::ReadyToRecv),
                    QpAttrMask::STATE
                        | QpAttrMask::AV
                        | QpAttrMask::PATH_MTU
                        | QpAttrMask::DEST_QPN
                        | QpAttrMask::RQ_PSN
                        | QpAttrMask::MAX_DEST_RD_ATOMIC
                        | QpAttrMask::MIN_RNR_TIMER
                ),
                (
                    Some(QpState::ReadyToSend),
                    QpAttrMask::STATE
                        | QpAttrMask::SQ_PSN
                        | QpAttrMask::TIMEOUT
                        | QpAttrMask::RETRY_CNT
                        | QpAttrMask::RNR_RETRY
                        | QpAttrMask::MAX_QP_RD_ATOMIC
                ),
            ]
        );
    }

    #[test]
    fn unreachable_peer_fails_at_rtr_and_leaves_error() {
        let driver = UDriver::with_provider(Arc::new(SoftFabric::new())).expect("driver");
        let a = rc_qp(&driver);
        match a.bring_up_rc(0x7777, 1) {
            Err(ControlpathError::TransitionError { from, to, .. }) => {
                assert_eq!(from, QueuePairStatus::Init);
                assert_eq!(to, QueuePairStatus::ReadyToRecv);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(a.status().expect("status"), QueuePairStatus::Error);
    }

    #[test]
    fn bring_up_twice_is_rejected() {
        let driver = UDriver::with_provider(Arc::new(SoftFabric::new())).expect("driver");
        let (a, b) = (rc_qp(&driver), rc_qp(&driver));
        a.bring_up_rc(b.lid().expect("lid"), b.qp_num()).expect("bring up");
        assert!(matches!(
            a.bring_up_rc(b.lid().expect("lid"), b.qp_num()),
            Err(ControlpathError::InvalidArg(_))
        ));
    }

    #[test]
    fn destroy_takes_qp_then_cq() {
        let audit = Arc::new(AuditedVerbs::new(SoftFabric::new()));
        let driver = UDriver::with_provider(audit.clone()).expect("driver");
        let qp = rc_qp(&driver);
        let ctx = qp.ctx().clone();
        let cq = qp.cq().raw_handle();
        let handle = qp.inner_qp;

        qp.destroy().expect("destroy");
        ctx.destroy().expect("ctx");
        let destroyed = audit.destroyed();
        assert_eq!(destroyed[0], Resource::Qp(handle));
        assert_eq!(destroyed[1], Resource::Cq(cq));
        assert_eq!(audit.live_count(), 0);
    }
}
