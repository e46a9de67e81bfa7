//! Provider-neutral verbs types.
//!
//! The numeric values follow `<infiniband/verbs.h>`, so the libibverbs provider
//! can pass them through unchanged.

use bitflags::bitflags;

macro_rules! handle {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub u64);

        impl core::fmt::Display for $name {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                write!(f, "{}#{:x}", stringify!($name), self.0)
            }
        }
    };
}

handle!(
    /// An opened device context (`ibv_context`)
    ContextHandle
);
handle!(
    /// A protection domain (`ibv_pd`)
    PdHandle
);
handle!(
    /// A completion queue (`ibv_cq`)
    CqHandle
);
handle!(
    /// A queue pair (`ibv_qp`)
    QpHandle
);
handle!(
    /// A registered memory region (`ibv_mr`)
    MrHandle
);

bitflags! {
    /// Memory and QP access permissions (`ibv_access_flags`)
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct AccessFlags: u32 {
        const LOCAL_WRITE = 1 << 0;
        const REMOTE_WRITE = 1 << 1;
        const REMOTE_READ = 1 << 2;
        const REMOTE_ATOMIC = 1 << 3;
    }
}

impl AccessFlags {
    /// Local write plus every remote permission.
    pub const fn all_remote() -> Self {
        Self::LOCAL_WRITE
            .union(Self::REMOTE_WRITE)
            .union(Self::REMOTE_READ)
            .union(Self::REMOTE_ATOMIC)
    }
}

bitflags! {
    /// Which fields of a `QpAttr` a `modify_qp` call carries (`ibv_qp_attr_mask`)
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct QpAttrMask: u32 {
        const STATE = 1 << 0;
        const CUR_STATE = 1 << 1;
        const EN_SQD_ASYNC_NOTIFY = 1 << 2;
        const ACCESS_FLAGS = 1 << 3;
        const PKEY_INDEX = 1 << 4;
        const PORT = 1 << 5;
        const QKEY = 1 << 6;
        const AV = 1 << 7;
        const PATH_MTU = 1 << 8;
        const TIMEOUT = 1 << 9;
        const RETRY_CNT = 1 << 10;
        const RNR_RETRY = 1 << 11;
        const RQ_PSN = 1 << 12;
        const MAX_QP_RD_ATOMIC = 1 << 13;
        const ALT_PATH = 1 << 14;
        const MIN_RNR_TIMER = 1 << 15;
        const SQ_PSN = 1 << 16;
        const MAX_DEST_RD_ATOMIC = 1 << 17;
        const PATH_MIG_STATE = 1 << 18;
        const CAP = 1 << 19;
        const DEST_QPN = 1 << 20;
    }
}

/// QP states (`ibv_qp_state`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum QpState {
    Reset = 0,
    Init = 1,
    ReadyToRecv = 2,
    ReadyToSend = 3,
    SendQueueDrained = 4,
    SendQueueError = 5,
    Error = 6,
}

impl QpState {
    pub fn from_raw(raw: u32) -> Option<Self> {
        Some(match raw {
            0 => Self::Reset,
            1 => Self::Init,
            2 => Self::ReadyToRecv,
            3 => Self::ReadyToSend,
            4 => Self::SendQueueDrained,
            5 => Self::SendQueueError,
            6 => Self::Error,
            _ => return None,
        })
    }
}

/// Path MTU (`ibv_mtu`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Mtu {
    Mtu256 = 1,
    Mtu512 = 2,
    Mtu1024 = 3,
    Mtu2048 = 4,
    Mtu4096 = 5,
}

impl Mtu {
    pub fn bytes(&self) -> usize {
        128 << (*self as u32)
    }

    pub fn from_bytes(bytes: usize) -> Option<Self> {
        Some(match bytes {
            256 => Self::Mtu256,
            512 => Self::Mtu512,
            1024 => Self::Mtu1024,
            2048 => Self::Mtu2048,
            4096 => Self::Mtu4096,
            _ => return None,
        })
    }
}

/// Port attributes that the connection logic consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortAttr {
    pub lid: u16,
    pub active_mtu: Mtu,
    /// `ibv_port_state`, 4 means ACTIVE
    pub state: u32,
}

/// Capacity limits of a QP, fixed at creation (`ibv_qp_cap`)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QpCap {
    pub max_send_wr: u32,
    pub max_recv_wr: u32,
    pub max_send_sge: u32,
    pub max_recv_sge: u32,
}

/// Creation attributes of an RC QP whose send and receive side share one CQ.
#[derive(Debug, Clone, Copy)]
pub struct QpInitAttr {
    pub cq: CqHandle,
    pub cap: QpCap,
}

/// Address vector of the peer (`ibv_ah_attr`), local-subnet only.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AhAttr {
    pub dlid: u16,
    pub sl: u8,
    pub src_path_bits: u8,
    pub port_num: u8,
}

/// Attributes of one `modify_qp` call.
///
/// A field is "supplied" when it is `Some`. The mask handed to `modify_qp`
/// must name exactly the supplied fields, see [`QpAttr::implied_mask`].
#[derive(Debug, Clone, Default)]
pub struct QpAttr {
    pub qp_state: Option<QpState>,
    pub pkey_index: Option<u16>,
    pub port_num: Option<u8>,
    pub access_flags: Option<AccessFlags>,
    pub ah_attr: Option<AhAttr>,
    pub path_mtu: Option<Mtu>,
    pub dest_qp_num: Option<u32>,
    pub rq_psn: Option<u32>,
    pub max_dest_rd_atomic: Option<u8>,
    pub min_rnr_timer: Option<u8>,
    pub sq_psn: Option<u32>,
    pub timeout: Option<u8>,
    pub retry_cnt: Option<u8>,
    pub rnr_retry: Option<u8>,
    pub max_rd_atomic: Option<u8>,
}

impl QpAttr {
    /// The mask that names exactly the supplied fields.
    pub fn implied_mask(&self) -> QpAttrMask {
        let mut mask = QpAttrMask::empty();
        let mut name = |present: bool, bit: QpAttrMask| {
            if present {
                mask |= bit;
            }
        };
        name(self.qp_state.is_some(), QpAttrMask::STATE);
        name(self.pkey_index.is_some(), QpAttrMask::PKEY_INDEX);
        name(self.port_num.is_some(), QpAttrMask::PORT);
        name(self.access_flags.is_some(), QpAttrMask::ACCESS_FLAGS);
        name(self.ah_attr.is_some(), QpAttrMask::AV);
        name(self.path_mtu.is_some(), QpAttrMask::PATH_MTU);
        name(self.dest_qp_num.is_some(), QpAttrMask::DEST_QPN);
        name(self.rq_psn.is_some(), QpAttrMask::RQ_PSN);
        name(self.max_dest_rd_atomic.is_some(), QpAttrMask::MAX_DEST_RD_ATOMIC);
        name(self.min_rnr_timer.is_some(), QpAttrMask::MIN_RNR_TIMER);
        name(self.sq_psn.is_some(), QpAttrMask::SQ_PSN);
        name(self.timeout.is_some(), QpAttrMask::TIMEOUT);
        name(self.retry_cnt.is_some(), QpAttrMask::RETRY_CNT);
        name(self.rnr_retry.is_some(), QpAttrMask::RNR_RETRY);
        name(self.max_rd_atomic.is_some(), QpAttrMask::MAX_QP_RD_ATOMIC);
        mask
    }
}

/// Masks an RC QP transition must carry (`required`) and may carry (`optional`).
///
/// Returns `None` for transitions the RC state diagram does not allow.
pub fn rc_transition_masks(from: QpState, to: QpState) -> Option<(QpAttrMask, QpAttrMask)> {
    use QpState::*;
    match (from, to) {
        (_, Reset) | (_, Error) => Some((QpAttrMask::STATE, QpAttrMask::empty())),
        (Reset, Init) => Some((
            QpAttrMask::STATE
                | QpAttrMask::PKEY_INDEX
                | QpAttrMask::PORT
                | QpAttrMask::ACCESS_FLAGS,
            QpAttrMask::empty(),
        )),
        (Init, Init) => Some((
            QpAttrMask::STATE,
            QpAttrMask::PKEY_INDEX | QpAttrMask::PORT | QpAttrMask::ACCESS_FLAGS,
        )),
        (Init, ReadyToRecv) => Some((
            QpAttrMask::STATE
                | QpAttrMask::AV
                | QpAttrMask::PATH_MTU
                | QpAttrMask::DEST_QPN
                | QpAttrMask::RQ_PSN
                | QpAttrMask::MAX_DEST_RD_ATOMIC
                | QpAttrMask::MIN_RNR_TIMER,
            QpAttrMask::ALT_PATH | QpAttrMask::ACCESS_FLAGS | QpAttrMask::PKEY_INDEX,
        )),
        (ReadyToRecv, ReadyToSend) => Some((
            QpAttrMask::STATE
                | QpAttrMask::SQ_PSN
                | QpAttrMask::TIMEOUT
                | QpAttrMask::RETRY_CNT
                | QpAttrMask::RNR_RETRY
                | QpAttrMask::MAX_QP_RD_ATOMIC,
            QpAttrMask::CUR_STATE
                | QpAttrMask::ALT_PATH
                | QpAttrMask::ACCESS_FLAGS
                | QpAttrMask::MIN_RNR_TIMER
                | QpAttrMask::PATH_MIG_STATE,
        )),
        (ReadyToSend, ReadyToSend) => Some((
            QpAttrMask::STATE,
            QpAttrMask::CUR_STATE
                | QpAttrMask::ACCESS_FLAGS
                | QpAttrMask::ALT_PATH
                | QpAttrMask::MIN_RNR_TIMER
                | QpAttrMask::PATH_MIG_STATE,
        )),
        _ => None,
    }
}

/// One local scatter/gather entry (`ibv_sge`)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sge {
    pub addr: u64,
    pub length: u32,
    pub lkey: u32,
}

/// Send-side opcodes used by this crate (`ibv_wr_opcode`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum WrOpcode {
    RdmaWrite = 0,
    RdmaRead = 4,
}

/// A one-sided work request with a single SGE (`ibv_send_wr`)
#[derive(Debug, Clone, Copy)]
pub struct SendWr {
    pub wr_id: u64,
    pub opcode: WrOpcode,
    pub sge: Sge,
    pub remote_addr: u64,
    pub rkey: u32,
    pub signaled: bool,
}

/// Completion status (`ibv_wc_status`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WcStatus {
    Success,
    LocLenErr,
    LocQpOpErr,
    LocProtErr,
    WrFlushErr,
    BadRespErr,
    LocAccessErr,
    RemInvReqErr,
    RemAccessErr,
    RemOpErr,
    RetryExcErr,
    RnrRetryExcErr,
    GeneralErr,
    Other(u32),
}

impl WcStatus {
    pub fn from_raw(raw: u32) -> Self {
        match raw {
            0 => Self::Success,
            1 => Self::LocLenErr,
            2 => Self::LocQpOpErr,
            4 => Self::LocProtErr,
            5 => Self::WrFlushErr,
            7 => Self::BadRespErr,
            8 => Self::LocAccessErr,
            9 => Self::RemInvReqErr,
            10 => Self::RemAccessErr,
            11 => Self::RemOpErr,
            12 => Self::RetryExcErr,
            13 => Self::RnrRetryExcErr,
            21 => Self::GeneralErr,
            other => Self::Other(other),
        }
    }

    pub fn to_raw(&self) -> u32 {
        match self {
            Self::Success => 0,
            Self::LocLenErr => 1,
            Self::LocQpOpErr => 2,
            Self::LocProtErr => 4,
            Self::WrFlushErr => 5,
            Self::BadRespErr => 7,
            Self::LocAccessErr => 8,
            Self::RemInvReqErr => 9,
            Self::RemAccessErr => 10,
            Self::RemOpErr => 11,
            Self::RetryExcErr => 12,
            Self::RnrRetryExcErr => 13,
            Self::GeneralErr => 21,
            Self::Other(raw) => *raw,
        }
    }

    #[inline]
    pub fn is_success(&self) -> bool {
        *self == Self::Success
    }
}

impl core::fmt::Display for WcStatus {
    /// Same wording as `ibv_wc_status_str`
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let s = match self {
            Self::Success => "success",
            Self::LocLenErr => "local length error",
            Self::LocQpOpErr => "local QP operation error",
            Self::LocProtErr => "local protection error",
            Self::WrFlushErr => "Work Request Flushed Error",
            Self::BadRespErr => "bad response error",
            Self::LocAccessErr => "local access error",
            Self::RemInvReqErr => "remote invalid request error",
            Self::RemAccessErr => "remote access error",
            Self::RemOpErr => "remote operation error",
            Self::RetryExcErr => "transport retry counter exceeded",
            Self::RnrRetryExcErr => "RNR retry counter exceeded",
            Self::GeneralErr => "general error",
            Self::Other(raw) => return write!(f, "unknown status {}", raw),
        };
        f.write_str(s)
    }
}

/// Completion-side opcodes (`ibv_wc_opcode`)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WcOpcode {
    Send,
    RdmaWrite,
    RdmaRead,
    Other(u32),
}

impl WcOpcode {
    pub fn from_raw(raw: u32) -> Self {
        match raw {
            0 => Self::Send,
            1 => Self::RdmaWrite,
            2 => Self::RdmaRead,
            other => Self::Other(other),
        }
    }
}

impl From<WrOpcode> for WcOpcode {
    fn from(op: WrOpcode) -> Self {
        match op {
            WrOpcode::RdmaWrite => Self::RdmaWrite,
            WrOpcode::RdmaRead => Self::RdmaRead,
        }
    }
}

/// A work completion (`ibv_wc`), only the fields this crate consults
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkCompletion {
    pub wr_id: u64,
    pub status: WcStatus,
    pub opcode: WcOpcode,
    pub byte_len: u32,
    pub qp_num: u32,
}

impl Default for WorkCompletion {
    fn default() -> Self {
        Self {
            wr_id: 0,
            status: WcStatus::GeneralErr,
            opcode: WcOpcode::Other(u32::MAX),
            byte_len: 0,
            qp_num: 0,
        }
    }
}

/// Keys and placement of a freshly registered memory region
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MrInfo {
    pub handle: MrHandle,
    pub addr: u64,
    pub length: usize,
    pub lkey: u32,
    pub rkey: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::string::ToString;

    #[test]
    fn implied_mask_names_only_supplied_fields() {
        let attr = QpAttr {
            qp_state: Some(QpState::Init),
            pkey_index: Some(0),
            port_num: Some(1),
            access_flags: Some(AccessFlags::all_remote()),
            ..Default::default()
        };
        assert_eq!(
            attr.implied_mask(),
            QpAttrMask::STATE
                | QpAttrMask::PKEY_INDEX
                | QpAttrMask::PORT
                | QpAttrMask::ACCESS_FLAGS
        );
        assert_eq!(QpAttr::default().implied_mask(), QpAttrMask::empty());
    }

    #[test]
    fn rc_diagram_rejects_skipping_states() {
        assert!(rc_transition_masks(QpState::Reset, QpState::ReadyToRecv).is_none());
        assert!(rc_transition_masks(QpState::Init, QpState::ReadyToSend).is_none());
        assert!(rc_transition_masks(QpState::ReadyToSend, QpState::Init).is_none());
        assert!(rc_transition_masks(QpState::ReadyToSend, QpState::Error).is_some());
    }

    #[test]
    fn wc_status_raw_values_follow_verbs() {
        assert_eq!(WcStatus::from_raw(10), WcStatus::RemAccessErr);
        assert_eq!(WcStatus::RetryExcErr.to_raw(), 12);
        assert_eq!(WcStatus::from_raw(99), WcStatus::Other(99));
        assert_eq!(WcStatus::RemAccessErr.to_string(), "remote access error");
    }

    #[test]
    fn mtu_bytes() {
        assert_eq!(Mtu::Mtu4096.bytes(), 4096);
        assert_eq!(Mtu::Mtu256.bytes(), 256);
        assert_eq!(Mtu::from_bytes(1024), Some(Mtu::Mtu1024));
        assert_eq!(Mtu::from_bytes(1000), None);
    }
}
