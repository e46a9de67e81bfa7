//! The messages swapped during the rendezvous.
//!
//! Every message travels in the same 25-byte frame:
//!
//! ``` text
//!  0        8        16   17              25
//!  | a: u64 | b: u64 | kind | zero padding |
//! ```
//!
//! Both fields are big-endian. A frame with non-zero padding or an unknown
//! kind is rejected rather than guessed at.

use bytes::{Buf, BufMut};
use rdma_shim::{QpState, WcStatus};

use crate::consts::FRAME_SIZE;
use crate::CMError;

pub type Frame = [u8; FRAME_SIZE];

const KIND_AT: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageKind {
    ConnectionIdentifiers = 1,
    RegionIdentifiers = 2,
    ReadyAck = 3,
    OperationReport = 4,
}

impl MessageKind {
    pub fn from_raw(raw: u8) -> Option<Self> {
        Some(match raw {
            1 => Self::ConnectionIdentifiers,
            2 => Self::RegionIdentifiers,
            3 => Self::ReadyAck,
            4 => Self::OperationReport,
            _ => return None,
        })
    }
}

/// A message with two integer fields and a fixed kind tag
pub trait Message: Sized {
    const KIND: MessageKind;

    fn fields(&self) -> (u64, u64);

    fn from_fields(a: u64, b: u64) -> Result<Self, CMError>;

    fn encode(&self) -> Frame {
        let (a, b) = self.fields();
        let mut frame = [0u8; FRAME_SIZE];
        let mut out = &mut frame[..];
        out.put_u64(a);
        out.put_u64(b);
        out.put_u8(Self::KIND as u8);
        frame
    }

    fn decode(frame: &Frame) -> Result<Self, CMError> {
        if frame[KIND_AT + 1..].iter().any(|b| *b != 0) {
            return Err(CMError::InvalidFrame("non-zero padding"));
        }
        let got = MessageKind::from_raw(frame[KIND_AT])
            .ok_or(CMError::InvalidFrame("unknown message kind"))?;
        if got != Self::KIND {
            return Err(CMError::Unexpected {
                expected: Self::KIND,
                got,
            });
        }
        let mut input = &frame[..KIND_AT];
        let a = input.get_u64();
        let b = input.get_u64();
        Self::from_fields(a, b)
    }
}

/// Round 1: where the peer's QP can be reached
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionIdentifiers {
    pub lid: u16,
    pub qpn: u32,
}

impl Message for ConnectionIdentifiers {
    const KIND: MessageKind = MessageKind::ConnectionIdentifiers;

    fn fields(&self) -> (u64, u64) {
        (self.lid as u64, self.qpn as u64)
    }

    fn from_fields(a: u64, b: u64) -> Result<Self, CMError> {
        Ok(Self {
            lid: u16::try_from(a).map_err(|_| CMError::InvalidFrame("lid out of range"))?,
            qpn: u32::try_from(b).map_err(|_| CMError::InvalidFrame("qpn out of range"))?,
        })
    }
}

/// Round 2: what the peer's region allows us to address
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionIdentifiers {
    pub rkey: u32,
    pub addr: u64,
}

impl Message for RegionIdentifiers {
    const KIND: MessageKind = MessageKind::RegionIdentifiers;

    fn fields(&self) -> (u64, u64) {
        (self.rkey as u64, self.addr)
    }

    fn from_fields(a: u64, b: u64) -> Result<Self, CMError> {
        Ok(Self {
            rkey: u32::try_from(a).map_err(|_| CMError::InvalidFrame("rkey out of range"))?,
            addr: b,
        })
    }
}

/// The sender's QP state once it believes it is ready
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadyAck {
    pub state: QpState,
}

impl Message for ReadyAck {
    const KIND: MessageKind = MessageKind::ReadyAck;

    fn fields(&self) -> (u64, u64) {
        (self.state as u64, 0)
    }

    fn from_fields(a: u64, _: u64) -> Result<Self, CMError> {
        let state = u32::try_from(a)
            .ok()
            .and_then(QpState::from_raw)
            .ok_or(CMError::InvalidFrame("unknown QP state"))?;
        Ok(Self { state })
    }
}

/// How the remote operation ended on the side that posted it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OperationReport {
    pub status: WcStatus,
    pub wr_id: u64,
}

impl Message for OperationReport {
    const KIND: MessageKind = MessageKind::OperationReport;

    fn fields(&self) -> (u64, u64) {
        (self.status.to_raw() as u64, self.wr_id)
    }

    fn from_fields(a: u64, b: u64) -> Result<Self, CMError> {
        let raw = u32::try_from(a).map_err(|_| CMError::InvalidFrame("status out of range"))?;
        Ok(Self {
            status: WcStatus::from_raw(raw),
            wr_id: b,
        })
    }
}
