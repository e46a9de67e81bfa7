//! Consts used in the whole rdma-link crate

/// TCP port of the rendezvous
pub const DEFAULT_PORT: u16 = 8009;

/// Payload of one rendezvous message, two 8-byte fields plus a tag
pub const MESSAGE_SIZE: usize = 24;
/// Bytes moved per rendezvous message, the payload plus one padding byte
pub const FRAME_SIZE: usize = MESSAGE_SIZE + 1;

/// Size of the registered buffer
pub const BLOCK_SIZE: usize = 256;

/// `[0, HEADER_LEN)` of every buffer is never addressed by the remote op
pub const HEADER_LEN: usize = 8;
pub const OP_OFFSET: usize = 8;
pub const OP_LENGTH: usize = 4;

/// Byte the source side fills the op range with
pub const PATTERN_BYTE: u8 = 1;

/// How many leading bytes of the buffer are reported after the op
pub const REPORT_BYTES: usize = 20;

pub const DEFAULT_POLL_BUDGET: usize = 1000;

pub const WARMUP_MS: u64 = 500;
pub const SETTLE_MS: u64 = 1000;

/// Host names starting with this prefix take the initiator role
pub const INITIATOR_PREFIX: &str = "node0";

pub const MAX_CQ_ENTRIES: u32 = 100;
pub const MAX_RD_ATOMIC: u8 = 1;

/// The wr_id of the single remote operation
pub const OP_WR_ID: u64 = 0;
