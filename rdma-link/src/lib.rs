//! A single-shot reliable connection between two peers.
//!
//! The flow is: open a device context with its protection domain, create a
//! completion queue and an RC queue pair, swap connection identifiers over a
//! TCP rendezvous, drive the QP to RTS, register one memory region, swap
//! region identifiers, post one RDMA READ or WRITE, poll for its completion
//! and tear everything down in reverse creation order.

extern crate alloc;

/// Constants of the link
pub mod consts;

/// Abstraction for the completion queues & queue pairs
pub mod completion_queue;
pub mod queue_pairs;
pub use completion_queue::CompletionQueue;
pub use queue_pairs::{QueuePair, QueuePairBuilder, QueuePairStatus};

/// Abstraction for the memory regions
pub mod memory_region;
pub use memory_region::MemoryRegion;

/// Abstraction for the RDMA-capable devices (RNIC)
pub mod device;

/// Analogy ibv_context in the ibverbs, together with its protection domain
pub mod context;

pub mod udriver;
pub use udriver::{KDriverRef, UDriver};

/// Out-of-band exchange of the identifiers a connection needs
pub mod rendezvous;

pub mod config;
pub use config::LinkConfig;

pub mod session;

pub use rdma_shim;
pub(crate) use rdma_shim::Error;
pub use rdma_shim::log;

use rdma_shim::WcStatus;

/// The error type of control plane operations.
/// These mainly include error of creating QPs, MRs, etc.
#[derive(thiserror::Error, Debug)]
pub enum ControlpathError {
    #[error("create context {0} error: {1}")]
    ContextError(&'static str, Error),

    /// Used for identify create different resource error
    /// e.g., CQ, QP, etc.
    #[error("create {0} error: {1}")]
    CreationError(&'static str, Error),

    #[error("Invalid arg for {0}")]
    InvalidArg(&'static str),

    #[error("Query error: {0} w/ errono: {1}")]
    QueryError(&'static str, Error),

    #[error("modify QP {from:?} => {to:?} error: {errno}")]
    TransitionError {
        from: QueuePairStatus,
        to: QueuePairStatus,
        errno: Error,
    },

    #[error("destroy {0} error: {1}")]
    DestroyError(&'static str, Error),

    /// The resource is still referenced by something that must go first
    #[error("{0} torn down while still in use")]
    TeardownOrder(&'static str),
}

/// The error type of data plane operations
#[derive(thiserror::Error, Debug)]
pub enum DatapathError {
    #[error("post_send error with errorno {0}")]
    PostSendError(Error),

    #[error("poll_cq error with errorno {0}")]
    PollCQError(Error),

    #[error("no completion after {0} polls")]
    PollBudgetExhausted(usize),

    #[error("Poll failed with status {status} (work request ID: {wr_id})")]
    CompletionError { status: WcStatus, wr_id: u64 },

    #[error("range {start}..{end} exceeds the region capacity {capacity}")]
    OutOfRange {
        start: u64,
        end: u64,
        capacity: usize,
    },
}

/// The error type of the rendezvous.
/// Short reads and writes never show up here, a frame either moves whole or
/// the stream is reported closed or broken.
#[derive(thiserror::Error, Debug)]
pub enum CMError {
    #[error("the peer closed the rendezvous stream")]
    Closed,

    #[error("rendezvous {0} error: {1}")]
    Io(&'static str, #[source] std::io::Error),

    #[error("Timeout")]
    Timeout,

    #[error("invalid frame: {0}")]
    InvalidFrame(&'static str),

    #[error("expected a {expected:?} message, got {got:?}")]
    Unexpected {
        expected: rendezvous::MessageKind,
        got: rendezvous::MessageKind,
    },

    #[error("the peer reports its QP in {0:?}, not ready to send")]
    PeerNotReady(rdma_shim::QpState),
}

/// Everything a session can fail with
#[derive(thiserror::Error, Debug)]
pub enum LinkError {
    #[error(transparent)]
    Control(#[from] ControlpathError),

    #[error(transparent)]
    Data(#[from] DatapathError),

    #[error(transparent)]
    CM(#[from] CMError),

    #[error("configuration error: {0}")]
    Config(String),
}
