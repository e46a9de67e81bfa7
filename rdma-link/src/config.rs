//! Session configuration.
//!
//! Every field has a default, so an empty JSON object is a complete
//! configuration; the command line overrides single fields on top.

use std::path::Path;
use std::time::Duration;

use serde_derive::{Deserialize, Serialize};

use crate::consts::*;
use crate::rendezvous::Role;
use crate::LinkError;

/// QP creation and connection attributes
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueuePairConfig {
    pub max_send_wr: u32,
    pub max_recv_wr: u32,
    pub max_cq_entries: u32,
    /// Path MTU in bytes, one of 256, 512, 1024, 2048, 4096
    pub path_mtu: usize,
    pub timeout: u8,
    pub retry_count: u8,
    pub rnr_retry: u8,
    pub min_rnr_timer: u8,
    pub max_rd_atomic: u8,
    pub port_num: u8,
}

impl Default for QueuePairConfig {
    fn default() -> Self {
        Self {
            max_send_wr: 2,
            max_recv_wr: 2,
            max_cq_entries: MAX_CQ_ENTRIES,
            path_mtu: 4096,
            timeout: 14,
            retry_count: 7,
            rnr_retry: 7,
            min_rnr_timer: 12,
            max_rd_atomic: MAX_RD_ATOMIC,
            port_num: 1,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoleSelection {
    /// Decided by the host name prefix
    Auto,
    Initiator,
    Responder,
}

/// How the initiator learns that the responder can take the operation
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Readiness {
    /// Explicit ready and report rounds
    #[serde(rename = "ack")]
    Acknowledge,
    /// Fixed sleeps, no extra rounds
    Delay,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Read,
    Write,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    pub role: RoleSelection,
    pub initiator_prefix: String,
    /// Host the responder connects to
    pub peer: String,
    pub port: u16,
    pub device_index: usize,

    pub block_size: usize,
    pub op_offset: usize,
    pub op_length: usize,
    pub pattern: u8,
    pub operation: Operation,

    pub poll_budget: usize,
    pub readiness: Readiness,
    pub warmup_ms: u64,
    pub settle_ms: u64,
    /// Bound on every rendezvous read and write, none blocks forever
    pub io_timeout_ms: Option<u64>,

    pub qp: QueuePairConfig,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            role: RoleSelection::Auto,
            initiator_prefix: INITIATOR_PREFIX.to_string(),
            peer: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            device_index: 0,
            block_size: BLOCK_SIZE,
            op_offset: OP_OFFSET,
            op_length: OP_LENGTH,
            pattern: PATTERN_BYTE,
            operation: Operation::Read,
            poll_budget: DEFAULT_POLL_BUDGET,
            readiness: Readiness::Acknowledge,
            warmup_ms: WARMUP_MS,
            settle_ms: SETTLE_MS,
            io_timeout_ms: None,
            qp: QueuePairConfig::default(),
        }
    }
}

impl LinkConfig {
    pub fn from_json_str(raw: &str) -> Result<Self, LinkError> {
        let cfg: Self = serde_json::from_str(raw)
            .map_err(|e| LinkError::Config(format!("malformed configuration: {}", e)))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, LinkError> {
        let raw = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            LinkError::Config(format!("cannot read {}: {}", path.as_ref().display(), e))
        })?;
        Self::from_json_str(&raw)
    }

    /// The op range must stay clear of the header and inside the buffer
    pub fn validate(&self) -> Result<(), LinkError> {
        if self.op_length == 0 {
            return Err(LinkError::Config("op_length must be positive".into()));
        }
        if self.op_offset < HEADER_LEN {
            return Err(LinkError::Config(format!(
                "op_offset {} overlaps the {}-byte header",
                self.op_offset, HEADER_LEN
            )));
        }
        match self.op_offset.checked_add(self.op_length) {
            Some(end) if end <= self.block_size => {}
            _ => {
                return Err(LinkError::Config(format!(
                    "op range {}+{} exceeds the {}-byte block",
                    self.op_offset, self.op_length, self.block_size
                )))
            }
        }
        if rdma_shim::Mtu::from_bytes(self.qp.path_mtu).is_none() {
            return Err(LinkError::Config(format!(
                "unsupported path MTU {}",
                self.qp.path_mtu
            )));
        }
        Ok(())
    }

    pub fn resolve_role(&self) -> Role {
        match self.role {
            RoleSelection::Initiator => Role::Initiator,
            RoleSelection::Responder => Role::Responder,
            RoleSelection::Auto => Role::from_hostname(&self.initiator_prefix),
        }
    }

    #[inline]
    pub fn warmup(&self) -> Duration {
        Duration::from_millis(self.warmup_ms)
    }

    #[inline]
    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }

    #[inline]
    pub fn io_timeout(&self) -> Option<Duration> {
        self.io_timeout_ms.map(Duration::from_millis)
    }

    /// Range of the remote operation inside the buffer
    #[inline]
    pub fn op_range(&self) -> core::ops::Range<usize> {
        self.op_offset..self.op_offset + self.op_length
    }
}
