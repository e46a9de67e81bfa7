//! One complete session: create, rendezvous, connect, one remote op, teardown.

use std::net::TcpStream;
use std::sync::Arc;
use std::thread;

use rdma_shim::utils::KTimer;
use rdma_shim::{log, QpState, WcStatus, WorkCompletion};

use crate::config::{LinkConfig, Operation, Readiness};
use crate::consts::{OP_WR_ID, REPORT_BYTES};
use crate::context::Context;
use crate::rendezvous::{
    self, ConnectionIdentifiers, FrameTransport, OperationReport, ReadyAck, RegionIdentifiers,
    Rendezvous, Role, StreamTransport,
};
use crate::{
    CMError, ControlpathError, DatapathError, LinkError, MemoryRegion, QueuePair,
    QueuePairBuilder, QueuePairStatus, UDriver,
};

/// The local half of a link: context, QP with its CQ, and later one region.
///
/// Fields drop in declaration order, which is also the teardown order.
pub struct LocalEndpoint {
    mr: Option<MemoryRegion>,
    qp: QueuePair,
    ctx: Arc<Context>,
}

impl LocalEndpoint {
    /// Open the configured device and create a CQ and an RC QP in RESET
    pub fn create(driver: &UDriver, cfg: &LinkConfig) -> Result<Self, ControlpathError> {
        let dev = driver.get_dev(cfg.device_index).ok_or_else(|| {
            log::error!(
                "no RDMA device at index {} ({} found)",
                cfg.device_index,
                driver.devices().len()
            );
            ControlpathError::InvalidArg("device index")
        })?;
        let ctx = dev.open_context()?;
        let qp = QueuePairBuilder::from_config(&ctx, &cfg.qp)?.build_rc()?;
        Ok(Self { mr: None, qp, ctx })
    }

    /// What the peer needs to reach our QP
    pub fn connection_identifiers(&self) -> Result<ConnectionIdentifiers, ControlpathError> {
        Ok(ConnectionIdentifiers {
            lid: self.qp.lid()?,
            qpn: self.qp.qp_num(),
        })
    }

    /// Bring our QP to RTS against the peer's identifiers
    pub fn connect(&self, peer: &ConnectionIdentifiers) -> Result<(), ControlpathError> {
        self.qp.bring_up_rc(peer.lid, peer.qpn)
    }

    /// Register the zeroed buffer, return what the peer needs to address it
    pub fn register_region(&mut self, size: usize) -> Result<RegionIdentifiers, ControlpathError> {
        if self.mr.is_some() {
            return Err(ControlpathError::InvalidArg("region already registered"));
        }
        let mr = MemoryRegion::new(self.ctx.clone(), size)?;
        let ids = RegionIdentifiers {
            rkey: mr.rkey().0,
            addr: mr.get_virt_addr(),
        };
        self.mr = Some(mr);
        Ok(ids)
    }

    pub fn region(&self) -> Option<&MemoryRegion> {
        self.mr.as_ref()
    }

    pub fn queue_pair(&self) -> &QueuePair {
        &self.qp
    }

    pub fn status(&self) -> Result<QueuePairStatus, ControlpathError> {
        self.qp.status()
    }

    /// Post the configured op against `peer` at the op offset and poll it
    pub fn execute(
        &self,
        cfg: &LinkConfig,
        peer: &RegionIdentifiers,
    ) -> Result<WorkCompletion, LinkError> {
        let mr = self
            .region()
            .ok_or(ControlpathError::InvalidArg("memory region not registered"))?;
        let range = cfg.op_range();
        let local = range.start as u64..range.end as u64;
        let raddr = peer
            .addr
            .checked_add(cfg.op_offset as u64)
            .filter(|a| a.checked_add(cfg.op_length as u64).is_some())
            .ok_or_else(|| {
                log::error!("peer region at {:#x} cannot hold the op range", peer.addr);
                DatapathError::OutOfRange {
                    start: peer.addr,
                    end: u64::MAX,
                    capacity: cfg.block_size,
                }
            })?;

        let timer = KTimer::new();
        match cfg.operation {
            Operation::Read => {
                self.qp
                    .post_send_read(mr, local, true, raddr, peer.rkey, OP_WR_ID)?
            }
            Operation::Write => {
                self.qp
                    .post_send_write(mr, local, true, raddr, peer.rkey, OP_WR_ID)?
            }
        }
        log::debug!("posted {:?} of {} bytes", cfg.operation, cfg.op_length);
        let wc = self.qp.poll_completion(cfg.poll_budget)?;
        log::info!(
            "{:?} completed in {} usec",
            cfg.operation,
            timer.get_passed_usec()
        );
        Ok(wc)
    }

    /// Destroy the region, the QP and its CQ, the PD and the context, in that order
    pub fn teardown(self) -> Result<(), ControlpathError> {
        let Self { mr, qp, ctx } = self;
        if let Some(mr) = mr {
            mr.destroy()?;
        }
        qp.destroy()?;
        ctx.destroy()?;
        log::info!("torn down");
        Ok(())
    }
}

/// What one peer saw of the session
#[derive(Debug, Clone)]
pub struct SessionReport {
    pub role: Role,
    pub operation: Operation,
    /// Only the initiator polls a completion
    pub completion: Option<WorkCompletion>,
    /// The first bytes of the local buffer after the operation
    pub head: Vec<u8>,
}

/// Source of the op bytes: the local buffer for a write, the peer's for a read
fn seeds_pattern(role: Role, op: Operation) -> bool {
    matches!(
        (role, op),
        (Role::Initiator, Operation::Write) | (Role::Responder, Operation::Read)
    )
}

fn report_of(outcome: &Result<WorkCompletion, LinkError>) -> OperationReport {
    match outcome {
        Ok(wc) => OperationReport {
            status: wc.status,
            wr_id: wc.wr_id,
        },
        Err(LinkError::Data(DatapathError::CompletionError { status, wr_id })) => {
            OperationReport {
                status: *status,
                wr_id: *wr_id,
            }
        }
        Err(_) => OperationReport {
            status: WcStatus::GeneralErr,
            wr_id: OP_WR_ID,
        },
    }
}

fn drive<T: FrameTransport>(
    endpoint: &mut LocalEndpoint,
    cfg: &LinkConfig,
    rv: &mut Rendezvous<T>,
) -> Result<SessionReport, LinkError> {
    let role = rv.role();

    let local = endpoint.connection_identifiers()?;
    log::info!("local lid {} qpn {}", local.lid, local.qpn);
    let peer = rv.exchange(&local)?;
    log::info!("peer lid {} qpn {}", peer.lid, peer.qpn);
    endpoint.connect(&peer)?;

    let region = endpoint.register_region(cfg.block_size)?;
    if seeds_pattern(role, cfg.operation) {
        if let Some(mr) = endpoint.region() {
            mr.write_bytes(cfg.op_offset, &vec![cfg.pattern; cfg.op_length])?;
        }
    }
    let peer_region = rv.exchange(&region)?;
    log::debug!(
        "peer region at {:#x} rkey {:#x}",
        peer_region.addr,
        peer_region.rkey
    );

    match cfg.readiness {
        Readiness::Acknowledge => {
            let state = QpState::from(endpoint.status()?);
            let ack = rv.exchange(&ReadyAck { state })?;
            if ack.state != QpState::ReadyToSend {
                log::error!("peer is in {:?}, not ready to send", ack.state);
                return Err(CMError::PeerNotReady(ack.state).into());
            }
        }
        Readiness::Delay if role == Role::Initiator => thread::sleep(cfg.warmup()),
        Readiness::Delay => {}
    }

    let completion = match role {
        Role::Initiator => {
            let outcome = endpoint.execute(cfg, &peer_region);
            // the peer hears about failures too, the op error takes precedence
            let notified = match cfg.readiness {
                Readiness::Acknowledge => rv.notify(&report_of(&outcome)),
                Readiness::Delay => Ok(()),
            };
            let wc = outcome?;
            notified?;
            Some(wc)
        }
        Role::Responder => {
            match cfg.readiness {
                Readiness::Acknowledge => {
                    let report: OperationReport = rv.receive()?;
                    if !report.status.is_success() {
                        log::error!(
                            "the peer's operation failed with status {} (work request ID: {})",
                            report.status,
                            report.wr_id
                        );
                        return Err(DatapathError::CompletionError {
                            status: report.status,
                            wr_id: report.wr_id,
                        }
                        .into());
                    }
                }
                Readiness::Delay => thread::sleep(cfg.settle()),
            }
            None
        }
    };

    let head = match endpoint.region() {
        Some(mr) => mr.read_bytes(0..REPORT_BYTES.min(cfg.block_size))?,
        None => Vec::new(),
    };
    Ok(SessionReport {
        role,
        operation: cfg.operation,
        completion,
        head,
    })
}

/// Run one session over an established transport.
///
/// Resources are torn down whatever happens; the first error wins.
pub fn run<T: FrameTransport>(
    driver: &UDriver,
    cfg: &LinkConfig,
    role: Role,
    transport: T,
) -> Result<SessionReport, LinkError> {
    cfg.validate()?;
    let mut endpoint = LocalEndpoint::create(driver, cfg)?;
    let mut rv = Rendezvous::new(role, transport);

    let res = drive(&mut endpoint, cfg, &mut rv);
    // the stream closes after the last round
    drop(rv);
    let torn = endpoint.teardown();

    let report = res?;
    torn?;
    Ok(report)
}

/// Set up the TCP rendezvous for the configured role, then run the session
pub fn run_tcp(driver: &UDriver, cfg: &LinkConfig) -> Result<SessionReport, LinkError> {
    cfg.validate()?;
    if driver.provider().is_process_local() {
        log::error!(
            "provider {} cannot reach a peer in another process",
            driver.provider().name()
        );
        return Err(ControlpathError::InvalidArg("process-local provider").into());
    }
    let role = cfg.resolve_role();
    let stream = match role {
        Role::Initiator => {
            let listener = rendezvous::listen_once(("0.0.0.0", cfg.port))?;
            log::info!("waiting for the responder on port {}", cfg.port);
            rendezvous::accept_once(listener)?
        }
        Role::Responder => {
            rendezvous::connect((cfg.peer.as_str(), cfg.port), cfg.warmup())?
        }
    };
    run_stream(driver, cfg, role, stream)
}

fn run_stream(
    driver: &UDriver,
    cfg: &LinkConfig,
    role: Role,
    stream: TcpStream,
) -> Result<SessionReport, LinkError> {
    rendezvous::set_io_timeout(&stream, cfg.io_timeout())?;
    run(driver, cfg, role, StreamTransport::new(stream))
}

/// Both roles in this process, the responder on its own thread, over
/// 127.0.0.1 with an ephemeral port.
///
/// Returns the initiator's report, then the responder's.
pub fn run_loopback(
    driver: &Arc<UDriver>,
    cfg: &LinkConfig,
) -> Result<(SessionReport, SessionReport), LinkError> {
    cfg.validate()?;
    let listener = rendezvous::listen_once("127.0.0.1:0")?;
    let addr = listener
        .local_addr()
        .map_err(|e| CMError::Io("local addr", e))?;

    let responder = {
        let driver = driver.clone();
        let cfg = cfg.clone();
        thread::spawn(move || -> Result<SessionReport, LinkError> {
            let stream = rendezvous::connect(addr, cfg.warmup())?;
            run_stream(&driver, &cfg, Role::Responder, stream)
        })
    };

    let initiator = rendezvous::accept_once(listener)
        .map_err(LinkError::from)
        .and_then(|stream| run_stream(driver, cfg, Role::Initiator, stream));

    let responder = match responder.join() {
        Ok(res) => res,
        Err(panic) => std::panic::resume_unwind(panic),
    };
    Ok((initiator?, responder?))
}
