//! Out-of-band exchange of the identifiers a connection needs.
//!
//! Two peers talk over one TCP stream. The initiator binds, accepts exactly
//! one peer and drops the listener; the responder waits a warm-up delay and
//! connects. Every round moves one frame each way: the responder writes then
//! reads, the initiator reads then writes, so neither side can deadlock.

use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::thread;
use std::time::Duration;

use rdma_shim::log;

use crate::CMError;

pub mod message;
pub mod transport;

pub use message::{
    ConnectionIdentifiers, Frame, Message, MessageKind, OperationReport, ReadyAck,
    RegionIdentifiers,
};
pub use transport::{FrameTransport, StreamTransport};

/// Which side of the rendezvous a peer plays, fixed for the whole session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Accepts the stream, reads first, posts the remote operation
    Initiator,
    /// Connects to the initiator, writes first, exposes its region
    Responder,
}

impl Role {
    /// Hosts whose name starts with `prefix` are initiators
    pub fn from_hostname(prefix: &str) -> Self {
        let host = gethostname::gethostname();
        let role = Self::for_host(&host.to_string_lossy(), prefix);
        log::info!("host {:?} acts as the {:?}", host, role);
        role
    }

    pub fn for_host(host: &str, prefix: &str) -> Self {
        if host.starts_with(prefix) {
            Role::Initiator
        } else {
            Role::Responder
        }
    }
}

/// Bind the rendezvous port on every interface
pub fn listen_once<A: ToSocketAddrs>(addr: A) -> Result<TcpListener, CMError> {
    TcpListener::bind(addr).map_err(|e| {
        log::error!("Cannot bind to socket: {}", e);
        CMError::Io("bind", e)
    })
}

/// Accept a single peer; the listener is closed on return
pub fn accept_once(listener: TcpListener) -> Result<TcpStream, CMError> {
    let (stream, peer) = listener.accept().map_err(|e| {
        log::error!("Cannot accept on new socket: {}", e);
        CMError::Io("accept", e)
    })?;
    log::info!("rendezvous peer {} connected", peer);
    Ok(stream)
}

/// Sleep `warmup`, then connect to the initiator at `addr`
pub fn connect<A: ToSocketAddrs>(addr: A, warmup: Duration) -> Result<TcpStream, CMError> {
    thread::sleep(warmup);
    let addrs: Vec<SocketAddr> = addr
        .to_socket_addrs()
        .map_err(|e| {
            log::error!("Could not resolve hostname: {}", e);
            CMError::Io("resolve", e)
        })?
        .collect();
    TcpStream::connect(addrs.as_slice()).map_err(|e| {
        log::error!("Cannot connect to foreign socket: {}", e);
        CMError::Io("connect", e)
    })
}

/// Apply the same timeout to every blocking read and write of `stream`
pub fn set_io_timeout(stream: &TcpStream, timeout: Option<Duration>) -> Result<(), CMError> {
    stream
        .set_read_timeout(timeout)
        .and_then(|_| stream.set_write_timeout(timeout))
        .map_err(|e| CMError::Io("set timeout", e))
}

/// The rounds of one session over one transport
pub struct Rendezvous<T> {
    role: Role,
    transport: T,
}

impl<T: FrameTransport> Rendezvous<T> {
    pub fn new(role: Role, transport: T) -> Self {
        Self { role, transport }
    }

    #[inline]
    pub fn role(&self) -> Role {
        self.role
    }

    /// One round: send `local`, get the peer's message of the same kind
    pub fn exchange<M: Message>(&mut self, local: &M) -> Result<M, CMError> {
        let frame = local.encode();
        let reply = match self.role {
            Role::Responder => {
                self.transport.send_frame(&frame)?;
                self.transport.recv_frame()?
            }
            Role::Initiator => {
                let reply = self.transport.recv_frame()?;
                self.transport.send_frame(&frame)?;
                reply
            }
        };
        M::decode(&reply)
    }

    /// One-way round from this side
    pub fn notify<M: Message>(&mut self, msg: &M) -> Result<(), CMError> {
        self.transport.send_frame(&msg.encode())
    }

    /// One-way round from the peer
    pub fn receive<M: Message>(&mut self) -> Result<M, CMError> {
        M::decode(&self.transport.recv_frame()?)
    }

    pub fn into_transport(self) -> T {
        self.transport
    }
}
