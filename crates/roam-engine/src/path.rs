use std::fmt;
use std::io;
use std::net::{IpAddr, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Sends datagrams on one network path.
///
/// The engine performs its own socket I/O through this handle; the client
/// side only manages binding and ownership. Writers carry a process-unique
/// id so path bookkeeping can tell two writers on the same address apart.
pub trait PacketWriter: Send + Sync + fmt::Debug {
    fn send_to(&self, buf: &[u8], peer: SocketAddr) -> io::Result<usize>;
    fn local_addr(&self) -> SocketAddr;
    fn id(&self) -> u64;
}

static NEXT_WRITER_ID: AtomicU64 = AtomicU64::new(1);

fn next_writer_id() -> u64 {
    NEXT_WRITER_ID.fetch_add(1, Ordering::Relaxed)
}

/// UDP-socket-backed packet writer bound to one local address.
#[derive(Debug)]
pub struct UdpWriter {
    socket: UdpSocket,
    local: SocketAddr,
    id: u64,
}

impl UdpWriter {
    /// Binds a new writer on `local_ip`; port 0 requests an ephemeral port.
    pub fn bind(local_ip: IpAddr, port: u16) -> io::Result<Self> {
        let socket = UdpSocket::bind(SocketAddr::new(local_ip, port))?;
        socket.set_nonblocking(true)?;
        let local = socket.local_addr()?;
        Ok(Self {
            socket,
            local,
            id: next_writer_id(),
        })
    }
}

impl PacketWriter for UdpWriter {
    fn send_to(&self, buf: &[u8], peer: SocketAddr) -> io::Result<usize> {
        self.socket.send_to(buf, peer)
    }

    fn local_addr(&self) -> SocketAddr {
        self.local
    }

    fn id(&self) -> u64 {
        self.id
    }
}

/// One network route for a session: local address, peer address and the
/// writer bound to it. A session has exactly one active path at a time.
#[derive(Debug, Clone)]
pub struct Path {
    pub local: SocketAddr,
    pub peer: SocketAddr,
    pub writer: Arc<dyn PacketWriter>,
}

impl Path {
    pub fn new(writer: Arc<dyn PacketWriter>, peer: SocketAddr) -> Self {
        Self {
            local: writer.local_addr(),
            peer,
            writer,
        }
    }
}

/// A candidate path under validation.
///
/// Owns its writer until the attempt resolves: on success the context is
/// handed back to the caller for promotion, on failure it is handed back to
/// be discarded. Not cloneable; exactly one attempt owns the candidate.
#[derive(Debug)]
pub struct PathContext {
    local: SocketAddr,
    peer: SocketAddr,
    writer: Arc<dyn PacketWriter>,
}

impl PathContext {
    pub fn new(writer: Arc<dyn PacketWriter>, peer: SocketAddr) -> Self {
        Self {
            local: writer.local_addr(),
            peer,
            writer,
        }
    }

    pub fn local(&self) -> SocketAddr {
        self.local
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn writer(&self) -> &Arc<dyn PacketWriter> {
        &self.writer
    }

    /// Consumes the context, releasing its writer to the caller.
    pub fn into_writer(self) -> Arc<dyn PacketWriter> {
        self.writer
    }
}
