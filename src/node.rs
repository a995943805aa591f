//! Connections to the binary protocol port of cluster nodes.
use std::fmt;
use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use bytes::{Bytes, BytesMut};
use crossbeam::channel::{self, Receiver, Sender};
use tracing::{debug, error, info, instrument, warn};

use crate::command::Command;
use crate::configuration::NodeDescriptor;
use crate::coordinator::Event;
use crate::error::ErrorKind;
use crate::protocol::{parse_responses, Operation, OperationResult, Response};
use crate::{Result, VbkvError};

const READ_CHUNK_SIZE: usize = 16 * 1024;

/// Unique identifier of a node connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Generates a new unique connection id.
    pub fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        ConnectionId(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Credentials sent with SASL PLAIN when a connection is established.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaslCredentials {
    /// authentication identity, the bucket name
    pub username: String,
    /// the bucket's SASL password
    pub password: String,
}

/// What a node connection reports back to the client.
#[derive(Debug)]
pub enum NodeEvent {
    /// the connection is established and authenticated
    Connected,
    /// a response for a client operation
    Response {
        /// correlation id of the operation
        opaque: u32,
        /// the decoded result
        result: OperationResult,
    },
    /// the node does not own the partition the operation was sent for
    NotMyVbucket {
        /// correlation id of the redirected operation
        opaque: u32,
    },
    /// the node answered an operation with something the client cannot decode
    Failed {
        /// correlation id of the failed operation
        opaque: u32,
        /// the error to resolve the operation with
        kind: ErrorKind,
        /// what went wrong
        message: String,
    },
    /// the connection failed and has been torn down
    Lost(VbkvError),
}

/// The client side view of a connection to one node.
pub(crate) trait NodeLink: Send {
    /// this connection's id
    fn id(&self) -> ConnectionId;

    /// the node this connection talks to
    fn node(&self) -> &NodeDescriptor;

    /// Queues `packet` for writing. Packets are written in the order they are queued;
    /// packets queued before the connection is ready are written once it is.
    fn send(&self, packet: Bytes);

    /// closes the connection, pending writes are dropped
    fn close(&self);
}

/// Opens node connections.
pub(crate) trait Connector: Send {
    /// starts connecting to `node`, authenticating with `auth` when given
    fn connect(&mut self, node: &NodeDescriptor, auth: Option<SaslCredentials>) -> Box<dyn NodeLink>;
}

/// Opens real TCP connections that report to the client's event channel.
pub(crate) struct TcpConnector {
    events: Sender<Event>,
}

impl TcpConnector {
    pub(crate) fn new(events: Sender<Event>) -> Self {
        TcpConnector { events }
    }
}

impl Connector for TcpConnector {
    fn connect(&mut self, node: &NodeDescriptor, auth: Option<SaslCredentials>) -> Box<dyn NodeLink> {
        Box::new(NodeConnection::connect(node.clone(), auth, self.events.clone()))
    }
}

enum Outbound {
    Packet(Bytes),
    Close,
}

/// state shared between the connection handle and its I/O threads
struct Shared {
    id: ConnectionId,
    address: String,
    closed: AtomicBool,
    stream: Mutex<Option<TcpStream>>,
    events: Sender<Event>,
}

impl Shared {
    fn notify(&self, event: NodeEvent) {
        // the client is gone when this fails, nobody is left to tell
        let _ = self.events.send(Event::Node { conn: self.id, event });
    }

    /// reports a failure once, unless the connection was closed on purpose
    fn lost(&self, err: VbkvError) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            warn!(conn = %self.id, address = %self.address, "connection lost: {}", err);
            self.notify(NodeEvent::Lost(err));
        }
        self.shutdown();
    }

    fn shutdown(&self) {
        if let Ok(mut stream) = self.stream.lock() {
            if let Some(stream) = stream.take() {
                let _ = stream.shutdown(Shutdown::Both);
            }
        }
    }
}

/// A persistent connection to the binary protocol port of one node.
///
/// Connecting, authenticating and writing happen on a writer thread, which drains a FIFO
/// of outbound packets. Packets queued while the connection is still being established
/// wait in that FIFO. Once authenticated a reader thread appends everything it receives
/// to a buffer and parses as many complete responses out of it as are available.
pub struct NodeConnection {
    node: NodeDescriptor,
    outbound: Sender<Outbound>,
    shared: Arc<Shared>,
}

impl NodeConnection {
    /// Starts connecting to `node`. Progress and responses are reported on `events`.
    pub(crate) fn connect(node: NodeDescriptor, auth: Option<SaslCredentials>, events: Sender<Event>) -> Self {
        let (outbound, rx) = channel::unbounded();
        let shared = Arc::new(Shared {
            id: ConnectionId::next(),
            address: node.direct_address.clone(),
            closed: AtomicBool::new(false),
            stream: Mutex::new(None),
            events,
        });

        let writer = shared.clone();
        let spawned = thread::Builder::new()
            .name(format!("vbkv-node-{}", node.direct_address))
            .spawn(move || run_writer(writer, auth, rx));
        if let Err(e) = spawned {
            shared.lost(e.into());
        }

        NodeConnection { node, outbound, shared }
    }
}

impl NodeLink for NodeConnection {
    fn id(&self) -> ConnectionId {
        self.shared.id
    }

    fn node(&self) -> &NodeDescriptor {
        &self.node
    }

    fn send(&self, packet: Bytes) {
        if self.outbound.send(Outbound::Packet(packet)).is_err() {
            debug!(conn = %self.shared.id, "dropping packet for a closed connection");
        }
    }

    fn close(&self) {
        if !self.shared.closed.swap(true, Ordering::SeqCst) {
            info!(conn = %self.shared.id, address = %self.shared.address, "closing connection");
        }
        let _ = self.outbound.send(Outbound::Close);
        self.shared.shutdown();
    }
}

impl Drop for NodeConnection {
    fn drop(&mut self) {
        self.close();
    }
}

fn dial(address: &str) -> Result<TcpStream> {
    let addrs: Vec<_> = address
        .to_socket_addrs()
        .map_err(|_| VbkvError::UnknownHost(address.to_string()))?
        .collect();
    if addrs.is_empty() {
        return Err(VbkvError::UnknownHost(address.to_string()));
    }
    let stream = TcpStream::connect(&addrs[..]).map_err(|source| VbkvError::Connect {
        address: address.to_string(),
        source,
    })?;
    stream.set_nodelay(true)?;
    Ok(stream)
}

/// Sends SASL PLAIN and waits for its response. Bytes that arrive behind the
/// authentication response stay in `buf`.
fn authenticate(stream: &mut TcpStream, buf: &mut BytesMut, auth: &SaslCredentials) -> Result<()> {
    let packet = Command::SaslAuth {
        username: auth.username.clone(),
        password: auth.password.clone(),
    }
    .encode(0, 0)?;
    stream.write_all(&packet)?;

    let mut chunk = vec![0u8; READ_CHUNK_SIZE];
    loop {
        for response in parse_responses(buf) {
            let response = response?;
            if response.operation == Operation::SaslAuth {
                return match response.result.error {
                    None => Ok(()),
                    Some(err) => Err(VbkvError::Auth(err)),
                };
            }
            warn!(opaque = response.opaque, "unexpected {} response before authentication", response.operation);
        }
        let n = stream.read(&mut chunk)?;
        if n == 0 {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "connection closed during authentication").into());
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

#[instrument(skip_all, fields(conn = %shared.id, address = %shared.address))]
fn run_writer(shared: Arc<Shared>, auth: Option<SaslCredentials>, outbound: Receiver<Outbound>) {
    let mut stream = match dial(&shared.address) {
        Ok(stream) => stream,
        Err(e) => return shared.lost(e),
    };
    let handle = match stream.try_clone() {
        Ok(handle) => handle,
        Err(e) => return shared.lost(e.into()),
    };
    if let Ok(mut slot) = shared.stream.lock() {
        *slot = Some(handle);
    }
    if shared.closed.load(Ordering::SeqCst) {
        return shared.shutdown();
    }

    let mut buf = BytesMut::with_capacity(READ_CHUNK_SIZE);
    if let Some(auth) = auth {
        if let Err(e) = authenticate(&mut stream, &mut buf, &auth) {
            error!("authentication as '{}' failed: {}", auth.username, e);
            return shared.lost(e);
        }
        debug!("authenticated as '{}'", auth.username);
    }

    let reader = match stream.try_clone() {
        Ok(reader) => reader,
        Err(e) => return shared.lost(e.into()),
    };
    let reader_shared = shared.clone();
    let spawned = thread::Builder::new()
        .name(format!("vbkv-node-reader-{}", shared.address))
        .spawn(move || run_reader(reader_shared, reader, buf));
    if let Err(e) = spawned {
        return shared.lost(e.into());
    }

    info!("connected");
    shared.notify(NodeEvent::Connected);

    let mut batch = BytesMut::new();
    for message in outbound.iter() {
        let mut close = false;
        match message {
            Outbound::Packet(packet) => batch.extend_from_slice(&packet),
            Outbound::Close => close = true,
        }
        // coalesce whatever else is already queued into the same write
        while !close {
            match outbound.try_recv() {
                Ok(Outbound::Packet(packet)) => batch.extend_from_slice(&packet),
                Ok(Outbound::Close) => close = true,
                Err(_) => break,
            }
        }
        if close {
            break;
        }
        if let Err(e) = stream.write_all(&batch) {
            return shared.lost(e.into());
        }
        batch.clear();
    }
    debug!("writer finished");
    shared.shutdown();
}

#[instrument(skip_all, fields(conn = %shared.id, address = %shared.address))]
fn run_reader(shared: Arc<Shared>, mut stream: TcpStream, mut buf: BytesMut) {
    let mut chunk = vec![0u8; READ_CHUNK_SIZE];
    loop {
        // the authentication exchange may already have buffered responses
        for response in parse_responses(&mut buf) {
            match response {
                Ok(response) => {
                    if let Err(e) = deliver(&shared, response) {
                        return shared.lost(e);
                    }
                }
                Err(VbkvError::UnknownResponse { opcode, opaque }) => {
                    warn!(opaque, "discarding response with unknown opcode {:#04x}", opcode);
                    shared.notify(NodeEvent::Failed {
                        opaque,
                        kind: ErrorKind::UnknownCommand,
                        message: format!("unknown response opcode {:#04x}", opcode),
                    });
                }
                Err(e) => return shared.lost(e),
            }
        }

        match stream.read(&mut chunk) {
            Ok(0) => {
                let closed = io::Error::new(io::ErrorKind::UnexpectedEof, "connection closed by peer");
                return shared.lost(closed.into());
            }
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return shared.lost(e.into()),
        }
    }
}

/// routes one response: redirects go to the retry path, authentication is settled here,
/// everything else is handed to the client
fn deliver(shared: &Shared, response: Response) -> Result<()> {
    let Response { operation, opaque, result } = response;
    if result.error_kind() == Some(ErrorKind::NotMyVbucket) {
        debug!(opaque, "not my vbucket");
        shared.notify(NodeEvent::NotMyVbucket { opaque });
        return Ok(());
    }
    if operation == Operation::SaslAuth {
        return match result.error {
            None => Ok(()),
            Some(err) => Err(VbkvError::Auth(err)),
        };
    }
    shared.notify(NodeEvent::Response { opaque, result });
    Ok(())
}
