//! Common test utilities for integration tests: in-process mock nodes speaking the binary
//! protocol over loopback TCP, and a scripted configuration feed.
#![allow(dead_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use crossbeam::channel::{self, Receiver, Sender};
use serde_json::json;
use vbkv::{ConnectOptions, FeedSource, FeedStream, OperationResult, Result, VbkvError};

pub const TIMEOUT: Duration = Duration::from_secs(5);

const HEADER_SIZE: usize = 24;

pub const STATUS_SUCCESS: u16 = 0x00;
pub const STATUS_NOT_FOUND: u16 = 0x01;
pub const STATUS_NOT_MY_VBUCKET: u16 = 0x07;
pub const STATUS_AUTH_ERROR: u16 = 0x20;

/// a request as seen by a mock node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recorded {
    pub opcode: u8,
    pub vbucket: u16,
    pub opaque: u32,
    pub key: Vec<u8>,
}

/// a broken answer a mock node gives once, in place of its next reply
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// a response header starting with the request magic
    BadMagic,
    /// a response with an opcode the client never sends
    UnknownOpcode,
}

#[derive(Default)]
struct NodeState {
    fault: Mutex<Option<Fault>>,
    store: Mutex<HashMap<Vec<u8>, (Vec<u8>, u32)>>,
    owned: Mutex<Option<HashSet<u16>>>,
    requests: Mutex<Vec<Recorded>>,
    password: Mutex<Option<String>>,
    cas: AtomicU64,
}

/// A cluster node listening on an ephemeral loopback port.
///
/// Answers `get`, `set`, `incr`, `decr` and SASL PLAIN, keeps its own store, and replies
/// `NotMyVbucket` to requests for partitions it was told it does not own.
pub struct MockNode {
    pub address: SocketAddr,
    state: Arc<NodeState>,
}

impl MockNode {
    pub fn start() -> MockNode {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind mock node");
        let address = listener.local_addr().expect("mock node address");
        let state = Arc::new(NodeState::default());

        let accept_state = state.clone();
        thread::spawn(move || {
            for stream in listener.incoming() {
                let stream = match stream {
                    Ok(stream) => stream,
                    Err(_) => return,
                };
                let state = accept_state.clone();
                thread::spawn(move || serve(stream, state));
            }
        });

        MockNode { address, state }
    }

    /// only the given partitions are served, everything else is redirected
    pub fn owning(&self, partitions: &[u16]) {
        *self.state.owned.lock().unwrap() = Some(partitions.iter().copied().collect());
    }

    /// SASL PLAIN is only accepted with this password
    pub fn require_password(&self, password: &str) {
        *self.state.password.lock().unwrap() = Some(password.to_string());
    }

    /// answers the next request other than SASL with `fault`
    pub fn fail_next(&self, fault: Fault) {
        *self.state.fault.lock().unwrap() = Some(fault);
    }

    /// every request received so far, SASL included
    pub fn requests(&self) -> Vec<Recorded> {
        self.state.requests.lock().unwrap().clone()
    }

    /// requests received so far with the given opcode
    pub fn requests_for(&self, opcode: u8) -> Vec<Recorded> {
        self.requests().into_iter().filter(|r| r.opcode == opcode).collect()
    }

    pub fn direct_address(&self) -> String {
        self.address.to_string()
    }

    pub fn value(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.state.store.lock().unwrap().get(key).map(|(value, _)| value.clone())
    }
}

/// starts `count` nodes, ordered the way the client orders them (by direct address)
pub fn start_nodes(count: usize) -> Vec<MockNode> {
    let mut nodes: Vec<MockNode> = (0..count).map(|_| MockNode::start()).collect();
    nodes.sort_by_key(|node| node.direct_address());
    nodes
}

fn serve(mut stream: TcpStream, state: Arc<NodeState>) {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        let n = match stream.read(&mut chunk) {
            Ok(0) | Err(_) => return,
            Ok(n) => n,
        };
        buf.extend_from_slice(&chunk[..n]);

        while buf.len() >= HEADER_SIZE {
            let body_len = u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]) as usize;
            if buf.len() < HEADER_SIZE + body_len {
                break;
            }
            let packet: Vec<u8> = buf.drain(..HEADER_SIZE + body_len).collect();
            let reply = handle(&packet, &state);
            if stream.write_all(&reply).is_err() {
                return;
            }
        }
    }
}

fn handle(packet: &[u8], state: &NodeState) -> Vec<u8> {
    let opcode = packet[1];
    let key_len = u16::from_be_bytes([packet[2], packet[3]]) as usize;
    let extras_len = packet[4] as usize;
    let vbucket = u16::from_be_bytes([packet[6], packet[7]]);
    let opaque = u32::from_be_bytes([packet[12], packet[13], packet[14], packet[15]]);
    let extras = &packet[HEADER_SIZE..HEADER_SIZE + extras_len];
    let key = packet[HEADER_SIZE + extras_len..HEADER_SIZE + extras_len + key_len].to_vec();
    let value = &packet[HEADER_SIZE + extras_len + key_len..];

    state.requests.lock().unwrap().push(Recorded {
        opcode,
        vbucket,
        opaque,
        key: key.clone(),
    });

    if opcode == 0x21 {
        // "PLAIN" then "\0user\0password"
        let expected = state.password.lock().unwrap().clone();
        let password = value.split(|b| *b == 0).last().unwrap_or(&[]);
        let accepted = expected.map_or(true, |expected| expected.as_bytes() == password);
        return if accepted {
            response(opcode, STATUS_SUCCESS, opaque, 0, &[], b"Authenticated")
        } else {
            response(opcode, STATUS_AUTH_ERROR, opaque, 0, &[], b"Auth failure")
        };
    }

    if let Some(fault) = state.fault.lock().unwrap().take() {
        return match fault {
            Fault::BadMagic => {
                let mut packet = response(opcode, STATUS_SUCCESS, opaque, 0, &[], &[]);
                packet[0] = 0x80;
                packet
            }
            Fault::UnknownOpcode => response(0x04, STATUS_SUCCESS, opaque, 0, &[], &[]),
        };
    }

    let owned = match &*state.owned.lock().unwrap() {
        Some(owned) => owned.contains(&vbucket),
        None => true,
    };
    if !owned {
        return response(opcode, STATUS_NOT_MY_VBUCKET, opaque, 0, &[], b"Not my vbucket");
    }

    let cas = state.cas.fetch_add(1, Ordering::SeqCst) + 1;
    let mut store = state.store.lock().unwrap();
    match opcode {
        0x00 => match store.get(&key) {
            Some((value, flags)) => response(opcode, STATUS_SUCCESS, opaque, cas, &flags.to_be_bytes(), value),
            None => response(opcode, STATUS_NOT_FOUND, opaque, 0, &[], b"Not found"),
        },
        0x01 => {
            let flags = u32::from_be_bytes([extras[0], extras[1], extras[2], extras[3]]);
            store.insert(key, (value.to_vec(), flags));
            response(opcode, STATUS_SUCCESS, opaque, cas, &[], &[])
        }
        0x05 | 0x06 => {
            let delta = u64::from_be_bytes(extras[0..8].try_into().unwrap());
            let initial = u64::from_be_bytes(extras[8..16].try_into().unwrap());
            let current = store
                .get(&key)
                .and_then(|(value, _)| String::from_utf8(value.clone()).ok())
                .and_then(|value| value.parse::<u64>().ok());
            let next = match current {
                None => initial,
                Some(current) if opcode == 0x05 => current.wrapping_add(delta),
                Some(current) => current.saturating_sub(delta),
            };
            store.insert(key, (next.to_string().into_bytes(), 0));
            response(opcode, STATUS_SUCCESS, opaque, cas, &[], &next.to_be_bytes())
        }
        _ => response(opcode, 0x81, opaque, 0, &[], b"Unknown command"),
    }
}

/// encodes a response packet without a key
pub fn response(opcode: u8, status: u16, opaque: u32, cas: u64, extras: &[u8], value: &[u8]) -> Vec<u8> {
    let mut packet = Vec::with_capacity(HEADER_SIZE + extras.len() + value.len());
    packet.push(0x81);
    packet.push(opcode);
    packet.extend_from_slice(&0u16.to_be_bytes());
    packet.push(extras.len() as u8);
    packet.push(0);
    packet.extend_from_slice(&status.to_be_bytes());
    packet.extend_from_slice(&((extras.len() + value.len()) as u32).to_be_bytes());
    packet.extend_from_slice(&opaque.to_be_bytes());
    packet.extend_from_slice(&cas.to_be_bytes());
    packet.extend_from_slice(extras);
    packet.extend_from_slice(value);
    packet
}

/// A configuration document for `nodes` (in the order given) and a partition map.
pub fn bucket_document(nodes: &[MockNode], map: &[Vec<i32>], password: &str) -> String {
    let nodes: Vec<_> = nodes
        .iter()
        .map(|node| {
            json!({
                "hostname": format!("127.0.0.1:{}", node.address.port().wrapping_add(1)),
                "ports": {"proxy": 11211, "direct": node.address.port()},
                "status": "healthy",
                "version": "2.0.0"
            })
        })
        .collect();
    json!({
        "name": "default",
        "bucketType": "membase",
        "saslPassword": password,
        "nodeLocator": "vbucket",
        "vBucketServerMap": {
            "numReplicas": 0,
            "hashAlgorithm": "CRC",
            "vBucketMap": map
        },
        "nodes": nodes
    })
    .to_string()
}

/// A feed source handing out one pre-arranged stream per `open`, and recording the
/// options each `open` was called with.
#[derive(Default)]
pub struct ScriptedFeed {
    streams: Mutex<VecDeque<Receiver<Result<Bytes>>>>,
    opened: Mutex<Vec<ConnectOptions>>,
}

impl ScriptedFeed {
    pub fn new() -> Arc<ScriptedFeed> {
        Arc::new(ScriptedFeed::default())
    }

    /// Arranges the next stream. It ends when the returned sender is dropped, and
    /// sending fails once the client has let go of the stream.
    pub fn stream(&self) -> Sender<Result<Bytes>> {
        let (tx, rx) = channel::unbounded();
        self.streams.lock().unwrap().push_back(rx);
        tx
    }

    pub fn opened(&self) -> Vec<ConnectOptions> {
        self.opened.lock().unwrap().clone()
    }
}

impl FeedSource for ScriptedFeed {
    fn open(&self, options: &ConnectOptions) -> Result<FeedStream> {
        self.opened.lock().unwrap().push(options.clone());
        match self.streams.lock().unwrap().pop_front() {
            Some(chunks) => Ok(FeedStream::new(chunks)),
            None => Err(VbkvError::Feed("connection refused".to_string())),
        }
    }
}

/// a handler sending results into a channel
pub fn collect() -> (impl Fn(OperationResult) + Send + Sync + Clone + 'static, Receiver<OperationResult>) {
    let (tx, rx) = channel::unbounded();
    (
        move |result| {
            let _ = tx.send(result);
        },
        rx,
    )
}

/// A minimal admin port: answers every request with a chunked response carrying `body`,
/// then holds the connection open the way the streaming endpoint does.
pub struct MockAdmin {
    pub port: u16,
    requests: Arc<Mutex<Vec<String>>>,
    closed: Arc<AtomicUsize>,
}

impl MockAdmin {
    pub fn start(body: String) -> MockAdmin {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind mock admin");
        let port = listener.local_addr().expect("mock admin address").port();
        let requests = Arc::new(Mutex::new(Vec::new()));
        let closed = Arc::new(AtomicUsize::new(0));

        let seen = requests.clone();
        let gone = closed.clone();
        thread::spawn(move || {
            for stream in listener.incoming() {
                let mut stream = match stream {
                    Ok(stream) => stream,
                    Err(_) => return,
                };
                let seen = seen.clone();
                let gone = gone.clone();
                let body = body.clone();
                thread::spawn(move || {
                    let head = match read_head(&mut stream) {
                        Some(head) => head,
                        None => return,
                    };
                    seen.lock().unwrap().push(head);
                    let response = format!(
                        "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nTransfer-Encoding: chunked\r\n\r\n{:x}\r\n{}\r\n",
                        body.len(),
                        body
                    );
                    if stream.write_all(response.as_bytes()).is_err() {
                        return;
                    }
                    // keep streaming until the client goes away
                    let mut rest = [0u8; 256];
                    while let Ok(n) = stream.read(&mut rest) {
                        if n == 0 {
                            break;
                        }
                    }
                    gone.fetch_add(1, Ordering::SeqCst);
                });
            }
        });

        MockAdmin { port, requests, closed }
    }

    /// streaming connections the client has closed so far
    pub fn closed_connections(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    /// the request heads received so far
    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }
}

fn read_head(stream: &mut TcpStream) -> Option<String> {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        match stream.read(&mut byte) {
            Ok(1) => head.push(byte[0]),
            _ => return None,
        }
    }
    Some(String::from_utf8_lossy(&head).into_owned())
}
