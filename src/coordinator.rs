//! The client's state machine.
//!
//! A single [`Coordinator`] owns everything that changes while the client runs: the
//! installed [`Configuration`], the node connections (index aligned with
//! `Configuration::nodes`), the table of in-flight operations keyed by opaque, the
//! retry queue and the opaque counter. It is driven by [`Event`]s from exactly one
//! thread, so none of this state is locked.
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use rand::seq::SliceRandom;
use tracing::{debug, error, info, warn};

use crate::command::{self, Command};
use crate::configuration::{Configuration, NodeDescriptor};
use crate::error::ErrorKind;
use crate::node::{ConnectionId, Connector, NodeEvent, NodeLink, SaslCredentials};
use crate::protocol::{Operation, OperationResult};
use crate::VbkvError;

/// Receives the result of one operation, exactly once.
pub(crate) type Handler = Box<dyn FnOnce(OperationResult) + Send + 'static>;

/// Receives feed failures the client could not recover from.
pub(crate) type ErrorCallback = Box<dyn FnMut(VbkvError) + Send + 'static>;

/// An operation submitted by the caller.
pub(crate) struct Request {
    pub(crate) command: Command,
    pub(crate) handler: Handler,
}

/// Everything the coordinator reacts to.
pub(crate) enum Event {
    /// a new configuration arrived on the feed
    Upgrade(Arc<Configuration>),
    /// the feed failed
    FeedError(VbkvError),
    /// operations to send, batched per node
    Dispatch(Vec<Request>),
    /// something happened on a node connection
    Node { conn: ConnectionId, event: NodeEvent },
    /// registers the error callback
    OnError(ErrorCallback),
    /// stop the client
    Shutdown,
}

/// an operation waiting for its response
struct PendingOperation {
    key: Bytes,
    operation: Operation,
    handler: Handler,
    packet: Bytes,
    conn: ConnectionId,
}

impl PendingOperation {
    fn fail(self, kind: ErrorKind, message: impl Into<String>) {
        (self.handler)(OperationResult::failed(self.operation, self.key, kind, message));
    }
}

struct Slot {
    link: Box<dyn NodeLink>,
    alive: bool,
}

pub(crate) struct Coordinator<C: Connector> {
    connector: C,
    config: Option<Arc<Configuration>>,
    nodes: Vec<Slot>,
    pending: HashMap<u32, PendingOperation>,
    retry_queue: VecDeque<(u32, PendingOperation)>,
    deferred: Vec<Vec<Request>>,
    opaque: u32,
    admin_endpoints: Vec<(String, u16)>,
    on_error: Option<ErrorCallback>,
}

impl<C: Connector> Coordinator<C> {
    pub(crate) fn new(connector: C) -> Self {
        Coordinator {
            connector,
            config: None,
            nodes: Vec::new(),
            pending: HashMap::new(),
            retry_queue: VecDeque::new(),
            deferred: Vec::new(),
            opaque: 0,
            admin_endpoints: Vec::new(),
            on_error: None,
        }
    }

    /// Handles every event except feed failover, which needs the listener and is
    /// driven by the event loop.
    pub(crate) fn handle(&mut self, event: Event) {
        match event {
            Event::Upgrade(config) => self.install(config),
            Event::FeedError(err) => self.report_error(err),
            Event::Dispatch(requests) => self.dispatch(requests),
            Event::Node { conn, event } => self.on_node_event(conn, event),
            Event::OnError(callback) => self.on_error = Some(callback),
            Event::Shutdown => self.shutdown(),
        }
    }

    /// Reconciles the node connections with `config`, installs it, dispatches anything
    /// held back before the first configuration and then drains the retry queue.
    pub(crate) fn install(&mut self, config: Arc<Configuration>) {
        let auth = config.sasl_password.as_ref().map(|password| SaslCredentials {
            username: config.bucket_name.clone(),
            password: password.clone(),
        });

        for (index, node) in config.nodes.iter().enumerate() {
            let unchanged = self
                .nodes
                .get(index)
                .map_or(false, |slot| slot.alive && slot.link.node() == node);
            if unchanged {
                continue;
            }
            info!(index, address = %node.direct_address, status = %node.status, "connecting to node");
            let slot = Slot {
                link: self.connector.connect(node, auth.clone()),
                alive: true,
            };
            if index < self.nodes.len() {
                let old = std::mem::replace(&mut self.nodes[index], slot);
                self.retire(old);
            } else {
                self.nodes.push(slot);
            }
        }
        while self.nodes.len() > config.nodes.len() {
            if let Some(old) = self.nodes.pop() {
                self.retire(old);
            }
        }

        self.admin_endpoints = config.nodes.iter().filter_map(NodeDescriptor::admin_endpoint).collect();
        self.admin_endpoints.shuffle(&mut rand::thread_rng());

        let first = self.config.is_none();
        self.config = Some(config);

        if first {
            for requests in std::mem::take(&mut self.deferred) {
                self.dispatch(requests);
            }
        }
        self.drain_retry_queue();
    }

    /// Sends `requests`, grouping the packets of each node into a single write.
    /// Before the first configuration the requests are held back.
    pub(crate) fn dispatch(&mut self, requests: Vec<Request>) {
        let config = match &self.config {
            Some(config) => config.clone(),
            None => {
                debug!(count = requests.len(), "no configuration yet, deferring requests");
                self.deferred.push(requests);
                return;
            }
        };

        let mut batches: BTreeMap<usize, BytesMut> = BTreeMap::new();
        for Request { command, handler } in requests {
            let opaque = self.next_opaque();
            let key = command.key();
            let operation = command.operation();

            let route = match config.locate(&key) {
                Ok(route) => route,
                Err(e) => {
                    debug!(opaque, "cannot route: {}", e);
                    handler(OperationResult::failed(operation, key, e.kind(), e.to_string()));
                    continue;
                }
            };
            let packet = match command.encode(opaque, route.partition) {
                Ok(packet) => packet,
                Err(e) => {
                    handler(OperationResult::failed(operation, key, e.kind(), e.to_string()));
                    continue;
                }
            };
            let conn = match self.nodes.get(route.node) {
                Some(slot) if slot.alive => slot.link.id(),
                Some(_) => {
                    handler(OperationResult::failed(operation, key, ErrorKind::Network, "node connection lost"));
                    continue;
                }
                None => {
                    handler(OperationResult::failed(operation, key, ErrorKind::TemporaryFail, "node not connected"));
                    continue;
                }
            };

            batches.entry(route.node).or_insert_with(BytesMut::new).extend_from_slice(&packet);
            self.pending.insert(
                opaque,
                PendingOperation {
                    key,
                    operation,
                    handler,
                    packet,
                    conn,
                },
            );
        }

        for (node, batch) in batches {
            self.nodes[node].link.send(batch.freeze());
        }
    }

    fn on_node_event(&mut self, conn: ConnectionId, event: NodeEvent) {
        match event {
            NodeEvent::Connected => debug!(%conn, "node ready"),
            NodeEvent::Response { opaque, result } => self.resolve(opaque, result),
            NodeEvent::NotMyVbucket { opaque } => self.redirect(opaque),
            NodeEvent::Failed { opaque, kind, message } => match self.pending.remove(&opaque) {
                Some(op) => op.fail(kind, message),
                None => warn!(opaque, "failure for unknown opaque: {}", message),
            },
            NodeEvent::Lost(err) => self.connection_lost(conn, err),
        }
    }

    /// hands `result` to the handler registered for `opaque`
    fn resolve(&mut self, opaque: u32, mut result: OperationResult) {
        match self.pending.remove(&opaque) {
            Some(op) => {
                if let Some(err) = result.error.as_mut() {
                    err.key = op.key.clone();
                }
                result.key = op.key;
                (op.handler)(result);
            }
            None => warn!(opaque, "response for unknown opaque"),
        }
    }

    /// parks a redirected operation until the next configuration arrives
    fn redirect(&mut self, opaque: u32) {
        match self.pending.remove(&opaque) {
            Some(op) => {
                debug!(opaque, queued = self.retry_queue.len() + 1, "queueing redirected operation for retry");
                self.retry_queue.push_back((opaque, op));
            }
            None => warn!(opaque, "redirect for unknown opaque"),
        }
    }

    /// Replays redirected operations one at a time against the installed
    /// configuration, each under its original opaque.
    fn drain_retry_queue(&mut self) {
        let config = match &self.config {
            Some(config) => config.clone(),
            None => return,
        };
        if !self.retry_queue.is_empty() {
            info!(count = self.retry_queue.len(), "replaying redirected operations");
        }
        while let Some((opaque, mut op)) = self.retry_queue.pop_front() {
            let route = match config.locate_forward(&op.key) {
                Ok(route) => route,
                Err(e) => {
                    op.fail(e.kind(), e.to_string());
                    continue;
                }
            };
            let slot = match self.nodes.get(route.node) {
                Some(slot) if slot.alive => slot,
                Some(_) => {
                    op.fail(ErrorKind::Network, "node connection lost");
                    continue;
                }
                None => {
                    op.fail(ErrorKind::TemporaryFail, "node not connected");
                    continue;
                }
            };
            debug!(opaque, partition = route.partition, node = route.node, "retrying");
            op.packet = command::set_vbucket(&op.packet, route.partition);
            op.conn = slot.link.id();
            let packet = op.packet.clone();
            self.pending.insert(opaque, op);
            slot.link.send(packet);
        }
    }

    fn connection_lost(&mut self, conn: ConnectionId, err: VbkvError) {
        if let Some(slot) = self.nodes.iter_mut().find(|slot| slot.link.id() == conn) {
            warn!(%conn, address = %slot.link.node().direct_address, "node connection lost: {}", err);
            slot.alive = false;
        }
        self.fail_pending(conn, &format!("connection lost: {}", err));
    }

    /// closes a connection that is being replaced and fails what is still waiting on it
    fn retire(&mut self, slot: Slot) {
        let conn = slot.link.id();
        slot.link.close();
        self.fail_pending(conn, "connection closed");
    }

    fn fail_pending(&mut self, conn: ConnectionId, message: &str) {
        let opaques: Vec<u32> = self
            .pending
            .iter()
            .filter(|(_, op)| op.conn == conn)
            .map(|(opaque, _)| *opaque)
            .collect();
        for opaque in opaques {
            if let Some(op) = self.pending.remove(&opaque) {
                op.fail(ErrorKind::Network, message);
            }
        }
    }

    /// the next admin endpoint to re-listen on after a feed failure
    pub(crate) fn next_admin_endpoint(&mut self) -> Option<(String, u16)> {
        self.admin_endpoints.pop()
    }

    /// hands a feed failure to the caller's error callback
    pub(crate) fn report_error(&mut self, err: VbkvError) {
        match self.on_error.as_mut() {
            Some(callback) => callback(err),
            None => error!("configuration feed failed: {}", err),
        }
    }

    /// closes every connection and fails everything still waiting
    pub(crate) fn shutdown(&mut self) {
        for slot in self.nodes.drain(..) {
            slot.link.close();
        }
        let message = "client closed";
        for (_, op) in self.pending.drain() {
            op.fail(ErrorKind::Network, message);
        }
        for (_, op) in self.retry_queue.drain(..) {
            op.fail(ErrorKind::Network, message);
        }
        for requests in self.deferred.drain(..) {
            for Request { command, handler } in requests {
                handler(OperationResult::failed(command.operation(), command.key(), ErrorKind::Network, message));
            }
        }
    }

    /// 32 bit correlation ids, wrapping silently
    fn next_opaque(&mut self) -> u32 {
        self.opaque = self.opaque.wrapping_add(1);
        self.opaque
    }
}
