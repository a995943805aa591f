use std::sync::Arc;
use std::thread::{self, JoinHandle};

use bytes::Bytes;
use crossbeam::channel::{self, Receiver, Sender};
use tracing::{debug, error, info, instrument, warn};

use crate::command::{ArithmeticOptions, Command, SetOptions};
use crate::coordinator::{Coordinator, Event, Request};
use crate::listener::{ConfigurationListener, FeedSource, HttpFeed, ListenerHandle};
use crate::node::{Connector, TcpConnector};
use crate::options::ConnectOptions;
use crate::protocol::OperationResult;
use crate::{Result, VbkvError};

/// `Client` routes key-value operations to the cluster node owning each key.
///
/// Connecting starts two background activities: a listener on the bucket's streaming
/// configuration feed, and a coordinator thread which owns the routing tables and every
/// node connection. Operations may be issued right away; anything issued before the first
/// configuration has arrived is held and sent once it has.
///
/// Results are delivered asynchronously to the handler passed with each operation. Each
/// handler runs exactly once, on the coordinator thread, so handlers should hand their
/// result off (to a channel, say) rather than block.
pub struct Client {
    events: Sender<Event>,
    worker: Option<JoinHandle<()>>,
}

impl Client {
    /// connects to the cluster described by `options` over HTTP
    pub fn connect(options: ConnectOptions) -> Result<Self> {
        Self::connect_with(options, Arc::new(HttpFeed::new()?))
    }

    /// Connects to the cluster described by `options`, reading its configuration feed
    /// from `source`.
    pub fn connect_with(options: ConnectOptions, source: Arc<dyn FeedSource>) -> Result<Self> {
        let (events, rx) = channel::unbounded();
        let mut feed = Feed {
            source,
            events: events.clone(),
            handle: None,
        };
        feed.listen(options.clone())?;

        let coordinator = Coordinator::new(TcpConnector::new(events.clone()));
        let worker = thread::Builder::new()
            .name("vbkv-coordinator".to_string())
            .spawn(move || run(coordinator, rx, feed, options))?;

        Ok(Client {
            events,
            worker: Some(worker),
        })
    }

    /// Registers the callback receiving configuration feed failures that could not be
    /// recovered by switching to another node.
    pub fn on_error<F>(&self, callback: F) -> Result<()>
    where
        F: FnMut(VbkvError) + Send + 'static,
    {
        self.send(Event::OnError(Box::new(callback)))
    }

    /// stores `value` under `key`
    pub fn set<K, V, F>(&self, key: K, value: V, options: SetOptions, handler: F) -> Result<()>
    where
        K: Into<Bytes>,
        V: Into<Bytes>,
        F: FnOnce(OperationResult) + Send + 'static,
    {
        let command = Command::Set {
            key: key.into(),
            value: value.into(),
            options,
        };
        self.dispatch(vec![Request {
            command,
            handler: Box::new(handler),
        }])
    }

    /// Fetches every key in `keys`. `handler` is called once per key.
    ///
    /// Keys owned by the same node are sent to it in a single write.
    pub fn get<I, K, F>(&self, keys: I, handler: F) -> Result<()>
    where
        I: IntoIterator<Item = K>,
        K: Into<Bytes>,
        F: Fn(OperationResult) + Send + Sync + 'static,
    {
        let handler = Arc::new(handler);
        let requests = keys
            .into_iter()
            .map(|key| {
                let handler = handler.clone();
                Request {
                    command: Command::Get { key: key.into() },
                    handler: Box::new(move |result| handler(result)),
                }
            })
            .collect();
        self.dispatch(requests)
    }

    /// adds to the counter at `key`, see [`OperationResult::counter`]
    pub fn incr<K, O, F>(&self, key: K, options: O, handler: F) -> Result<()>
    where
        K: Into<Bytes>,
        O: Into<ArithmeticOptions>,
        F: FnOnce(OperationResult) + Send + 'static,
    {
        let command = Command::Increment {
            key: key.into(),
            options: options.into(),
        };
        self.dispatch(vec![Request {
            command,
            handler: Box::new(handler),
        }])
    }

    /// subtracts from the counter at `key`, see [`OperationResult::counter`]
    pub fn decr<K, O, F>(&self, key: K, options: O, handler: F) -> Result<()>
    where
        K: Into<Bytes>,
        O: Into<ArithmeticOptions>,
        F: FnOnce(OperationResult) + Send + 'static,
    {
        let command = Command::Decrement {
            key: key.into(),
            options: options.into(),
        };
        self.dispatch(vec![Request {
            command,
            handler: Box::new(handler),
        }])
    }

    /// Stops the client. The configuration feed and every node connection are closed,
    /// operations still waiting for a response are failed with a `Network` error.
    pub fn close(mut self) {
        self.shutdown();
    }

    fn dispatch(&self, requests: Vec<Request>) -> Result<()> {
        if requests.is_empty() {
            return Ok(());
        }
        self.send(Event::Dispatch(requests))
    }

    fn send(&self, event: Event) -> Result<()> {
        self.events.send(event).map_err(|_| VbkvError::Closed)
    }

    fn shutdown(&mut self) {
        if let Some(worker) = self.worker.take() {
            let _ = self.events.send(Event::Shutdown);
            if worker.join().is_err() {
                error!("coordinator thread panicked");
            }
        }
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// the currently running configuration listener
struct Feed {
    source: Arc<dyn FeedSource>,
    events: Sender<Event>,
    handle: Option<ListenerHandle>,
}

impl Feed {
    /// (re)starts listening with `options`, stopping the previous listener
    fn listen(&mut self, options: ConnectOptions) -> Result<()> {
        self.stop();
        let upgrades = self.events.clone();
        let errors = self.events.clone();
        let handle = ConfigurationListener::new()
            .on_upgrade(move |config| {
                let _ = upgrades.send(Event::Upgrade(config));
            })
            .on_error(move |e| {
                let _ = errors.send(Event::FeedError(e));
            })
            .listen(self.source.clone(), options)?;
        self.handle = Some(handle);
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.stop();
        }
    }
}

/// the coordinator thread: applies events in arrival order until shut down
#[instrument(skip_all, fields(bucket = %options.bucket))]
fn run<C: Connector>(mut coordinator: Coordinator<C>, events: Receiver<Event>, mut feed: Feed, options: ConnectOptions) {
    info!("client started");
    for event in events.iter() {
        match event {
            Event::FeedError(err) => failover(&mut coordinator, &mut feed, &options, err),
            Event::Shutdown => {
                feed.stop();
                coordinator.shutdown();
                break;
            }
            event => coordinator.handle(event),
        }
    }
    debug!("client stopped");
}

/// Moves the feed to the next known admin endpoint. The error only reaches the caller
/// once no endpoint is left to try.
fn failover<C: Connector>(coordinator: &mut Coordinator<C>, feed: &mut Feed, options: &ConnectOptions, err: VbkvError) {
    feed.stop();
    while let Some((host, port)) = coordinator.next_admin_endpoint() {
        warn!(host = %host, port, "configuration feed failed ({}), switching node", err);
        match feed.listen(options.with_endpoint(&host, port)) {
            Ok(()) => return,
            Err(e) => warn!(host = %host, port, "cannot restart configuration listener: {}", e),
        }
    }
    coordinator.report_error(err);
}
