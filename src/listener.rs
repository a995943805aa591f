//! Consumes the bucket's streaming configuration feed.
//!
//! The feed is a long lived, chunked HTTP response which emits one JSON document per
//! topology change. Chunk boundaries have nothing to do with document boundaries, so
//! bytes are pushed through a [`JsonStream`] which hands back every top-level value as
//! soon as it is complete.
use std::sync::Arc;
use std::thread;

use bytes::Bytes;
use crossbeam::channel::{self, Receiver, Sender, TryRecvError};
use crossbeam::select;
use serde_json::{Deserializer, Value};
use tokio::sync::oneshot;
use tracing::{debug, info, instrument, warn};

use crate::configuration::Configuration;
use crate::options::ConnectOptions;
use crate::{Result, VbkvError};

/// largest configuration document [`JsonStream::new`] buffers
pub const MAX_DOCUMENT_SIZE: usize = 16 * 1024 * 1024;

/// Opens the byte stream of a configuration feed.
pub trait FeedSource: Send + Sync {
    /// starts a streaming read of the feed described by `options`
    fn open(&self, options: &ConnectOptions) -> Result<FeedStream>;
}

/// An open configuration feed: the chunks it delivers, in order, and a hook that
/// closes the underlying connection.
///
/// The feed ends when the sending side of `chunks` is dropped. Dropping the
/// `FeedStream` runs the close hook.
pub struct FeedStream {
    chunks: Receiver<Result<Bytes>>,
    on_close: Option<Box<dyn FnOnce() + Send>>,
}

impl FeedStream {
    /// a feed delivering `chunks`
    pub fn new(chunks: Receiver<Result<Bytes>>) -> Self {
        FeedStream { chunks, on_close: None }
    }

    /// runs `hook` once the feed is no longer read
    pub fn on_close<F>(mut self, hook: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        self.on_close = Some(Box::new(hook));
        self
    }
}

impl Drop for FeedStream {
    fn drop(&mut self) {
        if let Some(hook) = self.on_close.take() {
            hook();
        }
    }
}

/// Reads the feed over HTTP from the cluster's admin port.
///
/// The request has no timeout: the feed stays open indefinitely between updates. Each
/// open feed owns a single threaded runtime on its own thread, which streams the
/// response body until the feed is closed.
#[derive(Debug, Clone)]
pub struct HttpFeed {
    client: reqwest::Client,
}

impl HttpFeed {
    /// creates the HTTP client used for every feed request
    pub fn new() -> Result<Self> {
        // streaming responses never go back to the pool
        let client = reqwest::Client::builder().pool_max_idle_per_host(0).build()?;
        Ok(HttpFeed { client })
    }
}

impl FeedSource for HttpFeed {
    fn open(&self, options: &ConnectOptions) -> Result<FeedStream> {
        let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build()?;
        let mut request = self.client.get(options.streaming_url());
        if let Some((username, password)) = options.auth() {
            request = request.basic_auth(username, Some(password));
        }
        let response = runtime.block_on(async move { request.send().await?.error_for_status() })?;

        let (chunks, received) = channel::unbounded();
        let (close, closed) = oneshot::channel();
        thread::Builder::new()
            .name("vbkv-config-stream".to_string())
            .spawn(move || runtime.block_on(stream_body(response, chunks, closed)))?;
        Ok(FeedStream::new(received).on_close(move || {
            let _ = close.send(());
        }))
    }
}

/// forwards body chunks until the body ends, the reader goes away or `closed` fires
async fn stream_body(mut response: reqwest::Response, chunks: Sender<Result<Bytes>>, mut closed: oneshot::Receiver<()>) {
    loop {
        let chunk = tokio::select! {
            _ = &mut closed => {
                debug!("closing configuration stream");
                return;
            }
            chunk = response.chunk() => chunk,
        };
        match chunk {
            Ok(Some(bytes)) => {
                if chunks.send(Ok(bytes)).is_err() {
                    return;
                }
            }
            Ok(None) => return,
            Err(e) => {
                let _ = chunks.send(Err(e.into()));
                return;
            }
        }
    }
}

/// Splits a byte stream into complete top-level JSON values.
///
/// Bytes are scanned once as they arrive, tracking nesting and string state, so only
/// values known to be complete are handed to the deserializer.
#[derive(Debug)]
pub struct JsonStream {
    buf: Vec<u8>,
    limit: usize,
    scanned: usize,
    // end of the last complete top-level value (or whitespace) in `buf`
    complete: usize,
    depth: usize,
    in_string: bool,
    escaped: bool,
    in_scalar: bool,
}

impl Default for JsonStream {
    fn default() -> Self {
        Self::new()
    }
}

impl JsonStream {
    /// creates an empty stream buffering at most [`MAX_DOCUMENT_SIZE`] bytes
    pub fn new() -> Self {
        Self::with_limit(MAX_DOCUMENT_SIZE)
    }

    /// creates an empty stream buffering at most `limit` bytes of an incomplete value
    pub fn with_limit(limit: usize) -> Self {
        JsonStream {
            buf: Vec::new(),
            limit,
            scanned: 0,
            complete: 0,
            depth: 0,
            in_string: false,
            escaped: false,
            in_scalar: false,
        }
    }

    /// Appends `chunk` and returns every value completed by it, in order.
    ///
    /// Bytes of a value that is still incomplete are kept for the next call. On a
    /// syntax error, or when an incomplete value outgrows the limit, the error is
    /// returned in place of the value and the buffered bytes are discarded.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Result<Value>> {
        self.buf.extend_from_slice(chunk);
        self.scan();

        let mut values = Vec::new();
        if self.complete > 0 {
            let mut failed = false;
            for value in Deserializer::from_slice(&self.buf[..self.complete]).into_iter::<Value>() {
                match value {
                    Ok(value) => values.push(Ok(value)),
                    Err(e) => {
                        values.push(Err(e.into()));
                        failed = true;
                        break;
                    }
                }
            }
            if failed {
                self.reset();
                return values;
            }
            self.buf.drain(..self.complete);
            self.scanned -= self.complete;
            self.complete = 0;
        }

        if self.buf.len() > self.limit {
            self.reset();
            values.push(Err(VbkvError::Feed(format!(
                "configuration document larger than {} bytes",
                self.limit
            ))));
        }
        values
    }

    /// number of buffered bytes not yet part of a complete value
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    fn scan(&mut self) {
        for i in self.scanned..self.buf.len() {
            let byte = self.buf[i];
            if self.in_string {
                if self.escaped {
                    self.escaped = false;
                } else if byte == b'\\' {
                    self.escaped = true;
                } else if byte == b'"' {
                    self.in_string = false;
                    if self.depth == 0 {
                        self.complete = i + 1;
                    }
                }
                continue;
            }
            if self.in_scalar {
                if !is_delimiter(byte) {
                    continue;
                }
                self.in_scalar = false;
                self.complete = i;
            }
            match byte {
                b'"' => self.in_string = true,
                b'{' | b'[' => self.depth += 1,
                b'}' | b']' => {
                    // an unbalanced close at the top level is left to the deserializer
                    self.depth = self.depth.saturating_sub(1);
                    if self.depth == 0 {
                        self.complete = i + 1;
                    }
                }
                b' ' | b'\t' | b'\n' | b'\r' => {
                    if self.depth == 0 {
                        self.complete = i + 1;
                    }
                }
                _ => {
                    if self.depth == 0 {
                        self.in_scalar = true;
                    }
                }
            }
        }
        self.scanned = self.buf.len();
    }

    fn reset(&mut self) {
        *self = JsonStream::with_limit(self.limit);
    }
}

fn is_delimiter(byte: u8) -> bool {
    matches!(byte, b' ' | b'\t' | b'\n' | b'\r' | b'{' | b'[' | b'}' | b']' | b'"')
}

/// a stop request, or every handle gone
fn is_stopped(stopped: &Receiver<()>) -> bool {
    !matches!(stopped.try_recv(), Err(TryRecvError::Empty))
}

type UpgradeCallback = Box<dyn FnMut(Arc<Configuration>) + Send>;
type ErrorCallback = Box<dyn FnMut(VbkvError) + Send>;

/// Listens to a configuration feed on a background thread and reports every new
/// [`Configuration`] through `on_upgrade`.
///
/// Failures of the feed itself (connect errors, the stream ending) are reported once
/// through `on_error`, after which the listener stops. Documents that cannot be turned
/// into a configuration are logged and skipped, the feed stays open.
pub struct ConfigurationListener {
    on_upgrade: Option<UpgradeCallback>,
    on_error: Option<ErrorCallback>,
}

/// Handle to a running listener. Dropping every handle stops the listener as well.
#[derive(Debug, Clone)]
pub struct ListenerHandle {
    stop: Sender<()>,
}

impl ListenerHandle {
    /// Stops delivering notifications and closes the feed.
    pub fn stop(&self) {
        let _ = self.stop.try_send(());
    }
}

impl Default for ConfigurationListener {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigurationListener {
    /// creates a listener without callbacks
    pub fn new() -> Self {
        ConfigurationListener {
            on_upgrade: None,
            on_error: None,
        }
    }

    /// registers the callback receiving each new configuration
    pub fn on_upgrade<F>(mut self, callback: F) -> Self
    where
        F: FnMut(Arc<Configuration>) + Send + 'static,
    {
        self.on_upgrade = Some(Box::new(callback));
        self
    }

    /// registers the callback receiving feed failures
    pub fn on_error<F>(mut self, callback: F) -> Self
    where
        F: FnMut(VbkvError) + Send + 'static,
    {
        self.on_error = Some(Box::new(callback));
        self
    }

    /// starts reading the feed described by `options` from `source`
    pub fn listen(self, source: Arc<dyn FeedSource>, options: ConnectOptions) -> Result<ListenerHandle> {
        let (stop, stopped) = channel::bounded(1);
        thread::Builder::new()
            .name("vbkv-config-listener".to_string())
            .spawn(move || self.run(source, options, stopped))?;
        Ok(ListenerHandle { stop })
    }

    #[instrument(skip_all, fields(url = %options.streaming_url()))]
    fn run(mut self, source: Arc<dyn FeedSource>, options: ConnectOptions, stopped: Receiver<()>) {
        let feed = match source.open(&options) {
            Ok(feed) => feed,
            Err(e) => return self.fail(&stopped, e),
        };
        info!("listening for configuration updates");

        let mut json = JsonStream::new();
        loop {
            let chunk = select! {
                recv(stopped) -> _ => {
                    debug!("listener stopped");
                    return;
                }
                recv(feed.chunks) -> chunk => chunk,
            };
            let chunk = match chunk {
                Ok(Ok(chunk)) => chunk,
                Ok(Err(e)) => return self.fail(&stopped, e),
                Err(_) => return self.fail(&stopped, VbkvError::Feed("configuration stream closed".to_string())),
            };
            if is_stopped(&stopped) {
                debug!("listener stopped");
                return;
            }

            for value in json.push(&chunk) {
                match value.and_then(Configuration::from_json) {
                    Ok(Some(config)) => {
                        debug!(
                            bucket = %config.bucket_name,
                            nodes = config.nodes.len(),
                            partitions = config.partition_map.len(),
                            "received configuration"
                        );
                        if let Some(on_upgrade) = self.on_upgrade.as_mut() {
                            on_upgrade(Arc::new(config));
                        }
                    }
                    Ok(None) => debug!("skipping non-object configuration document"),
                    Err(e) => warn!("skipping malformed configuration document: {}", e),
                }
            }
        }
    }

    fn fail(&mut self, stopped: &Receiver<()>, error: VbkvError) {
        if is_stopped(stopped) {
            return;
        }
        warn!("configuration feed failed: {}", error);
        if let Some(on_error) = self.on_error.as_mut() {
            on_error(error);
        }
    }
}
