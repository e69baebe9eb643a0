//! Client context, executor seam and operation builders.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::client::core::{Core, CoreCmd, core_loop};
use crate::client::monitor::{
    EventFn, MonitorConfig, Subscription, SubscriptionInner, WatermarkFn,
};
use crate::client::operation::{OpKind, PutBuildFn, ResultFn};
use crate::error::Error;
use crate::pvrequest::Request;
use crate::utils::{get_default_addr_list, get_default_reconnect_delay};
use crate::value::IValue;

/// Client configuration.
///
/// Name search is delegated to the configured address list: a channel is
/// created against the first server in `addr_list` (standing in for the
/// out-of-scope UDP search phase).
#[derive(Debug, Clone)]
pub struct Config {
    /// Candidate servers, tried in order.
    pub addr_list: Vec<SocketAddr>,
    /// Delay before re-dialling a lost connection.
    pub reconnect_delay: Duration,
}

impl Config {
    /// Configuration from `EPICS_PVA_ADDR_LIST` and friends.
    pub fn from_env() -> Config {
        Config {
            addr_list: get_default_addr_list(),
            reconnect_delay: get_default_reconnect_delay(),
        }
    }

    /// Configuration talking to exactly one known server.
    pub fn with_server(addr: SocketAddr) -> Config {
        Config {
            addr_list: vec![addr],
            reconnect_delay: Duration::from_millis(100),
        }
    }

    pub fn build(self) -> Context {
        Context::new(self)
    }
}

impl Default for Config {
    fn default() -> Self {
        Config::from_env()
    }
}

/// Successful completion of an operation.
#[derive(Debug)]
pub struct OpResult {
    /// The delivered value; empty for PUT.
    pub value: IValue,
    /// Peer which served the operation.
    pub peer: SocketAddr,
}

/// Handle used by builders, operation handles and I/O tasks to run
/// closures on the core task. This is the only way core state is mutated.
#[derive(Clone)]
pub(crate) struct IoHandle {
    tx: mpsc::UnboundedSender<CoreCmd>,
}

impl IoHandle {
    pub(crate) fn call(&self, f: impl FnOnce(&mut Core) + Send + 'static) {
        // send failure means the context is shut down; the closure is
        // dropped unexecuted, which is what cancellation wants anyway
        let _ = self.tx.send(CoreCmd::Call(Box::new(f)));
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    pub(crate) fn conn_event(&self, peer: SocketAddr, ev: crate::client::core::ConnEvent) {
        let _ = self.tx.send(CoreCmd::Conn(peer, ev));
    }
}

/// An independent pvAccess client instance.
///
/// ```no_run
/// # async fn demo() {
/// use pvars::client::Config;
///
/// let ctx = Config::with_server("127.0.0.1:5075".parse().unwrap()).build();
/// let _op = ctx
///     .get("mailbox")
///     .result(|r| println!("{:?}", r.map(|ok| ok.value)))
///     .exec();
/// # }
/// ```
pub struct Context {
    handle: IoHandle,
    cancel: CancellationToken,
    next_token: Arc<AtomicU64>,
}

impl Context {
    /// Spawn a new client core on the current tokio runtime.
    pub fn new(config: Config) -> Context {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = IoHandle { tx };
        let cancel = CancellationToken::new();
        let core = Core::new(config, handle.clone());
        tokio::spawn(core_loop(core, rx, cancel.clone()));
        Context {
            handle,
            cancel,
            next_token: Arc::new(AtomicU64::new(1)),
        }
    }

    fn token(&self) -> u64 {
        self.next_token.fetch_add(1, Ordering::Relaxed)
    }

    /// Request the present value of a PV.
    pub fn get(&self, name: &str) -> GetBuilder {
        GetBuilder {
            handle: self.handle.clone(),
            token: self.token(),
            name: name.to_string(),
            info: false,
            request: Request::new(),
            result: None,
        }
    }

    /// Request type information from a PV. Results in a value with no
    /// marked fields.
    pub fn info(&self, name: &str) -> GetBuilder {
        GetBuilder {
            info: true,
            ..self.get(name)
        }
    }

    /// Request a change of a PV.
    pub fn put(&self, name: &str) -> PutBuilder {
        PutBuilder {
            handle: self.handle.clone(),
            token: self.token(),
            name: name.to_string(),
            request: Request::new(),
            builder: None,
            fetch_present: false,
            result: None,
        }
    }

    /// Subscribe to changes of a PV.
    pub fn monitor(&self, name: &str) -> MonitorBuilder {
        MonitorBuilder {
            handle: self.handle.clone(),
            token: self.token(),
            name: name.to_string(),
            request: Request::new(),
            config: MonitorConfig::default(),
        }
    }

    /// Shut the client down, dropping all connections. Pending operation
    /// callbacks are discarded without being invoked.
    pub fn close(&self) {
        self.cancel.cancel();
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Handle for an in-progress get/info/put operation. Dropping the handle
/// cancels the operation.
pub struct Operation {
    handle: IoHandle,
    token: u64,
}

impl Operation {
    /// Cancel the operation. Idempotent and safe from any thread: the
    /// user callback is detached and will not be invoked.
    pub fn cancel(&self) {
        let token = self.token;
        self.handle.call(move |core| core.cancel_op(token));
    }
}

impl Drop for Operation {
    fn drop(&mut self) {
        debug!("Cancelling operation {} on drop", self.token);
        self.cancel();
    }
}

/// Builder for GET and GET_FIELD operations.
pub struct GetBuilder {
    handle: IoHandle,
    token: u64,
    name: String,
    info: bool,
    request: Request,
    result: Option<ResultFn>,
}

impl GetBuilder {
    /// Select a field to fetch (may be called repeatedly).
    pub fn field(mut self, name: &str) -> Self {
        self.request.field(name);
        self
    }

    /// Set a `record._options` entry.
    pub fn record(mut self, key: &str, value: &str) -> Self {
        self.request.record(key, value);
        self
    }

    /// Fold a pvRequest expression (e.g. `"field(value)record[k=v]"`)
    /// into the request.
    pub fn request(mut self, text: &str) -> Result<Self, Error> {
        self.request.parse(text)?;
        Ok(self)
    }

    /// Use a prebuilt pvRequest value verbatim.
    pub fn raw_request(mut self, value: IValue) -> Self {
        self.request.raw(value);
        self
    }

    pub fn result(
        mut self,
        f: impl FnOnce(Result<OpResult, Error>) + Send + 'static,
    ) -> Self {
        self.result = Some(Box::new(f));
        self
    }

    pub fn exec(self) -> Operation {
        let GetBuilder {
            handle,
            token,
            name,
            info,
            request,
            result,
        } = self;
        let kind = if info {
            OpKind::Info
        } else {
            OpKind::Get {
                request,
                prototype: None,
            }
        };
        handle.call(move |core| core.start_op(token, name, kind, result));
        Operation { handle, token }
    }
}

/// Builder for PUT operations.
pub struct PutBuilder {
    handle: IoHandle,
    token: u64,
    name: String,
    request: Request,
    builder: Option<PutBuildFn>,
    fetch_present: bool,
    result: Option<ResultFn>,
}

impl PutBuilder {
    /// Provide the callback which produces the value to write from the
    /// server's prototype. Required.
    pub fn build(
        mut self,
        f: impl FnOnce(&IValue) -> Result<IValue, Error> + Send + 'static,
    ) -> Self {
        self.builder = Some(Box::new(f));
        self
    }

    /// Fetch the present value first and hand it to the build callback
    /// instead of an empty prototype (wire subcommand GET_PUT).
    pub fn fetch_present(mut self, fetch: bool) -> Self {
        self.fetch_present = fetch;
        self
    }

    pub fn field(mut self, name: &str) -> Self {
        self.request.field(name);
        self
    }

    pub fn record(mut self, key: &str, value: &str) -> Self {
        self.request.record(key, value);
        self
    }

    pub fn request(mut self, text: &str) -> Result<Self, Error> {
        self.request.parse(text)?;
        Ok(self)
    }

    pub fn result(
        mut self,
        f: impl FnOnce(Result<OpResult, Error>) + Send + 'static,
    ) -> Self {
        self.result = Some(Box::new(f));
        self
    }

    pub fn exec(self) -> Operation {
        let PutBuilder {
            handle,
            token,
            name,
            request,
            builder,
            fetch_present,
            result,
        } = self;
        let kind = OpKind::Put {
            request,
            builder,
            fetch_present,
            prototype: None,
        };
        handle.call(move |core| core.start_op(token, name, kind, result));
        Operation { handle, token }
    }
}

/// Builder for MONITOR subscriptions.
pub struct MonitorBuilder {
    handle: IoHandle,
    token: u64,
    name: String,
    request: Request,
    config: MonitorConfig,
}

impl MonitorBuilder {
    /// Suppress the `Connected` pseudo-error from `pop()`.
    pub fn mask_connected(mut self, mask: bool) -> Self {
        self.config.mask_connected = mask;
        self
    }

    /// Suppress the `Disconnected` pseudo-error from `pop()`.
    pub fn mask_disconnected(mut self, mask: bool) -> Self {
        self.config.mask_disconnected = mask;
        self
    }

    /// Bound on the local event FIFO; further updates squash into the
    /// newest entry.
    pub fn queue_size(mut self, limit: usize) -> Self {
        self.config.queue_size = limit.max(1);
        self
    }

    /// Enable pipeline flow control: the server is granted credit in
    /// blocks as events are popped.
    pub fn pipeline(mut self, enable: bool) -> Self {
        self.config.pipeline = enable;
        self
    }

    /// Edge-triggered free-slot watermarks: the callback fires with
    /// `true` when free slots rise above `high` and `false` when they
    /// fall to `low` or below.
    pub fn watermarks(
        mut self,
        low: usize,
        high: usize,
        f: impl Fn(bool) + Send + Sync + 'static,
    ) -> Self {
        let cb: WatermarkFn = Arc::new(f);
        self.config.watermark = Some((low, high, cb));
        self
    }

    /// Callback invoked from the core task whenever the queue becomes
    /// non-empty.
    pub fn event(mut self, f: impl Fn(&Subscription) + Send + Sync + 'static) -> Self {
        let cb: EventFn = Arc::new(f);
        self.config.event = Some(cb);
        self
    }

    pub fn field(mut self, name: &str) -> Self {
        self.request.field(name);
        self
    }

    pub fn record(mut self, key: &str, value: &str) -> Self {
        self.request.record(key, value);
        self
    }

    pub fn request(mut self, text: &str) -> Result<Self, Error> {
        self.request.parse(text)?;
        Ok(self)
    }

    pub fn exec(self) -> Subscription {
        let MonitorBuilder {
            handle,
            token,
            name,
            request,
            config,
        } = self;
        let (sub, inner) = SubscriptionInner::new(handle.clone(), token, &config);
        handle.call(move |core| core.start_monitor(token, name, request, config, inner));
        sub
    }
}
