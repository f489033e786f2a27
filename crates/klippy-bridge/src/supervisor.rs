//! Connection supervision: socket polling, per-connection reader and writer
//! tasks, teardown and reconnect.
//!
//! Each successful connect gets a fresh generation number. Everything bound
//! to a connection (pending requests, handshake steps, state changes) carries
//! that generation so a late arrival from a dead connection can never touch
//! the next one.

use std::{
    ffi::CString,
    os::unix::ffi::OsStrExt,
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use klippy_protocol::{
    Frame, GcodeResponse, Inbound, KlippyCodec, KlippyInfo, KlippyMethod, KlippyNotification,
    KlippyState, OutboundRequest, StatusPayload,
};
use parking_lot::{Mutex, RwLock};
use serde_json::{Map, Value};
use tokio::{
    net::{
        UnixStream,
        unix::{OwnedReadHalf, OwnedWriteHalf},
    },
    sync::{
        broadcast,
        mpsc::{self, UnboundedReceiver, UnboundedSender},
        watch,
    },
    time::{self, MissedTickBehavior},
};
use tokio_util::{
    codec::{FramedRead, FramedWrite},
    sync::CancellationToken,
};
use tracing::{debug, info, trace, warn};

use crate::{
    BridgeConfig, BridgeEvent, Error, FileRegistrar, PeerCredentials, Result,
    dispatch::{Dispatcher, Target},
    events::EVENT_CHANNEL_CAPACITY,
    init::{BridgeState, InitHost, InitOutcome, Initializer},
    pending::{PendingRequests, wait_for_response},
    subscriptions::{ObjectRequest, SubscriptionAggregator},
};

/// Bridge state tagged with the connection generation it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct StateSnapshot {
    /// Connection generation; 0 before the first connect.
    pub(crate) generation: u64,
    /// Lifecycle state.
    pub(crate) state: BridgeState,
}

/// The live connection, as seen by request callers.
struct LiveConnection {
    /// Generation of this connection.
    generation: u64,
    /// Feeds the writer task.
    tx: UnboundedSender<OutboundRequest>,
}

/// Shared bridge internals.
pub(crate) struct Inner {
    /// Settings the bridge was built with.
    pub(crate) config: BridgeConfig,
    /// In-flight requests of the current connection.
    pub(crate) pending: PendingRequests,
    /// Notification routing.
    pub(crate) dispatcher: Dispatcher,
    /// Status subscribers and the merged upstream request.
    pub(crate) subscriptions: SubscriptionAggregator,
    /// Event fan-out.
    pub(crate) events: broadcast::Sender<BridgeEvent>,
    /// Lifecycle state, observed by `connect`, `close` and `wait_ready`.
    pub(crate) state: watch::Sender<StateSnapshot>,
    /// Present while a socket is open.
    conn: Mutex<Option<LiveConnection>>,
    /// Last allocated connection generation.
    generation: AtomicU64,
    /// Cancelled by `close`; parent of every per-connection token.
    pub(crate) shutdown: CancellationToken,
    /// Set once the supervisor task has been spawned.
    pub(crate) started: Mutex<bool>,
    /// Receives the `gcodes` directory after each handshake.
    pub(crate) file_registrar: RwLock<Option<Arc<dyn FileRegistrar>>>,
    /// Latest `info` reply of the current connection.
    pub(crate) info: RwLock<Option<KlippyInfo>>,
    /// Credentials of the process behind the socket.
    pub(crate) peer: RwLock<Option<PeerCredentials>>,
    /// Host state from the latest `info` or `webhooks` push.
    pub(crate) remote_state: RwLock<Option<String>>,
}

impl Inner {
    /// Fresh internals: disconnected, nothing pending.
    pub(crate) fn new(config: BridgeConfig) -> Self {
        let (events, _rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (state, _rx) = watch::channel(StateSnapshot {
            generation: 0,
            state: BridgeState::Connecting,
        });
        Self {
            config,
            pending: PendingRequests::new(),
            dispatcher: Dispatcher::new(),
            subscriptions: SubscriptionAggregator::new(),
            events,
            state,
            conn: Mutex::new(None),
            generation: AtomicU64::new(0),
            shutdown: CancellationToken::new(),
            started: Mutex::new(false),
            file_registrar: RwLock::new(None),
            info: RwLock::new(None),
            peer: RwLock::new(None),
            remote_state: RwLock::new(None),
        }
    }

    /// Publish an event; nobody listening is fine.
    pub(crate) fn emit(&self, event: BridgeEvent) {
        trace!(event = event.name(), "bridge event");
        self.events.send(event).ok();
    }

    /// A socket is open and `close` has not been called.
    pub(crate) fn is_connected(&self) -> bool {
        self.conn.lock().is_some() && !self.shutdown.is_cancelled()
    }

    /// Move to `state` unless a newer connection has already reported.
    /// Only `Connecting` may be published once `generation` no longer owns
    /// the socket. Returns whether the state changed.
    fn set_state(&self, generation: u64, state: BridgeState) -> bool {
        let conn = self.conn.lock();
        let owns_socket = conn.as_ref().is_some_and(|c| c.generation == generation);
        if !owns_socket && state != BridgeState::Connecting {
            return false;
        }
        self.state.send_if_modified(|snap| {
            if generation < snap.generation || snap.state == BridgeState::Closed {
                return false;
            }
            snap.generation = generation;
            snap.state = state;
            true
        })
    }

    /// Send one request and wait for its response. With `generation` set,
    /// the request is only sent on that connection.
    pub(crate) async fn send(
        &self,
        generation: Option<u64>,
        method: &str,
        params: Map<String, Value>,
    ) -> Result<Value> {
        let (generation, tx) = {
            let conn = self.conn.lock();
            match conn.as_ref() {
                Some(c)
                    if generation.is_none_or(|g| g == c.generation)
                        && !self.shutdown.is_cancelled() =>
                {
                    (c.generation, c.tx.clone())
                }
                _ => return Err(Error::NotConnected),
            }
        };
        let (id, rx) = self.pending.insert(generation, method)?;
        trace!(id, method, "sending Klippy request");
        let request = OutboundRequest {
            id,
            method: method.to_string(),
            params,
        };
        if tx.send(request).is_err() {
            self.pending.fail(id, Error::Disconnected);
        }
        wait_for_response(id, method, rx, self.config.pending_log_interval).await
    }

    /// Send the current merged subscription upstream.
    pub(crate) async fn issue_subscribe(
        &self,
        generation: Option<u64>,
        merged: &ObjectRequest,
    ) -> Result<Value> {
        let mut params = Map::new();
        params.insert("objects".into(), merged.to_json());
        params.insert(
            "response_template".into(),
            KlippyNotification::StatusUpdate.response_template(),
        );
        self.send(generation, KlippyMethod::ObjectsSubscribe.as_str(), params)
            .await
    }

    /// Route one inbound notification.
    fn dispatch(&self, method: String, params: Map<String, Value>) {
        match self.dispatcher.lookup(&method) {
            Some(Target::StatusUpdate) => {
                match serde_json::from_value::<StatusPayload>(Value::Object(params)) {
                    Ok(payload) => self.on_status(payload),
                    Err(e) => warn!(error = %e, "malformed status update"),
                }
            }
            Some(Target::GcodeResponse) => {
                match serde_json::from_value::<GcodeResponse>(Value::Object(params)) {
                    Ok(r) => self.emit(BridgeEvent::GcodeResponse(r.response)),
                    Err(e) => warn!(error = %e, "malformed gcode response"),
                }
            }
            Some(Target::Remote(handler)) => {
                tokio::spawn(async move {
                    if let Err(e) = handler.call(params).await {
                        warn!(method = %method, error = %e, "remote method handler failed");
                    }
                });
            }
            None => warn!(method = %method, "no handler for Klippy notification"),
        }
    }

    /// Track host state, fan out to subscribers, then publish.
    fn on_status(&self, payload: StatusPayload) {
        if let Some(state) = payload
            .status
            .get("webhooks")
            .and_then(|w| w.get("state"))
            .and_then(Value::as_str)
        {
            self.track_remote_state(state);
        }
        let payload = Arc::new(payload);
        self.subscriptions.deliver(&payload);
        self.emit(BridgeEvent::StatusUpdate(payload));
    }

    /// Record the host state; emits [`BridgeEvent::Shutdown`] on the
    /// transition into `shutdown`, whether seen in a push or an `info` reply.
    fn track_remote_state(&self, state: &str) {
        let previous = self.remote_state.write().replace(state.to_string());
        if state == KlippyState::SHUTDOWN && previous.as_deref() != Some(KlippyState::SHUTDOWN) {
            warn!("Klippy has shut down");
            self.emit(BridgeEvent::Shutdown);
        }
    }

    /// Drop everything bound to `generation`.
    fn teardown(&self, generation: u64) {
        self.conn.lock().take();
        let failed = self.pending.close(generation);
        self.subscriptions.clear();
        self.info.write().take();
        self.peer.write().take();
        self.remote_state.write().take();
        self.set_state(generation, BridgeState::Connecting);
        info!(generation, failed_requests = failed, "disconnected from Klippy");
        self.emit(BridgeEvent::Disconnected);
    }
}

/// Supervisor task: connect, serve, tear down, repeat until closed.
pub(crate) async fn supervise(inner: Arc<Inner>) {
    while let Some(stream) = wait_for_socket(&inner).await {
        serve(&inner, stream).await;
        if inner.shutdown.is_cancelled() {
            break;
        }
        debug!("reconnecting to Klippy");
    }
    inner.state.send_modify(|snap| snap.state = BridgeState::Closed);
    debug!("Klippy supervisor stopped");
}

/// Poll for the socket until a connection opens. `None` once closed.
async fn wait_for_socket(inner: &Inner) -> Option<UnixStream> {
    let path = &inner.config.socket_path;
    let mut ticker = time::interval(inner.config.connect_poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut access_logged = false;
    loop {
        tokio::select! {
            _ = inner.shutdown.cancelled() => return None,
            _ = ticker.tick() => {}
        }
        if !path.exists() {
            continue;
        }
        if !socket_accessible(path) {
            if !access_logged {
                warn!(socket = %path.display(), "cannot access Klippy socket, check permissions");
                access_logged = true;
            }
            continue;
        }
        access_logged = false;
        let attempt = tokio::select! {
            _ = inner.shutdown.cancelled() => return None,
            res = UnixStream::connect(path) => res,
        };
        match attempt {
            Ok(stream) => return Some(stream),
            Err(e) => trace!(socket = %path.display(), error = %e, "Klippy connect attempt failed"),
        }
    }
}

/// Read and write permission on the socket file for this process.
fn socket_accessible(path: &Path) -> bool {
    let Ok(cpath) = CString::new(path.as_os_str().as_bytes()) else {
        return false;
    };
    // SAFETY: `cpath` is a valid NUL-terminated string for the whole call.
    unsafe { libc::access(cpath.as_ptr(), libc::R_OK | libc::W_OK) == 0 }
}

/// Serve one connection until it drops or the bridge closes.
async fn serve(inner: &Arc<Inner>, stream: UnixStream) {
    let generation = inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
    let peer = match stream.peer_cred() {
        Ok(cred) => Some(PeerCredentials {
            pid: cred.pid(),
            uid: cred.uid(),
            gid: cred.gid(),
        }),
        Err(e) => {
            debug!(error = %e, "peer credentials unavailable");
            None
        }
    };
    *inner.peer.write() = peer;
    info!(
        socket = %inner.config.socket_path.display(),
        generation,
        pid = ?peer.and_then(|p| p.pid),
        "connected to Klippy"
    );

    let (read_half, write_half) = stream.into_split();
    let (tx, rx) = mpsc::unbounded_channel();
    let cancel = inner.shutdown.child_token();
    inner.pending.open(generation);
    *inner.conn.lock() = Some(LiveConnection { generation, tx });
    inner.set_state(generation, BridgeState::Initializing);

    let writer = tokio::spawn(write_loop(inner.clone(), write_half, rx, cancel.clone()));
    let init = tokio::spawn(initialize(inner.clone(), generation));

    read_loop(inner, read_half, &cancel).await;

    cancel.cancel();
    init.abort();
    writer.abort();
    // An aborted task may still be mid-poll on another worker.
    init.await.ok();
    writer.await.ok();
    inner.teardown(generation);
}

/// Drain the outbound queue onto the socket in FIFO order.
async fn write_loop(
    inner: Arc<Inner>,
    write_half: OwnedWriteHalf,
    mut rx: UnboundedReceiver<OutboundRequest>,
    cancel: CancellationToken,
) {
    let mut sink = FramedWrite::new(write_half, KlippyCodec);
    loop {
        let request = tokio::select! {
            _ = cancel.cancelled() => break,
            r = rx.recv() => match r {
                Some(r) => r,
                None => break,
            },
        };
        let id = request.id;
        if let Err(e) = sink.send(request).await {
            warn!(id, error = %e, "write to Klippy socket failed");
            inner.pending.fail(id, Error::Disconnected);
            cancel.cancel();
            break;
        }
    }
}

/// Decode frames until EOF, a read error, or cancellation.
async fn read_loop(inner: &Inner, read_half: OwnedReadHalf, cancel: &CancellationToken) {
    let mut frames = FramedRead::new(read_half, KlippyCodec);
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break,
            f = frames.next() => f,
        };
        match next {
            None => {
                info!("Klippy closed the connection");
                break;
            }
            Some(Err(e)) => {
                warn!(error = %e, "Klippy socket read failed");
                break;
            }
            Some(Ok(Frame::Message(Inbound::Response { id, result }))) => {
                if !inner.pending.resolve(id, result) {
                    warn!(id, "response for unknown request id");
                }
            }
            Some(Ok(Frame::Message(Inbound::Notification { method, params }))) => {
                inner.dispatch(method, params);
            }
            Some(Ok(Frame::Malformed { raw, reason })) => {
                warn!(
                    reason = %reason,
                    raw = %String::from_utf8_lossy(&raw),
                    "dropping malformed Klippy frame"
                );
            }
        }
    }
}

/// Run the handshake for `generation` and publish its outcome.
async fn initialize(inner: Arc<Inner>, generation: u64) {
    let host = ConnHost {
        inner: inner.clone(),
        generation,
    };
    let mut init = Initializer::new(
        &host,
        inner.config.client_info.clone(),
        inner.config.init_retry_interval,
    );
    match init.run().await {
        Ok(InitOutcome::Ready) => {
            if inner.set_state(generation, BridgeState::Ready) {
                info!(generation, "Klippy connection ready");
                inner.emit(BridgeEvent::Ready);
            }
        }
        Ok(InitOutcome::Degraded(message)) => {
            inner.set_state(generation, BridgeState::Degraded(message));
        }
        Err(e) => debug!(generation, error = %e, "initialization interrupted"),
    }
}

/// [`InitHost`] bound to one connection generation.
struct ConnHost {
    /// Shared bridge state.
    inner: Arc<Inner>,
    /// Connection the handshake belongs to.
    generation: u64,
}

#[async_trait]
impl InitHost for ConnHost {
    async fn call(&self, method: KlippyMethod, params: Map<String, Value>) -> Result<Value> {
        self.inner
            .send(Some(self.generation), method.as_str(), params)
            .await
    }

    async fn subscribe_webhooks(&self) -> Result<()> {
        let _upstream = self.inner.subscriptions.lock_upstream().await;
        let merged = self
            .inner
            .subscriptions
            .pin(ObjectRequest::new().with_all("webhooks"));
        self.inner
            .issue_subscribe(Some(self.generation), &merged)
            .await
            .map(|_| ())
    }

    async fn register_directory(&self, root: &str, path: PathBuf) -> Result<()> {
        let registrar = self.inner.file_registrar.read().clone();
        match registrar {
            Some(r) => r.register_directory(root, &path).await,
            None => {
                debug!(root, path = %path.display(), "no file registrar; skipping directory");
                Ok(())
            }
        }
    }

    fn upstream_methods(&self) -> Vec<String> {
        self.inner.dispatcher.upstream_methods()
    }

    fn record_info(&self, info: &KlippyInfo) {
        *self.inner.info.write() = Some(info.clone());
        self.inner.track_remote_state(&info.state);
    }

    fn emit(&self, event: BridgeEvent) {
        self.inner.emit(event);
    }
}
