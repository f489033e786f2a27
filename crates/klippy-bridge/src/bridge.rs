use std::{path::PathBuf, sync::Arc, time::Duration};

use klippy_protocol::{
    ClientInfo, DEFAULT_SOCKET_PATH, KlippyInfo, KlippyMethod, StatusPayload,
    endpoint_for_api_method,
};
use serde_json::{Map, Value};
use tokio::sync::broadcast;
use tracing::debug;

use crate::{
    BridgeEvent, Error, FileRegistrar, RemoteMethodHandler, Result, StatusSink, SubscriberId,
    init::BridgeState,
    subscriptions::ObjectRequest,
    supervisor::{Inner, supervise},
};

/// Tunables for a [`KlippyBridge`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeConfig {
    /// Path of the Klippy API socket.
    pub socket_path: PathBuf,
    /// How often to look for the socket while disconnected.
    pub connect_poll_interval: Duration,
    /// Delay between handshake retries.
    pub init_retry_interval: Duration,
    /// How often to log a request that is still waiting for its response.
    pub pending_log_interval: Duration,
    /// Identification sent to Klippy on every new connection.
    pub client_info: ClientInfo,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from(DEFAULT_SOCKET_PATH),
            connect_poll_interval: Duration::from_millis(250),
            init_retry_interval: Duration::from_millis(250),
            pending_log_interval: Duration::from_secs(60),
            client_info: ClientInfo::default(),
        }
    }
}

/// Shortest interval the bridge runs with; `tokio::time::interval` rejects
/// zero.
const MIN_INTERVAL: Duration = Duration::from_millis(1);

impl BridgeConfig {
    /// Default tunables for the socket at `socket_path`.
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            ..Self::default()
        }
    }

    /// Raise every interval to at least [`MIN_INTERVAL`].
    fn clamped(self) -> Self {
        Self {
            connect_poll_interval: self.connect_poll_interval.max(MIN_INTERVAL),
            init_retry_interval: self.init_retry_interval.max(MIN_INTERVAL),
            pending_log_interval: self.pending_log_interval.max(MIN_INTERVAL),
            ..self
        }
    }
}

/// Credentials of the process on the other end of the socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerCredentials {
    /// Not reported on every platform.
    pub pid: Option<i32>,
    /// User id.
    pub uid: u32,
    /// Group id.
    pub gid: u32,
}

/// Handle to the single supervised connection to Klippy.
///
/// Cheap to clone; all clones share one connection. The connection is
/// re-established automatically until [`close`](Self::close) is called.
///
/// ```no_run
/// # async fn demo() -> klippy_bridge::Result<()> {
/// use klippy_bridge::{BridgeConfig, KlippyBridge};
///
/// let bridge = KlippyBridge::new(BridgeConfig::new("/tmp/klippy_uds"));
/// bridge.connect().await?;
/// bridge.wait_ready().await?;
/// let objects = bridge.request("printer.objects.list", Default::default()).await?;
/// println!("{objects}");
/// bridge.close(true).await;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct KlippyBridge {
    /// Shared state, also owned by the supervisor task.
    inner: Arc<Inner>,
}

impl KlippyBridge {
    /// Create a bridge. Nothing happens until [`start`](Self::start) or
    /// [`connect`](Self::connect). Zero intervals are raised to one
    /// millisecond.
    pub fn new(config: BridgeConfig) -> Self {
        Self {
            inner: Arc::new(Inner::new(config.clamped())),
        }
    }

    /// The configuration this bridge was built with.
    pub fn config(&self) -> &BridgeConfig {
        &self.inner.config
    }

    /// Register a method Klippy may call back. Only allowed before
    /// [`start`](Self::start); names are unique.
    ///
    /// With `upstream` set, the name is announced to Klippy through
    /// `register_remote_method` after every successful handshake.
    pub fn register_remote_method(
        &self,
        name: &str,
        handler: Arc<dyn RemoteMethodHandler>,
        upstream: bool,
    ) -> Result<()> {
        self.inner.dispatcher.register(name, handler, upstream)
    }

    /// Set the collaborator that receives the `gcodes` directory once Klippy
    /// is ready.
    pub fn set_file_registrar(&self, registrar: Arc<dyn FileRegistrar>) {
        *self.inner.file_registrar.write() = Some(registrar);
    }

    /// Spawn the connection supervisor. Idempotent; fails once closed.
    pub fn start(&self) -> Result<()> {
        let mut started = self.inner.started.lock();
        if self.inner.shutdown.is_cancelled() {
            return Err(Error::Closed);
        }
        if !*started {
            self.inner.dispatcher.seal();
            tokio::spawn(supervise(self.inner.clone()));
            *started = true;
        }
        Ok(())
    }

    /// Start if needed and wait until a socket connection is open.
    ///
    /// Concurrent callers share the same underlying attempt. Never gives up
    /// on its own; returns [`Error::Closed`] if the bridge is closed first.
    pub async fn connect(&self) -> Result<()> {
        self.start()?;
        let mut rx = self.inner.state.subscribe();
        let snap = rx
            .wait_for(|s| s.state != BridgeState::Connecting)
            .await
            .map_err(|_| Error::Closed)?;
        match snap.state {
            BridgeState::Closed => Err(Error::Closed),
            _ => Ok(()),
        }
    }

    /// Close the connection and stop reconnecting. With `wait`, return only
    /// after teardown has finished. Safe to call repeatedly and
    /// concurrently.
    pub async fn close(&self, wait: bool) {
        {
            let started = self.inner.started.lock();
            self.inner.shutdown.cancel();
            if !*started {
                self.inner
                    .state
                    .send_modify(|s| s.state = BridgeState::Closed);
            }
        }
        if wait {
            let mut rx = self.inner.state.subscribe();
            rx.wait_for(|s| s.state == BridgeState::Closed).await.ok();
        }
    }

    /// True while a socket connection exists and the bridge is not closing.
    pub fn is_connected(&self) -> bool {
        self.inner.is_connected()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> BridgeState {
        self.inner.state.borrow().state.clone()
    }

    /// Wait for the handshake of the current or next connection to finish.
    ///
    /// `Ok` once Klippy is ready; [`Error::NotReady`] if it settled in
    /// another state; [`Error::Disconnected`] if the connection was lost
    /// mid-handshake; [`Error::Closed`] after [`close`](Self::close).
    pub async fn wait_ready(&self) -> Result<()> {
        let mut rx = self.inner.state.subscribe();
        // Generation whose handshake we are waiting on.
        let mut watching: Option<u64> = None;
        loop {
            let snap = rx.borrow_and_update().clone();
            match snap.state {
                BridgeState::Ready => return Ok(()),
                BridgeState::Degraded(message) => return Err(Error::NotReady(message)),
                BridgeState::Closed => return Err(Error::Closed),
                BridgeState::Initializing => match watching {
                    Some(g) if g != snap.generation => return Err(Error::Disconnected),
                    _ => watching = Some(snap.generation),
                },
                BridgeState::Connecting if watching.is_some() => {
                    return Err(Error::Disconnected);
                }
                BridgeState::Connecting => {}
            }
            rx.changed().await.map_err(|_| Error::Closed)?;
        }
    }

    /// Receive every bridge event published from now on.
    pub fn events(&self) -> broadcast::Receiver<BridgeEvent> {
        self.inner.events.subscribe()
    }

    /// Send a request to Klippy and wait for the response.
    ///
    /// `method` may be a front-end name (`printer.objects.list`) or a Klippy
    /// endpoint (`objects/list`). Empty results come back as `"ok"`.
    /// `objects/subscribe` needs a subscriber; use
    /// [`request_for`](Self::request_for) or [`subscribe`](Self::subscribe).
    pub async fn request(&self, method: &str, params: Map<String, Value>) -> Result<Value> {
        let endpoint = endpoint_for_api_method(method);
        if endpoint == KlippyMethod::ObjectsSubscribe.as_str() {
            return Err(Error::NoSubscriber);
        }
        self.inner.send(None, &endpoint, params).await
    }

    /// Like [`request`](Self::request), on behalf of a subscriber.
    /// Subscriptions are routed through the aggregator; the response is the
    /// subscriber's pruned snapshot.
    pub async fn request_for(
        &self,
        sink: Arc<dyn StatusSink>,
        method: &str,
        params: Map<String, Value>,
    ) -> Result<Value> {
        let endpoint = endpoint_for_api_method(method);
        if endpoint != KlippyMethod::ObjectsSubscribe.as_str() {
            return self.inner.send(None, &endpoint, params).await;
        }
        let objects = params
            .get("objects")
            .ok_or_else(|| Error::InvalidParams("missing 'objects'".into()))?;
        let request = ObjectRequest::from_json(objects)?;
        let snapshot = self.subscribe(sink, request).await?;
        Ok(serde_json::to_value(snapshot)?)
    }

    /// Replace the subscription of `sink` and return its current pruned
    /// snapshot. Future status pushes are pruned and sent to `sink`.
    ///
    /// Subscriptions do not survive a reconnect; re-subscribe after the next
    /// [`BridgeEvent::Ready`].
    pub async fn subscribe(
        &self,
        sink: Arc<dyn StatusSink>,
        objects: ObjectRequest,
    ) -> Result<StatusPayload> {
        if !self.inner.is_connected() {
            return Err(Error::NotConnected);
        }
        let id = sink.subscriber_id();
        let subscriptions = &self.inner.subscriptions;
        let _upstream = subscriptions.lock_upstream().await;
        let merged = subscriptions.set(sink, objects.clone());
        let full = match self.inner.issue_subscribe(None, &merged).await {
            Ok(v) => v,
            Err(e) => {
                subscriptions.remove(id);
                return Err(e);
            }
        };
        debug!(subscriber = %id, objects = %objects.to_json(), "subscribed");
        let full: StatusPayload = match full {
            Value::Object(_) => serde_json::from_value(full)?,
            _ => StatusPayload::default(),
        };
        Ok(StatusPayload {
            eventtime: full.eventtime,
            status: objects.prune(&full.status),
        })
    }

    /// Forget a subscriber. The upstream subscription is not re-issued.
    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        self.inner.subscriptions.remove(id)
    }

    /// Number of subscribers currently attached.
    pub fn subscriber_count(&self) -> usize {
        self.inner.subscriptions.len()
    }

    /// Latest `info` response of the current connection.
    pub fn klippy_info(&self) -> Option<KlippyInfo> {
        self.inner.info.read().clone()
    }

    /// Credentials of the Klippy process, when the platform reports them.
    pub fn peer_credentials(&self) -> Option<PeerCredentials> {
        *self.inner.peer.read()
    }

    /// Last host state reported by Klippy (`ready`, `shutdown`, ...).
    pub fn remote_state(&self) -> Option<String> {
        self.inner.remote_state.read().clone()
    }

    /// Number of requests waiting for a response.
    pub fn pending_requests(&self) -> usize {
        self.inner.pending.len()
    }
}
