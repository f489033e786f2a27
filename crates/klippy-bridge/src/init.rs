//! Post-connect handshake.
//!
//! Every new connection walks the same ordered milestones: subscribe to
//! `webhooks`, subscribe to gcode output, identify, then wait for Klippy to
//! leave `startup`. Each step is retried on a fixed interval until it
//! succeeds; a milestone, once reached, is never repeated on the same
//! connection. The initializer only talks to the rest of the bridge through
//! [`InitHost`], which keeps it testable without a socket.

use std::{
    collections::BTreeSet,
    env,
    path::{Path, PathBuf},
    time::Duration,
};

use async_trait::async_trait;
use klippy_protocol::{
    ClientInfo, KlippyInfo, KlippyMethod, KlippyNotification, rpc::register_remote_method_params,
};
use serde_json::{Map, Value, json};
use tokio::time;
use tracing::{debug, info, warn};

use crate::{BridgeEvent, Result, throttle::LogThrottle};

/// Printer objects the front end needs for full functionality.
pub const REQUIRED_OBJECTS: [&str; 3] = ["virtual_sdcard", "display_status", "pause_resume"];

/// Repeated step failures are logged once per this many attempts.
const FAILURE_LOG_EVERY: u32 = 20;

/// Handshake milestones, in the order they are reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Milestone {
    /// `webhooks` is part of the upstream subscription.
    WebhooksSubscribed,
    /// Gcode output is routed to the bridge.
    GcodeOutputSubscribed,
    /// The identification request succeeded.
    Identified,
    /// Klippy left the `startup` state.
    StartupComplete,
}

impl Milestone {
    /// Name used in logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::WebhooksSubscribed => "webhooks-subscribed",
            Self::GcodeOutputSubscribed => "gcode-output-subscribed",
            Self::Identified => "identified",
            Self::StartupComplete => "startup-complete",
        }
    }
}

/// Milestones reached on the current connection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InitProgress {
    /// Reached so far.
    reached: BTreeSet<Milestone>,
}

impl InitProgress {
    /// Record `m`; returns false if it was already reached.
    pub fn mark(&mut self, m: Milestone) -> bool {
        self.reached.insert(m)
    }

    /// Whether `m` has been reached.
    pub fn has(&self, m: Milestone) -> bool {
        self.reached.contains(&m)
    }

    /// True once all four milestones are present.
    pub fn is_complete(&self) -> bool {
        self.reached.len() == 4
    }
}

/// Bridge lifecycle as seen by callers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeState {
    /// Waiting for the socket to appear or accept a connection.
    Connecting,
    /// Connected; handshake in progress.
    Initializing,
    /// Handshake finished and Klippy is ready.
    Ready,
    /// Klippy settled in a state other than `ready`. Requests are still
    /// served.
    Degraded(String),
    /// The bridge was closed and will not reconnect.
    Closed,
}

impl BridgeState {
    /// Handshake finished and Klippy is ready.
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready)
    }
}

/// How a handshake ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum InitOutcome {
    /// Ready; remote methods registered.
    Ready,
    /// Settled in another state, with Klippy's explanation.
    Degraded(String),
}

/// External collaborator that owns file roots.
#[async_trait]
pub trait FileRegistrar: Send + Sync + 'static {
    /// Register `path` as the directory backing `root` (e.g. `gcodes`).
    async fn register_directory(&self, root: &str, path: &Path) -> Result<()>;
}

/// What the initializer needs from the bridge.
#[async_trait]
pub(crate) trait InitHost: Send + Sync {
    /// Issue a request on the current connection.
    async fn call(&self, method: KlippyMethod, params: Map<String, Value>) -> Result<Value>;
    /// Pin `webhooks` into the merged subscription and send it upstream.
    async fn subscribe_webhooks(&self) -> Result<()>;
    /// Forward to the file registrar, if any.
    async fn register_directory(&self, root: &str, path: PathBuf) -> Result<()>;
    /// Remote methods to announce to Klippy.
    fn upstream_methods(&self) -> Vec<String>;
    /// Remember the latest `info` response.
    fn record_info(&self, info: &KlippyInfo);
    /// Publish a bridge event.
    fn emit(&self, event: BridgeEvent);
}

/// Handshake driver for one connection.
pub(crate) struct Initializer<'a, H: ?Sized> {
    /// Connection the steps run against.
    host: &'a H,
    /// Sent with the one identification request.
    client_info: ClientInfo,
    /// Pause between passes.
    retry: Duration,
    /// Milestones reached on this connection.
    progress: InitProgress,
    /// Rate limit for step failure warnings.
    failures: LogThrottle,
}

impl<'a, H: InitHost + ?Sized> Initializer<'a, H> {
    /// Handshake for a fresh connection; nothing reached yet.
    pub(crate) fn new(host: &'a H, client_info: ClientInfo, retry: Duration) -> Self {
        Self {
            host,
            client_info,
            retry,
            progress: InitProgress::default(),
            failures: LogThrottle::new(FAILURE_LOG_EVERY),
        }
    }

    /// Milestones reached so far.
    #[cfg(test)]
    pub(crate) fn progress(&self) -> &InitProgress {
        &self.progress
    }

    /// Drive the handshake to an outcome. Only a lost connection ends it
    /// early.
    pub(crate) async fn run(&mut self) -> Result<InitOutcome> {
        loop {
            match self.step().await {
                Ok(Some(outcome)) => return Ok(outcome),
                Ok(None) => self.failures.reset(),
                Err(e) if e.is_disconnect() => return Err(e),
                Err(e) => {
                    if self.failures.hit() {
                        warn!(
                            error = %e,
                            attempts = self.failures.count(),
                            "Klippy initialization step failed, retrying"
                        );
                    }
                }
            }
            time::sleep(self.retry).await;
        }
    }

    /// One pass over the milestones. `None` means Klippy is still starting.
    async fn step(&mut self) -> Result<Option<InitOutcome>> {
        if !self.progress.has(Milestone::WebhooksSubscribed) {
            self.host.subscribe_webhooks().await?;
            self.reach(Milestone::WebhooksSubscribed);
        }

        if !self.progress.has(Milestone::GcodeOutputSubscribed) {
            let mut params = Map::new();
            params.insert(
                "response_template".into(),
                KlippyNotification::GcodeResponse.response_template(),
            );
            self.host
                .call(KlippyMethod::GcodeSubscribeOutput, params)
                .await?;
            self.reach(Milestone::GcodeOutputSubscribed);
        }

        // The first info request of a connection doubles as identification.
        let identify = !self.progress.has(Milestone::Identified);
        let mut params = Map::new();
        if identify {
            params.insert("client_info".into(), serde_json::to_value(&self.client_info)?);
        }
        let raw = self.host.call(KlippyMethod::Info, params).await?;
        let info: KlippyInfo = serde_json::from_value(raw)?;
        self.host.record_info(&info);

        if identify {
            self.reach(Milestone::Identified);
            info!(
                state = %info.state,
                version = info.software_version.as_deref().unwrap_or("unknown"),
                "identified with Klippy"
            );
            self.host.emit(BridgeEvent::Identified(info.clone()));
        }

        if info.is_starting() {
            return Ok(None);
        }

        self.reach(Milestone::StartupComplete);
        self.host.emit(BridgeEvent::Started {
            state: info.state.clone(),
        });

        if !info.is_ready() {
            let message = match info.state_message.trim() {
                "" => info.state.clone(),
                m => m.to_string(),
            };
            warn!(state = %info.state, "Klippy not ready: {message}");
            return Ok(Some(InitOutcome::Degraded(message)));
        }

        self.verify_objects().await;
        self.register_gcodes_dir().await;
        self.register_remote_methods().await;
        debug_assert!(self.progress.is_complete());
        Ok(Some(InitOutcome::Ready))
    }

    /// Record a milestone, logging it the first time.
    fn reach(&mut self, m: Milestone) {
        if self.progress.mark(m) {
            debug!(milestone = m.as_str(), "initialization milestone reached");
        }
    }

    /// Warn about required objects missing from `objects/list`.
    async fn verify_objects(&self) {
        let listed = match self.host.call(KlippyMethod::ObjectsList, Map::new()).await {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "unable to list Klippy objects");
                return;
            }
        };
        let loaded: Vec<&str> = listed
            .get("objects")
            .and_then(Value::as_array)
            .map(|objs| objs.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default();
        let missing: Vec<&str> = REQUIRED_OBJECTS
            .iter()
            .copied()
            .filter(|o| !loaded.contains(o))
            .collect();
        if !missing.is_empty() {
            warn!(
                missing = ?missing,
                "Klippy config lacks sections required for full functionality"
            );
        }
    }

    /// Hand the `virtual_sdcard` path to the file registrar, best effort.
    async fn register_gcodes_dir(&self) {
        let mut params = Map::new();
        params.insert("objects".into(), json!({ "configfile": ["settings"] }));
        let settings = match self.host.call(KlippyMethod::ObjectsQuery, params).await {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "unable to query Klippy configfile settings");
                return;
            }
        };
        let Some(path) = settings
            .pointer("/status/configfile/settings/virtual_sdcard/path")
            .and_then(Value::as_str)
        else {
            debug!("no virtual_sdcard path configured");
            return;
        };
        let path = expand_home(path);
        if let Err(e) = self.host.register_directory("gcodes", path.clone()).await {
            warn!(error = %e, path = %path.display(), "failed to register gcodes directory");
        }
    }

    /// Announce every upstream remote method to Klippy.
    async fn register_remote_methods(&self) {
        for name in self.host.upstream_methods() {
            let params = register_remote_method_params(&name);
            match self
                .host
                .call(KlippyMethod::RegisterRemoteMethod, params)
                .await
            {
                Ok(_) => debug!(method = %name, "registered remote method"),
                Err(e) => warn!(method = %name, error = %e, "failed to register remote method"),
            }
        }
    }
}

/// Expand a leading `~` the way Klippy's own config loader does.
fn expand_home(path: &str) -> PathBuf {
    let rest = match path.strip_prefix('~') {
        Some(rest) if rest.is_empty() || rest.starts_with('/') => rest,
        _ => return PathBuf::from(path),
    };
    match env::var_os("HOME") {
        Some(home) => PathBuf::from(home).join(rest.trim_start_matches('/')),
        None => PathBuf::from(path),
    }
}
