//! In-process stand-in for Klippy's API socket.
#![allow(dead_code)]

use std::{
    env, fs, mem,
    os::fd::AsRawFd,
    path::{Path, PathBuf},
    process,
    sync::{
        Arc,
        atomic::{AtomicU32, AtomicUsize, Ordering},
    },
    time::Duration,
};

use futures::{SinkExt, StreamExt};
use klippy_bridge::{BridgeConfig, BridgeEvent, FileRegistrar, Result};
use klippy_protocol::ETX;
use parking_lot::Mutex;
use serde_json::{Map, Value, json};
use tokio::{
    net::{UnixListener, UnixStream},
    sync::{broadcast, mpsc},
    time::{Instant, sleep, timeout},
};
use tokio_util::{
    codec::{AnyDelimiterCodec, Framed},
    sync::CancellationToken,
};

/// Per-test scratch directory.
pub fn tmpdir(label: &str) -> PathBuf {
    let dir = env::temp_dir().join(format!(
        "moonbridge-test-{}-{}-{label}",
        unsafe { libc::getuid() },
        process::id()
    ));
    fs::remove_dir_all(&dir).ok();
    fs::create_dir_all(&dir).unwrap();
    dir
}

/// Bridge settings with short intervals so tests settle quickly.
pub fn fast_config(socket: &Path) -> BridgeConfig {
    BridgeConfig {
        connect_poll_interval: Duration::from_millis(10),
        init_retry_interval: Duration::from_millis(10),
        ..BridgeConfig::new(socket)
    }
}

/// Wait for the first event matching `pred`, skipping the rest.
pub async fn next_event<F>(rx: &mut broadcast::Receiver<BridgeEvent>, pred: F) -> BridgeEvent
where
    F: Fn(&BridgeEvent) -> bool,
{
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let left = deadline.saturating_duration_since(Instant::now());
        match timeout(left, rx.recv()).await {
            Ok(Ok(ev)) if pred(&ev) => return ev,
            Ok(Ok(_)) | Ok(Err(broadcast::error::RecvError::Lagged(_))) => {}
            Ok(Err(broadcast::error::RecvError::Closed)) => panic!("event channel closed"),
            Err(_) => panic!("timed out waiting for bridge event"),
        }
    }
}

/// Poll `cond` until it holds or five seconds pass.
pub async fn eventually<F: Fn() -> bool>(what: &str, cond: F) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        if Instant::now() >= deadline {
            panic!("timed out waiting for {what}");
        }
        sleep(Duration::from_millis(5)).await;
    }
}

/// File registrar that records what it was given.
#[derive(Default)]
pub struct RecordingRegistrar {
    pub dirs: Mutex<Vec<(String, PathBuf)>>,
}

#[async_trait::async_trait]
impl FileRegistrar for RecordingRegistrar {
    async fn register_directory(&self, root: &str, path: &Path) -> Result<()> {
        self.dirs.lock().push((root.to_string(), path.to_path_buf()));
        Ok(())
    }
}

/// One request as the fake received it.
#[derive(Debug, Clone)]
pub struct Received {
    pub id: u64,
    pub method: String,
    pub params: Map<String, Value>,
}

/// Frames queued for every open connection.
enum Outgoing {
    Json(Value),
    Raw(String),
}

struct Shared {
    /// `info` answers left that report `startup`.
    startup_polls: AtomicU32,
    /// State reported once startup is over, with its message.
    settled: Mutex<(String, String)>,
    /// Object store served by `objects/subscribe`.
    objects: Mutex<Map<String, Value>>,
    requests: Mutex<Vec<Received>>,
    pushers: Mutex<Vec<mpsc::UnboundedSender<Outgoing>>>,
    /// Cancelling drops every connection accepted so far.
    epoch: Mutex<CancellationToken>,
    connections: AtomicUsize,
    /// Close the connection right after answering this method.
    hang_up_after: Mutex<Option<String>>,
}

impl Shared {
    fn reply(&self, req: &Value) -> Option<Value> {
        let id = req.get("id")?.as_u64()?;
        let method = req.get("method")?.as_str()?.to_string();
        let params = req
            .get("params")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        self.requests.lock().push(Received {
            id,
            method: method.clone(),
            params: params.clone(),
        });

        let result = match method.as_str() {
            "info" => {
                let starting = self
                    .startup_polls
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok();
                let (state, message) = if starting {
                    ("startup".to_string(), "Printer is starting".to_string())
                } else {
                    self.settled.lock().clone()
                };
                json!({
                    "state": state,
                    "state_message": message,
                    "hostname": "fakehost",
                    "software_version": "v0.12.0-fake",
                    "config_file": "/home/pi/printer.cfg",
                })
            }
            "objects/subscribe" => {
                let wanted = params.get("objects").cloned().unwrap_or(Value::Null);
                json!({"eventtime": 100.5, "status": self.query(&wanted)})
            }
            "objects/query" => {
                let wanted = params.get("objects").cloned().unwrap_or(Value::Null);
                json!({"eventtime": 100.5, "status": self.query(&wanted)})
            }
            "objects/list" => {
                let names: Vec<String> = self.objects.lock().keys().cloned().collect();
                json!({ "objects": names })
            }
            "gcode/subscribe_output" | "register_remote_method" | "stop_reading" => json!({}),
            "echo" => Value::Object(params),
            "fail" => {
                return Some(json!({
                    "id": id,
                    "error": {"error": "WebRequestError", "message": "fake failure"},
                }));
            }
            "hold" => return None,
            other => {
                return Some(json!({"id": id, "error": format!("unknown endpoint {other}")}));
            }
        };
        Some(json!({"id": id, "result": result}))
    }

    /// Answer an object query the way Klippy does: `null` selects every
    /// field, a list selects the named ones.
    fn query(&self, wanted: &Value) -> Value {
        let store = self.objects.lock();
        let mut out = Map::new();
        let Some(wanted) = wanted.as_object() else {
            return Value::Object(out);
        };
        for (name, fields) in wanted {
            let Some(Value::Object(obj)) = store.get(name) else {
                continue;
            };
            let picked = match fields.as_array() {
                None => obj.clone(),
                Some(list) => obj
                    .iter()
                    .filter(|(k, _)| list.iter().any(|f| f.as_str() == Some(k.as_str())))
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
            };
            out.insert(name.clone(), Value::Object(picked));
        }
        Value::Object(out)
    }

    fn push(&self, make: impl Fn() -> Outgoing) {
        let mut pushers = self.pushers.lock();
        pushers.retain(|tx| tx.send(make()).is_ok());
    }
}

/// Fake Klippy listening on a Unix socket.
pub struct FakeKlippy {
    pub path: PathBuf,
    shared: Arc<Shared>,
    server: CancellationToken,
}

impl FakeKlippy {
    /// Listen at `dir/klippy_uds`. Klippy reports `ready` immediately.
    pub fn start(dir: &Path) -> Self {
        let path = dir.join("klippy_uds");
        let mut objects = Map::new();
        objects.insert(
            "webhooks".into(),
            json!({"state": "ready", "state_message": "Printer is ready"}),
        );
        objects.insert(
            "toolhead".into(),
            json!({"position": [0.0, 0.0, 0.0, 0.0], "velocity": 5, "homed_axes": ""}),
        );
        objects.insert("extruder".into(), json!({"temperature": 21.5, "target": 0}));
        objects.insert(
            "configfile".into(),
            json!({"settings": {"virtual_sdcard": {"path": "/home/pi/gcodes"}}}),
        );
        for name in ["virtual_sdcard", "display_status", "pause_resume"] {
            objects.insert(name.into(), json!({}));
        }
        let shared = Arc::new(Shared {
            startup_polls: AtomicU32::new(0),
            settled: Mutex::new(("ready".into(), "Printer is ready".into())),
            objects: Mutex::new(objects),
            requests: Mutex::new(Vec::new()),
            pushers: Mutex::new(Vec::new()),
            epoch: Mutex::new(CancellationToken::new()),
            connections: AtomicUsize::new(0),
            hang_up_after: Mutex::new(None),
        });
        let fake = Self {
            path,
            shared,
            server: CancellationToken::new(),
        };
        fake.listen();
        fake
    }

    fn listen(&self) {
        fs::remove_file(&self.path).ok();
        let listener = UnixListener::bind(&self.path).unwrap();
        let shared = self.shared.clone();
        let server = self.server.clone();
        tokio::spawn(async move {
            loop {
                let stream = tokio::select! {
                    _ = server.cancelled() => break,
                    res = listener.accept() => match res {
                        Ok((stream, _)) => stream,
                        Err(_) => break,
                    },
                };
                shared.connections.fetch_add(1, Ordering::SeqCst);
                let token = shared.epoch.lock().child_token();
                tokio::spawn(serve_conn(shared.clone(), stream, token));
            }
        });
    }

    /// Report `startup` for the next `n` info requests.
    pub fn set_startup_polls(&self, n: u32) {
        self.shared.startup_polls.store(n, Ordering::SeqCst);
    }

    /// State reported after startup.
    pub fn set_settled_state(&self, state: &str, message: &str) {
        *self.shared.settled.lock() = (state.into(), message.into());
    }

    /// Close each connection right after replying to `method`.
    pub fn hang_up_after(&self, method: &str) {
        *self.shared.hang_up_after.lock() = Some(method.to_string());
    }

    /// Every request received so far, in arrival order.
    pub fn requests(&self) -> Vec<Received> {
        self.shared.requests.lock().clone()
    }

    /// Requests received for `method`.
    pub fn requests_for(&self, method: &str) -> Vec<Received> {
        self.requests()
            .into_iter()
            .filter(|r| r.method == method)
            .collect()
    }

    /// Number of connections accepted so far.
    pub fn connections(&self) -> usize {
        self.shared.connections.load(Ordering::SeqCst)
    }

    /// Push a status update to every connected client.
    pub fn push_status(&self, status: Value) {
        self.notify("process_status_update", json!({"eventtime": 200.25, "status": status}));
    }

    /// Push an id-less notification.
    pub fn notify(&self, method: &str, params: Value) {
        let frame = json!({"method": method, "params": params});
        self.shared.push(|| Outgoing::Json(frame.clone()));
    }

    /// Push bytes that are not a valid frame.
    pub fn push_raw(&self, raw: &str) {
        self.shared.push(|| Outgoing::Raw(raw.to_string()));
    }

    /// Close every open connection but keep listening.
    pub fn drop_connections(&self) {
        let old = mem::replace(&mut *self.shared.epoch.lock(), CancellationToken::new());
        old.cancel();
    }

    /// Stop listening, drop connections and remove the socket.
    pub fn stop(&self) {
        self.server.cancel();
        self.drop_connections();
        fs::remove_file(&self.path).ok();
    }
}

impl Drop for FakeKlippy {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn serve_conn(shared: Arc<Shared>, stream: UnixStream, cancel: CancellationToken) {
    let mut framed = Framed::new(stream, AnyDelimiterCodec::new(vec![ETX], vec![ETX]));
    let (tx, mut rx) = mpsc::unbounded_channel();
    shared.pushers.lock().push(tx);
    loop {
        let mut hang_up = false;
        let mut deaf = false;
        let out = tokio::select! {
            _ = cancel.cancelled() => break,
            Some(push) = rx.recv() => match push {
                Outgoing::Json(v) => v.to_string(),
                Outgoing::Raw(s) => s,
            },
            frame = framed.next() => {
                let Some(Ok(bytes)) = frame else { break };
                let Ok(req) = serde_json::from_slice::<Value>(&bytes) else { continue };
                let method = req.get("method").and_then(Value::as_str).unwrap_or_default();
                hang_up = shared.hang_up_after.lock().as_deref() == Some(method);
                if method == "stop_reading" {
                    // Shut the read side before replying so the client's
                    // next write fails with EPIPE.
                    unsafe { libc::shutdown(framed.get_ref().as_raw_fd(), libc::SHUT_RD) };
                    deaf = true;
                }
                match shared.reply(&req) {
                    Some(reply) => reply.to_string(),
                    None => continue,
                }
            }
        };
        if framed.send(out).await.is_err() || hang_up {
            break;
        }
        if deaf {
            // Keep the connection open without reading until dropped.
            cancel.cancelled().await;
            break;
        }
    }
}
