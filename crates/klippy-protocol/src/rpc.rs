//! Typed RPC definitions for the Klippy API socket.
//!
//! This module defines the endpoint names the bridge calls on Klippy, the
//! notification names Klippy pushes back, and the request/response
//! structures exchanged during the startup handshake.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

/// Klippy endpoints used by the bridge itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KlippyMethod {
    /// Identify the client and query the host state.
    Info,
    /// List the printer objects loaded by Klippy.
    ObjectsList,
    /// Query a set of printer objects once.
    ObjectsQuery,
    /// Subscribe to a set of printer objects.
    ObjectsSubscribe,
    /// Subscribe to gcode terminal output.
    GcodeSubscribeOutput,
    /// Register a method Klippy may call back on the bridge.
    RegisterRemoteMethod,
}

impl KlippyMethod {
    /// Stable endpoint name on the Klippy socket.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::ObjectsList => "objects/list",
            Self::ObjectsQuery => "objects/query",
            Self::ObjectsSubscribe => "objects/subscribe",
            Self::GcodeSubscribeOutput => "gcode/subscribe_output",
            Self::RegisterRemoteMethod => "register_remote_method",
        }
    }
}

/// Notifications Klippy pushes through the response templates the bridge
/// registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KlippyNotification {
    /// Incremental status update for subscribed objects.
    StatusUpdate,
    /// A line of gcode terminal output.
    GcodeResponse,
}

impl KlippyNotification {
    /// Stable method name carried by the notification frame.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StatusUpdate => "process_status_update",
            Self::GcodeResponse => "process_gcode_response",
        }
    }

    /// The `response_template` object that makes Klippy push this
    /// notification.
    pub fn response_template(&self) -> Value {
        json!({ "method": self.as_str() })
    }
}

/// Map a front-end API method such as `printer.objects.list` onto the Klippy
/// endpoint it forwards to (`objects/list`).
///
/// Names that already look like endpoints are returned unchanged.
pub fn endpoint_for_api_method(method: &str) -> String {
    match method.strip_prefix("printer.") {
        Some(rest) if !rest.is_empty() => rest.replace('.', "/"),
        _ => method.to_string(),
    }
}

/// Build the params for a `register_remote_method` request.
pub fn register_remote_method_params(name: &str) -> Map<String, Value> {
    let mut params = Map::new();
    params.insert("response_template".into(), json!({ "method": name }));
    params.insert("remote_method".into(), Value::String(name.to_string()));
    params
}

/// Client identification sent with the first `info` request of a connection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClientInfo {
    /// Program name.
    pub program: String,
    /// Program version.
    pub version: String,
}

impl Default for ClientInfo {
    fn default() -> Self {
        Self {
            program: "Moonbridge".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Typed view of the `info` endpoint response.
///
/// Klippy adds fields over time; everything beyond `state` is optional.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct KlippyInfo {
    /// Host state: `startup`, `ready`, `error` or `shutdown`.
    pub state: String,
    /// Human readable explanation of `state`.
    #[serde(default)]
    pub state_message: String,
    /// Host name of the machine running Klippy.
    #[serde(default)]
    pub hostname: Option<String>,
    /// Klipper version string.
    #[serde(default)]
    pub software_version: Option<String>,
    /// CPU description reported by the host.
    #[serde(default)]
    pub cpu_info: Option<String>,
    /// Klipper checkout directory.
    #[serde(default)]
    pub klipper_path: Option<String>,
    /// Python interpreter running Klippy.
    #[serde(default)]
    pub python_path: Option<String>,
    /// Klippy log file.
    #[serde(default)]
    pub log_file: Option<String>,
    /// Main printer config file.
    #[serde(default)]
    pub config_file: Option<String>,
}

impl KlippyInfo {
    /// True while Klippy is still loading its configuration.
    pub fn is_starting(&self) -> bool {
        self.state == KlippyState::STARTUP
    }

    /// True once Klippy reports it is ready to print.
    pub fn is_ready(&self) -> bool {
        self.state == KlippyState::READY
    }
}

/// Well-known Klippy host states.
pub struct KlippyState;

impl KlippyState {
    /// Configuration is still loading.
    pub const STARTUP: &'static str = "startup";
    /// Ready to accept commands.
    pub const READY: &'static str = "ready";
    /// Emergency stop or MCU shutdown.
    pub const SHUTDOWN: &'static str = "shutdown";
}

/// Params of a `process_status_update` notification, also the shape of an
/// `objects/subscribe` result.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct StatusPayload {
    /// Klippy monotonic clock at the time of the update.
    #[serde(default)]
    pub eventtime: f64,
    /// Object name to field map.
    #[serde(default)]
    pub status: Map<String, Value>,
}

/// Params of a `process_gcode_response` notification.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GcodeResponse {
    /// One or more lines of terminal output.
    pub response: String,
}
