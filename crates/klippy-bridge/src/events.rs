use std::sync::Arc;

use klippy_protocol::{KlippyInfo, StatusPayload};

/// Capacity of the bridge event broadcast channel.
pub(crate) const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Fire-and-forget notifications published by the bridge.
///
/// Delivered over a `tokio::sync::broadcast` channel; slow receivers lag and
/// miss events rather than holding up the connection.
#[derive(Debug, Clone)]
pub enum BridgeEvent {
    /// The identification request of a new connection succeeded.
    Identified(KlippyInfo),
    /// Klippy left the `startup` state; carries the state it settled in.
    Started {
        /// Settled host state (`ready`, `error`, `shutdown`).
        state: String,
    },
    /// The handshake finished and Klippy is ready.
    Ready,
    /// Klippy reported a transition to `shutdown`.
    Shutdown,
    /// The connection was lost or closed.
    Disconnected,
    /// Gcode terminal output.
    GcodeResponse(String),
    /// Raw (unpruned) status push.
    StatusUpdate(Arc<StatusPayload>),
}

impl BridgeEvent {
    /// Short event name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Identified(_) => "identified",
            Self::Started { .. } => "started",
            Self::Ready => "ready",
            Self::Shutdown => "shutdown",
            Self::Disconnected => "disconnected",
            Self::GcodeResponse(_) => "gcode_response",
            Self::StatusUpdate(_) => "status_update",
        }
    }
}
