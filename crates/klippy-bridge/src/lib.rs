//! Supervised, multiplexed connection to the Klippy API socket.
//!
//! A [`KlippyBridge`] owns the one Unix socket connection to Klippy and
//! shares it between any number of concurrent callers:
//!
//! - requests are correlated with their responses by id, and never time out;
//! - many status subscribers are merged into Klippy's single subscription and
//!   each push is pruned back to what each subscriber asked for;
//! - every new connection runs a readiness handshake before the bridge is
//!   declared ready;
//! - a lost connection fails every in-flight request, drops all subscribers
//!   and reconnects until the bridge is closed.
//!
//! Lifecycle changes and unsolicited output are published as
//! [`BridgeEvent`]s.

mod bridge;
mod dispatch;
mod error;
mod events;
mod init;
mod pending;
mod subscriptions;
mod supervisor;
mod throttle;

pub use bridge::{BridgeConfig, KlippyBridge, PeerCredentials};
pub use dispatch::{FnHandler, RemoteMethodHandler, handler_fn};
pub use error::{Error, Result};
pub use events::BridgeEvent;
pub use init::{BridgeState, FileRegistrar, REQUIRED_OBJECTS};
pub use klippy_protocol::{ClientInfo, KlippyInfo, StatusPayload};
pub use subscriptions::{ChannelSink, FieldSet, ObjectRequest, StatusSink, SubscriberId};
