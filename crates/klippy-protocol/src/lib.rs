//! Wire protocol for the Klippy API socket.
//!
//! Klippy exposes a JSON request/response protocol over a Unix stream socket.
//! Frames are JSON objects terminated by an ETX byte; responses are matched
//! to requests by `id`, and id-less frames are notifications produced by the
//! response templates a client registered.
//!
//! - [`codec`]: the ETX frame codec and inbound message classification.
//! - [`rpc`]: endpoint and notification names plus typed payloads.

pub mod codec;
pub mod rpc;

pub use codec::{ETX, Frame, Inbound, KlippyCodec, OutboundRequest};
pub use rpc::{
    ClientInfo, GcodeResponse, KlippyInfo, KlippyMethod, KlippyNotification, KlippyState,
    StatusPayload, endpoint_for_api_method,
};

/// Default location of the Klippy API socket.
pub const DEFAULT_SOCKET_PATH: &str = "/tmp/klippy_uds";
