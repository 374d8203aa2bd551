//! Client side of the socket bridge to a running Harmony session.
//!
//! This crate provides:
//! - A length-prefixed frame codec for JSON envelopes ([`codec`])
//! - The call / reply / error envelopes themselves ([`protocol`])
//! - A single-threaded client that sends calls, waits for correlated replies
//!   and serves calls from the peer through registered callbacks ([`client`])
//! - A typed facade over the application's commands ([`application`]) and
//!   the engine event callbacks ([`engine`])
//!
//! # Wire format
//!
//! Each message is a 4-byte big-endian length followed by that many bytes of
//! JSON text. The peer reads UTF-16BE and writes UTF-8 by default; both are
//! configurable.
//!
//! # Usage
//!
//! ```rust,ignore
//! use harmony_bridge::{params, BridgeClient};
//! use harmony_core::{BridgeConfig, Endpoint};
//!
//! let config = BridgeConfig::default();
//! let endpoint = Endpoint { host: "127.0.0.1".into(), port: 5151 };
//! let client = BridgeClient::tcp(&endpoint, &config);
//! client.connect()?;
//!
//! client.register_callback("PING", |_, _| Ok(Some(true.into())));
//! let range = client.call_and_wait("GET_FRAME_RANGE", params! {})?;
//! ```

pub mod application;
pub mod client;
pub mod codec;
pub mod dispatcher;
pub mod engine;
pub mod pending;
pub mod protocol;
pub mod transport;

pub use application::{
    Application, Compatibility, FrameRange, HostInfo, RenderOptions, ResourceKind,
    UnknownResourceKind, MIN_SUPPORTED_VERSION,
};
pub use client::{BridgeClient, BridgeError, ClientOptions};
pub use codec::{CodecError, FrameCodec, FramingLost};
pub use dispatcher::{CallbackError, CallbackResult};
pub use engine::{register_engine_callbacks, EngineHandler, MenuPosition};
pub use protocol::{Message, Params, RemoteError, RequestId};
pub use transport::{ConnectionState, TcpTransport, Transport, TransportError};

#[doc(hidden)]
pub mod __private {
    pub use serde_json::json;
}
