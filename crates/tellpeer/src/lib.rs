//! # Tellpeer
//!
//! Client side of a peer-to-peer RPC engine: call methods on a remote peer over a
//! duplex connection and get exactly one outcome back per call.
//!
//! ## Architecture
//!
//! - [`session`]: owns the live connection and its callback registry, routes
//!   inbound frames, and reconnects.
//! - [`dispatch`]: the per-call task racing reply, disconnect and timeout.
//! - [`adapter`]: wraps arguments into envelopes and takes them apart again.
//! - [`renewal`]: keeps the connection's token fresh while it is up.
//! - [`transport`]: the frame channel underneath, with [`ws`] and [`memory`]
//!   implementations.

pub mod adapter;
pub mod args;
pub mod config;
pub mod connection;
pub mod credential;
pub mod dispatch;
pub mod memory;
pub mod registry;
pub mod renewal;
pub mod session;
pub mod signal;
pub mod transport;
pub mod ws;

pub use adapter::IncomingCall;
pub use args::Arg;
pub use args::RemoteCallback;
pub use args::Request;
pub use config::PeerConfig;
pub use config::SessionConfig;
pub use connection::PeerConnection;
pub use connection::PeerConnectionBuilder;
pub use connection::RemotePeer;
pub use credential::Credential;
pub use credential::SharedCredential;
pub use credential::TrustedIssuers;
pub use dispatch::PendingReply;
pub use registry::Callback;
pub use session::HookId;
pub use session::Session;
pub use session::SessionError;
pub use session::SessionState;

pub use tellwire;
