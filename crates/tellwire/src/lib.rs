//! # Tellwire
//!
//! The wire vocabulary spoken between peers.
//!
//! ## Architecture
//!
//! Every outbound call carries a single envelope argument that authenticates the
//! caller (`kite` + `authentication`) and holds the application arguments
//! (`withArgs`) next to the continuation the peer must invoke with its reply.
//! Replies are `{result, error}` objects delivered through that continuation.
//!
//! Messages themselves are JSON frames in which continuations are replaced by a
//! placeholder and listed by id in a side table, so that the receiver can turn
//! them back into callable handles.

pub mod auth;
pub mod envelope;
pub mod error;
pub mod frame;
pub mod identity;


pub use auth::Authentication;
pub use envelope::CallEnvelope;
pub use envelope::CallbackEnvelope;
pub use envelope::Reply;
pub use error::CallError;
pub use error::Error;
pub use error::ErrorKind;
pub use error::Result;
pub use frame::CALLBACK_PLACEHOLDER;
pub use frame::Message;
pub use frame::Method;
pub use frame::Path;
pub use frame::PathSegment;
pub use identity::Identity;
