//! # Transport Abstraction
//!
//! A minimal, async interface for moving frames between peers.
//!
//! ## Philosophy
//!
//! - **Frame-Oriented**: The Transport knows nothing about envelopes, callbacks or
//!   replies. It moves opaque text frames in both directions.
//! - **Duplex**: Either side may send at any time; the session's pump owns `recv`.
//! - **Dial is separate**: A [`Dialer`] produces a fresh transport per connection
//!   epoch, so reconnecting never reuses a dead stream.

/// Errors that occur at the network/transport layer.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// The peer is unreachable or the connection was dropped.
    #[error("connection lost: {0}")]
    ConnectionLost(String),
    /// The dial attempt failed.
    #[error("dial failed: {0}")]
    Dial(String),
    /// Generic I/O error or internal transport failure.
    #[error("i/o error: {0}")]
    Io(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// A duplex frame channel to one peer.
///
/// This trait is designed to be object-safe (`Arc<dyn Transport>`).
#[async_trait::async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Sends one frame.
    ///
    /// Must return `Err` if the frame could not be handed to the network.
    async fn send(&self, frame: String) -> Result<()>;

    /// Receives the next frame.
    ///
    /// Returns `Ok(None)` once the stream is closed by either side.
    async fn recv(&self) -> Result<Option<String>>;

    /// Closes the channel. Subsequent `send` calls fail.
    async fn close(&self);
}

/// Opens transports to an address.
#[async_trait::async_trait]
pub trait Dialer: Send + Sync + 'static {
    async fn dial(&self, url: &str) -> Result<Box<dyn Transport>>;
}
