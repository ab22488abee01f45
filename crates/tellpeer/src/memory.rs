//! In-process transports.
//!
//! Two peers living in the same process can be wired together with
//! [`DuplexTransport::pair`]. [`MemoryDialer`] hands the far end of every dial to
//! a [`MemoryAcceptor`], which lets a test play the server side of a session.

use std::sync::Mutex;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;

use tokio::sync::mpsc;
use tokio::sync::watch;

use crate::transport;
use crate::transport::Dialer;
use crate::transport::Transport;

/// A duplex channel transport using tokio mpsc channels.
///
/// Frames sent on one end appear on the other end's `recv` and vice versa.
pub struct DuplexTransport {
    tx: Mutex<Option<mpsc::UnboundedSender<String>>>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<String>>,
    closed: watch::Sender<bool>,
}

impl DuplexTransport {
    fn new(tx: mpsc::UnboundedSender<String>, rx: mpsc::UnboundedReceiver<String>) -> Self {
        Self {
            tx: Mutex::new(Some(tx)),
            rx: tokio::sync::Mutex::new(rx),
            closed: watch::Sender::new(false),
        }
    }

    /// Creates a pair of transports connected to each other.
    pub fn pair() -> (Self, Self) {
        let (tx_a, rx_a) = mpsc::unbounded_channel();
        let (tx_b, rx_b) = mpsc::unbounded_channel();
        (Self::new(tx_a, rx_b), Self::new(tx_b, rx_a))
    }
}

#[async_trait::async_trait]
impl Transport for DuplexTransport {
    async fn send(&self, frame: String) -> transport::Result<()> {
        let tx = self
            .tx
            .lock()
            .map_err(|_| transport::Error::Io("sender lock poisoned".into()))?
            .clone();
        let Some(tx) = tx else {
            return Err(transport::Error::ConnectionLost("transport closed".into()));
        };
        tx.send(frame)
            .map_err(|_| transport::Error::ConnectionLost("channel closed".into()))
    }

    async fn recv(&self) -> transport::Result<Option<String>> {
        let mut closed = self.closed.subscribe();
        let mut rx = self.rx.lock().await;
        tokio::select! {
            frame = rx.recv() => Ok(frame),
            _ = closed.wait_for(|closed| *closed) => Ok(None),
        }
    }

    async fn close(&self) {
        if let Ok(mut tx) = self.tx.lock() {
            tx.take();
        }
        self.closed.send_replace(true);
    }
}

/// Receives the far ends of connections made through a [`MemoryDialer`].
pub struct MemoryAcceptor {
    rx: mpsc::UnboundedReceiver<(String, DuplexTransport)>,
}

impl MemoryAcceptor {
    /// Waits for the next dial and returns the dialed url with the server end.
    pub async fn accept(&mut self) -> Option<(String, DuplexTransport)> {
        self.rx.recv().await
    }
}

/// Dialer that connects to an in-process acceptor.
pub struct MemoryDialer {
    acceptor: mpsc::UnboundedSender<(String, DuplexTransport)>,
    refuse: AtomicUsize,
    dials: AtomicUsize,
}

impl MemoryDialer {
    pub fn new() -> (Self, MemoryAcceptor) {
        let (tx, rx) = mpsc::unbounded_channel();
        let dialer = Self {
            acceptor: tx,
            refuse: AtomicUsize::new(0),
            dials: AtomicUsize::new(0),
        };
        (dialer, MemoryAcceptor { rx })
    }

    /// Makes the next `count` dial attempts fail.
    pub fn refuse_next(&self, count: usize) {
        self.refuse.store(count, Ordering::SeqCst);
    }

    /// Number of dial attempts so far, failed ones included.
    pub fn dial_count(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl Dialer for MemoryDialer {
    async fn dial(&self, url: &str) -> transport::Result<Box<dyn Transport>> {
        self.dials.fetch_add(1, Ordering::SeqCst);

        let refused = self
            .refuse
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(transport::Error::Dial(format!("connection refused: {}", url)));
        }

        let (local, remote) = DuplexTransport::pair();
        self.acceptor
            .send((url.to_string(), remote))
            .map_err(|_| transport::Error::Dial(format!("no acceptor listening on {}", url)))?;
        Ok(Box::new(local))
    }
}
