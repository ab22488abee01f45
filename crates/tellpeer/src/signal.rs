//! Disconnect broadcast, one per connection epoch.
//!
//! Pending calls and the renewal loop subscribe to the current epoch's signal.
//! When the epoch ends the signal fires once for all of them and a fresh one
//! takes its place, so subscribers of the next epoch never see a stale firing.

use std::sync::Mutex;
use std::sync::PoisonError;

use tokio::sync::watch;

pub struct DisconnectBroadcast {
    current: Mutex<watch::Sender<bool>>,
}

impl DisconnectBroadcast {
    pub fn new() -> Self {
        Self {
            current: Mutex::new(watch::Sender::new(false)),
        }
    }

    /// Subscribes to the current epoch.
    pub fn subscribe(&self) -> DisconnectSignal {
        let current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        DisconnectSignal(current.subscribe())
    }

    /// Fires the current signal and installs a fresh one.
    pub fn fire_and_rebuild(&self) {
        let fired = {
            let mut current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
            std::mem::replace(&mut *current, watch::Sender::new(false))
        };
        fired.send_replace(true);
    }
}

impl Default for DisconnectBroadcast {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone)]
pub struct DisconnectSignal(watch::Receiver<bool>);

impl DisconnectSignal {
    /// Resolves once the epoch this signal belongs to has ended.
    pub async fn fired(&mut self) {
        // The sender is only dropped after firing, so an error also means fired.
        let _ = self.0.wait_for(|fired| *fired).await;
    }

    pub fn has_fired(&self) -> bool {
        *self.0.borrow()
    }
}
