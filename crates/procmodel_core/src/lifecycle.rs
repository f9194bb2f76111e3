//! Shutdown signalling shared by background tasks.
//!
//! # Invariants
//! - Once requested, shutdown stays requested.
//! - Dropping the trigger counts as a shutdown request, so tasks never outlive
//!   their owner.

use tokio::sync::watch;

/// Owner side; fires the shutdown request.
#[derive(Debug)]
pub struct ShutdownTrigger {
    sender: watch::Sender<bool>,
}

/// Task side; cheap to clone into every spawned task.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    receiver: watch::Receiver<bool>,
}

/// Creates a connected trigger/signal pair.
pub fn shutdown_channel() -> (ShutdownTrigger, ShutdownSignal) {
    let (sender, receiver) = watch::channel(false);
    (ShutdownTrigger { sender }, ShutdownSignal { receiver })
}

impl ShutdownTrigger {
    pub fn trigger(&self) {
        self.sender.send_replace(true);
    }

    pub fn signal(&self) -> ShutdownSignal {
        ShutdownSignal {
            receiver: self.sender.subscribe(),
        }
    }
}

impl ShutdownSignal {
    pub fn is_requested(&self) -> bool {
        *self.receiver.borrow() || self.receiver.has_changed().is_err()
    }

    /// Resolves once shutdown is requested. Cancel-safe.
    pub async fn requested(&mut self) {
        // `wait_for` errs only when the trigger is gone, which also means stop.
        let _ = self.receiver.wait_for(|requested| *requested).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn trigger_wakes_all_signals() {
        let (trigger, mut first) = shutdown_channel();
        let mut second = trigger.signal();
        assert!(!first.is_requested());

        trigger.trigger();
        tokio::time::timeout(Duration::from_secs(1), first.requested())
            .await
            .unwrap();
        tokio::time::timeout(Duration::from_secs(1), second.requested())
            .await
            .unwrap();
        assert!(second.is_requested());
    }

    #[tokio::test]
    async fn dropped_trigger_counts_as_shutdown() {
        let (trigger, mut signal) = shutdown_channel();
        drop(trigger);
        assert!(signal.is_requested());
        tokio::time::timeout(Duration::from_secs(1), signal.requested())
            .await
            .unwrap();
    }
}
