//! Cooperative shutdown shared by the control loops.
//!
//! A shutdown request interrupts both loops between ticks and at every
//! stabilisation or draining sleep; in-flight commands run to completion
//! under their own timeouts.

use std::time::Duration;
use tokio::sync::watch;

pub fn shutdown_channel() -> (ShutdownHandle, ShutdownSignal) {
    let (tx, rx) = watch::channel(false);
    (ShutdownHandle { tx }, ShutdownSignal { rx })
}

#[derive(Debug)]
pub struct ShutdownHandle {
    tx: watch::Sender<bool>,
}

impl ShutdownHandle {
    pub fn trigger(&self) {
        let _ = self.tx.send(true);
    }

    pub fn subscribe(&self) -> ShutdownSignal {
        ShutdownSignal {
            rx: self.tx.subscribe(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

impl ShutdownSignal {
    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once shutdown is requested.
    pub async fn wait(&mut self) {
        if *self.rx.borrow() {
            return;
        }
        while self.rx.changed().await.is_ok() {
            if *self.rx.borrow() {
                return;
            }
        }
        // Sender dropped: treat as shutdown.
    }

    /// Sleep for `duration` unless shutdown arrives first. Returns `true`
    /// when the full duration elapsed.
    pub async fn sleep(&mut self, duration: Duration) -> bool {
        if self.is_triggered() {
            return false;
        }
        tokio::select! {
            _ = tokio::time::sleep(duration) => true,
            _ = self.wait() => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_sleep_completes_without_shutdown() {
        let (_handle, mut signal) = shutdown_channel();
        assert!(signal.sleep(Duration::from_millis(5)).await);
    }

    #[tokio::test]
    async fn test_trigger_interrupts_sleep() {
        let (handle, mut signal) = shutdown_channel();
        handle.trigger();
        assert!(!signal.sleep(Duration::from_secs(60)).await);
        assert!(signal.is_triggered());
    }

    #[tokio::test]
    async fn test_trigger_mid_sleep() {
        let (handle, mut signal) = shutdown_channel();
        let sleeper = tokio::spawn(async move { signal.sleep(Duration::from_secs(60)).await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        handle.trigger();
        assert!(!sleeper.await.unwrap());
    }
}
