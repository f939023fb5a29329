//! Network monitor
//!
//! Platform code feeds raw connectivity readings through
//! [`NetworkMonitor::report`]. The debounce loop ([`NetworkMonitor::run`])
//! publishes a reading only after it has held for the configured window, so
//! a flapping link produces at most one transition per stable window.
//!
//! Consumers either register a callback with [`NetworkMonitor::on_change`]
//! or take a [`watch::Receiver`] with [`NetworkMonitor::subscribe`].

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::models::NetworkStatus;
use crate::observers::{Observers, Subscription};

struct Inner {
    raw: watch::Sender<NetworkStatus>,
    stable: watch::Sender<NetworkStatus>,
    observers: Observers<NetworkStatus>,
    debounce: Duration,
}

/// Debounced connectivity state
#[derive(Clone)]
pub struct NetworkMonitor {
    inner: Arc<Inner>,
}

impl NetworkMonitor {
    pub fn new(initial: NetworkStatus, debounce: Duration) -> Self {
        let (raw, _) = watch::channel(initial);
        let (stable, _) = watch::channel(initial);
        Self {
            inner: Arc::new(Inner {
                raw,
                stable,
                observers: Observers::new(),
                debounce,
            }),
        }
    }

    /// Last published state
    pub fn current_state(&self) -> NetworkStatus {
        *self.inner.stable.borrow()
    }

    /// Feed a raw reading; published once it survives the debounce window
    pub fn report(&self, status: NetworkStatus) {
        debug!(?status, "Raw connectivity reading");
        self.inner.raw.send_replace(status);
    }

    /// Publish a state immediately, bypassing the debounce
    ///
    /// Returns `true` if the state changed.
    pub fn publish(&self, status: NetworkStatus) -> bool {
        let changed = self.inner.stable.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });

        if changed {
            info!(?status, "Connectivity changed");
            self.inner.observers.emit(&status);
        }
        changed
    }

    /// Call `listener` on every published transition
    pub fn on_change<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&NetworkStatus) + Send + Sync + 'static,
    {
        self.inner.observers.subscribe(listener)
    }

    pub fn subscribe(&self) -> watch::Receiver<NetworkStatus> {
        self.inner.stable.subscribe()
    }

    /// Debounce loop; runs until the task is aborted
    pub async fn run(self) {
        let raw = self.inner.raw.subscribe();
        self.debounce(raw).await
    }

    /// Spawn the debounce loop on the current runtime
    ///
    /// Readings reported after this call returns are never missed.
    pub fn spawn(&self) -> JoinHandle<()> {
        let raw = self.inner.raw.subscribe();
        tokio::spawn(self.clone().debounce(raw))
    }

    async fn debounce(self, mut raw: watch::Receiver<NetworkStatus>) {
        loop {
            if raw.changed().await.is_err() {
                return;
            }

            // Restart the window on every new reading
            loop {
                let candidate = *raw.borrow_and_update();
                tokio::select! {
                    _ = tokio::time::sleep(self.inner.debounce) => {
                        self.publish(candidate);
                        break;
                    }
                    changed = raw.changed() => {
                        if changed.is_err() {
                            return;
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn recorder(monitor: &NetworkMonitor) -> (Arc<Mutex<Vec<NetworkStatus>>>, Subscription) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let subscription = monitor.on_change(move |status| sink.lock().unwrap().push(*status));
        (seen, subscription)
    }

    #[tokio::test(start_paused = true)]
    async fn test_flapping_link_is_debounced() {
        let monitor = NetworkMonitor::new(NetworkStatus::Online, Duration::from_secs(2));
        let (seen, _subscription) = recorder(&monitor);
        let task = monitor.spawn();

        monitor.report(NetworkStatus::Offline);
        tokio::time::sleep(Duration::from_millis(500)).await;
        monitor.report(NetworkStatus::Online);
        tokio::time::sleep(Duration::from_millis(500)).await;
        monitor.report(NetworkStatus::Offline);
        tokio::time::sleep(Duration::from_millis(500)).await;
        monitor.report(NetworkStatus::Online);
        tokio::time::sleep(Duration::from_secs(3)).await;

        assert!(seen.lock().unwrap().is_empty());
        assert_eq!(monitor.current_state(), NetworkStatus::Online);

        monitor.report(NetworkStatus::Offline);
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(*seen.lock().unwrap(), vec![NetworkStatus::Offline]);

        // A repeated reading of the same state is not a transition
        monitor.report(NetworkStatus::Offline);
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(seen.lock().unwrap().len(), 1);

        task.abort();
    }

    #[tokio::test]
    async fn test_publish_bypasses_debounce() {
        let monitor = NetworkMonitor::new(NetworkStatus::Offline, Duration::from_secs(60));
        let mut rx = monitor.subscribe();

        assert!(monitor.publish(NetworkStatus::Online));
        assert!(!monitor.publish(NetworkStatus::Online));

        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), NetworkStatus::Online);
        assert!(monitor.current_state().is_online());
    }

    #[test]
    fn test_unsubscribe_stops_delivery() {
        let monitor = NetworkMonitor::new(NetworkStatus::Offline, Duration::ZERO);
        let (seen, subscription) = recorder(&monitor);

        monitor.publish(NetworkStatus::Online);
        subscription.unsubscribe();
        monitor.publish(NetworkStatus::Offline);

        assert_eq!(*seen.lock().unwrap(), vec![NetworkStatus::Online]);
    }
}
