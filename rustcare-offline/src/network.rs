//! Network Status Monitor
//!
//! The system is online only when the platform reports a link AND the last
//! backend liveness probe succeeded. A link that is up while the backend is
//! unreachable keeps the monitor offline, so the scheduler does not hammer a
//! dead server. Once a probe is running, a restored link stays offline until
//! a fresh probe answers; without a probe the link alone decides.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

const TRANSITION_CHANNEL_CAPACITY: usize = 32;

/// Lightweight check that the backend answers
#[async_trait]
pub trait LivenessProbe: Send + Sync {
    async fn probe(&self) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkTransition {
    Online,
    Offline,
}

#[derive(Debug, Clone, Copy)]
struct Signals {
    link_up: bool,
    backend_reachable: bool,
}

impl Signals {
    fn online(&self) -> bool {
        self.link_up && self.backend_reachable
    }
}

pub struct NetworkMonitor {
    signals: Mutex<Signals>,
    online: watch::Sender<bool>,
    transitions: broadcast::Sender<NetworkTransition>,
    link_restored: Notify,
    probing: AtomicBool,
}

impl NetworkMonitor {
    /// Start from the platform's current link state. The backend is assumed
    /// reachable until a probe says otherwise.
    pub fn new(link_up: bool) -> Self {
        let signals = Signals {
            link_up,
            backend_reachable: true,
        };
        let (online, _) = watch::channel(signals.online());
        let (transitions, _) = broadcast::channel(TRANSITION_CHANNEL_CAPACITY);

        Self {
            signals: Mutex::new(signals),
            online,
            transitions,
            link_restored: Notify::new(),
            probing: AtomicBool::new(false),
        }
    }

    pub fn is_online(&self) -> bool {
        *self.online.borrow()
    }

    pub fn is_link_up(&self) -> bool {
        self.signals.lock().link_up
    }

    pub fn watch(&self) -> watch::Receiver<bool> {
        self.online.subscribe()
    }

    /// Transitions, emitted only on actual changes
    pub fn subscribe(&self) -> broadcast::Receiver<NetworkTransition> {
        self.transitions.subscribe()
    }

    /// Platform connectivity signal
    pub fn set_link_state(&self, link_up: bool) {
        let restored = {
            let mut signals = self.signals.lock();
            let restored = link_up && !signals.link_up;
            signals.link_up = link_up;
            if restored && self.probing.load(Ordering::SeqCst) {
                // Reachability from before the drop says nothing now
                signals.backend_reachable = false;
            }
            restored
        };

        if restored {
            self.link_restored.notify_one();
        }
        self.publish();
    }

    /// Outcome of a liveness probe
    pub fn report_probe(&self, reachable: bool) {
        self.signals.lock().backend_reachable = reachable;
        self.publish();
    }

    fn publish(&self) {
        let online = self.signals.lock().online();
        let changed = self.online.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        });

        if changed {
            let transition = if online {
                NetworkTransition::Online
            } else {
                NetworkTransition::Offline
            };
            tracing::info!(online = online, "Network status changed");
            let _ = self.transitions.send(transition);
        }
    }

    /// Poll `probe` every `interval`, and right away when the link comes back.
    /// No probe is sent while the link is down.
    pub fn spawn(
        self: Arc<Self>,
        probe: Arc<dyn LivenessProbe>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        self.probing.store(true, Ordering::SeqCst);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = self.link_restored.notified() => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                        continue;
                    }
                }

                if !self.is_link_up() {
                    continue;
                }

                let reachable = probe.probe().await;
                tracing::debug!(reachable = reachable, "Liveness probe completed");
                self.report_probe(reachable);
            }

            self.probing.store(false, Ordering::SeqCst);
            tracing::debug!("Network monitor stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockall::mock;

    mock! {
        pub Probe {}

        #[async_trait]
        impl LivenessProbe for Probe {
            async fn probe(&self) -> bool;
        }
    }

    #[test]
    fn test_online_requires_link_and_probe() {
        let monitor = NetworkMonitor::new(true);
        monitor.probing.store(true, Ordering::SeqCst);
        assert!(monitor.is_online());

        monitor.report_probe(false);
        assert!(!monitor.is_online());

        monitor.report_probe(true);
        assert!(monitor.is_online());
        monitor.set_link_state(false);
        assert!(!monitor.is_online());
    }

    #[test]
    fn test_link_flap_waits_for_fresh_probe() {
        let monitor = NetworkMonitor::new(true);
        monitor.probing.store(true, Ordering::SeqCst);
        let mut transitions = monitor.subscribe();

        monitor.set_link_state(false);
        monitor.set_link_state(true);
        assert!(!monitor.is_online());

        monitor.report_probe(true);
        assert!(monitor.is_online());

        assert_eq!(transitions.try_recv().unwrap(), NetworkTransition::Offline);
        assert_eq!(transitions.try_recv().unwrap(), NetworkTransition::Online);
        assert!(transitions.try_recv().is_err());
    }

    #[test]
    fn test_without_probe_link_alone_decides() {
        let monitor = NetworkMonitor::new(true);

        monitor.set_link_state(false);
        assert!(!monitor.is_online());
        monitor.set_link_state(true);
        assert!(monitor.is_online());
    }

    #[test]
    fn test_transitions_only_on_change() {
        let monitor = NetworkMonitor::new(false);
        let mut transitions = monitor.subscribe();

        monitor.set_link_state(true);
        monitor.set_link_state(true);
        monitor.report_probe(true);
        monitor.report_probe(false);

        assert_eq!(transitions.try_recv().unwrap(), NetworkTransition::Online);
        assert_eq!(transitions.try_recv().unwrap(), NetworkTransition::Offline);
        assert!(transitions.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_failed_probe_takes_monitor_offline() {
        let mut probe = MockProbe::new();
        probe.expect_probe().returning(|| false);

        let monitor = Arc::new(NetworkMonitor::new(true));
        let mut online = monitor.watch();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = monitor
            .clone()
            .spawn(Arc::new(probe), Duration::from_millis(10), shutdown_rx);

        tokio::time::timeout(Duration::from_secs(5), online.wait_for(|online| !*online))
            .await
            .unwrap()
            .unwrap();
        assert!(!monitor.is_online());

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_no_probe_while_link_down() {
        let mut probe = MockProbe::new();
        probe.expect_probe().never();

        let monitor = Arc::new(NetworkMonitor::new(false));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = monitor
            .clone()
            .spawn(Arc::new(probe), Duration::from_millis(5), shutdown_rx);

        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
        assert!(!monitor.is_online());
    }

    #[tokio::test]
    async fn test_link_restored_probes_immediately() {
        let mut probe = MockProbe::new();
        probe.expect_probe().returning(|| true);

        let monitor = Arc::new(NetworkMonitor::new(false));
        monitor.report_probe(false);
        let mut online = monitor.watch();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        // Long interval: only the link-up wakeup can bring the monitor online
        let handle = monitor
            .clone()
            .spawn(Arc::new(probe), Duration::from_secs(3600), shutdown_rx);
        tokio::time::sleep(Duration::from_millis(20)).await;

        monitor.set_link_state(true);
        tokio::time::timeout(Duration::from_secs(5), online.wait_for(|online| *online))
            .await
            .unwrap()
            .unwrap();

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
