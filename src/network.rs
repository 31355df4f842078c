use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::watch;

/// Shared connectivity signal.
///
/// Whatever observes the platform's network state calls [`Connectivity::set_online`];
/// engines subscribe to transitions.
#[derive(Clone, Debug)]
pub struct Connectivity {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for Connectivity {
    fn default() -> Self {
        Self::new(true)
    }
}

impl Connectivity {
    pub fn new(online: bool) -> Self {
        let (tx, _) = watch::channel(online);
        Self { tx: Arc::new(tx) }
    }

    /// Records the current state. Subscribers are only woken on a real transition.
    pub fn set_online(&self, online: bool) {
        self.tx.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        });
    }

    pub fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

/// Connectivity change observed by a [`NetworkMonitor`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Transition {
    Online,
    Offline,
}

/// Tracks the last connectivity state the engine observed.
#[derive(Debug)]
pub(crate) struct NetworkMonitor {
    source: Connectivity,
    online: AtomicBool,
}

impl NetworkMonitor {
    pub(crate) fn new(source: Connectivity) -> Self {
        let online = AtomicBool::new(source.is_online());
        Self { source, online }
    }

    pub(crate) fn source(&self) -> &Connectivity {
        &self.source
    }

    pub(crate) fn is_online(&self) -> bool {
        self.online.load(Ordering::Acquire)
    }

    /// Re-reads the source and starts a fresh subscription.
    pub(crate) fn attach(&self) -> watch::Receiver<bool> {
        let rx = self.source.subscribe();
        self.online.store(*rx.borrow(), Ordering::Release);
        rx
    }

    pub(crate) fn refresh(&self) -> bool {
        let online = self.source.is_online();
        self.online.store(online, Ordering::Release);
        online
    }

    /// Records `online` and reports whether it was a transition.
    pub(crate) fn record(&self, online: bool) -> Option<Transition> {
        let previous = self.online.swap(online, Ordering::AcqRel);
        match (previous, online) {
            (false, true) => Some(Transition::Online),
            (true, false) => Some(Transition::Offline),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Connectivity, NetworkMonitor, Transition};

    #[tokio::test]
    async fn set_online_only_notifies_on_change() {
        let connectivity = Connectivity::new(true);
        let mut rx = connectivity.subscribe();

        connectivity.set_online(true);
        assert!(!rx.has_changed().expect("sender alive"));

        connectivity.set_online(false);
        assert!(rx.has_changed().expect("sender alive"));
        assert!(!*rx.borrow_and_update());
        assert!(!connectivity.is_online());
    }

    #[test]
    fn monitor_reports_transitions() {
        let monitor = NetworkMonitor::new(Connectivity::new(false));
        assert!(!monitor.is_online());
        assert_eq!(monitor.record(false), None);
        assert_eq!(monitor.record(true), Some(Transition::Online));
        assert_eq!(monitor.record(true), None);
        assert_eq!(monitor.record(false), Some(Transition::Offline));
    }

    #[test]
    fn attach_syncs_with_source() {
        let connectivity = Connectivity::new(true);
        let monitor = NetworkMonitor::new(connectivity.clone());
        connectivity.set_online(false);
        assert!(monitor.is_online());

        let _rx = monitor.attach();
        assert!(!monitor.is_online());

        connectivity.set_online(true);
        assert!(monitor.refresh());
    }
}
