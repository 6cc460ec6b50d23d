//! Connectivity monitor.
//!
//! Combines the platform's reachability reports with the forced-offline debug
//! override into one "online" flag. Subscribers are woken only when that flag
//! flips, never on repeated identical reports.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::watch;
use tracing::info;

/// Debug-only switches shared by the monitor and the developer settings screen.
///
/// Lives in memory only: every new process (and every new instance) starts
/// with the override disabled. Every monitor built on the same overrides
/// recomputes its online flag when the override changes.
#[derive(Debug, Default)]
pub struct DebugOverrides {
    forced_offline: AtomicBool,
    monitors: Mutex<Vec<Weak<MonitorState>>>,
}

impl DebugOverrides {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn forced_offline(&self) -> bool {
        self.forced_offline.load(Ordering::SeqCst)
    }

    fn register(&self, state: &Arc<MonitorState>) {
        let mut monitors = lock(&self.monitors);
        monitors.retain(|weak| weak.strong_count() > 0);
        monitors.push(Arc::downgrade(state));
    }

    /// Stores the flag and recomputes every live monitor. Returns whether
    /// `origin` flipped.
    #[cfg(any(debug_assertions, feature = "debug-tools"))]
    fn set_forced_offline(&self, forced: bool, origin: &Arc<MonitorState>) -> bool {
        self.forced_offline.store(forced, Ordering::SeqCst);
        let live: Vec<Arc<MonitorState>> = lock(&self.monitors)
            .iter()
            .filter_map(Weak::upgrade)
            .collect();

        let mut origin_flipped = false;
        for state in &live {
            let flipped = state.recompute(self);
            if Arc::ptr_eq(state, origin) {
                origin_flipped = flipped;
            }
        }
        origin_flipped
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A reachability report from the platform.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Reachability {
    pub link_up: bool,
    pub internet_reachable: bool,
}

impl Reachability {
    pub fn online() -> Self {
        Self {
            link_up: true,
            internet_reachable: true,
        }
    }

    pub fn offline() -> Self {
        Self::default()
    }

    pub fn is_reachable(&self) -> bool {
        self.link_up && self.internet_reachable
    }
}

/// Per-monitor state. The reachability lock is held while the online flag
/// is computed and published, so the last writer always publishes last.
#[derive(Debug)]
struct MonitorState {
    reachability: Mutex<Reachability>,
    online_tx: watch::Sender<bool>,
}

impl MonitorState {
    #[cfg(any(debug_assertions, feature = "debug-tools"))]
    fn recompute(&self, overrides: &DebugOverrides) -> bool {
        let reachability = lock(&self.reachability);
        self.publish(&reachability, overrides)
    }

    fn publish(&self, reachability: &Reachability, overrides: &DebugOverrides) -> bool {
        let online = reachability.is_reachable() && !overrides.forced_offline();
        let flipped = self.online_tx.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        });
        if flipped {
            info!("[SYNC] connectivity: {}", if online { "online" } else { "offline" });
        }
        flipped
    }
}

/// Publishes whether sync may talk to the network.
pub struct ConnectivityMonitor {
    overrides: Arc<DebugOverrides>,
    state: Arc<MonitorState>,
}

impl ConnectivityMonitor {
    /// Creates a monitor that reports offline until the first reachability report.
    pub fn new(overrides: Arc<DebugOverrides>) -> Self {
        let (online_tx, _) = watch::channel(false);
        let state = Arc::new(MonitorState {
            reachability: Mutex::new(Reachability::offline()),
            online_tx,
        });
        overrides.register(&state);
        Self { overrides, state }
    }

    /// Records a platform report. Returns `true` if the online flag flipped.
    pub fn report(&self, reachability: Reachability) -> bool {
        let mut current = lock(&self.state.reachability);
        *current = reachability;
        self.state.publish(&current, &self.overrides)
    }

    /// Forces every monitor sharing these overrides offline regardless of
    /// reachability, or lifts the override. Returns `true` if this monitor's
    /// online flag flipped.
    #[cfg(any(debug_assertions, feature = "debug-tools"))]
    pub fn set_forced_offline(&self, forced: bool) -> bool {
        info!("[SYNC] forced offline override {}", if forced { "enabled" } else { "disabled" });
        self.overrides.set_forced_offline(forced, &self.state)
    }

    pub fn is_forced_offline(&self) -> bool {
        self.overrides.forced_offline()
    }

    pub fn is_online(&self) -> bool {
        *self.state.online_tx.borrow()
    }

    /// A receiver that observes each online/offline transition.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.state.online_tx.subscribe()
    }
}
