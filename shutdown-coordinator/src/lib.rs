//! Process-wide shutdown coordination.
//!
//! Components register themselves with a name, a kind tag, and a teardown
//! priority. Any thread may flip the shutdown latch; workers poll it at
//! their safe points and report state transitions back, and the main thread
//! waits for quiescence with a deadline.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

/// Identifies a registered component. Ids are never reused within a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ComponentId(usize);

/// What kind of component registered; used only for logging and diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComponentKind {
    StreamRecorder,
    RetentionSweeper,
    Supervisor,
    Other,
}

/// Lifecycle state reported by a component.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComponentState {
    Starting,
    Running,
    Stopping,
    Stopped,
}

#[derive(Debug)]
struct Component {
    name: String,
    kind: ComponentKind,
    priority: u8,
    state: ComponentState,
}

/// The registry itself. Cheap to share: wrap in an [`Arc`] and clone.
///
/// A single mutex protects the component table; the shutdown latch is a
/// separate atomic so `is_shutdown_initiated` stays lock-free on the
/// per-packet hot path.
#[derive(Debug, Default)]
pub struct ShutdownCoordinator {
    components: Mutex<Vec<Component>>,
    quiescent: Condvar,
    shutdown: AtomicBool,
}

impl ShutdownCoordinator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a component. Lower priority tears down earlier.
    pub fn register(&self, name: &str, kind: ComponentKind, priority: u8) -> ComponentId {
        let mut components = self.components.lock().unwrap();
        let id = ComponentId(components.len());
        components.push(Component {
            name: name.to_string(),
            kind,
            priority,
            state: ComponentState::Starting,
        });
        debug!(component = name, ?kind, priority, "registered component");
        id
    }

    /// Report a state transition for a registered component.
    pub fn update_state(&self, id: ComponentId, state: ComponentState) {
        let mut components = self.components.lock().unwrap();
        let Some(component) = components.get_mut(id.0) else {
            warn!(id = id.0, "state update for unknown component");
            return;
        };
        component.state = state;
        debug!(component = %component.name, ?state, "component state");
        drop(components);
        // Wake wait_for_quiescence regardless of which state was reported;
        // it re-checks the whole table anyway.
        self.quiescent.notify_all();
    }

    /// Flip the process-wide latch. Idempotent.
    pub fn initiate_shutdown(&self) {
        if !self.shutdown.swap(true, Ordering::SeqCst) {
            info!("shutdown initiated");
        }
        self.quiescent.notify_all();
    }

    pub fn is_shutdown_initiated(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Block until every registered component reports `Stopped`, or until
    /// the deadline elapses. Returns true on full quiescence.
    pub fn wait_for_quiescence(&self, deadline: Duration) -> bool {
        let start = Instant::now();
        let mut components = self.components.lock().unwrap();
        loop {
            if components
                .iter()
                .all(|c| c.state == ComponentState::Stopped)
            {
                return true;
            }
            let elapsed = start.elapsed();
            if elapsed >= deadline {
                let stragglers: Vec<&str> = components
                    .iter()
                    .filter(|c| c.state != ComponentState::Stopped)
                    .map(|c| c.name.as_str())
                    .collect();
                warn!(?stragglers, "quiescence deadline expired");
                return false;
            }
            let (guard, _timeout) = self
                .quiescent
                .wait_timeout(components, deadline - elapsed)
                .unwrap();
            components = guard;
        }
    }

    /// Component names ordered by teardown priority (lower first).
    /// The coordinator only signals; callers do the actual stopping.
    pub fn teardown_order(&self) -> Vec<(ComponentId, String)> {
        let components = self.components.lock().unwrap();
        let mut order: Vec<(u8, ComponentId, String)> = components
            .iter()
            .enumerate()
            .map(|(i, c)| (c.priority, ComponentId(i), c.name.clone()))
            .collect();
        order.sort_by_key(|(priority, _, _)| *priority);
        order.into_iter().map(|(_, id, name)| (id, name)).collect()
    }
}
