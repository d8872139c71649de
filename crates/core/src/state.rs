//! Shared link state: connection-derived attributes plus the consumer
//! registry, one instance per physical peripheral.
//!
//! Every consumer attached to the same peripheral reads the same
//! [`LinkState`]; the session's handshake handler writes the reported
//! level and display name into it, and the reset routine restores the
//! defaults on every disconnect. Consumers should treat reads as possibly
//! stale between their own dispatch turns.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::Mutex;

/// A consumer of inbound peripheral reports.
///
/// Consumers register once, at their own construction time, and are never
/// removed. Registration order is dispatch priority: the first consumer to
/// claim a report is the only one that sees it.
pub trait Consumer: Send + Sync {
    /// Offer an inbound report. Return `true` to claim it and stop dispatch.
    fn try_handle(&self, text: &str) -> bool;
}

/// Connection-derived attributes shared by all consumers of one peripheral.
pub struct LinkState {
    level: AtomicU32,
    name: Mutex<String>,
    consumers: Mutex<Vec<Arc<dyn Consumer>>>,
}

impl LinkState {
    pub fn new() -> Self {
        Self {
            level: AtomicU32::new(0),
            name: Mutex::new(String::new()),
            consumers: Mutex::new(Vec::new()),
        }
    }

    /// The level/version the peripheral last reported, 0 until a report
    /// arrives.
    pub fn level(&self) -> u32 {
        self.level.load(Ordering::SeqCst)
    }

    pub fn set_level(&self, level: u32) {
        self.level.store(level, Ordering::SeqCst);
    }

    /// Display name of the connected peripheral, empty while disconnected.
    pub fn name(&self) -> String {
        self.name.lock().clone()
    }

    pub fn set_name(&self, name: &str) {
        *self.name.lock() = name.to_string();
    }

    /// Append a consumer to the dispatch order. There is no unregister path.
    pub fn register(&self, consumer: Arc<dyn Consumer>) {
        self.consumers.lock().push(consumer);
    }

    /// Snapshot of the registered consumers in registration order.
    pub fn consumers(&self) -> Vec<Arc<dyn Consumer>> {
        self.consumers.lock().clone()
    }

    /// Restore the connection-derived attributes to their defaults. The
    /// consumer registry survives; registrations are for the life of the
    /// process.
    pub fn reset(&self) {
        self.level.store(0, Ordering::SeqCst);
        self.name.lock().clear();
    }
}

impl Default for LinkState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Sink;

    impl Consumer for Sink {
        fn try_handle(&self, _text: &str) -> bool {
            false
        }
    }

    #[test]
    fn starts_at_defaults() {
        let state = LinkState::new();
        assert_eq!(state.level(), 0);
        assert_eq!(state.name(), "");
        assert!(state.consumers().is_empty());
    }

    #[test]
    fn reset_restores_defaults_but_keeps_consumers() {
        let state = LinkState::new();
        state.set_level(7);
        state.set_name("BBC micro:bit [zotut]");
        state.register(Arc::new(Sink));

        state.reset();

        assert_eq!(state.level(), 0);
        assert_eq!(state.name(), "");
        assert_eq!(state.consumers().len(), 1);
    }
}
