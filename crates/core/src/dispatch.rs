//! First-responder routing of inbound peripheral reports.
//!
//! One physical peripheral feeds several independent consumers; routing is
//! deterministic (registration order) and exclusive (at most one consumer
//! acts per report) so a single report never causes duplicate side effects.

use std::sync::Arc;

use uartlink_runtime::protocol::VERSION_REPORT_TAG;

use crate::state::LinkState;

/// Routes decoded report text to the session's own handler, then to the
/// registered consumers.
pub struct Dispatcher {
    state: Arc<LinkState>,
}

impl Dispatcher {
    pub fn new(state: Arc<LinkState>) -> Self {
        Self { state }
    }

    /// Offer `text` to the version-report handler first, then to consumers
    /// in registration order, stopping at the first claim. Returns whether
    /// anyone claimed it.
    pub fn dispatch(&self, text: &str) -> bool {
        if self.handle_version_report(text) {
            return true;
        }
        for consumer in self.state.consumers() {
            if consumer.try_handle(text) {
                return true;
            }
        }
        false
    }

    /// `"DV<int>"` stores the reported level and claims the message. A tag
    /// match with a malformed integer still claims; the report was addressed
    /// to us even if we can't use it.
    fn handle_version_report(&self, text: &str) -> bool {
        let Some(rest) = text.strip_prefix(VERSION_REPORT_TAG) else {
            return false;
        };
        match rest.trim_end().parse::<u32>() {
            Ok(level) => {
                tracing::debug!(level, "peripheral reported its version");
                self.state.set_level(level);
            }
            Err(_) => tracing::debug!(report = text, "unparseable version report"),
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::state::Consumer;

    struct Recording {
        seen: AtomicUsize,
        claim: bool,
    }

    impl Recording {
        fn new(claim: bool) -> Arc<Self> {
            Arc::new(Self {
                seen: AtomicUsize::new(0),
                claim,
            })
        }
    }

    impl Consumer for Recording {
        fn try_handle(&self, _text: &str) -> bool {
            self.seen.fetch_add(1, Ordering::SeqCst);
            self.claim
        }
    }

    #[test]
    fn version_report_updates_level_and_claims() {
        let state = Arc::new(LinkState::new());
        let consumer = Recording::new(true);
        state.register(consumer.clone());
        let dispatcher = Dispatcher::new(Arc::clone(&state));

        assert!(dispatcher.dispatch("DV7"));
        assert_eq!(state.level(), 7);
        // the session handler claimed it, so no consumer saw it
        assert_eq!(consumer.seen.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn unknown_tag_falls_through_in_registration_order() {
        let state = Arc::new(LinkState::new());
        let first = Recording::new(false);
        let second = Recording::new(true);
        let third = Recording::new(true);
        state.register(first.clone());
        state.register(second.clone());
        state.register(third.clone());
        let dispatcher = Dispatcher::new(Arc::clone(&state));

        assert!(dispatcher.dispatch("XY"));
        assert_eq!(state.level(), 0);
        assert_eq!(first.seen.load(Ordering::SeqCst), 1);
        assert_eq!(second.seen.load(Ordering::SeqCst), 1);
        // second claimed, third never saw the message
        assert_eq!(third.seen.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn first_responder_starves_later_consumers() {
        let state = Arc::new(LinkState::new());
        let greedy = Recording::new(true);
        let starved = Recording::new(true);
        state.register(greedy.clone());
        state.register(starved.clone());
        let dispatcher = Dispatcher::new(Arc::clone(&state));

        for text in ["XY", "AB12", "hello"] {
            assert!(dispatcher.dispatch(text));
        }
        assert_eq!(greedy.seen.load(Ordering::SeqCst), 3);
        assert_eq!(starved.seen.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn nobody_claims_unrecognized_text() {
        let state = Arc::new(LinkState::new());
        let picky = Recording::new(false);
        state.register(picky.clone());
        let dispatcher = Dispatcher::new(Arc::clone(&state));

        assert!(!dispatcher.dispatch("noise"));
        assert_eq!(picky.seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn malformed_version_report_claims_without_update() {
        let state = Arc::new(LinkState::new());
        state.set_level(3);
        let consumer = Recording::new(true);
        state.register(consumer.clone());
        let dispatcher = Dispatcher::new(Arc::clone(&state));

        assert!(dispatcher.dispatch("DVx"));
        assert_eq!(state.level(), 3);
        assert_eq!(consumer.seen.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn trailing_newline_is_tolerated() {
        let state = Arc::new(LinkState::new());
        let dispatcher = Dispatcher::new(Arc::clone(&state));

        assert!(dispatcher.dispatch("DV12\r\n"));
        assert_eq!(state.level(), 12);
    }
}
