//! Link configuration.

use std::time::Duration;

use uartlink_runtime::protocol::BUSY_RECOVERY_WINDOW;

/// Tunables for one [`Link`](crate::Link) instance.
///
/// The defaults match the peripheral firmware's expectations; the watchdog is
/// off unless a caller opts in with a timeout above the 100 ms floor.
#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// Inbound liveness window. `None` disables the watchdog; values at or
    /// below the floor are treated as disabled too.
    pub liveness_timeout: Option<Duration>,
    /// How long a send may stay unacknowledged before busy is force-cleared.
    pub busy_recovery: Duration,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            liveness_timeout: None,
            busy_recovery: BUSY_RECOVERY_WINDOW,
        }
    }
}
