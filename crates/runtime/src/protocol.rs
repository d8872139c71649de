//! Wire-level constants for the UART peripheral link.
//!
//! The service and characteristic identifiers follow the Nordic UART layout
//! the peripheral firmware exposes; the host writes command strings to
//! [`TX_CHARACTERISTIC`] and receives report strings as notifications on
//! [`RX_CHARACTERISTIC`]. These are protocol constants, not configuration.

use std::time::Duration;
use uuid::Uuid;

/// UART service advertised by the peripheral.
pub const UART_SERVICE: Uuid = Uuid::from_u128(0x6e400001_b5a3_f393_e0a9_e50e24dcca9e);

/// Characteristic the host writes outbound command strings to.
pub const TX_CHARACTERISTIC: Uuid = Uuid::from_u128(0x6e400003_b5a3_f393_e0a9_e50e24dcca9e);

/// Characteristic the peripheral notifies inbound report strings on.
pub const RX_CHARACTERISTIC: Uuid = Uuid::from_u128(0x6e400002_b5a3_f393_e0a9_e50e24dcca9e);

/// Device-name prefix used to filter discovery results.
pub const NAME_PREFIX: &str = "BBC micro:bit";

/// Handshake request sent right after the inbound channel comes up.
pub const VERSION_REQUEST: &str = "RV";

/// Two-character tag prefixing a peripheral version report (`"DV3"` -> 3).
pub const VERSION_REPORT_TAG: &str = "DV";

/// How long a send may sit unacknowledged before the busy flag is
/// force-cleared so a later send can go through.
pub const BUSY_RECOVERY_WINDOW: Duration = Duration::from_millis(5000);

/// Liveness timeouts at or below this floor leave the watchdog disarmed.
pub const WATCHDOG_FLOOR: Duration = Duration::from_millis(100);

/// Reason reported when the liveness watchdog forces a disconnect.
pub const DATA_STOPPED_ERROR: &str = "uart link stopped receiving data";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uuids_render_as_the_firmware_constants() {
        assert_eq!(
            UART_SERVICE.to_string(),
            "6e400001-b5a3-f393-e0a9-e50e24dcca9e"
        );
        assert_eq!(
            TX_CHARACTERISTIC.to_string(),
            "6e400003-b5a3-f393-e0a9-e50e24dcca9e"
        );
        assert_eq!(
            RX_CHARACTERISTIC.to_string(),
            "6e400002-b5a3-f393-e0a9-e50e24dcca9e"
        );
    }
}
