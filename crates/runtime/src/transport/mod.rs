//! Transport abstraction over the two ways of reaching the peripheral.
//!
//! A [`Transport`] is either a [`RelayTransport`] (JSON-RPC over a local
//! WebSocket bridge) or a [`NativeTransport`] (direct GATT connection via the
//! system's wireless stack). The session layer never cares which one it got:
//! both expose connect/write/subscribe plus a lifecycle event stream, and
//! both maintain the discovered-peripherals lookup the session resolves
//! display names from.
//!
//! Selection happens once per link instance: [`Capabilities::detect`] probes
//! the platform, [`TransportKind::resolve`] turns the probe into a tagged
//! choice, and a [`TransportFactory`] carrying that choice is injected into
//! the session at construction. There is no global factory slot.

pub mod native;
pub mod relay;

use std::sync::Arc;

use futures_util::future::BoxFuture;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::Result;
use crate::protocol::{NAME_PREFIX, UART_SERVICE};

pub use native::NativeTransport;
pub use relay::{DEFAULT_RELAY_URL, RelayTransport};

/// Inbound notification frames, one `Vec<u8>` per characteristic change.
pub type InboundFrames = mpsc::UnboundedReceiver<Vec<u8>>;

/// Snapshot of a peripheral surfaced during discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredPeripheral {
    /// Transport-scoped peripheral identifier.
    pub id: String,
    /// Advertised display name (may be empty).
    pub name: String,
    /// Signal strength at discovery time, if the transport reports one.
    pub rssi: Option<i16>,
}

/// Lifecycle events emitted by a transport.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// Discovery surfaced a peripheral matching the filter.
    PeripheralDiscovered(DiscoveredPeripheral),
    /// A connect-by-id completed; the link is up.
    Connected,
    /// The link went down, by request or by failure.
    Disconnected { reason: String },
}

/// Discovery filter: the advertised service plus a device-name prefix.
#[derive(Debug, Clone)]
pub struct DiscoveryFilter {
    pub service: Uuid,
    pub name_prefix: String,
}

impl Default for DiscoveryFilter {
    fn default() -> Self {
        Self {
            service: UART_SERVICE,
            name_prefix: NAME_PREFIX.to_string(),
        }
    }
}

/// Contract between the link session and a concrete transport.
///
/// Transport-level faults surface through each operation's `Result`; the
/// session logs them but neither re-wraps nor retries. `is_connected` is a
/// cached flag maintained from connection events so it stays a pure,
/// non-suspending query.
pub trait Transport: Send + Sync {
    /// Which transport this is.
    fn kind(&self) -> TransportKind;

    /// Connect to a previously discovered peripheral by id.
    fn connect_peripheral(&self, id: &str) -> BoxFuture<'_, Result<()>>;

    /// Best-effort disconnect.
    fn disconnect(&self) -> BoxFuture<'_, Result<()>>;

    /// Cached connection-state query.
    fn is_connected(&self) -> bool;

    /// Write `payload` to a characteristic of the connected peripheral.
    fn write(
        &self,
        service: Uuid,
        characteristic: Uuid,
        payload: Vec<u8>,
        with_response: bool,
    ) -> BoxFuture<'_, Result<()>>;

    /// Subscribe to characteristic notifications; frames arrive on the
    /// returned receiver until the connection drops.
    fn subscribe(&self, service: Uuid, characteristic: Uuid)
    -> BoxFuture<'_, Result<InboundFrames>>;

    /// Take the lifecycle event stream. Yields `None` after the first call.
    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<TransportEvent>>;

    /// Discovered-peripherals lookup keyed by id.
    fn discovered(&self, id: &str) -> Option<DiscoveredPeripheral>;

    /// Every peripheral surfaced so far, in arrival order.
    fn discovered_peripherals(&self) -> Vec<DiscoveredPeripheral>;

    /// Escalate a fatal condition: force the link down and report `reason`
    /// through the lifecycle event stream.
    fn handle_disconnect_error(&self, reason: &str);
}

/// The two interchangeable ways of reaching the peripheral.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// Local relay bridge speaking JSON-RPC over a WebSocket.
    Relay,
    /// Direct GATT connection through the system's wireless stack.
    Native,
}

impl TransportKind {
    /// Resolve the transport for this environment. Absence of native
    /// wireless capability silently falls back to the relay; there is no
    /// error path.
    pub fn resolve(caps: Capabilities) -> Self {
        if caps.native_wireless {
            TransportKind::Native
        } else {
            TransportKind::Relay
        }
    }
}

/// Platform capability probe. Pure function of the environment; the result
/// is cached by whoever holds the factory.
#[derive(Debug, Clone, Copy)]
pub struct Capabilities {
    /// Whether a native wireless stack is usable on this platform.
    pub native_wireless: bool,
}

impl Capabilities {
    /// The native path is backed by BlueZ on Linux, CoreBluetooth on macOS
    /// and WinRT on Windows; everything else relays.
    pub fn detect() -> Self {
        Self {
            native_wireless: cfg!(any(
                target_os = "linux",
                target_os = "macos",
                target_os = "windows"
            )),
        }
    }
}

/// Constructor for transports, injected into the session so tests can swap
/// in a scripted transport.
pub trait TransportFactory: Send + Sync {
    /// The tagged transport choice this factory will construct.
    fn kind(&self) -> TransportKind;

    /// Open a fresh transport and start discovery with `filter`.
    fn open(&self, filter: DiscoveryFilter) -> BoxFuture<'_, Result<Arc<dyn Transport>>>;
}

/// Production factory: builds the transport picked by capability detection
/// (or forced by the caller).
pub struct PlatformFactory {
    kind: TransportKind,
    relay_url: String,
}

impl PlatformFactory {
    pub fn new(kind: TransportKind, relay_url: impl Into<String>) -> Self {
        Self {
            kind,
            relay_url: relay_url.into(),
        }
    }

    /// Factory for whatever the platform supports, relaying by default.
    pub fn detect(relay_url: impl Into<String>) -> Self {
        Self::new(TransportKind::resolve(Capabilities::detect()), relay_url)
    }
}

impl TransportFactory for PlatformFactory {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    fn open(&self, filter: DiscoveryFilter) -> BoxFuture<'_, Result<Arc<dyn Transport>>> {
        Box::pin(async move {
            let transport: Arc<dyn Transport> = match self.kind {
                TransportKind::Relay => {
                    Arc::new(RelayTransport::open(&self.relay_url, &filter).await?)
                }
                TransportKind::Native => Arc::new(NativeTransport::open(&filter).await?),
            };
            Ok(transport)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn native_capability_selects_native() {
        let kind = TransportKind::resolve(Capabilities {
            native_wireless: true,
        });
        assert_eq!(kind, TransportKind::Native);
    }

    #[test]
    fn missing_capability_falls_back_to_relay() {
        let kind = TransportKind::resolve(Capabilities {
            native_wireless: false,
        });
        assert_eq!(kind, TransportKind::Relay);
    }

    #[test]
    fn default_filter_uses_the_protocol_constants() {
        let filter = DiscoveryFilter::default();
        assert_eq!(filter.service, UART_SERVICE);
        assert_eq!(filter.name_prefix, NAME_PREFIX);
    }
}
