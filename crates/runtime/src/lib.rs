//! uartlink runtime - peripheral transports and wire protocol
//!
//! This crate provides the low-level infrastructure the session layer in
//! `uartlink` builds on:
//!
//! - **Transport contract**: connect/write/subscribe plus a lifecycle event
//!   stream, implemented by two interchangeable backends
//! - **Relay transport**: JSON-RPC over a local WebSocket bridge
//! - **Native transport**: direct GATT connection via the system stack
//! - **Transport selection**: one capability probe per link instance,
//!   falling back to the relay when native wireless is unavailable
//! - **Protocol constants**: the UART service/characteristic identifiers and
//!   session-level tags, bit-exact
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐
//! │   uartlink   │  Link session (flow control, watchdog, dispatch)
//! └──────┬───────┘
//!        │ injects TransportFactory
//! ┌──────▼───────────┐
//! │ uartlink-runtime │  This crate
//! │  ┌────────────┐  │
//! │  │ Relay      │  │  WebSocket JSON-RPC bridge client
//! │  └────────────┘  │
//! │  ┌────────────┐  │
//! │  │ Native     │  │  GATT central via btleplug
//! │  └────────────┘  │
//! └──────────────────┘
//! ```

pub mod error;
pub mod protocol;
pub mod transport;

// Re-export key types at crate root
pub use error::{Error, Result};
pub use transport::{
    Capabilities, DEFAULT_RELAY_URL, DiscoveredPeripheral, DiscoveryFilter, InboundFrames,
    NativeTransport, PlatformFactory, RelayTransport, Transport, TransportEvent, TransportFactory,
    TransportKind,
};
