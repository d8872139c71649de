//! uartlink - flow-controlled session layer for a UART-style wireless
//! peripheral
//!
//! One [`Link`] maintains the session with one physical peripheral over an
//! injected transport (relay WebSocket bridge or native GATT), supervises it
//! with a busy-recovery timer and an optional liveness watchdog, and routes
//! inbound report strings to registered [`Consumer`]s, first responder wins.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use uartlink::{Link, LinkConfig, LinkState};
//! use uartlink::runtime::{PlatformFactory, DEFAULT_RELAY_URL};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let state = Arc::new(LinkState::new());
//!     let factory = Arc::new(PlatformFactory::detect(DEFAULT_RELAY_URL));
//!     let link = Link::new(factory, LinkConfig::default(), Arc::clone(&state));
//!
//!     link.scan().await?;
//!     // ... pick a peripheral from link.discovered_peripherals() ...
//!     # Ok(())
//! }
//! ```

pub mod config;
pub mod dispatch;
pub mod link;
pub mod state;

/// Low-level transports and protocol constants.
pub use uartlink_runtime as runtime;

pub use config::LinkConfig;
pub use dispatch::Dispatcher;
pub use link::Link;
pub use state::{Consumer, LinkState};
