//! The peripheral session: one `Link` per physical peripheral.
//!
//! A `Link` owns the transport handle, drives the scan/connect/disconnect
//! lifecycle, enforces the single-outstanding-send discipline, supervises
//! inbound liveness, and feeds decoded reports through the dispatcher.
//!
//! Flow-control conditions (no transport yet, not connected, already busy)
//! are silent drops by design: the callers are interactive surfaces that
//! retry at their own cadence, so their next attempt is the retry mechanism.
//! Transport-level faults surface through each transport operation's own
//! `Result` and are logged here, never re-wrapped or retried.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use uartlink_runtime::protocol::{
    DATA_STOPPED_ERROR, RX_CHARACTERISTIC, TX_CHARACTERISTIC, UART_SERVICE, VERSION_REQUEST,
    WATCHDOG_FLOOR,
};
use uartlink_runtime::transport::{
    DiscoveredPeripheral, DiscoveryFilter, Transport, TransportEvent, TransportFactory,
    TransportKind,
};
use uartlink_runtime::{Error, Result};

use crate::config::LinkConfig;
use crate::dispatch::Dispatcher;
use crate::state::LinkState;

/// Session with a single physical peripheral over the injected transport.
pub struct Link {
    inner: Arc<LinkInner>,
}

struct LinkInner {
    factory: Arc<dyn TransportFactory>,
    config: LinkConfig,
    state: Arc<LinkState>,
    dispatcher: Dispatcher,
    transport: Mutex<Option<Arc<dyn Transport>>>,
    peripheral_id: Mutex<Option<String>>,
    busy: AtomicBool,
    busy_recovery: Mutex<Option<JoinHandle<()>>>,
    watchdog: Mutex<Option<JoinHandle<()>>>,
    event_loop: Mutex<Option<JoinHandle<()>>>,
    read_loop: Mutex<Option<JoinHandle<()>>>,
}

impl Link {
    /// Creates a link that will open transports through `factory` and share
    /// `state` with every consumer of this peripheral.
    pub fn new(factory: Arc<dyn TransportFactory>, config: LinkConfig, state: Arc<LinkState>) -> Self {
        Self {
            inner: Arc::new(LinkInner {
                factory,
                config,
                dispatcher: Dispatcher::new(Arc::clone(&state)),
                state,
                transport: Mutex::new(None),
                peripheral_id: Mutex::new(None),
                busy: AtomicBool::new(false),
                busy_recovery: Mutex::new(None),
                watchdog: Mutex::new(None),
                event_loop: Mutex::new(None),
                read_loop: Mutex::new(None),
            }),
        }
    }

    /// Which transport the factory was resolved to (cached at construction).
    pub fn transport_kind(&self) -> TransportKind {
        self.inner.factory.kind()
    }

    /// Tears down any existing transport (best effort) and opens a fresh one
    /// with discovery running against the peripheral filter. Discovery
    /// results accumulate in [`Link::discovered_peripherals`].
    pub async fn scan(&self) -> Result<()> {
        let previous = self.inner.transport.lock().take();
        if let Some(previous) = previous {
            if let Err(e) = previous.disconnect().await {
                tracing::debug!("teardown of previous transport failed (ignored): {e}");
            }
        }
        self.inner.abort_loops();

        let transport = self.inner.factory.open(DiscoveryFilter::default()).await?;
        let events = transport
            .take_events()
            .ok_or_else(|| Error::Transport("transport event stream already taken".to_string()))?;
        *self.inner.transport.lock() = Some(Arc::clone(&transport));

        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move { inner.run_events(events).await });
        if let Some(old) = self.inner.event_loop.lock().replace(handle) {
            old.abort();
        }
        Ok(())
    }

    /// Connects to a discovered peripheral by id and records it as the
    /// resolved connection identifier. A no-op before the first `scan`.
    pub async fn connect(&self, id: &str) {
        let Some(transport) = self.inner.transport() else {
            tracing::debug!("connect ignored: not scanning");
            return;
        };
        *self.inner.peripheral_id.lock() = Some(id.to_string());
        if let Err(e) = transport.connect_peripheral(id).await {
            tracing::warn!(id, "connect failed: {e}");
        }
    }

    /// Requests transport disconnect (best effort) and resets the session
    /// unconditionally.
    pub async fn disconnect(&self) {
        if let Some(transport) = self.inner.transport() {
            if let Err(e) = transport.disconnect().await {
                tracing::debug!("disconnect failed (ignored): {e}");
            }
        }
        self.inner.on_reset();
    }

    /// Whether the peripheral is currently connected. Pure query.
    pub fn is_connected(&self) -> bool {
        self.inner.is_connected()
    }

    /// Whether a send is outstanding. A send issued while busy is dropped.
    pub fn is_busy(&self) -> bool {
        self.inner.busy.load(Ordering::SeqCst)
    }

    /// Sends a command string to the peripheral, newline-terminated on the
    /// wire. Dropped silently when not connected or when a previous send is
    /// still outstanding; the caller's next attempt is the retry mechanism.
    pub fn send(&self, message: &str) {
        self.inner.send(message);
    }

    /// The peripheral id resolved by `connect` or the handshake, if any.
    pub fn peripheral_id(&self) -> Option<String> {
        self.inner.peripheral_id.lock().clone()
    }

    /// Display name of the connected peripheral, empty while disconnected.
    pub fn peripheral_name(&self) -> String {
        self.inner.state.name()
    }

    /// Level/version the peripheral reported in its handshake reply.
    pub fn level(&self) -> u32 {
        self.inner.state.level()
    }

    /// The shared state this link mutates and its consumers read.
    pub fn state(&self) -> Arc<LinkState> {
        Arc::clone(&self.inner.state)
    }

    /// Peripherals surfaced by discovery so far, in arrival order.
    pub fn discovered_peripherals(&self) -> Vec<DiscoveredPeripheral> {
        self.inner
            .transport()
            .map(|t| t.discovered_peripherals())
            .unwrap_or_default()
    }
}

impl Drop for Link {
    fn drop(&mut self) {
        self.inner.abort_loops();
        if let Some(handle) = self.inner.watchdog.lock().take() {
            handle.abort();
        }
        if let Some(handle) = self.inner.busy_recovery.lock().take() {
            handle.abort();
        }
    }
}

impl LinkInner {
    fn transport(&self) -> Option<Arc<dyn Transport>> {
        self.transport.lock().clone()
    }

    fn is_connected(&self) -> bool {
        self.transport().is_some_and(|t| t.is_connected())
    }

    fn abort_loops(&self) {
        if let Some(handle) = self.event_loop.lock().take() {
            handle.abort();
        }
        if let Some(handle) = self.read_loop.lock().take() {
            handle.abort();
        }
    }

    async fn run_events(self: Arc<Self>, mut events: mpsc::UnboundedReceiver<TransportEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                TransportEvent::PeripheralDiscovered(peripheral) => {
                    tracing::debug!(id = %peripheral.id, name = %peripheral.name, "discovered");
                }
                TransportEvent::Connected => self.on_connect().await,
                TransportEvent::Disconnected { reason } => {
                    tracing::info!(%reason, "peripheral disconnected");
                    self.on_reset();
                }
            }
        }
    }

    /// Post-connect handshake: bring up the inbound channel, resolve the
    /// peripheral's identity, then ask it to report its version.
    async fn on_connect(self: &Arc<Self>) {
        let Some(transport) = self.transport() else {
            return;
        };

        let frames = match transport.subscribe(UART_SERVICE, RX_CHARACTERISTIC).await {
            Ok(frames) => frames,
            Err(e) => {
                tracing::warn!("inbound subscribe failed: {e}");
                return;
            }
        };

        if self.peripheral_id.lock().is_none() {
            if let Some(first) = transport.discovered_peripherals().into_iter().next() {
                *self.peripheral_id.lock() = Some(first.id);
            }
        }
        let resolved = self.peripheral_id.lock().clone();
        if let Some(peripheral) = resolved.and_then(|id| transport.discovered(&id)) {
            self.state.set_name(&peripheral.name);
        }

        self.rearm_watchdog();

        let inner = Arc::clone(self);
        let handle = tokio::spawn(async move { inner.run_reader(frames).await });
        if let Some(old) = self.read_loop.lock().replace(handle) {
            old.abort();
        }

        self.send(VERSION_REQUEST);
    }

    async fn run_reader(self: Arc<Self>, mut frames: mpsc::UnboundedReceiver<Vec<u8>>) {
        while let Some(frame) = frames.recv().await {
            let text = String::from_utf8_lossy(&frame);
            if !self.dispatcher.dispatch(&text) {
                tracing::trace!(report = %text, "unclaimed report");
            }
            // every inbound message defers the liveness deadline, claimed or not
            self.rearm_watchdog();
        }
    }

    /// Flow-controlled write: at most one outstanding send; everything else
    /// is dropped, not queued.
    fn send(self: &Arc<Self>, message: &str) {
        if !self.is_connected() {
            tracing::debug!("send dropped: not connected");
            return;
        }
        if self.busy.swap(true, Ordering::SeqCst) {
            tracing::debug!("send dropped: link busy");
            return;
        }

        // Recovery timer: frees the link if the acknowledgment never arrives
        // (peripheral powered off mid-send). Racing the completion clear is
        // benign; both paths are idempotent.
        let recovery_inner = Arc::clone(self);
        let recovery = tokio::spawn(async move {
            tokio::time::sleep(recovery_inner.config.busy_recovery).await;
            recovery_inner.busy.store(false, Ordering::SeqCst);
        });
        if let Some(old) = self.busy_recovery.lock().replace(recovery) {
            old.abort();
        }

        let Some(transport) = self.transport() else {
            self.clear_busy();
            return;
        };
        let payload = format!("{message}\n").into_bytes();
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            match transport
                .write(UART_SERVICE, TX_CHARACTERISTIC, payload, true)
                .await
            {
                Ok(()) => inner.clear_busy(),
                // busy stays set; the recovery timer frees it
                Err(e) => tracing::warn!("write failed: {e}"),
            }
        });
    }

    fn clear_busy(&self) {
        self.busy.store(false, Ordering::SeqCst);
        if let Some(timer) = self.busy_recovery.lock().take() {
            timer.abort();
        }
    }

    /// Cancel-and-restart the liveness deadline. Disabled configurations
    /// never arm a timer.
    fn rearm_watchdog(self: &Arc<Self>) {
        let Some(timeout) = self.config.liveness_timeout else {
            return;
        };
        if timeout <= WATCHDOG_FLOOR {
            return;
        }

        let mut slot = self.watchdog.lock();
        if let Some(old) = slot.take() {
            old.abort();
        }
        let Some(transport) = self.transport() else {
            return;
        };
        *slot = Some(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            transport.handle_disconnect_error(DATA_STOPPED_ERROR);
        }));
    }

    /// Reset routine: runs on explicit disconnect and on transport-reported
    /// connection loss.
    fn on_reset(&self) {
        tracing::debug!("link reset");
        if let Some(handle) = self.watchdog.lock().take() {
            handle.abort();
        }
        *self.peripheral_id.lock() = None;
        self.state.reset();
    }
}
