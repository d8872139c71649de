//! Native wireless transport: direct GATT connection through the system's
//! wireless stack (BlueZ / CoreBluetooth / WinRT via btleplug).
//!
//! Discovery runs for the lifetime of the transport: the central's event
//! stream feeds the discovered-peripherals registry, and a disconnect event
//! for the connected peripheral surfaces on the lifecycle channel just like
//! a relay socket closing would.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use btleplug::api::{Central, CentralEvent, Characteristic, Manager as _, Peripheral as _};
use btleplug::api::{ScanFilter, WriteType};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures_util::StreamExt;
use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::transport::{
    DiscoveredPeripheral, DiscoveryFilter, InboundFrames, Transport, TransportEvent, TransportKind,
};

/// State shared with the scan loop.
struct NativeShared {
    adapter: Adapter,
    connected: AtomicBool,
    current: Mutex<Option<Peripheral>>,
    discovered: Mutex<Vec<DiscoveredPeripheral>>,
    events_tx: mpsc::UnboundedSender<TransportEvent>,
}

impl NativeShared {
    async fn inspect_peripheral(&self, id: &PeripheralId, name_prefix: &str, service: Uuid) {
        let Ok(peripheral) = self.adapter.peripheral(id).await else {
            return;
        };
        let Ok(Some(properties)) = peripheral.properties().await else {
            return;
        };
        let name = properties.local_name.unwrap_or_default();
        if !name.starts_with(name_prefix) && !properties.services.contains(&service) {
            return;
        }

        let entry = DiscoveredPeripheral {
            id: id.to_string(),
            name,
            rssi: properties.rssi,
        };
        let mut discovered = self.discovered.lock();
        match discovered.iter_mut().find(|p| p.id == entry.id) {
            Some(existing) => *existing = entry,
            None => {
                tracing::debug!(id = %entry.id, name = %entry.name, "peripheral discovered");
                discovered.push(entry.clone());
                drop(discovered);
                let _ = self
                    .events_tx
                    .send(TransportEvent::PeripheralDiscovered(entry));
            }
        }
    }

    fn on_peripheral_lost(&self, id: &PeripheralId) {
        let is_current = self
            .current
            .lock()
            .as_ref()
            .is_some_and(|p| p.id() == *id);
        if is_current {
            self.connected.store(false, Ordering::SeqCst);
            let _ = self.events_tx.send(TransportEvent::Disconnected {
                reason: "peripheral connection lost".to_string(),
            });
        }
    }

    fn current(&self) -> Result<Peripheral> {
        self.current
            .lock()
            .clone()
            .ok_or_else(|| Error::Transport("no connected peripheral".to_string()))
    }

    fn find_characteristic(peripheral: &Peripheral, uuid: Uuid) -> Result<Characteristic> {
        peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == uuid)
            .ok_or_else(|| Error::Transport(format!("characteristic {uuid} not found")))
    }
}

/// Direct GATT transport.
pub struct NativeTransport {
    shared: Arc<NativeShared>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<TransportEvent>>>,
    scan_loop: JoinHandle<()>,
}

impl NativeTransport {
    /// Grabs the first wireless adapter and starts a filtered scan.
    pub async fn open(filter: &DiscoveryFilter) -> Result<Self> {
        let manager = Manager::new().await?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or(Error::NoAdapter)?;

        let mut central_events = adapter.events().await?;
        adapter
            .start_scan(ScanFilter {
                services: vec![filter.service],
            })
            .await?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(NativeShared {
            adapter,
            connected: AtomicBool::new(false),
            current: Mutex::new(None),
            discovered: Mutex::new(Vec::new()),
            events_tx,
        });

        let loop_shared = Arc::clone(&shared);
        let name_prefix = filter.name_prefix.clone();
        let service = filter.service;
        let scan_loop = tokio::spawn(async move {
            while let Some(event) = central_events.next().await {
                match event {
                    CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => {
                        loop_shared
                            .inspect_peripheral(&id, &name_prefix, service)
                            .await;
                    }
                    CentralEvent::DeviceDisconnected(id) => loop_shared.on_peripheral_lost(&id),
                    _ => {}
                }
            }
        });

        Ok(Self {
            shared,
            events_rx: Mutex::new(Some(events_rx)),
            scan_loop,
        })
    }
}

impl Transport for NativeTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Native
    }

    fn connect_peripheral(&self, id: &str) -> BoxFuture<'_, Result<()>> {
        let id = id.to_string();
        Box::pin(async move {
            let peripheral = self
                .shared
                .adapter
                .peripherals()
                .await?
                .into_iter()
                .find(|p| p.id().to_string() == id)
                .ok_or_else(|| Error::UnknownPeripheral(id.clone()))?;

            peripheral.connect().await?;
            peripheral.discover_services().await?;

            *self.shared.current.lock() = Some(peripheral);
            self.shared.connected.store(true, Ordering::SeqCst);
            let _ = self.shared.events_tx.send(TransportEvent::Connected);
            Ok(())
        })
    }

    fn disconnect(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.shared.connected.store(false, Ordering::SeqCst);
            let peripheral = self.shared.current.lock().take();
            if let Some(peripheral) = peripheral {
                peripheral.disconnect().await?;
            }
            Ok(())
        })
    }

    fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    fn write(
        &self,
        _service: Uuid,
        characteristic: Uuid,
        payload: Vec<u8>,
        with_response: bool,
    ) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let peripheral = self.shared.current()?;
            let target = NativeShared::find_characteristic(&peripheral, characteristic)?;
            let write_type = if with_response {
                WriteType::WithResponse
            } else {
                WriteType::WithoutResponse
            };
            peripheral.write(&target, &payload, write_type).await?;
            Ok(())
        })
    }

    fn subscribe(
        &self,
        _service: Uuid,
        characteristic: Uuid,
    ) -> BoxFuture<'_, Result<InboundFrames>> {
        Box::pin(async move {
            let peripheral = self.shared.current()?;
            let target = NativeShared::find_characteristic(&peripheral, characteristic)?;
            peripheral.subscribe(&target).await?;

            let mut notifications = peripheral.notifications().await?;
            let (tx, rx) = mpsc::unbounded_channel();
            tokio::spawn(async move {
                while let Some(notification) = notifications.next().await {
                    if notification.uuid == characteristic && tx.send(notification.value).is_err() {
                        break;
                    }
                }
            });
            Ok(rx)
        })
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<TransportEvent>> {
        self.events_rx.lock().take()
    }

    fn discovered(&self, id: &str) -> Option<DiscoveredPeripheral> {
        self.shared
            .discovered
            .lock()
            .iter()
            .find(|p| p.id == id)
            .cloned()
    }

    fn discovered_peripherals(&self) -> Vec<DiscoveredPeripheral> {
        self.shared.discovered.lock().clone()
    }

    fn handle_disconnect_error(&self, reason: &str) {
        tracing::error!(reason, "wireless link failure, forcing disconnect");
        self.shared.connected.store(false, Ordering::SeqCst);
        let peripheral = self.shared.current.lock().take();
        if let Some(peripheral) = peripheral {
            tokio::spawn(async move {
                let _ = peripheral.disconnect().await;
            });
        }
        let _ = self.shared.events_tx.send(TransportEvent::Disconnected {
            reason: reason.to_string(),
        });
    }
}

impl Drop for NativeTransport {
    fn drop(&mut self) {
        self.scan_loop.abort();
    }
}
