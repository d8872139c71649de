//! Relay-socket transport: JSON-RPC 2.0 over a local WebSocket bridge.
//!
//! The bridge owns the actual radio; this client drives it with `discover`,
//! `connect`, `write` and `read` requests and consumes the bridge's
//! `didDiscoverPeripheral` / `characteristicDidChange` notifications.
//!
//! # Message flow
//!
//! 1. A request gets a unique id and a oneshot callback slot
//! 2. The writer task puts the serialized request on the socket
//! 3. The reader task correlates responses by id and fires the callback
//! 4. Notifications (no id) feed the discovery registry or the inbound
//!    frame channel

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::transport::{
    DiscoveredPeripheral, DiscoveryFilter, InboundFrames, Transport, TransportEvent, TransportKind,
};

/// Default endpoint of the local relay bridge.
pub const DEFAULT_RELAY_URL: &str = "ws://127.0.0.1:20111/scratch/ble";

/// Request sent to the relay.
#[derive(Debug, Serialize)]
struct RpcRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: Value,
}

/// Reply to a request, correlated by id.
#[derive(Debug, Deserialize)]
struct RpcResponse {
    id: u64,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcErrorPayload>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorPayload {
    code: i64,
    message: String,
}

/// Unsolicited message from the relay (no `id` field).
#[derive(Debug, Deserialize)]
struct RpcNotification {
    method: String,
    #[serde(default)]
    params: Value,
}

/// Discriminated union of relay messages.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RpcMessage {
    Response(RpcResponse),
    Notification(RpcNotification),
    /// Forward-compatible catch-all.
    Unknown(Value),
}

/// Pending request callbacks keyed by request id.
type CallbackMap = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<Value>>>>>;

/// Removes the pending callback if a request future is dropped before the
/// relay answers.
struct CancelGuard {
    id: u64,
    callbacks: CallbackMap,
    completed: bool,
}

impl CancelGuard {
    fn complete(&mut self) {
        self.completed = true;
    }
}

impl Drop for CancelGuard {
    fn drop(&mut self) {
        if !self.completed && self.callbacks.lock().remove(&self.id).is_some() {
            tracing::debug!(id = self.id, "removed orphaned relay callback");
        }
    }
}

/// State shared with the reader task.
struct RelayShared {
    callbacks: CallbackMap,
    connected: AtomicBool,
    discovered: Mutex<Vec<DiscoveredPeripheral>>,
    inbound: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    events_tx: mpsc::UnboundedSender<TransportEvent>,
}

impl RelayShared {
    fn handle_frame(&self, text: &str) {
        match serde_json::from_str::<RpcMessage>(text) {
            Ok(RpcMessage::Response(response)) => self.handle_response(response),
            Ok(RpcMessage::Notification(notification)) => {
                self.handle_notification(&notification.method, &notification.params);
            }
            Ok(RpcMessage::Unknown(value)) => {
                tracing::debug!(%value, "unrecognized relay message (ignored)");
            }
            Err(e) => tracing::error!("failed to parse relay message: {e}"),
        }
    }

    fn handle_response(&self, response: RpcResponse) {
        let Some(callback) = self.callbacks.lock().remove(&response.id) else {
            tracing::debug!(id = response.id, "relay response without a pending request");
            return;
        };
        let result = match response.error {
            Some(error) => Err(Error::Relay {
                code: error.code,
                message: error.message,
            }),
            None => Ok(response.result.unwrap_or(Value::Null)),
        };
        let _ = callback.send(result);
    }

    fn handle_notification(&self, method: &str, params: &Value) {
        match method {
            "didDiscoverPeripheral" => match parse_discovered(params) {
                Some(peripheral) => self.record_discovered(peripheral),
                None => tracing::debug!(%params, "malformed discovery notification"),
            },
            "characteristicDidChange" => match decode_payload(params) {
                Some(bytes) => {
                    if let Some(tx) = self.inbound.lock().as_ref() {
                        let _ = tx.send(bytes);
                    }
                }
                None => tracing::debug!("malformed characteristic notification"),
            },
            other => tracing::debug!(method = other, "unhandled relay notification"),
        }
    }

    fn record_discovered(&self, peripheral: DiscoveredPeripheral) {
        let mut discovered = self.discovered.lock();
        match discovered.iter_mut().find(|p| p.id == peripheral.id) {
            Some(existing) => *existing = peripheral,
            None => {
                tracing::debug!(id = %peripheral.id, name = %peripheral.name, "peripheral discovered");
                discovered.push(peripheral.clone());
                drop(discovered);
                let _ = self
                    .events_tx
                    .send(TransportEvent::PeripheralDiscovered(peripheral));
            }
        }
    }

    /// Dropping the callbacks wakes every pending request with
    /// `Error::ChannelClosed`.
    fn on_socket_closed(&self, reason: &str) {
        self.connected.store(false, Ordering::SeqCst);
        self.callbacks.lock().clear();
        let _ = self.events_tx.send(TransportEvent::Disconnected {
            reason: reason.to_string(),
        });
    }
}

/// WebSocket client for the relay bridge.
pub struct RelayTransport {
    shared: Arc<RelayShared>,
    next_id: AtomicU64,
    outbound_tx: mpsc::UnboundedSender<WsMessage>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<TransportEvent>>>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl RelayTransport {
    /// Opens the relay socket and starts discovery with `filter`.
    pub async fn open(url: &str, filter: &DiscoveryFilter) -> Result<Self> {
        let (socket, _) = connect_async(url)
            .await
            .map_err(|e| Error::RelayUnreachable {
                url: url.to_string(),
                reason: e.to_string(),
            })?;
        let (mut sink, mut stream) = socket.split();

        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<WsMessage>();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let shared = Arc::new(RelayShared {
            callbacks: Arc::new(Mutex::new(HashMap::new())),
            connected: AtomicBool::new(false),
            discovered: Mutex::new(Vec::new()),
            inbound: Mutex::new(None),
            events_tx,
        });

        let writer = tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                if let Err(e) = sink.send(message).await {
                    tracing::error!("relay write error: {e}");
                    break;
                }
            }
        });

        let reader_shared = Arc::clone(&shared);
        let reader = tokio::spawn(async move {
            while let Some(message) = stream.next().await {
                match message {
                    Ok(WsMessage::Text(text)) => reader_shared.handle_frame(&text),
                    Ok(WsMessage::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        tracing::error!("relay read error: {e}");
                        break;
                    }
                }
            }
            reader_shared.on_socket_closed("relay socket closed");
        });

        let transport = Self {
            shared,
            next_id: AtomicU64::new(0),
            outbound_tx,
            events_rx: Mutex::new(Some(events_rx)),
            reader,
            writer,
        };

        transport.request("discover", discover_params(filter)).await?;

        Ok(transport)
    }

    /// Sends a request to the relay and awaits the correlated response.
    async fn request(&self, method: &str, params: Value) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);

        let (tx, rx) = oneshot::channel();
        self.shared.callbacks.lock().insert(id, tx);
        let mut guard = CancelGuard {
            id,
            callbacks: Arc::clone(&self.shared.callbacks),
            completed: false,
        };

        let request = RpcRequest {
            jsonrpc: "2.0",
            id,
            method,
            params,
        };
        let text = serde_json::to_string(&request)?;
        tracing::trace!(%text, "relay request");

        if self.outbound_tx.send(WsMessage::Text(text)).is_err() {
            return Err(Error::ChannelClosed);
        }

        let result = rx.await.map_err(|_| Error::ChannelClosed).and_then(|r| r);
        guard.complete();
        result
    }
}

impl Transport for RelayTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Relay
    }

    fn connect_peripheral(&self, id: &str) -> BoxFuture<'_, Result<()>> {
        let id = id.to_string();
        Box::pin(async move {
            self.request("connect", json!({ "peripheralId": peripheral_id_value(&id) }))
                .await?;
            self.shared.connected.store(true, Ordering::SeqCst);
            let _ = self.shared.events_tx.send(TransportEvent::Connected);
            Ok(())
        })
    }

    fn disconnect(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.shared.connected.store(false, Ordering::SeqCst);
            let _ = self.outbound_tx.send(WsMessage::Close(None));
            Ok(())
        })
    }

    fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    fn write(
        &self,
        service: Uuid,
        characteristic: Uuid,
        payload: Vec<u8>,
        with_response: bool,
    ) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.request(
                "write",
                write_params(service, characteristic, &payload, with_response),
            )
            .await?;
            Ok(())
        })
    }

    fn subscribe(
        &self,
        service: Uuid,
        characteristic: Uuid,
    ) -> BoxFuture<'_, Result<InboundFrames>> {
        Box::pin(async move {
            let (tx, rx) = mpsc::unbounded_channel();
            *self.shared.inbound.lock() = Some(tx);
            let result = self
                .request(
                    "read",
                    json!({
                        "serviceId": service.to_string(),
                        "characteristicId": characteristic.to_string(),
                        "startNotifications": true,
                    }),
                )
                .await?;
            // the read reply may carry the characteristic's current value
            if let Some(bytes) = decode_payload(&result) {
                if let Some(tx) = self.shared.inbound.lock().as_ref() {
                    let _ = tx.send(bytes);
                }
            }
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
        tracing::error!(reason, "relay link failure, forcing disconnect");
        self.shared.connected.store(false, Ordering::SeqCst);
        let _ = self.outbound_tx.send(WsMessage::Close(None));
        let _ = self.shared.events_tx.send(TransportEvent::Disconnected {
            reason: reason.to_string(),
        });
    }
}

impl Drop for RelayTransport {
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
    }
}

fn discover_params(filter: &DiscoveryFilter) -> Value {
    json!({
        "filters": [
            { "services": [filter.service.to_string()] },
            { "namePrefix": filter.name_prefix },
        ]
    })
}

fn write_params(service: Uuid, characteristic: Uuid, payload: &[u8], with_response: bool) -> Value {
    json!({
        "serviceId": service.to_string(),
        "characteristicId": characteristic.to_string(),
        "message": BASE64.encode(payload),
        "encoding": "base64",
        "withResponse": with_response,
    })
}

fn parse_discovered(params: &Value) -> Option<DiscoveredPeripheral> {
    let id = peripheral_id_string(params.get("peripheralId")?)?;
    let name = params
        .get("name")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let rssi = params.get("rssi").and_then(Value::as_i64).map(|v| v as i16);
    Some(DiscoveredPeripheral { id, name, rssi })
}

/// Relay implementations disagree on id types; normalize both to a string.
fn peripheral_id_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Round-trip a normalized id back to the wire type the relay expects.
fn peripheral_id_value(id: &str) -> Value {
    match id.parse::<u64>() {
        Ok(n) => Value::from(n),
        Err(_) => Value::from(id),
    }
}

fn decode_payload(params: &Value) -> Option<Vec<u8>> {
    let message = params.get("message")?.as_str()?;
    match params.get("encoding").and_then(Value::as_str) {
        Some("base64") | None => BASE64.decode(message).ok(),
        Some(other) => {
            tracing::debug!(encoding = other, "unsupported payload encoding");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{TX_CHARACTERISTIC, UART_SERVICE};

    fn test_shared() -> (Arc<RelayShared>, mpsc::UnboundedReceiver<TransportEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(RelayShared {
            callbacks: Arc::new(Mutex::new(HashMap::new())),
            connected: AtomicBool::new(false),
            discovered: Mutex::new(Vec::new()),
            inbound: Mutex::new(None),
            events_tx,
        });
        (shared, events_rx)
    }

    #[tokio::test]
    async fn responses_resolve_pending_callbacks() {
        let (shared, _events) = test_shared();
        let (tx, rx) = oneshot::channel();
        shared.callbacks.lock().insert(7, tx);

        shared.handle_frame(r#"{"jsonrpc":"2.0","id":7,"result":{"ok":true}}"#);

        let value = rx.await.unwrap().unwrap();
        assert_eq!(value["ok"], true);
        assert!(shared.callbacks.lock().is_empty());
    }

    #[tokio::test]
    async fn error_responses_resolve_to_relay_errors() {
        let (shared, _events) = test_shared();
        let (tx, rx) = oneshot::channel();
        shared.callbacks.lock().insert(1, tx);

        shared.handle_frame(
            r#"{"jsonrpc":"2.0","id":1,"error":{"code":-32000,"message":"write rejected"}}"#,
        );

        let error = rx.await.unwrap().unwrap_err();
        assert!(matches!(error, Error::Relay { code: -32000, .. }));
    }

    #[tokio::test]
    async fn socket_close_fails_pending_requests_and_reports_loss() {
        let (shared, mut events) = test_shared();
        shared.connected.store(true, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        shared.callbacks.lock().insert(3, tx);

        shared.on_socket_closed("relay socket closed");

        assert!(rx.await.is_err());
        assert!(!shared.connected.load(Ordering::SeqCst));
        assert!(matches!(
            events.recv().await,
            Some(TransportEvent::Disconnected { .. })
        ));
    }

    #[tokio::test]
    async fn notifications_feed_discovery_and_inbound_channels() {
        let (shared, mut events) = test_shared();
        let (inbound_tx, mut inbound_rx) = mpsc::unbounded_channel();
        *shared.inbound.lock() = Some(inbound_tx);

        shared.handle_frame(
            r#"{"jsonrpc":"2.0","method":"didDiscoverPeripheral","params":{"peripheralId":7,"name":"BBC micro:bit [zotut]","rssi":-60}}"#,
        );
        assert!(matches!(
            events.recv().await,
            Some(TransportEvent::PeripheralDiscovered(p)) if p.id == "7"
        ));
        assert_eq!(shared.discovered.lock().len(), 1);

        let payload = BASE64.encode(b"DV3");
        shared.handle_frame(&format!(
            r#"{{"jsonrpc":"2.0","method":"characteristicDidChange","params":{{"message":"{payload}","encoding":"base64"}}}}"#
        ));
        assert_eq!(inbound_rx.recv().await.unwrap(), b"DV3");
    }

    #[test]
    fn rediscovery_updates_in_place_without_duplicates() {
        let (shared, mut events) = test_shared();
        shared.record_discovered(DiscoveredPeripheral {
            id: "7".to_string(),
            name: "BBC micro:bit".to_string(),
            rssi: Some(-70),
        });
        shared.record_discovered(DiscoveredPeripheral {
            id: "7".to_string(),
            name: "BBC micro:bit [zotut]".to_string(),
            rssi: Some(-55),
        });

        let discovered = shared.discovered.lock();
        assert_eq!(discovered.len(), 1);
        assert_eq!(discovered[0].name, "BBC micro:bit [zotut]");
        // only the first sighting produced an event
        assert!(events.try_recv().is_ok());
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn responses_and_notifications_discriminate() {
        let message: RpcMessage =
            serde_json::from_str(r#"{"jsonrpc":"2.0","id":3,"result":null}"#).unwrap();
        assert!(matches!(message, RpcMessage::Response(r) if r.id == 3));

        let message: RpcMessage = serde_json::from_str(
            r#"{"jsonrpc":"2.0","method":"didDiscoverPeripheral","params":{"peripheralId":7}}"#,
        )
        .unwrap();
        assert!(matches!(
            message,
            RpcMessage::Notification(n) if n.method == "didDiscoverPeripheral"
        ));
    }

    #[test]
    fn error_responses_carry_code_and_message() {
        let message: RpcMessage = serde_json::from_str(
            r#"{"jsonrpc":"2.0","id":1,"error":{"code":-32601,"message":"no such method"}}"#,
        )
        .unwrap();
        let RpcMessage::Response(response) = message else {
            panic!("expected a response");
        };
        let error = response.error.unwrap();
        assert_eq!(error.code, -32601);
        assert_eq!(error.message, "no such method");
    }

    #[test]
    fn write_params_encode_the_payload_as_base64() {
        let params = write_params(UART_SERVICE, TX_CHARACTERISTIC, b"PING\n", true);
        assert_eq!(params["serviceId"], "6e400001-b5a3-f393-e0a9-e50e24dcca9e");
        assert_eq!(
            params["characteristicId"],
            "6e400003-b5a3-f393-e0a9-e50e24dcca9e"
        );
        assert_eq!(params["encoding"], "base64");
        assert_eq!(params["withResponse"], true);
        assert_eq!(
            BASE64.decode(params["message"].as_str().unwrap()).unwrap(),
            b"PING\n"
        );
    }

    #[test]
    fn discover_params_carry_service_and_name_prefix_filters() {
        let params = discover_params(&DiscoveryFilter::default());
        assert_eq!(
            params["filters"][0]["services"][0],
            UART_SERVICE.to_string()
        );
        assert_eq!(params["filters"][1]["namePrefix"], "BBC micro:bit");
    }

    #[test]
    fn numeric_and_string_peripheral_ids_normalize() {
        let params = json!({ "peripheralId": 42, "name": "BBC micro:bit [zotut]", "rssi": -60 });
        let peripheral = parse_discovered(&params).unwrap();
        assert_eq!(peripheral.id, "42");
        assert_eq!(peripheral.name, "BBC micro:bit [zotut]");
        assert_eq!(peripheral.rssi, Some(-60));
        assert_eq!(peripheral_id_value(&peripheral.id), json!(42));

        let params = json!({ "peripheralId": "aa:bb:cc" });
        let peripheral = parse_discovered(&params).unwrap();
        assert_eq!(peripheral.id, "aa:bb:cc");
        assert_eq!(peripheral_id_value(&peripheral.id), json!("aa:bb:cc"));
    }

    #[test]
    fn characteristic_payloads_decode_from_base64() {
        let params = json!({ "message": BASE64.encode(b"DV3"), "encoding": "base64" });
        assert_eq!(decode_payload(&params).unwrap(), b"DV3");

        let params = json!({ "message": "DV3", "encoding": "utf8" });
        assert!(decode_payload(&params).is_none());

        // encoding defaults to base64 when omitted
        let params = json!({ "message": BASE64.encode(b"x") });
        assert_eq!(decode_payload(&params).unwrap(), b"x");
    }
}
