//! Realtime hub.
//!
//! Publish/subscribe layer between the coordinator and connected stations.
//! Every connection gets a bounded outbound channel; events are addressed to
//! everyone, to a room, to a device (`device:<id>` room) or to one connection.
//!
//! A slow station never blocks the others: when its channel is full the
//! event is dropped for that station and counted.
//!
//! Until [`RealtimeHub::initialize`] has been called every emit is a no-op,
//! so request handling keeps working while the realtime layer is down.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use dashmap::DashMap;
use protocol::{Envelope, StationKind};
use serde::Serialize;
use serde_json::{json, Map, Value};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::clock::Clock;

/// Unique identifier for a station connection.
pub type ConnectionId = String;

/// Default per-connection channel capacity.
pub const DEFAULT_STATION_BUFFER: usize = 256;

/// Room joined by the station that registered `device_id`.
pub fn device_room(device_id: &str) -> String {
    format!("device:{}", device_id)
}

/// Room joined by every station of `kind`.
pub fn kind_room(kind: StationKind) -> String {
    format!("type:{}", kind.as_str())
}

/// Errors returned by hub operations that need a live hub.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum HubError {
    #[error("realtime hub is not initialized")]
    NotInitialized,

    #[error("unknown connection: {0}")]
    UnknownConnection(ConnectionId),
}

/// Describes the transport the hub is attached to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportBinding {
    /// Transport name, e.g. `websocket`.
    pub kind: String,
    /// Address the transport listens on, if any.
    pub local_addr: Option<SocketAddr>,
}

impl TransportBinding {
    pub fn websocket(local_addr: SocketAddr) -> Self {
        Self {
            kind: "websocket".to_string(),
            local_addr: Some(local_addr),
        }
    }

    /// A binding with no listening socket, for in-process stations.
    pub fn in_process() -> Self {
        Self {
            kind: "in-process".to_string(),
            local_addr: None,
        }
    }
}

/// A newly connected station: its id and the stream of events addressed to it.
pub struct StationHandle {
    pub id: ConnectionId,
    pub events: mpsc::Receiver<Envelope>,
}

/// Device a connection registered as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoundDevice {
    pub device_id: String,
    pub kind: StationKind,
}

/// What was known about a connection when it went away.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisconnectedStation {
    pub id: ConnectionId,
    pub device: Option<BoundDevice>,
}

/// Per-connection delivery statistics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub remote: Option<SocketAddr>,
    pub device: Option<BoundDevice>,
    pub rooms: Vec<String>,
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub is_backpressured: bool,
}

/// Member count of one room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RoomStats {
    pub name: String,
    pub clients: usize,
}

/// Hub-wide connection statistics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStats {
    pub total_connections: usize,
    pub rooms: Vec<RoomStats>,
    pub timestamp: String,
}

/// Adds `timestamp` (if absent) and `serverTime` to an outbound payload.
///
/// Objects are stamped in place; `null` becomes an empty object and any other
/// value is wrapped as `{"data": value}`.
pub fn stamp_payload(payload: Value, clock: &dyn Clock) -> Value {
    let mut object = match payload {
        Value::Object(map) => map,
        Value::Null => Map::new(),
        other => {
            let mut map = Map::new();
            map.insert("data".to_string(), other);
            map
        }
    };
    object
        .entry("timestamp")
        .or_insert_with(|| Value::String(clock.now_iso()));
    object.insert("serverTime".to_string(), json!(clock.now_millis()));
    Value::Object(object)
}

struct StationConnection {
    id: ConnectionId,
    remote: Option<SocketAddr>,
    tx: mpsc::Sender<Envelope>,
    device: Mutex<Option<BoundDevice>>,
    rooms: Mutex<HashSet<String>>,
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
    backpressured: AtomicBool,
}

impl StationConnection {
    fn try_send(&self, envelope: Envelope) -> bool {
        match self.tx.try_send(envelope) {
            Ok(()) => {
                self.messages_sent.fetch_add(1, Ordering::Relaxed);
                if self.backpressured.swap(false, Ordering::Relaxed) {
                    debug!(connection_id = %self.id, "Station recovered from backpressure");
                }
                true
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                let dropped = self.messages_dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if !self.backpressured.swap(true, Ordering::Relaxed) {
                    warn!(
                        connection_id = %self.id,
                        dropped,
                        "Station is backpressured, dropping events"
                    );
                }
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(connection_id = %self.id, "Station channel closed");
                false
            }
        }
    }

    fn device(&self) -> Option<BoundDevice> {
        self.device.lock().ok().and_then(|d| d.clone())
    }

    fn rooms(&self) -> Vec<String> {
        let mut rooms: Vec<String> = self
            .rooms
            .lock()
            .map(|r| r.iter().cloned().collect())
            .unwrap_or_default();
        rooms.sort();
        rooms
    }
}

/// Live hub state. Exists only between `initialize` and `shutdown`.
pub struct HubCore {
    binding: TransportBinding,
    connections: DashMap<ConnectionId, Arc<StationConnection>>,
    rooms: DashMap<String, HashSet<ConnectionId>>,
    clock: Arc<dyn Clock>,
    station_buffer: usize,
}

impl HubCore {
    /// Transport this hub is attached to.
    pub fn binding(&self) -> &TransportBinding {
        &self.binding
    }

    fn connect(&self, remote: Option<SocketAddr>) -> StationHandle {
        let id = uuid::Uuid::new_v4().to_string();
        let (tx, events) = mpsc::channel(self.station_buffer);
        let connection = Arc::new(StationConnection {
            id: id.clone(),
            remote,
            tx,
            device: Mutex::new(None),
            rooms: Mutex::new(HashSet::new()),
            messages_sent: AtomicU64::new(0),
            messages_dropped: AtomicU64::new(0),
            backpressured: AtomicBool::new(false),
        });
        self.connections.insert(id.clone(), connection);
        info!(
            connection_id = %id,
            remote = ?remote,
            total = self.connections.len(),
            "Station connected"
        );
        StationHandle { id, events }
    }

    fn disconnect(&self, id: &str) -> Option<DisconnectedStation> {
        let (_, connection) = self.connections.remove(id)?;
        let rooms: Vec<String> = connection
            .rooms
            .lock()
            .map(|mut r| r.drain().collect())
            .unwrap_or_default();
        for room in rooms {
            self.remove_member(&room, id);
        }
        let device = connection.device();
        info!(
            connection_id = %id,
            device_id = ?device.as_ref().map(|d| d.device_id.as_str()),
            total = self.connections.len(),
            "Station disconnected"
        );
        Some(DisconnectedStation {
            id: id.to_string(),
            device,
        })
    }

    fn join(&self, id: &str, room: &str) -> Result<(), HubError> {
        let connection = self
            .connections
            .get(id)
            .map(|c| Arc::clone(c.value()))
            .ok_or_else(|| HubError::UnknownConnection(id.to_string()))?;
        if let Ok(mut rooms) = connection.rooms.lock() {
            rooms.insert(room.to_string());
        }
        self.rooms
            .entry(room.to_string())
            .or_default()
            .insert(id.to_string());
        debug!(connection_id = %id, room = %room, "Joined room");
        Ok(())
    }

    fn leave(&self, id: &str, room: &str) -> bool {
        if let Some(connection) = self.connections.get(id).map(|c| Arc::clone(c.value())) {
            if let Ok(mut rooms) = connection.rooms.lock() {
                rooms.remove(room);
            }
        }
        self.remove_member(room, id)
    }

    fn remove_member(&self, room: &str, id: &str) -> bool {
        let removed = self
            .rooms
            .get_mut(room)
            .map(|mut members| members.remove(id))
            .unwrap_or(false);
        self.rooms.remove_if(room, |_, members| members.is_empty());
        removed
    }

    fn bind_device(&self, id: &str, device_id: &str, kind: StationKind) -> Result<(), HubError> {
        let connection = self
            .connections
            .get(id)
            .map(|c| Arc::clone(c.value()))
            .ok_or_else(|| HubError::UnknownConnection(id.to_string()))?;

        let previous = connection
            .device
            .lock()
            .ok()
            .and_then(|mut d| d.replace(BoundDevice {
                device_id: device_id.to_string(),
                kind,
            }));
        if let Some(previous) = previous {
            self.leave(id, &device_room(&previous.device_id));
            self.leave(id, &kind_room(previous.kind));
        }

        self.join(id, &device_room(device_id))?;
        self.join(id, &kind_room(kind))?;
        info!(connection_id = %id, device_id = %device_id, kind = kind.as_str(), "Device bound");
        Ok(())
    }

    fn envelope(&self, event: &str, payload: Value) -> Envelope {
        Envelope::new(event, stamp_payload(payload, self.clock.as_ref()))
    }

    fn send_to_ids(&self, ids: impl IntoIterator<Item = ConnectionId>, envelope: &Envelope) -> usize {
        let mut delivered = 0;
        for id in ids {
            let connection = self.connections.get(&id).map(|c| Arc::clone(c.value()));
            if let Some(connection) = connection {
                if connection.try_send(envelope.clone()) {
                    delivered += 1;
                }
            }
        }
        delivered
    }

    fn connection_ids(&self) -> Vec<ConnectionId> {
        self.connections.iter().map(|c| c.key().clone()).collect()
    }

    fn room_members(&self, room: &str) -> Vec<ConnectionId> {
        self.rooms
            .get(room)
            .map(|members| members.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn stats(&self) -> ConnectionStats {
        let mut rooms: Vec<RoomStats> = self
            .rooms
            .iter()
            .map(|entry| RoomStats {
                name: entry.key().clone(),
                clients: entry.value().len(),
            })
            .collect();
        rooms.sort_by(|a, b| a.name.cmp(&b.name));
        ConnectionStats {
            total_connections: self.connections.len(),
            rooms,
            timestamp: self.clock.now_iso(),
        }
    }
}

/// Handle to the process-wide realtime hub.
///
/// Cheap to share behind an `Arc`; all methods take `&self`.
pub struct RealtimeHub {
    core: RwLock<Option<Arc<HubCore>>>,
    clock: Arc<dyn Clock>,
    station_buffer: usize,
}

impl RealtimeHub {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self::with_station_buffer(clock, DEFAULT_STATION_BUFFER)
    }

    /// Hub whose stations each buffer up to `station_buffer` events.
    pub fn with_station_buffer(clock: Arc<dyn Clock>, station_buffer: usize) -> Self {
        Self {
            core: RwLock::new(None),
            clock,
            station_buffer: station_buffer.max(1),
        }
    }

    /// Attach the hub to a transport.
    ///
    /// Returns the existing core if the hub is already initialized.
    pub fn initialize(&self, binding: TransportBinding) -> Arc<HubCore> {
        let mut guard = self.core.write().unwrap_or_else(|e| e.into_inner());
        if let Some(core) = guard.as_ref() {
            debug!(kind = %core.binding.kind, "Realtime hub already initialized");
            return Arc::clone(core);
        }

        info!(kind = %binding.kind, addr = ?binding.local_addr, "Realtime hub initialized");
        let core = Arc::new(HubCore {
            binding,
            connections: DashMap::new(),
            rooms: DashMap::new(),
            clock: Arc::clone(&self.clock),
            station_buffer: self.station_buffer,
        });
        *guard = Some(Arc::clone(&core));
        core
    }

    pub fn is_initialized(&self) -> bool {
        self.core().is_some()
    }

    fn core(&self) -> Option<Arc<HubCore>> {
        self.core.read().ok().and_then(|c| c.clone())
    }

    fn live_core(&self, event: &str) -> Option<Arc<HubCore>> {
        let core = self.core();
        if core.is_none() {
            debug!(event = %event, "Realtime hub not initialized, dropping event");
        }
        core
    }

    /// Detach from the transport and drop every connection.
    ///
    /// Returns the number of connections that were open.
    pub fn shutdown(&self) -> usize {
        let core = self
            .core
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        match core {
            Some(core) => {
                let count = core.connections.len();
                core.connections.clear();
                core.rooms.clear();
                info!(connections = count, "Realtime hub shut down");
                count
            }
            None => 0,
        }
    }

    // =========================================================================
    // Membership
    // =========================================================================

    /// Register a new station connection.
    pub fn connect(&self, remote: Option<SocketAddr>) -> Result<StationHandle, HubError> {
        self.core()
            .map(|core| core.connect(remote))
            .ok_or(HubError::NotInitialized)
    }

    /// Remove a connection and its room memberships.
    pub fn disconnect(&self, id: &str) -> Option<DisconnectedStation> {
        self.core()?.disconnect(id)
    }

    pub fn join(&self, id: &str, room: &str) -> Result<(), HubError> {
        self.core().ok_or(HubError::NotInitialized)?.join(id, room)
    }

    /// Leave a room. Returns whether the connection was a member.
    pub fn leave(&self, id: &str, room: &str) -> bool {
        self.core().map(|core| core.leave(id, room)).unwrap_or(false)
    }

    /// Mark a connection as `device_id` and join its device and kind rooms.
    pub fn bind_device(&self, id: &str, device_id: &str, kind: StationKind) -> Result<(), HubError> {
        self.core()
            .ok_or(HubError::NotInitialized)?
            .bind_device(id, device_id, kind)
    }

    /// The device a connection registered as.
    pub fn device_of(&self, id: &str) -> Option<BoundDevice> {
        let core = self.core()?;
        let connection = core.connections.get(id).map(|c| Arc::clone(c.value()))?;
        connection.device()
    }

    pub fn connection_info(&self, id: &str) -> Option<ConnectionInfo> {
        let core = self.core()?;
        let connection = core.connections.get(id).map(|c| Arc::clone(c.value()))?;
        Some(ConnectionInfo {
            id: connection.id.clone(),
            remote: connection.remote,
            device: connection.device(),
            rooms: connection.rooms(),
            messages_sent: connection.messages_sent.load(Ordering::Relaxed),
            messages_dropped: connection.messages_dropped.load(Ordering::Relaxed),
            is_backpressured: connection.backpressured.load(Ordering::Relaxed),
        })
    }

    pub fn connection_count(&self) -> usize {
        self.core().map(|core| core.connections.len()).unwrap_or(0)
    }

    /// Total connections and per-room member counts. `None` when uninitialized.
    pub fn connection_stats(&self) -> Option<ConnectionStats> {
        self.core().map(|core| core.stats())
    }

    // =========================================================================
    // Emitting
    // =========================================================================

    /// Send to every connection. Returns the number of stations reached.
    pub fn emit_to_all(&self, event: &str, payload: Value) -> usize {
        let Some(core) = self.live_core(event) else {
            return 0;
        };
        let envelope = core.envelope(event, payload);
        core.send_to_ids(core.connection_ids(), &envelope)
    }

    /// Send to every member of `room`.
    pub fn emit_to_room(&self, room: &str, event: &str, payload: Value) -> usize {
        let Some(core) = self.live_core(event) else {
            return 0;
        };
        let envelope = core.envelope(event, payload);
        core.send_to_ids(core.room_members(room), &envelope)
    }

    /// Send to the station(s) registered as `device_id`.
    pub fn emit_to_device(&self, device_id: &str, event: &str, payload: Value) -> usize {
        self.emit_to_room(&device_room(device_id), event, payload)
    }

    /// Send to a single connection.
    pub fn emit_to_connection(&self, id: &str, event: &str, payload: Value) -> bool {
        let Some(core) = self.live_core(event) else {
            return false;
        };
        let envelope = core.envelope(event, payload);
        core.send_to_ids([id.to_string()], &envelope) == 1
    }

    /// Send to every connection except `id`.
    pub fn broadcast_except(&self, id: &str, event: &str, payload: Value) -> usize {
        let Some(core) = self.live_core(event) else {
            return 0;
        };
        let envelope = core.envelope(event, payload);
        let targets = core.connection_ids().into_iter().filter(|c| c != id);
        core.send_to_ids(targets, &envelope)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::TimeZone;

    fn test_clock() -> Arc<ManualClock> {
        Arc::new(ManualClock::new(
            chrono::Utc.with_ymd_and_hms(2026, 10, 18, 8, 0, 0).unwrap(),
        ))
    }

    fn create_hub() -> (RealtimeHub, Arc<ManualClock>) {
        let clock = test_clock();
        (RealtimeHub::new(clock.clone()), clock)
    }

    #[test]
    fn test_stamp_object_keeps_timestamp() {
        let (_hub, clock) = create_hub();
        let stamped = stamp_payload(json!({"timestamp": "earlier", "a": 1}), clock.as_ref());
        assert_eq!(stamped["timestamp"], "earlier");
        assert_eq!(stamped["a"], 1);
        assert_eq!(stamped["serverTime"], json!(clock.now_millis()));
    }

    #[test]
    fn test_stamp_wraps_scalars() {
        let (_hub, clock) = create_hub();
        let stamped = stamp_payload(json!([1, 2]), clock.as_ref());
        assert_eq!(stamped["data"], json!([1, 2]));
        assert_eq!(stamped["timestamp"], "2026-10-18T08:00:00.000Z");

        let empty = stamp_payload(Value::Null, clock.as_ref());
        assert!(empty.get("serverTime").is_some());
        assert!(empty.get("data").is_none());
    }

    #[test]
    fn test_uninitialized_is_noop() {
        let (hub, _clock) = create_hub();
        assert!(!hub.is_initialized());
        assert_eq!(hub.emit_to_all("x", json!({})), 0);
        assert_eq!(hub.emit_to_room("room", "x", json!({})), 0);
        assert_eq!(hub.emit_to_device("d1", "x", json!({})), 0);
        assert!(!hub.emit_to_connection("c", "x", json!({})));
        assert!(hub.connection_stats().is_none());
        assert_eq!(hub.connect(None).err(), Some(HubError::NotInitialized));
        assert!(hub.disconnect("c").is_none());
    }

    #[test]
    fn test_initialize_is_idempotent() {
        let (hub, _clock) = create_hub();
        let first = hub.initialize(TransportBinding::in_process());
        let second = hub.initialize(TransportBinding::websocket("127.0.0.1:1".parse().unwrap()));
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.binding().kind, "in-process");
    }

    #[tokio::test]
    async fn test_emit_to_all_and_device() {
        let (hub, _clock) = create_hub();
        hub.initialize(TransportBinding::in_process());

        let mut display = hub.connect(None).unwrap();
        let mut window = hub.connect(None).unwrap();
        hub.bind_device(&display.id, "display-1", StationKind::Display)
            .unwrap();

        assert_eq!(hub.emit_to_all("hello", json!({"n": 1})), 2);
        assert_eq!(display.events.recv().await.unwrap().event, "hello");
        let got = window.events.recv().await.unwrap();
        assert_eq!(got.data["n"], 1);
        assert!(got.data.get("serverTime").is_some());

        assert_eq!(hub.emit_to_device("display-1", "only-you", json!({})), 1);
        assert_eq!(display.events.recv().await.unwrap().event, "only-you");
        assert!(window.events.try_recv().is_err());

        assert_eq!(
            hub.emit_to_room(&kind_room(StationKind::Display), "displays", json!({})),
            1
        );
        assert_eq!(hub.broadcast_except(&display.id, "others", json!({})), 1);
        assert_eq!(window.events.recv().await.unwrap().event, "others");
    }

    #[test]
    fn test_stats_and_disconnect() {
        let (hub, _clock) = create_hub();
        hub.initialize(TransportBinding::in_process());
        let a = hub.connect(None).unwrap();
        let b = hub.connect(None).unwrap();
        hub.bind_device(&a.id, "win-1", StationKind::Window).unwrap();
        hub.join(&b.id, "type:window").unwrap();

        let stats = hub.connection_stats().unwrap();
        assert_eq!(stats.total_connections, 2);
        assert_eq!(
            stats.rooms,
            vec![
                RoomStats {
                    name: "device:win-1".to_string(),
                    clients: 1
                },
                RoomStats {
                    name: "type:window".to_string(),
                    clients: 2
                },
            ]
        );
        let value = serde_json::to_value(&stats).unwrap();
        assert_eq!(value["totalConnections"], 2);

        let gone = hub.disconnect(&a.id).unwrap();
        assert_eq!(gone.device.unwrap().device_id, "win-1");
        let stats = hub.connection_stats().unwrap();
        assert_eq!(stats.total_connections, 1);
        assert_eq!(stats.rooms.len(), 1);
        assert!(hub.disconnect(&a.id).is_none());
    }

    #[test]
    fn test_rebind_moves_rooms() {
        let (hub, _clock) = create_hub();
        hub.initialize(TransportBinding::in_process());
        let station = hub.connect(None).unwrap();
        hub.bind_device(&station.id, "old", StationKind::Customer)
            .unwrap();
        hub.bind_device(&station.id, "new", StationKind::Admin).unwrap();

        let info = hub.connection_info(&station.id).unwrap();
        assert_eq!(info.rooms, vec!["device:new", "type:admin"]);
        assert_eq!(hub.emit_to_device("old", "x", json!({})), 0);
    }

    #[test]
    fn test_slow_station_is_backpressured() {
        let hub = RealtimeHub::with_station_buffer(test_clock(), 2);
        hub.initialize(TransportBinding::in_process());
        let slow = hub.connect(None).unwrap();
        let mut fast = hub.connect(None).unwrap();

        for i in 0..5 {
            hub.emit_to_all("tick", json!({"i": i}));
            assert_eq!(fast.events.try_recv().unwrap().data["i"], i);
        }

        let info = hub.connection_info(&slow.id).unwrap();
        assert_eq!(info.messages_sent, 2);
        assert_eq!(info.messages_dropped, 3);
        assert!(info.is_backpressured);
        assert_eq!(hub.connection_info(&fast.id).unwrap().messages_dropped, 0);
    }

    #[test]
    fn test_shutdown_drops_connections() {
        let (hub, _clock) = create_hub();
        hub.initialize(TransportBinding::in_process());
        let mut station = hub.connect(None).unwrap();
        assert_eq!(hub.shutdown(), 1);
        assert!(!hub.is_initialized());
        // All senders are gone, so the receiver sees the end of the stream.
        assert!(station.events.try_recv().is_err());
        assert_eq!(hub.emit_to_all("x", json!({})), 0);
    }
}
