//! Scripted in-memory hub for engine tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::time::timeout;

use prism_sync::transport::CloseReason;
use prism_sync::{
    Connection, ConnectionPeer, Connector, SyncConfig, SyncEngine, SyncError, SyncResult,
    TransportEvent,
};

/// How long a test waits for anything before failing.
pub const STEP: Duration = Duration::from_secs(3);

/// Timestamp later than anything in [`snapshot`].
pub const LATER: &str = "2030-01-01T00:00:00.000000Z";
pub const EARLIER: &str = "2020-01-01T00:00:00.000000Z";
pub const SNAPSHOT_TIME: &str = "2025-01-01T00:00:00.000000Z";

// =============================================================================
// Connector
// =============================================================================

/// Hands every new connection's far end to the test.
pub struct MockConnector {
    sessions: mpsc::UnboundedSender<ConnectionPeer>,
    refuse_next: AtomicU32,
    attempts: AtomicU32,
}

impl MockConnector {
    /// The next `n` connection attempts fail.
    pub fn refuse(&self, n: u32) {
        self.refuse_next.store(n, Ordering::SeqCst);
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, _endpoint: &str) -> SyncResult<Connection> {
        self.attempts.fetch_add(1, Ordering::SeqCst);

        let refused = self
            .refuse_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(SyncError::ConnectionFailed("connection refused".into()));
        }

        let (conn, peer) = Connection::pair(64);
        self.sessions
            .send(peer)
            .map_err(|_| SyncError::ConnectionFailed("hub gone".into()))?;
        Ok(conn)
    }
}

// =============================================================================
// Hub
// =============================================================================

pub struct MockHub {
    sessions: mpsc::UnboundedReceiver<ConnectionPeer>,
    pub connector: Arc<MockConnector>,
}

impl MockHub {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let connector = Arc::new(MockConnector {
            sessions: tx,
            refuse_next: AtomicU32::new(0),
            attempts: AtomicU32::new(0),
        });
        MockHub {
            sessions: rx,
            connector,
        }
    }

    /// Waits for the engine to open a connection.
    pub async fn accept(&mut self) -> HubSession {
        let peer = timeout(STEP, self.sessions.recv())
            .await
            .expect("engine did not connect in time")
            .expect("connector dropped");
        HubSession { peer }
    }
}

/// Config with fast timings for tests.
pub fn test_config() -> SyncConfig {
    let mut config = SyncConfig::default();
    config.hub.url = Some("http://hub.test:8123".into());
    config.hub.token = Some(prism_sync::AccessToken::new("test-token"));
    config.sync.initial_backoff_ms = 20;
    config.sync.max_backoff_secs = 1;
    config.sync.handshake_timeout_secs = 2;
    config.sync.command_timeout_ms = 2_000;
    config.sync.sweep_interval_ms = 20;
    config
}

/// Engine started against a fresh mock hub.
pub fn start_engine(config: SyncConfig) -> (SyncEngine, MockHub) {
    let hub = MockHub::new();
    let mut engine = SyncEngine::new(config, hub.connector.clone());
    engine.start().expect("engine should start");
    (engine, hub)
}

// =============================================================================
// Session
// =============================================================================

/// What the engine did during a handshake.
#[derive(Debug, Clone, PartialEq)]
pub struct Handshake {
    /// `(subscription_id, event_type)` in the order requested.
    pub subscriptions: Vec<(u64, String)>,
    pub snapshot_id: u64,
}

impl Handshake {
    pub fn subscription_for(&self, event_type: &str) -> u64 {
        self.subscriptions
            .iter()
            .find(|(_, t)| t == event_type)
            .map(|(id, _)| *id)
            .expect("event type was not subscribed")
    }

    pub fn event_types(&self) -> Vec<String> {
        self.subscriptions.iter().map(|(_, t)| t.clone()).collect()
    }
}

pub struct HubSession {
    peer: ConnectionPeer,
}

impl HubSession {
    pub async fn send(&self, frame: Value) {
        self.send_raw(&frame.to_string()).await;
    }

    pub async fn send_raw(&self, text: &str) {
        self.peer
            .to_client
            .send(TransportEvent::Frame(text.to_string()))
            .await
            .expect("engine side closed");
    }

    pub async fn close(&self, reason: CloseReason) {
        let _ = self.peer.to_client.send(TransportEvent::Closed(reason)).await;
    }

    /// Next frame from the engine, parsed.
    pub async fn recv(&mut self) -> Value {
        let frame = timeout(STEP, self.peer.from_client.recv())
            .await
            .expect("engine sent nothing in time")
            .expect("engine closed the connection");
        serde_json::from_str(&frame).expect("engine sent invalid JSON")
    }

    /// Next frame, which must be of `kind`.
    pub async fn expect(&mut self, kind: &str) -> Value {
        let frame = self.recv().await;
        assert_eq!(frame["type"], kind, "unexpected frame: {frame}");
        frame
    }

    /// True if the engine has closed its side.
    pub async fn closed_by_engine(&mut self) -> bool {
        matches!(timeout(STEP, self.peer.from_client.recv()).await, Ok(None))
    }

    pub async fn authenticate(&mut self) {
        self.send(json!({"type": "auth_required", "ha_version": "2025.1.0"}))
            .await;
        let auth = self.expect("auth").await;
        assert_eq!(auth["access_token"], "test-token");
        self.send(json!({"type": "auth_ok", "ha_version": "2025.1.0"}))
            .await;
    }

    /// Full handshake: auth, ack every subscription, answer `get_states`.
    pub async fn handshake(&mut self, states: Value) -> Handshake {
        self.authenticate().await;

        let mut subscriptions = Vec::new();
        loop {
            let frame = self.recv().await;
            let id = frame["id"].as_u64().expect("request without id");
            match frame["type"].as_str() {
                Some("subscribe_events") => {
                    let event_type = frame["event_type"].as_str().unwrap_or_default().to_string();
                    subscriptions.push((id, event_type));
                    self.result_ok(id, Value::Null).await;
                }
                Some("get_states") => {
                    self.result_ok(id, states).await;
                    return Handshake {
                        subscriptions,
                        snapshot_id: id,
                    };
                }
                other => panic!("unexpected frame during handshake: {other:?}"),
            }
        }
    }

    pub async fn result_ok(&self, id: u64, result: Value) {
        self.send(json!({"id": id, "type": "result", "success": true, "result": result}))
            .await;
    }

    pub async fn result_err(&self, id: u64, code: &str, message: &str) {
        self.send(json!({
            "id": id,
            "type": "result",
            "success": false,
            "error": {"code": code, "message": message}
        }))
        .await;
    }

    pub async fn state_changed(&self, subscription_id: u64, entity_id: &str, state: &str, at: &str) {
        self.send(state_event(subscription_id, entity_id, Some(state_object(entity_id, state, at)), at))
            .await;
    }
}

// =============================================================================
// Frames
// =============================================================================

pub fn state_object(entity_id: &str, state: &str, at: &str) -> Value {
    json!({
        "entity_id": entity_id,
        "state": state,
        "attributes": {},
        "last_changed": at,
        "last_updated": at,
    })
}

pub fn state_event(subscription_id: u64, entity_id: &str, new_state: Option<Value>, at: &str) -> Value {
    json!({
        "id": subscription_id,
        "type": "event",
        "event": {
            "event_type": "state_changed",
            "data": {
                "entity_id": entity_id,
                "new_state": new_state,
            },
            "time_fired": at,
        }
    })
}

/// `(entity_id, state)` pairs as a `get_states` result.
pub fn snapshot(entities: &[(&str, &str)]) -> Value {
    Value::Array(
        entities
            .iter()
            .map(|(id, state)| state_object(id, state, SNAPSHOT_TIME))
            .collect(),
    )
}
