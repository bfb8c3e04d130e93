//! # prism-sync: State Synchronization Engine for Prism
//!
//! Keeps a local mirror of a Home Assistant hub's entities in step with the
//! hub over its WebSocket API, and sends user commands back with optimistic
//! local updates.
//!
//! ## Architecture Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Sync Engine Architecture                         │
//! │                                                                         │
//! │  ┌──────────────────────────────────────────────────────────────────┐  │
//! │  │                   SyncEngine (Main Orchestrator)                 │  │
//! │  │                                                                  │  │
//! │  │  One Tokio worker per engine: handshake, event loop, backoff     │  │
//! │  │  Sole writer of ConnectionState and the EntityStore              │  │
//! │  └────────────────────────────┬─────────────────────────────────────┘  │
//! │                               │                                         │
//! │     ┌──────────────┬──────────┼──────────┬────────────────┐            │
//! │     ▼              ▼          ▼          ▼                ▼            │
//! │  ┌────────┐  ┌──────────┐ ┌────────┐ ┌────────────┐ ┌────────────┐    │
//! │  │ Socket │  │ Protocol │ │ Entity │ │  Command   │ │ Reconnect  │    │
//! │  │        │  │  Codec   │ │ Store  │ │ Dispatcher │ │  Policy    │    │
//! │  │ WS +   │  │ HA JSON  │ │ Arc map│ │ optimistic │ │ exp backoff│    │
//! │  │ pings  │  │ frames   │ │ + diffs│ │ + rollback │ │ + retries  │    │
//! │  └────────┘  └──────────┘ └────────┘ └────────────┘ └────────────┘    │
//! │                                                                         │
//! │  Request ledger: id → subscribe / snapshot / command                    │
//! │  Subscriptions: requested event types, ids bound per connection         │
//! │                                                                         │
//! │  OUTPUTS (to a frontend):                                              │
//! │  • ConnectionState via watch channel and SyncEventEmitter::emit_state  │
//! │  • ChangeNotification stream per store subscriber                      │
//! │  • HubNotification via broadcast and SyncEventEmitter                  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//! - [`engine`] - `SyncEngine` orchestrator and its worker
//! - [`config`] - TOML + environment configuration
//! - [`error`] - Sync error types
//! - [`protocol`] - Wire messages and the codec
//! - [`transport`] - Connection abstraction and the WebSocket connector
//! - [`store`] - Entity mirror with change notifications
//! - [`dispatcher`] - Pending commands, supersede, rollback
//! - [`ledger`] - Matches result frames to requests
//! - [`subscription`] - Subscription bookkeeping and the entity filter
//! - [`supervisor`] - Connection states and reconnect policy
//! - [`notifications`] - Hub notifications for toasts
//!
//! ## Usage
//!
//! ```rust,ignore
//! use prism_sync::{SyncConfig, SyncEngine};
//!
//! let config = SyncConfig::load(None)?;
//! let mut engine = SyncEngine::from_config(config);
//! engine.start()?;
//! engine.wait_until_synced(Duration::from_secs(30)).await?;
//!
//! let kitchen = "light.kitchen".parse()?;
//! let handle = engine.issue(&kitchen, "state", "on").await?;
//! handle.outcome().await?;
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod config;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod ledger;
pub mod notifications;
pub mod protocol;
pub mod store;
pub mod subscription;
pub mod supervisor;
pub mod transport;

// =============================================================================
// Re-exports
// =============================================================================

pub use config::{AccessToken, SyncConfig};
pub use dispatcher::CommandHandle;
pub use engine::{NoOpEmitter, SyncEngine, SyncEventEmitter, SyncStatus};
pub use error::{CommandError, DecodeError, SyncError, SyncResult};
pub use notifications::HubNotification;
pub use store::{ChangeNotification, ChangeOrigin, ChangeStream, EntityStore};
pub use subscription::{EntityFilter, SubscriptionSet};
pub use supervisor::ConnectionState;
pub use transport::{Connection, ConnectionPeer, Connector, TransportEvent, WebSocketConnector};
