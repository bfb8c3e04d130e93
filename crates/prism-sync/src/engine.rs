//! # Sync Engine
//!
//! Owns the connection lifecycle and is the only writer to the entity store.
//!
//! ## Engine Architecture
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        SyncEngine Architecture                          │
//! │                                                                         │
//! │   callers (UI, CLI)                         worker task (one)           │
//! │   ─────────────────                         ─────────────────           │
//! │   issue() ─────┐                                                        │
//! │   perform() ───┼── EngineRequest (mpsc) ──►  ┌───────────────────────┐  │
//! │   call_service()┘                            │ session():            │  │
//! │                                              │  connect              │  │
//! │   stop() ──────── shutdown (watch) ───────►  │  auth                 │  │
//! │                                              │  subscribe_events × N │  │
//! │   connection_state() ◄── ConnectionState ──  │  get_states           │  │
//! │   watch_connection()      (watch)            │  apply snapshot       │  │
//! │                                              │  Synced loop          │  │
//! │   store().get() ◄──── EntityStore ◄───────── │ backoff, repeat       │  │
//! │   store().subscribe()  (Arc snapshots)       └───────────────────────┘  │
//! │                                                                         │
//! │   notifications() ◄── HubNotification (broadcast)                       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Inbound frames, command requests and deadline sweeps all run on the
//! worker, one at a time. Callers only ever read shared state.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, sleep_until, Instant, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};

use prism_core::{
    plan_action, resolve_command, Attribute, AttributeValue, Debouncer, EntityKey, OptimisticWrite,
    ServiceCall, WidgetAction,
};

use crate::config::{AccessToken, SyncConfig};
use crate::dispatcher::{CommandDispatcher, CommandHandle};
use crate::error::{CommandError, SyncError, SyncResult};
use crate::ledger::{Reply, RequestKind, RequestLedger};
use crate::notifications::HubNotification;
use crate::protocol::{self, AuthOutcome, ClientMessage, HubMessage, StateChange};
use crate::store::EntityStore;
use crate::subscription::{EntityFilter, SubscriptionSet};
use crate::supervisor::{ConnectionState, ReconnectPolicy, SessionEnd};
use crate::transport::{Connection, Connector, TransportConfig, TransportEvent, WebSocketConnector};

const REQUEST_QUEUE: usize = 64;
const NOTIFICATION_QUEUE: usize = 64;

// =============================================================================
// Event Emitter Trait
// =============================================================================

/// Receives engine events for a frontend.
pub trait SyncEventEmitter: Send + Sync {
    fn emit_state(&self, state: ConnectionState);

    fn emit_error(&self, message: &str, retryable: bool);

    fn emit_notification(&self, notification: &HubNotification);
}

/// Emitter that discards everything.
pub struct NoOpEmitter;

impl SyncEventEmitter for NoOpEmitter {
    fn emit_state(&self, _state: ConnectionState) {}
    fn emit_error(&self, _message: &str, _retryable: bool) {}
    fn emit_notification(&self, _notification: &HubNotification) {}
}

// =============================================================================
// Sync Status
// =============================================================================

/// Point-in-time summary for status displays.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncStatus {
    pub connection_state: ConnectionState,
    pub endpoint: Option<String>,
    pub entity_count: usize,
    pub last_error: Option<String>,
}

/// Why the worker stopped on its own.
#[derive(Debug, Clone, PartialEq)]
enum Halt {
    AuthRejected(String),
    RetriesExhausted(u32),
}

impl From<&Halt> for SyncError {
    fn from(halt: &Halt) -> Self {
        match halt {
            Halt::AuthRejected(message) => SyncError::AuthenticationFailed(message.clone()),
            Halt::RetriesExhausted(attempts) => SyncError::RetriesExhausted(*attempts),
        }
    }
}

/// Work handed to the worker by callers.
enum EngineRequest {
    Command {
        call: ServiceCall,
        optimistic: Option<(EntityKey, OptimisticWrite)>,
        reply: oneshot::Sender<SyncResult<CommandHandle>>,
    },
}

impl EngineRequest {
    fn refuse(self, err: SyncError) {
        match self {
            EngineRequest::Command { reply, .. } => {
                let _ = reply.send(Err(err));
            }
        }
    }
}

/// State shared between the engine handle and its worker.
struct Shared {
    state: watch::Sender<ConnectionState>,
    subscriptions: Mutex<SubscriptionSet>,
    notifications: broadcast::Sender<HubNotification>,
    halt: Mutex<Option<Halt>>,
    last_error: Mutex<Option<String>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Running {
    requests: mpsc::Sender<EngineRequest>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

// =============================================================================
// Sync Engine
// =============================================================================

/// Handle to the synchronization engine.
///
/// Dropping a running engine signals its worker to shut down.
pub struct SyncEngine {
    config: Arc<SyncConfig>,
    connector: Arc<dyn Connector>,
    emitter: Arc<dyn SyncEventEmitter>,
    store: EntityStore,
    shared: Arc<Shared>,
    debouncer: Mutex<Debouncer>,
    endpoint: Option<String>,
    running: Option<Running>,
}

impl SyncEngine {
    pub fn new(config: SyncConfig, connector: Arc<dyn Connector>) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (notifications, _) = broadcast::channel(NOTIFICATION_QUEUE);
        let shared = Shared {
            state,
            subscriptions: Mutex::new(SubscriptionSet::new(config.sync.event_types.iter().cloned())),
            notifications,
            halt: Mutex::new(None),
            last_error: Mutex::new(None),
        };

        SyncEngine {
            debouncer: Mutex::new(Debouncer::new(config.actions.debounce())),
            config: Arc::new(config),
            connector,
            emitter: Arc::new(NoOpEmitter),
            store: EntityStore::new(),
            shared: Arc::new(shared),
            endpoint: None,
            running: None,
        }
    }

    /// Engine talking WebSocket to the configured hub.
    pub fn from_config(config: SyncConfig) -> Self {
        let connector = WebSocketConnector::new(TransportConfig::from(&config.sync));
        Self::new(config, Arc::new(connector))
    }

    pub fn with_emitter(mut self, emitter: Arc<dyn SyncEventEmitter>) -> Self {
        self.emitter = emitter;
        self
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Spawns the worker. Must be called from within a Tokio runtime.
    ///
    /// Returns as soon as the worker is running; use
    /// [`SyncEngine::wait_until_synced`] to wait for the mirror.
    pub fn start(&mut self) -> SyncResult<()> {
        if self.running.as_ref().is_some_and(|r| !r.task.is_finished()) {
            return Err(SyncError::AlreadyStarted);
        }

        self.config.validate()?;
        let endpoint = self.config.websocket_url()?;
        let token = self.config.token()?;

        info!(endpoint = %endpoint, "Starting sync engine");

        *lock(&self.shared.halt) = None;
        let (requests_tx, requests_rx) = mpsc::channel(REQUEST_QUEUE);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let worker = Worker {
            endpoint: endpoint.clone(),
            token,
            connector: self.connector.clone(),
            emitter: self.emitter.clone(),
            store: self.store.clone(),
            shared: self.shared.clone(),
            filter: EntityFilter::new(&self.config.filter.entities),
            dispatcher: CommandDispatcher::new(self.config.sync.command_timeout()),
            policy: ReconnectPolicy::from_settings(&self.config.sync),
            config: self.config.clone(),
            requests: requests_rx,
            shutdown: shutdown_rx,
        };

        self.endpoint = Some(endpoint);
        self.running = Some(Running {
            requests: requests_tx,
            shutdown: shutdown_tx,
            task: tokio::spawn(worker.run()),
        });
        Ok(())
    }

    /// Stops the worker. Pending commands resolve as
    /// [`CommandError::Cancelled`]; the store keeps its contents.
    pub async fn stop(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };

        info!("Stopping sync engine");
        let _ = running.shutdown.send(true);
        drop(running.requests);
        if let Err(err) = running.task.await {
            error!(?err, "Sync worker ended abnormally");
        }
        info!("Sync engine stopped");
    }

    /// Waits until the mirror is live, the worker gives up, or `limit` passes.
    pub async fn wait_until_synced(&self, limit: Duration) -> SyncResult<()> {
        let mut state = self.shared.state.subscribe();

        let wait = async {
            loop {
                if state.borrow_and_update().is_synced() {
                    return Ok(());
                }
                if let Some(halt) = lock(&self.shared.halt).as_ref() {
                    return Err(SyncError::from(halt));
                }
                if self.running.is_none() {
                    return Err(SyncError::NotConnected);
                }
                if state.changed().await.is_err() {
                    return Err(SyncError::ShuttingDown);
                }
            }
        };

        tokio::time::timeout(limit, wait)
            .await
            .map_err(|_| SyncError::Timeout(limit.as_secs()))?
    }

    // =========================================================================
    // Observation
    // =========================================================================

    pub fn connection_state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    pub fn watch_connection(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    /// Read side of the mirror.
    pub fn store(&self) -> &EntityStore {
        &self.store
    }

    pub fn subscriptions(&self) -> SubscriptionSet {
        lock(&self.shared.subscriptions).clone()
    }

    pub fn notifications(&self) -> broadcast::Receiver<HubNotification> {
        self.shared.notifications.subscribe()
    }

    pub fn status(&self) -> SyncStatus {
        SyncStatus {
            connection_state: self.connection_state(),
            endpoint: self.endpoint.clone(),
            entity_count: self.store.len(),
            last_error: lock(&self.shared.last_error).clone(),
        }
    }

    // =========================================================================
    // Commands
    // =========================================================================

    /// Sets `attribute` of `entity` to `value` through the matching hub
    /// service, showing the value locally until the hub answers.
    pub async fn issue(
        &self,
        entity: &EntityKey,
        attribute: impl Into<Attribute>,
        value: impl Into<AttributeValue>,
    ) -> SyncResult<CommandHandle> {
        let attribute = attribute.into();
        let value = value.into();
        self.ensure_synced()?;

        let call = resolve_command(entity, &attribute, &value)?;
        self.submit(call, Some((entity.clone(), OptimisticWrite { attribute, value })))
            .await
    }

    /// Invokes a hub service without touching the local mirror.
    pub async fn call_service(&self, call: ServiceCall) -> SyncResult<CommandHandle> {
        self.ensure_synced()?;
        self.submit(call, None).await
    }

    /// Runs a widget action. Returns `Ok(None)` when the press was debounced.
    pub async fn perform(&self, action: WidgetAction) -> SyncResult<Option<CommandHandle>> {
        self.ensure_synced()?;

        let key = action.entity().clone();
        if action.is_debounced() && !lock(&self.debouncer).admit(&key, std::time::Instant::now()) {
            debug!(entity = %key, action = action.name(), "Debounced");
            return Ok(None);
        }

        let current = self.store.get(key.as_str());
        let plan = plan_action(&action, current.as_ref())?;
        // Unmirrored entities get the call without a local guess.
        let optimistic = plan
            .optimistic
            .filter(|_| current.is_some())
            .map(|write| (key, write));

        self.submit(plan.call, optimistic).await.map(Some)
    }

    fn ensure_synced(&self) -> SyncResult<()> {
        if self.connection_state().is_synced() {
            Ok(())
        } else {
            Err(SyncError::NotConnected)
        }
    }

    async fn submit(
        &self,
        call: ServiceCall,
        optimistic: Option<(EntityKey, OptimisticWrite)>,
    ) -> SyncResult<CommandHandle> {
        let running = self.running.as_ref().ok_or(SyncError::NotConnected)?;
        let (reply, response) = oneshot::channel();

        running
            .requests
            .send(EngineRequest::Command {
                call,
                optimistic,
                reply,
            })
            .await
            .map_err(|_| SyncError::ShuttingDown)?;

        response.await.map_err(|_| SyncError::ShuttingDown)?
    }
}

impl Drop for SyncEngine {
    fn drop(&mut self) {
        if let Some(running) = &self.running {
            let _ = running.shutdown.send(true);
        }
    }
}

// =============================================================================
// Worker
// =============================================================================

/// Why a session stopped without a transport failure.
enum Exit {
    Shutdown,
    Halt(Halt),
}

struct Worker {
    config: Arc<SyncConfig>,
    endpoint: String,
    token: AccessToken,
    connector: Arc<dyn Connector>,
    emitter: Arc<dyn SyncEventEmitter>,
    store: EntityStore,
    shared: Arc<Shared>,
    filter: EntityFilter,
    dispatcher: CommandDispatcher,
    policy: ReconnectPolicy,
    requests: mpsc::Receiver<EngineRequest>,
    shutdown: watch::Receiver<bool>,
}

impl Worker {
    async fn run(mut self) {
        debug!("Sync worker started");

        loop {
            let end = match self.session().await {
                Ok(end) => end,
                Err(Exit::Shutdown) => break,
                Err(Exit::Halt(halt)) => {
                    self.halt(halt);
                    break;
                }
            };

            lock(&self.shared.subscriptions).reset();
            let lost = self
                .dispatcher
                .fail_all(CommandError::ConnectionLost, &self.store);
            if lost > 0 {
                warn!(count = lost, "Pending commands failed with connection loss");
            }

            let Some(delay) = self.policy.next_delay(end) else {
                self.halt(Halt::RetriesExhausted(self.policy.failures()));
                break;
            };

            self.set_state(ConnectionState::Reconnecting);
            info!(?delay, "Reconnecting after backoff");
            if !self.idle(delay).await {
                break;
            }
        }

        self.dispatcher.fail_all(CommandError::Cancelled, &self.store);
        lock(&self.shared.subscriptions).reset();
        self.set_state(ConnectionState::Disconnected);
        debug!("Sync worker stopped");
    }

    // =========================================================================
    // Session
    // =========================================================================

    /// One connection, from connect until it drops.
    async fn session(&mut self) -> Result<SessionEnd, Exit> {
        self.set_state(ConnectionState::Connecting);

        let attempt = tokio::time::timeout(
            self.config.sync.connect_timeout(),
            self.connector.connect(&self.endpoint),
        );
        let connected = tokio::select! {
            result = attempt => result,
            _ = self.shutdown.changed() => return Err(Exit::Shutdown),
        };
        let mut conn = match connected {
            Ok(Ok(conn)) => conn,
            Ok(Err(err)) => {
                self.report_error(&format!("Connection failed: {}", err), true);
                return Ok(SessionEnd::Failed);
            }
            Err(_) => {
                self.report_error("Connection attempt timed out", true);
                return Ok(SessionEnd::Failed);
            }
        };

        let mut ledger = RequestLedger::new();
        let Some(backlog) = self.handshake(&mut conn, &mut ledger).await? else {
            return Ok(SessionEnd::Failed);
        };

        for message in backlog {
            self.on_message(message, &mut ledger);
        }
        self.set_state(ConnectionState::Synced);

        let synced_at = Instant::now();
        self.synced_loop(&mut conn, &mut ledger).await?;

        Ok(SessionEnd::Dropped {
            synced_for: synced_at.elapsed(),
        })
    }

    /// Auth, subscriptions and snapshot. Returns the events to replay after
    /// the snapshot, or `None` if this attempt failed.
    async fn handshake(
        &mut self,
        conn: &mut Connection,
        ledger: &mut RequestLedger,
    ) -> Result<Option<Vec<HubMessage>>, Exit> {
        let deadline = Instant::now() + self.config.sync.handshake_timeout();
        self.set_state(ConnectionState::Authenticating);

        match self.next_message(conn, deadline).await? {
            Some(HubMessage::AuthChallenge { hub_version }) => {
                debug!(?hub_version, "Hub requested authentication");
            }
            Some(other) => return Ok(self.unexpected("auth_required", &other)),
            None => return Ok(None),
        }

        let auth = ClientMessage::Auth {
            access_token: self.token.clone(),
        };
        if !self.send(conn, &auth) {
            return Ok(None);
        }

        match self.next_message(conn, deadline).await? {
            Some(HubMessage::AuthResult(AuthOutcome::Accepted { hub_version })) => {
                info!(?hub_version, "Authenticated with hub");
            }
            Some(HubMessage::AuthResult(AuthOutcome::Rejected { message })) => {
                error!(message = %message, "Hub rejected the access token");
                return Err(Exit::Halt(Halt::AuthRejected(message)));
            }
            Some(other) => return Ok(self.unexpected("auth_ok", &other)),
            None => return Ok(None),
        }

        self.set_state(ConnectionState::Subscribing);
        let requested = lock(&self.shared.subscriptions).requested().to_vec();
        for event_type in requested {
            let id = ledger.register(RequestKind::Subscribe(event_type.clone()));
            if !self.send(conn, &ClientMessage::SubscribeEvents { id, event_type }) {
                return Ok(None);
            }
        }

        let mut backlog = Vec::new();
        while !lock(&self.shared.subscriptions).is_complete() {
            let Some(message) = self.next_message(conn, deadline).await? else {
                return Ok(None);
            };
            match message {
                HubMessage::Result(frame) => match ledger.classify(frame) {
                    Reply::SubscriptionAck {
                        subscription_id,
                        event_type,
                    } => {
                        debug!(subscription_id, event_type = %event_type, "Subscribed");
                        lock(&self.shared.subscriptions).bind(subscription_id, &event_type);
                    }
                    Reply::ErrorNotice { fault, .. } => {
                        self.report_error(&format!("Subscribe failed: {}: {}", fault.code, fault.message), true);
                        return Ok(None);
                    }
                    other => trace!(?other, "Ignoring reply while subscribing"),
                },
                event if event.subscription_id().is_some() => backlog.push(event),
                other => return Ok(self.unexpected("result", &other)),
            }
        }

        let snapshot_id = ledger.register(RequestKind::Snapshot);
        if !self.send(conn, &ClientMessage::GetStates { id: snapshot_id }) {
            return Ok(None);
        }

        let entities = loop {
            let Some(message) = self.next_message(conn, deadline).await? else {
                return Ok(None);
            };
            match message {
                HubMessage::Result(frame) => match ledger.classify(frame) {
                    Reply::Snapshot(entities) => break entities,
                    Reply::ErrorNotice { fault, .. } => {
                        self.report_error(&format!("Snapshot failed: {}: {}", fault.code, fault.message), true);
                        return Ok(None);
                    }
                    other => trace!(?other, "Ignoring reply while loading snapshot"),
                },
                event if event.subscription_id().is_some() => backlog.push(event),
                other => trace!(kind = other.type_name(), "Ignoring message while loading snapshot"),
            }
        };

        let received = entities.len();
        let mirrored: Vec<_> = entities
            .into_iter()
            .filter(|e| self.filter.allows(&e.key))
            .collect();
        let changed = self.store.apply_snapshot(mirrored);
        info!(received, mirrored = self.store.len(), changed, "Snapshot applied");

        let snapshot = self.store.snapshot();
        backlog.retain(|message| match message {
            HubMessage::StateChanged { change, .. } => {
                let stamp = change
                    .new_state
                    .as_ref()
                    .map_or(change.fired_at, |e| e.last_updated);
                snapshot
                    .get(&change.key)
                    .map_or(true, |known| stamp > known.last_updated)
            }
            _ => true,
        });
        Ok(Some(backlog))
    }

    /// Steady state: frames, commands and deadline sweeps until the
    /// connection drops.
    async fn synced_loop(&mut self, conn: &mut Connection, ledger: &mut RequestLedger) -> Result<(), Exit> {
        let mut sweep = interval(self.config.sync.sweep_interval());
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                event = conn.recv() => match event {
                    TransportEvent::Frame(frame) => self.on_frame(&frame, ledger),
                    TransportEvent::Closed(reason) => {
                        self.report_error(&format!("Connection lost: {}", reason), true);
                        return Ok(());
                    }
                },
                request = self.requests.recv() => match request {
                    Some(request) => {
                        if !self.on_request(request, conn, ledger) {
                            return Ok(());
                        }
                    }
                    None => return Err(Exit::Shutdown),
                },
                _ = sweep.tick() => {
                    self.dispatcher.expire(Instant::now(), &self.store);
                    self.retire(ledger);
                }
                _ = self.shutdown.changed() => return Err(Exit::Shutdown),
            }
        }
    }

    /// Waits out a backoff delay, refusing commands meanwhile. Returns
    /// `false` on shutdown.
    async fn idle(&mut self, delay: Duration) -> bool {
        let wake = sleep(delay);
        tokio::pin!(wake);

        loop {
            tokio::select! {
                _ = &mut wake => return true,
                request = self.requests.recv() => match request {
                    Some(request) => request.refuse(SyncError::NotConnected),
                    None => return false,
                },
                _ = self.shutdown.changed() => return false,
            }
        }
    }

    // =========================================================================
    // Inbound
    // =========================================================================

    /// Next decodable message before `deadline`, refusing commands while
    /// waiting. `None` means the connection closed or the deadline passed.
    async fn next_message(
        &mut self,
        conn: &mut Connection,
        deadline: Instant,
    ) -> Result<Option<HubMessage>, Exit> {
        loop {
            tokio::select! {
                event = conn.recv() => match event {
                    TransportEvent::Frame(frame) => match protocol::decode(&frame) {
                        Ok(message) => return Ok(Some(message)),
                        Err(err) => warn!(error = %err, "Dropping undecodable frame"),
                    },
                    TransportEvent::Closed(reason) => {
                        self.report_error(&format!("Connection closed during handshake: {}", reason), true);
                        return Ok(None);
                    }
                },
                request = self.requests.recv() => match request {
                    Some(request) => request.refuse(SyncError::NotConnected),
                    None => return Err(Exit::Shutdown),
                },
                _ = sleep_until(deadline) => {
                    self.report_error("Handshake timed out", true);
                    return Ok(None);
                }
                _ = self.shutdown.changed() => return Err(Exit::Shutdown),
            }
        }
    }

    fn on_frame(&mut self, frame: &str, ledger: &mut RequestLedger) {
        match protocol::decode(frame) {
            Ok(message) => self.on_message(message, ledger),
            Err(err) => warn!(error = %err, "Dropping undecodable frame"),
        }
    }

    fn on_message(&mut self, message: HubMessage, ledger: &mut RequestLedger) {
        if let Some(subscription_id) = message.subscription_id() {
            if !lock(&self.shared.subscriptions).is_active(subscription_id) {
                debug!(subscription_id, "Dropping event for inactive subscription");
                return;
            }
        }

        match message {
            HubMessage::Result(frame) => match ledger.classify(frame) {
                Reply::CommandResult {
                    correlation_id,
                    outcome,
                } => {
                    if !self.dispatcher.resolve(correlation_id, outcome, &self.store) {
                        debug!(correlation_id, "Ignoring result for a forgotten command");
                    }
                }
                Reply::ErrorNotice { id, fault, .. } => {
                    warn!(id, code = %fault.code, message = %fault.message, "Hub reported an error");
                    self.report_error(&format!("{}: {}", fault.code, fault.message), true);
                }
                Reply::Unmatched(id) => debug!(id, "Ignoring unmatched result"),
                other => trace!(?other, "Ignoring late session reply"),
            },
            HubMessage::StateChanged { change, .. } => self.on_state_change(change),
            HubMessage::ServiceCalled { call, .. } => {
                trace!(domain = %call.domain, service = %call.service, "Service called on hub");
                if let Some(notification) = HubNotification::from_service_call(&call) {
                    self.notify(notification);
                }
            }
            HubMessage::Event { event_type, .. } => trace!(event_type = %event_type, "Event"),
            other => warn!(kind = other.type_name(), "Unexpected message while synced"),
        }
    }

    fn on_state_change(&mut self, change: StateChange) {
        if let Some(notification) = HubNotification::from_state_change(&change) {
            self.notify(notification);
        }

        if !self.filter.allows(&change.key) {
            return;
        }

        let committed = self.dispatcher.confirm_entity(&change.key);
        if committed > 0 {
            debug!(entity = %change.key, committed, "Hub state confirmed pending commands");
        }
        self.store.apply_change(&change.key, change.new_state);
    }

    // =========================================================================
    // Outbound
    // =========================================================================

    /// Returns `false` if the connection can no longer be written to.
    fn on_request(&mut self, request: EngineRequest, conn: &Connection, ledger: &mut RequestLedger) -> bool {
        let EngineRequest::Command {
            call,
            optimistic,
            reply,
        } = request;

        let correlation_id = ledger.register(RequestKind::Command);
        let frame = match ClientMessage::call_service(correlation_id, call).encode() {
            Ok(frame) => frame,
            Err(err) => {
                ledger.forget(correlation_id);
                let _ = reply.send(Err(err));
                return true;
            }
        };

        let now = Instant::now();
        let handle = match optimistic {
            Some((key, write)) => {
                match self
                    .dispatcher
                    .begin(&self.store, correlation_id, key, write.attribute, write.value, now)
                {
                    Ok(handle) => handle,
                    Err(err) => {
                        ledger.forget(correlation_id);
                        let _ = reply.send(Err(err));
                        return true;
                    }
                }
            }
            None => self.dispatcher.begin_detached(correlation_id, now),
        };
        self.retire(ledger);

        let _ = reply.send(Ok(handle));
        match conn.try_send(frame) {
            Ok(()) => true,
            Err(err) => {
                self.report_error(&err.to_string(), true);
                false
            }
        }
    }

    /// Superseded and timed-out commands no longer expect a reply.
    fn retire(&mut self, ledger: &mut RequestLedger) {
        for id in self.dispatcher.take_retired() {
            ledger.forget(id);
        }
    }

    fn send(&self, conn: &Connection, message: &ClientMessage) -> bool {
        let frame = match message.encode() {
            Ok(frame) => frame,
            Err(err) => {
                error!(kind = message.type_name(), error = %err, "Failed to encode request");
                return false;
            }
        };
        trace!(kind = message.type_name(), id = ?message.id(), "Sending");
        match conn.try_send(frame) {
            Ok(()) => true,
            Err(err) => {
                self.report_error(&err.to_string(), true);
                false
            }
        }
    }

    // =========================================================================
    // Reporting
    // =========================================================================

    fn set_state(&self, next: ConnectionState) {
        let changed = self.shared.state.send_if_modified(|state| {
            if *state == next {
                false
            } else {
                *state = next;
                true
            }
        });
        if changed {
            info!(state = %next, "Connection state changed");
            self.emitter.emit_state(next);
        }
    }

    fn report_error(&self, message: &str, retryable: bool) {
        warn!(retryable, "{}", message);
        *lock(&self.shared.last_error) = Some(message.to_string());
        self.emitter.emit_error(message, retryable);
    }

    fn unexpected<T>(&self, expected: &str, got: &HubMessage) -> Option<T> {
        let err = SyncError::UnexpectedMessageType {
            expected: expected.to_string(),
            actual: got.type_name().to_string(),
        };
        self.report_error(&err.to_string(), true);
        None
    }

    fn halt(&self, halt: Halt) {
        let err = SyncError::from(&halt);
        *lock(&self.shared.halt) = Some(halt);
        self.report_error(&err.to_string(), false);
    }

    fn notify(&self, notification: HubNotification) {
        info!(title = %notification.title, "Hub notification");
        self.emitter.emit_notification(&notification);
        // No receivers is fine.
        let _ = self.shared.notifications.send(notification);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> SyncConfig {
        let mut config = SyncConfig::default();
        config.hub.url = Some("http://hub.local:8123".into());
        config.hub.token = Some(AccessToken::new("secret"));
        config
    }

    #[tokio::test]
    async fn test_commands_refused_before_start() {
        let engine = SyncEngine::from_config(config());
        let key: EntityKey = "light.kitchen".parse().unwrap();

        assert!(matches!(
            engine.issue(&key, Attribute::State, "on").await,
            Err(SyncError::NotConnected)
        ));
        assert!(matches!(
            engine.perform(WidgetAction::Toggle { entity: key }).await,
            Err(SyncError::NotConnected)
        ));
        assert_eq!(engine.connection_state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_start_requires_token() {
        let mut cfg = config();
        cfg.hub.token = None;
        let mut engine = SyncEngine::from_config(cfg);
        assert!(matches!(engine.start(), Err(SyncError::MissingToken)));
        assert!(matches!(
            engine.wait_until_synced(Duration::from_millis(10)).await,
            Err(SyncError::NotConnected)
        ));
    }

    #[test]
    fn test_halt_maps_to_error() {
        let err = SyncError::from(&Halt::AuthRejected("Invalid access token".into()));
        assert!(matches!(err, SyncError::AuthenticationFailed(_)));
        assert!(!err.is_retryable());

        let err = SyncError::from(&Halt::RetriesExhausted(5));
        assert_eq!(err.to_string(), "Gave up after 5 consecutive connection attempts");
    }

    #[test]
    fn test_status_before_start() {
        let engine = SyncEngine::from_config(config());
        let status = engine.status();
        assert_eq!(status.connection_state, ConnectionState::Disconnected);
        assert_eq!(status.entity_count, 0);
        assert!(status.endpoint.is_none());
        assert_eq!(engine.subscriptions().requested(), ["state_changed", "call_service"]);
    }
}
