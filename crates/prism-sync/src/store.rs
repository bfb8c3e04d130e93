//! # Entity Store
//!
//! The local mirror of hub state, plus change fan-out.
//!
//! ## Read/Write Model
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          EntityStore                                    │
//! │                                                                         │
//! │   engine worker (only writer)           any thread (readers)           │
//! │   ───────────────────────────           ────────────────────           │
//! │   apply_snapshot  ─┐                    get(key)                       │
//! │   apply_change    ─┼──► RwLock<Arc<EntityMap>> ◄── snapshot()          │
//! │   write_attribute ─┘         │                     in_domain(d)        │
//! │                              │                                          │
//! │                              ▼                                          │
//! │                   ChangeNotification ──► subscriber 1 (unbounded)      │
//! │                   (sequence-numbered) ──► subscriber 2 (unbounded)     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Readers clone an `Arc` under a lock held for a pointer copy, so they never
//! wait on the network. Writers copy-on-write only while a reader still
//! holds an older snapshot. Notifications go out in write order and are
//! never dropped for a live subscriber.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::trace;

use prism_core::{Attribute, AttributeValue, Entity, EntityKey};

/// All mirrored entities, ordered by key.
pub type EntityMap = BTreeMap<EntityKey, Entity>;

/// Stream of store changes for one subscriber.
pub type ChangeStream = UnboundedReceiverStream<ChangeNotification>;

// =============================================================================
// Change Notifications
// =============================================================================

/// What caused a change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOrigin {
    /// Full state load after (re)connecting.
    Snapshot,
    /// Pushed by the hub.
    Event,
    /// Local guess applied when a command was issued.
    Optimistic,
    /// A failed command's guess being undone.
    Rollback,
}

/// One entity changed.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeNotification {
    /// Strictly increasing across all notifications from one store.
    pub sequence: u64,
    pub key: EntityKey,
    pub previous: Option<Entity>,
    /// `None` when the entity was removed.
    pub current: Option<Entity>,
    pub origin: ChangeOrigin,
}

impl ChangeNotification {
    pub fn is_removal(&self) -> bool {
        self.current.is_none()
    }
}

struct Change {
    key: EntityKey,
    previous: Option<Entity>,
    current: Option<Entity>,
}

// =============================================================================
// Entity Store
// =============================================================================

/// Shared handle to the mirror. Cloning is cheap.
#[derive(Clone, Default)]
pub struct EntityStore {
    inner: Arc<StoreInner>,
}

#[derive(Default)]
struct StoreInner {
    entities: RwLock<Arc<EntityMap>>,
    listeners: Mutex<Vec<mpsc::UnboundedSender<ChangeNotification>>>,
    sequence: AtomicU64,
}

impl fmt::Debug for EntityStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityStore")
            .field("entities", &self.len())
            .field("listeners", &self.listener_count())
            .finish()
    }
}

impl EntityStore {
    pub fn new() -> Self {
        Self::default()
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Consistent view of every entity at one instant.
    pub fn snapshot(&self) -> Arc<EntityMap> {
        self.inner
            .entities
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn get(&self, key: &str) -> Option<Entity> {
        self.snapshot().get(key).cloned()
    }

    pub fn get_value(&self, key: &str, attribute: &Attribute) -> Option<AttributeValue> {
        self.snapshot().get(key)?.get(attribute).cloned()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.snapshot().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot().is_empty()
    }

    pub fn keys(&self) -> Vec<EntityKey> {
        self.snapshot().keys().cloned().collect()
    }

    /// Entities of one domain, in key order.
    pub fn in_domain(&self, domain: &str) -> Vec<Entity> {
        self.snapshot()
            .values()
            .filter(|e| e.domain() == domain)
            .cloned()
            .collect()
    }

    /// Registers a listener. It sees every change made after this call.
    pub fn subscribe(&self) -> ChangeStream {
        let (tx, rx) = mpsc::unbounded_channel();
        self.listeners().push(tx);
        UnboundedReceiverStream::new(rx)
    }

    pub fn listener_count(&self) -> usize {
        self.listeners().iter().filter(|tx| !tx.is_closed()).count()
    }

    // =========================================================================
    // Writes (engine worker only)
    // =========================================================================

    /// Replaces the whole mirror. Returns the number of notifications sent.
    pub(crate) fn apply_snapshot(&self, entities: Vec<Entity>) -> usize {
        let next: EntityMap = entities.into_iter().map(|e| (e.key.clone(), e)).collect();

        let changes = {
            let mut guard = self.write_guard();
            let previous = std::mem::replace(&mut *guard, Arc::new(next));
            diff(&previous, &guard)
        };

        let count = changes.len();
        self.publish(changes, ChangeOrigin::Snapshot);
        count
    }

    /// Applies one authoritative change. `None` removes the entity.
    ///
    /// Returns `true` if the content changed (and a notification went out).
    pub(crate) fn apply_change(&self, key: &EntityKey, new_state: Option<Entity>) -> bool {
        let change = {
            let mut guard = self.write_guard();
            let map = Arc::make_mut(&mut guard);
            match new_state {
                Some(entity) => {
                    let previous = map.insert(key.clone(), entity.clone());
                    match previous {
                        Some(ref prev) if prev.same_content(&entity) => None,
                        _ => Some(Change {
                            key: key.clone(),
                            previous,
                            current: Some(entity),
                        }),
                    }
                }
                None => map.remove(key).map(|previous| Change {
                    key: key.clone(),
                    previous: Some(previous),
                    current: None,
                }),
            }
        };

        match change {
            Some(change) => {
                self.publish(vec![change], ChangeOrigin::Event);
                true
            }
            None => false,
        }
    }

    /// Sets (or with `None`, clears) one attribute of an existing entity.
    ///
    /// Returns the value it replaced, or `None` if the entity isn't mirrored.
    pub(crate) fn write_attribute(
        &self,
        key: &EntityKey,
        attribute: &Attribute,
        value: Option<AttributeValue>,
        origin: ChangeOrigin,
    ) -> Option<Option<AttributeValue>> {
        let (replaced, change) = {
            let mut guard = self.write_guard();
            if !guard.contains_key(key) {
                return None;
            }
            let map = Arc::make_mut(&mut guard);
            let entity = map.get_mut(key)?;
            let before = entity.clone();
            let replaced = entity.set(attribute, value);
            let change = (!before.same_content(entity)).then(|| Change {
                key: key.clone(),
                previous: Some(before),
                current: Some(entity.clone()),
            });
            (replaced, change)
        };

        if let Some(change) = change {
            self.publish(vec![change], origin);
        }
        Some(replaced)
    }

    fn write_guard(&self) -> std::sync::RwLockWriteGuard<'_, Arc<EntityMap>> {
        self.inner
            .entities
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn listeners(&self) -> std::sync::MutexGuard<'_, Vec<mpsc::UnboundedSender<ChangeNotification>>> {
        self.inner
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, changes: Vec<Change>, origin: ChangeOrigin) {
        if changes.is_empty() {
            return;
        }

        let mut listeners = self.listeners();
        for change in changes {
            let notification = ChangeNotification {
                sequence: self.inner.sequence.fetch_add(1, Ordering::Relaxed) + 1,
                key: change.key,
                previous: change.previous,
                current: change.current,
                origin,
            };
            trace!(entity = %notification.key, seq = notification.sequence, ?origin, "Entity changed");
            listeners.retain(|tx| tx.send(notification.clone()).is_ok());
        }
    }
}

/// Changes between two maps, in key order.
fn diff(before: &EntityMap, after: &EntityMap) -> Vec<Change> {
    let mut changes: Vec<Change> = after
        .iter()
        .filter_map(|(key, entity)| match before.get(key) {
            Some(prev) if prev.same_content(entity) => None,
            prev => Some(Change {
                key: key.clone(),
                previous: prev.cloned(),
                current: Some(entity.clone()),
            }),
        })
        .collect();

    changes.extend(
        before
            .iter()
            .filter(|(key, _)| !after.contains_key(*key))
            .map(|(key, entity)| Change {
                key: key.clone(),
                previous: Some(entity.clone()),
                current: None,
            }),
    );

    changes.sort_by(|a, b| a.key.cmp(&b.key));
    changes
}
