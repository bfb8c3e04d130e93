//! # Widget Actions
//!
//! Dashboard tiles don't write attributes directly; they emit gestures
//! ("toggle this", "scroll volume"). [`plan_action`] turns a gesture plus the
//! entity's current mirror into a service call and, where the outcome is
//! predictable, the optimistic value to show while the hub works.
//!
//! ## Gesture Mapping
//! ```text
//! ┌──────────────────┬───────────────────────────────┬────────────────────┐
//! │ Gesture          │ Service                       │ Optimistic state   │
//! ├──────────────────┼───────────────────────────────┼────────────────────┤
//! │ Toggle           │ homeassistant.toggle          │ on ⇄ off           │
//! │ Curtain          │ cover.toggle                  │ open ⇄ closed      │
//! │ MediaPlayPause   │ media_player.media_play_pause │ playing ⇄ paused   │
//! │ Media{command}   │ media_player.<command>        │ -                  │
//! │ Volume{level}    │ media_player.volume_set       │ volume_level       │
//! │ Script           │ script.turn_on                │ -                  │
//! │ Automation       │ automation.trigger / toggle   │ - / on ⇄ off       │
//! │ Scene            │ scene.turn_on                 │ -                  │
//! │ Lock             │ lock.unlock / lock.lock       │ unlocked ⇄ locked  │
//! │ Service{name}    │ <domain>.<service>            │ -                  │
//! └──────────────────┴───────────────────────────────┴────────────────────┘
//! ```

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::service::ServiceCall;
use crate::types::{Attribute, Entity, EntityKey};
use crate::validation::{validate_service_name, validate_volume};
use crate::value::AttributeValue;

// =============================================================================
// Widget Action
// =============================================================================

/// A user gesture on a dashboard tile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WidgetAction {
    Toggle { entity: EntityKey },
    Curtain { entity: EntityKey },
    MediaPlayPause { entity: EntityKey },
    Media { entity: EntityKey, command: String },
    Volume { entity: EntityKey, level: f64 },
    Script { entity: EntityKey },
    /// `trigger = true` runs the automation once instead of enabling it.
    Automation { entity: EntityKey, trigger: bool },
    Scene { entity: EntityKey },
    Lock { entity: EntityKey },
    Service {
        entity: EntityKey,
        service: String,
        #[serde(default)]
        data: BTreeMap<String, AttributeValue>,
    },
}

impl WidgetAction {
    pub fn entity(&self) -> &EntityKey {
        match self {
            WidgetAction::Toggle { entity }
            | WidgetAction::Curtain { entity }
            | WidgetAction::MediaPlayPause { entity }
            | WidgetAction::Media { entity, .. }
            | WidgetAction::Volume { entity, .. }
            | WidgetAction::Script { entity }
            | WidgetAction::Automation { entity, .. }
            | WidgetAction::Scene { entity }
            | WidgetAction::Lock { entity }
            | WidgetAction::Service { entity, .. } => entity,
        }
    }

    /// Gesture name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            WidgetAction::Toggle { .. } => "toggle",
            WidgetAction::Curtain { .. } => "curtain",
            WidgetAction::MediaPlayPause { .. } => "media_play_pause",
            WidgetAction::Media { .. } => "media",
            WidgetAction::Volume { .. } => "volume",
            WidgetAction::Script { .. } => "script",
            WidgetAction::Automation { .. } => "automation",
            WidgetAction::Scene { .. } => "scene",
            WidgetAction::Lock { .. } => "lock",
            WidgetAction::Service { .. } => "service",
        }
    }

    /// Button presses are debounced; continuous controls are not.
    pub fn is_debounced(&self) -> bool {
        !matches!(
            self,
            WidgetAction::Volume { .. } | WidgetAction::Media { .. }
        )
    }
}

// =============================================================================
// Action Plan
// =============================================================================

/// Value to show locally until the hub confirms or rejects the call.
#[derive(Debug, Clone, PartialEq)]
pub struct OptimisticWrite {
    pub attribute: Attribute,
    pub value: AttributeValue,
}

/// What to send for a gesture, and what to show meanwhile.
#[derive(Debug, Clone, PartialEq)]
pub struct ActionPlan {
    pub call: ServiceCall,
    pub optimistic: Option<OptimisticWrite>,
}

impl ActionPlan {
    fn fire(call: ServiceCall) -> Self {
        ActionPlan {
            call,
            optimistic: None,
        }
    }

    fn with_state(call: ServiceCall, state: Option<AttributeValue>) -> Self {
        ActionPlan {
            call,
            optimistic: state.map(|value| OptimisticWrite {
                attribute: Attribute::State,
                value,
            }),
        }
    }
}

fn require_domain(action: &WidgetAction, domain: &str) -> Result<(), CoreError> {
    if action.entity().domain() != domain {
        return Err(CoreError::WrongDomain {
            action: action.name().to_string(),
            entity: action.entity().to_string(),
        });
    }
    Ok(())
}

/// Swaps between two known states; unknown states get no optimistic value.
fn flip(current: Option<&Entity>, a: &str, b: &str) -> Option<AttributeValue> {
    match current.and_then(Entity::state_str) {
        Some(s) if s == a => Some(b.into()),
        Some(s) if s == b => Some(a.into()),
        _ => None,
    }
}

/// Plans the service call for a gesture.
///
/// `current` is the entity as currently mirrored, if it is.
pub fn plan_action(action: &WidgetAction, current: Option<&Entity>) -> Result<ActionPlan, CoreError> {
    let entity = action.entity();

    let plan = match action {
        WidgetAction::Toggle { .. } => ActionPlan::with_state(
            ServiceCall::new("homeassistant", "toggle").targeting(entity),
            flip(current, "on", "off"),
        ),
        WidgetAction::Curtain { .. } => {
            require_domain(action, "cover")?;
            ActionPlan::with_state(
                ServiceCall::new("cover", "toggle").targeting(entity),
                flip(current, "open", "closed"),
            )
        }
        WidgetAction::MediaPlayPause { .. } => {
            require_domain(action, "media_player")?;
            ActionPlan::with_state(
                ServiceCall::new("media_player", "media_play_pause").targeting(entity),
                flip(current, "playing", "paused"),
            )
        }
        WidgetAction::Media { command, .. } => {
            require_domain(action, "media_player")?;
            validate_service_name(command)?;
            ActionPlan::fire(ServiceCall::new("media_player", command.as_str()).targeting(entity))
        }
        WidgetAction::Volume { level, .. } => {
            require_domain(action, "media_player")?;
            validate_volume(*level)?;
            ActionPlan {
                call: ServiceCall::new("media_player", "volume_set")
                    .targeting(entity)
                    .with_data("volume_level", *level),
                optimistic: Some(OptimisticWrite {
                    attribute: Attribute::named("volume_level"),
                    value: AttributeValue::Float(*level),
                }),
            }
        }
        WidgetAction::Script { .. } => {
            require_domain(action, "script")?;
            ActionPlan::fire(ServiceCall::new("script", "turn_on").targeting(entity))
        }
        WidgetAction::Automation { trigger: true, .. } => {
            require_domain(action, "automation")?;
            ActionPlan::fire(ServiceCall::new("automation", "trigger").targeting(entity))
        }
        WidgetAction::Automation { trigger: false, .. } => {
            require_domain(action, "automation")?;
            ActionPlan::with_state(
                ServiceCall::new("automation", "toggle").targeting(entity),
                flip(current, "on", "off"),
            )
        }
        WidgetAction::Scene { .. } => {
            require_domain(action, "scene")?;
            ActionPlan::fire(ServiceCall::new("scene", "turn_on").targeting(entity))
        }
        WidgetAction::Lock { .. } => {
            require_domain(action, "lock")?;
            // Missing or unreadable state counts as locked.
            let locked = current
                .and_then(Entity::state_str)
                .map_or(true, |s| s == "locked");
            let (service, next) = if locked {
                ("unlock", "unlocked")
            } else {
                ("lock", "locked")
            };
            ActionPlan::with_state(
                ServiceCall::new("lock", service).targeting(entity),
                Some(next.into()),
            )
        }
        WidgetAction::Service { service, data, .. } => {
            let mut call = ServiceCall::parse(service)?.targeting(entity);
            call.data.extend(data.iter().map(|(k, v)| (k.clone(), v.clone())));
            ActionPlan::fire(call)
        }
    };

    Ok(plan)
}

// =============================================================================
// Debouncer
// =============================================================================

/// Suppresses repeated presses on the same entity within a cooldown.
///
/// Time is passed in so the rule stays pure.
#[derive(Debug)]
pub struct Debouncer {
    cooldown: Duration,
    last: HashMap<EntityKey, Instant>,
}

impl Debouncer {
    /// Entries older than the cooldown are pruned once the map grows past this.
    const PRUNE_THRESHOLD: usize = 256;

    pub fn new(cooldown: Duration) -> Self {
        Debouncer {
            cooldown,
            last: HashMap::new(),
        }
    }

    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }

    /// Returns `true` and records the press if the entity is outside its
    /// cooldown; returns `false` for a bounce.
    pub fn admit(&mut self, key: &EntityKey, now: Instant) -> bool {
        if let Some(prev) = self.last.get(key) {
            if now.saturating_duration_since(*prev) < self.cooldown {
                return false;
            }
        }

        if self.last.len() >= Self::PRUNE_THRESHOLD {
            let cooldown = self.cooldown;
            self.last
                .retain(|_, at| now.saturating_duration_since(*at) < cooldown);
        }

        self.last.insert(key.clone(), now);
        true
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
