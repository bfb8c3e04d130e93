//! # Request Ledger
//!
//! Every request carrying an id is recorded here until its `result` frame
//! arrives. The hub's result frames all look alike; the ledger is what turns
//! one into a subscription ack, a snapshot or a command result.
//!
//! Ids restart at 1 on every connection. Results for ids that were never
//! issued on this connection come back as [`Reply::Unmatched`].

use std::collections::HashMap;

use prism_core::Entity;

use crate::protocol::{decode_snapshot, HubFault, MessageId, ResultFrame};

/// What a request id was issued for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestKind {
    Subscribe(String),
    Snapshot,
    Command,
}

/// A result frame, matched to its request.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    SubscriptionAck {
        subscription_id: MessageId,
        event_type: String,
    },
    Snapshot(Vec<Entity>),
    CommandResult {
        correlation_id: MessageId,
        outcome: Result<(), HubFault>,
    },
    /// A session request (subscribe or snapshot) failed.
    ErrorNotice {
        id: MessageId,
        request: RequestKind,
        fault: HubFault,
    },
    Unmatched(MessageId),
}

#[derive(Debug)]
pub struct RequestLedger {
    next_id: MessageId,
    outstanding: HashMap<MessageId, RequestKind>,
}

impl Default for RequestLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestLedger {
    pub fn new() -> Self {
        Self {
            next_id: 1,
            outstanding: HashMap::new(),
        }
    }

    /// Allocates the next id and remembers what it is for.
    pub fn register(&mut self, kind: RequestKind) -> MessageId {
        let id = self.next_id;
        self.next_id += 1;
        self.outstanding.insert(id, kind);
        id
    }

    pub fn forget(&mut self, id: MessageId) {
        self.outstanding.remove(&id);
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding.len()
    }

    pub fn classify(&mut self, frame: ResultFrame) -> Reply {
        let Some(kind) = self.outstanding.remove(&frame.id) else {
            return Reply::Unmatched(frame.id);
        };

        match (kind, frame.outcome) {
            (RequestKind::Command, outcome) => Reply::CommandResult {
                correlation_id: frame.id,
                outcome: outcome.map(|_| ()),
            },
            (RequestKind::Subscribe(event_type), Ok(_)) => Reply::SubscriptionAck {
                subscription_id: frame.id,
                event_type,
            },
            (RequestKind::Snapshot, Ok(value)) => match decode_snapshot(value) {
                Ok(entities) => Reply::Snapshot(entities),
                Err(err) => Reply::ErrorNotice {
                    id: frame.id,
                    request: RequestKind::Snapshot,
                    fault: HubFault {
                        code: "invalid_format".to_string(),
                        message: err.to_string(),
                    },
                },
            },
            (request, Err(fault)) => Reply::ErrorNotice {
                id: frame.id,
                request,
                fault,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ok(id: MessageId, value: serde_json::Value) -> ResultFrame {
        ResultFrame {
            id,
            outcome: Ok(value),
        }
    }

    fn fault(code: &str) -> HubFault {
        HubFault {
            code: code.into(),
            message: "nope".into(),
        }
    }

    #[test]
    fn test_ids_start_at_one_and_increase() {
        let mut ledger = RequestLedger::new();
        assert_eq!(ledger.register(RequestKind::Subscribe("state_changed".into())), 1);
        assert_eq!(ledger.register(RequestKind::Snapshot), 2);
        assert_eq!(ledger.register(RequestKind::Command), 3);
        assert_eq!(ledger.outstanding(), 3);
    }

    #[test]
    fn test_classify_by_request_kind() {
        let mut ledger = RequestLedger::new();
        let sub = ledger.register(RequestKind::Subscribe("state_changed".into()));
        let snap = ledger.register(RequestKind::Snapshot);
        let cmd = ledger.register(RequestKind::Command);

        assert_eq!(
            ledger.classify(ok(sub, json!(null))),
            Reply::SubscriptionAck {
                subscription_id: sub,
                event_type: "state_changed".into()
            }
        );

        let reply = ledger.classify(ok(
            snap,
            json!([{"entity_id": "light.a", "state": "on", "attributes": {}}]),
        ));
        match reply {
            Reply::Snapshot(entities) => assert_eq!(entities[0].key.as_str(), "light.a"),
            other => panic!("expected snapshot, got {other:?}"),
        }

        assert_eq!(
            ledger.classify(ResultFrame {
                id: cmd,
                outcome: Err(fault("not_found"))
            }),
            Reply::CommandResult {
                correlation_id: cmd,
                outcome: Err(fault("not_found"))
            }
        );
        assert_eq!(ledger.outstanding(), 0);
    }

    #[test]
    fn test_unknown_or_repeated_id_is_unmatched() {
        let mut ledger = RequestLedger::new();
        let cmd = ledger.register(RequestKind::Command);

        assert_eq!(ledger.classify(ok(99, json!(null))), Reply::Unmatched(99));
        assert!(matches!(ledger.classify(ok(cmd, json!(null))), Reply::CommandResult { .. }));
        assert_eq!(ledger.classify(ok(cmd, json!(null))), Reply::Unmatched(cmd));
    }

    #[test]
    fn test_forgotten_command_is_unmatched() {
        let mut ledger = RequestLedger::new();
        let expired = ledger.register(RequestKind::Command);
        let live = ledger.register(RequestKind::Command);

        ledger.forget(expired);
        assert_eq!(ledger.outstanding(), 1);
        assert_eq!(ledger.classify(ok(expired, json!(null))), Reply::Unmatched(expired));
        assert!(matches!(ledger.classify(ok(live, json!(null))), Reply::CommandResult { .. }));
        assert_eq!(ledger.outstanding(), 0);
    }

    #[test]
    fn test_failed_session_requests() {
        let mut ledger = RequestLedger::new();
        let sub = ledger.register(RequestKind::Subscribe("call_service".into()));
        let snap = ledger.register(RequestKind::Snapshot);

        assert!(matches!(
            ledger.classify(ResultFrame { id: sub, outcome: Err(fault("unauthorized")) }),
            Reply::ErrorNotice { request: RequestKind::Subscribe(_), .. }
        ));
        assert!(matches!(
            ledger.classify(ok(snap, json!({"not": "a list"}))),
            Reply::ErrorNotice { request: RequestKind::Snapshot, .. }
        ));
    }
}
