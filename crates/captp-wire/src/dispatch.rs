//! Inbound message dispatch.
//!
//! Each message is validated and applied on its own. A message that names an
//! unknown slot or breaks the protocol is dropped and counted; the connection
//! carries on.

use crate::connection::Connection;
use crate::eventual::{error_reason, rejection_error};
use crate::message::{MessageKind, Outcome, WireMessage};
use crate::value::Value;
use captp_types::{CapData, CapTpError, Slot, SlotKind};
use tracing::debug;

impl Connection {
    /// Apply one inbound message.
    pub(crate) fn dispatch(&mut self, msg: WireMessage) {
        if self.is_closed() {
            debug!(conn = %self.link.id, kind = msg.kind.name(), "CapTP: message after close ignored");
            return;
        }
        if msg.epoch != self.config.epoch {
            self.counters.stale_messages += 1;
            debug!(
                conn = %self.link.id,
                kind = msg.kind.name(),
                epoch = msg.epoch,
                expected = self.config.epoch,
                "CapTP: message from another epoch ignored"
            );
            return;
        }
        *self
            .counters
            .received
            .entry(msg.kind.name().to_string())
            .or_default() += 1;
        debug!(conn = %self.link.id, kind = msg.kind.name(), "CapTP: receive");

        // Slots arrive from the sender's point of view.
        match msg.kind {
            MessageKind::Bootstrap { question } => self.on_bootstrap(question.reverse()),
            MessageKind::Deliver {
                target,
                method,
                args,
                answer,
            } => self.on_deliver(target.reverse(), method, args, Some(answer.reverse())),
            MessageKind::DeliverOnly {
                target,
                method,
                args,
            } => self.on_deliver(target.reverse(), method, args, None),
            MessageKind::Resolve { answer, outcome } => self.on_resolve(answer.reverse(), outcome),
            MessageKind::GcDrop { slot, seen } => self.on_gc_drop(slot.reverse(), seen),
            MessageKind::GcRetire { slot } => self.on_gc_retire(slot.reverse()),
            MessageKind::Abort { reason } => {
                self.close(&reason, false);
            }
        }
    }

    fn on_bootstrap(&mut self, answer: Slot) {
        if let Err(err) = self.open_answer(answer) {
            self.report_violation(&err, "CTP_BOOTSTRAP");
            return;
        }
        let root = self.bootstrap.clone();
        self.settle_target(answer, Ok(root));
    }

    fn on_deliver(&mut self, target: Slot, method: String, args: CapData, answer: Option<Slot>) {
        // Decode first so every mention is counted, even in a dropped message.
        let decoded = self.unmarshal_value(&args).and_then(|value| match value {
            Value::List(items) => Ok(items),
            other => Err(CapTpError::ProtocolViolation(format!(
                "arguments to {method}() must be a list, got {}",
                other.type_name()
            ))),
        });
        if let Some(answer) = answer {
            if let Err(err) = self.open_answer(answer) {
                self.report_violation(&err, "CTP_DELIVER");
                return;
            }
        }

        let checked = decoded.and_then(|args| {
            if target.is_local() {
                Ok(args)
            } else {
                Err(CapTpError::UnknownSlot(target))
            }
        });
        match checked {
            Ok(args) => self.deliver_to_slot(target, method, args, answer),
            Err(err) => {
                self.report_violation(&err, "CTP_DELIVER");
                if let Some(answer) = answer {
                    self.settle_target(answer, Err(error_reason(&err)));
                }
            }
        }
    }

    fn on_resolve(&mut self, slot: Slot, outcome: Outcome) {
        // An undecodable payload leaves the question pending.
        let value = match self.unmarshal_value(outcome.data()) {
            Ok(value) => value,
            Err(err) => {
                self.report_violation(&err, "CTP_RESOLVE");
                return;
            }
        };
        let result = if outcome.is_rejected() {
            Err(rejection_error(value))
        } else {
            Ok(value)
        };
        let settled = match (slot.kind, slot.is_remote()) {
            (SlotKind::Question, true) => self.ledger.resolve(slot, result),
            (SlotKind::Promise, true) => self.tables.settle_import(slot, result),
            _ => Err(CapTpError::ProtocolViolation(format!(
                "{} cannot be resolved by its holder",
                slot.reverse()
            ))),
        };
        if let Err(err) = settled {
            self.report_violation(&err, "CTP_RESOLVE");
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::connection::tests::{pump, Counter, Peer};
    use futures::FutureExt;
    use crate::message::{MessageKind, Outcome, WireMessage};
    use crate::value::Value;
    use captp_types::{CapData, Slot, SlotKind};
    use serde_json::json;

    fn deliver(target: Slot, answer: u64) -> WireMessage {
        WireMessage::new(
            0,
            MessageKind::Deliver {
                target,
                method: "incr".into(),
                args: CapData::plain(json!([])),
                answer: Slot::remote(SlotKind::Question, answer),
            },
        )
    }

    #[tokio::test]
    async fn test_duplicate_question_is_dropped() {
        let mut a = Peer::new(Value::object(Counter::default()));
        a.conn.dispatch(WireMessage::new(
            0,
            MessageKind::Bootstrap {
                question: Slot::remote(SlotKind::Question, 1),
            },
        ));
        a.conn.dispatch(deliver(Slot::remote(SlotKind::Object, 1), 2));
        a.conn.dispatch(deliver(Slot::remote(SlotKind::Object, 1), 2));
        let stats = a.conn.stats();
        assert_eq!(stats.protocol_violations, 1);
        assert_eq!(stats.answers, 2);
    }

    #[tokio::test]
    async fn test_answer_slot_must_be_a_question() {
        let mut a = Peer::new(Value::object(Counter::default()));
        a.conn.dispatch(WireMessage::new(
            0,
            MessageKind::Deliver {
                target: Slot::remote(SlotKind::Object, 1),
                method: "incr".into(),
                args: CapData::plain(json!([])),
                answer: Slot::remote(SlotKind::Object, 9),
            },
        ));
        assert_eq!(a.conn.stats().protocol_violations, 1);
        assert!(a.conn.take_outbox().is_empty());
    }

    #[tokio::test]
    async fn test_non_list_arguments_reject_the_answer() {
        let mut a = Peer::new(Value::object(Counter::default()));
        a.conn.dispatch(WireMessage::new(
            0,
            MessageKind::Deliver {
                target: Slot::remote(SlotKind::Object, 1),
                method: "incr".into(),
                args: CapData::plain(json!({"not": "a list"})),
                answer: Slot::remote(SlotKind::Question, 1),
            },
        ));
        let out = a.conn.take_outbox();
        match &out[..] {
            [WireMessage {
                kind: MessageKind::Resolve { answer, outcome },
                ..
            }] => {
                assert_eq!(answer.to_string(), "q+1");
                assert!(matches!(outcome, Outcome::Rejected(_)));
            }
            other => panic!("expected a rejection, got {other:?}"),
        }
        assert_eq!(a.conn.stats().protocol_violations, 1);
    }

    #[tokio::test]
    async fn test_abort_closes_without_reply() {
        let mut a = Peer::new(Value::object(Counter::default()));
        let mut b = Peer::new(Value::Null);
        let root = b.conn.link().bootstrap();
        b.conn.dispatch(WireMessage::new(0, MessageKind::Abort { reason: "bye".into() }));
        assert!(b.conn.is_closed());
        pump(&mut a, &mut b);
        assert!(b.conn.take_outbox().is_empty());
        assert!(!a.conn.is_closed());
        let err = futures::FutureExt::now_or_never(root).unwrap().unwrap_err();
        assert_eq!(err, captp_types::CapTpError::ConnectionClosed("bye".into()));
    }

    #[tokio::test]
    async fn test_resolve_of_export_is_violation() {
        let mut a = Peer::new(Value::Null);
        a.conn.dispatch(WireMessage::new(
            0,
            MessageKind::Resolve {
                answer: Slot::remote(SlotKind::Promise, 1),
                outcome: Outcome::Fulfilled(CapData::plain(json!(null))),
            },
        ));
        assert_eq!(a.conn.stats().protocol_violations, 1);
    }

    #[tokio::test]
    async fn test_undecodable_resolve_leaves_question_pending() {
        let mut b = Peer::new(Value::Null);
        let root = b.conn.link().bootstrap();
        b.run_local();
        b.conn.take_outbox();

        let resolve = |outcome| {
            WireMessage::new(
                0,
                MessageKind::Resolve {
                    answer: Slot::local(SlotKind::Question, 1),
                    outcome,
                },
            )
        };
        // o-99 names an export b never made.
        b.conn.dispatch(resolve(Outcome::Fulfilled(CapData {
            body: json!({"@qclass": "slot", "index": 0}),
            slots: vec![Slot::remote(SlotKind::Object, 99)],
        })));
        assert_eq!(b.conn.stats().protocol_violations, 1);
        assert_eq!(b.conn.stats().questions, 1);
        assert!(root.clone().now_or_never().is_none());

        b.conn.dispatch(resolve(Outcome::Fulfilled(CapData::plain(json!(5)))));
        assert_eq!(root.now_or_never(), Some(Ok(Value::Int(5))));
        assert_eq!(b.conn.stats().protocol_violations, 1);
    }

    #[tokio::test]
    async fn test_mentions_in_dropped_delivery_are_counted() {
        let mut a = Peer::new(Value::object(Counter::default()));
        a.conn.dispatch(WireMessage::new(
            0,
            MessageKind::Bootstrap {
                question: Slot::remote(SlotKind::Question, 1),
            },
        ));
        let carrying = || {
            WireMessage::new(
                0,
                MessageKind::Deliver {
                    target: Slot::remote(SlotKind::Object, 1),
                    method: "incr".into(),
                    args: CapData {
                        body: json!([{"@qclass": "slot", "index": 0}]),
                        slots: vec![Slot::local(SlotKind::Object, 5)],
                    },
                    answer: Slot::remote(SlotKind::Question, 2),
                },
            )
        };
        a.conn.dispatch(carrying());
        // Same question again: dropped, but its mention still counts.
        a.conn.dispatch(carrying());
        assert_eq!(a.conn.stats().protocol_violations, 1);

        while a.run_local() {}
        let drops: Vec<(Slot, u64)> = a
            .conn
            .take_outbox()
            .into_iter()
            .filter_map(|msg| match msg.kind {
                MessageKind::GcDrop { slot, seen } => Some((slot, seen)),
                _ => None,
            })
            .collect();
        assert_eq!(drops, vec![(Slot::remote(SlotKind::Object, 5), 2)]);
    }
}
