//! Promise pipelining.
//!
//! Outbound, a call on an unresolved question simply targets the question
//! slot. Inbound, deliveries addressed to one of our unsettled answers or
//! exported promises are queued on that target and replayed, in arrival
//! order, against whatever it settles to.

use crate::connection::{Completion, Connection};
use crate::eventual::{error_reason, eventual_send};
use crate::link::QuestionTicket;
use crate::message::{MessageKind, Outcome};
use crate::promise::{LocalPromise, PromiseResolver};
use crate::value::Value;
use captp_types::{CapTpError, CapTpResult, Slot, SlotKind};
use std::collections::{HashMap, VecDeque};
use tracing::{debug, warn};

/// A delivery waiting for its target to settle.
pub(crate) struct QueuedDelivery {
    method: String,
    args: Vec<Value>,
    answer: Option<Slot>,
}

pub(crate) enum TargetState {
    Pending(VecDeque<QueuedDelivery>),
    Fulfilled(Value),
    Rejected(Value),
}

/// An answer or exported promise that deliveries can be addressed to.
pub(crate) struct PipelineTarget {
    state: TargetState,
    /// Settles the local promise bound to an answer.
    resolver: Option<PromiseResolver>,
    /// The peer dropped every reference while the target was pending.
    released: bool,
}

#[derive(Default)]
pub(crate) struct PipelineTable {
    targets: HashMap<Slot, PipelineTarget>,
}

impl PipelineTable {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn open(&mut self, slot: Slot, resolver: Option<PromiseResolver>) {
        self.targets.insert(
            slot,
            PipelineTarget {
                state: TargetState::Pending(VecDeque::new()),
                resolver,
                released: false,
            },
        );
    }

    pub(crate) fn is_pending(&self, slot: Slot) -> bool {
        matches!(
            self.targets.get(&slot).map(|target| &target.state),
            Some(TargetState::Pending(_))
        )
    }

    pub(crate) fn mark_released(&mut self, slot: Slot) {
        if let Some(target) = self.targets.get_mut(&slot) {
            target.released = true;
        }
    }

    pub(crate) fn remove(&mut self, slot: Slot) -> bool {
        self.targets.remove(&slot).is_some()
    }

    /// Reject every unsettled target with `reason` and forget them all.
    pub(crate) fn abandon(&mut self, reason: &Value) -> usize {
        let count = self.targets.len();
        for (_, mut target) in self.targets.drain() {
            if let Some(resolver) = target.resolver.take() {
                resolver.reject(reason.clone());
            }
        }
        count
    }
}

impl Connection {
    /// Send `method(args)` to a slot at the peer.
    pub(crate) fn send_call(
        &mut self,
        target: Slot,
        method: String,
        args: Vec<Value>,
        question: Option<QuestionTicket>,
    ) {
        if self.is_closed() {
            if let Some(ticket) = question {
                let _ = ticket.settler.send(Err(self.link.closed_error()));
            }
            return;
        }
        let args = match self.marshal_value(&Value::List(args)) {
            Ok(data) => data,
            Err(err) => {
                debug!(conn = %self.id(), method = %method, error = %err, "CapTP: call arguments refused");
                match question {
                    Some(ticket) => {
                        let _ = ticket.settler.send(Err(err));
                    }
                    None => {
                        warn!(conn = %self.id(), method = %method, error = %err, "CapTP: one-way call dropped")
                    }
                }
                return;
            }
        };
        match question {
            Some(ticket) => {
                let answer = ticket.slot;
                self.tables.register_question(
                    answer,
                    &ticket.handle,
                    &ticket.resolution,
                    !self.config.gc_imports,
                );
                self.ledger.ask(answer, ticket.settler);
                self.send(MessageKind::Deliver {
                    target,
                    method,
                    args,
                    answer,
                });
            }
            None => self.send(MessageKind::DeliverOnly {
                target,
                method,
                args,
            }),
        }
    }

    /// Bind a question the peer asked to a fresh local answer.
    pub(crate) fn open_answer(&mut self, answer: Slot) -> CapTpResult<()> {
        if answer.kind != SlotKind::Question || !answer.is_local() {
            return Err(CapTpError::ProtocolViolation(format!(
                "{} is not a question slot",
                answer.reverse()
            )));
        }
        if self.tables.export(answer).is_some() {
            return Err(CapTpError::ProtocolViolation(format!(
                "question {} asked twice",
                answer.reverse()
            )));
        }
        let (promise, resolver) = LocalPromise::pending();
        self.tables.register_answer(answer, &promise);
        self.pipeline.open(answer, Some(resolver));
        Ok(())
    }

    /// Deliver to a local slot, queueing behind an unsettled target.
    pub(crate) fn deliver_to_slot(
        &mut self,
        target: Slot,
        method: String,
        args: Vec<Value>,
        answer: Option<Slot>,
    ) {
        if let Some(pending) = self.pipeline.targets.get_mut(&target) {
            match &mut pending.state {
                TargetState::Pending(queue) => {
                    debug!(conn = %self.link.id, slot = %target, method = %method, "CapTP: delivery queued");
                    queue.push_back(QueuedDelivery {
                        method,
                        args,
                        answer,
                    });
                }
                TargetState::Fulfilled(value) => {
                    let value = value.clone();
                    self.deliver(value, method, args, answer);
                }
                TargetState::Rejected(reason) => {
                    let reason = reason.clone();
                    if let Some(answer) = answer {
                        self.settle_target(answer, Err(reason));
                    }
                }
            }
            return;
        }
        match self.tables.local_value(target) {
            Some(value) => self.deliver(value, method, args, answer),
            None => {
                let err = CapTpError::UnknownSlot(target);
                self.report_violation(&err, "delivery");
                if let Some(answer) = answer {
                    self.settle_target(answer, Err(error_reason(&err)));
                }
            }
        }
    }

    /// Invoke `method(args)` on a settled value.
    fn deliver(&mut self, target: Value, method: String, args: Vec<Value>, answer: Option<Slot>) {
        let pending = eventual_send(&target, &method, args);
        match answer {
            Some(slot) => self.spawn_work(async move {
                Completion::Target {
                    slot,
                    outcome: pending.await.map_err(|e| error_reason(&e)),
                }
            }),
            None => self.spawn_work(async move {
                Completion::Detached {
                    method,
                    outcome: pending.await.map_err(|e| error_reason(&e)),
                }
            }),
        }
    }

    /// Settle an answer or exported promise, replay its queue, and tell the peer.
    pub(crate) fn settle_target(&mut self, slot: Slot, outcome: Result<Value, Value>) {
        // A target resolved with another promise follows that promise.
        match &outcome {
            Ok(Value::Promise(promise)) => {
                if self.tables.slot_for_value(&Value::Promise(promise.clone())) == Some(slot) {
                    let reason = Value::error(format!("{slot} was resolved with itself"));
                    return self.settle_target(slot, Err(reason));
                }
                let promise = promise.clone();
                self.spawn_work(async move {
                    Completion::Target {
                        slot,
                        outcome: promise.await,
                    }
                });
                return;
            }
            Ok(Value::Remote(remote)) if !remote.is_presence() => {
                if let Some(settled) = remote.when() {
                    self.spawn_work(async move {
                        Completion::Target {
                            slot,
                            outcome: settled.await.map_err(|e| error_reason(&e)),
                        }
                    });
                    return;
                }
            }
            _ => {}
        }

        let Some(target) = self.pipeline.targets.get_mut(&slot) else {
            debug!(conn = %self.link.id, slot = %slot, "CapTP: settlement for a released target");
            return;
        };
        let settled = match &outcome {
            Ok(value) => TargetState::Fulfilled(value.clone()),
            Err(reason) => TargetState::Rejected(reason.clone()),
        };
        let queue = match std::mem::replace(&mut target.state, settled) {
            TargetState::Pending(queue) => queue,
            already => {
                // Settled once; later outcomes are ignored.
                target.state = already;
                return;
            }
        };
        if let Some(resolver) = target.resolver.take() {
            resolver.settle(outcome.clone());
        }
        let released = target.released;

        for queued in queue {
            match &outcome {
                Ok(value) => self.deliver(value.clone(), queued.method, queued.args, queued.answer),
                Err(reason) => {
                    if let Some(answer) = queued.answer {
                        self.settle_target(answer, Err(reason.clone()));
                    }
                }
            }
        }

        let unreferenced = self
            .tables
            .export(slot)
            .map_or(true, |record| record.refcount() == 0);
        if released && unreferenced {
            self.retire_export(slot);
        } else {
            self.send_resolve(slot, outcome);
        }
    }

    /// Send the settlement of a local target, demoting unpassable results to
    /// rejections.
    fn send_resolve(&mut self, slot: Slot, outcome: Result<Value, Value>) {
        let rejected = outcome.is_err();
        let value = match outcome {
            Ok(value) | Err(value) => value,
        };
        let data = match self.marshal_value(&value) {
            Ok(data) => data,
            Err(err) => {
                warn!(conn = %self.link.id, slot = %slot, error = %err, "CapTP: result could not be passed");
                match self.marshal_value(&error_reason(&err)) {
                    Ok(data) => {
                        self.send(MessageKind::Resolve {
                            answer: slot,
                            outcome: Outcome::Rejected(data),
                        });
                    }
                    Err(err) => {
                        warn!(conn = %self.link.id, slot = %slot, error = %err, "CapTP: rejection could not be passed");
                    }
                }
                return;
            }
        };
        let outcome = if rejected {
            Outcome::Rejected(data)
        } else {
            Outcome::Fulfilled(data)
        };
        self.send(MessageKind::Resolve {
            answer: slot,
            outcome,
        });
    }
}
