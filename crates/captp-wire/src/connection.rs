//! The per-connection state machine.
//!
//! A [`Connection`] owns the reference tables, the question ledger and the
//! pipeline table for one peer. It never touches the transport: inbound
//! messages are fed to [`Connection::dispatch`], handle requests to
//! [`Connection::handle_command`], and finished local work to
//! [`Connection::complete`]. Outbound messages and new work are collected
//! for the session task to drain. Every mutation happens in one of those three
//! calls, one at a time.

use crate::eventual::rejection_error;
use crate::link::{Command, CommandReceiver, ConnectionId, ConnectionLink, QuestionTicket};
use crate::ledger::QuestionLedger;
use crate::marshal::Marshal;
use crate::message::{MessageKind, WireMessage};
use crate::observer::SessionObserver;
use crate::pipeline::PipelineTable;
use crate::tables::ReferenceTables;
use crate::value::Value;
use captp_types::{CapData, CapTpConfig, CapTpError, CapTpResult, Slot, SlotKind};
use futures::future::{BoxFuture, FutureExt};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Local work the connection is waiting on.
pub(crate) type Work = BoxFuture<'static, Completion>;

/// The outcome of a piece of [`Work`].
pub(crate) enum Completion {
    /// A local promise bound to an answer or exported promise settled.
    Target {
        slot: Slot,
        outcome: Result<Value, Value>,
    },
    /// A one-way delivery finished; only failures are interesting.
    Detached {
        method: String,
        outcome: Result<Value, Value>,
    },
}

/// Counters describing one connection.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SessionStats {
    /// Messages sent, by kind.
    pub sent: BTreeMap<String, u64>,
    /// Messages received, by kind.
    pub received: BTreeMap<String, u64>,
    pub protocol_violations: u64,
    pub gc_violations: u64,
    /// Messages ignored because they carried another epoch.
    pub stale_messages: u64,
    pub drops_sent: u64,
    pub retires_sent: u64,
    /// Live object and promise exports.
    pub exports: usize,
    /// Live imports, including our own questions.
    pub imports: usize,
    /// Questions still waiting for an answer.
    pub questions: usize,
    /// Answers the peer may still reference.
    pub answers: usize,
}

/// What tearing a connection down released.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CloseReport {
    pub reason: String,
    pub rejected_questions: usize,
    pub released_entries: usize,
}

pub(crate) struct Connection {
    pub(crate) link: Arc<ConnectionLink>,
    pub(crate) config: CapTpConfig,
    marshal: Arc<dyn Marshal>,
    observer: Option<Arc<dyn SessionObserver>>,
    pub(crate) bootstrap: Value,
    pub(crate) tables: ReferenceTables,
    pub(crate) ledger: QuestionLedger,
    pub(crate) pipeline: PipelineTable,
    pub(crate) counters: SessionStats,
    outbox: Vec<WireMessage>,
    work: Vec<Work>,
    closed: Option<CloseReport>,
}

impl Connection {
    pub(crate) fn new(
        config: CapTpConfig,
        bootstrap: Value,
        marshal: Arc<dyn Marshal>,
    ) -> (Self, CommandReceiver) {
        let (link, commands) = ConnectionLink::new();
        info!(conn = %link.id, id = %config.our_id, epoch = config.epoch, "CapTP: connection opened");
        let conn = Self {
            link,
            config,
            marshal,
            observer: None,
            bootstrap,
            tables: ReferenceTables::new(),
            ledger: QuestionLedger::new(),
            pipeline: PipelineTable::new(),
            counters: SessionStats::default(),
            outbox: Vec::new(),
            work: Vec::new(),
            closed: None,
        };
        (conn, commands)
    }

    pub(crate) fn set_observer(&mut self, observer: Arc<dyn SessionObserver>) {
        self.observer = Some(observer);
    }

    pub(crate) fn id(&self) -> ConnectionId {
        self.link.id
    }

    pub(crate) fn link(&self) -> Arc<ConnectionLink> {
        Arc::clone(&self.link)
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.is_some()
    }

    /// What the close released, once the connection is closed.
    pub(crate) fn close_report(&self) -> Option<CloseReport> {
        self.closed.clone()
    }

    pub(crate) fn take_outbox(&mut self) -> Vec<WireMessage> {
        std::mem::take(&mut self.outbox)
    }

    pub(crate) fn take_work(&mut self) -> Vec<Work> {
        std::mem::take(&mut self.work)
    }

    pub(crate) fn send(&mut self, kind: MessageKind) {
        *self.counters.sent.entry(kind.name().to_string()).or_default() += 1;
        debug!(conn = %self.link.id, kind = kind.name(), "CapTP: send");
        self.outbox.push(WireMessage::new(self.config.epoch, kind));
    }

    pub(crate) fn spawn_work<F>(&mut self, fut: F)
    where
        F: Future<Output = Completion> + Send + 'static,
    {
        self.work.push(fut.boxed());
    }

    /// Apply a request from a handle.
    pub(crate) fn handle_command(&mut self, command: Command) {
        match command {
            Command::Call {
                target,
                method,
                args,
                question,
            } => self.send_call(target, method, args, question),
            Command::Bootstrap { question } => self.ask_bootstrap(question),
            Command::Release { slot, generation } => self.release_import(slot, generation),
            Command::Stats { reply } => {
                let _ = reply.send(self.stats());
            }
            Command::Close { reason } => {
                self.close(&reason, true);
            }
        }
    }

    /// Apply finished local work.
    pub(crate) fn complete(&mut self, completion: Completion) {
        if self.is_closed() {
            return;
        }
        match completion {
            Completion::Target { slot, outcome } => self.settle_target(slot, outcome),
            Completion::Detached { method, outcome } => {
                if let Err(reason) = outcome {
                    debug!(conn = %self.link.id, method = %method, reason = %reason.describe(), "CapTP: one-way delivery rejected");
                    if let Some(observer) = &self.observer {
                        observer.rejected(&rejection_error(reason));
                    }
                }
            }
        }
    }

    fn ask_bootstrap(&mut self, ticket: QuestionTicket) {
        if self.is_closed() {
            let _ = ticket.settler.send(Err(self.link.closed_error()));
            return;
        }
        let question = ticket.slot;
        self.tables.register_question(
            question,
            &ticket.handle,
            &ticket.resolution,
            !self.config.gc_imports,
        );
        self.ledger.ask(question, ticket.settler);
        self.send(MessageKind::Bootstrap { question });
    }

    // -----------------------------------------------------------------------
    // Marshalling
    // -----------------------------------------------------------------------

    /// Encode an outbound payload, exporting the local capabilities it holds.
    ///
    /// Export counts only change if the whole payload encodes.
    pub(crate) fn marshal_value(&mut self, value: &Value) -> CapTpResult<CapData> {
        let conn = self.link.id;
        let tables = &mut self.tables;
        let encoded = self.marshal.to_cap_data(value, &mut |v: &Value| match v {
            Value::Remote(r) if r.connection() == conn => Ok(r.slot()),
            Value::Remote(r) => Err(CapTpError::ProtocolViolation(format!(
                "{r:?} cannot be passed to {conn}"
            ))),
            other => tables.export_value(other),
        });
        match encoded {
            Ok(data) => {
                self.tables.note_sent(&data.distinct_slots());
                for slot in self.tables.commit_staged() {
                    if let (Some(observer), Some(value)) = (&self.observer, self.tables.local_value(slot)) {
                        observer.exported(slot, &value);
                    }
                    if slot.kind == SlotKind::Promise {
                        self.watch_promise(slot);
                    }
                }
                Ok(data)
            }
            Err(err) => {
                self.tables.abort_staged();
                Err(err)
            }
        }
    }

    /// Decode an inbound payload. Every slot it names counts as one mention.
    pub(crate) fn unmarshal_value(&mut self, data: &CapData) -> CapTpResult<Value> {
        let keep_alive = !self.config.gc_imports;
        let mut resolved = HashMap::with_capacity(data.slots.len());
        for wire_slot in data.distinct_slots() {
            let slot = wire_slot.reverse();
            let value = if slot.is_local() {
                self.tables
                    .local_value(slot)
                    .ok_or(CapTpError::UnknownSlot(slot))?
            } else {
                let fresh = !self.tables.has_import(slot);
                let value = Value::Remote(self.tables.import_slot(slot, &self.link, keep_alive)?);
                if let (true, Some(observer)) = (fresh, &self.observer) {
                    observer.imported(slot, &value);
                }
                value
            };
            resolved.insert(wire_slot, value);
        }
        self.marshal.from_cap_data(data, &mut |slot: Slot| {
            resolved
                .get(&slot)
                .cloned()
                .ok_or(CapTpError::UnknownSlot(slot.reverse()))
        })
    }

    /// Start waiting on a newly exported local promise.
    fn watch_promise(&mut self, slot: Slot) {
        let Some(Value::Promise(promise)) = self.tables.local_value(slot) else {
            return;
        };
        self.pipeline.open(slot, None);
        self.spawn_work(async move {
            Completion::Target {
                slot,
                outcome: promise.await,
            }
        });
    }

    // -----------------------------------------------------------------------
    // Reporting
    // -----------------------------------------------------------------------

    pub(crate) fn report_violation(&mut self, err: &CapTpError, context: &str) {
        self.counters.protocol_violations += 1;
        warn!(conn = %self.link.id, context, error = %err, "CapTP: message dropped");
        if let Some(observer) = &self.observer {
            observer.rejected(err);
        }
    }

    pub(crate) fn report_gc_violation(&mut self, err: &CapTpError) {
        self.counters.gc_violations += 1;
        warn!(conn = %self.link.id, error = %err, "CapTP: GC notice ignored");
        if let Some(observer) = &self.observer {
            observer.rejected(err);
        }
    }

    /// An inbound frame that could not be decoded into a message.
    pub(crate) fn report_malformed(&mut self, detail: &str) {
        if self.is_closed() {
            return;
        }
        self.report_violation(
            &CapTpError::ProtocolViolation(format!("undecodable message: {detail}")),
            "decode",
        );
    }

    pub(crate) fn stats(&self) -> SessionStats {
        let mut stats = self.counters.clone();
        stats.exports = self.tables.export_count();
        stats.answers = self.tables.answer_count();
        stats.imports = self.tables.import_count();
        stats.questions = self.ledger.len();
        stats
    }

    // -----------------------------------------------------------------------
    // Teardown
    // -----------------------------------------------------------------------

    /// Tear the connection down. Only the first call has any effect.
    ///
    /// With `notify_peer` an ABORT is queued before the tables are released.
    pub(crate) fn close(&mut self, reason: &str, notify_peer: bool) -> Option<CloseReport> {
        if self.is_closed() {
            return None;
        }
        if notify_peer {
            self.send(MessageKind::Abort {
                reason: reason.to_string(),
            });
        }
        self.link.mark_closed(reason);

        let err = CapTpError::ConnectionClosed(reason.to_string());
        let rejected_questions = self.ledger.reject_all(&err);
        let released_entries = self.tables.clear(&err);
        self.pipeline.abandon(&Value::error(err.to_string()));
        self.work.clear();

        info!(
            conn = %self.link.id,
            reason,
            rejected_questions,
            released_entries,
            "CapTP: connection closed"
        );
        let report = CloseReport {
            reason: reason.to_string(),
            rejected_questions,
            released_entries,
        };
        self.closed = Some(report.clone());
        Some(report)
    }
}
