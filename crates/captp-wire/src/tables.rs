//! Reference tables: the per-connection maps between local values and slots.
//!
//! Exports are local objects, promises and answers the peer may reference
//! (`+` slots). Imports are the peer's objects, promises and the questions we
//! asked (`-` slots). Both directions keep mention counters for distributed
//! GC: an exporter counts the outbound payloads that named a slot (`sent`), an
//! importer counts the inbound payloads that named it (`seen`).

use crate::link::{resolution_pair, ConnectionLink, ImportHandle, RemoteRef, Resolution, Settler};
use crate::promise::LocalPromise;
use crate::value::{object_key, Value};
use captp_types::{CapTpError, CapTpResult, Slot, SlotKind};
use std::collections::HashMap;
use std::sync::{Arc, Weak};

/// Identity of an exportable local value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum ValueKey {
    Object(usize),
    Promise(u64),
}

impl ValueKey {
    fn of(value: &Value) -> Option<Self> {
        match value {
            Value::Object(obj) => Some(ValueKey::Object(object_key(obj))),
            Value::Promise(p) => Some(ValueKey::Promise(p.id())),
            _ => None,
        }
    }
}

/// A local value the peer may reference.
pub(crate) struct ExportRecord {
    pub(crate) value: Value,
    /// Outbound payloads that mentioned this slot.
    pub(crate) sent: u64,
    /// Highest `seen` count the peer reported in a drop.
    pub(crate) acked: u64,
}

impl ExportRecord {
    /// References the peer may still hold.
    pub(crate) fn refcount(&self) -> u64 {
        self.sent.saturating_sub(self.acked)
    }
}

/// Result of applying a peer's drop notice to an export.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct DropAck {
    pub(crate) refcount: u64,
    /// The peer claimed to have seen more mentions than were sent.
    pub(crate) over_claim: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ImportState {
    Live,
    /// A drop notice was sent; waiting for the peer's retire.
    Dropping,
}

/// A peer value referenced from this side.
pub(crate) struct ImportRecord {
    handle: Weak<ImportHandle>,
    /// Held when imports are not garbage collected.
    strong: Option<Arc<ImportHandle>>,
    generation: u64,
    /// Inbound payloads that mentioned this slot.
    seen: u64,
    pub(crate) state: ImportState,
    resolution: Option<Resolution>,
    /// Settles an imported promise; questions are settled by the ledger.
    settler: Option<Settler>,
}

#[derive(Default)]
pub(crate) struct ReferenceTables {
    exports: HashMap<Slot, ExportRecord>,
    export_keys: HashMap<ValueKey, Slot>,
    imports: HashMap<Slot, ImportRecord>,
    next_object: u64,
    next_promise: u64,
    /// Exports allocated by the payload being marshalled.
    staged: Vec<Slot>,
}

impl ReferenceTables {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    // -----------------------------------------------------------------------
    // Exports
    // -----------------------------------------------------------------------

    /// The slot `value` is already exported under, if any.
    pub(crate) fn slot_for_value(&self, value: &Value) -> Option<Slot> {
        ValueKey::of(value).and_then(|key| self.export_keys.get(&key).copied())
    }

    /// Slot for a local object or promise, allocating one on first export.
    ///
    /// New slots stay staged until [`commit_staged`](Self::commit_staged) or
    /// [`abort_staged`](Self::abort_staged).
    pub(crate) fn export_value(&mut self, value: &Value) -> CapTpResult<Slot> {
        let key = ValueKey::of(value).ok_or_else(|| {
            CapTpError::Marshal(format!("{} cannot be exported", value.type_name()))
        })?;
        if let Some(slot) = self.export_keys.get(&key) {
            return Ok(*slot);
        }
        let slot = match key {
            ValueKey::Object(_) => {
                self.next_object += 1;
                Slot::local(SlotKind::Object, self.next_object)
            }
            ValueKey::Promise(_) => {
                self.next_promise += 1;
                Slot::local(SlotKind::Promise, self.next_promise)
            }
        };
        self.exports.insert(
            slot,
            ExportRecord {
                value: value.clone(),
                sent: 0,
                acked: 0,
            },
        );
        self.export_keys.insert(key, slot);
        self.staged.push(slot);
        Ok(slot)
    }

    /// Count one outbound payload mentioning each of `slots`.
    pub(crate) fn note_sent(&mut self, slots: &[Slot]) {
        for slot in slots {
            if let Some(record) = self.exports.get_mut(slot) {
                record.sent += 1;
            }
        }
    }

    /// Keep the exports allocated since the last commit, returning them.
    pub(crate) fn commit_staged(&mut self) -> Vec<Slot> {
        std::mem::take(&mut self.staged)
    }

    /// Forget the exports allocated by a payload that failed to marshal.
    pub(crate) fn abort_staged(&mut self) {
        for slot in std::mem::take(&mut self.staged) {
            self.remove_export(slot);
        }
    }

    /// Bind a peer question to the local promise for its answer.
    pub(crate) fn register_answer(&mut self, answer: Slot, promise: &LocalPromise) {
        let value = Value::Promise(promise.clone());
        if let Some(key) = ValueKey::of(&value) {
            self.export_keys.insert(key, answer);
        }
        self.exports.insert(
            answer,
            ExportRecord {
                value,
                sent: 0,
                acked: 0,
            },
        );
    }

    pub(crate) fn export(&self, slot: Slot) -> Option<&ExportRecord> {
        self.exports.get(&slot)
    }

    /// The local value behind a `+` slot.
    pub(crate) fn local_value(&self, slot: Slot) -> Option<Value> {
        self.exports.get(&slot).map(|record| record.value.clone())
    }

    /// Apply a drop notice. `None` when the slot is not exported.
    pub(crate) fn ack_export(&mut self, slot: Slot, seen: u64) -> Option<DropAck> {
        let record = self.exports.get_mut(&slot)?;
        let over_claim = seen > record.sent;
        record.acked = record.acked.max(seen.min(record.sent));
        Some(DropAck {
            refcount: record.refcount(),
            over_claim,
        })
    }

    pub(crate) fn remove_export(&mut self, slot: Slot) -> Option<ExportRecord> {
        let record = self.exports.remove(&slot)?;
        if let Some(key) = ValueKey::of(&record.value) {
            if self.export_keys.get(&key) == Some(&slot) {
                self.export_keys.remove(&key);
            }
        }
        Some(record)
    }

    /// Live object and promise exports, not counting answers.
    pub(crate) fn export_count(&self) -> usize {
        self.exports
            .keys()
            .filter(|slot| slot.kind != SlotKind::Question)
            .count()
    }

    pub(crate) fn answer_count(&self) -> usize {
        self.exports.len() - self.export_count()
    }

    // -----------------------------------------------------------------------
    // Imports
    // -----------------------------------------------------------------------

    /// The reference for an imported slot mentioned by an inbound payload.
    ///
    /// Creates the import on first sight and revives a slot whose previous
    /// handle was dropped. Every call counts as one mention.
    pub(crate) fn import_slot(
        &mut self,
        slot: Slot,
        link: &Arc<ConnectionLink>,
        keep_alive: bool,
    ) -> CapTpResult<RemoteRef> {
        if !slot.is_remote() {
            return Err(CapTpError::UnknownSlot(slot));
        }
        if let Some(record) = self.imports.get_mut(&slot) {
            record.seen += 1;
            if let Some(handle) = record.handle.upgrade() {
                return Ok(RemoteRef { handle });
            }
            record.generation += 1;
            record.state = ImportState::Live;
            let handle = Arc::new(ImportHandle {
                link: Arc::clone(link),
                slot,
                generation: record.generation,
                resolution: record.resolution.clone(),
            });
            record.handle = Arc::downgrade(&handle);
            if keep_alive {
                record.strong = Some(Arc::clone(&handle));
            }
            return Ok(RemoteRef { handle });
        }

        let (settler, resolution) = match slot.kind {
            SlotKind::Object => (None, None),
            SlotKind::Promise => {
                let (settler, resolution) = resolution_pair();
                (Some(settler), Some(resolution))
            }
            // Questions are only ever created by asking them.
            SlotKind::Question => return Err(CapTpError::UnknownSlot(slot)),
        };
        let handle = Arc::new(ImportHandle {
            link: Arc::clone(link),
            slot,
            generation: 0,
            resolution: resolution.clone(),
        });
        self.imports.insert(
            slot,
            ImportRecord {
                handle: Arc::downgrade(&handle),
                strong: keep_alive.then(|| Arc::clone(&handle)),
                generation: 0,
                seen: 1,
                state: ImportState::Live,
                resolution,
                settler,
            },
        );
        Ok(RemoteRef { handle })
    }

    /// Record a question we are about to ask.
    pub(crate) fn register_question(
        &mut self,
        slot: Slot,
        handle: &Weak<ImportHandle>,
        resolution: &Resolution,
        keep_alive: bool,
    ) {
        self.imports.insert(
            slot,
            ImportRecord {
                handle: handle.clone(),
                strong: if keep_alive { handle.upgrade() } else { None },
                generation: 0,
                seen: 0,
                state: ImportState::Live,
                resolution: Some(resolution.clone()),
                settler: None,
            },
        );
    }

    /// Settle an imported promise.
    pub(crate) fn settle_import(&mut self, slot: Slot, result: CapTpResult<Value>) -> CapTpResult<()> {
        let record = self
            .imports
            .get_mut(&slot)
            .ok_or(CapTpError::UnknownSlot(slot))?;
        let settler = record.settler.take().ok_or_else(|| {
            CapTpError::ProtocolViolation(format!("duplicate resolve for {slot}"))
        })?;
        let _ = settler.send(result);
        Ok(())
    }

    /// Mark an import as dropping if `generation` is still current and no
    /// handle for it is alive. Returns the mention count to report.
    pub(crate) fn begin_drop(&mut self, slot: Slot, generation: u64) -> Option<u64> {
        let record = self.imports.get_mut(&slot)?;
        if record.generation != generation
            || record.state != ImportState::Live
            || record.handle.strong_count() > 0
        {
            return None;
        }
        record.state = ImportState::Dropping;
        Some(record.seen)
    }

    /// Forget an import the peer has retired.
    pub(crate) fn retire_import(&mut self, slot: Slot) -> CapTpResult<()> {
        match self.imports.get(&slot).map(|record| record.state) {
            None => Err(CapTpError::UnknownSlot(slot)),
            Some(ImportState::Live) => Err(CapTpError::ProtocolViolation(format!(
                "retire for {slot}, which was never dropped"
            ))),
            Some(ImportState::Dropping) => {
                self.imports.remove(&slot);
                Ok(())
            }
        }
    }

    pub(crate) fn has_import(&self, slot: Slot) -> bool {
        self.imports.contains_key(&slot)
    }

    pub(crate) fn import_count(&self) -> usize {
        self.imports.len()
    }

    // -----------------------------------------------------------------------
    // Teardown
    // -----------------------------------------------------------------------

    /// Release every entry, rejecting unsettled imported promises with
    /// `err`. Returns the number of entries released.
    pub(crate) fn clear(&mut self, err: &CapTpError) -> usize {
        let released = self.exports.len() + self.imports.len();
        for (_, mut record) in self.imports.drain() {
            if let Some(settler) = record.settler.take() {
                let _ = settler.send(Err(err.clone()));
            }
        }
        self.exports.clear();
        self.export_keys.clear();
        self.staged.clear();
        released
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::{reply, Remotable, Reply};

    struct Thing;

    impl Remotable for Thing {
        fn invoke(&self, _method: &str, _args: Vec<Value>) -> Reply {
            reply(Ok(Value::Null))
        }
    }

    #[test]
    fn test_export_reuses_slot() {
        let mut tables = ReferenceTables::new();
        let thing = Value::object(Thing);
        let first = tables.export_value(&thing).unwrap();
        tables.note_sent(&[first]);
        tables.commit_staged();
        let second = tables.export_value(&thing).unwrap();
        tables.note_sent(&[second]);
        assert_eq!(first, second);
        assert_eq!(first.to_string(), "o+1");
        assert_eq!(tables.export(first).unwrap().sent, 2);
        assert!(tables.commit_staged().is_empty());
    }

    #[test]
    fn test_abort_staged_forgets_new_exports() {
        let mut tables = ReferenceTables::new();
        let kept = Value::object(Thing);
        let slot = tables.export_value(&kept).unwrap();
        tables.commit_staged();

        let fresh = Value::object(Thing);
        tables.export_value(&kept).unwrap();
        let fresh_slot = tables.export_value(&fresh).unwrap();
        tables.abort_staged();
        assert!(tables.export(slot).is_some());
        assert!(tables.export(fresh_slot).is_none());
        assert!(tables.slot_for_value(&fresh).is_none());
    }

    #[test]
    fn test_drop_acks_are_idempotent() {
        let mut tables = ReferenceTables::new();
        let slot = tables.export_value(&Value::object(Thing)).unwrap();
        tables.note_sent(&[slot]);
        tables.note_sent(&[slot]);
        tables.note_sent(&[slot]);

        let ack = tables.ack_export(slot, 2).unwrap();
        assert_eq!(ack.refcount, 1);
        let again = tables.ack_export(slot, 2).unwrap();
        assert_eq!(again.refcount, 1);
        // An older notice never raises the count back.
        assert_eq!(tables.ack_export(slot, 1).unwrap().refcount, 1);

        let over = tables.ack_export(slot, 9).unwrap();
        assert_eq!(over.refcount, 0);
        assert!(over.over_claim);
        assert!(tables.ack_export(Slot::local(SlotKind::Object, 42), 1).is_none());
    }

    #[test]
    fn test_promise_exports_use_promise_slots() {
        let mut tables = ReferenceTables::new();
        let promise = Value::Promise(LocalPromise::resolved(Value::Null));
        let slot = tables.export_value(&promise).unwrap();
        assert_eq!(slot.to_string(), "p+1");
        assert!(tables.export_value(&Value::Int(1)).is_err());
    }

    #[test]
    fn test_import_drop_and_revive() {
        let (link, _rx) = ConnectionLink::new();
        let mut tables = ReferenceTables::new();
        let slot = Slot::remote(SlotKind::Object, 3);

        let first = tables.import_slot(slot, &link, false).unwrap();
        let again = tables.import_slot(slot, &link, false).unwrap();
        assert!(first.same_reference(&again));
        // Still referenced: no drop.
        assert_eq!(tables.begin_drop(slot, 0), None);
        drop(first);
        drop(again);
        assert_eq!(tables.begin_drop(slot, 0), Some(2));
        assert_eq!(tables.begin_drop(slot, 0), None);

        let revived = tables.import_slot(slot, &link, false).unwrap();
        assert_eq!(revived.handle.generation, 1);
        // The stale generation's release is ignored.
        assert_eq!(tables.begin_drop(slot, 0), None);
        assert!(tables.retire_import(slot).is_err());
        drop(revived);
        assert_eq!(tables.begin_drop(slot, 1), Some(3));
        assert!(tables.retire_import(slot).is_ok());
        assert_eq!(tables.import_count(), 0);
    }

    #[test]
    fn test_unknown_questions_are_not_imported() {
        let (link, _rx) = ConnectionLink::new();
        let mut tables = ReferenceTables::new();
        let err = tables
            .import_slot(Slot::remote(SlotKind::Question, 1), &link, false)
            .err();
        assert_eq!(err, Some(CapTpError::UnknownSlot(Slot::remote(SlotKind::Question, 1))));
        assert!(tables
            .import_slot(Slot::local(SlotKind::Object, 1), &link, false)
            .is_err());
    }

    #[tokio::test]
    async fn test_imported_promise_settles_once() {
        let (link, _rx) = ConnectionLink::new();
        let mut tables = ReferenceTables::new();
        let slot = Slot::remote(SlotKind::Promise, 1);
        let promise = tables.import_slot(slot, &link, false).unwrap();
        tables.settle_import(slot, Ok(Value::Int(5))).unwrap();
        assert!(tables.settle_import(slot, Ok(Value::Int(6))).is_err());
        assert_eq!(promise.when().unwrap().await, Ok(Value::Int(5)));
    }

    #[tokio::test]
    async fn test_clear_rejects_pending_imports() {
        let (link, _rx) = ConnectionLink::new();
        let mut tables = ReferenceTables::new();
        let promise = tables
            .import_slot(Slot::remote(SlotKind::Promise, 1), &link, false)
            .unwrap();
        tables.export_value(&Value::object(Thing)).unwrap();
        let closed = CapTpError::ConnectionClosed("bye".into());
        assert_eq!(tables.clear(&closed), 2);
        assert_eq!(promise.when().unwrap().await, Err(closed));
    }
}
