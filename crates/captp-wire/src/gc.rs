//! Distributed GC: drop and retire notices.
//!
//! The importer sends a drop once the last local handle for a slot is gone,
//! reporting how many payloads mentioned the slot. The exporter releases the
//! slot when that count covers everything it sent and answers with a retire;
//! only then does the importer forget the slot number. A delivery that was
//! already in the channel when the drop was sent is applied normally, since
//! the export is still in the table when it arrives.

use crate::connection::Connection;
use crate::message::MessageKind;
use captp_types::{CapTpError, Slot, SlotKind};
use tracing::debug;

impl Connection {
    /// The last handle for `slot` at `generation` was dropped.
    pub(crate) fn release_import(&mut self, slot: Slot, generation: u64) {
        if self.is_closed() || !self.config.gc_imports {
            return;
        }
        if let Some(seen) = self.tables.begin_drop(slot, generation) {
            self.counters.drops_sent += 1;
            self.send(MessageKind::GcDrop { slot, seen });
        }
    }

    pub(crate) fn on_gc_drop(&mut self, slot: Slot, seen: u64) {
        let Some(ack) = self.tables.ack_export(slot, seen) else {
            self.report_gc_violation(&CapTpError::UnknownSlot(slot));
            return;
        };
        if ack.over_claim {
            self.report_gc_violation(&CapTpError::ProtocolViolation(format!(
                "drop of {} claims {seen} mentions, more than were sent",
                slot.reverse()
            )));
        }
        if ack.refcount > 0 {
            debug!(conn = %self.link.id, slot = %slot, refcount = ack.refcount, "CapTP: export still referenced");
            return;
        }
        if self.pipeline.is_pending(slot) {
            // Queued deliveries still need the target; retire once it settles.
            self.pipeline.mark_released(slot);
            return;
        }
        self.retire_export(slot);
    }

    pub(crate) fn on_gc_retire(&mut self, slot: Slot) {
        match self.tables.retire_import(slot) {
            Ok(()) => {
                if slot.kind == SlotKind::Question {
                    self.ledger.forget(slot);
                }
                debug!(conn = %self.link.id, slot = %slot, "CapTP: import retired");
            }
            Err(err) => self.report_gc_violation(&err),
        }
    }

    /// Release a local export and tell the peer it may forget the slot.
    pub(crate) fn retire_export(&mut self, slot: Slot) {
        self.tables.remove_export(slot);
        self.pipeline.remove(slot);
        self.counters.retires_sent += 1;
        self.send(MessageKind::GcRetire { slot });
    }
}
