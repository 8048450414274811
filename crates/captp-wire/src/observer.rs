//! Hooks for watching what a connection exports, imports and swallows.

use crate::value::Value;
use captp_types::{CapTpError, Slot};

/// Callbacks invoked from the connection task. Keep them quick; the
/// connection does nothing else while one runs.
pub trait SessionObserver: Send + Sync {
    /// `value` was exported to the peer under `slot` for the first time.
    fn exported(&self, _slot: Slot, _value: &Value) {}

    /// The peer's `slot` was imported for the first time.
    fn imported(&self, _slot: Slot, _value: &Value) {}

    /// An error no caller will see: a dropped inbound message or a failed
    /// one-way delivery.
    fn rejected(&self, _error: &CapTpError) {}
}
