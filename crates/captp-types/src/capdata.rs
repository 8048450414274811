//! Wire-safe payloads.

use crate::slot::Slot;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// A marshalled value: a JSON body plus the slot table its references index into.
///
/// The body refers to slots by position (`{"@qclass": "slot", "index": 0}`),
/// so the protocol can find every reference in a payload without looking at
/// the body at all.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapData {
    pub body: serde_json::Value,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub slots: Vec<Slot>,
}

impl CapData {
    /// A payload with no references.
    pub fn plain(body: serde_json::Value) -> Self {
        Self {
            body,
            slots: Vec::new(),
        }
    }

    /// Distinct slots mentioned by this payload, in first-mention order.
    pub fn distinct_slots(&self) -> Vec<Slot> {
        let mut seen = HashSet::with_capacity(self.slots.len());
        self.slots
            .iter()
            .copied()
            .filter(|slot| seen.insert(*slot))
            .collect()
    }
}
