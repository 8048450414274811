//! Slot identifiers.
//!
//! A slot names one object, promise or question that crosses a connection.
//! Its textual form is `<kind><direction><id>`, for example `o+3` or `q-7`.
//! Slots are always written into messages from the sender's viewpoint and
//! reversed by the receiver before lookup, so each side's allocations live in
//! their own half of the namespace.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// What kind of reference a slot names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SlotKind {
    /// A non-promise object. Imported objects are presences.
    Object,
    /// A promise exported by the side that will resolve it.
    Promise,
    /// A promise for the answer to a DELIVER or BOOTSTRAP.
    Question,
}

impl SlotKind {
    fn tag(self) -> char {
        match self {
            SlotKind::Object => 'o',
            SlotKind::Promise => 'p',
            SlotKind::Question => 'q',
        }
    }

    fn from_tag(c: char) -> Option<Self> {
        match c {
            'o' => Some(SlotKind::Object),
            'p' => Some(SlotKind::Promise),
            'q' => Some(SlotKind::Question),
            _ => None,
        }
    }

    /// Whether values behind this kind of slot may still be unresolved.
    pub fn is_promise(self) -> bool {
        !matches!(self, SlotKind::Object)
    }
}

/// Which side of the connection holds the value behind a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Direction {
    /// `+`: the value lives on this side (exports and answers).
    Local,
    /// `-`: the value lives on the peer (imports and questions).
    Remote,
}

impl Direction {
    fn tag(self) -> char {
        match self {
            Direction::Local => '+',
            Direction::Remote => '-',
        }
    }

    /// The opposite direction.
    pub fn flip(self) -> Self {
        match self {
            Direction::Local => Direction::Remote,
            Direction::Remote => Direction::Local,
        }
    }
}

/// A connection-scoped reference identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Slot {
    pub kind: SlotKind,
    pub direction: Direction,
    pub id: u64,
}

impl Slot {
    pub fn new(kind: SlotKind, direction: Direction, id: u64) -> Self {
        Self {
            kind,
            direction,
            id,
        }
    }

    /// A slot for a value that lives on this side.
    pub fn local(kind: SlotKind, id: u64) -> Self {
        Self::new(kind, Direction::Local, id)
    }

    /// A slot for a value that lives on the peer.
    pub fn remote(kind: SlotKind, id: u64) -> Self {
        Self::new(kind, Direction::Remote, id)
    }

    /// The same slot as seen from the other end of the connection.
    pub fn reverse(self) -> Self {
        Self {
            direction: self.direction.flip(),
            ..self
        }
    }

    pub fn is_local(&self) -> bool {
        self.direction == Direction::Local
    }

    pub fn is_remote(&self) -> bool {
        self.direction == Direction::Remote
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.kind.tag(), self.direction.tag(), self.id)
    }
}

/// Error parsing a slot from its textual form.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Malformed slot reference: {0:?}")]
pub struct SlotParseError(pub String);

impl FromStr for Slot {
    type Err = SlotParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut chars = s.chars();
        let kind = chars
            .next()
            .and_then(SlotKind::from_tag)
            .ok_or_else(|| SlotParseError(s.to_string()))?;
        let direction = match chars.next() {
            Some('+') => Direction::Local,
            Some('-') => Direction::Remote,
            _ => return Err(SlotParseError(s.to_string())),
        };
        let digits = chars.as_str();
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return Err(SlotParseError(s.to_string()));
        }
        let id = digits
            .parse::<u64>()
            .map_err(|_| SlotParseError(s.to_string()))?;
        Ok(Slot::new(kind, direction, id))
    }
}

impl TryFrom<String> for Slot {
    type Error = SlotParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Slot> for String {
    fn from(slot: Slot) -> Self {
        slot.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_display() {
        let slot: Slot = "o+12".parse().unwrap();
        assert_eq!(slot, Slot::local(SlotKind::Object, 12));
        assert_eq!(slot.to_string(), "o+12");

        let q: Slot = "q-3".parse().unwrap();
        assert_eq!(q.kind, SlotKind::Question);
        assert!(q.is_remote());
    }

    #[test]
    fn test_reverse_flips_direction_only() {
        let slot = Slot::local(SlotKind::Promise, 7);
        let rev = slot.reverse();
        assert_eq!(rev.to_string(), "p-7");
        assert_eq!(rev.reverse(), slot);
    }

    #[test]
    fn test_malformed_slots_rejected() {
        for bad in ["", "o", "o+", "x+1", "o*1", "o+1a", "o+-1", "q+ 2"] {
            assert!(bad.parse::<Slot>().is_err(), "accepted {bad:?}");
        }
    }

    #[test]
    fn test_serde_as_string() {
        let slot = Slot::remote(SlotKind::Object, 4);
        let json = serde_json::to_string(&slot).unwrap();
        assert_eq!(json, "\"o-4\"");
        let back: Slot = serde_json::from_str(&json).unwrap();
        assert_eq!(back, slot);
        assert!(serde_json::from_str::<Slot>("\"z+1\"").is_err());
    }

    #[test]
    fn test_composite_key_distinguishes_directions() {
        let ours = Slot::remote(SlotKind::Question, 1);
        let theirs = Slot::local(SlotKind::Question, 1);
        assert_ne!(ours, theirs);
    }
}
