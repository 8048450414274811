//! Conversion between [`Value`]s and wire-safe [`CapData`].
//!
//! The protocol only needs the slot table of a payload; everything inside the
//! body belongs to the marshaller. [`JsonMarshal`] is the default encoding:
//! plain JSON with `@qclass` objects for anything JSON cannot say directly.

use crate::value::Value;
use captp_types::{CapData, CapTpError, CapTpResult, Slot};
use serde_json::{json, Map, Number};

/// Key that marks a special object in a JSON body.
pub const QCLASS: &str = "@qclass";

/// Maps a capability value to the slot that names it on the wire.
pub type ValToSlot<'a> = dyn FnMut(&Value) -> CapTpResult<Slot> + 'a;

/// Maps a slot from a payload back to a value.
pub type SlotToVal<'a> = dyn FnMut(Slot) -> CapTpResult<Value> + 'a;

/// A serializer for message payloads.
pub trait Marshal: Send + Sync {
    /// Encode `value`, asking `val_to_slot` for the slot of every capability.
    fn to_cap_data(&self, value: &Value, val_to_slot: &mut ValToSlot<'_>) -> CapTpResult<CapData>;

    /// Decode `data`, asking `slot_to_val` for the value behind every slot.
    fn from_cap_data(&self, data: &CapData, slot_to_val: &mut SlotToVal<'_>) -> CapTpResult<Value>;
}

/// JSON body encoding with `@qclass` markers.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonMarshal;

impl JsonMarshal {
    fn encode(
        &self,
        value: &Value,
        slots: &mut Vec<Slot>,
        val_to_slot: &mut ValToSlot<'_>,
    ) -> CapTpResult<serde_json::Value> {
        Ok(match value {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => json!(b),
            Value::Int(i) => json!(i),
            Value::Float(x) => json!({ QCLASS: "float", "value": x.to_string() }),
            Value::String(s) => json!(s),
            Value::List(items) => serde_json::Value::Array(
                items
                    .iter()
                    .map(|item| self.encode(item, slots, val_to_slot))
                    .collect::<CapTpResult<_>>()?,
            ),
            Value::Record(fields) => {
                let mut map = Map::with_capacity(fields.len());
                for (key, field) in fields {
                    if key == QCLASS {
                        return Err(CapTpError::Marshal(format!(
                            "record key {QCLASS:?} is reserved"
                        )));
                    }
                    map.insert(key.clone(), self.encode(field, slots, val_to_slot)?);
                }
                serde_json::Value::Object(map)
            }
            Value::Error(message) => json!({ QCLASS: "error", "message": message }),
            Value::Object(_) | Value::Promise(_) | Value::Remote(_) => {
                let slot = val_to_slot(value)?;
                let index = match slots.iter().position(|s| *s == slot) {
                    Some(index) => index,
                    None => {
                        slots.push(slot);
                        slots.len() - 1
                    }
                };
                match value {
                    Value::Object(obj) => {
                        json!({ QCLASS: "slot", "index": index, "iface": obj.interface() })
                    }
                    _ => json!({ QCLASS: "slot", "index": index }),
                }
            }
        })
    }

    fn decode(
        &self,
        body: &serde_json::Value,
        slots: &[Slot],
        slot_to_val: &mut SlotToVal<'_>,
    ) -> CapTpResult<Value> {
        Ok(match body {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(*b),
            serde_json::Value::Number(n) => decode_number(n)?,
            serde_json::Value::String(s) => Value::String(s.clone()),
            serde_json::Value::Array(items) => Value::List(
                items
                    .iter()
                    .map(|item| self.decode(item, slots, slot_to_val))
                    .collect::<CapTpResult<_>>()?,
            ),
            serde_json::Value::Object(map) => match map.get(QCLASS) {
                None => {
                    let mut fields = std::collections::BTreeMap::new();
                    for (key, field) in map {
                        fields.insert(key.clone(), self.decode(field, slots, slot_to_val)?);
                    }
                    Value::Record(fields)
                }
                Some(serde_json::Value::String(class)) => match class.as_str() {
                    "slot" => {
                        let index = map
                            .get("index")
                            .and_then(serde_json::Value::as_u64)
                            .ok_or_else(|| CapTpError::Marshal("slot marker without index".into()))?;
                        let slot = slots.get(index as usize).copied().ok_or_else(|| {
                            CapTpError::Marshal(format!("slot index {index} out of range"))
                        })?;
                        slot_to_val(slot)?
                    }
                    "error" => Value::Error(
                        map.get("message")
                            .and_then(serde_json::Value::as_str)
                            .unwrap_or_default()
                            .to_string(),
                    ),
                    "float" => {
                        let repr = map
                            .get("value")
                            .and_then(serde_json::Value::as_str)
                            .ok_or_else(|| CapTpError::Marshal("float marker without value".into()))?;
                        Value::Float(repr.parse().map_err(|_| {
                            CapTpError::Marshal(format!("invalid float {repr:?}"))
                        })?)
                    }
                    other => {
                        return Err(CapTpError::Marshal(format!("unknown {QCLASS} {other:?}")))
                    }
                },
                Some(other) => {
                    return Err(CapTpError::Marshal(format!("invalid {QCLASS} {other}")))
                }
            },
        })
    }
}

fn decode_number(n: &Number) -> CapTpResult<Value> {
    if let Some(i) = n.as_i64() {
        Ok(Value::Int(i))
    } else if let Some(x) = n.as_f64() {
        Ok(Value::Float(x))
    } else {
        Err(CapTpError::Marshal(format!("number {n} out of range")))
    }
}

impl Marshal for JsonMarshal {
    fn to_cap_data(&self, value: &Value, val_to_slot: &mut ValToSlot<'_>) -> CapTpResult<CapData> {
        let mut slots = Vec::new();
        let body = self.encode(value, &mut slots, val_to_slot)?;
        Ok(CapData { body, slots })
    }

    fn from_cap_data(&self, data: &CapData, slot_to_val: &mut SlotToVal<'_>) -> CapTpResult<Value> {
        self.decode(&data.body, &data.slots, slot_to_val)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::{reply, Remotable, Reply};
    use captp_types::SlotKind;

    struct Thing;

    impl Remotable for Thing {
        fn interface(&self) -> &str {
            "Thing"
        }

        fn invoke(&self, _method: &str, _args: Vec<Value>) -> Reply {
            reply(Ok(Value::Null))
        }
    }

    fn no_slots(_: &Value) -> CapTpResult<Slot> {
        Err(CapTpError::Marshal("no capabilities expected".into()))
    }

    #[test]
    fn test_plain_data_is_plain_json() {
        let value = Value::record([
            ("n", Value::Int(-4)),
            ("ok", Value::Bool(true)),
            ("items", Value::List(vec![Value::from("a"), Value::Null])),
        ]);
        let data = JsonMarshal.to_cap_data(&value, &mut no_slots).unwrap();
        assert_eq!(data.body, json!({"n": -4, "ok": true, "items": ["a", null]}));
        assert!(data.slots.is_empty());
    }

    #[test]
    fn test_special_values_survive() {
        let value = Value::List(vec![
            Value::Float(2.0),
            Value::Float(f64::INFINITY),
            Value::error("bad"),
        ]);
        let data = JsonMarshal.to_cap_data(&value, &mut no_slots).unwrap();
        let back = JsonMarshal
            .from_cap_data(&data, &mut |_| Err(CapTpError::Marshal("none".into())))
            .unwrap();
        assert_eq!(back, value);
    }

    #[test]
    fn test_repeated_capability_shares_one_slot() {
        let thing = Value::object(Thing);
        let value = Value::List(vec![thing.clone(), thing]);
        let mut calls = 0;
        let data = JsonMarshal
            .to_cap_data(&value, &mut |_| {
                calls += 1;
                Ok(Slot::local(SlotKind::Object, 1))
            })
            .unwrap();
        assert_eq!(calls, 2);
        assert_eq!(data.slots, vec![Slot::local(SlotKind::Object, 1)]);
        assert_eq!(data.body[0], json!({"@qclass": "slot", "index": 0, "iface": "Thing"}));
    }

    #[test]
    fn test_decode_resolves_slots() {
        let data = CapData {
            body: json!([{"@qclass": "slot", "index": 0}]),
            slots: vec![Slot::remote(SlotKind::Object, 7)],
        };
        let mut seen = Vec::new();
        let value = JsonMarshal
            .from_cap_data(&data, &mut |slot| {
                seen.push(slot);
                Ok(Value::Int(7))
            })
            .unwrap();
        assert_eq!(value, Value::List(vec![Value::Int(7)]));
        assert_eq!(seen, vec![Slot::remote(SlotKind::Object, 7)]);
    }

    #[test]
    fn test_reserved_key_and_bad_markers_rejected() {
        let value = Value::record([(QCLASS, Value::Null)]);
        assert!(JsonMarshal.to_cap_data(&value, &mut no_slots).is_err());

        for body in [
            json!({"@qclass": "slot", "index": 3}),
            json!({"@qclass": "mystery"}),
            json!({"@qclass": 5}),
        ] {
            let data = CapData::plain(body);
            assert!(JsonMarshal
                .from_cap_data(&data, &mut |_| Ok(Value::Null))
                .is_err());
        }
    }
}
