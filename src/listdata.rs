//! Schema-directed decoding of bulk list payloads.
//!
//! The service ships its large lists (initial model population, friends,
//! roommates) as a schema descriptor followed by positional records:
//!
//! ```json
//! [["uid", "nm", {"m": ["camscore", "rc"]}],
//!  [100, "alice", 1200.5, 40],
//!  [101, "bettie", 900.0, 12]]
//! ```
//!
//! The schema is flattened into slots in declaration order; each record
//! aligns to the slots by index. Mismatches never fail the stream: short
//! records leave trailing slots unset, long records drop the excess.

use serde_json::{Map, Value};
use tracing::debug;

use crate::state::SessionState;

/// Decoded bulk payload.
#[derive(Debug, Clone, PartialEq)]
pub enum ListData {
    /// Positional records decoded through the schema.
    Records(Vec<SessionState>),
    /// The payload was already structured; passed through unchanged.
    Structured(Value),
}

#[derive(Debug, Clone)]
struct Slot {
    /// Nested bag this slot writes into, or `None` for a root property.
    bag: Option<String>,
    property: String,
}

/// Decode a bulk list payload (the `rdata` of a MANAGELIST packet).
pub fn decode_list(value: &Value) -> ListData {
    let Some(rows) = value.as_array() else {
        return ListData::Structured(value.clone());
    };

    let mut rows = rows.iter();
    let slots = match rows.next() {
        Some(descriptor) => flatten_schema(descriptor),
        None => return ListData::Records(Vec::new()),
    };

    let mut records = Vec::new();
    for row in rows {
        match row {
            Value::Array(fields) => records.push(decode_record(&slots, fields)),
            Value::Object(map) => records.push(SessionState::from_map(map.clone())),
            other => {
                debug!(?other, "skipping non-record list row");
            }
        }
    }
    ListData::Records(records)
}

// Expand the schema descriptor: a string is one root slot, a single-key
// mapping is one slot per sub-property, writing into that nested bag.
fn flatten_schema(descriptor: &Value) -> Vec<Slot> {
    let Some(elements) = descriptor.as_array() else {
        debug!(?descriptor, "schema descriptor is not an array");
        return Vec::new();
    };

    let mut slots = Vec::new();
    for element in elements {
        match element {
            Value::String(property) => {
                slots.push(Slot { bag: None, property: property.clone() });
            }
            Value::Object(map) if map.len() == 1 => {
                let (bag, subs) = map.iter().next().expect("len checked");
                match subs.as_array() {
                    Some(subs) => {
                        for sub in subs {
                            match sub.as_str() {
                                Some(property) => slots.push(Slot {
                                    bag: Some(bag.clone()),
                                    property: property.to_string(),
                                }),
                                None => debug!(?sub, "skipping non-string schema sub-property"),
                            }
                        }
                    }
                    None => debug!(%bag, "schema bag element is not an array"),
                }
            }
            other => {
                debug!(?other, "skipping unrecognized schema element");
            }
        }
    }
    slots
}

fn decode_record(slots: &[Slot], fields: &[Value]) -> SessionState {
    if fields.len() > slots.len() {
        debug!(
            fields = fields.len(),
            slots = slots.len(),
            "record has more values than schema slots; ignoring excess"
        );
    }

    let mut root = Map::new();
    for (slot, value) in slots.iter().zip(fields) {
        match &slot.bag {
            None => {
                root.insert(slot.property.clone(), value.clone());
            }
            Some(bag) => {
                let entry = root
                    .entry(bag.clone())
                    .or_insert_with(|| Value::Object(Map::new()));
                if let Some(bag_map) = entry.as_object_mut() {
                    bag_map.insert(slot.property.clone(), value.clone());
                }
            }
        }
    }
    SessionState::from_map(root)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn records_align_to_flattened_schema() {
        let data = json!([
            ["uid", "nm", {"m": ["camscore", "rc"]}],
            [100, "alice", 1200.5, 40],
            [101, "bettie", 900.0, 12]
        ]);

        let ListData::Records(records) = decode_list(&data) else {
            panic!("expected records");
        };
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].uid(), Some(100));
        assert_eq!(records[0].name(), Some("alice"));
        assert_eq!(records[0].camscore(), 1200.5);
        assert_eq!(records[0].viewer_count(), Some(40));
        assert_eq!(records[1].uid(), Some(101));
    }

    #[test]
    fn short_records_leave_trailing_slots_unset() {
        let data = json!([["uid", "nm", "vs"], [7, "carla"]]);

        let ListData::Records(records) = decode_list(&data) else {
            panic!("expected records");
        };
        assert_eq!(records[0].uid(), Some(7));
        assert_eq!(records[0].name(), Some("carla"));
        assert_eq!(records[0].video_state(), None);
    }

    #[test]
    fn long_records_drop_the_excess() {
        let data = json!([["uid"], [7, "stray", 99]]);

        let ListData::Records(records) = decode_list(&data) else {
            panic!("expected records");
        };
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].uid(), Some(7));
        assert_eq!(records[0].as_map().len(), 1);
    }

    #[test]
    fn structured_rows_pass_through_unchanged() {
        let data = json!([["uid"], {"uid": 9, "nm": "already-structured"}]);

        let ListData::Records(records) = decode_list(&data) else {
            panic!("expected records");
        };
        assert_eq!(records[0].uid(), Some(9));
        assert_eq!(records[0].name(), Some("already-structured"));
    }

    #[test]
    fn structured_map_input_passes_through() {
        let data = json!({"12": ["tag-a"], "34": ["tag-b"]});
        assert_eq!(decode_list(&data), ListData::Structured(data.clone()));
    }

    #[test]
    fn malformed_schema_elements_are_skipped() {
        let data = json!([
            ["uid", 42, {"m": ["rc"]}, {"two": [], "keys": []}],
            [7, 30]
        ]);

        let ListData::Records(records) = decode_list(&data) else {
            panic!("expected records");
        };
        // Slots are uid and m.rc; the invalid elements contributed none.
        assert_eq!(records[0].uid(), Some(7));
        assert_eq!(records[0].viewer_count(), Some(30));
    }
}
