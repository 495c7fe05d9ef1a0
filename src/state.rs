//! Per-session state bags.
//!
//! The service reports session state as loosely-typed JSON objects. A
//! [`SessionState`] keeps the raw bag intact (unknown keys are preserved
//! verbatim) and layers typed accessors over the well-known properties.

use serde_json::{Map, Value};

use crate::constants::{UserLevel, VideoState};

/// Nested sub-bags that are overlaid key-by-key rather than replaced
/// wholesale: model, user, session and extended details.
pub const NESTED_BAGS: [&str; 4] = ["m", "u", "s", "x"];

/// One snapshot of a session, keyed by `sid` within its model.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionState(Map<String, Value>);

impl SessionState {
    pub fn new() -> SessionState {
        SessionState(Map::new())
    }

    /// Wrap a decoded JSON object. Returns `None` for non-object values.
    pub fn from_value(value: &Value) -> Option<SessionState> {
        value.as_object().map(|map| SessionState(map.clone()))
    }

    pub fn from_map(map: Map<String, Value>) -> SessionState {
        SessionState(map)
    }

    /// The synthetic offline session every model carries under `sid = 0`.
    pub fn offline() -> SessionState {
        let mut map = Map::new();
        map.insert("sid".to_string(), Value::from(0));
        map.insert("vs".to_string(), Value::from(VideoState::Offline.to_raw()));
        SessionState(map)
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value) {
        self.0.insert(key.into(), value);
    }

    /// Effective value of a property: the root bag wins, then the nested
    /// bags in declaration order.
    pub fn effective(&self, key: &str) -> Option<&Value> {
        if let Some(v) = self.0.get(key) {
            if !NESTED_BAGS.contains(&key) {
                return Some(v);
            }
        }
        for bag in NESTED_BAGS {
            if let Some(v) = self.0.get(bag).and_then(|b| b.as_object()).and_then(|b| b.get(key)) {
                return Some(v);
            }
        }
        None
    }

    /// All property names visible through [`SessionState::effective`]:
    /// root keys plus the sub-keys of each nested bag.
    pub fn effective_keys(&self) -> Vec<String> {
        let mut keys = Vec::with_capacity(self.0.len());
        for (key, value) in &self.0 {
            if NESTED_BAGS.contains(&key.as_str()) {
                if let Some(bag) = value.as_object() {
                    keys.extend(bag.keys().cloned());
                }
            } else {
                keys.push(key.clone());
            }
        }
        keys.sort();
        keys.dedup();
        keys
    }

    /// Overlay `incoming` onto this state. Scalar writes overwrite, the
    /// nested bags merge key-by-key, and nulls leave the stored value
    /// unchanged (the server never expresses deletion this way).
    pub fn overlay(&mut self, incoming: &SessionState) {
        for (key, value) in &incoming.0 {
            if value.is_null() {
                continue;
            }
            if NESTED_BAGS.contains(&key.as_str()) {
                if let Some(sub) = value.as_object() {
                    let slot = self
                        .0
                        .entry(key.clone())
                        .or_insert_with(|| Value::Object(Map::new()));
                    if !slot.is_object() {
                        *slot = Value::Object(Map::new());
                    }
                    if let Some(bag) = slot.as_object_mut() {
                        for (sub_key, sub_value) in sub {
                            if !sub_value.is_null() {
                                bag.insert(sub_key.clone(), sub_value.clone());
                            }
                        }
                    }
                    continue;
                }
            }
            self.0.insert(key.clone(), value.clone());
        }
    }

    // Typed accessors for the well-known properties.

    pub fn sid(&self) -> i64 {
        self.effective("sid").and_then(Value::as_i64).unwrap_or(0)
    }

    pub fn uid(&self) -> Option<i64> {
        self.effective("uid").and_then(Value::as_i64)
    }

    pub fn level(&self) -> Option<UserLevel> {
        self.effective("lv").and_then(Value::as_i64).map(UserLevel::from_raw)
    }

    pub fn video_state(&self) -> Option<VideoState> {
        self.effective("vs").and_then(Value::as_i64).map(VideoState::from_raw)
    }

    /// Whether the session counts as online. An absent video state is
    /// unknown, which is not offline.
    pub fn is_online(&self) -> bool {
        self.video_state() != Some(VideoState::Offline)
    }

    pub fn camscore(&self) -> f64 {
        self.effective("camscore").and_then(Value::as_f64).unwrap_or(0.0)
    }

    pub fn name(&self) -> Option<&str> {
        self.effective("nm").and_then(Value::as_str)
    }

    pub fn viewer_count(&self) -> Option<i64> {
        self.effective("rc").and_then(Value::as_i64)
    }

    pub fn topic(&self) -> Option<&str> {
        self.effective("topic").and_then(Value::as_str)
    }

    pub fn rank(&self) -> Option<i64> {
        self.effective("rank").and_then(Value::as_i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn state(v: Value) -> SessionState {
        SessionState::from_value(&v).expect("object")
    }

    #[test]
    fn scalar_overlay_overwrites() {
        let mut base = state(json!({"sid": 1, "camscore": 50.0, "nm": "alice"}));
        base.overlay(&state(json!({"camscore": 60.0})));

        assert_eq!(base.camscore(), 60.0);
        assert_eq!(base.name(), Some("alice"));
    }

    #[test]
    fn nested_bags_merge_key_by_key() {
        let mut base = state(json!({"sid": 1, "m": {"rc": 10, "camserv": 443}}));
        base.overlay(&state(json!({"m": {"rc": 25}})));

        assert_eq!(base.viewer_count(), Some(25));
        assert_eq!(
            base.effective("camserv").and_then(Value::as_i64),
            Some(443),
            "untouched bag keys survive"
        );
    }

    #[test]
    fn null_writes_leave_fields_unchanged() {
        let mut base = state(json!({"sid": 1, "topic": "hello", "m": {"rc": 3}}));
        base.overlay(&state(json!({"topic": null, "m": {"rc": null}})));

        assert_eq!(base.topic(), Some("hello"));
        assert_eq!(base.viewer_count(), Some(3));
    }

    #[test]
    fn unknown_keys_are_preserved() {
        let mut base = state(json!({"sid": 1}));
        base.overlay(&state(json!({"zz_experimental": [1, 2, 3]})));

        assert_eq!(base.get("zz_experimental"), Some(&json!([1, 2, 3])));
    }

    #[test]
    fn effective_prefers_root_over_bags() {
        let s = state(json!({"rc": 7, "m": {"rc": 9}}));
        assert_eq!(s.viewer_count(), Some(7));

        let s = state(json!({"m": {"rc": 9}}));
        assert_eq!(s.viewer_count(), Some(9));
    }

    #[test]
    fn effective_keys_flatten_bags() {
        let s = state(json!({"sid": 2, "m": {"rc": 9, "flags": 0}, "u": {"age": 1}}));
        let keys = s.effective_keys();
        assert_eq!(keys, vec!["age", "flags", "rc", "sid"]);
    }

    #[test]
    fn absent_video_state_is_not_offline() {
        let s = state(json!({"sid": 3}));
        assert_eq!(s.video_state(), None);
        assert!(s.is_online());

        let offline = SessionState::offline();
        assert!(!offline.is_online());
        assert_eq!(offline.sid(), 0);
    }
}
