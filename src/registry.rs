//! The shared model registry.
//!
//! One registry is constructed by the application and handed to every
//! client; all server-driven state converges here. Merges and their
//! change-event emission are serialized so observers see each merge as
//! one atomic step.
//!
//! Change listeners and `when` callbacks run synchronously on the
//! dispatching client's task. They may register or remove listeners and
//! read models, but must not invoke merge operations.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tracing::{debug, trace};

use crate::events::{ListenerId, ListenerSet};
use crate::model::Model;
use crate::state::SessionState;

/// Property name that subscribes to every change event.
pub const ANY_PROPERTY: &str = "ANY";

/// Handle returned by [`ModelRegistry::when`], used for removal.
pub type WhenId = u64;

/// A field-level change observed on a model's best session.
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    /// Snapshot of the model after the merge that caused this change.
    pub model: Arc<Model>,
    pub property: String,
    pub previous: Option<Value>,
    pub next: Option<Value>,
}

type WhenPredicate = Box<dyn Fn(&Model) -> bool + Send>;
type WhenAction = Box<dyn FnMut(&Model) + Send>;

struct WhenBinding {
    id: WhenId,
    /// Restricts the binding to one model; `None` is global.
    scope: Option<i64>,
    predicate: WhenPredicate,
    on_true: WhenAction,
    on_false_after_true: Option<WhenAction>,
    /// Last evaluation per model, for edge triggering.
    last: HashMap<i64, bool>,
}

#[derive(Default)]
struct WhenTable {
    bindings: Vec<WhenBinding>,
    next_id: WhenId,
    /// True while bindings are checked out for evaluation; removals are
    /// deferred into `removed` until they come back.
    evaluating: bool,
    removed: std::collections::HashSet<WhenId>,
}

#[derive(Default)]
struct RegistryData {
    models: HashMap<i64, Model>,
    logged_in_clients: usize,
}

// (scope, property): scope None is the registry-wide listener space.
type ChangeKey = (Option<i64>, String);

struct RegistryShared {
    /// Serializes merge + emission across clients.
    op_lock: Mutex<()>,
    data: Mutex<RegistryData>,
    listeners: ListenerSet<ChangeKey, ChangeEvent>,
    whens: Mutex<WhenTable>,
}

/// Cheaply clonable handle to the shared registry.
#[derive(Clone)]
pub struct ModelRegistry {
    shared: Arc<RegistryShared>,
}

impl Default for ModelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ModelRegistry {
    pub fn new() -> ModelRegistry {
        ModelRegistry {
            shared: Arc::new(RegistryShared {
                op_lock: Mutex::new(()),
                data: Mutex::new(RegistryData::default()),
                listeners: ListenerSet::new(),
                whens: Mutex::new(WhenTable::default()),
            }),
        }
    }

    /// Snapshot of one model, if known.
    pub fn model(&self, uid: i64) -> Option<Model> {
        self.shared.data.lock().expect("registry lock").models.get(&uid).cloned()
    }

    pub fn contains(&self, uid: i64) -> bool {
        self.shared.data.lock().expect("registry lock").models.contains_key(&uid)
    }

    /// Snapshot of every known model.
    pub fn models(&self) -> Vec<Model> {
        self.shared.data.lock().expect("registry lock").models.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.shared.data.lock().expect("registry lock").models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Look up a model, creating it on first reference.
    pub fn get_or_create(&self, uid: i64) -> Model {
        let mut data = self.shared.data.lock().expect("registry lock");
        data.models.entry(uid).or_insert_with(|| Model::new(uid)).clone()
    }

    /// Merge a session snapshot into a model and publish the resulting
    /// change events. Returns false when the model is unknown and
    /// `auto_create` is off.
    ///
    /// A snapshot whose `uid` is 0 with a positive `sid` is normalized to
    /// `uid = sid` first (the server's "same as sid" shorthand).
    pub fn merge(&self, uid: i64, incoming: &SessionState, auto_create: bool) -> bool {
        let _op = self.shared.op_lock.lock().expect("registry op lock");

        let mut incoming = incoming.clone();
        if incoming.uid() == Some(0) && incoming.sid() > 0 {
            incoming.insert("uid", Value::from(incoming.sid()));
        }

        let (snapshot, changes) = {
            let mut data = self.shared.data.lock().expect("registry lock");
            if !auto_create && !data.models.contains_key(&uid) {
                return false;
            }
            let model = data.models.entry(uid).or_insert_with(|| Model::new(uid));
            let changes = model.merge_session(&incoming);
            (Arc::new(model.clone()), changes)
        };

        trace!(uid, changes = changes.len(), "merged session snapshot");
        for change in changes {
            self.publish(&snapshot, change.property, change.previous, change.next);
        }
        true
    }

    /// Union-insert tags into an existing model, publishing one `tags`
    /// change event when the set grew. Unknown models are ignored.
    pub fn merge_tags<I, S>(&self, uid: i64, tags: I) -> bool
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let _op = self.shared.op_lock.lock().expect("registry op lock");

        let (snapshot, previous) = {
            let mut data = self.shared.data.lock().expect("registry lock");
            let Some(model) = data.models.get_mut(&uid) else {
                return false;
            };
            let previous = tag_list(model);
            if !model.merge_tags(tags) {
                return false;
            }
            (Arc::new(model.clone()), previous)
        };

        let next = tag_list(&snapshot);
        self.publish(&snapshot, "tags".to_string(), Some(previous), Some(next));
        true
    }

    /// Merge a viewer count into the best session of a known model.
    pub fn merge_room_count(&self, uid: i64, count: i64) -> bool {
        let incoming = {
            let data = self.shared.data.lock().expect("registry lock");
            let Some(model) = data.models.get(&uid) else {
                return false;
            };
            let mut map = serde_json::Map::new();
            map.insert("sid".to_string(), Value::from(model.best_session_id()));
            map.insert(
                "m".to_string(),
                serde_json::json!({ "rc": count }),
            );
            SessionState::from_map(map)
        };
        self.merge(uid, &incoming, false)
    }

    /// Listen for changes of one property on any model. Use
    /// [`ANY_PROPERTY`] for all properties.
    pub fn on_change(
        &self,
        property: &str,
        callback: impl FnMut(&ChangeEvent) + Send + 'static,
    ) -> ListenerId {
        self.shared.listeners.add((None, property.to_string()), callback)
    }

    /// Listen for changes of one property on one model.
    pub fn on_model_change(
        &self,
        uid: i64,
        property: &str,
        callback: impl FnMut(&ChangeEvent) + Send + 'static,
    ) -> ListenerId {
        self.shared.listeners.add((Some(uid), property.to_string()), callback)
    }

    pub fn remove_listener(&self, id: ListenerId) {
        self.shared.listeners.remove(id);
    }

    /// Register an edge-triggered condition over all models.
    ///
    /// After any change event for a model, the predicate is re-evaluated
    /// for it: `on_true` fires on a false-to-true transition,
    /// `on_false_after_true` (when supplied) on the way back down.
    pub fn when(
        &self,
        predicate: impl Fn(&Model) -> bool + Send + 'static,
        on_true: impl FnMut(&Model) + Send + 'static,
        on_false_after_true: Option<Box<dyn FnMut(&Model) + Send>>,
    ) -> WhenId {
        self.register_when(None, Box::new(predicate), Box::new(on_true), on_false_after_true)
    }

    /// Like [`ModelRegistry::when`], scoped to a single model.
    pub fn when_model(
        &self,
        uid: i64,
        predicate: impl Fn(&Model) -> bool + Send + 'static,
        on_true: impl FnMut(&Model) + Send + 'static,
        on_false_after_true: Option<Box<dyn FnMut(&Model) + Send>>,
    ) -> WhenId {
        self.register_when(Some(uid), Box::new(predicate), Box::new(on_true), on_false_after_true)
    }

    pub fn remove_when(&self, id: WhenId) {
        let mut whens = self.shared.whens.lock().expect("when lock");
        if whens.evaluating {
            whens.removed.insert(id);
        } else {
            whens.bindings.retain(|b| b.id != id);
        }
    }

    /// Count a client that completed login. Guards [`reset`](Self::reset).
    pub fn client_logged_in(&self) {
        let mut data = self.shared.data.lock().expect("registry lock");
        data.logged_in_clients += 1;
        debug!(clients = data.logged_in_clients, "logged-in client attached");
    }

    /// Drop a logged-in client; the registry resets when none remain, so
    /// transient reconnects never discard state.
    pub fn client_logged_out(&self) {
        let reset = {
            let mut data = self.shared.data.lock().expect("registry lock");
            data.logged_in_clients = data.logged_in_clients.saturating_sub(1);
            data.logged_in_clients == 0
        };
        if reset {
            self.reset();
        }
    }

    /// Clear all models. The server re-seeds the registry on the next
    /// login.
    pub fn reset(&self) {
        let _op = self.shared.op_lock.lock().expect("registry op lock");
        let mut data = self.shared.data.lock().expect("registry lock");
        debug!(models = data.models.len(), "resetting model registry");
        data.models.clear();
        let mut whens = self.shared.whens.lock().expect("when lock");
        for binding in &mut whens.bindings {
            binding.last.clear();
        }
    }

    fn register_when(
        &self,
        scope: Option<i64>,
        predicate: WhenPredicate,
        on_true: WhenAction,
        on_false_after_true: Option<WhenAction>,
    ) -> WhenId {
        let mut whens = self.shared.whens.lock().expect("when lock");
        whens.next_id += 1;
        let id = whens.next_id;
        whens.bindings.push(WhenBinding {
            id,
            scope,
            predicate,
            on_true,
            on_false_after_true,
            last: HashMap::new(),
        });
        id
    }

    // Deliver one change event: model-scoped listeners before global
    // ones, the named property before the wildcard, then the `when`
    // re-evaluation for the affected model.
    fn publish(
        &self,
        snapshot: &Arc<Model>,
        property: String,
        previous: Option<Value>,
        next: Option<Value>,
    ) {
        let uid = snapshot.uid();
        let event = ChangeEvent { model: Arc::clone(snapshot), property, previous, next };
        let keys = [
            (Some(uid), event.property.clone()),
            (Some(uid), ANY_PROPERTY.to_string()),
            (None, event.property.clone()),
            (None, ANY_PROPERTY.to_string()),
        ];
        self.shared.listeners.emit(&keys, &event);
        self.evaluate_whens(snapshot);
    }

    // Bindings are checked out for the duration of the evaluation so
    // their callbacks can register or remove bindings without
    // deadlocking; mutations land once the pass completes.
    fn evaluate_whens(&self, model: &Model) {
        let uid = model.uid();
        let mut bindings = {
            let mut whens = self.shared.whens.lock().expect("when lock");
            if whens.evaluating {
                return;
            }
            whens.evaluating = true;
            std::mem::take(&mut whens.bindings)
        };

        for binding in &mut bindings {
            if binding.scope.is_some_and(|scope| scope != uid) {
                continue;
            }
            let now = (binding.predicate)(model);
            let before = binding.last.insert(uid, now).unwrap_or(false);
            if now && !before {
                (binding.on_true)(model);
            } else if !now && before {
                if let Some(on_false) = binding.on_false_after_true.as_mut() {
                    on_false(model);
                }
            }
        }

        let mut whens = self.shared.whens.lock().expect("when lock");
        let added_during = std::mem::take(&mut whens.bindings);
        bindings.extend(added_during);
        let removed = std::mem::take(&mut whens.removed);
        if !removed.is_empty() {
            bindings.retain(|b| !removed.contains(&b.id));
        }
        whens.bindings = bindings;
        whens.evaluating = false;
    }
}

fn tag_list(model: &Model) -> Value {
    Value::Array(model.tags().iter().cloned().map(Value::from).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn snapshot(v: Value) -> SessionState {
        SessionState::from_value(&v).expect("object")
    }

    fn collect_events(registry: &ModelRegistry) -> Arc<Mutex<Vec<(String, Option<Value>, Option<Value>)>>> {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        registry.on_change(ANY_PROPERTY, move |e| {
            sink.lock()
                .unwrap()
                .push((e.property.clone(), e.previous.clone(), e.next.clone()));
        });
        events
    }

    #[test]
    fn merge_does_not_create_without_auto_create() {
        let registry = ModelRegistry::new();
        assert!(!registry.merge(100, &snapshot(json!({"sid": 1})), false));
        assert!(!registry.contains(100));

        assert!(registry.merge(100, &snapshot(json!({"sid": 1, "vs": 0})), true));
        assert!(registry.contains(100));
    }

    #[test]
    fn uid_zero_normalizes_to_sid() {
        let registry = ModelRegistry::new();
        registry.merge(55, &snapshot(json!({"sid": 55, "uid": 0, "vs": 0})), true);

        let model = registry.model(55).expect("created");
        assert_eq!(model.best_session().uid(), Some(55));
    }

    #[test]
    fn merge_priority_scenario_emits_camscore_change() {
        let registry = ModelRegistry::new();
        registry.merge(100, &snapshot(json!({"sid": 1, "vs": 0, "camscore": 50.0})), true);
        registry.merge(100, &snapshot(json!({"sid": 2, "vs": 0, "camscore": 49.0})), true);
        assert_eq!(registry.model(100).unwrap().best_session_id(), 1);

        let events = collect_events(&registry);
        registry.merge(100, &snapshot(json!({"sid": 2, "camscore": 60.0})), true);

        assert_eq!(registry.model(100).unwrap().best_session_id(), 2);
        let events = events.lock().unwrap();
        let camscore: Vec<_> = events.iter().filter(|(p, _, _)| p == "camscore").collect();
        assert_eq!(camscore.len(), 1, "exactly one camscore event per merge");
        assert_eq!(camscore[0].1, Some(json!(50.0)));
        assert_eq!(camscore[0].2, Some(json!(60.0)));
    }

    #[test]
    fn tag_union_emits_two_events_not_three() {
        let registry = ModelRegistry::new();
        registry.merge(100, &snapshot(json!({"sid": 1, "vs": 0})), true);

        let count = Arc::new(AtomicUsize::new(0));
        let count2 = Arc::clone(&count);
        registry.on_change("tags", move |_| {
            count2.fetch_add(1, Ordering::SeqCst);
        });

        assert!(registry.merge_tags(100, ["a", "b"]));
        assert!(registry.merge_tags(100, ["b", "c"]));
        assert!(!registry.merge_tags(100, ["a"]));

        assert_eq!(count.load(Ordering::SeqCst), 2);
        let tags: Vec<_> = registry.model(100).unwrap().tags().iter().cloned().collect();
        assert_eq!(tags, vec!["a", "b", "c"]);
    }

    #[test]
    fn merge_tags_ignores_unknown_models() {
        let registry = ModelRegistry::new();
        assert!(!registry.merge_tags(999, ["a"]));
        assert!(!registry.contains(999));
    }

    #[test]
    fn room_count_lands_on_best_session() {
        let registry = ModelRegistry::new();
        registry.merge(100, &snapshot(json!({"sid": 8, "vs": 0})), true);

        assert!(registry.merge_room_count(100, 321));
        let model = registry.model(100).unwrap();
        assert_eq!(model.best_session_id(), 8);
        assert_eq!(model.best_session().viewer_count(), Some(321));

        assert!(!registry.merge_room_count(555, 1));
    }

    #[test]
    fn model_scoped_listeners_only_see_their_model() {
        let registry = ModelRegistry::new();
        registry.merge(1, &snapshot(json!({"sid": 1, "vs": 0})), true);
        registry.merge(2, &snapshot(json!({"sid": 2, "vs": 0})), true);

        let count = Arc::new(AtomicUsize::new(0));
        let count2 = Arc::clone(&count);
        registry.on_model_change(1, "topic", move |_| {
            count2.fetch_add(1, Ordering::SeqCst);
        });

        registry.merge(1, &snapshot(json!({"sid": 1, "topic": "tuesday"})), false);
        registry.merge(2, &snapshot(json!({"sid": 2, "topic": "tuesday"})), false);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn when_bindings_are_edge_triggered() {
        let registry = ModelRegistry::new();
        registry.merge(100, &snapshot(json!({"sid": 1, "vs": 90})), true);

        let ups = Arc::new(AtomicUsize::new(0));
        let downs = Arc::new(AtomicUsize::new(0));
        let ups2 = Arc::clone(&ups);
        let downs2 = Arc::clone(&downs);
        registry.when(
            |model| model.is_online(),
            move |_| {
                ups2.fetch_add(1, Ordering::SeqCst);
            },
            Some(Box::new(move |_| {
                downs2.fetch_add(1, Ordering::SeqCst);
            })),
        );

        registry.merge(100, &snapshot(json!({"sid": 4, "vs": 0})), false);
        registry.merge(100, &snapshot(json!({"sid": 4, "camscore": 1.0})), false);
        assert_eq!(ups.load(Ordering::SeqCst), 1, "repeat true evaluations do not refire");

        registry.merge(100, &snapshot(json!({"sid": 4, "vs": 90})), false);
        assert_eq!(downs.load(Ordering::SeqCst), 1);

        registry.merge(100, &snapshot(json!({"sid": 6, "vs": 0})), false);
        assert_eq!(ups.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn when_removal_stops_future_firing() {
        let registry = ModelRegistry::new();
        registry.merge(100, &snapshot(json!({"sid": 1, "vs": 90})), true);

        let ups = Arc::new(AtomicUsize::new(0));
        let ups2 = Arc::clone(&ups);
        let id = registry.when(
            |model| model.is_online(),
            move |_| {
                ups2.fetch_add(1, Ordering::SeqCst);
            },
            None,
        );
        registry.remove_when(id);

        registry.merge(100, &snapshot(json!({"sid": 4, "vs": 0})), false);
        assert_eq!(ups.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn logged_in_refcount_guards_reset() {
        let registry = ModelRegistry::new();
        registry.merge(100, &snapshot(json!({"sid": 1, "vs": 0})), true);

        registry.client_logged_in();
        registry.client_logged_in();
        registry.client_logged_out();
        assert!(registry.contains(100), "one client still attached");

        registry.client_logged_out();
        assert!(registry.is_empty(), "last client out resets the registry");
    }
}
