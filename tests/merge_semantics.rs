//! Registry-level merge invariants over the public API.

use std::sync::{Arc, Mutex};

use proptest::prelude::*;
use serde_json::{json, Value};

use camlink::{ModelRegistry, SessionState, VideoState, ANY_PROPERTY};

fn snapshot(v: Value) -> SessionState {
    SessionState::from_value(&v).expect("object")
}

#[test]
fn events_fire_once_per_merge_with_distinct_values() {
    let registry = ModelRegistry::new();
    let events: Arc<Mutex<Vec<(String, Option<Value>, Option<Value>)>>> =
        Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    registry.on_change(ANY_PROPERTY, move |e| {
        sink.lock()
            .unwrap()
            .push((e.property.clone(), e.previous.clone(), e.next.clone()));
    });

    registry.merge(100, &snapshot(json!({"sid": 1, "vs": 0, "camscore": 10.0})), true);
    let after_first = events.lock().unwrap().len();
    registry.merge(100, &snapshot(json!({"sid": 1, "topic": "caturday"})), true);

    let events = events.lock().unwrap();
    for (property, previous, next) in events.iter() {
        assert_ne!(previous, next, "no-op event for {property}");
    }
    let second: Vec<_> = events[after_first..].iter().collect();
    assert_eq!(second.len(), 1);
    assert_eq!(second[0].0, "topic");

    // One event per property per merge, never duplicates.
    let mut first: Vec<_> = events[..after_first].iter().map(|(p, _, _)| p.clone()).collect();
    first.sort();
    let deduped = first.len();
    first.dedup();
    assert_eq!(first.len(), deduped);
}

#[test]
fn interleaving_independent_models_is_order_insensitive() {
    let alpha = [
        json!({"sid": 1, "vs": 0, "camscore": 10.0}),
        json!({"sid": 1, "camscore": 20.0}),
        json!({"sid": 2, "vs": 0, "camscore": 30.0}),
    ];
    let beta = [
        json!({"sid": 7, "vs": 0, "nm": "bettie"}),
        json!({"sid": 7, "vs": 90}),
    ];

    // Two interleavings that both preserve each model's own order.
    let registry_a = ModelRegistry::new();
    for v in alpha.iter() {
        registry_a.merge(1, &snapshot(v.clone()), true);
    }
    for v in beta.iter() {
        registry_a.merge(2, &snapshot(v.clone()), true);
    }

    let registry_b = ModelRegistry::new();
    let mut a = alpha.iter();
    let mut b = beta.iter();
    registry_b.merge(2, &snapshot(b.next().unwrap().clone()), true);
    registry_b.merge(1, &snapshot(a.next().unwrap().clone()), true);
    registry_b.merge(2, &snapshot(b.next().unwrap().clone()), true);
    for v in a {
        registry_b.merge(1, &snapshot(v.clone()), true);
    }

    for uid in [1, 2] {
        let model_a = registry_a.model(uid).unwrap();
        let model_b = registry_b.model(uid).unwrap();
        assert_eq!(model_a.best_session_id(), model_b.best_session_id());
        assert_eq!(model_a.best_session(), model_b.best_session());
        assert_eq!(model_a.sessions(), model_b.sessions());
    }
}

proptest! {
    // The selected best session always maximizes (is_online, camscore, sid).
    #[test]
    fn prop_best_session_maximizes_rank(
        merges in proptest::collection::vec(
            (1i64..6, proptest::option::of(prop_oneof![Just(0i64), Just(90i64)]), 0.0f64..100.0),
            1..25,
        )
    ) {
        let registry = ModelRegistry::new();
        for (sid, vs, camscore) in merges {
            let mut map = serde_json::Map::new();
            map.insert("sid".into(), json!(sid));
            map.insert("camscore".into(), json!(camscore));
            if let Some(vs) = vs {
                map.insert("vs".into(), json!(vs));
            }
            registry.merge(42, &SessionState::from_map(map), true);
        }

        let model = registry.model(42).expect("created");
        let best = model.best_session();
        let best_rank = (best.is_online(), best.camscore(), best.sid());

        for (sid, session) in model.sessions() {
            if *sid == 0 {
                continue;
            }
            let rank = (session.is_online(), session.camscore(), *sid);
            let not_greater = rank.0 < best_rank.0
                || (rank.0 == best_rank.0 && rank.1 < best_rank.1)
                || (rank.0 == best_rank.0 && rank.1 == best_rank.1 && rank.2 <= best_rank.2);
            prop_assert!(not_greater, "session {sid} outranks best {}", best.sid());
        }
    }

    // Offline-going sessions never leave a dangling best-session id.
    #[test]
    fn prop_best_session_id_always_resolves(
        merges in proptest::collection::vec(
            (1i64..4, prop_oneof![Just(0i64), Just(90i64)]),
            1..20,
        )
    ) {
        let registry = ModelRegistry::new();
        for (sid, vs) in merges {
            registry.merge(7, &snapshot(json!({"sid": sid, "vs": vs})), true);
        }
        let model = registry.model(7).expect("created");
        prop_assert!(model.sessions().contains_key(&model.best_session_id()));
    }
}

#[test]
fn offline_vs_is_distinct_from_absent_vs() {
    let registry = ModelRegistry::new();
    registry.merge(9, &snapshot(json!({"sid": 3, "camscore": 5.0})), true);

    let model = registry.model(9).unwrap();
    assert_eq!(model.best_session_id(), 3);
    assert_eq!(model.best_session().video_state(), None);
    assert!(model.best_session().is_online(), "unknown state is not offline");

    registry.merge(9, &snapshot(json!({"sid": 3, "vs": 90})), true);
    let model = registry.model(9).unwrap();
    assert_eq!(model.best_session().video_state(), Some(VideoState::Offline));
}
