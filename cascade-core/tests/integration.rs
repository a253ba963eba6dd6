//! Integration Tests for the State Graph
//!
//! These tests drive containers, derivations, variables, collections,
//! commands and snapshots together through the public `Registry` API.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use cascade_core::{
    Collection, Container, Derived, Effect, HookOutcome, MetaState, Reduced, Registry,
    RegistryConfig, Rule, Snapshot, StoreMessage, TokenManifest, Variable, VariableTarget,
    WriteError,
};

fn recorder<T>() -> (Arc<Mutex<Vec<T>>>, Arc<Mutex<Vec<T>>>) {
    let log = Arc::new(Mutex::new(Vec::new()));
    (log.clone(), log)
}

// ============================================================================
// Propagation
// ============================================================================

/// Test that a diamond-shaped graph notifies its effect once per write with
/// the settled value.
#[test]
fn diamond_is_glitch_free() {
    let registry = Registry::new();
    let a = Container::new(1).named("a");

    let left = {
        let a = a.clone();
        Derived::new(move |get| get.get(&a) + 1)
    };
    let right = {
        let a = a.clone();
        Derived::new(move |get| get.get(&a) * 10)
    };
    let computed = Arc::new(AtomicUsize::new(0));
    let sum = {
        let (left, right) = (left.clone(), right.clone());
        let computed = computed.clone();
        Derived::new(move |get| {
            computed.fetch_add(1, Ordering::SeqCst);
            get.get(&left) + get.get(&right)
        })
    };

    let (seen, sink) = recorder();
    let _sub = registry.subscribe(&sum, move |n| sink.lock().push(n));

    registry.write(&a, 2);
    registry.write(&a, 3);

    assert_eq!(*seen.lock(), vec![12, 23, 34]);
    assert_eq!(computed.load(Ordering::SeqCst), 3);
}

/// Test that an unchanged derivation stops propagation.
#[test]
fn equal_derivation_suppresses_effects() {
    let registry = Registry::new();
    let n = Container::new(4);
    let parity = {
        let n = n.clone();
        Derived::new(move |get| get.get(&n) % 2 == 0)
    };

    let runs = Arc::new(AtomicUsize::new(0));
    let runs_clone = runs.clone();
    let _sub = registry.subscribe(&parity, move |_| {
        runs_clone.fetch_add(1, Ordering::SeqCst);
    });

    registry.write(&n, 6);
    registry.write(&n, 8);
    assert_eq!(runs.load(Ordering::SeqCst), 1);

    registry.write(&n, 9);
    assert_eq!(runs.load(Ordering::SeqCst), 2);
}

/// Test that a branch not taken on the last run is not a dependency.
#[test]
fn hidden_dependency_is_invisible() {
    let registry = Registry::new();
    let show = Container::new(false);
    let secret = Container::new(String::from("hunter2"));

    let view = {
        let (show, secret) = (show.clone(), secret.clone());
        Derived::new(move |get| {
            if get.get(&show) {
                get.get(&secret)
            } else {
                "secret".to_string()
            }
        })
    };

    let (seen, sink) = recorder();
    let _sub = registry.subscribe(&view, move |s| sink.lock().push(s));

    registry.write(&secret, "swordfish".to_string());
    assert_eq!(*seen.lock(), vec!["secret"]);

    registry.write(&show, true);
    registry.write(&secret, "opensesame".to_string());
    assert_eq!(
        *seen.lock(),
        vec!["secret", "swordfish", "opensesame"]
    );
}

/// Test that unsubscribed entries are pruned by the next walk.
#[test]
fn stale_listeners_are_pruned_lazily() {
    let registry = Registry::new();
    let count = Container::new(0);

    let sub = registry.subscribe(&count, |_| {});
    assert_eq!(registry.get_state(&count).listener_count(), 1);

    sub.unsubscribe();
    assert_eq!(registry.get_state(&count).listener_count(), 1);

    registry.write(&count, 1);
    assert_eq!(registry.get_state(&count).listener_count(), 0);
}

/// Test that a rarely written input keeps one entry per reader no matter
/// how often the reader re-runs.
#[test]
fn quiet_inputs_keep_bounded_listeners() {
    let registry = Registry::new();
    let constant = Container::new(1);
    let busy = Container::new(0);

    let sum = {
        let (constant, busy) = (constant.clone(), busy.clone());
        Derived::new(move |get| get.get(&constant) + get.get(&busy))
    };
    let runs = Arc::new(AtomicUsize::new(0));
    let _effect = {
        let (constant, busy, runs) = (constant.clone(), busy.clone(), runs.clone());
        registry.use_effect(Effect::new(move |get| {
            get.get(&constant);
            get.get(&busy);
            runs.fetch_add(1, Ordering::SeqCst);
        }))
    };
    let _sub = registry.subscribe(&sum, |_| {});

    for n in 1..=1000 {
        registry.write(&busy, n);
    }

    assert_eq!(runs.load(Ordering::SeqCst), 1001);
    assert_eq!(registry.get(&sum), 1001);
    // The effect and the derivation
    assert_eq!(registry.get_state(&constant).listener_count(), 2);
    assert_eq!(registry.get_state(&busy).listener_count(), 2);
}

// ============================================================================
// Writes
// ============================================================================

/// Test that a suspended hook reports pending before committing.
#[test]
fn meta_state_orders_pending_then_ok() {
    let registry = Registry::new();
    let profile = Container::builder(0)
        .on_write(|_, value| {
            HookOutcome::suspend("saving", move |_| HookOutcome::Commit(value))
        })
        .build();

    let (metas, meta_sink) = recorder();
    let (values, value_sink) = recorder();
    let _meta = registry.subscribe(&profile.meta(), move |m| meta_sink.lock().push(m));
    let _value = registry.subscribe(&profile, move |v| value_sink.lock().push(v));

    registry.write(&profile, 5);
    assert_eq!(*values.lock(), vec![0]);
    assert_eq!(registry.pending_tasks(), 1);

    assert_eq!(registry.run_tasks(), 1);
    assert_eq!(
        *metas.lock(),
        vec![MetaState::Ok, MetaState::pending("saving"), MetaState::Ok]
    );
    assert_eq!(*values.lock(), vec![0, 5]);
}

/// Test that a suspended hook can end in an error instead.
#[test]
fn meta_state_orders_pending_then_error() {
    let registry = Registry::new();
    let profile = Container::builder(0)
        .on_write(|_, _| {
            HookOutcome::suspend("saving", |_| HookOutcome::reject("offline", "server down"))
        })
        .build();

    let (metas, meta_sink) = recorder();
    let (values, value_sink) = recorder();
    let _meta = registry.subscribe(&profile.meta(), move |m| meta_sink.lock().push(m));
    let _value = registry.subscribe(&profile, move |v| value_sink.lock().push(v));

    registry.write(&profile, 5);
    registry.run_tasks();

    assert_eq!(
        *metas.lock(),
        vec![
            MetaState::Ok,
            MetaState::pending("saving"),
            MetaState::error("offline", "server down"),
        ]
    );
    assert_eq!(*values.lock(), vec![0]);
}

/// Test that a newer write drops the outcome of an older suspended one.
#[test]
fn stale_task_is_superseded() {
    let registry = Registry::new();
    let field = Container::builder(0)
        .on_write(|_, value: i32| {
            if value % 2 == 1 {
                HookOutcome::suspend("checking", move |_| HookOutcome::Commit(value))
            } else {
                HookOutcome::Commit(value)
            }
        })
        .build();

    registry.write(&field, 1);
    assert!(registry.get(&field.meta()).is_pending());

    registry.write(&field, 2);
    registry.run_tasks();

    assert_eq!(registry.get(&field), 2);
    assert_eq!(registry.get(&field.meta()), MetaState::Ok);
}

/// Test that reducer follow-ups land after their own increment.
#[test]
fn reducer_cascade_is_deterministic() {
    let registry = Registry::new();
    let other = Container::new(String::new()).named("other");

    let other_clone = other.clone();
    let counter = Container::builder(0)
        .named("counter")
        .reducer(move |_: (), n: &i32| {
            Ok(Reduced::new(n + 1).then(other_clone.write("tick".to_string())))
        })
        .build();

    let (log, counter_sink) = recorder();
    let other_sink = log.clone();
    let _counter = registry.subscribe(&counter, move |n| counter_sink.lock().push(n.to_string()));
    let _other = registry.subscribe(&other, move |s| other_sink.lock().push(s));

    for _ in 0..3 {
        registry.dispatch(counter.write(()));
    }

    assert_eq!(
        *log.lock(),
        vec!["0", "", "1", "tick", "2", "tick", "3", "tick"]
    );
}

/// Test that a rejected write inside a batch leaves the rest applied.
#[test]
fn batch_contains_errors() {
    let registry = Registry::new();
    let age = Container::builder(30)
        .reducer(|n: i32, _: &i32| {
            if n < 0 {
                Err(WriteError::new("invalid", "age cannot be negative"))
            } else {
                Ok(Reduced::new(n))
            }
        })
        .build();
    let name = Container::new("ada");

    registry.dispatch(StoreMessage::batch([
        age.write(-1),
        name.write("grace"),
    ]));

    assert_eq!(registry.get(&age), 30);
    assert_eq!(
        registry.get(&age.meta()),
        MetaState::error("invalid", "age cannot be negative")
    );
    assert_eq!(registry.get(&name), "grace");
}

// ============================================================================
// Token kinds
// ============================================================================

/// Test that retargeting a variable only affects later subscribers.
#[test]
fn variable_retargeting_is_isolated() {
    let registry = Registry::new();
    let first = Container::new("a1");
    let second = Container::new("b1");
    let current = Variable::new(VariableTarget::token(first.clone()));

    let (early, early_sink) = recorder();
    let _early = registry.subscribe(&current, move |s| early_sink.lock().push(s));

    registry.dispatch(current.assign(VariableTarget::token(second.clone())));

    let (late, late_sink) = recorder();
    let _late = registry.subscribe(&current, move |s| late_sink.lock().push(s));

    registry.write(&first, "a2");
    registry.write(&second, "b2");

    assert_eq!(*early.lock(), vec!["a1", "a2"]);
    assert_eq!(*late.lock(), vec!["b1", "b2"]);
    assert_eq!(registry.get(&current), "b2");
}

/// Test that clearing a collection drops its subscriptions and values.
#[test]
fn collection_clear_isolates_slots() {
    let registry = Registry::new();
    let todos = Collection::new(|id: &u32| format!("todo {id}"));

    let (seen, sink) = recorder();
    let _sub = registry.subscribe(&todos.key(1), move |s| sink.lock().push(s));

    registry.dispatch(todos.write(1, "buy milk".to_string()));
    registry.dispatch(todos.clear());
    registry.dispatch(todos.write(1, "walk dog".to_string()));
    registry.dispatch(todos.clear());

    assert_eq!(*seen.lock(), vec!["todo 1", "buy milk"]);
    assert_eq!(registry.get(&todos.key(1)), "todo 1");
}

/// Test that a derivation over a collection slot follows the slot across a
/// clear.
#[test]
fn collection_clear_refreshes_derivations() {
    let registry = Registry::new();
    let stock = Collection::new(|_: &char| 0u32);

    let apples = stock.key('a');
    let crates = Derived::new(move |get| get.get(&apples) / 10);

    registry.dispatch(stock.write('a', 50));
    assert_eq!(registry.get(&crates), 5);

    registry.dispatch(stock.clear());
    assert_eq!(registry.get(&crates), 0);

    registry.dispatch(stock.write('a', 70));
    assert_eq!(registry.get(&crates), 7);
}

/// Test the rule end-to-end scenario.
#[test]
fn rule_cycles_through_values() {
    let registry = Registry::new();
    let count = Container::new(1);

    let count_clone = count.clone();
    let cycle = Rule::new(move |get, ()| {
        let next = (get.get(&count_clone) + 1) % 3;
        count_clone.write(next)
    });

    let (seen, sink) = recorder();
    let _sub = registry.subscribe(&count, move |n| sink.lock().push(n));

    registry.dispatch(cycle.trigger(()));
    registry.dispatch(cycle.trigger(()));

    assert_eq!(*seen.lock(), vec![1, 2, 0]);
}

// ============================================================================
// Registry
// ============================================================================

/// Test that repeated lookups return the same publisher.
#[test]
fn publishers_are_idempotent() {
    let registry = Registry::new();
    let count = Container::new(0);
    let doubled = {
        let count = count.clone();
        Derived::new(move |get| get.get(&count) * 2)
    };

    assert!(registry.get_state(&count).ptr_eq(&registry.get_state(&count)));
    assert!(registry.get_state(&doubled).ptr_eq(&registry.get_state(&doubled)));
    assert!(registry.get_state(&count.meta()).ptr_eq(&registry.get_state(&count.meta())));
}

/// Test that a disposed registry ignores dispatches and subscriptions.
#[test]
fn disposed_registry_is_inert() {
    let registry = Registry::new();
    let count = Container::new(0);
    let runs = Arc::new(AtomicUsize::new(0));

    let runs_clone = runs.clone();
    let sub = registry.subscribe(&count, move |_| {
        runs_clone.fetch_add(1, Ordering::SeqCst);
    });

    registry.dispose();
    registry.write(&count, 1);
    registry.dispatch(StoreMessage::run(|_| panic!("must not run")));

    assert_eq!(registry.get(&count), 0);
    assert_eq!(runs.load(Ordering::SeqCst), 1);
    drop(sub);

    let late = registry.use_effect(Effect::new(|_| panic!("must not run")));
    assert!(!late.is_active());
}

/// Test that a snapshot restores into a fresh registry through both
/// encodings.
#[test]
fn snapshot_round_trip() {
    let count = Container::new(0);
    let tags = Container::new(Vec::<String>::new());
    let manifest = TokenManifest::new()
        .with("count", &count)
        .with("tags", &tags);

    let source = Registry::with_config(RegistryConfig::default().with_name("source"));
    source.dispatch(StoreMessage::batch([
        count.write(12),
        tags.write(vec!["rust".into(), "graph".into()]),
    ]));
    let snapshot = source.serialize(&manifest).unwrap();

    let from_json = Snapshot::from_json(&snapshot.to_json().unwrap()).unwrap();
    let from_msgpack = Snapshot::from_msgpack(&snapshot.to_msgpack().unwrap()).unwrap();
    assert_eq!(from_json, snapshot);
    assert_eq!(from_msgpack, snapshot);

    for decoded in [from_json, from_msgpack] {
        let target = Registry::new();
        target.deserialize(&manifest, &decoded).unwrap();
        assert_eq!(target.get(&count), 12);
        assert_eq!(target.get(&tags), vec!["rust".to_string(), "graph".to_string()]);
        assert_eq!(target.get(&count.meta()), MetaState::Ok);
    }
}

/// Test that separate registries never share state.
#[test]
fn registries_are_independent() {
    let count = Container::new(0);
    let left = Registry::new();
    let right = Registry::new();

    let (seen, sink) = recorder();
    let _sub = right.subscribe(&count, move |n| sink.lock().push(n));

    left.write(&count, 5);
    assert_eq!(left.get(&count), 5);
    assert_eq!(right.get(&count), 0);
    assert_eq!(*seen.lock(), vec![0]);
}
