//! The state projection layer: typed workflow state folded by named reducers.
//!
//! A [`StateStore`] holds one [`WorkflowState`] snapshot per run, mutated
//! exclusively by [`Reducer`]s registered per signal name. Reducers see a
//! [`StateDraft`] with copy-on-write, read-your-writes semantics; committing
//! the draft publishes a new immutable snapshot that structurally shares the
//! unchanged parts of the previous one via `Arc`.

use crate::harness::signal::{Payload, Signal};
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};

/// An immutable view of workflow state at a point in time.
///
/// Cloning is cheap (an `Arc` bump): readers outside a reducer always see a
/// fully-formed, never-partially-written snapshot — reads never block writes.
#[derive(Debug, Clone)]
pub struct WorkflowState {
    version: u64,
    data: Arc<HashMap<String, Payload>>,
}

impl Default for WorkflowState {
    fn default() -> Self {
        Self {
            version: 0,
            data: Arc::new(HashMap::new()),
        }
    }
}

impl WorkflowState {
    pub fn new(initial: HashMap<String, Payload>) -> Self {
        Self {
            version: 0,
            data: Arc::new(initial),
        }
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn get(&self, key: &str) -> Option<&Payload> {
        self.data.get(key)
    }

    pub fn as_map(&self) -> &HashMap<String, Payload> {
        &self.data
    }
}

/// A mutable, copy-on-write view of state handed to a [`Reducer`] for the
/// duration of one signal's fold.
///
/// Writes accumulate in a journal rather than mutating the base map
/// in-place; `get` checks the journal first so a reducer observes its own
/// writes (read-your-writes), and the journal is applied atomically as one
/// new [`WorkflowState`] version when the reducer returns.
pub struct StateDraft<'a> {
    base: &'a HashMap<String, Payload>,
    writes: HashMap<String, Payload>,
}

impl<'a> StateDraft<'a> {
    fn new(base: &'a HashMap<String, Payload>) -> Self {
        Self {
            base,
            writes: HashMap::new(),
        }
    }

    /// Read a key, seeing any writes already made within this draft.
    pub fn get(&self, key: &str) -> Option<&Payload> {
        self.writes.get(key).or_else(|| self.base.get(key))
    }

    /// Overwrite a key. Takes effect only when the draft commits.
    pub fn set(&mut self, key: impl Into<String>, value: Payload) {
        self.writes.insert(key.into(), value);
    }

    /// Remove a key from the next version.
    pub fn remove(&mut self, key: &str) {
        self.writes.insert(key.to_string(), Payload::Null);
    }
}

/// One key's before/after value, handed to both the Hub's synthetic
/// `state:<key>:changed` signal and to [`StateStore::subscribe`] handlers.
#[derive(Debug, Clone)]
pub struct StateChange {
    pub key: String,
    pub old_value: Option<Payload>,
    pub new_value: Option<Payload>,
}

/// A pure function folding `(draft, signal) -> ()`, registered against an
/// exact signal name via [`StateStore::register_reducer`].
///
/// Reducers are expected to be pure; any I/O performed inside one is a
/// deviation the caller must make atomic on its own. A reducer that panics
/// is caught at the boundary in [`StateStore::apply_signal`] rather than
/// unwinding into the caller.
pub type Reducer = Arc<dyn Fn(&mut StateDraft<'_>, &Signal) + Send + Sync>;

/// Outcome of folding one signal into state.
pub enum ApplyOutcome {
    /// No reducer was registered for this signal name.
    NoReducer,
    /// A reducer ran; `changes` is empty if it wrote nothing that differed
    /// from the prior version.
    Applied { changes: Vec<StateChange> },
    /// The reducer panicked. The message is the panic payload, best-effort
    /// stringified.
    ReducerPanicked(String),
}

struct StateInner {
    snapshot: WorkflowState,
    reducers: HashMap<String, Reducer>,
}

/// A registered callback for [`StateStore::subscribe`].
///
/// `key: None` means "notify on every change"; `key: Some(k)` means "notify
/// only when `k` is among the changed keys".
#[derive(Clone)]
struct StateSubscription {
    key: Option<String>,
    handler: Arc<dyn Fn(&StateChange) + Send + Sync>,
}

/// Holds one run's [`WorkflowState`] and its reducer registry.
///
/// `apply_signal` is the only mutator and is meant to be called exactly
/// once per signal, serialised by the caller (the [`Hub`](crate::harness::hub::Hub)'s
/// dispatch lock). The store does not take its own lock against concurrent
/// `apply_signal` calls beyond what is needed for `get`/`subscribe` to
/// observe consistent snapshots; the one-signal-at-a-time contract is an
/// invariant of its caller, not re-derived here.
pub struct StateStore {
    inner: Mutex<StateInner>,
    subscribers: Mutex<Vec<StateSubscription>>,
}

impl StateStore {
    pub fn new(initial: HashMap<String, Payload>) -> Self {
        Self {
            inner: Mutex::new(StateInner {
                snapshot: WorkflowState::new(initial),
                reducers: HashMap::new(),
            }),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    /// Current committed snapshot. Never blocks on a write in progress
    /// elsewhere because writers install their new snapshot atomically.
    pub fn get(&self) -> WorkflowState {
        self.inner.lock().expect("state store poisoned").snapshot.clone()
    }

    /// Register a reducer for an exact signal name (not a pattern).
    pub fn register_reducer(&self, signal_name: impl Into<String>, reducer: Reducer) {
        self.inner
            .lock()
            .expect("state store poisoned")
            .reducers
            .insert(signal_name.into(), reducer);
    }

    /// Whether a reducer is already registered for this signal name.
    ///
    /// Lets callers that auto-install a reducer (for example the scheduler's
    /// `updates`-driven state write) avoid clobbering one the caller
    /// registered explicitly for the same name.
    pub fn has_reducer(&self, signal_name: &str) -> bool {
        self.inner
            .lock()
            .expect("state store poisoned")
            .reducers
            .contains_key(signal_name)
    }

    /// Subscribe to state changes, optionally scoped to one key.
    ///
    /// `key: None` fires the handler for every changed key in every applied
    /// signal; `key: Some(k)` fires only when `k` itself changed. This is a
    /// store-level notification path independent of the Hub's synthetic
    /// `state:<key>:changed` signal — handlers run synchronously, inline
    /// with `apply_signal`, and cannot themselves emit signals.
    pub fn subscribe(
        &self,
        key: Option<String>,
        handler: Arc<dyn Fn(&StateChange) + Send + Sync>,
    ) {
        self.subscribers
            .lock()
            .expect("state store poisoned")
            .push(StateSubscription { key, handler });
    }

    fn notify_subscribers(&self, changes: &[StateChange]) {
        if changes.is_empty() {
            return;
        }
        let subs: Vec<StateSubscription> =
            self.subscribers.lock().expect("state store poisoned").clone();
        for change in changes {
            for sub in &subs {
                let matches = match &sub.key {
                    None => true,
                    Some(k) => k == &change.key,
                };
                if matches {
                    (sub.handler)(change);
                }
            }
        }
    }

    /// Fold `signal` into state via its registered reducer, if any.
    ///
    /// Commits a new [`WorkflowState`] sharing the previous version's `Arc`
    /// when nothing changed, and a freshly-cloned map with the journal
    /// applied when it did, then notifies any matching subscribers.
    pub fn apply_signal(&self, signal: &Signal) -> ApplyOutcome {
        let mut inner = self.inner.lock().expect("state store poisoned");
        let Some(reducer) = inner.reducers.get(&signal.name).cloned() else {
            return ApplyOutcome::NoReducer;
        };

        let base = inner.snapshot.data.clone();
        let result = std::panic::catch_unwind(AssertUnwindSafe(|| {
            let mut draft = StateDraft::new(&base);
            reducer(&mut draft, signal);
            draft.writes
        }));

        let writes = match result {
            Ok(writes) => writes,
            Err(panic) => {
                let message = panic_message(&panic);
                return ApplyOutcome::ReducerPanicked(message);
            }
        };

        if writes.is_empty() {
            return ApplyOutcome::Applied { changes: vec![] };
        }

        let mut changes = Vec::with_capacity(writes.len());
        let mut next: HashMap<String, Payload> = (*base).clone();
        for (key, new_value) in writes {
            let old_value = next.get(&key).cloned();
            let new_value = if new_value.is_null() {
                next.remove(&key);
                None
            } else {
                next.insert(key.clone(), new_value.clone());
                Some(new_value)
            };
            if old_value != new_value {
                changes.push(StateChange {
                    key,
                    old_value,
                    new_value,
                });
            }
        }

        if !changes.is_empty() {
            inner.snapshot = WorkflowState {
                version: inner.snapshot.version + 1,
                data: Arc::new(next),
            };
        }
        drop(inner);

        self.notify_subscribers(&changes);
        ApplyOutcome::Applied { changes }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "reducer panicked with a non-string payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn signal(name: &str) -> Signal {
        Signal {
            id: 0,
            name: name.to_string(),
            timestamp: chrono::Utc::now(),
            payload: json!({}),
            source: None,
            run_id: uuid::Uuid::new_v4(),
        }
    }

    #[test]
    fn reducer_writes_commit_as_new_version() {
        let store = StateStore::new(HashMap::new());
        store.register_reducer(
            "plan:created",
            Arc::new(|draft, _signal| {
                draft.set("plan", json!(["A", "B"]));
            }),
        );

        let outcome = store.apply_signal(&signal("plan:created"));
        match outcome {
            ApplyOutcome::Applied { changes } => {
                assert_eq!(changes.len(), 1);
                assert_eq!(changes[0].key, "plan");
            }
            _ => panic!("expected Applied"),
        }

        let state = store.get();
        assert_eq!(state.version(), 1);
        assert_eq!(state.get("plan"), Some(&json!(["A", "B"])));
    }

    #[test]
    fn no_reducer_is_a_noop() {
        let store = StateStore::new(HashMap::new());
        assert!(matches!(
            store.apply_signal(&signal("untracked:signal")),
            ApplyOutcome::NoReducer
        ));
        assert_eq!(store.get().version(), 0);
    }

    #[test]
    fn read_your_writes_inside_one_reducer() {
        let store = StateStore::new(HashMap::from([("counter".to_string(), json!(1))]));
        store.register_reducer(
            "tick",
            Arc::new(|draft, _signal| {
                let current = draft.get("counter").and_then(|v| v.as_i64()).unwrap_or(0);
                draft.set("counter", json!(current + 1));
                let seen = draft.get("counter").and_then(|v| v.as_i64()).unwrap();
                draft.set("seen_after_write", json!(seen));
            }),
        );
        store.apply_signal(&signal("tick"));
        let state = store.get();
        assert_eq!(state.get("counter"), Some(&json!(2)));
        assert_eq!(state.get("seen_after_write"), Some(&json!(2)));
    }

    #[test]
    fn panicking_reducer_is_isolated() {
        let store = StateStore::new(HashMap::new());
        store.register_reducer(
            "boom",
            Arc::new(|_draft, _signal| {
                panic!("reducer invariant violated");
            }),
        );
        match store.apply_signal(&signal("boom")) {
            ApplyOutcome::ReducerPanicked(msg) => assert!(msg.contains("invariant")),
            _ => panic!("expected ReducerPanicked"),
        }
        // State is untouched by the failed fold.
        assert_eq!(store.get().version(), 0);
    }

    #[test]
    fn has_reducer_reflects_registration() {
        let store = StateStore::new(HashMap::new());
        assert!(!store.has_reducer("plan:created"));
        store.register_reducer("plan:created", Arc::new(|_draft, _signal| {}));
        assert!(store.has_reducer("plan:created"));
    }

    #[test]
    fn subscribe_fires_for_matching_key_only() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let store = StateStore::new(HashMap::new());
        store.register_reducer(
            "tick",
            Arc::new(|draft, _signal| {
                draft.set("counter", json!(1));
                draft.set("other", json!("x"));
            }),
        );

        let all_seen = Arc::new(AtomicUsize::new(0));
        let counter_seen = Arc::new(AtomicUsize::new(0));
        let all_seen_clone = all_seen.clone();
        let counter_seen_clone = counter_seen.clone();

        store.subscribe(None, Arc::new(move |_change| {
            all_seen_clone.fetch_add(1, Ordering::SeqCst);
        }));
        store.subscribe(
            Some("counter".to_string()),
            Arc::new(move |_change| {
                counter_seen_clone.fetch_add(1, Ordering::SeqCst);
            }),
        );

        store.apply_signal(&signal("tick"));

        assert_eq!(all_seen.load(Ordering::SeqCst), 2);
        assert_eq!(counter_seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unchanged_writes_do_not_bump_version() {
        let store = StateStore::new(HashMap::from([("k".to_string(), json!(1))]));
        store.register_reducer(
            "noop",
            Arc::new(|draft, _signal| {
                draft.set("k", json!(1));
            }),
        );
        store.apply_signal(&signal("noop"));
        assert_eq!(store.get().version(), 0);
    }
}
