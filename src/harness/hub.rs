//! The signal bus: emission, pattern-matched subscription, and the
//! persist-before-dispatch pipeline.
//!
//! `Hub` is where the ordering invariants actually live: a signal is
//! durably appended to the recording, then folded into state, then any
//! `state:<key>:changed` signals it produced are themselves fully pushed
//! through this same pipeline, and only then is the original signal
//! dispatched to its own subscribers. The whole sequence runs under a
//! single dispatch lock so two concurrently-emitted signals can never
//! interleave their persist/reduce/dispatch steps.

use crate::harness::error::{AbortReason, RunFailure};
use crate::harness::recorder::{RecordedSignal, RecordingStore};
use crate::harness::signal::{pattern_matches, EmitContext, Payload, Signal};
use crate::harness::state::{ApplyOutcome, StateStore};
use chrono::Utc;
use serde_json::json;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use thiserror::Error;
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Why `Hub::emit` refused to accept a new signal.
#[derive(Debug, Clone, Error)]
pub enum EmitRejected {
    #[error("emission rejected: run was cancelled ({0})")]
    Cancelled(String),
    #[error("emission rejected: run has already failed ({0})")]
    Failed(String),
}

/// Shared, cross-task bookkeeping for one run: activation count, and the
/// cancelled/failed latches that gate new emissions.
///
/// Owned jointly by the [`Hub`] and the [scheduler](crate::harness::scheduler)
/// loop, which is the only other component allowed to increment
/// `activations` — the activation budget is a property of agent
/// activations, not of signal emission, so the Hub only ever reads it.
pub struct RunState {
    run_id: Uuid,
    activations: AtomicUsize,
    cancelled: AtomicBool,
    failed: AtomicBool,
    abort_reason: StdMutex<Option<AbortReason>>,
    fail_reason: StdMutex<Option<RunFailure>>,
    cancellation_token: CancellationToken,
}

impl RunState {
    pub fn new(run_id: Uuid) -> Arc<Self> {
        Arc::new(Self {
            run_id,
            activations: AtomicUsize::new(0),
            cancelled: AtomicBool::new(false),
            failed: AtomicBool::new(false),
            abort_reason: StdMutex::new(None),
            fail_reason: StdMutex::new(None),
            cancellation_token: CancellationToken::new(),
        })
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn activations(&self) -> usize {
        self.activations.load(Ordering::SeqCst)
    }

    /// Record one more agent activation; returns the count *after* this one.
    pub fn record_activation(&self) -> usize {
        self.activations.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn is_failed(&self) -> bool {
        self.failed.load(Ordering::SeqCst)
    }

    /// True once the run can no longer accept ordinary work: cancelled or failed.
    pub fn is_halted(&self) -> bool {
        self.is_cancelled() || self.is_failed()
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation_token.clone()
    }

    /// Latch the run as aborted for `reason`. Used both for explicit
    /// cancellation and for harness-driven aborts (budget, timeout).
    pub fn mark_aborted(&self, reason: AbortReason) {
        if log::log_enabled!(log::Level::Warn) {
            log::warn!("run {} aborted: {reason}", self.run_id);
        }
        self.cancelled.store(true, Ordering::SeqCst);
        *self.abort_reason.lock().expect("run state poisoned") = Some(reason);
        self.cancellation_token.cancel();
    }

    fn mark_failed(&self, failure: RunFailure) {
        if log::log_enabled!(log::Level::Error) {
            log::error!("run {} failed: {failure}", self.run_id);
        }
        self.failed.store(true, Ordering::SeqCst);
        *self.fail_reason.lock().expect("run state poisoned") = Some(failure);
        self.cancellation_token.cancel();
    }

    pub fn abort_reason(&self) -> Option<AbortReason> {
        self.abort_reason.lock().expect("run state poisoned").clone()
    }

    pub fn fail_reason(&self) -> Option<RunFailure> {
        self.fail_reason.lock().expect("run state poisoned").clone()
    }
}

type Handler = Arc<dyn Fn(&Signal) + Send + Sync>;

#[derive(Clone)]
struct Subscription {
    id: u64,
    pattern: String,
    handler: Handler,
    active: Arc<AtomicBool>,
}

/// A live subscription. Dropping this handle does *not* unsubscribe —
/// call [`unsubscribe`](Self::unsubscribe) explicitly.
#[derive(Clone)]
pub struct SubscriptionHandle {
    id: u64,
    active: Arc<AtomicBool>,
}

impl SubscriptionHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Remove this handler. Takes effect starting with the *next* signal
    /// dispatched; a dispatch already in progress for the current signal
    /// still invokes it, since the dispatch snapshot was taken before this
    /// call.
    pub fn unsubscribe(&self) {
        self.active.store(false, Ordering::SeqCst);
    }
}

/// Serialises the persist -> reduce -> recurse -> dispatch pipeline.
struct DispatchState {
    next_signal_id: u64,
}

struct RecorderBinding {
    store: Arc<dyn RecordingStore>,
    recording_id: String,
}

/// The in-process signal broker.
///
/// Construct via [`HubBuilder`]. A `Hub` is always wrapped in an `Arc` so it
/// can be shared between the scheduling loop and every subscribed agent
/// handler.
pub struct Hub {
    run_state: Arc<RunState>,
    subscriptions: StdMutex<Vec<Subscription>>,
    next_sub_id: AtomicU64,
    dispatch: AsyncMutex<DispatchState>,
    state_store: Option<Arc<StateStore>>,
    recorder: Option<RecorderBinding>,
    /// Every signal ever constructed by this hub, in emission order —
    /// including ones whose own dispatch was skipped (a reducer-panicked
    /// signal is never handed to subscribers but was still assigned an id
    /// and persisted, so it belongs in the run's full signal stream).
    all_signals: StdMutex<Vec<Signal>>,
}

/// Builds a [`Hub`], wiring in the optional state store and recording store.
#[derive(Default)]
pub struct HubBuilder {
    state_store: Option<Arc<StateStore>>,
    recorder: Option<RecorderBinding>,
}

impl HubBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_state_store(mut self, state_store: Arc<StateStore>) -> Self {
        self.state_store = Some(state_store);
        self
    }

    pub fn with_recorder(mut self, store: Arc<dyn RecordingStore>, recording_id: String) -> Self {
        self.recorder = Some(RecorderBinding { store, recording_id });
        self
    }

    pub fn build(self, run_state: Arc<RunState>) -> Arc<Hub> {
        Arc::new(Hub {
            run_state,
            subscriptions: StdMutex::new(Vec::new()),
            next_sub_id: AtomicU64::new(0),
            dispatch: AsyncMutex::new(DispatchState { next_signal_id: 0 }),
            state_store: self.state_store,
            recorder: self.recorder,
            all_signals: StdMutex::new(Vec::new()),
        })
    }
}

impl Hub {
    pub fn run_state(&self) -> &Arc<RunState> {
        &self.run_state
    }

    /// Every signal this hub has constructed, in emission order, whether or
    /// not it was dispatched to subscribers.
    pub fn signal_log(&self) -> Vec<Signal> {
        self.all_signals.lock().expect("signal log poisoned").clone()
    }

    /// Register `handler` against `pattern` (see `signal::pattern_matches`
    /// for matching rules). Returns a handle usable to unsubscribe later.
    pub fn subscribe(
        &self,
        pattern: impl Into<String>,
        handler: impl Fn(&Signal) + Send + Sync + 'static,
    ) -> SubscriptionHandle {
        let id = self.next_sub_id.fetch_add(1, Ordering::SeqCst);
        let active = Arc::new(AtomicBool::new(true));
        let subscription = Subscription {
            id,
            pattern: pattern.into(),
            handler: Arc::new(handler),
            active: active.clone(),
        };
        self.subscriptions
            .lock()
            .expect("subscriptions lock poisoned")
            .push(subscription);
        SubscriptionHandle { id, active }
    }

    /// Emit a new signal. Rejected outright once the run is cancelled or
    /// failed.
    pub async fn emit(
        &self,
        name: impl Into<String>,
        payload: Payload,
    ) -> Result<Signal, EmitRejected> {
        if self.run_state.is_cancelled() {
            return Err(EmitRejected::Cancelled(
                self.run_state
                    .abort_reason()
                    .map(|r| r.to_string())
                    .unwrap_or_default(),
            ));
        }
        if self.run_state.is_failed() {
            return Err(EmitRejected::Failed(
                self.run_state
                    .fail_reason()
                    .map(|f| f.to_string())
                    .unwrap_or_default(),
            ));
        }

        let source = EmitContext::current().and_then(|ctx| ctx.agent_name);
        let mut guard = self.dispatch.lock().await;
        Ok(self.emit_inner(&mut guard, name.into(), payload, source).await)
    }

    /// Force-emit `workflow:aborted` and latch the run as cancelled,
    /// bypassing the normal rejection check.
    pub async fn cancel(&self, reason: impl Into<String>) -> Signal {
        self.abort(AbortReason::Cancelled(reason.into())).await
    }

    /// Generic abort path shared by explicit cancellation and
    /// harness-driven aborts (budget exhaustion, deadline). Latches the run
    /// and force-emits `workflow:aborted` carrying `reason`.
    pub async fn abort(&self, reason: AbortReason) -> Signal {
        self.run_state.mark_aborted(reason.clone());
        let mut guard = self.dispatch.lock().await;
        self.emit_inner(
            &mut guard,
            "workflow:aborted".to_string(),
            json!({ "reason": reason.to_string() }),
            None,
        )
        .await
    }

    /// Latch the run as failed for a reason that did not originate from a
    /// reducer panic (e.g. replay divergence) and force-emit `error:replay`
    /// describing it.
    pub async fn fail(&self, failure: RunFailure) -> Signal {
        self.run_state.mark_failed(failure.clone());
        let mut guard = self.dispatch.lock().await;
        self.emit_inner(
            &mut guard,
            "error:replay".to_string(),
            json!({ "message": failure.to_string() }),
            None,
        )
        .await
    }

    /// The full pipeline for one signal: assign id, persist, reduce, push
    /// any resulting `state:*:changed` signals through the same pipeline,
    /// then dispatch to this signal's own subscribers.
    ///
    /// Boxed at the recursive call sites (`state:changed`, `error:reducer`)
    /// to keep the future's size finite — the two recursion sites are each
    /// only one extra pipeline pass deep for a given signal, not unbounded.
    fn emit_inner<'a>(
        &'a self,
        state: &'a mut DispatchState,
        name: String,
        payload: Payload,
        source: Option<String>,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Signal> + Send + 'a>> {
        Box::pin(async move {
            let id = state.next_signal_id;
            state.next_signal_id += 1;

            let signal = Signal {
                id,
                name,
                timestamp: Utc::now(),
                payload,
                source,
                run_id: self.run_state.run_id(),
            };
            if log::log_enabled!(log::Level::Debug) {
                log::debug!(
                    "emit #{} `{}` (source: {})",
                    signal.id,
                    signal.name,
                    signal.source.as_deref().unwrap_or("<root>")
                );
            }
            self.all_signals
                .lock()
                .expect("signal log poisoned")
                .push(signal.clone());

            if let Some(binding) = &self.recorder {
                if let Err(err) = binding
                    .store
                    .append(&binding.recording_id, RecordedSignal::from(&signal))
                    .await
                {
                    self.run_state
                        .mark_failed(RunFailure::StoreAppendFailed(err.to_string()));
                    return signal;
                }
            }

            let Some(state_store) = &self.state_store else {
                self.dispatch(&signal);
                return signal;
            };

            match state_store.apply_signal(&signal) {
                ApplyOutcome::NoReducer => {
                    self.dispatch(&signal);
                }
                ApplyOutcome::Applied { changes } => {
                    for change in changes {
                        let change_payload = json!({
                            "key": change.key,
                            "oldValue": change.old_value,
                            "newValue": change.new_value,
                        });
                        self.emit_inner(
                            state,
                            format!("state:{}:changed", change.key),
                            change_payload,
                            None,
                        )
                        .await;
                    }
                    self.dispatch(&signal);
                }
                ApplyOutcome::ReducerPanicked(message) => {
                    let failure = RunFailure::ReducerFailed {
                        signal_id: signal.id,
                        signal_name: signal.name.clone(),
                        message: message.clone(),
                    };
                    self.run_state.mark_failed(failure.clone());
                    self.emit_inner(
                        state,
                        "error:reducer".to_string(),
                        json!({
                            "signalId": signal.id,
                            "signalName": signal.name,
                            "message": message,
                        }),
                        None,
                    )
                    .await;
                    // The offending signal itself is not dispatched: its
                    // pipeline aborted mid-fold, so its own subscribers
                    // (agents keyed on its name) never see it.
                }
            }

            signal
        })
    }

    /// Invoke every matching, currently-active subscriber with `signal`.
    ///
    /// The snapshot is taken once per call: subscriptions added during this
    /// dispatch are excluded (they begin with the *next* signal) and
    /// subscriptions removed mid-dispatch still run for this signal, since
    /// they were already captured.
    fn dispatch(&self, signal: &Signal) {
        let snapshot: Vec<Subscription> = {
            let mut subs = self.subscriptions.lock().expect("subscriptions lock poisoned");
            subs.retain(|s| s.active.load(Ordering::SeqCst));
            subs.clone()
        };
        for sub in &snapshot {
            if pattern_matches(&sub.pattern, &signal.name) {
                (sub.handler)(signal);
            }
        }
    }
}
