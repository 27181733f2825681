//! The reactive scheduling loop: matches signals to agents, enforces the
//! activation budget, and drives a run to a terminal status.
//!
//! Each agent's trigger pattern is registered as an ordinary hub
//! subscription whose handler is synchronous (as the hub requires) but
//! whose body only decides *whether* to activate — the actual adapter call
//! is handed off to a spawned task, so a slow agent never blocks the
//! dispatch pipeline other signals depend on. Coordination back to the
//! main loop (so it knows when to stop waiting) goes through an in-flight
//! counter plus a `Notify`, the same "count the outstanding work, wake on
//! zero" shape as a bounded worker pool.

use crate::harness::agent::{ActivationRequest, AgentDefinition, ExecutionAdapter};
use crate::harness::config::HarnessConfig;
use crate::harness::error::{AbortReason, HarnessError, TerminalStatus};
use crate::harness::hub::{Hub, HubBuilder, RunState};
use crate::harness::recorder::{RecordingMeta, RecordingStore};
use crate::harness::replay::ReplayDriver;
use crate::harness::signal::{EmitContext, Payload, Signal};
use crate::harness::state::{StateStore, WorkflowState};
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// How this run relates to persistent storage.
#[derive(Clone)]
pub enum RecordingMode {
    /// No recording; signals are not persisted beyond the run.
    Live,
    /// Persist every emitted signal as it happens.
    Record,
    /// Drive execution entirely from a previously recorded run: the real
    /// `ExecutionAdapter` is never called, each agent activation instead
    /// consumes the next recorded signal and asserts it matches.
    Replay { recording_id: String },
}

/// An end-of-run predicate over committed state.
pub type EndWhen = Arc<dyn Fn(&WorkflowState) -> bool + Send + Sync>;

/// Everything needed to run one workflow from its seed signal to a
/// terminal status.
pub struct RunRequest {
    pub agents: Vec<AgentDefinition>,
    pub state_store: Arc<StateStore>,
    pub adapter: Arc<dyn ExecutionAdapter>,
    pub config: HarnessConfig,
    pub end_when: Option<EndWhen>,
    /// The first signal emitted once the hub and all subscriptions are
    /// wired up, e.g. `("workflow:start", json!({}))`.
    pub initial_signal: (String, Payload),
    pub mode: RecordingMode,
    pub recording_store: Option<Arc<dyn RecordingStore>>,
    /// An external cancellation handle an embedder can trigger mid-run
    /// (e.g. on Ctrl-C). When set, the scheduling loop checks it alongside
    /// the run deadline and calls [`Hub::cancel`] the first time it fires.
    pub external_cancellation: Option<CancellationToken>,
    /// In [`RecordingMode::Replay`], resume from a named checkpoint instead
    /// of the start of the recording: every recorded signal up to and
    /// including the checkpoint is folded directly into `state_store`
    /// without dispatch, and the replay cursor starts just past it.
    /// Ignored outside replay mode.
    pub replay_from_checkpoint: Option<String>,
}

/// The result of a run that reached a terminal status: whatever status it
/// reached, the final folded state, and the full in-memory signal stream.
pub struct RunOutcome {
    pub status: TerminalStatus,
    pub final_state: WorkflowState,
    pub signals: Vec<Signal>,
    pub activations: usize,
    pub run_id: Uuid,
    pub recording_id: Option<String>,
    pub metrics: RunMetrics,
}

/// Summary counters for one run.
#[derive(Debug, Clone)]
pub struct RunMetrics {
    pub total_signals: usize,
    pub total_activations: usize,
    pub duration: Duration,
    pub per_agent_activations: HashMap<String, usize>,
}

const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Run a workflow to completion, abortion, or failure.
pub async fn run_workflow(request: RunRequest) -> Result<RunOutcome, HarnessError> {
    let run_id = Uuid::new_v4();
    let run_state = RunState::new(run_id);
    let start = Instant::now();
    if log::log_enabled!(log::Level::Info) {
        log::info!(
            "starting run {run_id} with {} agent(s), max_activations={}",
            request.agents.len(),
            request.config.max_activations
        );
    }

    let recording_id = resolve_recording_id(&request, run_id).await?;
    let replay_driver = load_replay_driver(&request, &request.state_store).await?;

    for agent in &request.agents {
        if agent.updates.is_empty() {
            continue;
        }
        let Some(primary) = agent.emits.first().cloned() else {
            continue;
        };
        if request.state_store.has_reducer(&primary) {
            continue;
        }
        let keys = agent.updates.clone();
        let has_schema = agent.has_output_schema();
        request.state_store.register_reducer(
            primary,
            Arc::new(move |draft, signal| {
                let content = if has_schema {
                    signal.payload.clone()
                } else {
                    signal
                        .payload
                        .get("output")
                        .cloned()
                        .unwrap_or_else(|| signal.payload.clone())
                };
                for key in &keys {
                    draft.set(key.clone(), content.clone());
                }
            }),
        );
    }

    let mut hub_builder = HubBuilder::new().with_state_store(request.state_store.clone());
    if matches!(request.mode, RecordingMode::Record) {
        let store = request
            .recording_store
            .clone()
            .ok_or(HarnessError::RecordingStoreRequired)?;
        hub_builder =
            hub_builder.with_recorder(store, recording_id.clone().expect("set in Record mode"));
    }
    let hub = hub_builder.build(run_state.clone());

    let notify = Arc::new(Notify::new());
    let in_flight = Arc::new(AtomicUsize::new(0));
    let per_agent_counts: Arc<StdMutex<HashMap<String, usize>>> =
        Arc::new(StdMutex::new(HashMap::new()));

    for agent in &request.agents {
        register_agent(
            agent,
            &hub,
            &request.adapter,
            &run_state,
            &request.config,
            &per_agent_counts,
            &request.state_store,
            &notify,
            &in_flight,
            &replay_driver,
        );
    }

    let (initial_name, initial_payload) = request.initial_signal.clone();
    hub.emit(initial_name, initial_payload).await.ok();

    let status = loop {
        if let Some(status) = terminal_status(&run_state) {
            break status;
        }

        let state_snapshot = request.state_store.get();
        let end_reached = request
            .end_when
            .as_ref()
            .map(|f| f(&state_snapshot))
            .unwrap_or(false);
        if end_reached {
            hub.emit("workflow:ended", json!({ "reason": "end_when" }))
                .await
                .ok();
            break TerminalStatus::Complete;
        }
        if in_flight.load(Ordering::SeqCst) == 0 {
            hub.emit("workflow:ended", json!({ "reason": "quiescent" }))
                .await
                .ok();
            break TerminalStatus::Complete;
        }

        tokio::select! {
            _ = notify.notified() => {}
            _ = tokio::time::sleep(POLL_INTERVAL) => {}
        }

        if let Some(deadline) = request.config.run_deadline {
            if start.elapsed() >= deadline && !run_state.is_halted() {
                hub.abort(AbortReason::Timeout).await;
            }
        }
        if let Some(token) = &request.external_cancellation {
            if token.is_cancelled() && !run_state.is_halted() {
                hub.cancel("external cancellation requested").await;
            }
        }
    };

    if let (RecordingMode::Record, Some(recording_id)) = (&request.mode, &recording_id) {
        if let Some(store) = &request.recording_store {
            let _ = store
                .finalize(recording_id, start.elapsed().as_millis() as u64)
                .await;
        }
    }

    if log::log_enabled!(log::Level::Info) {
        log::info!(
            "run {run_id} reached a terminal status after {} activation(s) in {:?}",
            run_state.activations(),
            start.elapsed()
        );
    }

    let signals = hub.signal_log();
    let metrics = RunMetrics {
        total_signals: signals.len(),
        total_activations: run_state.activations(),
        duration: start.elapsed(),
        per_agent_activations: per_agent_counts
            .lock()
            .expect("per-agent counts poisoned")
            .clone(),
    };

    Ok(RunOutcome {
        status,
        final_state: request.state_store.get(),
        signals,
        activations: run_state.activations(),
        run_id,
        recording_id,
        metrics,
    })
}

fn terminal_status(run_state: &RunState) -> Option<TerminalStatus> {
    if run_state.is_failed() {
        return Some(TerminalStatus::Failed(
            run_state.fail_reason().expect("failed implies a reason"),
        ));
    }
    if run_state.is_cancelled() {
        return Some(TerminalStatus::Aborted(
            run_state.abort_reason().expect("cancelled implies a reason"),
        ));
    }
    None
}

async fn resolve_recording_id(
    request: &RunRequest,
    run_id: Uuid,
) -> Result<Option<String>, HarnessError> {
    match &request.mode {
        RecordingMode::Live => Ok(None),
        RecordingMode::Record => {
            let store = request
                .recording_store
                .as_ref()
                .ok_or(HarnessError::RecordingStoreRequired)?;
            let id = store
                .create(run_id, RecordingMeta::default())
                .await
                .map_err(HarnessError::Store)?;
            Ok(Some(id))
        }
        RecordingMode::Replay { recording_id } => {
            if recording_id.trim().is_empty() || request.recording_store.is_none() {
                return Err(HarnessError::ReplayRequiresRecordingId);
            }
            Ok(Some(recording_id.clone()))
        }
    }
}

/// Load the recording to replay, and when `replay_from_checkpoint` names a
/// checkpoint, fold every signal up to and including it directly into
/// `state_store` (no dispatch, no subscriber notifications — those already
/// happened the first time this was recorded) and seek the driver's cursor
/// past it, so the run resumes mid-recording with the right state already
/// in place.
async fn load_replay_driver(
    request: &RunRequest,
    state_store: &Arc<StateStore>,
) -> Result<Option<Arc<ReplayDriver>>, HarnessError> {
    let RecordingMode::Replay { recording_id } = &request.mode else {
        return Ok(None);
    };
    let store = request
        .recording_store
        .as_ref()
        .ok_or(HarnessError::ReplayRequiresRecordingId)?;
    if !store.exists(recording_id).await.map_err(HarnessError::Store)? {
        return Err(HarnessError::RecordingNotFound(recording_id.clone()));
    }
    let (metadata, signals) = store.load(recording_id).await.map_err(HarnessError::Store)?;
    let driver = ReplayDriver::new(signals.clone());

    if let Some(checkpoint_name) = &request.replay_from_checkpoint {
        let checkpoint = metadata
            .checkpoints
            .iter()
            .find(|c| &c.name == checkpoint_name)
            .ok_or_else(|| {
                HarnessError::CheckpointNotFound(checkpoint_name.clone(), recording_id.clone())
            })?;
        for recorded in signals.iter().filter(|s| s.index <= checkpoint.index) {
            let signal = Signal {
                id: recorded.index,
                name: recorded.name.clone(),
                timestamp: recorded.timestamp,
                payload: recorded.payload.clone(),
                source: recorded.source.clone(),
                run_id: Uuid::nil(),
            };
            state_store.apply_signal(&signal);
        }
        driver.seek_to_checkpoint(checkpoint);
    }

    Ok(Some(Arc::new(driver)))
}

#[allow(clippy::too_many_arguments)]
fn register_agent(
    agent: &AgentDefinition,
    hub: &Arc<Hub>,
    adapter: &Arc<dyn ExecutionAdapter>,
    run_state: &Arc<RunState>,
    config: &HarnessConfig,
    per_agent_counts: &Arc<StdMutex<HashMap<String, usize>>>,
    state_store: &Arc<StateStore>,
    notify: &Arc<Notify>,
    in_flight: &Arc<AtomicUsize>,
    replay_driver: &Option<Arc<ReplayDriver>>,
) {
    for pattern in &agent.activates_on {
        let agent = agent.clone();
        let hub = hub.clone();
        let adapter = adapter.clone();
        let run_state = run_state.clone();
        let max_activations = config.max_activations;
        let per_agent_default_max = config.per_agent_default_max_activations;
        let per_agent_counts = per_agent_counts.clone();
        let state_store = state_store.clone();
        let notify = notify.clone();
        let in_flight = in_flight.clone();
        let replay_driver = replay_driver.clone();

        hub.subscribe(pattern, move |signal: &Signal| {
            if run_state.is_halted() {
                return;
            }
            let state_snapshot = state_store.get();
            if let Some(guard) = &agent.guard {
                if !guard(signal, &state_snapshot) {
                    return;
                }
            }

            let per_agent_cap = agent.max_activations.or(per_agent_default_max);
            if let Some(cap) = per_agent_cap {
                let counts = per_agent_counts.lock().expect("per-agent counts poisoned");
                if *counts.get(&agent.name).unwrap_or(&0) >= cap {
                    return;
                }
            }

            if run_state.activations() >= max_activations {
                let hub = hub.clone();
                let run_state = run_state.clone();
                let notify = notify.clone();
                tokio::spawn(async move {
                    hub.abort(AbortReason::BudgetExhausted {
                        activations: run_state.activations(),
                        max_activations,
                    })
                    .await;
                    notify.notify_one();
                });
                return;
            }

            per_agent_counts
                .lock()
                .expect("per-agent counts poisoned")
                .entry(agent.name.clone())
                .and_modify(|c| *c += 1)
                .or_insert(1);
            run_state.record_activation();

            in_flight.fetch_add(1, Ordering::SeqCst);
            let agent = agent.clone();
            let hub = hub.clone();
            let adapter = adapter.clone();
            let run_state = run_state.clone();
            let in_flight = in_flight.clone();
            let notify = notify.clone();
            let signal = signal.clone();
            let replay_driver = replay_driver.clone();
            let state_snapshot = state_snapshot.clone();

            tokio::spawn(async move {
                let ctx =
                    EmitContext::for_agent(run_state.run_id(), agent.name.clone(), signal.id);
                ctx.scope(async move {
                    hub.emit(
                        "agent:activated",
                        json!({ "agent": agent.name, "triggeredBy": signal.id }),
                    )
                    .await
                    .ok();
                    run_activation(
                        &agent,
                        &hub,
                        adapter.as_ref(),
                        &run_state,
                        &signal,
                        state_snapshot,
                        replay_driver.as_deref(),
                    )
                    .await;
                })
                .await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
                notify.notify_one();
            });
        });
    }
}

/// Turn one matched activation into emitted signals: either a real adapter
/// call (live/record) or a recorded-output lookup (replay).
async fn run_activation(
    agent: &AgentDefinition,
    hub: &Hub,
    adapter: &dyn ExecutionAdapter,
    run_state: &RunState,
    signal: &Signal,
    state: WorkflowState,
    replay_driver: Option<&ReplayDriver>,
) {
    if let Some(driver) = replay_driver {
        let Some(primary) = agent.emits.first() else {
            return;
        };
        match driver.take_through(primary) {
            Ok(recorded) => {
                for entry in recorded {
                    hub.emit(entry.name, entry.payload).await.ok();
                }
            }
            Err(failure) => {
                hub.fail(failure).await;
            }
        }
        return;
    }

    let result = adapter
        .run(ActivationRequest {
            agent,
            signal,
            state,
            cancellation: run_state.cancellation_token(),
        })
        .await;

    match result {
        Ok(outcome) => {
            for (name, payload) in outcome.intermediate {
                hub.emit(name, payload).await.ok();
            }
            if let Some(primary) = agent.emits.first() {
                match agent.validate_output(&outcome.output) {
                    Ok(()) => {
                        let payload = if agent.has_output_schema() {
                            outcome.output
                        } else {
                            json!({ "agent": agent.name, "output": outcome.output })
                        };
                        hub.emit(primary.clone(), payload).await.ok();
                    }
                    Err(message) => {
                        hub.emit(
                            "error:agent",
                            json!({ "agent": agent.name, "message": message }),
                        )
                        .await
                        .ok();
                    }
                }
            }
        }
        Err(err) => {
            hub.emit(
                "error:agent",
                json!({ "agent": agent.name, "message": err.to_string() }),
            )
            .await
            .ok();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::harness::agent::{ScriptedAdapter, ScriptedResponse};
    use crate::harness::recorder::InMemoryRecordingStore;
    use serde_json::json;

    fn terminator_agent() -> AgentDefinition {
        AgentDefinition::builder("terminator")
            .activates_on("workflow:start")
            .emits("task:done")
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn single_agent_run_completes() {
        let adapter = Arc::new(ScriptedAdapter::new());
        adapter.push("terminator", ScriptedResponse::Output(json!({ "ok": true })));

        let state_store = Arc::new(StateStore::new(Default::default()));
        let request = RunRequest {
            agents: vec![terminator_agent()],
            state_store,
            adapter,
            config: HarnessConfig::default(),
            end_when: None,
            initial_signal: ("workflow:start".to_string(), json!({})),
            mode: RecordingMode::Live,
            recording_store: None,
            external_cancellation: None,
            replay_from_checkpoint: None,
        };

        let outcome = run_workflow(request).await.unwrap();
        assert!(outcome.status.is_complete());
        assert!(outcome.signals.iter().any(|s| s.name == "task:done"));
        assert_eq!(outcome.activations, 1);
    }

    #[tokio::test]
    async fn budget_exhaustion_aborts_the_run() {
        let adapter = Arc::new(ScriptedAdapter::new());
        for _ in 0..10 {
            adapter.push("looper", ScriptedResponse::Output(json!({})));
        }
        let looper = AgentDefinition::builder("looper")
            .activates_on("tick")
            .emits("tick")
            .build()
            .unwrap();

        let state_store = Arc::new(StateStore::new(Default::default()));
        let mut config = HarnessConfig::default();
        config.max_activations = 3;

        let request = RunRequest {
            agents: vec![looper],
            state_store,
            adapter,
            config,
            end_when: None,
            initial_signal: ("tick".to_string(), json!({})),
            mode: RecordingMode::Live,
            recording_store: None,
            external_cancellation: None,
            replay_from_checkpoint: None,
        };

        let outcome = run_workflow(request).await.unwrap();
        assert!(matches!(
            outcome.status,
            TerminalStatus::Aborted(AbortReason::BudgetExhausted { .. })
        ));
    }

    #[tokio::test]
    async fn record_then_replay_reproduces_the_same_signal_names() {
        let store: Arc<dyn RecordingStore> = Arc::new(InMemoryRecordingStore::new());

        let adapter = Arc::new(ScriptedAdapter::new());
        adapter.push("terminator", ScriptedResponse::Output(json!({ "ok": true })));
        let recorded_outcome = run_workflow(RunRequest {
            agents: vec![terminator_agent()],
            state_store: Arc::new(StateStore::new(Default::default())),
            adapter,
            config: HarnessConfig::default(),
            end_when: None,
            initial_signal: ("workflow:start".to_string(), json!({})),
            mode: RecordingMode::Record,
            recording_store: Some(store.clone()),
            external_cancellation: None,
            replay_from_checkpoint: None,
        })
        .await
        .unwrap();
        assert!(recorded_outcome.status.is_complete());
        let recording_id = recorded_outcome.recording_id.unwrap();

        let replay_adapter = Arc::new(ScriptedAdapter::new());
        let replayed_outcome = run_workflow(RunRequest {
            agents: vec![terminator_agent()],
            state_store: Arc::new(StateStore::new(Default::default())),
            adapter: replay_adapter,
            config: HarnessConfig::default(),
            end_when: None,
            initial_signal: ("workflow:start".to_string(), json!({})),
            mode: RecordingMode::Replay { recording_id: recording_id.clone() },
            recording_store: Some(store.clone()),
            external_cancellation: None,
            replay_from_checkpoint: None,
        })
        .await
        .unwrap();

        assert!(replayed_outcome.status.is_complete());
        let recorded_names: Vec<_> = recorded_outcome.signals.iter().map(|s| &s.name).collect();
        let replayed_names: Vec<_> = replayed_outcome.signals.iter().map(|s| &s.name).collect();
        assert_eq!(recorded_names, replayed_names);
    }

    #[tokio::test]
    async fn reducer_panic_fails_the_run() {
        let state_store = Arc::new(StateStore::new(Default::default()));
        state_store.register_reducer("workflow:start", Arc::new(|_d, _s| panic!("bad state")));
        let adapter = Arc::new(ScriptedAdapter::new());

        let request = RunRequest {
            agents: vec![terminator_agent()],
            state_store,
            adapter,
            config: HarnessConfig::default(),
            end_when: None,
            initial_signal: ("workflow:start".to_string(), json!({})),
            mode: RecordingMode::Live,
            recording_store: None,
            external_cancellation: None,
            replay_from_checkpoint: None,
        };

        let outcome = run_workflow(request).await.unwrap();
        assert!(matches!(outcome.status, TerminalStatus::Failed(_)));
        // The terminator's own trigger never dispatched, so it never ran.
        assert_eq!(outcome.activations, 0);
    }

    #[tokio::test]
    async fn quiescence_completes_even_with_an_end_when_that_never_fires() {
        let adapter = Arc::new(ScriptedAdapter::new());
        adapter.push("terminator", ScriptedResponse::Output(json!({ "ok": true })));

        let request = RunRequest {
            agents: vec![terminator_agent()],
            state_store: Arc::new(StateStore::new(Default::default())),
            adapter,
            config: HarnessConfig::default(),
            end_when: Some(Arc::new(|_state| false)),
            initial_signal: ("workflow:start".to_string(), json!({})),
            mode: RecordingMode::Live,
            recording_store: None,
            external_cancellation: None,
            replay_from_checkpoint: None,
        };

        let outcome = tokio::time::timeout(Duration::from_secs(2), run_workflow(request))
            .await
            .expect("run should reach quiescence instead of looping forever")
            .unwrap();
        assert!(outcome.status.is_complete());
    }

    #[tokio::test]
    async fn boundary_events_match_the_seed_scenario() {
        let adapter = Arc::new(ScriptedAdapter::new());
        let terminator = AgentDefinition::builder("terminator")
            .activates_on("workflow:start")
            .build()
            .unwrap();

        let request = RunRequest {
            agents: vec![terminator],
            state_store: Arc::new(StateStore::new(Default::default())),
            adapter,
            config: HarnessConfig::default(),
            end_when: None,
            initial_signal: ("workflow:start".to_string(), json!({})),
            mode: RecordingMode::Live,
            recording_store: None,
            external_cancellation: None,
            replay_from_checkpoint: None,
        };

        let outcome = run_workflow(request).await.unwrap();
        assert!(outcome.status.is_complete());
        let names: Vec<_> = outcome.signals.iter().map(|s| s.name.clone()).collect();
        assert_eq!(names, vec!["workflow:start", "agent:activated", "workflow:ended"]);
        assert_eq!(outcome.activations, 1);
    }

    #[tokio::test]
    async fn schema_less_output_is_wrapped_with_agent_name() {
        let adapter = Arc::new(ScriptedAdapter::new());
        adapter.push("terminator", ScriptedResponse::Output(json!({ "ok": true })));

        let request = RunRequest {
            agents: vec![terminator_agent()],
            state_store: Arc::new(StateStore::new(Default::default())),
            adapter,
            config: HarnessConfig::default(),
            end_when: None,
            initial_signal: ("workflow:start".to_string(), json!({})),
            mode: RecordingMode::Live,
            recording_store: None,
            external_cancellation: None,
            replay_from_checkpoint: None,
        };

        let outcome = run_workflow(request).await.unwrap();
        let task_done = outcome
            .signals
            .iter()
            .find(|s| s.name == "task:done")
            .expect("terminator emits task:done");
        assert_eq!(
            task_done.payload,
            json!({ "agent": "terminator", "output": { "ok": true } })
        );
    }

    #[tokio::test]
    async fn updates_field_writes_output_into_named_state_key() {
        let adapter = Arc::new(ScriptedAdapter::new());
        adapter.push("terminator", ScriptedResponse::Output(json!({ "ok": true })));

        let terminator = AgentDefinition::builder("terminator")
            .activates_on("workflow:start")
            .emits("task:done")
            .updates("lastResult")
            .build()
            .unwrap();

        let request = RunRequest {
            agents: vec![terminator],
            state_store: Arc::new(StateStore::new(Default::default())),
            adapter,
            config: HarnessConfig::default(),
            end_when: None,
            initial_signal: ("workflow:start".to_string(), json!({})),
            mode: RecordingMode::Live,
            recording_store: None,
            external_cancellation: None,
            replay_from_checkpoint: None,
        };

        let outcome = run_workflow(request).await.unwrap();
        assert_eq!(outcome.final_state.get("lastResult"), Some(&json!({ "ok": true })));
    }
}
