//! Declarative agent templates and the pluggable execution seam.
//!
//! An [`AgentDefinition`] is data, not behaviour: it declares which signals
//! activate it, an optional guard over the current state, and the shape of
//! what it is allowed to produce. The actual work of turning a triggering
//! [`Signal`] into an output happens behind [`ExecutionAdapter`] — an
//! external-collaborator boundary the harness only ever calls through,
//! never reimplements.

use crate::harness::error::BoxError;
use crate::harness::signal::{Payload, Signal};
use crate::harness::state::WorkflowState;
use async_trait::async_trait;
use futures_util::stream::Stream;
use jsonschema::Validator;
use std::pin::Pin;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// A predicate over the triggering signal and the current state, gating
/// whether a matched agent actually activates.
pub type Guard = Arc<dyn Fn(&Signal, &WorkflowState) -> bool + Send + Sync>;

/// A declarative agent template.
///
/// `output_schema`, when present, is compiled once at registration and used
/// to validate every structured output this agent produces — an output
/// that fails validation never reaches the hub as the agent's nominal
/// signal; it is reported as `error:agent` instead (see the Open Questions
/// decision recorded in `DESIGN.md`).
#[derive(Clone)]
pub struct AgentDefinition {
    pub name: String,
    /// Patterns (see `signal::pattern_matches`) that activate this agent.
    pub activates_on: Vec<String>,
    pub guard: Option<Guard>,
    /// Signal names this agent may emit. Informational — not enforced by
    /// the hub, but used by `record`/`replay` tooling and documentation.
    pub emits: Vec<String>,
    /// State keys this agent's primary output should be written to. Unlike
    /// `emits`, this is not just informational: `run_workflow` installs an
    /// auto-reducer (unless the caller already registered one for the
    /// agent's primary signal name) that copies the activation's output
    /// payload into each of these keys.
    pub updates: Vec<String>,
    /// Prompt template handed to the adapter; interpolation is the
    /// adapter's responsibility, not the harness's.
    pub prompt: String,
    compiled_schema: Option<Arc<Validator>>,
    pub max_activations: Option<usize>,
}

impl AgentDefinition {
    pub fn builder(name: impl Into<String>) -> AgentDefinitionBuilder {
        AgentDefinitionBuilder {
            name: name.into(),
            activates_on: Vec::new(),
            guard: None,
            emits: Vec::new(),
            updates: Vec::new(),
            prompt: String::new(),
            output_schema: None,
            max_activations: None,
        }
    }

    /// Whether this agent declared an `output_schema`.
    ///
    /// Drives the output-translation choice in the scheduler: agents with a
    /// schema emit their validated output value as-is; agents without one
    /// get it wrapped as `{agent, output}` so subscribers can tell which
    /// agent a schema-less payload came from.
    pub fn has_output_schema(&self) -> bool {
        self.compiled_schema.is_some()
    }

    /// Validate a candidate output against this agent's declared schema, if
    /// any. `Ok(())` when there is no schema to check against.
    pub fn validate_output(&self, output: &Payload) -> Result<(), String> {
        match &self.compiled_schema {
            None => Ok(()),
            Some(validator) => {
                let errors: Vec<String> = validator
                    .iter_errors(output)
                    .map(|e| e.to_string())
                    .collect();
                if errors.is_empty() {
                    Ok(())
                } else {
                    Err(errors.join("; "))
                }
            }
        }
    }
}

/// Builds an [`AgentDefinition`], compiling `output_schema` eagerly so a
/// malformed schema fails at registration time rather than at first use.
pub struct AgentDefinitionBuilder {
    name: String,
    activates_on: Vec<String>,
    guard: Option<Guard>,
    emits: Vec<String>,
    updates: Vec<String>,
    prompt: String,
    output_schema: Option<Payload>,
    max_activations: Option<usize>,
}

impl AgentDefinitionBuilder {
    pub fn activates_on(mut self, pattern: impl Into<String>) -> Self {
        self.activates_on.push(pattern.into());
        self
    }

    pub fn guard(mut self, guard: impl Fn(&Signal, &WorkflowState) -> bool + Send + Sync + 'static) -> Self {
        self.guard = Some(Arc::new(guard));
        self
    }

    pub fn emits(mut self, name: impl Into<String>) -> Self {
        self.emits.push(name.into());
        self
    }

    pub fn updates(mut self, key: impl Into<String>) -> Self {
        self.updates.push(key.into());
        self
    }

    pub fn prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = prompt.into();
        self
    }

    pub fn output_schema(mut self, schema: Payload) -> Self {
        self.output_schema = Some(schema);
        self
    }

    pub fn max_activations(mut self, max: usize) -> Self {
        self.max_activations = Some(max);
        self
    }

    pub fn build(self) -> Result<AgentDefinition, String> {
        let compiled_schema = match self.output_schema {
            None => None,
            Some(schema) => Some(Arc::new(
                jsonschema::validator_for(&schema)
                    .map_err(|e| format!("invalid output schema for agent `{}`: {e}", self.name))?,
            )),
        };
        Ok(AgentDefinition {
            name: self.name,
            activates_on: self.activates_on,
            guard: self.guard,
            emits: self.emits,
            updates: self.updates,
            prompt: self.prompt,
            compiled_schema,
            max_activations: self.max_activations,
        })
    }
}

/// What an [`ExecutionAdapter`] is given to turn into an outcome: the
/// triggering signal, a snapshot of state at activation time, and a
/// cooperative cancellation token the adapter must check between steps of
/// a long-running call.
pub struct ActivationRequest<'a> {
    pub agent: &'a AgentDefinition,
    pub signal: &'a Signal,
    pub state: WorkflowState,
    pub cancellation: CancellationToken,
}

/// One intermediate signal an adapter wants emitted while it is still
/// working, e.g. a streamed token or tool-call notification, ahead of its
/// final output.
pub type IntermediateSignal = (String, Payload);

/// A stream of intermediate signals an adapter can emit while producing
/// its final output.
pub type IntermediateStream =
    Pin<Box<dyn Stream<Item = Result<IntermediateSignal, BoxError>> + Send>>;

/// What a successful activation produces: a structured final output
/// (validated against the agent's `output_schema`, if any) plus whatever
/// intermediate signals were already emitted along the way.
pub struct AdapterOutcome {
    pub output: Payload,
    pub intermediate: Vec<IntermediateSignal>,
}

impl AdapterOutcome {
    pub fn just(output: Payload) -> Self {
        Self {
            output,
            intermediate: Vec::new(),
        }
    }
}

/// The pluggable seam between an activated agent and whatever actually does
/// the work — an LLM call, a deterministic function, a replayed fixture.
///
/// Implementations are external collaborators: the harness only ever calls
/// `run` and interprets its `Result`, never reaches past that boundary.
#[async_trait]
pub trait ExecutionAdapter: Send + Sync {
    async fn run(&self, request: ActivationRequest<'_>) -> Result<AdapterOutcome, BoxError>;
}

/// A deterministic test double: maps an agent name to a queue of
/// pre-scripted outcomes, consumed in order across successive activations.
/// A `Mutex`-guarded `VecDeque` drained per call, erroring loudly on
/// exhaustion rather than returning a default value.
pub struct ScriptedAdapter {
    scripts: std::sync::Mutex<std::collections::HashMap<String, std::collections::VecDeque<ScriptedResponse>>>,
}

/// One scripted response for a `ScriptedAdapter`.
pub enum ScriptedResponse {
    Output(Payload),
    Intermediate(Vec<IntermediateSignal>, Payload),
    Error(String),
}

impl ScriptedAdapter {
    pub fn new() -> Self {
        Self {
            scripts: std::sync::Mutex::new(std::collections::HashMap::new()),
        }
    }

    /// Queue `response` to be returned the next time `agent_name` activates.
    pub fn push(&self, agent_name: impl Into<String>, response: ScriptedResponse) {
        self.scripts
            .lock()
            .expect("scripted adapter poisoned")
            .entry(agent_name.into())
            .or_default()
            .push_back(response);
    }
}

impl Default for ScriptedAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ExecutionAdapter for ScriptedAdapter {
    async fn run(&self, request: ActivationRequest<'_>) -> Result<AdapterOutcome, BoxError> {
        let next = self
            .scripts
            .lock()
            .expect("scripted adapter poisoned")
            .get_mut(&request.agent.name)
            .and_then(|queue| queue.pop_front());

        match next {
            None => Err(format!(
                "no scripted response queued for agent `{}`",
                request.agent.name
            )
            .into()),
            Some(ScriptedResponse::Output(output)) => Ok(AdapterOutcome::just(output)),
            Some(ScriptedResponse::Intermediate(intermediate, output)) => {
                Ok(AdapterOutcome { output, intermediate })
            }
            Some(ScriptedResponse::Error(message)) => Err(message.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;
    use uuid::Uuid;

    fn signal() -> Signal {
        Signal {
            id: 0,
            name: "workflow:start".to_string(),
            timestamp: Utc::now(),
            payload: json!({}),
            source: None,
            run_id: Uuid::new_v4(),
        }
    }

    #[test]
    fn schema_validation_accepts_matching_output() {
        let agent = AgentDefinition::builder("planner")
            .activates_on("workflow:start")
            .output_schema(json!({
                "type": "object",
                "required": ["steps"],
                "properties": { "steps": { "type": "array" } }
            }))
            .build()
            .unwrap();

        assert!(agent.validate_output(&json!({ "steps": ["a", "b"] })).is_ok());
        assert!(agent.validate_output(&json!({ "nope": true })).is_err());
    }

    #[test]
    fn agent_without_schema_accepts_anything() {
        let agent = AgentDefinition::builder("free-form")
            .activates_on("*")
            .build()
            .unwrap();
        assert!(agent.validate_output(&json!(42)).is_ok());
    }

    #[tokio::test]
    async fn scripted_adapter_drains_queue_in_order() {
        let adapter = ScriptedAdapter::new();
        adapter.push("planner", ScriptedResponse::Output(json!({ "n": 1 })));
        adapter.push("planner", ScriptedResponse::Output(json!({ "n": 2 })));

        let agent = AgentDefinition::builder("planner").build().unwrap();
        let trigger = signal();
        let state = WorkflowState::default();

        let first = adapter
            .run(ActivationRequest {
                agent: &agent,
                signal: &trigger,
                state: state.clone(),
                cancellation: CancellationToken::new(),
            })
            .await
            .unwrap();
        assert_eq!(first.output, json!({ "n": 1 }));

        let second = adapter
            .run(ActivationRequest {
                agent: &agent,
                signal: &trigger,
                state,
                cancellation: CancellationToken::new(),
            })
            .await
            .unwrap();
        assert_eq!(second.output, json!({ "n": 2 }));
    }

    #[tokio::test]
    async fn scripted_adapter_errors_when_exhausted() {
        let adapter = ScriptedAdapter::new();
        let agent = AgentDefinition::builder("planner").build().unwrap();
        let trigger = signal();
        let result = adapter
            .run(ActivationRequest {
                agent: &agent,
                signal: &trigger,
                state: WorkflowState::default(),
                cancellation: CancellationToken::new(),
            })
            .await;
        assert!(result.is_err());
    }
}
