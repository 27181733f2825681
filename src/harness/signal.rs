//! Immutable signals and the ambient emission context.
//!
//! A [`Signal`] is the sole unit of communication between agents, the state
//! store, and the recording log. Once constructed a `Signal` is never
//! mutated — [`Hub::emit`](crate::harness::hub::Hub::emit) assigns its `id` and
//! `timestamp`; everything after that treats it as a plain immutable value.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque payload carried by a signal. The shape is declared per signal
/// name by convention, not by the type system.
pub type Payload = serde_json::Value;

/// An immutable, ordered event flowing through the [`Hub`](crate::harness::hub::Hub).
///
/// `id` is a dense, 0-based, strictly monotonic sequence within a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    /// Unique within a run; strictly monotonic in emission order.
    pub id: u64,
    /// Colon-delimited signal name, e.g. `"workflow:start"`, `"plan:created"`.
    pub name: String,
    /// Wall-clock time assigned at emission (or taken from the recording
    /// during replay).
    pub timestamp: DateTime<Utc>,
    /// Opaque, per-name payload.
    pub payload: Payload,
    /// Identity of the agent whose activation emitted this signal, if any.
    /// Populated automatically from the ambient [`EmitContext`].
    pub source: Option<String>,
    /// The run this signal belongs to.
    pub run_id: Uuid,
}

/// A subscription pattern: an exact name, a single-segment wildcard
/// (`"workflow:*"`), or the catch-all `"*"`.
///
/// # Matching rules
///
/// - `"*"` matches every signal name.
/// - Otherwise the pattern and the candidate name are split on `:` and
///   compared segment-by-segment; a `*` segment matches any single segment
///   at that position. Segment counts must match — **wildcards do not span
///   segments** — so `"workflow:*"` matches `"workflow:start"` but not
///   `"workflow:state:phase:changed"` (four segments against two). See
///   `DESIGN.md` for the rationale behind this literal reading.
pub fn pattern_matches(pattern: &str, name: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    let mut p = pattern.split(':');
    let mut n = name.split(':');
    loop {
        match (p.next(), n.next()) {
            (Some(ps), Some(ns)) => {
                if ps != "*" && ps != ns {
                    return false;
                }
            }
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// Ambient, per-activation identity propagated via Tokio task-local storage.
///
/// `tokio::task_local!` propagates across `.await` points within one task's
/// future chain — exactly the boundary the hub's `emit` path crosses. Work
/// handed off to a *new* task (e.g. a fanned-out agent activation) must
/// capture and re-scope the context explicitly; see
/// [`crate::harness::scheduler`].
#[derive(Debug, Clone)]
pub struct EmitContext {
    pub run_id: Uuid,
    pub agent_name: Option<String>,
    pub triggering_signal_id: Option<u64>,
}

impl EmitContext {
    pub fn root(run_id: Uuid) -> Self {
        Self {
            run_id,
            agent_name: None,
            triggering_signal_id: None,
        }
    }

    pub fn for_agent(run_id: Uuid, agent_name: impl Into<String>, triggering_signal_id: u64) -> Self {
        Self {
            run_id,
            agent_name: Some(agent_name.into()),
            triggering_signal_id: Some(triggering_signal_id),
        }
    }

    /// Run `fut` with `self` as the ambient context for the duration of the
    /// future, propagating across every `.await` point inside it.
    pub async fn scope<F: std::future::Future>(self, fut: F) -> F::Output {
        CURRENT_CONTEXT.scope(self, fut).await
    }

    /// The ambient context for the currently-executing task, if any.
    pub fn current() -> Option<EmitContext> {
        CURRENT_CONTEXT.try_with(|c| c.clone()).ok()
    }
}

tokio::task_local! {
    static CURRENT_CONTEXT: EmitContext;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_name_matches_itself() {
        assert!(pattern_matches("plan:created", "plan:created"));
        assert!(!pattern_matches("plan:created", "plan:updated"));
    }

    #[test]
    fn star_matches_everything() {
        assert!(pattern_matches("*", "workflow:start"));
        assert!(pattern_matches("*", "anything:at:all"));
    }

    #[test]
    fn segment_wildcard_matches_one_segment_only() {
        assert!(pattern_matches("workflow:*", "workflow:start"));
        assert!(pattern_matches("workflow:*", "workflow:ended"));
        assert!(!pattern_matches("workflow:*", "workflow"));
        assert!(!pattern_matches("workflow:*", "state:workflow:changed"));
        assert!(!pattern_matches("workflow:*", "workflow:state:phase:changed"));
    }

    #[tokio::test]
    async fn context_propagates_across_await_points() {
        let run_id = Uuid::new_v4();
        let ctx = EmitContext::for_agent(run_id, "planner", 3);
        ctx.scope(async {
            tokio::task::yield_now().await;
            let current = EmitContext::current().expect("context present");
            assert_eq!(current.agent_name.as_deref(), Some("planner"));
            assert_eq!(current.triggering_signal_id, Some(3));
        })
        .await;

        // Outside the scope, no ambient context leaks.
        assert!(EmitContext::current().is_none());
    }
}
