//! Deterministic replay of a previously recorded run.
//!
//! A recorded signal log plus a cursor, advanced one entry at a time, each
//! advance checked against what the live matching logic was about to
//! produce. Divergence is reported as a signal-name mismatch, since Open
//! Harness signals are identified by name rather than by content hash.

use crate::harness::error::RunFailure;
use crate::harness::recorder::{Checkpoint, RecordedSignal};
use std::sync::Mutex;

/// Walks a recorded signal log in order, asserting that each signal the
/// live matching logic is about to produce agrees with what was recorded.
pub struct ReplayDriver {
    signals: Vec<RecordedSignal>,
    position: Mutex<usize>,
}

impl ReplayDriver {
    pub fn new(signals: Vec<RecordedSignal>) -> Self {
        Self {
            signals,
            position: Mutex::new(0),
        }
    }

    /// Total number of signals in the recording.
    pub fn len(&self) -> usize {
        self.signals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.signals.is_empty()
    }

    /// Whether every recorded signal has been consumed.
    pub fn is_complete(&self) -> bool {
        *self.position.lock().expect("replay driver poisoned") >= self.signals.len()
    }

    /// The next recorded signal without consuming it.
    pub fn peek(&self) -> Option<RecordedSignal> {
        let position = *self.position.lock().expect("replay driver poisoned");
        self.signals.get(position).cloned()
    }

    /// Consume the next recorded signal, asserting its name is `expected_name`.
    ///
    /// A mismatch — including running past the end of the recording — is
    /// reported as [`RunFailure::ReplayDivergence`], never silently
    /// tolerated; determinism is the entire point of a recording.
    pub fn take_matching(&self, expected_name: &str) -> Result<RecordedSignal, RunFailure> {
        let mut position = self.position.lock().expect("replay driver poisoned");
        match self.signals.get(*position) {
            None => Err(RunFailure::ReplayDivergence {
                index: *position as u64,
                expected: expected_name.to_string(),
                actual: "<end of recording>".to_string(),
            }),
            Some(recorded) if recorded.name == expected_name => {
                let recorded = recorded.clone();
                *position += 1;
                Ok(recorded)
            }
            Some(recorded) => Err(RunFailure::ReplayDivergence {
                index: recorded.index,
                expected: expected_name.to_string(),
                actual: recorded.name.clone(),
            }),
        }
    }

    /// Consume every recorded signal from the cursor up to and including the
    /// next one named `expected_primary`, in order.
    ///
    /// Used to replay an activation's intermediate signals (tool calls,
    /// streamed tokens) alongside its primary output: live and record mode
    /// emit those ahead of the primary signal, so replay must walk through
    /// all of them rather than jumping straight to the first name match.
    /// Running past the end of the recording without seeing `expected_primary`
    /// is reported the same way as a single-signal mismatch.
    pub fn take_through(
        &self,
        expected_primary: &str,
    ) -> Result<Vec<RecordedSignal>, RunFailure> {
        let mut position = self.position.lock().expect("replay driver poisoned");
        let mut collected = Vec::new();
        loop {
            match self.signals.get(*position) {
                None => {
                    return Err(RunFailure::ReplayDivergence {
                        index: *position as u64,
                        expected: expected_primary.to_string(),
                        actual: "<end of recording>".to_string(),
                    });
                }
                Some(recorded) => {
                    let recorded = recorded.clone();
                    *position += 1;
                    let is_primary = recorded.name == expected_primary;
                    collected.push(recorded);
                    if is_primary {
                        return Ok(collected);
                    }
                }
            }
        }
    }

    /// Fast-forward the cursor to just past `checkpoint`, for partial
    /// replay starting mid-recording.
    pub fn seek_to_checkpoint(&self, checkpoint: &Checkpoint) {
        let mut position = self.position.lock().expect("replay driver poisoned");
        if let Some(idx) = self.signals.iter().position(|s| s.index == checkpoint.index) {
            *position = idx + 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    fn recorded(index: u64, name: &str) -> RecordedSignal {
        RecordedSignal {
            index,
            name: name.to_string(),
            timestamp: Utc::now(),
            payload: json!({}),
            source: None,
        }
    }

    #[test]
    fn matching_sequence_advances_cleanly() {
        let driver = ReplayDriver::new(vec![
            recorded(0, "workflow:start"),
            recorded(1, "plan:created"),
        ]);
        assert!(driver.take_matching("workflow:start").is_ok());
        assert!(driver.take_matching("plan:created").is_ok());
        assert!(driver.is_complete());
    }

    #[test]
    fn mismatch_reports_divergence() {
        let driver = ReplayDriver::new(vec![recorded(0, "workflow:start")]);
        let err = driver.take_matching("plan:created").unwrap_err();
        match err {
            RunFailure::ReplayDivergence { index, expected, actual } => {
                assert_eq!(index, 0);
                assert_eq!(expected, "plan:created");
                assert_eq!(actual, "workflow:start");
            }
            other => panic!("expected ReplayDivergence, got {other:?}"),
        }
    }

    #[test]
    fn running_past_the_end_is_divergence() {
        let driver = ReplayDriver::new(vec![recorded(0, "workflow:start")]);
        driver.take_matching("workflow:start").unwrap();
        let err = driver.take_matching("plan:created").unwrap_err();
        assert!(matches!(err, RunFailure::ReplayDivergence { .. }));
    }

    #[test]
    fn take_through_collects_intermediates_then_primary() {
        let driver = ReplayDriver::new(vec![
            recorded(0, "workflow:start"),
            recorded(1, "tool:call"),
            recorded(2, "tool:result"),
            recorded(3, "plan:created"),
            recorded(4, "task:done"),
        ]);
        driver.take_matching("workflow:start").unwrap();
        let through = driver.take_through("plan:created").unwrap();
        let names: Vec<_> = through.iter().map(|s| s.name.clone()).collect();
        assert_eq!(names, vec!["tool:call", "tool:result", "plan:created"]);
        assert!(driver.take_matching("task:done").is_ok());
    }

    #[test]
    fn take_through_past_the_end_is_divergence() {
        let driver = ReplayDriver::new(vec![recorded(0, "tool:call")]);
        let err = driver.take_through("plan:created").unwrap_err();
        assert!(matches!(err, RunFailure::ReplayDivergence { .. }));
    }

    #[test]
    fn checkpoint_seeks_cursor_forward() {
        let driver = ReplayDriver::new(vec![
            recorded(0, "workflow:start"),
            recorded(1, "plan:created"),
            recorded(2, "task:done"),
        ]);
        driver.seek_to_checkpoint(&Checkpoint {
            name: "mid".to_string(),
            index: 1,
        });
        assert!(driver.take_matching("task:done").is_ok());
    }
}
