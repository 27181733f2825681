//! Append-only recording of a run's signal stream.
//!
//! [`RecordingStore`] is the external-collaborator seam: file- or
//! database-backed implementations must support crash-safe append
//! (log-structured, fsync per append). [`JsonlRecordingStore`] is the
//! crate's reference implementation: an append-only `.jsonl` log, one JSON
//! object per line, `fsync`-ed on every append rather than batched, since a
//! signal must be durable before any subscriber is allowed to observe it.

use crate::harness::error::BoxError;
use crate::harness::signal::{Payload, Signal};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use uuid::Uuid;

/// One persisted entry in a recording.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordedSignal {
    pub index: u64,
    pub name: String,
    pub timestamp: DateTime<Utc>,
    pub payload: Payload,
    pub source: Option<String>,
}

impl From<&Signal> for RecordedSignal {
    fn from(signal: &Signal) -> Self {
        Self {
            index: signal.id,
            name: signal.name.clone(),
            timestamp: signal.timestamp,
            payload: signal.payload.clone(),
            source: signal.source.clone(),
        }
    }
}

/// A named marker pointing at a signal index, for partial replay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub name: String,
    pub index: u64,
}

/// Metadata describing a recording, returned by `list`/`load`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordingMetadata {
    pub recording_id: String,
    pub run_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub provider_type: Option<String>,
    pub tags: Vec<String>,
    pub duration_ms: Option<u64>,
    /// `false` until [`RecordingStore::finalize`] has been called. An
    /// incomplete recording is still loadable.
    pub complete: bool,
    pub checkpoints: Vec<Checkpoint>,
}

/// Free-form metadata supplied when creating a recording.
#[derive(Debug, Clone, Default)]
pub struct RecordingMeta {
    pub provider_type: Option<String>,
    pub tags: Vec<String>,
}

/// Filter passed to [`RecordingStore::load_signals`].
#[derive(Debug, Clone, Default)]
pub struct LoadSignalsFilter {
    pub from_index: Option<u64>,
    pub to_index: Option<u64>,
    pub patterns: Vec<String>,
}

/// Filter passed to [`RecordingStore::list`].
#[derive(Debug, Clone, Default)]
pub struct ListFilter {
    pub provider_type: Option<String>,
    pub tags: Vec<String>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

/// The external recording-store contract.
///
/// Implementations must be crash-safe on `append`: a signal is written to
/// the log before any subscriber observes it, so a store that buffers
/// without durability breaks the determinism guarantee the whole
/// recording/replay subsystem exists to provide.
#[async_trait]
pub trait RecordingStore: Send + Sync {
    async fn create(&self, run_id: Uuid, meta: RecordingMeta) -> Result<String, BoxError>;
    async fn append(&self, recording_id: &str, signal: RecordedSignal) -> Result<(), BoxError>;
    async fn append_batch(
        &self,
        recording_id: &str,
        signals: Vec<RecordedSignal>,
    ) -> Result<(), BoxError>;
    async fn checkpoint(&self, recording_id: &str, name: &str) -> Result<(), BoxError>;
    async fn finalize(&self, recording_id: &str, duration_ms: u64) -> Result<(), BoxError>;
    async fn load(
        &self,
        recording_id: &str,
    ) -> Result<(RecordingMetadata, Vec<RecordedSignal>), BoxError>;
    async fn load_signals(
        &self,
        recording_id: &str,
        filter: LoadSignalsFilter,
    ) -> Result<Vec<RecordedSignal>, BoxError>;
    async fn list(&self, filter: ListFilter) -> Result<Vec<RecordingMetadata>, BoxError>;
    async fn delete(&self, recording_id: &str) -> Result<(), BoxError>;
    async fn exists(&self, recording_id: &str) -> Result<bool, BoxError>;
}

/// A single `.jsonl`-backed recording on disk, one directory per recording id.
///
/// Layout:
///
/// ```text
/// <base_dir>/<recording_id>/
///   meta.json        # RecordingMetadata, rewritten on checkpoint/finalize
///   signals.jsonl     # one RecordedSignal per line, append-only
/// ```
///
/// A recording's integrity is verified at replay time by divergence
/// detection against the live run, not by a tamper-evidence hash chain, so
/// this store keeps the format to plain `OpenOptions::append` + `writeln!`
/// per entry.
pub struct JsonlRecordingStore {
    base_dir: PathBuf,
    // Guards read-modify-write of meta.json; signal appends are naturally
    // serialised by the Hub's single dispatch lock but metadata edits
    // (checkpoint/finalize) are not, so this mutex keeps them atomic.
    meta_lock: Mutex<()>,
}

impl JsonlRecordingStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            meta_lock: Mutex::new(()),
        }
    }

    fn dir_for(&self, recording_id: &str) -> PathBuf {
        self.base_dir.join(recording_id)
    }

    fn meta_path(&self, recording_id: &str) -> PathBuf {
        self.dir_for(recording_id).join("meta.json")
    }

    fn signals_path(&self, recording_id: &str) -> PathBuf {
        self.dir_for(recording_id).join("signals.jsonl")
    }

    fn read_meta(&self, recording_id: &str) -> Result<RecordingMetadata, BoxError> {
        let raw = fs::read_to_string(self.meta_path(recording_id))?;
        Ok(serde_json::from_str(&raw)?)
    }

    fn write_meta(&self, meta: &RecordingMetadata) -> Result<(), BoxError> {
        let _guard = self.meta_lock.lock().expect("meta lock poisoned");
        fs::write(
            self.meta_path(&meta.recording_id),
            serde_json::to_string_pretty(meta)?,
        )?;
        Ok(())
    }

    fn read_signals(&self, path: &Path) -> Result<Vec<RecordedSignal>, BoxError> {
        if !path.exists() {
            return Ok(Vec::new());
        }
        let file = fs::File::open(path)?;
        let reader = BufReader::new(file);
        let mut out = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            out.push(serde_json::from_str(&line)?);
        }
        Ok(out)
    }
}

#[async_trait]
impl RecordingStore for JsonlRecordingStore {
    async fn create(&self, run_id: Uuid, meta: RecordingMeta) -> Result<String, BoxError> {
        let recording_id = run_id.to_string();
        let dir = self.dir_for(&recording_id);
        fs::create_dir_all(&dir)?;
        let metadata = RecordingMetadata {
            recording_id: recording_id.clone(),
            run_id,
            created_at: Utc::now(),
            provider_type: meta.provider_type,
            tags: meta.tags,
            duration_ms: None,
            complete: false,
            checkpoints: Vec::new(),
        };
        self.write_meta(&metadata)?;
        Ok(recording_id)
    }

    async fn append(&self, recording_id: &str, signal: RecordedSignal) -> Result<(), BoxError> {
        let path = self.signals_path(recording_id);
        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        let json = serde_json::to_string(&signal)?;
        writeln!(file, "{json}")?;
        file.sync_data()?;
        Ok(())
    }

    async fn append_batch(
        &self,
        recording_id: &str,
        signals: Vec<RecordedSignal>,
    ) -> Result<(), BoxError> {
        let path = self.signals_path(recording_id);
        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        for signal in &signals {
            writeln!(file, "{}", serde_json::to_string(signal)?)?;
        }
        file.sync_data()?;
        Ok(())
    }

    async fn checkpoint(&self, recording_id: &str, name: &str) -> Result<(), BoxError> {
        let mut meta = self.read_meta(recording_id)?;
        let signals = self.read_signals(&self.signals_path(recording_id))?;
        let index = signals.last().map(|s| s.index).unwrap_or(0);
        meta.checkpoints.push(Checkpoint {
            name: name.to_string(),
            index,
        });
        self.write_meta(&meta)?;
        Ok(())
    }

    async fn finalize(&self, recording_id: &str, duration_ms: u64) -> Result<(), BoxError> {
        let mut meta = self.read_meta(recording_id)?;
        meta.duration_ms = Some(duration_ms);
        meta.complete = true;
        self.write_meta(&meta)?;
        Ok(())
    }

    async fn load(
        &self,
        recording_id: &str,
    ) -> Result<(RecordingMetadata, Vec<RecordedSignal>), BoxError> {
        let meta = self.read_meta(recording_id)?;
        let signals = self.read_signals(&self.signals_path(recording_id))?;
        Ok((meta, signals))
    }

    async fn load_signals(
        &self,
        recording_id: &str,
        filter: LoadSignalsFilter,
    ) -> Result<Vec<RecordedSignal>, BoxError> {
        let signals = self.read_signals(&self.signals_path(recording_id))?;
        Ok(signals
            .into_iter()
            .filter(|s| filter.from_index.is_none_or(|from| s.index >= from))
            .filter(|s| filter.to_index.is_none_or(|to| s.index <= to))
            .filter(|s| {
                filter.patterns.is_empty()
                    || filter
                        .patterns
                        .iter()
                        .any(|p| crate::harness::signal::pattern_matches(p, &s.name))
            })
            .collect())
    }

    async fn list(&self, filter: ListFilter) -> Result<Vec<RecordingMetadata>, BoxError> {
        let mut out = Vec::new();
        if self.base_dir.exists() {
            for entry in fs::read_dir(&self.base_dir)? {
                let entry = entry?;
                if !entry.file_type()?.is_dir() {
                    continue;
                }
                let recording_id = entry.file_name().to_string_lossy().to_string();
                if let Ok(meta) = self.read_meta(&recording_id) {
                    if let Some(pt) = &filter.provider_type {
                        if meta.provider_type.as_deref() != Some(pt.as_str()) {
                            continue;
                        }
                    }
                    if !filter.tags.is_empty() && !filter.tags.iter().any(|t| meta.tags.contains(t))
                    {
                        continue;
                    }
                    out.push(meta);
                }
            }
        }
        out.sort_by_key(|m| m.created_at);
        let offset = filter.offset.unwrap_or(0);
        let out = out.into_iter().skip(offset);
        Ok(match filter.limit {
            Some(limit) => out.take(limit).collect(),
            None => out.collect(),
        })
    }

    async fn delete(&self, recording_id: &str) -> Result<(), BoxError> {
        let dir = self.dir_for(recording_id);
        if dir.exists() {
            fs::remove_dir_all(dir)?;
        }
        Ok(())
    }

    async fn exists(&self, recording_id: &str) -> Result<bool, BoxError> {
        Ok(self.meta_path(recording_id).exists())
    }
}

/// An in-memory [`RecordingStore`], useful for tests and for `record`
/// sessions that do not need disk durability (the trait still requires
/// `append` to be awaited before dispatch, which is what actually matters
/// for the ordering invariant — durability itself is this store's
/// deliberate trade-off).
#[derive(Default)]
pub struct InMemoryRecordingStore {
    recordings: Mutex<HashMap<String, (RecordingMetadata, Vec<RecordedSignal>)>>,
}

impl InMemoryRecordingStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RecordingStore for InMemoryRecordingStore {
    async fn create(&self, run_id: Uuid, meta: RecordingMeta) -> Result<String, BoxError> {
        let recording_id = run_id.to_string();
        let metadata = RecordingMetadata {
            recording_id: recording_id.clone(),
            run_id,
            created_at: Utc::now(),
            provider_type: meta.provider_type,
            tags: meta.tags,
            duration_ms: None,
            complete: false,
            checkpoints: Vec::new(),
        };
        self.recordings
            .lock()
            .expect("recordings lock poisoned")
            .insert(recording_id.clone(), (metadata, Vec::new()));
        Ok(recording_id)
    }

    async fn append(&self, recording_id: &str, signal: RecordedSignal) -> Result<(), BoxError> {
        let mut guard = self.recordings.lock().expect("recordings lock poisoned");
        let (_, signals) = guard
            .get_mut(recording_id)
            .ok_or_else(|| format!("unknown recording `{recording_id}`"))?;
        signals.push(signal);
        Ok(())
    }

    async fn append_batch(
        &self,
        recording_id: &str,
        signals: Vec<RecordedSignal>,
    ) -> Result<(), BoxError> {
        let mut guard = self.recordings.lock().expect("recordings lock poisoned");
        let (_, existing) = guard
            .get_mut(recording_id)
            .ok_or_else(|| format!("unknown recording `{recording_id}`"))?;
        existing.extend(signals);
        Ok(())
    }

    async fn checkpoint(&self, recording_id: &str, name: &str) -> Result<(), BoxError> {
        let mut guard = self.recordings.lock().expect("recordings lock poisoned");
        let (meta, signals) = guard
            .get_mut(recording_id)
            .ok_or_else(|| format!("unknown recording `{recording_id}`"))?;
        let index = signals.last().map(|s| s.index).unwrap_or(0);
        meta.checkpoints.push(Checkpoint {
            name: name.to_string(),
            index,
        });
        Ok(())
    }

    async fn finalize(&self, recording_id: &str, duration_ms: u64) -> Result<(), BoxError> {
        let mut guard = self.recordings.lock().expect("recordings lock poisoned");
        let (meta, _) = guard
            .get_mut(recording_id)
            .ok_or_else(|| format!("unknown recording `{recording_id}`"))?;
        meta.duration_ms = Some(duration_ms);
        meta.complete = true;
        Ok(())
    }

    async fn load(
        &self,
        recording_id: &str,
    ) -> Result<(RecordingMetadata, Vec<RecordedSignal>), BoxError> {
        let guard = self.recordings.lock().expect("recordings lock poisoned");
        guard
            .get(recording_id)
            .cloned()
            .ok_or_else(|| format!("unknown recording `{recording_id}`").into())
    }

    async fn load_signals(
        &self,
        recording_id: &str,
        filter: LoadSignalsFilter,
    ) -> Result<Vec<RecordedSignal>, BoxError> {
        let (_, signals) = self.load(recording_id).await?;
        Ok(signals
            .into_iter()
            .filter(|s| filter.from_index.is_none_or(|from| s.index >= from))
            .filter(|s| filter.to_index.is_none_or(|to| s.index <= to))
            .filter(|s| {
                filter.patterns.is_empty()
                    || filter
                        .patterns
                        .iter()
                        .any(|p| crate::harness::signal::pattern_matches(p, &s.name))
            })
            .collect())
    }

    async fn list(&self, filter: ListFilter) -> Result<Vec<RecordingMetadata>, BoxError> {
        let guard = self.recordings.lock().expect("recordings lock poisoned");
        let mut out: Vec<RecordingMetadata> = guard
            .values()
            .map(|(meta, _)| meta.clone())
            .filter(|meta| {
                filter
                    .provider_type
                    .as_deref()
                    .is_none_or(|pt| meta.provider_type.as_deref() == Some(pt))
            })
            .filter(|meta| filter.tags.is_empty() || filter.tags.iter().any(|t| meta.tags.contains(t)))
            .collect();
        out.sort_by_key(|m| m.created_at);
        let offset = filter.offset.unwrap_or(0);
        let out = out.into_iter().skip(offset);
        Ok(match filter.limit {
            Some(limit) => out.take(limit).collect(),
            None => out.collect(),
        })
    }

    async fn delete(&self, recording_id: &str) -> Result<(), BoxError> {
        self.recordings
            .lock()
            .expect("recordings lock poisoned")
            .remove(recording_id);
        Ok(())
    }

    async fn exists(&self, recording_id: &str) -> Result<bool, BoxError> {
        Ok(self
            .recordings
            .lock()
            .expect("recordings lock poisoned")
            .contains_key(recording_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn jsonl_store_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonlRecordingStore::new(dir.path());
        let run_id = Uuid::new_v4();
        let recording_id = store
            .create(run_id, RecordingMeta::default())
            .await
            .unwrap();

        for i in 0..3 {
            store
                .append(
                    &recording_id,
                    RecordedSignal {
                        index: i,
                        name: format!("signal:{i}"),
                        timestamp: Utc::now(),
                        payload: serde_json::json!({ "i": i }),
                        source: None,
                    },
                )
                .await
                .unwrap();
        }
        store.checkpoint(&recording_id, "mid").await.unwrap();
        store.finalize(&recording_id, 42).await.unwrap();

        let (meta, signals) = store.load(&recording_id).await.unwrap();
        assert!(meta.complete);
        assert_eq!(meta.duration_ms, Some(42));
        assert_eq!(meta.checkpoints.len(), 1);
        assert_eq!(signals.len(), 3);
        assert_eq!(signals[2].name, "signal:2");
    }

    #[tokio::test]
    async fn load_signals_filters_by_range_and_pattern() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonlRecordingStore::new(dir.path());
        let recording_id = store
            .create(Uuid::new_v4(), RecordingMeta::default())
            .await
            .unwrap();
        for (i, name) in ["workflow:start", "plan:created", "task:done"]
            .into_iter()
            .enumerate()
        {
            store
                .append(
                    &recording_id,
                    RecordedSignal {
                        index: i as u64,
                        name: name.to_string(),
                        timestamp: Utc::now(),
                        payload: serde_json::json!(null),
                        source: None,
                    },
                )
                .await
                .unwrap();
        }

        let filtered = store
            .load_signals(
                &recording_id,
                LoadSignalsFilter {
                    from_index: Some(1),
                    to_index: None,
                    patterns: vec![],
                },
            )
            .await
            .unwrap();
        assert_eq!(filtered.len(), 2);

        let by_pattern = store
            .load_signals(
                &recording_id,
                LoadSignalsFilter {
                    patterns: vec!["plan:*".to_string()],
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(by_pattern.len(), 1);
        assert_eq!(by_pattern[0].name, "plan:created");
    }
}
