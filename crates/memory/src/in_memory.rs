//! In-memory run store, useful for testing and ephemeral sessions.

use async_trait::async_trait;
use distillery_core::error::{ConsistencyViolation, Error, Result, StoreError};
use distillery_core::event::Event;
use distillery_core::memory::{Fact, LtmEntry, Snapshot};
use distillery_core::message::Message;
use distillery_core::run::{Run, RunId};
use distillery_core::store::{RunCommit, RunStore, validate_commit};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

/// Everything owned by one run.
struct RunRecord {
    run: Run,
    messages: Vec<Message>,
    facts: Vec<Fact>,
    snapshots: Vec<Snapshot>,
    events: Vec<Event>,
    ltm: Vec<LtmEntry>,
}

impl RunRecord {
    fn new(run: Run) -> Self {
        Self {
            run,
            messages: Vec::new(),
            facts: Vec::new(),
            snapshots: Vec::new(),
            events: Vec::new(),
            ltm: Vec::new(),
        }
    }
}

/// A store that keeps every run in process memory.
///
/// Each run has its own lock, so commits for different runs never contend.
pub struct InMemoryStore {
    runs: Arc<RwLock<HashMap<RunId, Arc<RwLock<RunRecord>>>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            runs: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    async fn record(&self, run_id: &RunId) -> Option<Arc<RwLock<RunRecord>>> {
        self.runs.read().await.get(run_id).cloned()
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RunStore for InMemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn create_run(&self, run: &Run) -> std::result::Result<(), StoreError> {
        let mut runs = self.runs.write().await;
        if runs.contains_key(&run.id) {
            return Err(StoreError::Storage(format!("run {} already exists", run.id)));
        }
        runs.insert(run.id.clone(), Arc::new(RwLock::new(RunRecord::new(run.clone()))));
        Ok(())
    }

    async fn get_run(&self, run_id: &RunId) -> std::result::Result<Option<Run>, StoreError> {
        match self.record(run_id).await {
            Some(record) => Ok(Some(record.read().await.run.clone())),
            None => Ok(None),
        }
    }

    async fn messages(&self, run_id: &RunId) -> std::result::Result<Vec<Message>, StoreError> {
        match self.record(run_id).await {
            Some(record) => Ok(record.read().await.messages.clone()),
            None => Ok(Vec::new()),
        }
    }

    async fn facts(&self, run_id: &RunId) -> std::result::Result<Vec<Fact>, StoreError> {
        match self.record(run_id).await {
            Some(record) => Ok(record.read().await.facts.clone()),
            None => Ok(Vec::new()),
        }
    }

    async fn snapshots(&self, run_id: &RunId) -> std::result::Result<Vec<Snapshot>, StoreError> {
        match self.record(run_id).await {
            Some(record) => Ok(record.read().await.snapshots.clone()),
            None => Ok(Vec::new()),
        }
    }

    async fn latest_snapshot(
        &self,
        run_id: &RunId,
    ) -> std::result::Result<Option<Snapshot>, StoreError> {
        match self.record(run_id).await {
            Some(record) => Ok(record.read().await.snapshots.last().cloned()),
            None => Ok(None),
        }
    }

    async fn events(&self, run_id: &RunId) -> std::result::Result<Vec<Event>, StoreError> {
        match self.record(run_id).await {
            Some(record) => Ok(record.read().await.events.clone()),
            None => Ok(Vec::new()),
        }
    }

    async fn ltm(&self, run_id: &RunId) -> std::result::Result<Vec<LtmEntry>, StoreError> {
        match self.record(run_id).await {
            Some(record) => Ok(record.read().await.ltm.clone()),
            None => Ok(Vec::new()),
        }
    }

    async fn put_ltm(&self, entry: LtmEntry) -> std::result::Result<(), StoreError> {
        let Some(record) = self.record(&entry.run_id).await else {
            return Err(StoreError::Storage(format!("run {} does not exist", entry.run_id)));
        };
        let mut record = record.write().await;
        match record.ltm.iter_mut().find(|e| e.key == entry.key) {
            Some(existing) => *existing = entry,
            None => record.ltm.push(entry),
        }
        Ok(())
    }

    async fn commit(&self, commit: RunCommit) -> Result<Vec<Event>> {
        let record = self
            .record(&commit.run_id)
            .await
            .ok_or_else(|| Error::RunNotFound(commit.run_id.to_string()))?;
        let mut record = record.write().await;

        if record.run.step_counter != commit.base_step_counter {
            return Err(ConsistencyViolation::StaleStep {
                expected: commit.base_step_counter,
                found: record.run.step_counter,
            }
            .into());
        }
        let latest_version = record.snapshots.last().map(|s| s.version).unwrap_or(0);
        validate_commit(&record.facts, latest_version, &commit)?;

        // Validated: nothing below can fail.
        record.messages.extend(commit.messages);
        for transition in &commit.transitions {
            if let Some(fact) = record.facts.iter_mut().find(|f| f.id == transition.fact_id) {
                fact.status = transition.to;
            }
        }
        record.facts.extend(commit.new_facts);
        if let Some(snapshot) = commit.snapshot {
            record.snapshots.push(snapshot);
        }

        let mut next_id = record.events.len() as u64 + 1;
        let mut committed = Vec::with_capacity(commit.events.len());
        for pending in commit.events {
            let event = pending.into_event(commit.run_id.clone(), next_id);
            next_id += 1;
            committed.push(event);
        }
        record.events.extend(committed.iter().cloned());
        record.run.step_counter = commit.step_counter;

        debug!(
            run_id = %commit.run_id,
            step = commit.step_counter,
            events = committed.len(),
            "Commit applied"
        );
        Ok(committed)
    }
}
