//! Run store and snapshot sink traits.
//!
//! A step never writes piecemeal. The orchestrator stages everything a step
//! produces into one [`RunCommit`] and hands it to [`RunStore::commit`],
//! which applies all of it or none of it.
//!
//! [`validate_commit`] holds the memory-model checks shared by every store
//! implementation, so an in-memory store and a SQLite store reject exactly
//! the same commits.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

use crate::error::{ConsistencyViolation, Result, StoreError};
use crate::event::{Event, PendingEvent};
use crate::memory::{Fact, FactId, FactStatus, LtmEntry, Snapshot};
use crate::message::Message;
use crate::run::{Run, RunId};

/// A status change of an existing fact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FactTransition {
    pub fact_id: FactId,
    pub to: FactStatus,
}

/// Everything one step (or one forced compression) writes.
#[derive(Debug, Clone)]
pub struct RunCommit {
    pub run_id: RunId,
    /// The step counter the writer read. A mismatch means another writer won.
    pub base_step_counter: u64,
    /// The step counter after this commit.
    pub step_counter: u64,
    pub messages: Vec<Message>,
    pub transitions: Vec<FactTransition>,
    pub new_facts: Vec<Fact>,
    pub snapshot: Option<Snapshot>,
    pub events: Vec<PendingEvent>,
}

impl RunCommit {
    pub fn new(run_id: RunId, base_step_counter: u64, step_counter: u64) -> Self {
        Self {
            run_id,
            base_step_counter,
            step_counter,
            messages: Vec::new(),
            transitions: Vec::new(),
            new_facts: Vec::new(),
            snapshot: None,
            events: Vec::new(),
        }
    }
}

/// Check a commit against the current facts and latest snapshot version.
///
/// Rules:
/// - only `active` facts may change status, and never back to `active`
/// - new fact ids must be fresh and greater than every existing id
/// - a fact may only supersede an older fact that this commit marks `superseded`
/// - after the commit, at most one `active` fact exists per key
/// - a snapshot must carry exactly the next version
pub fn validate_commit(
    existing: &[Fact],
    latest_snapshot_version: u64,
    commit: &RunCommit,
) -> std::result::Result<(), ConsistencyViolation> {
    if commit.step_counter < commit.base_step_counter {
        return Err(ConsistencyViolation::ImmutableRecord(format!(
            "step counter can not move backwards from {} to {}",
            commit.base_step_counter, commit.step_counter
        )));
    }

    let by_id: HashMap<FactId, &Fact> = existing.iter().map(|f| (f.id, f)).collect();
    let mut post_status: HashMap<FactId, FactStatus> =
        existing.iter().map(|f| (f.id, f.status)).collect();

    for transition in &commit.transitions {
        let Some(fact) = by_id.get(&transition.fact_id) else {
            return Err(ConsistencyViolation::UnknownFact {
                fact_id: transition.fact_id.0,
            });
        };
        let current = post_status[&fact.id];
        if current != FactStatus::Active {
            return Err(ConsistencyViolation::FactNotActive {
                fact_id: fact.id.0,
                status: current.to_string(),
            });
        }
        if transition.to == FactStatus::Active {
            return Err(ConsistencyViolation::ImmutableRecord(format!(
                "fact {} can not be re-activated",
                fact.id
            )));
        }
        post_status.insert(fact.id, transition.to);
    }

    let max_existing = existing.iter().map(|f| f.id.0).max().unwrap_or(0);
    let mut seen_new = HashSet::new();
    for fact in &commit.new_facts {
        if by_id.contains_key(&fact.id) || !seen_new.insert(fact.id) {
            return Err(ConsistencyViolation::ImmutableRecord(format!(
                "fact id {} already exists",
                fact.id
            )));
        }
        if fact.id.0 <= max_existing {
            return Err(ConsistencyViolation::ImmutableRecord(format!(
                "fact id {} is not newer than existing id {max_existing}",
                fact.id
            )));
        }
        if fact.run_id != commit.run_id {
            return Err(ConsistencyViolation::ImmutableRecord(format!(
                "fact {} belongs to run {}",
                fact.id, fact.run_id
            )));
        }
        if let Some(prior) = fact.supersedes {
            // Older ids only, so following `supersedes` always terminates.
            if prior >= fact.id {
                return Err(ConsistencyViolation::SupersessionCycle { fact_id: fact.id.0 });
            }
            match post_status.get(&prior) {
                None => return Err(ConsistencyViolation::UnknownFact { fact_id: prior.0 }),
                Some(FactStatus::Superseded) => {}
                Some(status) => {
                    return Err(ConsistencyViolation::FactNotActive {
                        fact_id: prior.0,
                        status: format!("{status}, not superseded by this commit"),
                    });
                }
            }
        }
        post_status.insert(fact.id, fact.status);
    }

    let mut active_keys = HashSet::new();
    for fact in existing.iter().chain(commit.new_facts.iter()) {
        if post_status[&fact.id] == FactStatus::Active && !active_keys.insert(fact.key.as_str()) {
            return Err(ConsistencyViolation::DuplicateActiveFact {
                key: fact.key.clone(),
            });
        }
    }

    if let Some(snapshot) = &commit.snapshot {
        if snapshot.version != latest_snapshot_version + 1 {
            return Err(ConsistencyViolation::ImmutableRecord(format!(
                "snapshot version {} does not follow {latest_snapshot_version}",
                snapshot.version
            )));
        }
    }

    Ok(())
}

/// Durable state for runs.
///
/// Reads observe committed state only. `commit` is atomic: on any error
/// nothing from the commit is visible.
#[async_trait]
pub trait RunStore: Send + Sync {
    /// Backend name (e.g., "memory", "sqlite").
    fn name(&self) -> &str;

    async fn create_run(&self, run: &Run) -> std::result::Result<(), StoreError>;

    async fn get_run(&self, run_id: &RunId) -> std::result::Result<Option<Run>, StoreError>;

    /// Full message history in append order.
    async fn messages(&self, run_id: &RunId) -> std::result::Result<Vec<Message>, StoreError>;

    /// Every fact ever written for the run, ordered by id.
    async fn facts(&self, run_id: &RunId) -> std::result::Result<Vec<Fact>, StoreError>;

    /// Snapshots ordered by version.
    async fn snapshots(&self, run_id: &RunId) -> std::result::Result<Vec<Snapshot>, StoreError>;

    async fn latest_snapshot(&self, run_id: &RunId) -> std::result::Result<Option<Snapshot>, StoreError> {
        Ok(self.snapshots(run_id).await?.pop())
    }

    /// Events ordered by id.
    async fn events(&self, run_id: &RunId) -> std::result::Result<Vec<Event>, StoreError>;

    async fn ltm(&self, run_id: &RunId) -> std::result::Result<Vec<LtmEntry>, StoreError>;

    /// Insert or replace an LTM entry by (run_id, key).
    async fn put_ltm(&self, entry: LtmEntry) -> std::result::Result<(), StoreError>;

    /// Apply a commit atomically and return the committed events with their ids.
    async fn commit(&self, commit: RunCommit) -> Result<Vec<Event>>;
}

/// Where snapshot JSON blobs are persisted.
#[async_trait]
pub trait SnapshotSink: Send + Sync {
    fn name(&self) -> &str;

    /// Persist the snapshot and return its location. Never overwrites.
    async fn write(&self, snapshot: &Snapshot) -> std::result::Result<String, StoreError>;

    async fn read(&self, location: &str) -> std::result::Result<Option<Snapshot>, StoreError>;

    /// Remove a blob whose commit was rejected.
    async fn discard(&self, location: &str) -> std::result::Result<(), StoreError>;
}
