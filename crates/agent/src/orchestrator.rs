//! The run orchestrator.
//!
//! One step: retrieve → plan → critique → maybe compress. Everything a step
//! produces is staged into a single [`RunCommit`] and applied at the end, so
//! a failed step leaves no trace. Steps of the same run are serialized by a
//! per-run lock; reads take no lock and only ever see committed state.

use crate::compression::{self, CompressionInput, CompressionTrigger};
use crate::context::PlannerContext;
use crate::critic::CriticInput;
use crate::llm::LlmStrategy;
use crate::locks::RunLocks;
use crate::metrics;
use crate::records::{
    self, CompressionRecord, CriticRecord, PlannerRecord, RetrievalRecord, SnapshotRecord,
};
use crate::retrieval::RetrievalInput;
use crate::strategy::{AgentRunner, AgentStrategy};
use chrono::Utc;
use distillery_core::error::{Error, Result};
use distillery_core::event::{Event, EventBus, EventKind, PendingEvent};
use distillery_core::memory::{DroppedItem, Fact, FactId, LtmEntry, Snapshot, normalize_key};
use distillery_core::message::Message;
use distillery_core::metrics::{Metrics, Verdict};
use distillery_core::provider::Provider;
use distillery_core::run::{DeterminismMode, Run, RunConfig, RunId};
use distillery_core::store::{RunCommit, RunStore, SnapshotSink};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// The result of one step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepOutcome {
    pub run_id: RunId,
    pub step_index: u64,
    pub assistant_message: String,
    pub triggered_compression: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compression_trigger: Option<CompressionTrigger>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_version: Option<u64>,
    /// At least one agent call fell back to the deterministic rules.
    pub degraded: bool,
    pub verdict: Verdict,
    pub metrics: Metrics,
}

/// The result of a compression.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompressOutcome {
    pub run_id: RunId,
    pub step_index: u64,
    pub snapshot_version: u64,
    pub snapshot_path: String,
    pub new_fact_ids: Vec<FactId>,
    pub superseded_fact_ids: Vec<FactId>,
    pub deprecated_fact_ids: Vec<FactId>,
    pub dropped: Vec<DroppedItem>,
}

/// The memory tiers of a run as they stand.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryView {
    pub run_id: RunId,
    pub stm_tail: Vec<Message>,
    pub latest_cwm: Vec<Fact>,
    pub ltm: Vec<LtmEntry>,
    pub metrics: Metrics,
}

/// Drives runs through the per-step agent pipeline.
pub struct Orchestrator {
    store: Arc<dyn RunStore>,
    snapshots: Arc<dyn SnapshotSink>,
    /// Strategy for `llm_assisted` runs.
    llm: Option<Arc<dyn AgentStrategy>>,
    locks: RunLocks,
    event_bus: Arc<EventBus>,
    call_timeout: Duration,
}

impl Orchestrator {
    pub fn new(store: Arc<dyn RunStore>, snapshots: Arc<dyn SnapshotSink>) -> Self {
        Self {
            store,
            snapshots,
            llm: None,
            locks: RunLocks::new(),
            event_bus: Arc::new(EventBus::default()),
            call_timeout: Duration::from_secs(30),
        }
    }

    /// Use this strategy for `llm_assisted` runs.
    pub fn with_llm(mut self, strategy: Arc<dyn AgentStrategy>) -> Self {
        self.llm = Some(strategy);
        self
    }

    /// Use an LLM provider for `llm_assisted` runs.
    pub fn with_provider(self, provider: Arc<dyn Provider>, model: impl Into<String>) -> Self {
        self.with_llm(Arc::new(LlmStrategy::new(provider, model)))
    }

    /// Bound every agent call.
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// Publish committed events on a shared bus.
    pub fn with_event_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.event_bus = bus;
        self
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }

    pub fn store_name(&self) -> &str {
        self.store.name()
    }

    pub fn has_llm(&self) -> bool {
        self.llm.is_some()
    }

    fn runner_for(&self, run: &Run) -> AgentRunner {
        match (run.config.determinism_mode, &self.llm) {
            (DeterminismMode::LlmAssisted, Some(strategy)) => {
                AgentRunner::new(strategy.clone(), self.call_timeout)
            }
            _ => AgentRunner::deterministic(),
        }
    }

    // ── Runs ──────────────────────────────────────────────────────────────

    pub async fn create_run(&self, objective: &str, config: RunConfig) -> Result<Run> {
        let run = Run::new(objective, config)?;
        if run.config.determinism_mode == DeterminismMode::LlmAssisted && self.llm.is_none() {
            return Err(Error::Validation(
                "llm_assisted runs need a configured provider".into(),
            ));
        }

        self.store.create_run(&run).await?;
        info!(
            run_id = %run.id,
            mode = %run.config.determinism_mode,
            store = self.store.name(),
            "Run created"
        );
        Ok(run)
    }

    pub async fn get_run(&self, run_id: &RunId) -> Result<Run> {
        self.store
            .get_run(run_id)
            .await?
            .ok_or_else(|| Error::RunNotFound(run_id.to_string()))
    }

    // ── Steps ─────────────────────────────────────────────────────────────

    /// Process one user message.
    pub async fn step(&self, run_id: &RunId, user_message: &str) -> Result<StepOutcome> {
        let message = user_message.trim();
        if message.is_empty() {
            return Err(Error::Validation("user_message must not be empty".into()));
        }

        let _guard = self.locks.acquire(run_id).await;

        let run = self.get_run(run_id).await?;
        let history = self.store.messages(run_id).await?;
        let facts = self.store.facts(run_id).await?;
        let latest = self.store.latest_snapshot(run_id).await?;
        let active: Vec<Fact> = facts.iter().filter(|f| f.is_active()).cloned().collect();

        let runner = self.runner_for(&run);
        let step = run.step_counter + 1;
        let mut commit = RunCommit::new(run.id.clone(), run.step_counter, step);
        let mut degraded = false;

        // ── Retrieve ───────────────────────────────────────────────────────
        let stm_start = history.len().saturating_sub(run.config.stm_max_messages);
        let retrieval = runner
            .retrieve(&RetrievalInput {
                objective: &run.objective,
                active_facts: &active,
                stm_window: &history[stm_start..],
                user_message: message,
                top_k: run.config.retrieval_top_k,
                token_budget: run.config.retrieval_token_budget,
            })
            .await;
        degraded |= retrieval.degraded;

        let selected: Vec<Fact> = retrieval
            .value
            .selected_facts(&active)
            .into_iter()
            .cloned()
            .collect();
        let ctx = PlannerContext::assemble(
            &run.objective,
            &selected,
            &retrieval.value.stm_slice,
            message,
        );
        let injected_tokens = ctx.token_count();

        debug!(
            run_id = %run.id,
            step,
            agent = "retrieval",
            selected = selected.len(),
            injected_tokens,
            degraded = retrieval.degraded,
            "Context assembled"
        );

        commit.messages.push(Message::user(run.id.clone(), step, message));
        commit.events.push(records::pending(
            step,
            EventKind::Retrieval,
            &RetrievalRecord {
                strategy: retrieval.strategy.clone(),
                degraded: retrieval.degraded,
                selected_fact_ids: retrieval.value.selected_fact_ids.clone(),
                stm_start,
                stm_end: history.len(),
                user_message_index: history.len(),
                notes: retrieval.value.notes.clone(),
                injected_tokens,
            },
        )?);

        // ── Plan ───────────────────────────────────────────────────────────
        let plan = runner.plan(&ctx).await;
        degraded |= plan.degraded;

        commit.messages.push(Message::assistant(
            run.id.clone(),
            step,
            plan.value.assistant_message.clone(),
        ));
        commit.events.push(records::pending(
            step,
            EventKind::Planner,
            &PlannerRecord {
                strategy: plan.strategy.clone(),
                degraded: plan.degraded,
                assistant_message: plan.value.assistant_message.clone(),
                plan_steps: plan.value.plan_steps.clone(),
                context_tokens: injected_tokens,
                layers: ctx.layer_stats(),
            },
        )?);

        // ── Critique ───────────────────────────────────────────────────────
        let planner_output = plan.value.full_text();
        let critique = runner
            .critique(&CriticInput {
                objective: &run.objective,
                planner_output: &planner_output,
                user_message: message,
                active_facts: &active,
                selected_fact_ids: &retrieval.value.selected_fact_ids,
            })
            .await;
        degraded |= critique.degraded;

        commit.events.push(records::pending(
            step,
            EventKind::Critic,
            &CriticRecord {
                strategy: critique.strategy.clone(),
                degraded: critique.degraded,
                verdict: critique.value.verdict,
                reasons: critique.value.reasons.clone(),
            },
        )?);

        // ── Maybe compress ─────────────────────────────────────────────────
        let trigger = CompressionTrigger::evaluate(&run.config, step, injected_tokens);
        let compressed = match trigger {
            Some(trigger) => {
                let since = latest.as_ref().map(|s| s.step_index).unwrap_or(0);
                let recent: Vec<Message> = history
                    .iter()
                    .chain(commit.messages.iter())
                    .filter(|m| m.step_index > since)
                    .cloned()
                    .collect();
                let (outcome, was_degraded) = self
                    .compress_into(
                        &mut commit,
                        &run,
                        &runner,
                        &facts,
                        latest.as_ref(),
                        &recent,
                        trigger,
                        step,
                    )
                    .await?;
                degraded |= was_degraded;
                Some(outcome)
            }
            None => None,
        };

        let blob = compressed.as_ref().map(|c| c.snapshot_path.clone());
        self.apply(commit, blob.as_deref()).await?;

        let metrics = self.metrics(&run).await?;
        info!(
            run_id = %run.id,
            step,
            verdict = critique.value.verdict.as_str(),
            compressed = compressed.is_some(),
            degraded,
            reduction_pct = metrics.reduction_pct,
            "Step completed"
        );

        Ok(StepOutcome {
            run_id: run.id,
            step_index: step,
            assistant_message: plan.value.assistant_message,
            triggered_compression: compressed.is_some(),
            compression_trigger: trigger,
            snapshot_version: compressed.map(|c| c.snapshot_version),
            degraded,
            verdict: critique.value.verdict,
            metrics,
        })
    }

    /// Compress the STM since the last compression now, without a step.
    pub async fn force_compress(&self, run_id: &RunId) -> Result<CompressOutcome> {
        let _guard = self.locks.acquire(run_id).await;

        let run = self.get_run(run_id).await?;
        let history = self.store.messages(run_id).await?;
        let facts = self.store.facts(run_id).await?;
        let latest = self.store.latest_snapshot(run_id).await?;

        let since = latest.as_ref().map(|s| s.step_index).unwrap_or(0);
        let recent: Vec<Message> = history
            .into_iter()
            .filter(|m| m.step_index > since)
            .collect();

        let runner = self.runner_for(&run);
        let mut commit = RunCommit::new(run.id.clone(), run.step_counter, run.step_counter);
        let (outcome, _) = self
            .compress_into(
                &mut commit,
                &run,
                &runner,
                &facts,
                latest.as_ref(),
                &recent,
                CompressionTrigger::Forced,
                run.step_counter,
            )
            .await?;

        self.apply(commit, Some(&outcome.snapshot_path)).await?;
        Ok(outcome)
    }

    /// Extract, reconcile, write the snapshot blob, and stage it all.
    ///
    /// Returns the outcome and whether extraction was degraded. The blob is
    /// discarded here if staging fails after it was written.
    #[allow(clippy::too_many_arguments)]
    async fn compress_into(
        &self,
        commit: &mut RunCommit,
        run: &Run,
        runner: &AgentRunner,
        facts: &[Fact],
        latest: Option<&Snapshot>,
        recent: &[Message],
        trigger: CompressionTrigger,
        step: u64,
    ) -> Result<(CompressOutcome, bool)> {
        let active: Vec<Fact> = facts.iter().filter(|f| f.is_active()).cloned().collect();
        let extraction = runner
            .extract(&CompressionInput {
                objective: &run.objective,
                active_facts: &active,
                messages: recent,
            })
            .await;

        let next_fact_id = facts.iter().map(|f| f.id.0).max().unwrap_or(0) + 1;
        let version = latest.map(|s| s.version).unwrap_or(0) + 1;
        let outcome =
            compression::reconcile(&run.id, &active, extraction.value, next_fact_id, version);

        let mut snapshot = Snapshot {
            run_id: run.id.clone(),
            version,
            step_index: step,
            timestamp: Utc::now(),
            facts: outcome.active_facts.clone(),
            dropped: outcome.dropped.clone(),
            path: None,
        };
        let location = self.snapshots.write(&snapshot).await?;
        snapshot.path = Some(location.clone());

        let new_fact_ids: Vec<FactId> = outcome.new_facts.iter().map(|f| f.id).collect();
        let staged = stage_events(
            step,
            &extraction.strategy,
            extraction.degraded,
            trigger,
            &outcome,
            &new_fact_ids,
            &snapshot,
        );
        let events = match staged {
            Ok(events) => events,
            Err(e) => {
                self.discard(&location).await;
                return Err(e);
            }
        };

        info!(
            run_id = %run.id,
            step,
            agent = "compression",
            trigger = trigger.as_str(),
            version,
            candidates = outcome.candidates,
            new_facts = outcome.new_facts.len(),
            superseded = outcome.superseded_fact_ids.len(),
            dropped = outcome.dropped.len(),
            degraded = extraction.degraded,
            "Compression staged"
        );

        commit.transitions.extend(outcome.transitions.iter().copied());
        commit.new_facts.extend(outcome.new_facts.iter().cloned());
        commit.events.extend(events);
        commit.snapshot = Some(snapshot);

        Ok((
            CompressOutcome {
                run_id: run.id.clone(),
                step_index: step,
                snapshot_version: version,
                snapshot_path: location,
                new_fact_ids,
                superseded_fact_ids: outcome.superseded_fact_ids,
                deprecated_fact_ids: outcome.deprecated_fact_ids,
                dropped: outcome.dropped,
            },
            extraction.degraded,
        ))
    }

    /// Commit, then publish. A rejected commit takes its snapshot blob with it.
    async fn apply(&self, commit: RunCommit, blob: Option<&str>) -> Result<Vec<Event>> {
        let run_id = commit.run_id.clone();
        match self.store.commit(commit).await {
            Ok(events) => {
                for event in &events {
                    self.event_bus.publish(event.clone());
                }
                Ok(events)
            }
            Err(e) => {
                warn!(run_id = %run_id, error = %e, "Commit rejected, step discarded");
                if let Some(location) = blob {
                    self.discard(location).await;
                }
                Err(e)
            }
        }
    }

    async fn discard(&self, location: &str) {
        if let Err(e) = self.snapshots.discard(location).await {
            warn!(location, error = %e, "Failed to discard snapshot blob");
        }
    }

    // ── Reads ─────────────────────────────────────────────────────────────

    pub async fn get_memory(&self, run_id: &RunId) -> Result<MemoryView> {
        let run = self.get_run(run_id).await?;
        let messages = self.store.messages(run_id).await?;
        let facts = self.store.facts(run_id).await?;
        let events = self.store.events(run_id).await?;
        let latest = self.store.latest_snapshot(run_id).await?;
        let ltm = self.store.ltm(run_id).await?;

        let metrics = metrics::compute(&run, &messages, &facts, &events, latest.as_ref())?;
        let tail_start = messages.len().saturating_sub(run.config.stm_max_messages);

        Ok(MemoryView {
            run_id: run.id,
            stm_tail: messages[tail_start..].to_vec(),
            latest_cwm: facts.into_iter().filter(|f| f.is_active()).collect(),
            ltm,
            metrics,
        })
    }

    pub async fn get_events(&self, run_id: &RunId) -> Result<Vec<Event>> {
        self.get_run(run_id).await?;
        Ok(self.store.events(run_id).await?)
    }

    pub async fn get_latest_snapshot(&self, run_id: &RunId) -> Result<Option<Snapshot>> {
        self.get_run(run_id).await?;
        Ok(self.store.latest_snapshot(run_id).await?)
    }

    /// Store a long-term memory entry for the run.
    pub async fn remember(
        &self,
        run_id: &RunId,
        key: &str,
        value: &str,
        confidence: f32,
    ) -> Result<LtmEntry> {
        let key = normalize_key(key);
        if key.is_empty() || value.trim().is_empty() {
            return Err(Error::Validation("LTM key and value must not be empty".into()));
        }
        if !(0.0..=1.0).contains(&confidence) {
            return Err(Error::Validation(format!(
                "confidence must be within 0..=1, got {confidence}"
            )));
        }
        self.get_run(run_id).await?;

        let entry = LtmEntry {
            run_id: run_id.clone(),
            key,
            value: value.trim().to_string(),
            confidence,
        };
        self.store.put_ltm(entry.clone()).await?;
        Ok(entry)
    }

    async fn metrics(&self, run: &Run) -> Result<Metrics> {
        let messages = self.store.messages(&run.id).await?;
        let facts = self.store.facts(&run.id).await?;
        let events = self.store.events(&run.id).await?;
        let latest = self.store.latest_snapshot(&run.id).await?;
        metrics::compute(run, &messages, &facts, &events, latest.as_ref())
    }
}

fn stage_events(
    step: u64,
    strategy: &str,
    degraded: bool,
    trigger: CompressionTrigger,
    outcome: &compression::CompressionOutcome,
    new_fact_ids: &[FactId],
    snapshot: &Snapshot,
) -> Result<Vec<PendingEvent>> {
    Ok(vec![
        records::pending(
            step,
            EventKind::Compression,
            &CompressionRecord {
                strategy: strategy.to_string(),
                degraded,
                trigger,
                candidates: outcome.candidates,
                new_fact_ids: new_fact_ids.to_vec(),
                superseded_fact_ids: outcome.superseded_fact_ids.clone(),
                deprecated_fact_ids: outcome.deprecated_fact_ids.clone(),
                dropped: outcome.dropped.clone(),
                snapshot_version: snapshot.version,
            },
        )?,
        records::pending(
            step,
            EventKind::Snapshot,
            &SnapshotRecord {
                strategy: strategy.to_string(),
                degraded,
                version: snapshot.version,
                path: snapshot.path.clone(),
                active_fact_ids: snapshot.facts.iter().map(|f| f.id).collect(),
                step_index: snapshot.step_index,
            },
        )?,
    ])
}
