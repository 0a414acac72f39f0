//! SQLite run store.
//!
//! One table per record type, all keyed by run id:
//! - `runs`: objective, JSON config, current step counter
//! - `messages`: full history, append-only
//! - `facts`: CWM facts; only `status` may change, and only out of `active`
//! - `snapshots`: CWM snapshots with their facts and dropped items as JSON
//! - `events`: the per-run event log
//! - `ltm`: long-term memory scaffold
//!
//! Write-once rules are enforced by the schema itself (abort triggers and a
//! partial unique index on active keys), on top of the shared commit checks.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use distillery_core::error::{ConsistencyViolation, Error, Result, StoreError};
use distillery_core::event::{Event, EventKind};
use distillery_core::memory::{AgentKind, Fact, FactId, FactStatus, LtmEntry, Provenance, Snapshot};
use distillery_core::message::{Message, Role};
use distillery_core::run::{Run, RunConfig, RunId};
use distillery_core::store::{RunCommit, RunStore, validate_commit};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous,
};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use tracing::{debug, info};

const MIGRATIONS: &[(&str, &str)] = &[
    (
        "runs table",
        r#"
        CREATE TABLE IF NOT EXISTS runs (
            id           TEXT PRIMARY KEY,
            objective    TEXT NOT NULL,
            config       TEXT NOT NULL,
            step_counter INTEGER NOT NULL DEFAULT 0,
            created_at   TEXT NOT NULL
        )
        "#,
    ),
    (
        "messages table",
        r#"
        CREATE TABLE IF NOT EXISTS messages (
            iid            INTEGER PRIMARY KEY AUTOINCREMENT,
            run_id         TEXT NOT NULL REFERENCES runs(id),
            step_index     INTEGER NOT NULL,
            role           TEXT NOT NULL,
            content        TEXT NOT NULL,
            token_estimate INTEGER NOT NULL,
            created_at     TEXT NOT NULL
        )
        "#,
    ),
    (
        "facts table",
        r#"
        CREATE TABLE IF NOT EXISTS facts (
            run_id     TEXT NOT NULL REFERENCES runs(id),
            id         INTEGER NOT NULL,
            version    INTEGER NOT NULL,
            key        TEXT NOT NULL,
            value      TEXT NOT NULL,
            status     TEXT NOT NULL,
            supersedes INTEGER,
            step_index INTEGER NOT NULL,
            agent      TEXT NOT NULL,
            created_at TEXT NOT NULL,
            PRIMARY KEY (run_id, id)
        )
        "#,
    ),
    (
        "one active fact per key",
        "CREATE UNIQUE INDEX IF NOT EXISTS facts_one_active ON facts(run_id, key) WHERE status = 'active'",
    ),
    (
        "fact content trigger",
        r#"
        CREATE TRIGGER IF NOT EXISTS facts_write_once
        BEFORE UPDATE OF run_id, id, version, key, value, supersedes, step_index, agent, created_at ON facts
        BEGIN
            SELECT RAISE(ABORT, 'facts are write-once');
        END
        "#,
    ),
    (
        "fact status trigger",
        r#"
        CREATE TRIGGER IF NOT EXISTS facts_status_forward
        BEFORE UPDATE OF status ON facts
        WHEN OLD.status <> 'active' OR NEW.status = 'active'
        BEGIN
            SELECT RAISE(ABORT, 'only active facts can change status');
        END
        "#,
    ),
    (
        "fact delete trigger",
        r#"
        CREATE TRIGGER IF NOT EXISTS facts_no_delete BEFORE DELETE ON facts
        BEGIN
            SELECT RAISE(ABORT, 'facts are never deleted');
        END
        "#,
    ),
    (
        "message update trigger",
        r#"
        CREATE TRIGGER IF NOT EXISTS messages_write_once BEFORE UPDATE ON messages
        BEGIN
            SELECT RAISE(ABORT, 'messages are write-once');
        END
        "#,
    ),
    (
        "snapshots table",
        r#"
        CREATE TABLE IF NOT EXISTS snapshots (
            run_id     TEXT NOT NULL REFERENCES runs(id),
            version    INTEGER NOT NULL,
            step_index INTEGER NOT NULL,
            timestamp  TEXT NOT NULL,
            facts      TEXT NOT NULL,
            dropped    TEXT NOT NULL,
            path       TEXT,
            PRIMARY KEY (run_id, version)
        )
        "#,
    ),
    (
        "snapshot update trigger",
        r#"
        CREATE TRIGGER IF NOT EXISTS snapshots_write_once BEFORE UPDATE ON snapshots
        BEGIN
            SELECT RAISE(ABORT, 'snapshots are write-once');
        END
        "#,
    ),
    (
        "snapshot delete trigger",
        r#"
        CREATE TRIGGER IF NOT EXISTS snapshots_no_delete BEFORE DELETE ON snapshots
        BEGIN
            SELECT RAISE(ABORT, 'snapshots are never deleted');
        END
        "#,
    ),
    (
        "events table",
        r#"
        CREATE TABLE IF NOT EXISTS events (
            run_id     TEXT NOT NULL REFERENCES runs(id),
            id         INTEGER NOT NULL,
            step_index INTEGER NOT NULL,
            kind       TEXT NOT NULL,
            payload    TEXT NOT NULL,
            created_at TEXT NOT NULL,
            PRIMARY KEY (run_id, id)
        )
        "#,
    ),
    (
        "event update trigger",
        r#"
        CREATE TRIGGER IF NOT EXISTS events_write_once BEFORE UPDATE ON events
        BEGIN
            SELECT RAISE(ABORT, 'events are append-only');
        END
        "#,
    ),
    (
        "event delete trigger",
        r#"
        CREATE TRIGGER IF NOT EXISTS events_no_delete BEFORE DELETE ON events
        BEGIN
            SELECT RAISE(ABORT, 'events are append-only');
        END
        "#,
    ),
    (
        "ltm table",
        r#"
        CREATE TABLE IF NOT EXISTS ltm (
            run_id     TEXT NOT NULL REFERENCES runs(id),
            key        TEXT NOT NULL,
            value      TEXT NOT NULL,
            confidence REAL NOT NULL,
            PRIMARY KEY (run_id, key)
        )
        "#,
    ),
];

/// A durable SQLite run store.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (or create) a store at `path`.
    ///
    /// Accepts a plain file path, a `sqlite://` URL, or `sqlite::memory:`
    /// for an ephemeral database (useful for tests).
    pub async fn new(path: &str) -> std::result::Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(path)
            .map_err(|e| StoreError::Storage(format!("Invalid SQLite path: {e}")))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .pragma("foreign_keys", "ON");

        // Every connection to `:memory:` is a separate database.
        let max_connections = if path.contains(":memory:") { 1 } else { 4 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .map_err(|e| StoreError::Storage(format!("Failed to open SQLite: {e}")))?;

        let store = Self { pool };
        store.run_migrations().await?;
        info!("SQLite run store initialized at {path}");
        Ok(store)
    }

    /// Create from an existing pool (useful for testing).
    pub async fn from_pool(pool: SqlitePool) -> std::result::Result<Self, StoreError> {
        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    async fn run_migrations(&self) -> std::result::Result<(), StoreError> {
        for (name, sql) in MIGRATIONS {
            sqlx::query(sql)
                .execute(&self.pool)
                .await
                .map_err(|e| StoreError::MigrationFailed(format!("{name}: {e}")))?;
        }
        debug!(migrations = MIGRATIONS.len(), "SQLite schema ready");
        Ok(())
    }

    fn parse_time(raw: &str, column: &str) -> std::result::Result<DateTime<Utc>, StoreError> {
        DateTime::parse_from_rfc3339(raw)
            .map(|d| d.with_timezone(&Utc))
            .map_err(|e| StoreError::QueryFailed(format!("{column} timestamp: {e}")))
    }

    fn column<'r, T>(row: &'r SqliteRow, name: &str) -> std::result::Result<T, StoreError>
    where
        T: sqlx::Decode<'r, sqlx::Sqlite> + sqlx::Type<sqlx::Sqlite>,
    {
        row.try_get(name)
            .map_err(|e| StoreError::QueryFailed(format!("{name} column: {e}")))
    }

    fn row_to_run(row: &SqliteRow) -> std::result::Result<Run, StoreError> {
        let config: String = Self::column(row, "config")?;
        let config: RunConfig = serde_json::from_str(&config)
            .map_err(|e| StoreError::QueryFailed(format!("config column: {e}")))?;
        let created_at: String = Self::column(row, "created_at")?;
        Ok(Run {
            id: RunId(Self::column(row, "id")?),
            objective: Self::column(row, "objective")?,
            config,
            step_counter: Self::column::<i64>(row, "step_counter")? as u64,
            created_at: Self::parse_time(&created_at, "created_at")?,
        })
    }

    fn row_to_message(row: &SqliteRow) -> std::result::Result<Message, StoreError> {
        let role: String = Self::column(row, "role")?;
        let created_at: String = Self::column(row, "created_at")?;
        Ok(Message {
            run_id: RunId(Self::column(row, "run_id")?),
            step_index: Self::column::<i64>(row, "step_index")? as u64,
            role: Role::parse(&role)
                .ok_or_else(|| StoreError::QueryFailed(format!("unknown role '{role}'")))?,
            content: Self::column(row, "content")?,
            token_estimate: Self::column::<i64>(row, "token_estimate")? as usize,
            created_at: Self::parse_time(&created_at, "created_at")?,
        })
    }

    fn row_to_fact(row: &SqliteRow) -> std::result::Result<Fact, StoreError> {
        let status: String = Self::column(row, "status")?;
        let agent: String = Self::column(row, "agent")?;
        let created_at: String = Self::column(row, "created_at")?;
        let supersedes: Option<i64> = Self::column(row, "supersedes")?;
        Ok(Fact {
            id: FactId(Self::column::<i64>(row, "id")? as u64),
            run_id: RunId(Self::column(row, "run_id")?),
            version: Self::column::<i64>(row, "version")? as u64,
            key: Self::column(row, "key")?,
            value: Self::column(row, "value")?,
            status: FactStatus::parse(&status)
                .ok_or_else(|| StoreError::QueryFailed(format!("unknown status '{status}'")))?,
            supersedes: supersedes.map(|id| FactId(id as u64)),
            provenance: Provenance {
                step_index: Self::column::<i64>(row, "step_index")? as u64,
                agent: AgentKind::parse(&agent)
                    .ok_or_else(|| StoreError::QueryFailed(format!("unknown agent '{agent}'")))?,
            },
            created_at: Self::parse_time(&created_at, "created_at")?,
        })
    }

    fn row_to_snapshot(row: &SqliteRow) -> std::result::Result<Snapshot, StoreError> {
        let facts: String = Self::column(row, "facts")?;
        let dropped: String = Self::column(row, "dropped")?;
        let timestamp: String = Self::column(row, "timestamp")?;
        Ok(Snapshot {
            run_id: RunId(Self::column(row, "run_id")?),
            version: Self::column::<i64>(row, "version")? as u64,
            step_index: Self::column::<i64>(row, "step_index")? as u64,
            timestamp: Self::parse_time(&timestamp, "timestamp")?,
            facts: serde_json::from_str(&facts)
                .map_err(|e| StoreError::QueryFailed(format!("facts column: {e}")))?,
            dropped: serde_json::from_str(&dropped)
                .map_err(|e| StoreError::QueryFailed(format!("dropped column: {e}")))?,
            path: Self::column(row, "path")?,
        })
    }

    fn row_to_event(row: &SqliteRow) -> std::result::Result<Event, StoreError> {
        let kind: String = Self::column(row, "kind")?;
        let payload: String = Self::column(row, "payload")?;
        let created_at: String = Self::column(row, "created_at")?;
        Ok(Event {
            id: Self::column::<i64>(row, "id")? as u64,
            run_id: RunId(Self::column(row, "run_id")?),
            step_index: Self::column::<i64>(row, "step_index")? as u64,
            kind: EventKind::parse(&kind)
                .ok_or_else(|| StoreError::QueryFailed(format!("unknown event kind '{kind}'")))?,
            payload: serde_json::from_str(&payload)
                .map_err(|e| StoreError::QueryFailed(format!("payload column: {e}")))?,
            created_at: Self::parse_time(&created_at, "created_at")?,
        })
    }
}

fn write_failed(what: &str) -> impl Fn(sqlx::Error) -> StoreError + '_ {
    move |e| StoreError::Storage(format!("{what} failed: {e}"))
}

#[async_trait]
impl RunStore for SqliteStore {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn create_run(&self, run: &Run) -> std::result::Result<(), StoreError> {
        let config = serde_json::to_string(&run.config)
            .map_err(|e| StoreError::Storage(format!("Config serialization: {e}")))?;
        sqlx::query(
            "INSERT INTO runs (id, objective, config, step_counter, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(run.id.as_str())
        .bind(&run.objective)
        .bind(&config)
        .bind(run.step_counter as i64)
        .bind(run.created_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(write_failed("INSERT run"))?;

        debug!(run_id = %run.id, "Run created");
        Ok(())
    }

    async fn get_run(&self, run_id: &RunId) -> std::result::Result<Option<Run>, StoreError> {
        let row = sqlx::query("SELECT * FROM runs WHERE id = ?1")
            .bind(run_id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::QueryFailed(format!("GET run: {e}")))?;

        match row {
            Some(ref r) => Ok(Some(Self::row_to_run(r)?)),
            None => Ok(None),
        }
    }

    async fn messages(&self, run_id: &RunId) -> std::result::Result<Vec<Message>, StoreError> {
        let rows = sqlx::query("SELECT * FROM messages WHERE run_id = ?1 ORDER BY iid")
            .bind(run_id.as_str())
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StoreError::QueryFailed(format!("messages: {e}")))?;
        rows.iter().map(Self::row_to_message).collect()
    }

    async fn facts(&self, run_id: &RunId) -> std::result::Result<Vec<Fact>, StoreError> {
        let rows = sqlx::query("SELECT * FROM facts WHERE run_id = ?1 ORDER BY id")
            .bind(run_id.as_str())
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StoreError::QueryFailed(format!("facts: {e}")))?;
        rows.iter().map(Self::row_to_fact).collect()
    }

    async fn snapshots(&self, run_id: &RunId) -> std::result::Result<Vec<Snapshot>, StoreError> {
        let rows = sqlx::query("SELECT * FROM snapshots WHERE run_id = ?1 ORDER BY version")
            .bind(run_id.as_str())
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StoreError::QueryFailed(format!("snapshots: {e}")))?;
        rows.iter().map(Self::row_to_snapshot).collect()
    }

    async fn latest_snapshot(
        &self,
        run_id: &RunId,
    ) -> std::result::Result<Option<Snapshot>, StoreError> {
        let row =
            sqlx::query("SELECT * FROM snapshots WHERE run_id = ?1 ORDER BY version DESC LIMIT 1")
                .bind(run_id.as_str())
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| StoreError::QueryFailed(format!("latest snapshot: {e}")))?;

        match row {
            Some(ref r) => Ok(Some(Self::row_to_snapshot(r)?)),
            None => Ok(None),
        }
    }

    async fn events(&self, run_id: &RunId) -> std::result::Result<Vec<Event>, StoreError> {
        let rows = sqlx::query("SELECT * FROM events WHERE run_id = ?1 ORDER BY id")
            .bind(run_id.as_str())
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StoreError::QueryFailed(format!("events: {e}")))?;
        rows.iter().map(Self::row_to_event).collect()
    }

    async fn ltm(&self, run_id: &RunId) -> std::result::Result<Vec<LtmEntry>, StoreError> {
        let rows = sqlx::query("SELECT * FROM ltm WHERE run_id = ?1 ORDER BY key")
            .bind(run_id.as_str())
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StoreError::QueryFailed(format!("ltm: {e}")))?;

        rows.iter()
            .map(|row| {
                Ok(LtmEntry {
                    run_id: RunId(Self::column(row, "run_id")?),
                    key: Self::column(row, "key")?,
                    value: Self::column(row, "value")?,
                    confidence: Self::column::<f64>(row, "confidence")? as f32,
                })
            })
            .collect()
    }

    async fn put_ltm(&self, entry: LtmEntry) -> std::result::Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO ltm (run_id, key, value, confidence) VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(run_id, key) DO UPDATE SET
                value = excluded.value,
                confidence = excluded.confidence
            "#,
        )
        .bind(entry.run_id.as_str())
        .bind(&entry.key)
        .bind(&entry.value)
        .bind(entry.confidence as f64)
        .execute(&self.pool)
        .await
        .map_err(write_failed("UPSERT ltm"))?;
        Ok(())
    }

    async fn commit(&self, commit: RunCommit) -> Result<Vec<Event>> {
        let run_id = commit.run_id.as_str().to_string();
        // Dropping the transaction without `commit()` rolls everything back.
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(write_failed("BEGIN"))?;

        let row = sqlx::query("SELECT step_counter FROM runs WHERE id = ?1")
            .bind(&run_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| StoreError::QueryFailed(format!("step counter: {e}")))?;
        let Some(row) = row else {
            return Err(Error::RunNotFound(run_id));
        };
        let found = Self::column::<i64>(&row, "step_counter")? as u64;
        if found != commit.base_step_counter {
            return Err(ConsistencyViolation::StaleStep {
                expected: commit.base_step_counter,
                found,
            }
            .into());
        }

        let existing: Vec<Fact> = sqlx::query("SELECT * FROM facts WHERE run_id = ?1 ORDER BY id")
            .bind(&run_id)
            .fetch_all(&mut *tx)
            .await
            .map_err(|e| StoreError::QueryFailed(format!("facts: {e}")))?
            .iter()
            .map(Self::row_to_fact)
            .collect::<std::result::Result<_, _>>()?;
        let latest_version: i64 =
            sqlx::query("SELECT COALESCE(MAX(version), 0) AS v FROM snapshots WHERE run_id = ?1")
                .bind(&run_id)
                .fetch_one(&mut *tx)
                .await
                .map_err(|e| StoreError::QueryFailed(format!("snapshot version: {e}")))?
                .try_get("v")
                .map_err(|e| StoreError::QueryFailed(format!("v column: {e}")))?;
        validate_commit(&existing, latest_version as u64, &commit)?;

        for message in &commit.messages {
            sqlx::query(
                r#"
                INSERT INTO messages (run_id, step_index, role, content, token_estimate, created_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                "#,
            )
            .bind(&run_id)
            .bind(message.step_index as i64)
            .bind(message.role.as_str())
            .bind(&message.content)
            .bind(message.token_estimate as i64)
            .bind(message.created_at.to_rfc3339())
            .execute(&mut *tx)
            .await
            .map_err(write_failed("INSERT message"))?;
        }

        // Transitions first so the partial unique index sees the old fact retired.
        for transition in &commit.transitions {
            sqlx::query(
                "UPDATE facts SET status = ?1 WHERE run_id = ?2 AND id = ?3 AND status = 'active'",
            )
            .bind(transition.to.as_str())
            .bind(&run_id)
            .bind(transition.fact_id.0 as i64)
            .execute(&mut *tx)
            .await
            .map_err(write_failed("UPDATE fact status"))?;
        }

        for fact in &commit.new_facts {
            sqlx::query(
                r#"
                INSERT INTO facts (run_id, id, version, key, value, status, supersedes, step_index, agent, created_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                "#,
            )
            .bind(&run_id)
            .bind(fact.id.0 as i64)
            .bind(fact.version as i64)
            .bind(&fact.key)
            .bind(&fact.value)
            .bind(fact.status.as_str())
            .bind(fact.supersedes.map(|id| id.0 as i64))
            .bind(fact.provenance.step_index as i64)
            .bind(fact.provenance.agent.as_str())
            .bind(fact.created_at.to_rfc3339())
            .execute(&mut *tx)
            .await
            .map_err(write_failed("INSERT fact"))?;
        }

        if let Some(snapshot) = &commit.snapshot {
            let facts = serde_json::to_string(&snapshot.facts)?;
            let dropped = serde_json::to_string(&snapshot.dropped)?;
            sqlx::query(
                r#"
                INSERT INTO snapshots (run_id, version, step_index, timestamp, facts, dropped, path)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                "#,
            )
            .bind(&run_id)
            .bind(snapshot.version as i64)
            .bind(snapshot.step_index as i64)
            .bind(snapshot.timestamp.to_rfc3339())
            .bind(&facts)
            .bind(&dropped)
            .bind(snapshot.path.as_deref())
            .execute(&mut *tx)
            .await
            .map_err(write_failed("INSERT snapshot"))?;
        }

        let max_event: i64 =
            sqlx::query("SELECT COALESCE(MAX(id), 0) AS m FROM events WHERE run_id = ?1")
                .bind(&run_id)
                .fetch_one(&mut *tx)
                .await
                .map_err(|e| StoreError::QueryFailed(format!("event id: {e}")))?
                .try_get("m")
                .map_err(|e| StoreError::QueryFailed(format!("m column: {e}")))?;

        let mut committed = Vec::with_capacity(commit.events.len());
        for (offset, pending) in commit.events.into_iter().enumerate() {
            let event = pending.into_event(commit.run_id.clone(), max_event as u64 + offset as u64 + 1);
            let payload = serde_json::to_string(&event.payload)?;
            sqlx::query(
                r#"
                INSERT INTO events (run_id, id, step_index, kind, payload, created_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                "#,
            )
            .bind(&run_id)
            .bind(event.id as i64)
            .bind(event.step_index as i64)
            .bind(event.kind.as_str())
            .bind(&payload)
            .bind(event.created_at.to_rfc3339())
            .execute(&mut *tx)
            .await
            .map_err(write_failed("INSERT event"))?;
            committed.push(event);
        }

        sqlx::query("UPDATE runs SET step_counter = ?1 WHERE id = ?2")
            .bind(commit.step_counter as i64)
            .bind(&run_id)
            .execute(&mut *tx)
            .await
            .map_err(write_failed("UPDATE step counter"))?;

        tx.commit().await.map_err(write_failed("COMMIT"))?;

        debug!(
            run_id = %run_id,
            step = commit.step_counter,
            events = committed.len(),
            "Commit applied"
        );
        Ok(committed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use distillery_core::event::PendingEvent;
    use distillery_core::memory::{DropReason, DroppedItem};
    use distillery_core::store::FactTransition;

    async fn test_store() -> SqliteStore {
        SqliteStore::new("sqlite::memory:").await.unwrap()
    }

    async fn store_with_run() -> (SqliteStore, Run) {
        let store = test_store().await;
        let run = Run::new("Draft the PRD", RunConfig::default()).unwrap();
        store.create_run(&run).await.unwrap();
        (store, run)
    }

    fn fact(run: &Run, id: u64, key: &str, value: &str, supersedes: Option<u64>) -> Fact {
        Fact {
            id: FactId(id),
            run_id: run.id.clone(),
            version: 1,
            key: key.into(),
            value: value.into(),
            status: FactStatus::Active,
            supersedes: supersedes.map(FactId),
            provenance: Provenance {
                step_index: 1,
                agent: AgentKind::Compression,
            },
            created_at: Utc::now(),
        }
    }

    fn snapshot(run: &Run, version: u64, facts: Vec<Fact>) -> Snapshot {
        Snapshot {
            run_id: run.id.clone(),
            version,
            step_index: version,
            timestamp: Utc::now(),
            facts,
            dropped: vec![DroppedItem {
                text: "thanks!".into(),
                reason: DropReason::LowSalience,
                step_index: Some(1),
            }],
            path: Some(format!("mem://{}/v{version:04}", run.id)),
        }
    }

    #[tokio::test]
    async fn run_round_trip() {
        let (store, run) = store_with_run().await;
        let loaded = store.get_run(&run.id).await.unwrap().unwrap();
        assert_eq!(loaded.objective, "Draft the PRD");
        assert_eq!(loaded.config, run.config);
        assert!(store.get_run(&RunId::from("run_nope")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn commit_persists_everything() {
        let (store, run) = store_with_run().await;
        let f1 = fact(&run, 1, "ui", "minimal web only", None);
        let mut commit = RunCommit::new(run.id.clone(), 0, 1);
        commit.messages.push(Message::user(run.id.clone(), 1, "the UI is minimal web only"));
        commit.messages.push(Message::assistant(run.id.clone(), 1, "Noted."));
        commit.new_facts.push(f1.clone());
        commit.snapshot = Some(snapshot(&run, 1, vec![f1]));
        commit.events.push(PendingEvent::new(1, EventKind::Retrieval, serde_json::json!({"n": 1})));
        commit.events.push(PendingEvent::new(1, EventKind::Snapshot, serde_json::json!({"n": 2})));

        let events = store.commit(commit).await.unwrap();
        assert_eq!(events.iter().map(|e| e.id).collect::<Vec<_>>(), vec![1, 2]);

        let messages = store.messages(&run.id).await.unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].role, Role::Assistant);

        let latest = store.latest_snapshot(&run.id).await.unwrap().unwrap();
        assert_eq!(latest.version, 1);
        assert_eq!(latest.facts[0].key, "ui");
        assert_eq!(latest.dropped[0].reason, DropReason::LowSalience);

        let stored = store.events(&run.id).await.unwrap();
        assert_eq!(stored[1].payload["n"], 2);
        assert_eq!(store.get_run(&run.id).await.unwrap().unwrap().step_counter, 1);
    }

    #[tokio::test]
    async fn supersession_round_trip() {
        let (store, run) = store_with_run().await;
        let mut first = RunCommit::new(run.id.clone(), 0, 1);
        first.new_facts.push(fact(&run, 1, "compression_threshold", "2400", None));
        store.commit(first).await.unwrap();

        let mut second = RunCommit::new(run.id.clone(), 1, 1);
        second.transitions.push(FactTransition {
            fact_id: FactId(1),
            to: FactStatus::Superseded,
        });
        second
            .new_facts
            .push(fact(&run, 2, "compression_threshold", "1200", Some(1)));
        store.commit(second).await.unwrap();

        let facts = store.facts(&run.id).await.unwrap();
        assert_eq!(facts[0].status, FactStatus::Superseded);
        assert_eq!(facts[1].status, FactStatus::Active);
        assert_eq!(facts[1].supersedes, Some(FactId(1)));
    }

    #[tokio::test]
    async fn rejected_commit_rolls_back() {
        let (store, run) = store_with_run().await;
        let mut first = RunCommit::new(run.id.clone(), 0, 1);
        first.new_facts.push(fact(&run, 1, "ui", "web", None));
        store.commit(first).await.unwrap();

        let mut bad = RunCommit::new(run.id.clone(), 1, 2);
        bad.messages.push(Message::user(run.id.clone(), 2, "hello"));
        bad.new_facts.push(fact(&run, 2, "ui", "cli", None));
        let err = store.commit(bad).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Consistency(ConsistencyViolation::DuplicateActiveFact { .. })
        ));

        assert!(store.messages(&run.id).await.unwrap().is_empty());
        assert_eq!(store.get_run(&run.id).await.unwrap().unwrap().step_counter, 1);
    }

    #[tokio::test]
    async fn stale_step_rejected() {
        let (store, run) = store_with_run().await;
        store.commit(RunCommit::new(run.id.clone(), 0, 1)).await.unwrap();
        let err = store.commit(RunCommit::new(run.id.clone(), 0, 1)).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Consistency(ConsistencyViolation::StaleStep { expected: 0, found: 1 })
        ));
    }

    #[tokio::test]
    async fn schema_blocks_event_rewrites() {
        let (store, run) = store_with_run().await;
        let mut commit = RunCommit::new(run.id.clone(), 0, 1);
        commit.events.push(PendingEvent::new(1, EventKind::Critic, serde_json::json!({})));
        store.commit(commit).await.unwrap();

        let update = sqlx::query("UPDATE events SET payload = '{\"forged\":true}'")
            .execute(&store.pool)
            .await;
        assert!(update.is_err());
        let delete = sqlx::query("DELETE FROM events").execute(&store.pool).await;
        assert!(delete.is_err());
    }

    #[tokio::test]
    async fn schema_blocks_fact_value_edits_and_second_active_key() {
        let (store, run) = store_with_run().await;
        let mut commit = RunCommit::new(run.id.clone(), 0, 1);
        commit.new_facts.push(fact(&run, 1, "ui", "web", None));
        store.commit(commit).await.unwrap();

        let edit = sqlx::query("UPDATE facts SET value = 'cli' WHERE id = 1")
            .execute(&store.pool)
            .await;
        assert!(edit.is_err());

        let dup = sqlx::query(
            "INSERT INTO facts (run_id, id, version, key, value, status, step_index, agent, created_at) \
             VALUES (?1, 2, 1, 'ui', 'cli', 'active', 1, 'compression', '2026-01-01T00:00:00Z')",
        )
        .bind(run.id.as_str())
        .execute(&store.pool)
        .await;
        assert!(dup.is_err());
    }

    #[tokio::test]
    async fn file_backed_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runs.db");
        let path = path.to_str().unwrap();

        let run = Run::new("Persist me", RunConfig::default()).unwrap();
        {
            let store = SqliteStore::new(path).await.unwrap();
            store.create_run(&run).await.unwrap();
            store
                .put_ltm(LtmEntry {
                    run_id: run.id.clone(),
                    key: "owner".into(),
                    value: "platform team".into(),
                    confidence: 0.9,
                })
                .await
                .unwrap();
        }

        let store = SqliteStore::new(path).await.unwrap();
        assert!(store.get_run(&run.id).await.unwrap().is_some());
        let ltm = store.ltm(&run.id).await.unwrap();
        assert_eq!(ltm[0].value, "platform team");
    }
}
