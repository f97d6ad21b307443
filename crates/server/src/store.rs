//! Session store: transactional persistence and exact restoration of the
//! mapped event stream plus the raw hook log.
//!
//! One store instance exclusively owns one session's database. SQLite runs
//! in WAL mode for crash safety; calls hop through `spawn_blocking` so the
//! pipeline task never blocks on disk. Writes are serialized by the single
//! pipeline owner; the UNIQUE index on `feed_events.seq` is a second line
//! of defense against mapper numbering bugs, not a coordination mechanism.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use thiserror::Error;
use tracing::info;

use athena_protocol::{FeedEvent, RuntimeEvent, TranscriptSummary};

use crate::mapper::MapperCheckpoint;
use crate::time::now_iso8601;

/// Highest schema version this build understands.
const SCHEMA_VERSION: i64 = 2;

/// Numbered migrations, applied in order, additive only.
const MIGRATIONS: &[(i64, &str, &str)] = &[
    (
        1,
        "initial",
        include_str!("../../../migrations/001_initial.sql"),
    ),
    (
        2,
        "adapter_session_usage",
        include_str!("../../../migrations/002_adapter_session_usage.sql"),
    ),
];

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("database schema v{found} is newer than this build supports (v{supported})")]
    SchemaTooNew { found: i64, supported: i64 },
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("store task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("feed event {0} not found")]
    EventNotFound(String),
    #[error("session row missing for {0}")]
    SessionMissing(String),
}

/// The persisted session row.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredSession {
    pub id: String,
    pub project_dir: String,
    pub created_at: String,
    pub updated_at: String,
    pub label: Option<String>,
    pub event_count: u64,
    /// Harness sessions observed under this persisted session.
    pub adapter_session_ids: Vec<String>,
}

/// One harness session observed under this persisted session.
#[derive(Debug, Clone, PartialEq)]
pub struct AdapterSession {
    pub id: String,
    pub first_seen_at: String,
    pub last_seen_at: String,
    pub model: Option<String>,
    pub input_tokens: Option<i64>,
    pub output_tokens: Option<i64>,
}

/// Everything needed to rehydrate the mapper and the UI.
#[derive(Debug)]
pub struct RestoredSession {
    pub session: StoredSession,
    pub feed_events: Vec<FeedEvent>,
    pub adapter_sessions: Vec<AdapterSession>,
}

/// Transactional store for one session.
pub struct SessionStore {
    conn: Arc<Mutex<Connection>>,
    session_id: String,
}

impl std::fmt::Debug for SessionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionStore")
            .field("session_id", &self.session_id)
            .finish_non_exhaustive()
    }
}

impl SessionStore {
    /// Open (or create) the session database, running pending migrations.
    ///
    /// A database written by a newer build is fatal; an older one is
    /// migrated additively in place.
    pub async fn open(
        db_path: impl Into<PathBuf>,
        session_id: impl Into<String>,
        project_dir: impl Into<String>,
    ) -> Result<Self, StoreError> {
        let db_path = db_path.into();
        let session_id = session_id.into();
        let project_dir = project_dir.into();

        let open_id = session_id.clone();
        let conn = tokio::task::spawn_blocking(move || -> Result<Connection, StoreError> {
            if let Some(parent) = db_path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let conn = Connection::open(&db_path)?;
            conn.execute_batch(
                "PRAGMA journal_mode = WAL;
                 PRAGMA busy_timeout = 5000;
                 PRAGMA synchronous = NORMAL;",
            )?;
            run_migrations(&conn)?;
            ensure_session_row(&conn, &open_id, &project_dir)?;
            Ok(conn)
        })
        .await??;

        Ok(SessionStore {
            conn: Arc::new(Mutex::new(conn)),
            session_id,
        })
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Persist one runtime event and its mapped feed events atomically.
    pub async fn record_event(
        &self,
        event: &RuntimeEvent,
        feed_events: &[FeedEvent],
    ) -> Result<(), StoreError> {
        let runtime = RuntimeRow {
            request_id: event.id.clone(),
            ts: event.timestamp.clone(),
            hook_name: event.hook_name.clone(),
            adapter_session_id: Some(event.session_id.clone()),
            payload: serde_json::to_string(&event.payload)?,
        };
        let adapter = AdapterUpsert::from_event(event);
        let rows = feed_rows(feed_events)?;
        let boundary = run_boundary(feed_events);

        self.with_conn(move |conn| {
            let tx = conn.unchecked_transaction()?;
            tx.execute(
                "INSERT INTO runtime_events (request_id, ts, hook_name, adapter_session_id, payload)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    runtime.request_id,
                    runtime.ts,
                    runtime.hook_name,
                    runtime.adapter_session_id,
                    runtime.payload,
                ],
            )?;
            insert_feed_rows(&tx, &rows)?;
            bump_session(&tx, rows.len() as i64, max_seq(&rows), boundary)?;
            adapter.apply(&tx)?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    /// Persist decision-only feed events (no originating runtime event).
    pub async fn record_feed_events(&self, feed_events: &[FeedEvent]) -> Result<(), StoreError> {
        let rows = feed_rows(feed_events)?;
        let boundary = run_boundary(feed_events);

        self.with_conn(move |conn| {
            let tx = conn.unchecked_transaction()?;
            insert_feed_rows(&tx, &rows)?;
            bump_session(&tx, rows.len() as i64, max_seq(&rows), boundary)?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    /// Attach a late transcript summary to an existing event's data.
    ///
    /// `seq`, `kind`, and `cause` are untouched, so restored streams
    /// compare clean against the original.
    pub async fn attach_summary(
        &self,
        event_id: &str,
        summary: &TranscriptSummary,
    ) -> Result<(), StoreError> {
        let event_id = event_id.to_string();
        let summary_json = serde_json::to_value(summary)?;

        self.with_conn(move |conn| {
            let data: Option<String> = conn
                .query_row(
                    "SELECT data FROM feed_events WHERE event_id = ?1",
                    params![event_id],
                    |row| row.get(0),
                )
                .optional()?;
            let Some(data) = data else {
                return Err(StoreError::EventNotFound(event_id));
            };

            let mut data: Value = serde_json::from_str(&data)?;
            data["summary"] = summary_json;

            conn.execute(
                "UPDATE feed_events SET data = ?1 WHERE event_id = ?2",
                params![serde_json::to_string(&data)?, event_id],
            )?;
            Ok(())
        })
        .await
    }

    /// Reconstruct the full session in one read pass, ordered by seq.
    pub async fn restore(&self) -> Result<RestoredSession, StoreError> {
        let session_id = self.session_id.clone();

        self.with_conn(move |conn| {
            let row = conn
                .query_row(
                    "SELECT id, project_dir, label, created_at, updated_at, event_count
                     FROM session WHERE id = ?1",
                    params![session_id],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, Option<String>>(2)?,
                            row.get::<_, String>(3)?,
                            row.get::<_, String>(4)?,
                            row.get::<_, i64>(5)?,
                        ))
                    },
                )
                .optional()?;
            let Some((id, project_dir, label, created_at, updated_at, event_count)) = row else {
                return Err(StoreError::SessionMissing(session_id));
            };

            let mut stmt = conn.prepare(
                "SELECT id, first_seen_at, last_seen_at, model, input_tokens, output_tokens
                 FROM adapter_sessions ORDER BY first_seen_at, id",
            )?;
            let adapter_sessions: Vec<AdapterSession> = stmt
                .query_map([], |row| {
                    Ok(AdapterSession {
                        id: row.get(0)?,
                        first_seen_at: row.get(1)?,
                        last_seen_at: row.get(2)?,
                        model: row.get(3)?,
                        input_tokens: row.get(4)?,
                        output_tokens: row.get(5)?,
                    })
                })?
                .collect::<Result<_, _>>()?;

            let mut stmt = conn.prepare(
                "SELECT event_id, seq, ts, session_id, run_id, actor_id, level, kind,
                        title, body, cause, ui, raw, data
                 FROM feed_events ORDER BY seq",
            )?;
            let raw_rows: Vec<StoredFeedRow> = stmt
                .query_map([], |row| {
                    Ok(StoredFeedRow {
                        event_id: row.get(0)?,
                        seq: row.get(1)?,
                        ts: row.get(2)?,
                        session_id: row.get(3)?,
                        run_id: row.get(4)?,
                        actor_id: row.get(5)?,
                        level: row.get(6)?,
                        kind: row.get(7)?,
                        title: row.get(8)?,
                        body: row.get(9)?,
                        cause: row.get(10)?,
                        ui: row.get(11)?,
                        raw: row.get(12)?,
                        data: row.get(13)?,
                    })
                })?
                .collect::<Result<_, _>>()?;

            let feed_events = raw_rows
                .into_iter()
                .map(StoredFeedRow::into_feed_event)
                .collect::<Result<Vec<_>, _>>()?;

            Ok(RestoredSession {
                session: StoredSession {
                    id,
                    project_dir,
                    created_at,
                    updated_at,
                    label,
                    event_count: event_count as u64,
                    adapter_session_ids: adapter_sessions.iter().map(|a| a.id.clone()).collect(),
                },
                feed_events,
                adapter_sessions,
            })
        })
        .await
    }

    /// Recover the mapper bootstrap state.
    pub async fn checkpoint(&self) -> Result<MapperCheckpoint, StoreError> {
        let session_id = self.session_id.clone();

        self.with_conn(move |conn| {
            let counters: Option<(i64, Option<String>)> = conn
                .query_row(
                    "SELECT last_feed_seq, open_run_id FROM session WHERE id = ?1",
                    params![session_id],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;
            let (last_feed_seq, open_run) = counters.unwrap_or((0, None));

            // Databases written before the counter existed fall back to the
            // index scan.
            let max_row_seq: i64 = conn.query_row(
                "SELECT COALESCE(MAX(seq), 0) FROM feed_events",
                [],
                |row| row.get(0),
            )?;

            let mut stmt = conn.prepare(
                "SELECT kind, data FROM feed_events
                 WHERE kind IN ('subagent.start', 'subagent.stop') ORDER BY seq",
            )?;
            let scope_rows: Vec<(String, String)> = stmt
                .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<Result<_, _>>()?;

            let mut known_subagents: Vec<String> = Vec::new();
            for (kind, data) in scope_rows {
                let data: Value = serde_json::from_str(&data)?;
                let Some(agent_id) = data.get("agent_id").and_then(Value::as_str) else {
                    continue;
                };
                if kind == "subagent.start" {
                    known_subagents.push(agent_id.to_string());
                } else {
                    known_subagents.retain(|id| id != agent_id);
                }
            }

            Ok(MapperCheckpoint {
                max_seq: last_feed_seq.max(max_row_seq) as u64,
                open_run,
                known_subagents,
            })
        })
        .await
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().expect("store lock poisoned");
            f(&conn)
        })
        .await?
    }
}

// -- schema ------------------------------------------------------------

fn run_migrations(conn: &Connection) -> Result<(), StoreError> {
    let current = read_schema_version(conn)?;
    if current > SCHEMA_VERSION {
        return Err(StoreError::SchemaTooNew {
            found: current,
            supported: SCHEMA_VERSION,
        });
    }

    for (version, name, sql) in MIGRATIONS {
        if *version <= current {
            continue;
        }
        let tx = conn.unchecked_transaction()?;
        tx.execute_batch(sql)?;
        tx.execute("DELETE FROM schema_version", [])?;
        tx.execute(
            "INSERT INTO schema_version (version) VALUES (?1)",
            params![version],
        )?;
        tx.commit()?;
        info!(
            component = "store",
            event = "store.migration_applied",
            version = version,
            name = name,
            "Applied migration"
        );
    }

    Ok(())
}

fn read_schema_version(conn: &Connection) -> Result<i64, StoreError> {
    let table_exists: Option<String> = conn
        .query_row(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name = 'schema_version'",
            [],
            |row| row.get(0),
        )
        .optional()?;
    if table_exists.is_none() {
        return Ok(0);
    }

    let version: Option<i64> = conn
        .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| {
            row.get(0)
        })
        .optional()?;
    Ok(version.unwrap_or(0))
}

fn ensure_session_row(
    conn: &Connection,
    session_id: &str,
    project_dir: &str,
) -> Result<(), StoreError> {
    let now = now_iso8601();
    conn.execute(
        "INSERT INTO session (id, project_dir, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?3)
         ON CONFLICT(id) DO NOTHING",
        params![session_id, project_dir, now],
    )?;
    Ok(())
}

// -- write helpers -----------------------------------------------------

struct RuntimeRow {
    request_id: String,
    ts: String,
    hook_name: String,
    adapter_session_id: Option<String>,
    payload: String,
}

struct FeedRow {
    event_id: String,
    seq: i64,
    ts: String,
    session_id: String,
    run_id: Option<String>,
    actor_id: String,
    level: String,
    kind: String,
    title: String,
    body: Option<String>,
    cause: Option<String>,
    ui: Option<String>,
    raw: Option<String>,
    data: String,
}

/// Enrichment of the adapter-session row from one runtime event.
struct AdapterUpsert {
    id: String,
    seen_at: String,
    model: Option<String>,
    input_tokens: Option<i64>,
    output_tokens: Option<i64>,
}

impl AdapterUpsert {
    fn from_event(event: &RuntimeEvent) -> Self {
        let usage = event.payload.get("usage");
        AdapterUpsert {
            id: event.session_id.clone(),
            seen_at: event.timestamp.clone(),
            model: event
                .payload
                .get("model")
                .and_then(Value::as_str)
                .map(str::to_string),
            input_tokens: usage
                .and_then(|u| u.get("input_tokens"))
                .and_then(Value::as_i64),
            output_tokens: usage
                .and_then(|u| u.get("output_tokens"))
                .and_then(Value::as_i64),
        }
    }

    fn apply(&self, conn: &Connection) -> Result<(), StoreError> {
        conn.execute(
            "INSERT INTO adapter_sessions (id, first_seen_at, last_seen_at)
             VALUES (?1, ?2, ?2)
             ON CONFLICT(id) DO UPDATE SET last_seen_at = excluded.last_seen_at",
            params![self.id, self.seen_at],
        )?;
        conn.execute(
            "UPDATE adapter_sessions SET
               model = COALESCE(?1, model),
               input_tokens = COALESCE(?2, input_tokens),
               output_tokens = COALESCE(?3, output_tokens)
             WHERE id = ?4",
            params![self.model, self.input_tokens, self.output_tokens, self.id],
        )?;
        Ok(())
    }
}

fn feed_rows(events: &[FeedEvent]) -> Result<Vec<FeedRow>, StoreError> {
    events
        .iter()
        .map(|event| {
            let serialized = serde_json::to_value(event)?;
            Ok(FeedRow {
                event_id: event.event_id.clone(),
                seq: event.seq as i64,
                ts: event.ts.clone(),
                session_id: event.session_id.clone(),
                run_id: event.run_id.clone(),
                actor_id: event.actor_id.clone(),
                level: json_str(&serialized["level"]),
                kind: event.data.kind().to_string(),
                title: event.title.clone(),
                body: event.body.clone(),
                cause: to_opt_json(&event.cause)?,
                ui: to_opt_json(&event.ui)?,
                raw: to_opt_json(&event.raw)?,
                data: serde_json::to_string(&serialized["data"])?,
            })
        })
        .collect()
}

fn insert_feed_rows(conn: &Connection, rows: &[FeedRow]) -> Result<(), StoreError> {
    let mut stmt = conn.prepare_cached(
        "INSERT INTO feed_events
           (event_id, seq, ts, session_id, run_id, actor_id, level, kind,
            title, body, cause, ui, raw, data)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
    )?;
    for row in rows {
        stmt.execute(params![
            row.event_id,
            row.seq,
            row.ts,
            row.session_id,
            row.run_id,
            row.actor_id,
            row.level,
            row.kind,
            row.title,
            row.body,
            row.cause,
            row.ui,
            row.raw,
            row.data,
        ])?;
    }
    Ok(())
}

fn bump_session(
    conn: &Connection,
    added: i64,
    max_seq: Option<i64>,
    boundary: Option<Option<String>>,
) -> Result<(), StoreError> {
    conn.execute(
        "UPDATE session SET
           updated_at = ?1,
           event_count = event_count + ?2,
           last_feed_seq = MAX(last_feed_seq, ?3)",
        params![now_iso8601(), added, max_seq.unwrap_or(0)],
    )?;
    if let Some(open_run_id) = boundary {
        conn.execute(
            "UPDATE session SET open_run_id = ?1",
            params![open_run_id],
        )?;
    }
    Ok(())
}

fn max_seq(rows: &[FeedRow]) -> Option<i64> {
    rows.iter().map(|r| r.seq).max()
}

/// The last run boundary in this batch, if any: `Some(Some(id))` opens a
/// run, `Some(None)` closes one.
fn run_boundary(events: &[FeedEvent]) -> Option<Option<String>> {
    let mut boundary = None;
    for event in events {
        match event.data.kind() {
            "run.start" => boundary = Some(event.run_id.clone()),
            "run.end" | "session.end" => boundary = Some(None),
            _ => {}
        }
    }
    boundary
}

fn to_opt_json<T: serde::Serialize>(value: &Option<T>) -> Result<Option<String>, StoreError> {
    value
        .as_ref()
        .map(|v| serde_json::to_string(v).map_err(StoreError::from))
        .transpose()
}

fn json_str(value: &Value) -> String {
    value.as_str().unwrap_or_default().to_string()
}

// -- read helpers ------------------------------------------------------

struct StoredFeedRow {
    event_id: String,
    seq: i64,
    ts: String,
    session_id: String,
    run_id: Option<String>,
    actor_id: String,
    level: String,
    kind: String,
    title: String,
    body: Option<String>,
    cause: Option<String>,
    ui: Option<String>,
    raw: Option<String>,
    data: String,
}

impl StoredFeedRow {
    /// Recompose the serialized form and let serde rebuild the sum type,
    /// keeping restore structurally equivalent to the original events.
    fn into_feed_event(self) -> Result<FeedEvent, StoreError> {
        let mut value = serde_json::json!({
            "event_id": self.event_id,
            "seq": self.seq,
            "ts": self.ts,
            "session_id": self.session_id,
            "actor_id": self.actor_id,
            "level": self.level,
            "title": self.title,
            "kind": self.kind,
            "data": serde_json::from_str::<Value>(&self.data)?,
        });
        if let Some(run_id) = self.run_id {
            value["run_id"] = Value::String(run_id);
        }
        if let Some(body) = self.body {
            value["body"] = Value::String(body);
        }
        if let Some(cause) = self.cause {
            value["cause"] = serde_json::from_str(&cause)?;
        }
        if let Some(ui) = self.ui {
            value["ui"] = serde_json::from_str(&ui)?;
        }
        if let Some(raw) = self.raw {
            value["raw"] = serde_json::from_str(&raw)?;
        }
        Ok(serde_json::from_value(value)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapper::FeedMapper;
    use athena_protocol::{hook_interaction, hooks, EventContext};
    use std::path::Path;

    fn runtime_event(hook_name: &str, request_id: &str, payload: Value) -> RuntimeEvent {
        let tool_name = payload
            .get("tool_name")
            .and_then(Value::as_str)
            .map(str::to_string);
        RuntimeEvent {
            id: request_id.to_string(),
            timestamp: "2026-01-01T00:00:00Z".to_string(),
            hook_name: hook_name.to_string(),
            session_id: "adapter-1".to_string(),
            context: EventContext::default(),
            interaction: hook_interaction(hook_name),
            tool_name,
            tool_use_id: None,
            payload,
        }
    }

    async fn open_store(dir: &Path) -> SessionStore {
        SessionStore::open(dir.join("session.db"), "sess-1", "/work/project")
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn open_is_idempotent_and_migrated() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path()).await;
        drop(store);

        // Second open on the same file: schema already current.
        let store = open_store(dir.path()).await;
        let restored = store.restore().await.unwrap();
        assert_eq!(restored.session.id, "sess-1");
        assert_eq!(restored.session.project_dir, "/work/project");
        assert_eq!(restored.session.event_count, 0);
        assert!(restored.feed_events.is_empty());
    }

    #[tokio::test]
    async fn newer_schema_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("session.db");
        {
            let store = SessionStore::open(&db_path, "sess-1", "/p").await.unwrap();
            drop(store);
        }
        {
            let conn = Connection::open(&db_path).unwrap();
            conn.execute("UPDATE schema_version SET version = 99", [])
                .unwrap();
        }

        let err = SessionStore::open(&db_path, "sess-1", "/p")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::SchemaTooNew {
                found: 99,
                supported: SCHEMA_VERSION
            }
        ));
    }

    #[tokio::test]
    async fn record_and_restore_are_structurally_equal() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path()).await;
        let mut mapper = FeedMapper::new("sess-1");

        let stream = [
            runtime_event(hooks::SESSION_START, "r1", serde_json::json!({"model": "opus"})),
            runtime_event(
                hooks::USER_PROMPT_SUBMIT,
                "r2",
                serde_json::json!({"prompt": "do the thing"}),
            ),
            runtime_event(
                hooks::PRE_TOOL_USE,
                "r3",
                serde_json::json!({"tool_name": "Bash", "tool_input": {"command": "ls"}}),
            ),
            runtime_event("FutureHookV99", "r4", serde_json::json!({"x": 1})),
            runtime_event(hooks::SESSION_END, "r5", Value::Null),
        ];

        let mut originals = Vec::new();
        for event in &stream {
            let feed = mapper.map_event(event);
            store.record_event(event, &feed).await.unwrap();
            originals.extend(feed);
        }

        let restored = store.restore().await.unwrap();
        assert_eq!(restored.feed_events, originals);
        assert_eq!(restored.session.event_count, originals.len() as u64);
        assert_eq!(restored.session.adapter_session_ids, vec!["adapter-1"]);
        assert_eq!(restored.adapter_sessions[0].model.as_deref(), Some("opus"));
    }

    #[tokio::test]
    async fn duplicate_seq_trips_the_unique_index() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path()).await;

        let mut mapper_a = FeedMapper::new("sess-1");
        let mut mapper_b = FeedMapper::new("sess-1");
        let event = runtime_event(hooks::STOP, "r1", Value::Null);

        let feed_a = mapper_a.map_event(&event);
        let feed_b = mapper_b.map_event(&event);
        store.record_event(&event, &feed_a).await.unwrap();

        let err = store.record_event(&event, &feed_b).await.unwrap_err();
        assert!(matches!(err, StoreError::Sqlite(_)));
    }

    #[tokio::test]
    async fn checkpoint_recovers_mapper_state() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path()).await;
        let mut mapper = FeedMapper::new("sess-1");

        let stream = [
            runtime_event(
                hooks::USER_PROMPT_SUBMIT,
                "r1",
                serde_json::json!({"prompt": "go"}),
            ),
            runtime_event(
                hooks::SUBAGENT_START,
                "r2",
                serde_json::json!({"agent_id": "agent-7", "agent_type": "worker"}),
            ),
        ];
        for event in &stream {
            let feed = mapper.map_event(event);
            store.record_event(event, &feed).await.unwrap();
        }

        let checkpoint = store.checkpoint().await.unwrap();
        assert_eq!(checkpoint.max_seq, 2);
        assert_eq!(checkpoint.open_run.as_deref(), Some("r1"));
        assert_eq!(checkpoint.known_subagents, vec!["agent-7"]);

        // A resumed mapper picks up numbering with no gap or duplicate.
        let mut resumed = FeedMapper::with_checkpoint("sess-1", checkpoint);
        let next = resumed.map_event(&runtime_event(hooks::STOP, "r3", Value::Null));
        assert_eq!(next[0].seq, 3);
        assert_eq!(next[0].run_id.as_deref(), Some("r1"));
    }

    #[tokio::test]
    async fn attach_summary_patches_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path()).await;
        let mut mapper = FeedMapper::new("sess-1");

        let end = runtime_event(
            hooks::SESSION_END,
            "r1",
            serde_json::json!({"reason": "exit"}),
        );
        let feed = mapper.map_event(&end);
        store.record_event(&end, &feed).await.unwrap();
        let end_event_id = feed[0].event_id.clone();
        let end_seq = feed[0].seq;

        let summary = TranscriptSummary {
            last_assistant_text: Some("done".to_string()),
            message_count: 4,
            tool_call_count: 2,
            ..Default::default()
        };
        store.attach_summary(&end_event_id, &summary).await.unwrap();

        let restored = store.restore().await.unwrap();
        let patched = restored
            .feed_events
            .iter()
            .find(|e| e.event_id == end_event_id)
            .unwrap();
        assert_eq!(patched.seq, end_seq);
        match &patched.data {
            athena_protocol::FeedData::SessionEnd(data) => {
                assert_eq!(data.reason.as_deref(), Some("exit"));
                assert_eq!(data.summary, Some(summary));
            }
            other => panic!("expected session.end, got {}", other.kind()),
        }

        let missing = store
            .attach_summary("no-such-event", &TranscriptSummary::default())
            .await
            .unwrap_err();
        assert!(matches!(missing, StoreError::EventNotFound(_)));
    }

    #[tokio::test]
    async fn decision_only_writes_are_atomic_and_counted() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path()).await;
        let mut mapper = FeedMapper::new("sess-1");

        let request = runtime_event(
            hooks::PERMISSION_REQUEST,
            "r1",
            serde_json::json!({"tool_name": "Edit"}),
        );
        let feed = mapper.map_event(&request);
        store.record_event(&request, &feed).await.unwrap();

        let decision = athena_protocol::RuntimeDecision::json(
            athena_protocol::DecisionSource::User,
            athena_protocol::DecisionIntent::PermissionAllow,
        );
        let mapped = mapper.map_decision(&feed[0], "r1", &decision, 0).unwrap();
        store.record_feed_events(&[mapped.clone()]).await.unwrap();

        let restored = store.restore().await.unwrap();
        assert_eq!(restored.session.event_count, 2);
        assert_eq!(restored.feed_events.last().unwrap(), &mapped);
    }
}
