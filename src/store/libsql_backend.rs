//! libSQL implementation of the async `Store` trait.
//!
//! File-backed stores run in WAL mode and hand every operation its own
//! connection, so readers never wait on the writer. Writes are serialized
//! through a single in-process lock and each one commits before returning.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::StoreError;
use crate::store::migrations;
use crate::store::traits::{AgentRecord, Run, RunStatus, Store};

/// libSQL storage backend.
pub struct LibSqlStore {
    db: Arc<LibSqlDatabase>,
    /// In-memory databases exist only per connection, so they keep one.
    shared: Option<Connection>,
    write_lock: Mutex<()>,
}

impl LibSqlStore {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| StoreError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let store = Self {
            db: Arc::new(db),
            shared: None,
            write_lock: Mutex::new(()),
        };
        {
            let conn = store.conn().await?;
            pragma(&conn, "PRAGMA journal_mode=WAL").await?;
        }
        store.init_schema().await?;
        info!(path = %path.display(), "Database opened");
        Ok(store)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, StoreError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| StoreError::Pool(format!("Failed to create in-memory database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| StoreError::Pool(format!("Failed to create connection: {e}")))?;
        pragma(&conn, "PRAGMA foreign_keys=ON").await?;

        let store = Self {
            db: Arc::new(db),
            shared: Some(conn),
            write_lock: Mutex::new(()),
        };
        store.init_schema().await?;
        Ok(store)
    }

    /// A connection for the calling worker.
    async fn conn(&self) -> Result<Connection, StoreError> {
        if let Some(conn) = &self.shared {
            return Ok(conn.clone());
        }
        let conn = self
            .db
            .connect()
            .map_err(|e| StoreError::Pool(format!("Failed to create connection: {e}")))?;
        pragma(&conn, "PRAGMA foreign_keys=ON").await?;
        pragma(&conn, "PRAGMA busy_timeout=5000").await?;
        Ok(conn)
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Run a PRAGMA, discarding whatever row it reports back.
async fn pragma(conn: &Connection, sql: &str) -> Result<(), StoreError> {
    let mut rows = conn
        .query(sql, ())
        .await
        .map_err(|e| StoreError::Pool(format!("{sql}: {e}")))?;
    while rows
        .next()
        .await
        .map_err(|e| StoreError::Pool(format!("{sql}: {e}")))?
        .is_some()
    {}
    Ok(())
}

/// Fixed-width RFC 3339 so that text order equals time order.
fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_optional_datetime(s: &Option<String>) -> Option<DateTime<Utc>> {
    s.as_ref().map(|s| parse_datetime(s))
}

/// Convert `Option<&str>` to libsql Value.
/// Row limits beyond `i64::MAX` mean "all rows".
fn sql_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

fn opt_real(v: Option<f64>) -> libsql::Value {
    match v {
        Some(v) => libsql::Value::Real(v),
        None => libsql::Value::Null,
    }
}

const RUN_COLUMNS: &str =
    "id, agent, status, result, output, error, started_at, finished_at, duration_ms";

const UPSERT_STATE: &str = "INSERT INTO agent_state (agent, key, value, updated_at) VALUES (?1, ?2, ?3, ?4)
     ON CONFLICT(agent, key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at";

/// Map a libsql Row to a Run. Column order matches RUN_COLUMNS.
fn row_to_run(row: &libsql::Row) -> Result<Run, StoreError> {
    let status_str: String = row
        .get(2)
        .map_err(|e| StoreError::Query(format!("run status: {e}")))?;
    let started_str: String = row
        .get(6)
        .map_err(|e| StoreError::Query(format!("run started_at: {e}")))?;
    let finished_str: Option<String> = row.get::<String>(7).ok();

    Ok(Run {
        id: row
            .get(0)
            .map_err(|e| StoreError::Query(format!("run id: {e}")))?,
        agent: row
            .get(1)
            .map_err(|e| StoreError::Query(format!("run agent: {e}")))?,
        status: status_str.parse().map_err(StoreError::Serialization)?,
        result: row.get::<String>(3).ok(),
        output: row.get::<String>(4).ok(),
        error: row.get::<String>(5).ok(),
        started_at: parse_datetime(&started_str),
        finished_at: parse_optional_datetime(&finished_str),
        duration_ms: row.get::<f64>(8).ok(),
    })
}

fn row_to_agent(row: &libsql::Row) -> Result<AgentRecord, StoreError> {
    let retries: i64 = row.get(2).unwrap_or(0);
    let created_str: String = row.get(3).unwrap_or_default();
    let updated_str: String = row.get(4).unwrap_or_default();
    Ok(AgentRecord {
        name: row
            .get(0)
            .map_err(|e| StoreError::Query(format!("agent name: {e}")))?,
        schedule: row.get::<String>(1).ok(),
        retries: retries.max(0) as u32,
        created_at: parse_datetime(&created_str),
        updated_at: parse_datetime(&updated_str),
    })
}

async fn collect_runs(mut rows: libsql::Rows, op: &str) -> Result<Vec<Run>, StoreError> {
    let mut runs = Vec::new();
    while let Some(row) = rows
        .next()
        .await
        .map_err(|e| StoreError::Query(format!("{op}: {e}")))?
    {
        runs.push(row_to_run(&row)?);
    }
    Ok(runs)
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl Store for LibSqlStore {
    async fn init_schema(&self) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        let conn = self.conn().await?;
        migrations::run_migrations(&conn).await
    }

    // ── Agents ──────────────────────────────────────────────────────

    async fn sync_agent(
        &self,
        name: &str,
        schedule: Option<&str>,
        retries: u32,
    ) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        let conn = self.conn().await?;
        let now = format_datetime(&Utc::now());
        conn.execute(
            "INSERT INTO agents (name, schedule, retries, created_at, updated_at) VALUES (?1, ?2, ?3, ?4, ?4)
             ON CONFLICT(name) DO UPDATE SET
               schedule = excluded.schedule,
               retries = excluded.retries,
               updated_at = excluded.updated_at",
            params![name, opt_text(schedule), retries as i64, now],
        )
        .await
        .map_err(|e| StoreError::Query(format!("sync_agent: {e}")))?;

        debug!(agent = name, "Agent synced");
        Ok(())
    }

    async fn list_agents(&self) -> Result<Vec<AgentRecord>, StoreError> {
        let conn = self.conn().await?;
        let mut rows = conn
            .query(
                "SELECT name, schedule, retries, created_at, updated_at FROM agents ORDER BY name",
                (),
            )
            .await
            .map_err(|e| StoreError::Query(format!("list_agents: {e}")))?;

        let mut agents = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| StoreError::Query(format!("list_agents: {e}")))?
        {
            agents.push(row_to_agent(&row)?);
        }
        Ok(agents)
    }

    // ── Runs ────────────────────────────────────────────────────────

    async fn insert_run(&self, run: &Run) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        let conn = self.conn().await?;
        conn.execute(
            &format!("INSERT INTO runs ({RUN_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"),
            params![
                run.id.as_str(),
                run.agent.as_str(),
                run.status.to_string(),
                opt_text(run.result.as_deref()),
                opt_text(run.output.as_deref()),
                opt_text(run.error.as_deref()),
                format_datetime(&run.started_at),
                opt_text(run.finished_at.map(|t| format_datetime(&t)).as_deref()),
                opt_real(run.duration_ms),
            ],
        )
        .await
        .map_err(|e| StoreError::Query(format!("insert_run: {e}")))?;

        debug!(run_id = %run.id, agent = %run.agent, "Run inserted");
        Ok(())
    }

    async fn update_run(&self, run: &Run) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        let conn = self.conn().await?;
        conn.execute(
            "UPDATE runs SET status = ?1, result = ?2, output = ?3, error = ?4, finished_at = ?5, duration_ms = ?6
             WHERE id = ?7",
            params![
                run.status.to_string(),
                opt_text(run.result.as_deref()),
                opt_text(run.output.as_deref()),
                opt_text(run.error.as_deref()),
                opt_text(run.finished_at.map(|t| format_datetime(&t)).as_deref()),
                opt_real(run.duration_ms),
                run.id.as_str(),
            ],
        )
        .await
        .map_err(|e| StoreError::Query(format!("update_run: {e}")))?;

        debug!(run_id = %run.id, status = %run.status, "Run updated");
        Ok(())
    }

    async fn get_run(&self, id: &str) -> Result<Option<Run>, StoreError> {
        let conn = self.conn().await?;
        let mut rows = conn
            .query(
                &format!("SELECT {RUN_COLUMNS} FROM runs WHERE id = ?1"),
                params![id],
            )
            .await
            .map_err(|e| StoreError::Query(format!("get_run: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_run(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(StoreError::Query(format!("get_run: {e}"))),
        }
    }

    async fn get_runs(&self, agent: &str, limit: usize) -> Result<Vec<Run>, StoreError> {
        let conn = self.conn().await?;
        let rows = conn
            .query(
                &format!(
                    "SELECT {RUN_COLUMNS} FROM runs WHERE agent = ?1 ORDER BY started_at DESC LIMIT ?2"
                ),
                params![agent, sql_limit(limit)],
            )
            .await
            .map_err(|e| StoreError::Query(format!("get_runs: {e}")))?;
        collect_runs(rows, "get_runs").await
    }

    async fn get_all_runs(&self, limit: usize) -> Result<Vec<Run>, StoreError> {
        let conn = self.conn().await?;
        let rows = conn
            .query(
                &format!("SELECT {RUN_COLUMNS} FROM runs ORDER BY started_at DESC LIMIT ?1"),
                params![sql_limit(limit)],
            )
            .await
            .map_err(|e| StoreError::Query(format!("get_all_runs: {e}")))?;
        collect_runs(rows, "get_all_runs").await
    }

    // ── State ───────────────────────────────────────────────────────

    async fn get_state(
        &self,
        agent: &str,
    ) -> Result<HashMap<String, serde_json::Value>, StoreError> {
        let conn = self.conn().await?;
        let mut rows = conn
            .query(
                "SELECT key, value FROM agent_state WHERE agent = ?1",
                params![agent],
            )
            .await
            .map_err(|e| StoreError::Query(format!("get_state: {e}")))?;

        let mut state = HashMap::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| StoreError::Query(format!("get_state: {e}")))?
        {
            let key: String = row
                .get(0)
                .map_err(|e| StoreError::Query(format!("get_state key: {e}")))?;
            let raw: String = row
                .get(1)
                .map_err(|e| StoreError::Query(format!("get_state value: {e}")))?;
            let value = serde_json::from_str(&raw).map_err(|e| {
                StoreError::Serialization(format!("state {agent}.{key}: {e}"))
            })?;
            state.insert(key, value);
        }
        Ok(state)
    }

    async fn set_state(
        &self,
        agent: &str,
        key: &str,
        value: &serde_json::Value,
    ) -> Result<(), StoreError> {
        let text =
            serde_json::to_string(value).map_err(|e| StoreError::Serialization(e.to_string()))?;
        let _guard = self.write_lock.lock().await;
        let conn = self.conn().await?;
        conn.execute(
            UPSERT_STATE,
            params![agent, key, text, format_datetime(&Utc::now())],
        )
        .await
        .map_err(|e| StoreError::Query(format!("set_state: {e}")))?;
        Ok(())
    }

    async fn set_state_bulk(
        &self,
        agent: &str,
        entries: &HashMap<String, serde_json::Value>,
    ) -> Result<(), StoreError> {
        if entries.is_empty() {
            return Ok(());
        }
        let encoded = entries
            .iter()
            .map(|(key, value)| {
                serde_json::to_string(value)
                    .map(|text| (key.as_str(), text))
                    .map_err(|e| StoreError::Serialization(format!("state {agent}.{key}: {e}")))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let _guard = self.write_lock.lock().await;
        let conn = self.conn().await?;
        let now = format_datetime(&Utc::now());
        let tx = conn
            .transaction()
            .await
            .map_err(|e| StoreError::Query(format!("set_state_bulk begin: {e}")))?;
        for (key, text) in encoded {
            tx.execute(UPSERT_STATE, params![agent, key, text, now.as_str()])
                .await
                .map_err(|e| StoreError::Query(format!("set_state_bulk: {e}")))?;
        }
        tx.commit()
            .await
            .map_err(|e| StoreError::Query(format!("set_state_bulk commit: {e}")))?;

        debug!(agent, keys = entries.len(), "State upserted");
        Ok(())
    }

    async fn delete_state_keys(
        &self,
        agent: &str,
        keys: &HashSet<String>,
    ) -> Result<(), StoreError> {
        if keys.is_empty() {
            return Ok(());
        }
        let _guard = self.write_lock.lock().await;
        let conn = self.conn().await?;
        let tx = conn
            .transaction()
            .await
            .map_err(|e| StoreError::Query(format!("delete_state_keys begin: {e}")))?;
        for key in keys {
            tx.execute(
                "DELETE FROM agent_state WHERE agent = ?1 AND key = ?2",
                params![agent, key.as_str()],
            )
            .await
            .map_err(|e| StoreError::Query(format!("delete_state_keys: {e}")))?;
        }
        tx.commit()
            .await
            .map_err(|e| StoreError::Query(format!("delete_state_keys commit: {e}")))?;

        debug!(agent, keys = keys.len(), "State keys deleted");
        Ok(())
    }
}
