//! SQLite-backed [`Store`] implementation.
//!
//! A single connection guarded by an async mutex serializes all access,
//! which is what gives the per-key serializability and the compare-and-set
//! lock semantics. Transient open failures are retried with linear backoff;
//! exhausting the retry budget is fatal to construction.

use crate::Store;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use recac_core::feature::{FeatureList, FeatureStatus};
use recac_core::{AgentRole, Observation, PathLock, RecacError, RecacResult};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, warn};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS observations (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    project    TEXT NOT NULL,
    agent_id   TEXT NOT NULL,
    content    TEXT NOT NULL,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_observations_project ON observations (project, id);

CREATE TABLE IF NOT EXISTS signals (
    project TEXT NOT NULL,
    key     TEXT NOT NULL,
    value   TEXT NOT NULL,
    PRIMARY KEY (project, key)
);

CREATE TABLE IF NOT EXISTS features (
    project TEXT PRIMARY KEY,
    json    TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS locks (
    path        TEXT PRIMARY KEY,
    holder      TEXT NOT NULL,
    acquired_at INTEGER NOT NULL,
    lease_ns    INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS specs (
    project TEXT PRIMARY KEY,
    content TEXT NOT NULL
);
";

/// SQLite-backed store. See the crate docs for the coordination contract.
#[derive(Debug)]
pub struct SqliteStore {
    conn: Mutex<Option<Connection>>,
    path: PathBuf,
}

impl SqliteStore {
    /// Open (or create) the database at `path`, retrying transient failures
    /// up to 6 attempts with ~5s linear backoff.
    pub async fn open(path: impl AsRef<Path>) -> RecacResult<Self> {
        Self::open_with(path, 6, Duration::from_secs(5)).await
    }

    /// Open with an explicit retry budget and backoff unit.
    pub async fn open_with(
        path: impl AsRef<Path>,
        attempts: u32,
        backoff: Duration,
    ) -> RecacResult<Self> {
        let path = path.as_ref().to_path_buf();
        let mut last_err = String::new();
        for attempt in 1..=attempts.max(1) {
            match Self::try_open(&path) {
                Ok(conn) => {
                    debug!(path = %path.display(), attempt, "store opened");
                    return Ok(Self {
                        conn: Mutex::new(Some(conn)),
                        path,
                    });
                }
                Err(e) => {
                    last_err = e.to_string();
                    warn!(path = %path.display(), attempt, error = %last_err, "store open failed");
                    if attempt < attempts {
                        tokio::time::sleep(backoff * attempt).await;
                    }
                }
            }
        }
        Err(RecacError::Store(format!(
            "cannot open {} after {attempts} attempts: {last_err}",
            path.display()
        )))
    }

    /// In-memory database for tests.
    pub async fn open_in_memory() -> RecacResult<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| RecacError::Store(format!("cannot open in-memory db: {e}")))?;
        conn.execute_batch(SCHEMA)
            .map_err(|e| RecacError::Store(format!("schema init failed: {e}")))?;
        Ok(Self {
            conn: Mutex::new(Some(conn)),
            path: PathBuf::from(":memory:"),
        })
    }

    /// Filesystem path of the database.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn try_open(path: &Path) -> rusqlite::Result<Connection> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "busy_timeout", 5000)?;
        conn.execute_batch(SCHEMA)?;
        Ok(conn)
    }

    async fn with_conn<T>(
        &self,
        f: impl FnOnce(&Connection) -> rusqlite::Result<T>,
    ) -> RecacResult<T> {
        let guard = self.conn.lock().await;
        let conn = guard
            .as_ref()
            .ok_or_else(|| RecacError::Store("store is closed".into()))?;
        f(conn).map_err(|e| RecacError::Store(e.to_string()))
    }
}

fn nanos(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_nanos_opt().unwrap_or(i64::MAX)
}

fn from_nanos(n: i64) -> DateTime<Utc> {
    Utc.timestamp_nanos(n)
}

fn lock_is_live(acquired_ns: i64, lease_ns: i64, now: DateTime<Utc>) -> bool {
    nanos(now) < acquired_ns.saturating_add(lease_ns)
}

#[async_trait]
impl Store for SqliteStore {
    async fn save_observation(
        &self,
        project: &str,
        role: AgentRole,
        content: &str,
    ) -> RecacResult<()> {
        let created_at = Utc::now().to_rfc3339();
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO observations (project, agent_id, content, created_at) VALUES (?1, ?2, ?3, ?4)",
                params![project, role.to_string(), content, created_at],
            )
            .map(|_| ())
        })
        .await
    }

    async fn query_history(&self, project: &str, limit: usize) -> RecacResult<Vec<Observation>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT project, agent_id, content, created_at FROM observations
                 WHERE project = ?1 ORDER BY id DESC LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![project, limit as i64], |row| {
                let role_str: String = row.get(1)?;
                let created: String = row.get(3)?;
                Ok((row.get::<_, String>(0)?, role_str, row.get::<_, String>(2)?, created))
            })?;
            let mut out = Vec::new();
            for row in rows {
                let (project, role_str, content, created) = row?;
                out.push(Observation {
                    project,
                    role: role_str.parse().unwrap_or(AgentRole::System),
                    content,
                    created_at: DateTime::parse_from_rfc3339(&created)
                        .map(|t| t.with_timezone(&Utc))
                        .unwrap_or_else(|_| Utc::now()),
                });
            }
            Ok(out)
        })
        .await
    }

    async fn get_signal(&self, project: &str, key: &str) -> RecacResult<Option<String>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT value FROM signals WHERE project = ?1 AND key = ?2",
                params![project, key],
                |row| row.get(0),
            )
            .optional()
        })
        .await
    }

    async fn set_signal(&self, project: &str, key: &str, value: &str) -> RecacResult<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO signals (project, key, value) VALUES (?1, ?2, ?3)",
                params![project, key, value],
            )
            .map(|_| ())
        })
        .await
    }

    async fn delete_signal(&self, project: &str, key: &str) -> RecacResult<()> {
        self.with_conn(|conn| {
            conn.execute(
                "DELETE FROM signals WHERE project = ?1 AND key = ?2",
                params![project, key],
            )
            .map(|_| ())
        })
        .await
    }

    async fn save_features(&self, project: &str, json: &str) -> RecacResult<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO features (project, json) VALUES (?1, ?2)",
                params![project, json],
            )
            .map(|_| ())
        })
        .await
    }

    async fn get_features(&self, project: &str) -> RecacResult<Option<String>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT json FROM features WHERE project = ?1",
                params![project],
                |row| row.get(0),
            )
            .optional()
        })
        .await
    }

    async fn update_feature_status(
        &self,
        project: &str,
        id: &str,
        status: FeatureStatus,
        passes: bool,
    ) -> RecacResult<()> {
        let json = self
            .get_features(project)
            .await?
            .ok_or_else(|| RecacError::Store(format!("no feature list for project {project}")))?;
        let mut list = FeatureList::from_json(&json)?;
        let feature = list
            .get_mut(id)
            .ok_or_else(|| RecacError::Store(format!("unknown feature id {id}")))?;
        feature.status = status;
        feature.passes = passes;
        let updated = list.to_json()?;
        self.save_features(project, &updated).await
    }

    async fn acquire_lock(&self, path: &str, holder: &str, lease: Duration) -> RecacResult<bool> {
        let now = Utc::now();
        let lease_ns = lease.as_nanos().min(i64::MAX as u128) as i64;
        self.with_conn(|conn| {
            let existing: Option<(String, i64, i64)> = conn
                .query_row(
                    "SELECT holder, acquired_at, lease_ns FROM locks WHERE path = ?1",
                    params![path],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                )
                .optional()?;

            if let Some((owner, acquired_ns, existing_lease)) = existing {
                if owner != holder && lock_is_live(acquired_ns, existing_lease, now) {
                    return Ok(false);
                }
            }

            conn.execute(
                "INSERT OR REPLACE INTO locks (path, holder, acquired_at, lease_ns) VALUES (?1, ?2, ?3, ?4)",
                params![path, holder, nanos(now), lease_ns],
            )?;
            Ok(true)
        })
        .await
    }

    async fn release_lock(&self, path: &str, holder: &str) -> RecacResult<()> {
        self.with_conn(|conn| {
            conn.execute(
                "DELETE FROM locks WHERE path = ?1 AND holder = ?2",
                params![path, holder],
            )
            .map(|_| ())
        })
        .await
    }

    async fn get_active_locks(&self) -> RecacResult<Vec<PathLock>> {
        let now = Utc::now();
        self.with_conn(|conn| {
            conn.execute(
                "DELETE FROM locks WHERE acquired_at + lease_ns <= ?1",
                params![nanos(now)],
            )?;
            let mut stmt =
                conn.prepare("SELECT path, holder, acquired_at, lease_ns FROM locks")?;
            let rows = stmt.query_map([], |row| {
                Ok(PathLock {
                    path: row.get(0)?,
                    holder: row.get(1)?,
                    acquired_at: from_nanos(row.get(2)?),
                    lease: Duration::from_nanos(row.get::<_, i64>(3)?.max(0) as u64),
                })
            })?;
            rows.collect()
        })
        .await
    }

    async fn release_all_locks(&self, holder: &str) -> RecacResult<()> {
        self.with_conn(|conn| {
            conn.execute("DELETE FROM locks WHERE holder = ?1", params![holder])
                .map(|_| ())
        })
        .await
    }

    async fn save_spec(&self, project: &str, content: &str) -> RecacResult<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO specs (project, content) VALUES (?1, ?2)",
                params![project, content],
            )
            .map(|_| ())
        })
        .await
    }

    async fn get_spec(&self, project: &str) -> RecacResult<Option<String>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT content FROM specs WHERE project = ?1",
                params![project],
                |row| row.get(0),
            )
            .optional()
        })
        .await
    }

    async fn prune_observations(&self, project: &str, keep: usize) -> RecacResult<()> {
        self.with_conn(|conn| {
            conn.execute(
                "DELETE FROM observations WHERE project = ?1 AND id NOT IN (
                     SELECT id FROM observations WHERE project = ?1 ORDER BY id DESC LIMIT ?2
                 )",
                params![project, keep as i64],
            )
            .map(|_| ())
        })
        .await
    }

    async fn close(&self) -> RecacResult<()> {
        let mut guard = self.conn.lock().await;
        if let Some(conn) = guard.take() {
            conn.close()
                .map_err(|(_, e)| RecacError::Store(format!("close failed: {e}")))?;
        }
        Ok(())
    }
}
