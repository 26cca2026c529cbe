// ABOUTME: SQLite-backed registry, command queue and backlog sharing one pool
// ABOUTME: Ownership commits run in a transaction that re-checks the observed owners and loads

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions},
    Row, Sqlite, SqlitePool, Transaction,
};
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::backlog::ChannelBacklog;
use crate::channel::Channel;
use crate::command::Command;
use crate::error::{QueueError, RegistryError};
use crate::process::{sort_by_registration, ProcessId, ProcessState, SupervisorProcess};
use crate::queue::CommandQueue;
use crate::registry::{check_load, check_owner, Assignment, ProcessRegistry};

/// Durable store for processes, ownership, pending commands and the backlog
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

#[derive(sqlx::FromRow)]
struct ProcessRow {
    id: String,
    supervisor: String,
    state: String,
    created_at: String,
    last_heartbeat_at: String,
}

impl ProcessRow {
    fn into_process(self) -> Result<SupervisorProcess, RegistryError> {
        Ok(SupervisorProcess {
            id: self
                .id
                .parse()
                .map_err(|e| RegistryError::Corrupt(format!("process id {:?}: {e}", self.id)))?,
            supervisor: self.supervisor,
            state: self.state.parse().map_err(RegistryError::Corrupt)?,
            created_at: parse_timestamp(&self.created_at)?,
            last_heartbeat_at: parse_timestamp(&self.last_heartbeat_at)?,
            channels: Default::default(),
        })
    }
}

/// Fixed-width RFC 3339 so that text order matches time order
fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, RegistryError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RegistryError::Corrupt(format!("timestamp {raw:?}: {e}")))
}

/// SQLITE_BUSY / SQLITE_LOCKED mean another writer got there first
fn classify(err: sqlx::Error) -> RegistryError {
    if let Some(db) = err.as_database_error() {
        if matches!(db.code().as_deref(), Some("5" | "6" | "517")) {
            return RegistryError::Conflict(db.message().to_string());
        }
    }
    RegistryError::Storage(err)
}

impl SqliteStore {
    /// Open or create the store at the given path
    pub async fn open(path: &Path) -> anyhow::Result<Self> {
        use anyhow::Context;

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("creating directory: {}", parent.display()))?;
            }
        }

        let url = format!("sqlite:{}?mode=rwc", path.display());
        let options = SqliteConnectOptions::from_str(&url)?
            .foreign_keys(true)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .with_context(|| format!("opening database: {}", path.display()))?;

        let store = Self { pool };
        store.init_schema().await.context("initializing schema")?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS processes (
                id TEXT PRIMARY KEY,
                supervisor TEXT NOT NULL,
                state TEXT NOT NULL,
                created_at TEXT NOT NULL,
                last_heartbeat_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_processes_order ON processes(created_at, id);

            CREATE TABLE IF NOT EXISTS process_channels (
                process_id TEXT NOT NULL,
                channel TEXT NOT NULL,
                PRIMARY KEY (process_id, channel),
                FOREIGN KEY (process_id) REFERENCES processes(id) ON DELETE CASCADE
            );
            CREATE INDEX IF NOT EXISTS idx_process_channels_channel ON process_channels(channel);

            CREATE TABLE IF NOT EXISTS commands (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                process_id TEXT NOT NULL,
                payload TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_commands_process ON commands(process_id, seq);

            CREATE TABLE IF NOT EXISTS channel_backlog (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                channel TEXT NOT NULL UNIQUE
            );
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn channels_of(&self, id: &str) -> Result<Vec<Channel>, RegistryError> {
        let rows = sqlx::query("SELECT channel FROM process_channels WHERE process_id = ?")
            .bind(id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| {
                let raw: String = row.get("channel");
                Channel::parse(&raw).map_err(|e| RegistryError::Corrupt(e.to_string()))
            })
            .collect()
    }
}

async fn owner_tx(
    tx: &mut Transaction<'_, Sqlite>,
    channel: &Channel,
) -> Result<Option<ProcessId>, RegistryError> {
    let row = sqlx::query(
        r#"
        SELECT pc.process_id FROM process_channels pc
        JOIN processes p ON p.id = pc.process_id
        WHERE pc.channel = ?
        ORDER BY p.created_at, p.id
        LIMIT 1
        "#,
    )
    .bind(channel.as_str())
    .fetch_optional(&mut **tx)
    .await
    .map_err(classify)?;

    row.map(|r| {
        let raw: String = r.get("process_id");
        raw.parse()
            .map_err(|e| RegistryError::Corrupt(format!("process id {raw:?}: {e}")))
    })
    .transpose()
}

async fn exists_tx(
    tx: &mut Transaction<'_, Sqlite>,
    id: ProcessId,
) -> Result<bool, RegistryError> {
    let row = sqlx::query("SELECT 1 FROM processes WHERE id = ?")
        .bind(id.to_string())
        .fetch_optional(&mut **tx)
        .await
        .map_err(classify)?;
    Ok(row.is_some())
}

async fn load_tx(
    tx: &mut Transaction<'_, Sqlite>,
    id: ProcessId,
) -> Result<usize, RegistryError> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM process_channels WHERE process_id = ?")
        .bind(id.to_string())
        .fetch_one(&mut **tx)
        .await
        .map_err(classify)?;
    usize::try_from(count).map_err(|_| RegistryError::Corrupt(format!("channel count {count}")))
}

#[async_trait]
impl ProcessRegistry for SqliteStore {
    async fn register(&self, process: SupervisorProcess) -> Result<(), RegistryError> {
        let mut tx = self.pool.begin().await.map_err(classify)?;
        if exists_tx(&mut tx, process.id).await? {
            return Err(RegistryError::AlreadyExists(process.id));
        }

        sqlx::query(
            "INSERT INTO processes (id, supervisor, state, created_at, last_heartbeat_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(process.id.to_string())
        .bind(&process.supervisor)
        .bind(process.state.as_str())
        .bind(format_timestamp(process.created_at))
        .bind(format_timestamp(process.last_heartbeat_at))
        .execute(&mut *tx)
        .await
        .map_err(classify)?;

        for channel in &process.channels {
            if let Some(owner) = owner_tx(&mut tx, channel).await? {
                return Err(RegistryError::Conflict(format!(
                    "{channel} is already owned by {owner}"
                )));
            }
            sqlx::query("INSERT INTO process_channels (process_id, channel) VALUES (?, ?)")
                .bind(process.id.to_string())
                .bind(channel.as_str())
                .execute(&mut *tx)
                .await
                .map_err(classify)?;
        }

        tx.commit().await.map_err(classify)?;
        Ok(())
    }

    async fn heartbeat(
        &self,
        id: ProcessId,
        state: ProcessState,
        at: DateTime<Utc>,
    ) -> Result<(), RegistryError> {
        let result =
            sqlx::query("UPDATE processes SET state = ?, last_heartbeat_at = ? WHERE id = ?")
                .bind(state.as_str())
                .bind(format_timestamp(at))
                .bind(id.to_string())
                .execute(&self.pool)
                .await
                .map_err(classify)?;
        if result.rows_affected() == 0 {
            return Err(RegistryError::NotFound(id));
        }
        Ok(())
    }

    async fn get(&self, id: ProcessId) -> Result<Option<SupervisorProcess>, RegistryError> {
        let row = sqlx::query_as::<_, ProcessRow>(
            "SELECT id, supervisor, state, created_at, last_heartbeat_at FROM processes WHERE id = ?",
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let raw_id = row.id.clone();
        let mut process = row.into_process()?;
        process.channels = self.channels_of(&raw_id).await?.into_iter().collect();
        Ok(Some(process))
    }

    async fn list(&self) -> Result<Vec<SupervisorProcess>, RegistryError> {
        let rows = sqlx::query_as::<_, ProcessRow>(
            "SELECT id, supervisor, state, created_at, last_heartbeat_at FROM processes ORDER BY created_at, id",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut processes: Vec<SupervisorProcess> = rows
            .into_iter()
            .map(ProcessRow::into_process)
            .collect::<Result<_, _>>()?;

        let by_id: HashMap<ProcessId, usize> = processes
            .iter()
            .enumerate()
            .map(|(i, p)| (p.id, i))
            .collect();

        let ownership = sqlx::query("SELECT process_id, channel FROM process_channels")
            .fetch_all(&self.pool)
            .await?;
        for row in ownership {
            let raw_id: String = row.get("process_id");
            let raw_channel: String = row.get("channel");
            let Ok(id) = raw_id.parse::<ProcessId>() else {
                continue;
            };
            if let Some(&index) = by_id.get(&id) {
                let channel = Channel::parse(&raw_channel)
                    .map_err(|e| RegistryError::Corrupt(e.to_string()))?;
                processes[index].channels.insert(channel);
            }
        }

        sort_by_registration(&mut processes);
        Ok(processes)
    }

    async fn remove(&self, id: ProcessId) -> Result<bool, RegistryError> {
        let mut tx = self.pool.begin().await.map_err(classify)?;
        sqlx::query("DELETE FROM commands WHERE process_id = ?")
            .bind(id.to_string())
            .execute(&mut *tx)
            .await
            .map_err(classify)?;
        let result = sqlx::query("DELETE FROM processes WHERE id = ?")
            .bind(id.to_string())
            .execute(&mut *tx)
            .await
            .map_err(classify)?;
        tx.commit().await.map_err(classify)?;
        Ok(result.rows_affected() > 0)
    }

    async fn owners(
        &self,
        channels: &[Channel],
    ) -> Result<HashMap<Channel, ProcessId>, RegistryError> {
        let mut tx = self.pool.begin().await.map_err(classify)?;
        let mut owners = HashMap::new();
        for channel in channels {
            if let Some(owner) = owner_tx(&mut tx, channel).await? {
                owners.insert(channel.clone(), owner);
            }
        }
        tx.commit().await.map_err(classify)?;
        Ok(owners)
    }

    async fn commit(&self, assignments: &[Assignment]) -> Result<(), RegistryError> {
        let mut tx = self.pool.begin().await.map_err(classify)?;

        // Validate against the state inside this transaction before writing,
        // so later assignments do not see the batch's own inserts.
        for assignment in assignments {
            if !exists_tx(&mut tx, assignment.process_id).await? {
                return Err(RegistryError::NotFound(assignment.process_id));
            }
            check_load(assignment, load_tx(&mut tx, assignment.process_id).await?)?;
            check_owner(assignment, owner_tx(&mut tx, &assignment.channel).await?)?;
        }

        for assignment in assignments {
            if let Some(previous) = assignment.previous_owner {
                if previous != assignment.process_id {
                    sqlx::query(
                        "DELETE FROM process_channels WHERE process_id = ? AND channel = ?",
                    )
                    .bind(previous.to_string())
                    .bind(assignment.channel.as_str())
                    .execute(&mut *tx)
                    .await
                    .map_err(classify)?;
                }
            }

            sqlx::query("INSERT OR IGNORE INTO process_channels (process_id, channel) VALUES (?, ?)")
                .bind(assignment.process_id.to_string())
                .bind(assignment.channel.as_str())
                .execute(&mut *tx)
                .await
                .map_err(classify)?;
        }

        tx.commit().await.map_err(classify)?;
        Ok(())
    }

    async fn remove_channel(
        &self,
        id: ProcessId,
        channel: &Channel,
    ) -> Result<bool, RegistryError> {
        let mut tx = self.pool.begin().await.map_err(classify)?;
        if !exists_tx(&mut tx, id).await? {
            return Err(RegistryError::NotFound(id));
        }
        let result = sqlx::query("DELETE FROM process_channels WHERE process_id = ? AND channel = ?")
            .bind(id.to_string())
            .bind(channel.as_str())
            .execute(&mut *tx)
            .await
            .map_err(classify)?;
        tx.commit().await.map_err(classify)?;
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl CommandQueue for SqliteStore {
    async fn enqueue(&self, process_id: ProcessId, command: Command) -> Result<(), QueueError> {
        let payload = serde_json::to_string(&command)?;
        sqlx::query("INSERT INTO commands (process_id, payload, created_at) VALUES (?, ?, ?)")
            .bind(process_id.to_string())
            .bind(payload)
            .bind(format_timestamp(command.issued_at))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn pending(&self, process_id: ProcessId) -> Result<Vec<Command>, QueueError> {
        let mut tx = self.pool.begin().await?;
        let rows = sqlx::query(
            "SELECT seq, payload FROM commands WHERE process_id = ? ORDER BY seq ASC",
        )
        .bind(process_id.to_string())
        .fetch_all(&mut *tx)
        .await?;

        let Some(last) = rows.last().map(|row| row.get::<i64, _>("seq")) else {
            return Ok(Vec::new());
        };

        let commands = rows
            .iter()
            .map(|row| serde_json::from_str::<Command>(row.get::<&str, _>("payload")))
            .collect::<Result<Vec<_>, _>>()?;

        sqlx::query("DELETE FROM commands WHERE process_id = ? AND seq <= ?")
            .bind(process_id.to_string())
            .bind(last)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(commands)
    }
}

#[async_trait]
impl ChannelBacklog for SqliteStore {
    async fn push(&self, channels: &[Channel]) -> Result<(), QueueError> {
        let mut tx = self.pool.begin().await?;
        for channel in channels {
            sqlx::query("INSERT OR IGNORE INTO channel_backlog (channel) VALUES (?)")
                .bind(channel.as_str())
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn take_all(&self) -> Result<Vec<Channel>, QueueError> {
        let mut tx = self.pool.begin().await?;
        let rows = sqlx::query("SELECT seq, channel FROM channel_backlog ORDER BY seq ASC")
            .fetch_all(&mut *tx)
            .await?;

        let Some(last) = rows.last().map(|row| row.get::<i64, _>("seq")) else {
            return Ok(Vec::new());
        };

        let mut channels = Vec::with_capacity(rows.len());
        for row in &rows {
            let raw: &str = row.get("channel");
            match Channel::parse(raw) {
                Ok(channel) => channels.push(channel),
                Err(e) => tracing::warn!(channel = raw, error = %e, "Dropping corrupt backlog entry"),
            }
        }

        sqlx::query("DELETE FROM channel_backlog WHERE seq <= ?")
            .bind(last)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(channels)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;
    use tempfile::TempDir;

    async fn test_store() -> (SqliteStore, TempDir) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cluster.db");
        let store = SqliteStore::open(&path).await.unwrap();
        (store, dir)
    }

    fn channel(name: &str) -> Channel {
        Channel::parse(name).unwrap()
    }

    #[tokio::test]
    async fn test_process_crud() {
        let (store, _dir) = test_store().await;
        let process = SupervisorProcess::new("host-abc")
            .with_state(ProcessState::Connected)
            .with_channels([channel("a"), channel("b")]);
        store.register(process.clone()).await.unwrap();

        let fetched = store.get(process.id).await.unwrap().unwrap();
        assert_eq!(fetched, process);
        assert_eq!(store.channel_count(process.id).await.unwrap(), 2);

        assert!(matches!(
            store.register(process.clone()).await,
            Err(RegistryError::AlreadyExists(_))
        ));

        let at = Utc::now();
        store
            .heartbeat(process.id, ProcessState::Disconnected, at)
            .await
            .unwrap();
        let fetched = store.get(process.id).await.unwrap().unwrap();
        assert_eq!(fetched.state, ProcessState::Disconnected);
        assert_eq!(fetched.last_heartbeat_at, at);

        assert!(store.remove(process.id).await.unwrap());
        assert!(store.get(process.id).await.unwrap().is_none());
        assert!(store.owners(&[channel("a")]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_list_orders_by_registration() {
        let (store, _dir) = test_store().await;
        let now = Utc::now();
        let second = SupervisorProcess::new("h").with_created_at(now);
        let first = SupervisorProcess::new("h").with_created_at(now - TimeDelta::milliseconds(5));
        store.register(second.clone()).await.unwrap();
        store.register(first.clone()).await.unwrap();

        let ids: Vec<ProcessId> = store.list().await.unwrap().iter().map(|p| p.id).collect();
        assert_eq!(ids, vec![first.id, second.id]);
    }

    #[tokio::test]
    async fn test_commit_checks_observed_owner() {
        let (store, _dir) = test_store().await;
        let a = SupervisorProcess::new("h").with_channels([channel("x")]);
        let b = SupervisorProcess::new("h");
        store.register(a.clone()).await.unwrap();
        store.register(b.clone()).await.unwrap();

        // Stale snapshot: thinks x is unowned.
        let err = store
            .commit(&[
                Assignment {
                    channel: channel("y"),
                    process_id: b.id,
                    previous_owner: None,
                    expected_load: None,
                },
                Assignment {
                    channel: channel("x"),
                    process_id: b.id,
                    previous_owner: None,
                    expected_load: None,
                },
            ])
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::Conflict(_)));
        assert_eq!(store.channel_count(b.id).await.unwrap(), 0);

        store
            .commit(&[Assignment {
                channel: channel("x"),
                process_id: b.id,
                previous_owner: Some(a.id),
                expected_load: None,
            }])
            .await
            .unwrap();
        let owners = store.owners(&[channel("x")]).await.unwrap();
        assert_eq!(owners.get(&channel("x")), Some(&b.id));
        assert_eq!(store.channel_count(a.id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_commit_checks_observed_load() {
        let (store, _dir) = test_store().await;
        let p = SupervisorProcess::new("h");
        store.register(p.clone()).await.unwrap();
        // Another node got there first.
        store.add_channel(p.id, &channel("x")).await.unwrap();

        let assign = |name: &str, expected| Assignment {
            channel: channel(name),
            process_id: p.id,
            previous_owner: None,
            expected_load: Some(expected),
        };

        let err = store.commit(&[assign("y", 0)]).await.unwrap_err();
        assert!(matches!(err, RegistryError::Conflict(_)));
        assert_eq!(store.channel_count(p.id).await.unwrap(), 1);

        // Two channels to one process share the pre-batch load.
        store
            .commit(&[assign("y", 1), assign("z", 1)])
            .await
            .unwrap();
        assert_eq!(store.channel_count(p.id).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_queue_fifo_and_drain() {
        let (store, _dir) = test_store().await;
        let id = ProcessId::new();
        store.enqueue(id, Command::join(channel("one"))).await.unwrap();
        store.enqueue(id, Command::join(channel("two"))).await.unwrap();
        store
            .enqueue(ProcessId::new(), Command::join(channel("other")))
            .await
            .unwrap();

        let pending = store.pending(id).await.unwrap();
        let names: Vec<&str> = pending.iter().map(|c| c.channel().as_str()).collect();
        assert_eq!(names, vec!["#one", "#two"]);
        assert!(store.pending(id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_backlog_dedupes_and_drains() {
        let (store, _dir) = test_store().await;
        store.push(&[channel("a"), channel("b")]).await.unwrap();
        store.push(&[channel("b"), channel("c")]).await.unwrap();

        let taken = store.take_all().await.unwrap();
        assert_eq!(taken, vec![channel("a"), channel("b"), channel("c")]);
        assert!(store.take_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_reopen_keeps_state() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cluster.db");
        let process = SupervisorProcess::new("h").with_channels([channel("kept")]);
        {
            let store = SqliteStore::open(&path).await.unwrap();
            store.register(process.clone()).await.unwrap();
        }
        let store = SqliteStore::open(&path).await.unwrap();
        assert_eq!(store.get(process.id).await.unwrap(), Some(process));
    }
}
