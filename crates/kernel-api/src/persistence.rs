use std::fmt;
use std::path::Path;

use contracts::{Command, CommandResult, Event, RunStatus, SimConfig, Snapshot};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedCommandEntry {
    pub command: Command,
    pub result: CommandResult,
    pub effective_month: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedRunSummary {
    pub run_id: String,
    pub status: RunStatus,
}

/// The state needed to resume inspection at a month: the latest snapshot at
/// or before it plus every event up to and including it.
#[derive(Debug, Clone)]
pub struct ReplaySlice {
    pub snapshot: Option<Snapshot>,
    pub events: Vec<Event>,
}

#[derive(Debug)]
pub enum PersistenceError {
    Sqlite(rusqlite::Error),
    Serde(serde_json::Error),
    NotAttached,
    RunAlreadyExists(String),
}

impl fmt::Display for PersistenceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sqlite(err) => write!(f, "sqlite error: {err}"),
            Self::Serde(err) => write!(f, "serde error: {err}"),
            Self::NotAttached => write!(f, "sqlite store is not attached"),
            Self::RunAlreadyExists(run_id) => write!(f, "run already exists: {run_id}"),
        }
    }
}

impl std::error::Error for PersistenceError {}

impl From<rusqlite::Error> for PersistenceError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Sqlite(value)
    }
}

impl From<serde_json::Error> for PersistenceError {
    fn from(value: serde_json::Error) -> Self {
        Self::Serde(value)
    }
}

#[derive(Debug)]
pub struct SqliteRunStore {
    conn: Connection,
}

impl SqliteRunStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, PersistenceError> {
        let conn = Connection::open(path)?;
        let mut store = Self { conn };
        store.configure()?;
        store.migrate()?;
        Ok(store)
    }

    fn configure(&mut self) -> Result<(), PersistenceError> {
        self.conn.pragma_update(None, "journal_mode", "WAL")?;
        self.conn.pragma_update(None, "synchronous", "NORMAL")?;
        Ok(())
    }

    fn migrate(&mut self) -> Result<(), PersistenceError> {
        self.conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS runs (
                run_id TEXT PRIMARY KEY,
                config_json TEXT NOT NULL,
                status_json TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS commands (
                run_id TEXT NOT NULL,
                command_id TEXT NOT NULL,
                issued_at_month INTEGER NOT NULL,
                effective_month INTEGER NOT NULL,
                accepted INTEGER NOT NULL,
                command_json TEXT NOT NULL,
                result_json TEXT NOT NULL,
                created_at TEXT NOT NULL,
                PRIMARY KEY (run_id, command_id)
            );
            CREATE TABLE IF NOT EXISTS events (
                run_id TEXT NOT NULL,
                event_id TEXT NOT NULL,
                month INTEGER NOT NULL,
                sequence_in_month INTEGER NOT NULL,
                event_type TEXT NOT NULL,
                payload_json TEXT NOT NULL,
                created_at TEXT NOT NULL,
                PRIMARY KEY (run_id, event_id)
            );
            CREATE INDEX IF NOT EXISTS idx_events_run_month
                ON events (run_id, month, sequence_in_month);
            CREATE TABLE IF NOT EXISTS snapshots (
                run_id TEXT NOT NULL,
                snapshot_id TEXT NOT NULL,
                month INTEGER NOT NULL,
                world_state_hash TEXT NOT NULL,
                payload_json TEXT NOT NULL,
                created_at TEXT NOT NULL,
                PRIMARY KEY (run_id, snapshot_id)
            );",
        )?;
        Ok(())
    }

    pub fn run_exists(&self, run_id: &str) -> Result<bool, PersistenceError> {
        let found: Option<String> = self
            .conn
            .query_row(
                "SELECT run_id FROM runs WHERE run_id = ?1",
                params![run_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    pub fn delete_run(&mut self, run_id: &str) -> Result<(), PersistenceError> {
        let tx = self.conn.transaction()?;
        tx.execute("DELETE FROM runs WHERE run_id = ?1", params![run_id])?;
        tx.execute("DELETE FROM commands WHERE run_id = ?1", params![run_id])?;
        tx.execute("DELETE FROM events WHERE run_id = ?1", params![run_id])?;
        tx.execute("DELETE FROM snapshots WHERE run_id = ?1", params![run_id])?;
        tx.commit()?;
        Ok(())
    }

    pub fn list_runs(&self, limit: usize) -> Result<Vec<PersistedRunSummary>, PersistenceError> {
        let mut stmt = self
            .conn
            .prepare("SELECT run_id, status_json FROM runs ORDER BY run_id ASC LIMIT ?1")?;
        let rows = stmt.query_map(params![limit as i64], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut runs = Vec::new();
        for row in rows {
            let (run_id, status_json) = row?;
            let status: RunStatus = serde_json::from_str(&status_json)?;
            runs.push(PersistedRunSummary { run_id, status });
        }
        Ok(runs)
    }

    pub fn persist_delta(
        &mut self,
        config: &SimConfig,
        status: &RunStatus,
        commands: &[PersistedCommandEntry],
        events: &[Event],
        snapshot: Option<&Snapshot>,
    ) -> Result<(), PersistenceError> {
        let config_json = serde_json::to_string(config)?;
        let status_json = serde_json::to_string(status)?;

        let tx = self.conn.transaction()?;
        tx.execute(
            "INSERT INTO runs (run_id, config_json, status_json, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(run_id) DO UPDATE SET
                status_json = excluded.status_json,
                updated_at = excluded.updated_at",
            params![
                status.run_id.as_str(),
                config_json,
                status_json,
                month_stamp(status.current_month),
            ],
        )?;

        for entry in commands {
            let command_json = serde_json::to_string(&entry.command)?;
            let result_json = serde_json::to_string(&entry.result)?;
            tx.execute(
                "INSERT OR IGNORE INTO commands (
                    run_id,
                    command_id,
                    issued_at_month,
                    effective_month,
                    accepted,
                    command_json,
                    result_json,
                    created_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    entry.command.run_id.as_str(),
                    entry.command.command_id.as_str(),
                    i64::try_from(entry.command.issued_at_month).unwrap_or(i64::MAX),
                    i64::try_from(entry.effective_month).unwrap_or(i64::MAX),
                    if entry.result.accepted { 1_i64 } else { 0_i64 },
                    command_json,
                    result_json,
                    month_stamp(entry.effective_month),
                ],
            )?;
        }

        for event in events {
            let payload_json = serde_json::to_string(event)?;
            tx.execute(
                "INSERT OR IGNORE INTO events (
                    run_id,
                    event_id,
                    month,
                    sequence_in_month,
                    event_type,
                    payload_json,
                    created_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    event.run_id.as_str(),
                    event.event_id.as_str(),
                    i64::try_from(event.month).unwrap_or(i64::MAX),
                    i64::try_from(event.sequence_in_month).unwrap_or(i64::MAX),
                    format!("{:?}", event.event_type),
                    payload_json,
                    event.created_at.as_str(),
                ],
            )?;
        }

        if let Some(snapshot_payload) = snapshot {
            let payload_json = serde_json::to_string(snapshot_payload)?;
            tx.execute(
                "INSERT OR IGNORE INTO snapshots (
                    run_id,
                    snapshot_id,
                    month,
                    world_state_hash,
                    payload_json,
                    created_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    snapshot_payload.run_id.as_str(),
                    snapshot_payload.snapshot_id.as_str(),
                    i64::try_from(snapshot_payload.month).unwrap_or(i64::MAX),
                    snapshot_payload.world_state_hash.as_str(),
                    payload_json,
                    snapshot_payload.created_at.as_str(),
                ],
            )?;
        }

        tx.commit()?;
        Ok(())
    }

    pub fn load_events_range(
        &self,
        run_id: &str,
        from_month: u64,
        to_month: u64,
    ) -> Result<Vec<Event>, PersistenceError> {
        let mut stmt = self.conn.prepare(
            "SELECT payload_json
             FROM events
             WHERE run_id = ?1 AND month >= ?2 AND month <= ?3
             ORDER BY month ASC, sequence_in_month ASC",
        )?;
        let rows = stmt.query_map(
            params![
                run_id,
                i64::try_from(from_month).unwrap_or(i64::MAX),
                i64::try_from(to_month).unwrap_or(i64::MAX)
            ],
            |row| row.get::<_, String>(0),
        )?;

        let mut events = Vec::new();
        for row in rows {
            let payload: String = row?;
            events.push(serde_json::from_str(&payload)?);
        }
        Ok(events)
    }

    pub fn load_latest_snapshot_at_or_before(
        &self,
        run_id: &str,
        month: u64,
    ) -> Result<Option<Snapshot>, PersistenceError> {
        let payload: Option<String> = self
            .conn
            .query_row(
                "SELECT payload_json
                 FROM snapshots
                 WHERE run_id = ?1 AND month <= ?2
                 ORDER BY month DESC
                 LIMIT 1",
                params![run_id, i64::try_from(month).unwrap_or(i64::MAX)],
                |row| row.get(0),
            )
            .optional()?;

        match payload {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    pub fn load_replay_at_month(
        &self,
        run_id: &str,
        month: u64,
    ) -> Result<ReplaySlice, PersistenceError> {
        Ok(ReplaySlice {
            snapshot: self.load_latest_snapshot_at_or_before(run_id, month)?,
            events: self.load_events_range(run_id, 0, month)?,
        })
    }
}

fn month_stamp(month: u64) -> String {
    format!("month_{:05}", month)
}
