//! In-process API facade with command validation, deterministic stepping,
//! and SQLite run persistence.

mod persistence;
mod server;

use std::path::Path;

use contracts::scenario::ScenarioDoc;
use contracts::{
    ApiError, Command, CommandPayload, CommandResult, CommandType, ErrorCode, Event, RunMode,
    RunStatus, SimConfig, Snapshot, SCHEMA_VERSION_V1,
};
use kernel_core::facility::FacilityKindRegistry;
use kernel_core::{Kernel, WorldBuildError};
use persistence::SqliteRunStore;
pub use persistence::{PersistedCommandEntry, PersistedRunSummary, PersistenceError, ReplaySlice};
pub use server::{serve, ServerError};

#[derive(Debug)]
struct PersistenceState {
    store: SqliteRunStore,
    persisted_command_count: usize,
    persisted_event_count: usize,
    last_snapshot_month: Option<u64>,
}

#[derive(Debug)]
pub struct EngineApi {
    kernel: Kernel,
    command_audit: Vec<CommandResult>,
    command_log: Vec<PersistedCommandEntry>,
    persistence: Option<PersistenceState>,
    last_persistence_error: Option<String>,
    last_runtime_error: Option<String>,
}

impl EngineApi {
    pub fn from_scenario(doc: &ScenarioDoc) -> Result<Self, WorldBuildError> {
        let kinds = FacilityKindRegistry::with_builtin_kinds();
        Self::from_scenario_with_kinds(doc, &kinds)
    }

    pub fn from_scenario_with_kinds(
        doc: &ScenarioDoc,
        kinds: &FacilityKindRegistry,
    ) -> Result<Self, WorldBuildError> {
        Ok(Self {
            kernel: Kernel::from_scenario(doc, kinds)?,
            command_audit: Vec::new(),
            command_log: Vec::new(),
            persistence: None,
            last_persistence_error: None,
            last_runtime_error: None,
        })
    }

    pub fn attach_sqlite_store(&mut self, path: impl AsRef<Path>) -> Result<(), PersistenceError> {
        let store = SqliteRunStore::open(path)?;
        self.persistence = Some(PersistenceState {
            store,
            persisted_command_count: 0,
            persisted_event_count: 0,
            last_snapshot_month: None,
        });
        Ok(())
    }

    pub fn initialize_run_storage(
        &mut self,
        replace_existing_run: bool,
    ) -> Result<(), PersistenceError> {
        let Some(state) = self.persistence.as_mut() else {
            return Err(PersistenceError::NotAttached);
        };

        let run_id = self.kernel.run_id().to_string();
        if state.store.run_exists(&run_id)? {
            if replace_existing_run {
                state.store.delete_run(&run_id)?;
                state.persisted_command_count = 0;
                state.persisted_event_count = 0;
                state.last_snapshot_month = None;
            } else {
                return Err(PersistenceError::RunAlreadyExists(run_id));
            }
        }

        let bootstrap_snapshot = self.kernel.snapshot_for_current_month();
        state.store.persist_delta(
            self.kernel.config(),
            self.kernel.status(),
            &[],
            &[],
            Some(&bootstrap_snapshot),
        )?;
        state.last_snapshot_month = Some(bootstrap_snapshot.month);
        self.last_persistence_error = None;
        Ok(())
    }

    pub fn flush_persistence_checked(&mut self) -> Result<(), PersistenceError> {
        let Some(state) = self.persistence.as_mut() else {
            return Err(PersistenceError::NotAttached);
        };

        let new_commands = &self.command_log[state.persisted_command_count..];
        let new_events = &self.kernel.events()[state.persisted_event_count..];

        let current_month = self.kernel.status().current_month;
        let cadence = self.kernel.config().snapshot_every_months.max(1);
        let snapshot_due = ((current_month == 0 && state.last_snapshot_month.is_none())
            || (current_month > 0
                && ((current_month % cadence == 0) || self.kernel.status().is_complete())))
            && state.last_snapshot_month != Some(current_month);

        let snapshot = if snapshot_due {
            Some(self.kernel.snapshot_for_current_month())
        } else {
            None
        };

        state.store.persist_delta(
            self.kernel.config(),
            self.kernel.status(),
            new_commands,
            new_events,
            snapshot.as_ref(),
        )?;

        state.persisted_command_count = self.command_log.len();
        state.persisted_event_count = self.kernel.events().len();
        if let Some(snapshot_payload) = snapshot {
            state.last_snapshot_month = Some(snapshot_payload.month);
        }

        self.last_persistence_error = None;
        Ok(())
    }

    pub fn replay_at_month(
        &self,
        run_id: &str,
        month: u64,
    ) -> Result<ReplaySlice, PersistenceError> {
        let Some(state) = self.persistence.as_ref() else {
            return Err(PersistenceError::NotAttached);
        };
        state.store.load_replay_at_month(run_id, month)
    }

    pub fn load_latest_snapshot_at_or_before(
        &self,
        run_id: &str,
        month: u64,
    ) -> Result<Option<Snapshot>, PersistenceError> {
        let Some(state) = self.persistence.as_ref() else {
            return Err(PersistenceError::NotAttached);
        };
        state.store.load_latest_snapshot_at_or_before(run_id, month)
    }

    pub fn last_persistence_error(&self) -> Option<&str> {
        self.last_persistence_error.as_deref()
    }

    pub fn last_runtime_error(&self) -> Option<&str> {
        self.last_runtime_error.as_deref()
    }

    pub fn run_id(&self) -> &str {
        self.kernel.run_id()
    }

    pub fn config(&self) -> &SimConfig {
        self.kernel.config()
    }

    pub fn status(&self) -> &RunStatus {
        self.kernel.status()
    }

    pub fn events(&self) -> &[Event] {
        self.kernel.events()
    }

    pub fn command_audit(&self) -> &[CommandResult] {
        &self.command_audit
    }

    pub fn command_log(&self) -> &[PersistedCommandEntry] {
        &self.command_log
    }

    pub fn snapshot_for_current_month(&self) -> Snapshot {
        self.kernel.snapshot_for_current_month()
    }

    pub fn start(&mut self) -> &RunStatus {
        self.kernel.start();
        self.flush_persistence_if_enabled();
        self.kernel.status()
    }

    pub fn pause(&mut self) -> &RunStatus {
        self.kernel.pause();
        self.flush_persistence_if_enabled();
        self.kernel.status()
    }

    /// Steps up to `months` months, stopping at the horizon or on the first
    /// runtime error (which aborts the run and is retained for inspection).
    pub fn step(&mut self, months: u64) -> (&RunStatus, u64) {
        let mut committed = 0_u64;
        for _ in 0..months.max(1) {
            match self.kernel.step_month() {
                Ok(true) => committed += 1,
                Ok(false) => break,
                Err(error) => {
                    self.last_runtime_error = Some(error.to_string());
                    break;
                }
            }
            self.flush_persistence_if_enabled();
        }
        self.flush_persistence_if_enabled();
        (self.kernel.status(), committed)
    }

    pub fn run_to_month(&mut self, target_month: u64) -> (&RunStatus, u64) {
        let mut committed = 0_u64;
        while self.kernel.status().current_month < target_month {
            match self.kernel.step_month() {
                Ok(true) => committed += 1,
                Ok(false) => break,
                Err(error) => {
                    self.last_runtime_error = Some(error.to_string());
                    break;
                }
            }
            self.flush_persistence_if_enabled();
        }
        self.flush_persistence_if_enabled();
        (self.kernel.status(), committed)
    }

    pub fn submit_command(&mut self, command: Command) -> CommandResult {
        let validation_error = self.validate_command(&command);
        let effective_month = self.status().current_month;

        let result = match validation_error {
            Some(error) => CommandResult::rejected(&command, error),
            None => {
                self.apply_command(&command.payload);
                CommandResult::accepted(&command)
            }
        };

        self.command_audit.push(result.clone());
        self.command_log.push(PersistedCommandEntry {
            command,
            result: result.clone(),
            effective_month,
        });
        self.flush_persistence_if_enabled();
        result
    }

    fn apply_command(&mut self, payload: &CommandPayload) {
        match payload {
            CommandPayload::SimStart => {
                self.kernel.start();
            }
            CommandPayload::SimPause => {
                self.kernel.pause();
            }
            CommandPayload::SimStepMonth { months } => {
                self.step(*months);
            }
            CommandPayload::SimRunToMonth { target_month } => {
                self.run_to_month(*target_month);
            }
        }
    }

    fn flush_persistence_if_enabled(&mut self) {
        if self.persistence.is_none() {
            return;
        }
        if let Err(err) = self.flush_persistence_checked() {
            self.last_persistence_error = Some(err.to_string());
        }
    }

    fn validate_command(&self, command: &Command) -> Option<ApiError> {
        if command.schema_version != SCHEMA_VERSION_V1 {
            return Some(ApiError::new(
                ErrorCode::ContractVersionUnsupported,
                "Unsupported schema_version",
                Some(format!(
                    "got={} expected={}",
                    command.schema_version, SCHEMA_VERSION_V1
                )),
            ));
        }

        if command.run_id != self.kernel.run_id() {
            return Some(ApiError::new(
                ErrorCode::RunNotFound,
                "command.run_id does not match active run",
                None,
            ));
        }

        if self.status().mode == RunMode::Aborted {
            return Some(ApiError::new(
                ErrorCode::RunStateConflict,
                "run is aborted; no further commands are accepted",
                self.last_runtime_error.clone(),
            ));
        }

        if !command_type_matches_payload(command.command_type, &command.payload) {
            return Some(ApiError::new(
                ErrorCode::InvalidCommand,
                "command_type does not match payload variant",
                None,
            ));
        }

        match &command.payload {
            CommandPayload::SimStepMonth { months } if *months == 0 => {
                return Some(ApiError::new(
                    ErrorCode::InvalidCommand,
                    "sim.step_month requires months >= 1",
                    None,
                ))
            }
            CommandPayload::SimRunToMonth { target_month }
                if *target_month <= self.status().current_month =>
            {
                return Some(ApiError::new(
                    ErrorCode::MonthOutOfRange,
                    "cannot run to a month at or before the current month",
                    Some(format!(
                        "target_month={} current_month={}",
                        target_month,
                        self.status().current_month
                    )),
                ))
            }
            _ => {}
        }

        None
    }
}

fn command_type_matches_payload(command_type: CommandType, payload: &CommandPayload) -> bool {
    matches!(
        (command_type, payload),
        (CommandType::SimStart, CommandPayload::SimStart)
            | (CommandType::SimPause, CommandPayload::SimPause)
            | (CommandType::SimStepMonth, CommandPayload::SimStepMonth { .. })
            | (
                CommandType::SimRunToMonth,
                CommandPayload::SimRunToMonth { .. }
            )
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn test_scenario() -> ScenarioDoc {
        serde_json::from_value(json!({
            "run_id": "run_api_test",
            "horizon_months": 6,
            "snapshot_every_months": 2,
            "commodities": [{"name": "u", "market": "u_market"}],
            "markets": [{"name": "u_market"}],
            "regions": [{
                "name": "north",
                "institutions": [{
                    "name": "utility",
                    "facilities": [{
                        "name": "reactor",
                        "kind": "recipe_reactor",
                        "params": {
                            "in_commodity": "u",
                            "out_commodity": "u",
                            "inventory_cap": 40.0,
                            "monthly_capacity": 8.0,
                            "initial_inventory": 16.0
                        }
                    }]
                }]
            }]
        }))
        .expect("scenario should deserialize")
    }

    fn temp_db_path(name: &str) -> std::path::PathBuf {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("time should be monotonic")
            .as_nanos();
        std::env::temp_dir().join(format!("fuel_kernel_{name}_{nanos}.sqlite"))
    }

    #[test]
    fn step_returns_committed_count() {
        let mut api = EngineApi::from_scenario(&test_scenario()).expect("build api");
        let (_, committed) = api.step(3);
        assert_eq!(committed, 3);
        assert_eq!(api.status().current_month, 3);
        assert!(api.last_runtime_error().is_none());
    }

    #[test]
    fn rejects_mismatched_payload_type() {
        let mut api = EngineApi::from_scenario(&test_scenario()).expect("build api");
        let bad = Command::new(
            "cmd_bad",
            "run_api_test",
            0,
            CommandType::SimStart,
            CommandPayload::SimStepMonth { months: 1 },
        );
        let result = api.submit_command(bad);
        assert!(!result.accepted);
        assert!(result.error.is_some());
    }

    #[test]
    fn rejects_run_to_past_month() {
        let mut api = EngineApi::from_scenario(&test_scenario()).expect("build api");
        api.step(2);
        let command = Command::new(
            "cmd_back",
            "run_api_test",
            2,
            CommandType::SimRunToMonth,
            CommandPayload::SimRunToMonth { target_month: 1 },
        );
        let result = api.submit_command(command);
        assert!(!result.accepted);
        assert_eq!(
            result.error.expect("rejection error").error_code,
            ErrorCode::MonthOutOfRange
        );
    }

    #[test]
    fn accepts_and_applies_step_command() {
        let mut api = EngineApi::from_scenario(&test_scenario()).expect("build api");
        let command = Command::new(
            "cmd_step",
            "run_api_test",
            0,
            CommandType::SimStepMonth,
            CommandPayload::SimStepMonth { months: 2 },
        );
        let result = api.submit_command(command);
        assert!(result.accepted);
        assert_eq!(api.status().current_month, 2);
    }

    #[test]
    fn persists_and_replays_by_month() {
        let mut api = EngineApi::from_scenario(&test_scenario()).expect("build api");
        let db_path = temp_db_path("replay");

        api.attach_sqlite_store(&db_path).expect("attach store");
        api.initialize_run_storage(true).expect("initialize storage");
        api.run_to_month(5);
        api.flush_persistence_checked().expect("flush");

        let replay = api.replay_at_month("run_api_test", 4).expect("replay");
        assert!(replay.snapshot.is_some());
        assert!(!replay.events.is_empty());
        let snapshot = replay.snapshot.expect("snapshot present");
        assert!(snapshot.month <= 4);
        assert!(replay.events.iter().all(|event| event.month <= 4));

        let _ = std::fs::remove_file(&db_path);
        let _ = std::fs::remove_file(db_path.with_extension("sqlite-wal"));
        let _ = std::fs::remove_file(db_path.with_extension("sqlite-shm"));
    }
}
