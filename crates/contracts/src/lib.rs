//! v1 cross-boundary contracts for the simulation kernel, API, and persistence.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub mod scenario;

pub const SCHEMA_VERSION_V1: &str = "1.0";

/// Stable arena id of a simulation agent (region, institution, facility, market).
pub type AgentId = u32;

/// Registry id of a tradable commodity, assigned in declaration order.
pub type CommodityId = u32;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SimConfig {
    pub schema_version: String,
    pub run_id: String,
    pub horizon_months: u64,
    #[serde(default = "default_snapshot_every_months")]
    pub snapshot_every_months: u64,
    pub notes: Option<String>,
}

impl SimConfig {
    pub fn max_months(&self) -> u64 {
        self.horizon_months
    }
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            schema_version: SCHEMA_VERSION_V1.to_string(),
            run_id: "run_local_001".to_string(),
            horizon_months: 12,
            snapshot_every_months: default_snapshot_every_months(),
            notes: None,
        }
    }
}

fn default_snapshot_every_months() -> u64 {
    1
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    Running,
    Paused,
    Aborted,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunStatus {
    pub schema_version: String,
    pub run_id: String,
    pub current_month: u64,
    pub horizon_months: u64,
    pub mode: RunMode,
    pub in_flight_depth: usize,
}

impl RunStatus {
    pub fn is_complete(&self) -> bool {
        self.current_month >= self.horizon_months
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "run_id={} month={}/{} mode={:?} in_flight={}",
            self.run_id, self.current_month, self.horizon_months, self.mode, self.in_flight_depth
        )
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CommandType {
    SimStart,
    SimPause,
    SimStepMonth,
    SimRunToMonth,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CommandPayload {
    SimStart,
    SimPause,
    SimStepMonth { months: u64 },
    SimRunToMonth { target_month: u64 },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Command {
    pub schema_version: String,
    pub command_id: String,
    pub run_id: String,
    pub issued_at_month: u64,
    pub command_type: CommandType,
    pub payload: CommandPayload,
}

impl Command {
    pub fn new(
        command_id: impl Into<String>,
        run_id: impl Into<String>,
        issued_at_month: u64,
        command_type: CommandType,
        payload: CommandPayload,
    ) -> Self {
        Self {
            schema_version: SCHEMA_VERSION_V1.to_string(),
            command_id: command_id.into(),
            run_id: run_id.into(),
            issued_at_month,
            command_type,
            payload,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    RunNotFound,
    InvalidCommand,
    InvalidQuery,
    MonthOutOfRange,
    ContractVersionUnsupported,
    RunStateConflict,
    InternalError,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ApiError {
    pub schema_version: String,
    pub error_code: ErrorCode,
    pub message: String,
    pub details: Option<String>,
}

impl ApiError {
    pub fn new(error_code: ErrorCode, message: impl Into<String>, details: Option<String>) -> Self {
        Self {
            schema_version: SCHEMA_VERSION_V1.to_string(),
            error_code,
            message: message.into(),
            details,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommandResult {
    pub schema_version: String,
    pub command_id: String,
    pub run_id: String,
    pub accepted: bool,
    pub error: Option<ApiError>,
}

impl CommandResult {
    pub fn accepted(command: &Command) -> Self {
        Self {
            schema_version: SCHEMA_VERSION_V1.to_string(),
            command_id: command.command_id.clone(),
            run_id: command.run_id.clone(),
            accepted: true,
            error: None,
        }
    }

    pub fn rejected(command: &Command, error: ApiError) -> Self {
        Self {
            schema_version: SCHEMA_VERSION_V1.to_string(),
            command_id: command.command_id.clone(),
            run_id: command.run_id.clone(),
            accepted: false,
            error: Some(error),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    MonthAdvanced,
    RequestIssued,
    OfferIssued,
    TradeMatched,
    TradeUnfilled,
    RequestRolledForward,
    RouteClosed,
    MaterialShipped,
    MaterialReceived,
    ConservationVerified,
    RunAborted,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    pub schema_version: String,
    pub run_id: String,
    pub month: u64,
    pub created_at: String,
    pub event_id: String,
    pub sequence_in_month: u64,
    pub event_type: EventType,
    pub agent_id: Option<AgentId>,
    pub commodity: Option<String>,
    pub details: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FacilityStateSnapshot {
    pub agent_id: AgentId,
    pub name: String,
    pub kind: String,
    pub stocks: Vec<f64>,
    pub inventory: Vec<f64>,
    pub orders_waiting: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MarketBookSnapshot {
    pub agent_id: AgentId,
    pub name: String,
    pub commodity: String,
    pub open_offers: usize,
    pub open_requests: usize,
    pub offered_quantity: f64,
    pub requested_quantity: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Snapshot {
    pub schema_version: String,
    pub run_id: String,
    pub month: u64,
    pub created_at: String,
    pub snapshot_id: String,
    pub world_state_hash: String,
    pub total_material: f64,
    pub facilities: Vec<FacilityStateSnapshot>,
    pub markets: Vec<MarketBookSnapshot>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_status_completion() {
        let status = RunStatus {
            schema_version: SCHEMA_VERSION_V1.to_string(),
            run_id: "run_a".to_string(),
            current_month: 12,
            horizon_months: 12,
            mode: RunMode::Paused,
            in_flight_depth: 0,
        };
        assert!(status.is_complete());
    }

    #[test]
    fn command_round_trip_serialization() {
        let command = Command::new(
            "cmd_1",
            "run_a",
            3,
            CommandType::SimRunToMonth,
            CommandPayload::SimRunToMonth { target_month: 9 },
        );
        let serialized = serde_json::to_string(&command).expect("serialize");
        let decoded: Command = serde_json::from_str(&serialized).expect("deserialize");
        assert_eq!(command, decoded);
    }

    #[test]
    fn sim_config_defaults_snapshot_cadence() {
        let raw = r#"{"schema_version":"1.0","run_id":"run_a","horizon_months":6,"notes":null}"#;
        let config: SimConfig = serde_json::from_str(raw).expect("deserialize");
        assert_eq!(config.snapshot_every_months, 1);
        assert_eq!(config.max_months(), 6);
    }
}
