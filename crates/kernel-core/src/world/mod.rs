//! The simulation world: agent arena, commodity registry, in-flight message
//! queue, event log, and the monthly tick/tock driver.

use std::collections::VecDeque;
use std::fmt;

mod events;
mod init;
mod routing;
mod snapshot;
mod step;

use contracts::{AgentId, Event, RunMode, RunStatus, SimConfig};

use crate::agent::{AgentArena, AgentEntry, AgentKind, CommodityRegistry, RegistryError};
use crate::facility::FacilityError;
use crate::message::{Message, RoutingError};

pub use init::WorldBuildError;

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct StepMetrics {
    pub advanced_months: u64,
    pub routed_hops: u64,
    pub matched_trades: u64,
    pub shipped_quantity: f64,
}

/// Where a message was when a phase aborted: enough to reconstruct the
/// failure without the envelope itself.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageDiagnostic {
    pub originator: AgentId,
    pub holder: AgentId,
    pub path: Vec<AgentId>,
    pub commodity: Option<String>,
    pub amount: f64,
}

impl fmt::Display for MessageDiagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "originator={} holder={} path={:?} commodity={} amount={}",
            self.originator,
            self.holder,
            self.path,
            self.commodity.as_deref().unwrap_or("?"),
            self.amount
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SimulationError {
    Routing {
        month: u64,
        diagnostic: MessageDiagnostic,
        source: RoutingError,
    },
    Facility {
        month: u64,
        agent: AgentId,
        source: FacilityError,
    },
    Conservation {
        month: u64,
        expected: f64,
        observed: f64,
    },
    Registry {
        month: u64,
        source: RegistryError,
    },
}

impl fmt::Display for SimulationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SimulationError::Routing {
                month,
                diagnostic,
                source,
            } => write!(f, "month {}: routing failed ({}): {}", month, source, diagnostic),
            SimulationError::Facility {
                month,
                agent,
                source,
            } => write!(f, "month {}: facility {} failed: {}", month, agent, source),
            SimulationError::Conservation {
                month,
                expected,
                observed,
            } => write!(
                f,
                "month {}: conservation violated: expected total {}, observed {}",
                month, expected, observed
            ),
            SimulationError::Registry { month, source } => {
                write!(f, "month {}: registry error: {}", month, source)
            }
        }
    }
}

impl std::error::Error for SimulationError {}

/// Single-threaded, cooperatively driven simulation state.
///
/// All dispatch is synchronous; messages are serviced in the order their
/// senders handed them over, and agent traversal is pre-order over the
/// region forest. The registries are written during scenario load only.
#[derive(Debug)]
pub struct SimWorld {
    config: SimConfig,
    status: RunStatus,
    arena: AgentArena,
    commodities: CommodityRegistry,
    in_flight: VecDeque<Message>,
    event_log: Vec<Event>,
    state_hash: u64,
    replay_hash: u64,
    initial_material: f64,
    last_step_metrics: StepMetrics,
}

impl SimWorld {
    pub fn run_id(&self) -> &str {
        &self.status.run_id
    }

    pub fn config(&self) -> &SimConfig {
        &self.config
    }

    pub fn status(&self) -> &RunStatus {
        &self.status
    }

    pub fn events(&self) -> &[Event] {
        &self.event_log
    }

    pub fn state_hash(&self) -> u64 {
        self.state_hash
    }

    pub fn replay_hash(&self) -> u64 {
        self.replay_hash
    }

    pub fn last_step_metrics(&self) -> StepMetrics {
        self.last_step_metrics
    }

    pub fn start(&mut self) {
        if !self.status.is_complete() && self.status.mode != RunMode::Aborted {
            self.status.mode = RunMode::Running;
        }
    }

    pub fn pause(&mut self) {
        if self.status.mode != RunMode::Aborted {
            self.status.mode = RunMode::Paused;
        }
    }

    pub fn agent_name(&self, id: AgentId) -> Option<&str> {
        self.arena.get(id).map(|entry| entry.name.as_str())
    }

    pub(super) fn commodity_name(&self, id: contracts::CommodityId) -> Option<String> {
        self.commodities.name_of(id).map(str::to_string)
    }

    /// Every unit of material currently in the system: facility holdings
    /// plus any resource payload still riding an in-flight message.
    pub fn total_material(&self) -> f64 {
        let held: f64 = self
            .arena
            .iter()
            .map(|entry| match &entry.kind {
                AgentKind::Facility(model) => model.held_quantity(),
                _ => 0.0,
            })
            .sum();
        let in_transit: f64 = self
            .in_flight
            .iter()
            .filter_map(|message| message.transaction().resource.as_ref())
            .map(|resource| resource.total_quantity())
            .sum();
        held + in_transit
    }

    pub(super) fn diagnose(&self, message: &Message) -> MessageDiagnostic {
        MessageDiagnostic {
            originator: message.originator(),
            holder: message.current_holder(),
            path: message.path().to_vec(),
            commodity: self.commodity_name(message.transaction().commodity),
            amount: message.transaction().amount(),
        }
    }

    pub(super) fn entry(&self, id: AgentId) -> Option<&AgentEntry> {
        self.arena.get(id)
    }
}

/// Deterministic stand-in for a wall-clock stamp. The simulation has no
/// real time, so stamps encode the month and the in-month sequence instead.
pub(super) fn deterministic_stamp(month: u64, sequence: u64) -> String {
    format!("m{:05}.{:04}", month, sequence)
}

// FNV-1a, 64-bit. The hash chains are determinism probes, not integrity
// checks, so the canonical FNV parameters are plenty.
const FNV64_OFFSET_BASIS: u64 = 0xCBF2_9CE4_8422_2325;
const FNV64_PRIME: u64 = 0x0000_0100_0000_01B3;

fn fold_bytes(mut hash: u64, bytes: &[u8]) -> u64 {
    for byte in bytes {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(FNV64_PRIME);
    }
    hash
}

fn seeded(hash: u64) -> u64 {
    if hash == 0 {
        FNV64_OFFSET_BASIS
    } else {
        hash
    }
}

pub(super) fn chain_state_hash(state_hash: u64, month: u64, sequence_in_month: u64) -> u64 {
    let hash = fold_bytes(seeded(state_hash), &month.to_le_bytes());
    fold_bytes(hash, &sequence_in_month.to_le_bytes())
}

pub(super) fn chain_event_hash(current: u64, event_id: &str, month: u64, sequence: u64) -> u64 {
    let hash = fold_bytes(seeded(current), &month.to_le_bytes());
    let hash = fold_bytes(hash, &sequence.to_le_bytes());
    fold_bytes(hash, event_id.as_bytes())
}
