//! Deterministic monthly tick/tock kernel for agent-based material trading:
//! routing overlay, market clearing, and conserved resource transfer.

pub mod agent;
pub mod facility;
pub mod market;
pub mod message;
pub mod resource;
pub mod world;

use contracts::scenario::ScenarioDoc;
use contracts::{Event, RunStatus, SimConfig, Snapshot};

use facility::FacilityKindRegistry;
pub use world::{MessageDiagnostic, SimWorld, SimulationError, StepMetrics, WorldBuildError};

/// Facade the API layer drives: owns the world and retains the diagnostic
/// of the abort that ended a run, if any.
#[derive(Debug)]
pub struct Kernel {
    world: SimWorld,
    last_abort: Option<SimulationError>,
}

impl Kernel {
    pub fn from_scenario(
        doc: &ScenarioDoc,
        kinds: &FacilityKindRegistry,
    ) -> Result<Self, WorldBuildError> {
        Ok(Self {
            world: SimWorld::from_scenario(doc, kinds)?,
            last_abort: None,
        })
    }

    pub fn run_id(&self) -> &str {
        self.world.run_id()
    }

    pub fn config(&self) -> &SimConfig {
        self.world.config()
    }

    pub fn status(&self) -> &RunStatus {
        self.world.status()
    }

    pub fn events(&self) -> &[Event] {
        self.world.events()
    }

    pub fn world(&self) -> &SimWorld {
        &self.world
    }

    pub fn snapshot_for_current_month(&self) -> Snapshot {
        self.world.snapshot_for_current_month()
    }

    pub fn start(&mut self) {
        self.world.start();
    }

    pub fn pause(&mut self) {
        self.world.pause();
    }

    pub fn last_abort(&self) -> Option<&SimulationError> {
        self.last_abort.as_ref()
    }

    pub fn step_month(&mut self) -> Result<bool, SimulationError> {
        match self.world.step_month() {
            Ok(committed) => Ok(committed),
            Err(error) => {
                self.world.record_abort(&error);
                self.last_abort = Some(error.clone());
                Err(error)
            }
        }
    }

    pub fn step_n(&mut self, months: u64) -> Result<u64, SimulationError> {
        let mut committed = 0_u64;
        for _ in 0..months {
            if !self.step_month()? {
                break;
            }
            committed += 1;
        }
        Ok(committed)
    }

    pub fn run_to_month(&mut self, target_month: u64) -> Result<u64, SimulationError> {
        let mut committed = 0_u64;
        while self.status().current_month < target_month {
            if !self.step_month()? {
                break;
            }
            committed += 1;
        }
        Ok(committed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use contracts::{EventType, RunMode};
    use serde_json::json;

    fn scenario() -> ScenarioDoc {
        serde_json::from_value(json!({
            "run_id": "run_kernel_test",
            "horizon_months": 2,
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
                            "inventory_cap": 50.0,
                            "monthly_capacity": 10.0,
                            "initial_inventory": 20.0
                        }
                    }]
                }]
            }]
        }))
        .expect("scenario should deserialize")
    }

    #[test]
    fn kernel_runs_to_horizon() {
        let kinds = FacilityKindRegistry::with_builtin_kinds();
        let mut kernel = Kernel::from_scenario(&scenario(), &kinds).expect("build kernel");
        let committed = kernel.run_to_month(10).expect("run");
        assert_eq!(committed, 2);
        assert!(kernel.status().is_complete());
        assert_eq!(kernel.status().mode, RunMode::Paused);
        assert!(kernel.last_abort().is_none());
        assert!(kernel
            .events()
            .iter()
            .any(|event| event.event_type == EventType::ConservationVerified));
    }

    #[test]
    fn snapshot_reports_facility_state() {
        let kinds = FacilityKindRegistry::with_builtin_kinds();
        let mut kernel = Kernel::from_scenario(&scenario(), &kinds).expect("build kernel");
        kernel.step_month().expect("step");
        let snapshot = kernel.snapshot_for_current_month();
        assert_eq!(snapshot.month, 1);
        assert_eq!(snapshot.facilities.len(), 1);
        assert!((snapshot.total_material - 20.0).abs() < 1e-9);
    }
}
