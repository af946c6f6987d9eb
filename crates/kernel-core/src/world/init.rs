use super::*;

use std::collections::BTreeMap;

use contracts::scenario::{ScenarioDoc, ScenarioError};
use contracts::SCHEMA_VERSION_V1;

use crate::facility::{FacilityKindRegistry, InitContext};
use crate::market::MarketBooks;

/// The single market kind built into the kernel: a per-commodity clearing
/// book. The declaration carries a kind tag so scenarios stay forward
/// compatible, and anything else is rejected at load.
const CLEARING_MARKET_KIND: &str = "clearing";

#[derive(Debug)]
pub enum WorldBuildError {
    Scenario(ScenarioError),
    UnknownMarketKind { market: String, kind: String },
    UnknownFacilityKind { facility: String, kind: String },
    Facility { facility: String, source: FacilityError },
    Registry(RegistryError),
}

impl fmt::Display for WorldBuildError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorldBuildError::Scenario(err) => write!(f, "scenario error: {}", err),
            WorldBuildError::UnknownMarketKind { market, kind } => {
                write!(f, "market {} declares unknown kind {}", market, kind)
            }
            WorldBuildError::UnknownFacilityKind { facility, kind } => {
                write!(f, "facility {} declares unregistered kind {}", facility, kind)
            }
            WorldBuildError::Facility { facility, source } => {
                write!(f, "facility {} failed to initialize: {}", facility, source)
            }
            WorldBuildError::Registry(err) => write!(f, "registry error: {}", err),
        }
    }
}

impl std::error::Error for WorldBuildError {}

impl From<ScenarioError> for WorldBuildError {
    fn from(value: ScenarioError) -> Self {
        WorldBuildError::Scenario(value)
    }
}

impl From<RegistryError> for WorldBuildError {
    fn from(value: RegistryError) -> Self {
        WorldBuildError::Registry(value)
    }
}

impl SimWorld {
    /// Builds a world from a validated scenario document.
    ///
    /// Markets register first so commodity declarations can point at them;
    /// commodity ids follow declaration order, which fixes market resolution
    /// order for the whole run. Both registries freeze before the first
    /// month can tick.
    pub fn from_scenario(
        doc: &ScenarioDoc,
        kinds: &FacilityKindRegistry,
    ) -> Result<Self, WorldBuildError> {
        doc.validate()?;
        let config = doc.config();

        let mut arena = AgentArena::default();
        let mut commodities = CommodityRegistry::default();

        let mut market_ids = BTreeMap::new();
        for market in &doc.markets {
            if market.kind != CLEARING_MARKET_KIND {
                return Err(WorldBuildError::UnknownMarketKind {
                    market: market.name.clone(),
                    kind: market.kind.clone(),
                });
            }
            let id = arena.register(
                market.name.as_str(),
                None,
                AgentKind::Market(MarketBooks::default()),
            )?;
            market_ids.insert(market.name.as_str(), id);
        }

        for commodity in &doc.commodities {
            let Some(market) = market_ids.get(commodity.market.as_str()).copied() else {
                return Err(WorldBuildError::Scenario(ScenarioError::UnknownMarket {
                    commodity: commodity.name.clone(),
                    market: commodity.market.clone(),
                }));
            };
            commodities.register(commodity.name.as_str(), market)?;
        }

        for region in &doc.regions {
            let region_id = arena.register(region.name.as_str(), None, AgentKind::Region)?;
            for institution in &region.institutions {
                let institution_id =
                    arena.register(institution.name.as_str(), Some(region_id), AgentKind::Institution)?;
                for facility in &institution.facilities {
                    let Some(model) = kinds.construct(&facility.kind) else {
                        return Err(WorldBuildError::UnknownFacilityKind {
                            facility: facility.name.clone(),
                            kind: facility.kind.clone(),
                        });
                    };
                    let facility_id = arena.register(
                        facility.name.as_str(),
                        Some(institution_id),
                        AgentKind::Facility(model),
                    )?;
                    let ctx = InitContext::new(facility_id, &facility.name, &commodities);
                    if let Some(model) = arena.facility_mut(facility_id) {
                        model
                            .init(&ctx, &facility.params)
                            .map_err(|source| WorldBuildError::Facility {
                                facility: facility.name.clone(),
                                source,
                            })?;
                    }
                }
            }
        }

        arena.freeze();
        commodities.freeze();

        let status = RunStatus {
            schema_version: SCHEMA_VERSION_V1.to_string(),
            run_id: config.run_id.clone(),
            current_month: 0,
            horizon_months: config.horizon_months,
            mode: RunMode::Paused,
            in_flight_depth: 0,
        };

        let mut world = Self {
            config,
            status,
            arena,
            commodities,
            in_flight: VecDeque::new(),
            event_log: Vec::new(),
            state_hash: 0,
            replay_hash: 0,
            initial_material: 0.0,
            last_step_metrics: StepMetrics::default(),
        };
        world.initial_material = world.total_material();
        Ok(world)
    }
}
