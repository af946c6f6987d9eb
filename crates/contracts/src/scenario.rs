//! Scenario document: the tree-structured run description the kernel is built from.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{SimConfig, SCHEMA_VERSION_V1};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScenarioDoc {
    #[serde(default = "default_schema_version")]
    pub schema_version: String,
    #[serde(default = "default_run_id")]
    pub run_id: String,
    pub horizon_months: u64,
    #[serde(default = "default_snapshot_every_months")]
    pub snapshot_every_months: u64,
    pub commodities: Vec<CommodityDecl>,
    pub markets: Vec<MarketDecl>,
    pub regions: Vec<RegionDecl>,
    #[serde(default)]
    pub notes: Option<String>,
}

/// A tradable commodity and the name of the single market that clears it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CommodityDecl {
    pub name: String,
    pub market: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MarketDecl {
    pub name: String,
    #[serde(default = "default_market_kind")]
    pub kind: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RegionDecl {
    pub name: String,
    pub institutions: Vec<InstitutionDecl>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InstitutionDecl {
    pub name: String,
    pub facilities: Vec<FacilityDecl>,
}

/// A facility with its kind tag and the kind-specific parameter subtree.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FacilityDecl {
    pub name: String,
    pub kind: String,
    #[serde(default)]
    pub params: Value,
}

fn default_schema_version() -> String {
    SCHEMA_VERSION_V1.to_string()
}

fn default_run_id() -> String {
    "run_local_001".to_string()
}

fn default_snapshot_every_months() -> u64 {
    1
}

fn default_market_kind() -> String {
    "clearing".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScenarioError {
    InvalidHorizon,
    DuplicateCommodity(String),
    DuplicateMarket(String),
    DuplicateAgentName(String),
    UnknownMarket { commodity: String, market: String },
}

impl fmt::Display for ScenarioError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScenarioError::InvalidHorizon => write!(f, "horizon_months must be >= 1"),
            ScenarioError::DuplicateCommodity(name) => {
                write!(f, "duplicate commodity declaration: {}", name)
            }
            ScenarioError::DuplicateMarket(name) => {
                write!(f, "duplicate market declaration: {}", name)
            }
            ScenarioError::DuplicateAgentName(name) => {
                write!(f, "duplicate agent name: {}", name)
            }
            ScenarioError::UnknownMarket { commodity, market } => {
                write!(f, "commodity {} names unknown market {}", commodity, market)
            }
        }
    }
}

impl std::error::Error for ScenarioError {}

impl ScenarioDoc {
    /// Structural validation that does not require the facility-kind registry.
    pub fn validate(&self) -> Result<(), ScenarioError> {
        if self.horizon_months == 0 {
            return Err(ScenarioError::InvalidHorizon);
        }

        let mut market_names = BTreeSet::new();
        for market in &self.markets {
            if !market_names.insert(market.name.as_str()) {
                return Err(ScenarioError::DuplicateMarket(market.name.clone()));
            }
        }

        let mut commodity_names = BTreeSet::new();
        for commodity in &self.commodities {
            if !commodity_names.insert(commodity.name.as_str()) {
                return Err(ScenarioError::DuplicateCommodity(commodity.name.clone()));
            }
            if !market_names.contains(commodity.market.as_str()) {
                return Err(ScenarioError::UnknownMarket {
                    commodity: commodity.name.clone(),
                    market: commodity.market.clone(),
                });
            }
        }

        let mut agent_names = BTreeSet::new();
        for market in &self.markets {
            if !agent_names.insert(market.name.as_str()) {
                return Err(ScenarioError::DuplicateAgentName(market.name.clone()));
            }
        }
        for region in &self.regions {
            if !agent_names.insert(region.name.as_str()) {
                return Err(ScenarioError::DuplicateAgentName(region.name.clone()));
            }
            for institution in &region.institutions {
                if !agent_names.insert(institution.name.as_str()) {
                    return Err(ScenarioError::DuplicateAgentName(institution.name.clone()));
                }
                for facility in &institution.facilities {
                    if !agent_names.insert(facility.name.as_str()) {
                        return Err(ScenarioError::DuplicateAgentName(facility.name.clone()));
                    }
                }
            }
        }

        Ok(())
    }

    pub fn config(&self) -> SimConfig {
        SimConfig {
            schema_version: self.schema_version.clone(),
            run_id: self.run_id.clone(),
            horizon_months: self.horizon_months,
            snapshot_every_months: self.snapshot_every_months.max(1),
            notes: self.notes.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn minimal_doc() -> ScenarioDoc {
        serde_json::from_value(json!({
            "run_id": "run_test",
            "horizon_months": 3,
            "commodities": [{"name": "enriched_u", "market": "u_market"}],
            "markets": [{"name": "u_market"}],
            "regions": [{
                "name": "north",
                "institutions": [{
                    "name": "north_utility",
                    "facilities": [{
                        "name": "reactor_a",
                        "kind": "recipe_reactor",
                        "params": {"in_commodity": "enriched_u", "out_commodity": "enriched_u",
                                   "inventory_cap": 10.0, "monthly_capacity": 2.0}
                    }]
                }]
            }]
        }))
        .expect("scenario should deserialize")
    }

    #[test]
    fn minimal_scenario_validates() {
        let doc = minimal_doc();
        assert!(doc.validate().is_ok());
        assert_eq!(doc.config().horizon_months, 3);
    }

    #[test]
    fn zero_horizon_is_rejected() {
        let mut doc = minimal_doc();
        doc.horizon_months = 0;
        assert_eq!(doc.validate(), Err(ScenarioError::InvalidHorizon));
    }

    #[test]
    fn commodity_must_name_declared_market() {
        let mut doc = minimal_doc();
        doc.commodities[0].market = "missing".to_string();
        assert!(matches!(
            doc.validate(),
            Err(ScenarioError::UnknownMarket { .. })
        ));
    }

    #[test]
    fn duplicate_agent_names_are_rejected() {
        let mut doc = minimal_doc();
        doc.regions[0].name = "u_market".to_string();
        assert!(matches!(
            doc.validate(),
            Err(ScenarioError::DuplicateAgentName(_))
        ));
    }

    #[test]
    fn scenario_round_trip_serialization() {
        let doc = minimal_doc();
        let serialized = serde_json::to_string(&doc).expect("serialize");
        let decoded: ScenarioDoc = serde_json::from_str(&serialized).expect("deserialize");
        assert_eq!(doc, decoded);
    }
}
