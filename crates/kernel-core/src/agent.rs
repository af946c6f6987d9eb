//! The agent arena: stable integer ids, parent/child bookkeeping, and the
//! frozen-at-init commodity registry.

use std::collections::BTreeMap;
use std::fmt;

use contracts::{AgentId, CommodityId};

use crate::facility::FacilityModel;
use crate::market::MarketBooks;

#[derive(Debug)]
pub enum AgentKind {
    Region,
    Institution,
    Facility(Box<dyn FacilityModel>),
    Market(MarketBooks),
}

impl AgentKind {
    pub fn label(&self) -> &'static str {
        match self {
            AgentKind::Region => "region",
            AgentKind::Institution => "institution",
            AgentKind::Facility(_) => "facility",
            AgentKind::Market(_) => "market",
        }
    }
}

#[derive(Debug)]
pub struct AgentEntry {
    pub id: AgentId,
    pub name: String,
    pub parent: Option<AgentId>,
    pub children: Vec<AgentId>,
    pub kind: AgentKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    Frozen { what: &'static str },
    DuplicateCommodity(String),
    UnknownCommodity(String),
    UnknownAgent(AgentId),
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistryError::Frozen { what } => {
                write!(f, "{} registry is frozen; registration happens at init only", what)
            }
            RegistryError::DuplicateCommodity(name) => {
                write!(f, "commodity already registered: {}", name)
            }
            RegistryError::UnknownCommodity(name) => {
                write!(f, "unknown commodity: {}", name)
            }
            RegistryError::UnknownAgent(id) => write!(f, "unknown agent id: {}", id),
        }
    }
}

impl std::error::Error for RegistryError {}

/// Owns every agent in the simulation, addressed by stable integer id.
///
/// Parents own their children logically; the arena owns all entries and the
/// parent/children links express the hierarchy. Registration order is
/// preserved in the child lists so traversal is deterministic.
#[derive(Debug, Default)]
pub struct AgentArena {
    entries: BTreeMap<AgentId, AgentEntry>,
    next_id: AgentId,
    frozen: bool,
}

impl AgentArena {
    pub fn register(
        &mut self,
        name: impl Into<String>,
        parent: Option<AgentId>,
        kind: AgentKind,
    ) -> Result<AgentId, RegistryError> {
        if self.frozen {
            return Err(RegistryError::Frozen { what: "agent" });
        }
        if let Some(parent_id) = parent {
            if !self.entries.contains_key(&parent_id) {
                return Err(RegistryError::UnknownAgent(parent_id));
            }
        }

        let id = self.next_id;
        self.next_id += 1;
        self.entries.insert(
            id,
            AgentEntry {
                id,
                name: name.into(),
                parent,
                children: Vec::new(),
                kind,
            },
        );
        if let Some(parent_id) = parent {
            if let Some(parent_entry) = self.entries.get_mut(&parent_id) {
                parent_entry.children.push(id);
            }
        }
        Ok(id)
    }

    pub fn freeze(&mut self) {
        self.frozen = true;
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, id: AgentId) -> Option<&AgentEntry> {
        self.entries.get(&id)
    }

    pub fn get_mut(&mut self, id: AgentId) -> Option<&mut AgentEntry> {
        self.entries.get_mut(&id)
    }

    pub fn facility_mut(&mut self, id: AgentId) -> Option<&mut dyn FacilityModel> {
        match self.entries.get_mut(&id) {
            Some(AgentEntry {
                kind: AgentKind::Facility(model),
                ..
            }) => Some(model.as_mut()),
            _ => None,
        }
    }

    pub fn market_mut(&mut self, id: AgentId) -> Option<&mut MarketBooks> {
        match self.entries.get_mut(&id) {
            Some(AgentEntry {
                kind: AgentKind::Market(books),
                ..
            }) => Some(books),
            _ => None,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &AgentEntry> {
        self.entries.values()
    }

    /// Region roots in ascending id order.
    pub fn regions(&self) -> Vec<AgentId> {
        self.entries
            .values()
            .filter(|entry| matches!(entry.kind, AgentKind::Region) && entry.parent.is_none())
            .map(|entry| entry.id)
            .collect()
    }

    /// Facilities in pre-order over the region forest.
    pub fn facilities_pre_order(&self) -> Vec<AgentId> {
        let mut ordered = Vec::new();
        for region in self.regions() {
            self.collect_facilities(region, &mut ordered);
        }
        ordered
    }

    fn collect_facilities(&self, id: AgentId, ordered: &mut Vec<AgentId>) {
        let Some(entry) = self.entries.get(&id) else {
            return;
        };
        if matches!(entry.kind, AgentKind::Facility(_)) {
            ordered.push(id);
        }
        for child in &entry.children {
            self.collect_facilities(*child, ordered);
        }
    }
}

#[derive(Debug, Clone)]
pub struct CommodityDef {
    pub id: CommodityId,
    pub name: String,
    pub market: AgentId,
}

/// Name-to-id commodity lookup; written during scenario load only.
#[derive(Debug, Default)]
pub struct CommodityRegistry {
    by_name: BTreeMap<String, CommodityId>,
    defs: BTreeMap<CommodityId, CommodityDef>,
    next_id: CommodityId,
    frozen: bool,
}

impl CommodityRegistry {
    pub fn register(
        &mut self,
        name: impl Into<String>,
        market: AgentId,
    ) -> Result<CommodityId, RegistryError> {
        if self.frozen {
            return Err(RegistryError::Frozen { what: "commodity" });
        }
        let name = name.into();
        if self.by_name.contains_key(&name) {
            return Err(RegistryError::DuplicateCommodity(name));
        }
        let id = self.next_id;
        self.next_id += 1;
        self.by_name.insert(name.clone(), id);
        self.defs.insert(id, CommodityDef { id, name, market });
        Ok(id)
    }

    pub fn freeze(&mut self) {
        self.frozen = true;
    }

    pub fn resolve(&self, name: &str) -> Result<CommodityId, RegistryError> {
        self.by_name
            .get(name)
            .copied()
            .ok_or_else(|| RegistryError::UnknownCommodity(name.to_string()))
    }

    pub fn def(&self, id: CommodityId) -> Option<&CommodityDef> {
        self.defs.get(&id)
    }

    pub fn name_of(&self, id: CommodityId) -> Option<&str> {
        self.defs.get(&id).map(|def| def.name.as_str())
    }

    pub fn market_of(&self, id: CommodityId) -> Option<AgentId> {
        self.defs.get(&id).map(|def| def.market)
    }

    /// Definitions in ascending commodity-id order.
    pub fn defs_in_id_order(&self) -> Vec<CommodityDef> {
        self.defs.values().cloned().collect()
    }
}
