use super::*;

use contracts::{FacilityStateSnapshot, MarketBookSnapshot, Snapshot, SCHEMA_VERSION_V1};

impl SimWorld {
    pub fn snapshot_for_current_month(&self) -> Snapshot {
        let month = self.status.current_month;

        let mut facilities = Vec::new();
        for entry in self.arena.iter() {
            if let AgentKind::Facility(model) = &entry.kind {
                facilities.push(FacilityStateSnapshot {
                    agent_id: entry.id,
                    name: entry.name.clone(),
                    kind: model.kind().to_string(),
                    stocks: model.stock_quantities(),
                    inventory: model.inventory_quantities(),
                    orders_waiting: model.orders_pending(),
                });
            }
        }

        let mut markets = Vec::new();
        for def in self.commodities.defs_in_id_order() {
            if let Some(entry) = self.arena.get(def.market) {
                if let AgentKind::Market(books) = &entry.kind {
                    let (open_offers, offered_quantity) = books.open_offers(def.id);
                    let (open_requests, requested_quantity) = books.open_requests(def.id);
                    markets.push(MarketBookSnapshot {
                        agent_id: entry.id,
                        name: entry.name.clone(),
                        commodity: def.name.clone(),
                        open_offers,
                        open_requests,
                        offered_quantity,
                        requested_quantity,
                    });
                }
            }
        }

        Snapshot {
            schema_version: SCHEMA_VERSION_V1.to_string(),
            run_id: self.status.run_id.clone(),
            month,
            created_at: deterministic_stamp(month, 0),
            snapshot_id: format!("snap_{}_{:05}", self.status.run_id, month),
            world_state_hash: format!("{:016x}", self.state_hash),
            total_material: self.total_material(),
            facilities,
            markets,
        }
    }
}
