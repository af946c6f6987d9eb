use super::*;

use contracts::EventType;
use serde_json::json;

use crate::facility::Shipment;
use crate::message::Message;
use crate::resource::QUANTITY_TOLERANCE;

impl SimWorld {
    /// Advances one month through the full tick → resolve → tock cycle.
    ///
    /// Returns `Ok(false)` once the horizon is reached. Any fatal error
    /// leaves the month uncommitted and carries a structured diagnostic.
    pub fn step_month(&mut self) -> Result<bool, SimulationError> {
        if self.status.is_complete() {
            self.status.mode = RunMode::Paused;
            return Ok(false);
        }
        self.status.mode = RunMode::Running;
        let month = self.status.current_month;
        let mut sequence_in_month = 0_u64;
        self.last_step_metrics = StepMetrics::default();

        self.push_event(
            month,
            &mut sequence_in_month,
            EventType::MonthAdvanced,
            None,
            None,
            None,
        );

        // Tick: facilities advertise supply and demand, pre-order over the
        // region forest; the proposals ride up the hierarchy into the books.
        let facilities = self.arena.facilities_pre_order();
        for facility_id in &facilities {
            let proposals = match self.arena.facility_mut(*facility_id) {
                Some(model) => {
                    model
                        .handle_tick(month)
                        .map_err(|source| SimulationError::Facility {
                            month,
                            agent: *facility_id,
                            source,
                        })?
                }
                None => Vec::new(),
            };
            for transaction in proposals {
                let event_type = if transaction.is_request() {
                    EventType::RequestIssued
                } else {
                    EventType::OfferIssued
                };
                let commodity = self.commodity_name(transaction.commodity);
                self.push_event(
                    month,
                    &mut sequence_in_month,
                    event_type,
                    Some(*facility_id),
                    commodity,
                    Some(json!({
                        "amount": transaction.amount(),
                        "unit_price": transaction.unit_price,
                    })),
                );
                self.in_flight.push_back(Message::new(*facility_id, transaction));
            }
        }
        self.drain_in_flight(month, &mut sequence_in_month)?;

        // Resolve every market, in commodity-id order.
        for def in self.commodities.defs_in_id_order() {
            let resolution = match self.arena.market_mut(def.market) {
                Some(books) => books.resolve(def.id),
                None => continue,
            };
            for record in &resolution.matches {
                self.push_event(
                    month,
                    &mut sequence_in_month,
                    EventType::TradeMatched,
                    Some(def.market),
                    Some(def.name.clone()),
                    Some(json!({
                        "supplier": record.supplier,
                        "requester": record.requester,
                        "amount": record.amount,
                        "unit_price": record.unit_price,
                    })),
                );
            }
            for (originator, residual) in &resolution.unfilled {
                self.push_event(
                    month,
                    &mut sequence_in_month,
                    EventType::TradeUnfilled,
                    Some(*originator),
                    Some(def.name.clone()),
                    Some(json!({ "residual": residual })),
                );
            }
            for (originator, residual) in &resolution.rolled_forward {
                self.push_event(
                    month,
                    &mut sequence_in_month,
                    EventType::RequestRolledForward,
                    Some(*originator),
                    Some(def.name.clone()),
                    Some(json!({ "residual": residual })),
                );
            }
            self.last_step_metrics.matched_trades += resolution.matches.len() as u64;
            for message in resolution.outbound {
                self.in_flight.push_back(message);
            }
        }
        self.drain_in_flight(month, &mut sequence_in_month)?;

        // Tock: facilities process stocks and ship every matched order.
        // Shipments are collected across the whole traversal and land in
        // requester stocks only after it, so the outcome does not depend on
        // where supplier and requester sit in the traversal order.
        let mut deliveries: Vec<(AgentId, Shipment)> = Vec::new();
        for facility_id in &facilities {
            let shipments = match self.arena.facility_mut(*facility_id) {
                Some(model) => {
                    model
                        .handle_tock(month)
                        .map_err(|source| SimulationError::Facility {
                            month,
                            agent: *facility_id,
                            source,
                        })?
                }
                None => Vec::new(),
            };
            for shipment in shipments {
                let quantity = shipment.total_quantity();
                let requester = shipment.transaction.requester.ok_or_else(|| {
                    SimulationError::Facility {
                        month,
                        agent: *facility_id,
                        source: crate::facility::FacilityError::MissingRequester {
                            facility: *facility_id,
                        },
                    }
                })?;
                let commodity = self.commodity_name(shipment.transaction.commodity);
                self.push_event(
                    month,
                    &mut sequence_in_month,
                    EventType::MaterialShipped,
                    Some(*facility_id),
                    commodity,
                    Some(json!({ "to": requester, "quantity": quantity })),
                );
                deliveries.push((*facility_id, shipment));
            }
        }
        for (supplier, shipment) in deliveries {
            let quantity = shipment.total_quantity();
            let requester = match shipment.transaction.requester {
                Some(requester) => requester,
                None => continue,
            };
            let commodity = self.commodity_name(shipment.transaction.commodity);
            match self.arena.facility_mut(requester) {
                Some(model) => model.receive_material(&shipment.transaction, shipment.manifest),
                None => {
                    return Err(SimulationError::Registry {
                        month,
                        source: RegistryError::UnknownAgent(requester),
                    })
                }
            }
            self.push_event(
                month,
                &mut sequence_in_month,
                EventType::MaterialReceived,
                Some(requester),
                commodity,
                Some(json!({ "from": supplier, "quantity": quantity })),
            );
            self.last_step_metrics.shipped_quantity += quantity;
        }
        self.drain_in_flight(month, &mut sequence_in_month)?;

        // Conservation audit: material neither appears nor vanishes across
        // a cycle, within the relative tolerance.
        let observed = self.total_material();
        let expected = self.initial_material;
        let tolerance = expected.abs().max(1.0) * QUANTITY_TOLERANCE;
        if (observed - expected).abs() > tolerance {
            return Err(SimulationError::Conservation {
                month,
                expected,
                observed,
            });
        }
        self.push_event(
            month,
            &mut sequence_in_month,
            EventType::ConservationVerified,
            None,
            None,
            Some(json!({ "total_material": observed })),
        );

        self.state_hash = chain_state_hash(self.state_hash, month, sequence_in_month);
        self.status.current_month += 1;
        self.status.in_flight_depth = self.in_flight.len();
        self.last_step_metrics.advanced_months = 1;
        if self.status.is_complete() {
            self.status.mode = RunMode::Paused;
        }
        Ok(true)
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
        while self.status.current_month < target_month {
            if !self.step_month()? {
                break;
            }
            committed += 1;
        }
        Ok(committed)
    }

    /// Marks the run aborted and records the diagnostic in the event log.
    pub fn record_abort(&mut self, error: &SimulationError) {
        self.status.mode = RunMode::Aborted;
        let month = self.status.current_month;
        let mut sequence_in_month = self
            .event_log
            .iter()
            .rev()
            .take_while(|event| event.month == month)
            .count() as u64;
        self.push_event(
            month,
            &mut sequence_in_month,
            EventType::RunAborted,
            None,
            None,
            Some(json!({ "error": error.to_string() })),
        );
    }
}
