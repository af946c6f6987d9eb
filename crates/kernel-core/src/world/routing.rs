use super::*;

use contracts::EventType;
use serde_json::json;

use crate::message::MessageDir;

/// Snapshot of an arena entry's shape, small enough to copy out before the
/// routing loop takes mutable borrows.
#[derive(Debug, Clone, Copy)]
enum HolderKind {
    Region,
    Institution,
    Facility,
    Market,
}

impl SimWorld {
    /// Carries one message to quiescence: parked in a market book, delivered
    /// to its terminal facility, or failed with a structured diagnostic.
    ///
    /// Each hop strictly shrinks either the distance to the market or the
    /// path stack, so the loop terminates.
    pub(super) fn dispatch(
        &mut self,
        mut message: Message,
        month: u64,
        sequence_in_month: &mut u64,
    ) -> Result<(), SimulationError> {
        let mut down_trace: Vec<AgentId> = Vec::new();

        loop {
            let holder = message.current_holder();
            let (kind, parent) = match self.entry(holder) {
                Some(entry) => (
                    match entry.kind {
                        AgentKind::Region => HolderKind::Region,
                        AgentKind::Institution => HolderKind::Institution,
                        AgentKind::Facility(_) => HolderKind::Facility,
                        AgentKind::Market(_) => HolderKind::Market,
                    },
                    entry.parent,
                ),
                None => {
                    return Err(SimulationError::Registry {
                        month,
                        source: RegistryError::UnknownAgent(holder),
                    })
                }
            };
            let moving_up = message.dir() == MessageDir::Up;

            match kind {
                HolderKind::Market if moving_up => {
                    if let Some(books) = self.arena.market_mut(holder) {
                        books.book(message);
                    }
                    return Ok(());
                }
                HolderKind::Market => {
                    self.advance(&mut message, month)?;
                    down_trace.push(message.current_holder());
                }
                HolderKind::Facility => {
                    if moving_up && holder == message.originator() {
                        let Some(parent_id) = parent else {
                            return Err(SimulationError::Routing {
                                month,
                                diagnostic: self.diagnose(&message),
                                source: RoutingError::NoDestination,
                            });
                        };
                        self.forward(&mut message, parent_id, month)?;
                        continue;
                    }

                    // Terminal delivery of the return leg.
                    let terminal = message.is_terminal();
                    let commodity = self.commodity_name(message.transaction().commodity);
                    let amount = message.transaction().amount();
                    match self.arena.facility_mut(holder) {
                        Some(model) => model.receive_message(message).map_err(|source| {
                            SimulationError::Facility {
                                month,
                                agent: holder,
                                source,
                            }
                        })?,
                        None => {
                            return Err(SimulationError::Registry {
                                month,
                                source: RegistryError::UnknownAgent(holder),
                            })
                        }
                    }
                    if terminal {
                        self.push_event(
                            month,
                            sequence_in_month,
                            EventType::RouteClosed,
                            Some(holder),
                            commodity,
                            Some(json!({ "down_path": down_trace, "amount": amount })),
                        );
                    }
                    return Ok(());
                }
                HolderKind::Institution if moving_up => {
                    let Some(parent_id) = parent else {
                        return Err(SimulationError::Routing {
                            month,
                            diagnostic: self.diagnose(&message),
                            source: RoutingError::NoDestination,
                        });
                    };
                    self.forward(&mut message, parent_id, month)?;
                }
                HolderKind::Region if moving_up => {
                    let commodity = message.transaction().commodity;
                    let Some(market) = self.commodities.market_of(commodity) else {
                        return Err(SimulationError::Registry {
                            month,
                            source: RegistryError::UnknownCommodity(commodity.to_string()),
                        });
                    };
                    self.forward(&mut message, market, month)?;
                }
                HolderKind::Institution | HolderKind::Region => {
                    // Return leg: intermediate agents pass the message along
                    // unchanged; the path stack dictates the next hop.
                    self.advance(&mut message, month)?;
                    down_trace.push(message.current_holder());
                }
            }
        }
    }

    /// Drains the staging queue, carrying every in-flight message to rest.
    pub(super) fn drain_in_flight(
        &mut self,
        month: u64,
        sequence_in_month: &mut u64,
    ) -> Result<(), SimulationError> {
        while let Some(message) = self.in_flight.pop_front() {
            self.dispatch(message, month, sequence_in_month)?;
        }
        self.status.in_flight_depth = 0;
        Ok(())
    }

    fn forward(
        &mut self,
        message: &mut Message,
        dest: AgentId,
        month: u64,
    ) -> Result<(), SimulationError> {
        if let Err(source) = message.set_next_dest(dest) {
            return Err(self.routing_failure(month, message, source));
        }
        match message.send_on() {
            Ok(_) => {
                self.last_step_metrics.routed_hops += 1;
                Ok(())
            }
            Err(source) => Err(self.routing_failure(month, message, source)),
        }
    }

    fn advance(&mut self, message: &mut Message, month: u64) -> Result<(), SimulationError> {
        match message.send_on() {
            Ok(_) => {
                self.last_step_metrics.routed_hops += 1;
                Ok(())
            }
            Err(source) => Err(self.routing_failure(month, message, source)),
        }
    }

    fn routing_failure(
        &self,
        month: u64,
        message: &Message,
        source: RoutingError,
    ) -> SimulationError {
        SimulationError::Routing {
            month,
            diagnostic: self.diagnose(message),
            source,
        }
    }
}
