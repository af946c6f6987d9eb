use super::*;

use contracts::{EventType, SCHEMA_VERSION_V1};
use serde_json::Value;

impl SimWorld {
    pub(super) fn push_event(
        &mut self,
        month: u64,
        sequence_in_month: &mut u64,
        event_type: EventType,
        agent_id: Option<AgentId>,
        commodity: Option<String>,
        details: Option<Value>,
    ) {
        let sequence = *sequence_in_month;
        *sequence_in_month = sequence.saturating_add(1);
        let event_id = format!("evt_{:05}_{:04}", month, sequence);
        self.replay_hash = chain_event_hash(self.replay_hash, &event_id, month, sequence);
        self.event_log.push(Event {
            schema_version: SCHEMA_VERSION_V1.to_string(),
            run_id: self.status.run_id.clone(),
            month,
            created_at: deterministic_stamp(month, sequence),
            event_id,
            sequence_in_month: sequence,
            event_type,
            agent_id,
            commodity,
            details,
        });
    }
}
