use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Immutable record of one detected input transition, in the wire shape the
/// broker consumers expect. Built once by the pipeline and never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HardwareEvent {
    pub hardware_board_id: i64,
    pub extender_bus_id: i64,
    pub extender_bus_name: String,
    pub extender_bit_id: i64,
    pub extender_bit_name: String,
    pub bit_index: u8,
    pub input_selector_id: i64,
    pub input_selector_name: String,
    pub pressed: bool,
    pub timestamp: DateTime<Utc>,
}
