use time::OffsetDateTime;

pub const MEASUREMENT_POWER: &str = "Power";
pub const UOM_WATTS: &str = "W";

/// One output row: the power reading that closes an interval, the energy
/// integrated over that interval and the running total for the batch.
#[derive(Debug, Clone, PartialEq)]
pub struct EnergyRow {
    pub ts: OffsetDateTime,
    pub measurement: &'static str,
    pub watts: f64,
    pub uom: &'static str,
    pub details: String,
    pub kwh: f64,
    pub cumulative_kwh: f64,
}
