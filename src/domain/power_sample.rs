use time::OffsetDateTime;

/// One instantaneous power reading reported by the plug, already converted
/// from the wire unit (centiwatts) to watts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PowerSample {
    pub ts: OffsetDateTime,
    pub watts: f64,
}
