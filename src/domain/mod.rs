pub mod energy_row;
pub mod power_sample;

pub use energy_row::{EnergyRow, MEASUREMENT_POWER, UOM_WATTS};
pub use power_sample::PowerSample;
