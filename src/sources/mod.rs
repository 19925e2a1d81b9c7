pub mod device_logs;

pub use device_logs::DeviceLogSource;
