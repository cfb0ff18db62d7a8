pub mod alert;
pub mod command;
pub mod device;
pub mod telemetry;
pub mod topics;

pub use alert::{Alert, AlertCategory, AlertConfig, AlertEvent, AlertStatus, AlertThresholds, Severity};
pub use command::{
    Command, CommandKind, CommandMessage, CommandRequest, CommandResultMessage, CommandStatus,
    NewCommand, Params, ResultOutcome, BROADCAST_DEVICE,
};
pub use device::{Device, DeviceStatus, DeviceUpdate};
pub use telemetry::{EnhancedMetrics, LinkMetrics, TelemetryRecord, TelemetryVariant};
pub use topics::Topics;
