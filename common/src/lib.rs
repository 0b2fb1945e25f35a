pub mod commands;
pub mod config;
pub mod schedule;
pub mod thermostat;
pub mod topics;
pub mod types;

pub use commands::{CommandError, CommandReply, ManualSetpointPayload, RemoteCommand};
pub use config::{Configuration, ConnectionConfig, HardwareConfig, UplinkConfig};
pub use schedule::{Schedule, ScheduleError};
pub use thermostat::{
    evaluate_cycle, resolve_setpoint, CycleEvaluation, HeaterDecision, Resolution, SetpointSource,
};
pub use topics::*;
pub use types::{ConnectionState, SendOutcome, SensorReading, TelemetryMessage, Temperature};
