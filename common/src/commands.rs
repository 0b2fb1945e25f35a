use chrono::{DateTime, Duration, FixedOffset};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::{
    config::Configuration,
    schedule::{Schedule, MAX_SETPOINT, MIN_SETPOINT},
    types::Temperature,
};

pub const CMD_READ_NOW: &str = "ReadNow";
pub const CMD_SET_MANUAL_SETPOINT: &str = "SetManualSetpoint";
pub const CMD_CLEAR_MANUAL_SETPOINT: &str = "ClearManualSetpoint";
pub const CMD_SET_AWAY_ON: &str = "SetAwayOn";
pub const CMD_SET_AWAY_OFF: &str = "SetAwayOff";
pub const CMD_GET_PROGRAM: &str = "GetProgram";
pub const CMD_SET_PROGRAM: &str = "SetProgram";

pub const STATUS_OK: u16 = 200;
pub const STATUS_BAD_REQUEST: u16 = 400;
pub const STATUS_NOT_FOUND: u16 = 404;
pub const STATUS_INTERNAL_ERROR: u16 = 500;
pub const STATUS_UNAVAILABLE: u16 = 503;

/// Away mode expiry, far enough out to be indefinite in practice.
const AWAY_DURATION_DAYS: i64 = 3_650;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    #[error("unknown command '{0}'")]
    Unknown(String),
    #[error("malformed payload: {0}")]
    Malformed(String),
    #[error("setpoint {0} is out of range")]
    SetpointOutOfRange(Temperature),
    #[error("override expiry {0} is not in the future")]
    ExpiryNotInFuture(i64),
}

impl CommandError {
    pub fn status(&self) -> u16 {
        match self {
            Self::Unknown(_) => STATUS_NOT_FOUND,
            Self::Malformed(_) | Self::SetpointOutOfRange(_) | Self::ExpiryNotInFuture(_) => {
                STATUS_BAD_REQUEST
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ManualSetpointPayload {
    pub setpoint: Temperature,
    #[serde(default)]
    pub until_epoch: Option<i64>,
}

/// A named remote procedure with its payload already parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteCommand {
    ReadNow,
    SetManualSetpoint(ManualSetpointPayload),
    ClearManualSetpoint,
    SetAwayOn,
    SetAwayOff,
    GetProgram,
    SetProgram(Box<Schedule>),
}

impl RemoteCommand {
    pub fn parse(name: &str, payload: &[u8]) -> Result<Self, CommandError> {
        match name {
            CMD_READ_NOW => Ok(Self::ReadNow),
            CMD_SET_MANUAL_SETPOINT => parse_json(payload).map(Self::SetManualSetpoint),
            CMD_CLEAR_MANUAL_SETPOINT => Ok(Self::ClearManualSetpoint),
            CMD_SET_AWAY_ON => Ok(Self::SetAwayOn),
            CMD_SET_AWAY_OFF => Ok(Self::SetAwayOff),
            CMD_GET_PROGRAM => Ok(Self::GetProgram),
            CMD_SET_PROGRAM => parse_json(payload).map(|schedule| Self::SetProgram(Box::new(schedule))),
            other => Err(CommandError::Unknown(other.to_string())),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::ReadNow => CMD_READ_NOW,
            Self::SetManualSetpoint(_) => CMD_SET_MANUAL_SETPOINT,
            Self::ClearManualSetpoint => CMD_CLEAR_MANUAL_SETPOINT,
            Self::SetAwayOn => CMD_SET_AWAY_ON,
            Self::SetAwayOff => CMD_SET_AWAY_OFF,
            Self::GetProgram => CMD_GET_PROGRAM,
            Self::SetProgram(_) => CMD_SET_PROGRAM,
        }
    }

    pub fn is_mutating(&self) -> bool {
        !matches!(self, Self::ReadNow | Self::GetProgram)
    }

    pub fn replies_with_program(&self) -> bool {
        matches!(self, Self::GetProgram | Self::SetProgram(_))
    }

    /// Applies the command to the working configuration. Validation happens
    /// before any field is touched, so an error leaves `config` unchanged.
    pub fn apply(&self, config: &mut Configuration, now: DateTime<FixedOffset>) -> Result<(), CommandError> {
        match self {
            Self::ReadNow | Self::GetProgram => {}
            Self::SetManualSetpoint(payload) => {
                if !(MIN_SETPOINT..=MAX_SETPOINT).contains(&payload.setpoint) {
                    return Err(CommandError::SetpointOutOfRange(payload.setpoint));
                }
                let until = match payload.until_epoch {
                    Some(until) if until <= now.timestamp() => {
                        return Err(CommandError::ExpiryNotInFuture(until));
                    }
                    Some(until) => until,
                    None => {
                        (now + Duration::hours(i64::from(config.override_default_duration_hours)))
                            .timestamp()
                    }
                };
                config.override_setpoint = Some(payload.setpoint);
                config.override_until = Some(until);
            }
            Self::ClearManualSetpoint | Self::SetAwayOff => config.clear_override(),
            Self::SetAwayOn => {
                config.override_setpoint = Some(config.away_setpoint);
                config.override_until = Some((now + Duration::days(AWAY_DURATION_DAYS)).timestamp());
            }
            Self::SetProgram(schedule) => {
                schedule
                    .validate()
                    .map_err(|err| CommandError::Malformed(err.to_string()))?;
                config.schedule = (**schedule).clone();
            }
        }
        Ok(())
    }
}

fn parse_json<T: serde::de::DeserializeOwned>(payload: &[u8]) -> Result<T, CommandError> {
    serde_json::from_slice(payload).map_err(|err| CommandError::Malformed(err.to_string()))
}

/// Reply envelope shared by every command surface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandReply {
    pub status: u16,
    pub payload: Value,
}

impl CommandReply {
    pub fn ok(payload: Value) -> Self {
        Self {
            status: STATUS_OK,
            payload,
        }
    }

    pub fn error(status: u16, message: impl Into<String>) -> Self {
        Self {
            status,
            payload: serde_json::json!({ "error": message.into() }),
        }
    }

    pub fn from_error(err: &CommandError) -> Self {
        Self::error(err.status(), err.to_string())
    }

    pub fn is_ok(&self) -> bool {
        self.status == STATUS_OK
    }
}
