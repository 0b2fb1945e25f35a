use std::{
    fmt,
    ops::{Add, Neg, Sub},
};

use chrono::{DateTime, FixedOffset};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

/// Degrees Celsius as fixed-point hundredths.
///
/// Setpoints, thresholds and readings all go through this type so hysteresis
/// comparisons are exact integer arithmetic. Serialized as a plain JSON number.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Temperature(i32);

impl Temperature {
    pub const SCALE: i32 = 100;

    pub const fn from_centi(centi: i32) -> Self {
        Self(centi)
    }

    pub const fn from_degrees(degrees: i32) -> Self {
        Self(degrees * Self::SCALE)
    }

    pub fn from_f64(degrees: f64) -> Option<Self> {
        if !degrees.is_finite() {
            return None;
        }
        let scaled = (degrees * Self::SCALE as f64).round();
        if scaled < i32::MIN as f64 || scaled > i32::MAX as f64 {
            return None;
        }
        Some(Self(scaled as i32))
    }

    pub fn centi(self) -> i32 {
        self.0
    }

    pub fn as_f64(self) -> f64 {
        self.0 as f64 / Self::SCALE as f64
    }

    pub fn abs(self) -> Self {
        Self(self.0.saturating_abs())
    }

    pub fn clamp(self, min: Self, max: Self) -> Self {
        Self(self.0.clamp(min.0, max.0))
    }
}

impl Add for Temperature {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self(self.0.saturating_add(rhs.0))
    }
}

impl Sub for Temperature {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self {
        Self(self.0.saturating_sub(rhs.0))
    }
}

impl Neg for Temperature {
    type Output = Self;

    fn neg(self) -> Self {
        Self(self.0.saturating_neg())
    }
}

impl fmt::Display for Temperature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.2}", self.as_f64())
    }
}

impl Serialize for Temperature {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(self.as_f64())
    }
}

impl<'de> Deserialize<'de> for Temperature {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let degrees = f64::deserialize(deserializer)?;
        Self::from_f64(degrees)
            .ok_or_else(|| de::Error::custom(format!("temperature out of range: {degrees}")))
    }
}

/// One sample from the temperature/humidity sensor.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SensorReading {
    pub temperature: Option<Temperature>,
    pub humidity: Option<f64>,
    pub valid: bool,
}

impl SensorReading {
    /// Builds a reading from what the hardware layer reported. The reading is
    /// only valid when the hardware succeeded, a temperature is present and any
    /// humidity lies in `[0, 100]`.
    pub fn new(temperature: Option<Temperature>, humidity: Option<f64>, hardware_ok: bool) -> Self {
        let humidity_ok = humidity
            .map(|value| value.is_finite() && (0.0..=100.0).contains(&value))
            .unwrap_or(true);

        Self {
            temperature,
            humidity,
            valid: hardware_ok && humidity_ok && temperature.is_some(),
        }
    }

    pub fn absent() -> Self {
        Self {
            temperature: None,
            humidity: None,
            valid: false,
        }
    }

    pub fn valid_temperature(&self) -> Option<Temperature> {
        if self.valid {
            self.temperature
        } else {
            None
        }
    }

    pub fn valid_humidity(&self) -> Option<f64> {
        if self.valid {
            self.humidity
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryMessage {
    pub timestamp: DateTime<FixedOffset>,
    pub temperature: Option<Temperature>,
    pub humidity: Option<f64>,
    pub current_setpoint: Temperature,
    pub is_heater_on: bool,
    pub heater_on_seconds: i64,
    pub override_end_epoch: Option<i64>,
    #[serde(default)]
    pub override_remaining_seconds: i64,
    #[serde(default)]
    pub predicted_temperature: Option<Temperature>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub test_device: bool,
}

fn is_false(value: &bool) -> bool {
    !*value
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Retrying,
    Disabled,
}

impl ConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "DISCONNECTED",
            Self::Connecting => "CONNECTING",
            Self::Connected => "CONNECTED",
            Self::Retrying => "RETRYING",
            Self::Disabled => "DISABLED",
        }
    }

    /// States with a live connection attempt or link owned by the manager.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Connecting | Self::Connected | Self::Retrying)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What happened to a telemetry message handed to the uplink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Sent,
    Queued,
    Cancelled,
}
