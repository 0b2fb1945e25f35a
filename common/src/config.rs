use serde::{Deserialize, Serialize};

use crate::{
    schedule::{Schedule, MAX_SETPOINT, MIN_SETPOINT},
    types::Temperature,
};

/// The persisted thermostat document.
///
/// Loaded once at start, mutated by the control loop and remote commands
/// under a single lock, and rewritten after every cycle and at shutdown.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Configuration {
    pub schedule: Schedule,
    pub hysteresis_threshold: Temperature,
    #[serde(default)]
    pub override_setpoint: Option<Temperature>,
    /// Epoch seconds.
    #[serde(default)]
    pub override_until: Option<i64>,
    pub override_default_duration_hours: u32,
    pub away_setpoint: Temperature,
    pub no_frost_setpoint: Temperature,
    /// Epoch seconds at which the current continuous heating run started.
    #[serde(default)]
    pub heater_on_since: Option<i64>,
    pub poll_interval_seconds: u64,
    #[serde(default = "default_safety_margin_seconds")]
    pub safety_margin_seconds: u64,
    #[serde(default)]
    pub is_test_device: bool,
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default)]
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub uplink: UplinkConfig,
    #[serde(default)]
    pub hardware: HardwareConfig,
}

fn default_safety_margin_seconds() -> u64 {
    30
}

fn default_timezone() -> String {
    "UTC".to_string()
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            schedule: Schedule::default(),
            hysteresis_threshold: Temperature::from_centi(20),
            override_setpoint: None,
            override_until: None,
            override_default_duration_hours: 4,
            away_setpoint: Temperature::from_degrees(12),
            no_frost_setpoint: Temperature::from_degrees(5),
            heater_on_since: None,
            poll_interval_seconds: 300,
            safety_margin_seconds: default_safety_margin_seconds(),
            is_test_device: false,
            timezone: default_timezone(),
            connection: ConnectionConfig::default(),
            uplink: UplinkConfig::default(),
            hardware: HardwareConfig::default(),
        }
    }
}

impl Configuration {
    pub fn sanitize(&mut self) {
        self.hysteresis_threshold = self
            .hysteresis_threshold
            .clamp(Temperature::from_centi(5), Temperature::from_degrees(5));
        self.away_setpoint = self.away_setpoint.clamp(MIN_SETPOINT, MAX_SETPOINT);
        self.no_frost_setpoint = self.no_frost_setpoint.clamp(MIN_SETPOINT, MAX_SETPOINT);
        self.override_default_duration_hours = self.override_default_duration_hours.clamp(1, 24 * 7);
        self.poll_interval_seconds = self.poll_interval_seconds.clamp(10, 3_600);
        self.safety_margin_seconds = self
            .safety_margin_seconds
            .min(self.poll_interval_seconds.saturating_sub(1));
        self.connection.sanitize();
        self.uplink.sanitize();
    }

    /// Budget for one cycle and for each network operation, so a hung call
    /// never delays the next tick.
    pub fn operation_deadline_seconds(&self) -> u64 {
        self.poll_interval_seconds
            .saturating_sub(self.safety_margin_seconds)
            .max(1)
    }

    pub fn clear_override(&mut self) {
        self.override_setpoint = None;
        self.override_until = None;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionConfig {
    pub host: String,
    pub port: u16,
    pub device_id: String,
    #[serde(default)]
    pub username: String,
    /// Broker password or SAS token.
    #[serde(default)]
    pub secret: String,
    #[serde(default = "default_keep_alive_seconds")]
    pub keep_alive_seconds: u64,
}

fn default_keep_alive_seconds() -> u64 {
    30
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 1883,
            device_id: "thermostat".to_string(),
            username: String::new(),
            secret: String::new(),
            keep_alive_seconds: default_keep_alive_seconds(),
        }
    }
}

impl ConnectionConfig {
    pub fn sanitize(&mut self) {
        if self.port == 0 {
            self.port = 1883;
        }
        if self.device_id.trim().is_empty() {
            self.device_id = "thermostat".to_string();
        }
        self.keep_alive_seconds = self.keep_alive_seconds.clamp(5, 600);
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UplinkConfig {
    pub backoff_base_seconds: u64,
    pub backoff_cap_seconds: u64,
    /// `None` retries forever.
    #[serde(default)]
    pub max_connect_attempts: Option<u32>,
    pub max_queued_messages: usize,
}

impl Default for UplinkConfig {
    fn default() -> Self {
        Self {
            backoff_base_seconds: 5,
            backoff_cap_seconds: 120,
            max_connect_attempts: None,
            max_queued_messages: 10_000,
        }
    }
}

impl UplinkConfig {
    pub fn sanitize(&mut self) {
        self.backoff_base_seconds = self.backoff_base_seconds.max(1);
        self.backoff_cap_seconds = self.backoff_cap_seconds.max(self.backoff_base_seconds);
        self.max_queued_messages = self.max_queued_messages.max(1);
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HardwareConfig {
    /// IIO device directory exposing `in_temp_input` and `in_humidityrelative_input`.
    #[serde(default)]
    pub sensor_iio_dir: Option<String>,
    #[serde(default)]
    pub heater_relay_gpio: Option<u32>,
    #[serde(default)]
    pub heater_led_gpio: Option<u32>,
    #[serde(default)]
    pub link_led_gpio: Option<u32>,
    #[serde(default)]
    pub sensor_reset_gpio: Option<u32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_round_trip_through_document() {
        let config = Configuration::default();
        let json = serde_json::to_string_pretty(&config).unwrap();
        assert!(json.contains("\"hysteresisThreshold\": 0.2"));
        assert!(json.contains("\"overrideDefaultDurationHours\": 4"));

        let parsed: Configuration = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn sections_added_later_default_when_absent() {
        let mut value = serde_json::to_value(Configuration::default()).unwrap();
        let object = value.as_object_mut().unwrap();
        object.remove("connection");
        object.remove("uplink");
        object.remove("hardware");
        object.remove("timezone");

        let parsed: Configuration = serde_json::from_value(value).unwrap();
        assert_eq!(parsed.uplink, UplinkConfig::default());
        assert_eq!(parsed.timezone, "UTC");
    }

    #[test]
    fn sanitize_keeps_margin_below_interval() {
        let mut config = Configuration {
            poll_interval_seconds: 20,
            safety_margin_seconds: 30,
            ..Configuration::default()
        };
        config.sanitize();

        assert_eq!(config.safety_margin_seconds, 19);
        assert_eq!(config.operation_deadline_seconds(), 1);
    }

    #[test]
    fn deadline_is_interval_minus_margin() {
        let config = Configuration::default();
        assert_eq!(config.operation_deadline_seconds(), 270);
    }
}
