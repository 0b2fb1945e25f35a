use std::path::PathBuf;

use thermolink_common::ConnectionConfig;

const DEFAULT_DATA_DIR: &str = "./.thermostat";
const REGEN_CONFIG_FLAG: &str = "--regen-config";

/// Process-level settings: where the document lives, operator flags and
/// environment overrides for the connection section.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Settings {
    pub data_dir: PathBuf,
    pub regenerate_config: bool,
    pub http_port: Option<u16>,
    pub mqtt_host: Option<String>,
    pub mqtt_port: Option<u16>,
    pub mqtt_user: Option<String>,
    pub mqtt_pass: Option<String>,
    pub device_id: Option<String>,
}

impl Settings {
    pub fn from_env() -> Self {
        Self::from_sources(std::env::args().skip(1), |name| std::env::var(name).ok())
    }

    pub fn from_sources(
        args: impl IntoIterator<Item = String>,
        var: impl Fn(&str) -> Option<String>,
    ) -> Self {
        let port = |name: &str| var(name).and_then(|value| value.trim().parse::<u16>().ok());

        Self {
            data_dir: var("THERMOSTAT_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR)),
            regenerate_config: args.into_iter().any(|arg| arg == REGEN_CONFIG_FLAG),
            http_port: port("THERMOSTAT_HTTP_PORT"),
            mqtt_host: var("MQTT_HOST"),
            mqtt_port: port("MQTT_PORT"),
            mqtt_user: var("MQTT_USER"),
            mqtt_pass: var("MQTT_PASS"),
            device_id: var("DEVICE_ID"),
        }
    }

    /// The document's connection section with environment overrides on top.
    /// Overrides are never written back to the document.
    pub fn connection(&self, document: &ConnectionConfig) -> ConnectionConfig {
        let mut connection = document.clone();
        if let Some(host) = &self.mqtt_host {
            connection.host = host.clone();
        }
        if let Some(port) = self.mqtt_port {
            connection.port = port;
        }
        if let Some(user) = &self.mqtt_user {
            connection.username = user.clone();
        }
        if let Some(pass) = &self.mqtt_pass {
            connection.secret = pass.clone();
        }
        if let Some(device_id) = &self.device_id {
            connection.device_id = device_id.clone();
        }
        connection.sanitize();
        connection
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn settings(args: &[&str], vars: &[(&str, &str)]) -> Settings {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(name, value)| (name.to_string(), value.to_string()))
            .collect();
        Settings::from_sources(args.iter().map(|arg| arg.to_string()), |name| {
            vars.get(name).cloned()
        })
    }

    #[test]
    fn defaults_without_environment() {
        let settings = settings(&[], &[]);
        assert_eq!(settings.data_dir, PathBuf::from("./.thermostat"));
        assert!(!settings.regenerate_config);
        assert_eq!(settings.http_port, None);
    }

    #[test]
    fn regen_flag_and_ports_are_read() {
        let settings = settings(
            &["--regen-config"],
            &[("THERMOSTAT_HTTP_PORT", "8080"), ("MQTT_PORT", "not-a-port")],
        );
        assert!(settings.regenerate_config);
        assert_eq!(settings.http_port, Some(8080));
        assert_eq!(settings.mqtt_port, None);
    }

    #[test]
    fn environment_overrides_connection_section() {
        let settings = settings(
            &[],
            &[
                ("MQTT_HOST", "broker.local"),
                ("MQTT_PORT", "8883"),
                ("MQTT_USER", "hall"),
                ("MQTT_PASS", "s3cret"),
                ("DEVICE_ID", "hall-thermostat"),
            ],
        );
        let document = ConnectionConfig::default();
        let connection = settings.connection(&document);

        assert_eq!(connection.host, "broker.local");
        assert_eq!(connection.port, 8883);
        assert_eq!(connection.username, "hall");
        assert_eq!(connection.secret, "s3cret");
        assert_eq!(connection.device_id, "hall-thermostat");
        assert_eq!(connection.keep_alive_seconds, document.keep_alive_seconds);
    }

    #[test]
    fn unset_variables_keep_document_values() {
        let document = ConnectionConfig {
            host: "from-document".to_string(),
            ..ConnectionConfig::default()
        };
        assert_eq!(settings(&[], &[]).connection(&document), document);
    }
}
