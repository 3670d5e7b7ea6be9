//! Runtime configuration knobs (§6 of the specification).
//!
//! Read once at startup from environment variables into a plain struct and
//! handed down as `Arc<Settings>`. There is no process-wide mutable global —
//! components that need a setting hold a clone of the `Arc`.

use std::collections::HashSet;
use std::time::Duration;

/// Runtime settings, sourced from environment variables with the defaults
/// and bounds documented in the specification's External Interfaces section.
#[derive(Debug, Clone)]
pub struct Settings {
    pub monitored_items_queue_capacity: usize,
    pub hub_message_size: usize,
    pub send_interval: Duration,
    pub diagnostics_interval: i64,
    pub session_connect_wait: Duration,
    pub opc_session_creation_timeout: Duration,
    pub opc_session_creation_backoff_max: u32,
    pub opc_keep_alive_interval: Duration,
    pub opc_keep_alive_disconnect_threshold: u32,
    pub opc_publishing_interval_ms: i64,
    pub opc_sampling_interval_ms: i64,
    pub heartbeat_interval_default: u32,
    pub skip_first_default: bool,
    pub fetch_display_name: bool,
    pub suppressed_opc_status_codes: HashSet<String>,
    pub max_response_payload_length: usize,

    pub hub_connection_string: Option<String>,
    pub log_file: Option<String>,
    pub certificate_store: String,
    pub configuration_file: String,
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            monitored_items_queue_capacity: 8192,
            hub_message_size: 262_144,
            send_interval: Duration::from_secs(10),
            diagnostics_interval: 0,
            session_connect_wait: Duration::from_secs(10),
            opc_session_creation_timeout: Duration::from_secs(15),
            opc_session_creation_backoff_max: 5,
            opc_keep_alive_interval: Duration::from_secs(2),
            opc_keep_alive_disconnect_threshold: 3,
            opc_publishing_interval_ms: 1000,
            opc_sampling_interval_ms: -1,
            heartbeat_interval_default: 0,
            skip_first_default: false,
            fetch_display_name: false,
            suppressed_opc_status_codes: default_suppressed_status_codes(),
            max_response_payload_length: 128 * 1024,
            hub_connection_string: None,
            log_file: None,
            certificate_store: "./certs".to_string(),
            configuration_file: "./opc-publisher-nodes.json".to_string(),
        }
    }
}

fn default_suppressed_status_codes() -> HashSet<String> {
    ["BadNoCommunication", "BadWaitingForInitialData"]
        .into_iter()
        .map(str::to_string)
        .collect()
}

impl Settings {
    /// Load settings from environment variables, falling back to defaults
    /// for anything unset or unparsable.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let suppressed = std::env::var("GATEWAY_SUPPRESSED_OPC_STATUS_CODES")
            .ok()
            .map(|v| parse_suppressed_status_codes(&v))
            .unwrap_or(defaults.suppressed_opc_status_codes);

        Self {
            monitored_items_queue_capacity: env_or(
                "GATEWAY_MONITORED_ITEMS_QUEUE_CAPACITY",
                defaults.monitored_items_queue_capacity,
            )
            .max(1024),
            hub_message_size: env_or("GATEWAY_HUB_MESSAGE_SIZE", defaults.hub_message_size)
                .min(262_144),
            send_interval: Duration::from_secs(env_or(
                "GATEWAY_SEND_INTERVAL_SECONDS",
                defaults.send_interval.as_secs(),
            )),
            diagnostics_interval: env_or(
                "GATEWAY_DIAGNOSTICS_INTERVAL",
                defaults.diagnostics_interval,
            ),
            session_connect_wait: Duration::from_secs(
                env_or(
                    "GATEWAY_SESSION_CONNECT_WAIT_SECONDS",
                    defaults.session_connect_wait.as_secs(),
                )
                .max(10),
            ),
            opc_session_creation_timeout: Duration::from_secs(env_or(
                "GATEWAY_OPC_SESSION_CREATION_TIMEOUT_SECONDS",
                defaults.opc_session_creation_timeout.as_secs(),
            )),
            opc_session_creation_backoff_max: env_or(
                "GATEWAY_OPC_SESSION_CREATION_BACKOFF_MAX",
                defaults.opc_session_creation_backoff_max,
            ),
            opc_keep_alive_interval: Duration::from_secs(
                env_or(
                    "GATEWAY_OPC_KEEP_ALIVE_INTERVAL_SECONDS",
                    defaults.opc_keep_alive_interval.as_secs(),
                )
                .max(2),
            ),
            opc_keep_alive_disconnect_threshold: env_or(
                "GATEWAY_OPC_KEEP_ALIVE_DISCONNECT_THRESHOLD",
                defaults.opc_keep_alive_disconnect_threshold,
            )
            .max(2),
            opc_publishing_interval_ms: env_or(
                "GATEWAY_OPC_PUBLISHING_INTERVAL",
                defaults.opc_publishing_interval_ms,
            ),
            opc_sampling_interval_ms: env_or(
                "GATEWAY_OPC_SAMPLING_INTERVAL",
                defaults.opc_sampling_interval_ms,
            ),
            heartbeat_interval_default: env_or(
                "GATEWAY_HEARTBEAT_INTERVAL_DEFAULT",
                defaults.heartbeat_interval_default,
            )
            .min(86_400),
            skip_first_default: env_or(
                "GATEWAY_SKIP_FIRST_DEFAULT",
                defaults.skip_first_default,
            ),
            fetch_display_name: env_or("GATEWAY_FETCH_DISPLAY_NAME", defaults.fetch_display_name),
            suppressed_opc_status_codes: suppressed,
            max_response_payload_length: env_or(
                "GATEWAY_MAX_RESPONSE_PAYLOAD_LENGTH",
                defaults.max_response_payload_length,
            ),
            hub_connection_string: std::env::var("GATEWAY_HUB_CONNECTION_STRING").ok(),
            log_file: std::env::var("GATEWAY_LOG_FILE").ok(),
            certificate_store: std::env::var("GATEWAY_CERT_STORE")
                .unwrap_or(defaults.certificate_store),
            configuration_file: std::env::var("GATEWAY_CONFIG_FILE")
                .unwrap_or(defaults.configuration_file),
        }
    }
}

fn parse_suppressed_status_codes(raw: &str) -> HashSet<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings() {
        let s = Settings::default();
        assert_eq!(s.monitored_items_queue_capacity, 8192);
        assert_eq!(s.hub_message_size, 262_144);
        assert!(
            s.suppressed_opc_status_codes
                .contains("BadNoCommunication")
        );
    }

    #[test]
    fn test_parse_suppressed_status_codes() {
        let set = parse_suppressed_status_codes("BadNoCommunication, BadOutOfService ,,");
        assert_eq!(set.len(), 2);
        assert!(set.contains("BadOutOfService"));
    }
}
