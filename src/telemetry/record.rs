//! Telemetry Record (§3) and field-inclusion / encoding rules (§4.3, §6).

use serde_json::{Map, Value};

/// One value-change notification, ready to be encoded into a hub message.
#[derive(Debug, Clone)]
pub struct TelemetryRecord {
    pub endpoint_url: String,
    pub node_id: String,
    pub expanded_node_id: String,
    pub application_uri: String,
    pub display_name: String,
    /// The value as a raw JSON fragment (not yet embedded in an object).
    pub value_json: String,
    /// Whether `value_json` is a quoted JSON string literal (true) or a bare
    /// JSON primitive/array/object (false) — controls whether it is
    /// re-embedded quoted or raw.
    pub preserve_value_quotes: bool,
    pub source_timestamp: chrono::DateTime<chrono::Utc>,
    pub status_code: u32,
    pub status_symbolic: String,
}

/// Extract the value fragment from the OPC UA stack's JSON encoder output.
///
/// The stack's encoder always wraps a `DataValue` as
/// `{"Value":{"Value":<payload>}}`. This is a workaround for the encoder
/// always emitting that wrapper (Design Notes §9) — isolated behind this one
/// function so a proper replacement encoder can be swapped in later without
/// touching call sites.
///
/// If the payload starts with `"` it is a quoted JSON string: returns it with
/// `preserve_value_quotes = true`. Otherwise it is a bare JSON primitive:
/// returns it with `preserve_value_quotes = false`. Either way the two
/// trailing closing braces of the wrapper (and, for strings, the closing
/// quote) are stripped.
pub fn extract_value_fragment(encoded: &str) -> (String, bool) {
    const PREFIX: &str = r#"{"Value":{"Value":"#;
    let payload = encoded.strip_prefix(PREFIX).unwrap_or(encoded);

    if let Some(rest) = payload.strip_prefix('"') {
        // Quoted string: strip the trailing `"}}` (closing quote + two braces).
        let trimmed = rest.strip_suffix("\"}}").unwrap_or(rest);
        (trimmed.to_string(), true)
    } else {
        // Bare primitive: strip the trailing `}}`.
        let trimmed = payload.strip_suffix("}}").unwrap_or(payload);
        (trimmed.to_string(), false)
    }
}

/// Per-endpoint field-inclusion configuration (§4.3 point 4).
#[derive(Debug, Clone)]
pub struct TelemetryFieldConfig {
    pub publish_endpoint_url: bool,
    pub publish_node_id: bool,
    pub publish_expanded_node_id: bool,
    pub publish_application_uri: bool,
    pub publish_display_name: bool,
    pub publish_value: bool,
    pub publish_source_timestamp: bool,
    pub publish_status_code: bool,
    pub publish_status_symbolic: bool,
    /// When true, omit the nested `MonitoredItem`/`Value` sub-objects and
    /// flatten their fields into the top-level object.
    pub flat: bool,
    /// IoT-Central mode: reduce the record to `{displayName: value}`.
    pub iot_central_mode: bool,
}

impl Default for TelemetryFieldConfig {
    fn default() -> Self {
        Self {
            publish_endpoint_url: true,
            publish_node_id: true,
            publish_expanded_node_id: false,
            publish_application_uri: true,
            publish_display_name: true,
            publish_value: true,
            publish_source_timestamp: true,
            publish_status_code: true,
            publish_status_symbolic: true,
            flat: false,
            iot_central_mode: false,
        }
    }
}

fn value_fragment_to_json(record: &TelemetryRecord) -> Value {
    if record.preserve_value_quotes {
        Value::String(record.value_json.clone())
    } else {
        serde_json::from_str(&record.value_json).unwrap_or(Value::Null)
    }
}

/// Encode a [`TelemetryRecord`] into its JSON object, honoring the field
/// mask and grouping mode (§4.3 point 4, §6 default shape).
pub fn encode_record(record: &TelemetryRecord, cfg: &TelemetryFieldConfig) -> Value {
    if cfg.iot_central_mode {
        let mut obj = Map::new();
        obj.insert(record.display_name.clone(), value_fragment_to_json(record));
        return Value::Object(obj);
    }

    let mut top = Map::new();
    if cfg.publish_endpoint_url {
        top.insert(
            "EndpointUrl".to_string(),
            Value::String(record.endpoint_url.clone()),
        );
    }
    if cfg.publish_node_id {
        top.insert("NodeId".to_string(), Value::String(record.node_id.clone()));
    }

    let mut monitored_item = Map::new();
    if cfg.publish_application_uri {
        monitored_item.insert(
            "ApplicationUri".to_string(),
            Value::String(record.application_uri.clone()),
        );
    }
    if cfg.publish_display_name {
        monitored_item.insert(
            "DisplayName".to_string(),
            Value::String(record.display_name.clone()),
        );
    }
    if cfg.publish_expanded_node_id {
        monitored_item.insert(
            "ExpandedNodeId".to_string(),
            Value::String(record.expanded_node_id.clone()),
        );
    }

    let mut value = Map::new();
    if cfg.publish_value {
        value.insert("Value".to_string(), value_fragment_to_json(record));
    }
    if cfg.publish_source_timestamp {
        value.insert(
            "SourceTimestamp".to_string(),
            Value::String(record.source_timestamp.to_rfc3339()),
        );
    }
    if cfg.publish_status_code {
        value.insert(
            "StatusCode".to_string(),
            Value::Number(record.status_code.into()),
        );
    }
    if cfg.publish_status_symbolic {
        value.insert(
            "Status".to_string(),
            Value::String(record.status_symbolic.clone()),
        );
    }

    if cfg.flat {
        top.extend(monitored_item);
        top.extend(value);
    } else {
        if !monitored_item.is_empty() {
            top.insert("MonitoredItem".to_string(), Value::Object(monitored_item));
        }
        if !value.is_empty() {
            top.insert("Value".to_string(), Value::Object(value));
        }
    }

    Value::Object(top)
}

/// Serialize an encoded record to a compact JSON string.
pub fn to_json_string(value: &Value) -> String {
    serde_json::to_string(value).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_record() -> TelemetryRecord {
        TelemetryRecord {
            endpoint_url: "opc.tcp://srv:4840".to_string(),
            node_id: "ns=2;i=10".to_string(),
            expanded_node_id: "nsu=http://x/;i=10".to_string(),
            application_uri: "urn:test:server".to_string(),
            display_name: "Temperature".to_string(),
            value_json: "42".to_string(),
            preserve_value_quotes: false,
            source_timestamp: chrono::Utc::now(),
            status_code: 0,
            status_symbolic: "Good".to_string(),
        }
    }

    #[test]
    fn test_extract_value_fragment_primitive() {
        let (frag, quoted) = extract_value_fragment(r#"{"Value":{"Value":42}}"#);
        assert_eq!(frag, "42");
        assert!(!quoted);
    }

    #[test]
    fn test_extract_value_fragment_string() {
        let (frag, quoted) = extract_value_fragment(r#"{"Value":{"Value":"hello"}}"#);
        assert_eq!(frag, "hello");
        assert!(quoted);
    }

    #[test]
    fn test_encode_default_shape() {
        let record = sample_record();
        let cfg = TelemetryFieldConfig::default();
        let encoded = encode_record(&record, &cfg);
        assert_eq!(encoded["EndpointUrl"], "opc.tcp://srv:4840");
        assert_eq!(encoded["MonitoredItem"]["DisplayName"], "Temperature");
        assert_eq!(encoded["Value"]["Value"], 42);
        assert_eq!(encoded["Value"]["Status"], "Good");
    }

    #[test]
    fn test_encode_flat_shape() {
        let record = sample_record();
        let cfg = TelemetryFieldConfig {
            flat: true,
            ..Default::default()
        };
        let encoded = encode_record(&record, &cfg);
        assert_eq!(encoded["DisplayName"], "Temperature");
        assert!(encoded.get("MonitoredItem").is_none());
    }

    #[test]
    fn test_encode_iot_central_shape() {
        let record = sample_record();
        let cfg = TelemetryFieldConfig {
            iot_central_mode: true,
            ..Default::default()
        };
        let encoded = encode_record(&record, &cfg);
        assert_eq!(encoded, serde_json::json!({"Temperature": 42}));
    }

    #[test]
    fn test_encode_preserves_string_quoting() {
        let mut record = sample_record();
        record.value_json = "on".to_string();
        record.preserve_value_quotes = true;
        let cfg = TelemetryFieldConfig::default();
        let encoded = encode_record(&record, &cfg);
        assert_eq!(encoded["Value"]["Value"], "on");
    }
}
