//! Durable published-node configuration entries (§3, §6).
//!
//! Two on-disk shapes are accepted for backward compatibility: a nested
//! `{EndpointUrl, UseSecurity, OpcNodes[]}` record, and a legacy flat
//! `{EndpointUrl, NodeId}` record. Both normalize to [`EndpointEntry`].

use serde::{Deserialize, Serialize};

use super::node_id::NodeId;

/// Authentication descriptor for a session. The password is never stored in
/// plaintext in memory — see [`crate::crypto`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum AuthMode {
    Anonymous,
    UsernamePassword { username: String, password: String },
}

impl Default for AuthMode {
    fn default() -> Self {
        AuthMode::Anonymous
    }
}

/// Per-node configuration overrides, all optional and defaulted from
/// [`crate::settings::Settings`] when absent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeOverrides {
    pub publishing_interval_ms: Option<i64>,
    pub sampling_interval_ms: Option<i64>,
    pub display_name: Option<String>,
    pub heartbeat_interval_secs: Option<u32>,
    pub skip_first: Option<bool>,
}

/// One configured node, durable.
#[derive(Debug, Clone)]
pub struct NodeEntry {
    pub id: NodeId,
    pub overrides: NodeOverrides,
}

/// All nodes configured for a single endpoint, durable.
#[derive(Debug, Clone)]
pub struct EndpointEntry {
    pub endpoint_url: String,
    pub use_security: bool,
    pub auth: AuthMode,
    pub nodes: Vec<NodeEntry>,
}

impl EndpointEntry {
    pub fn new(endpoint_url: impl Into<String>, use_security: bool) -> Self {
        Self {
            endpoint_url: endpoint_url.into(),
            use_security,
            auth: AuthMode::Anonymous,
            nodes: Vec::new(),
        }
    }

    pub fn find_node(&self, key: &str) -> Option<&NodeEntry> {
        self.nodes.iter().find(|n| n.id.canonical_key() == key)
    }
}

// ---- On-disk JSON shapes -------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
struct OpcNodeOnDisk {
    #[serde(rename = "Id", default, skip_serializing_if = "Option::is_none")]
    id: Option<String>,
    #[serde(
        rename = "ExpandedNodeId",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    expanded_node_id: Option<String>,
    #[serde(
        rename = "OpcPublishingInterval",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    opc_publishing_interval: Option<i64>,
    #[serde(
        rename = "OpcSamplingInterval",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    opc_sampling_interval: Option<i64>,
    #[serde(
        rename = "DisplayName",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    display_name: Option<String>,
    #[serde(
        rename = "HeartbeatInterval",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    heartbeat_interval: Option<u32>,
    #[serde(rename = "SkipFirst", default, skip_serializing_if = "Option::is_none")]
    skip_first: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct NestedEndpointOnDisk {
    #[serde(rename = "EndpointUrl")]
    endpoint_url: String,
    #[serde(rename = "UseSecurity", default)]
    use_security: bool,
    #[serde(rename = "OpcNodes", default)]
    opc_nodes: Vec<OpcNodeOnDisk>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct FlatEndpointOnDisk {
    #[serde(rename = "EndpointUrl")]
    endpoint_url: String,
    #[serde(rename = "NodeId")]
    node_id: String,
}

/// Either on-disk shape; tried in order (nested first) during deserialization.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum EntryOnDisk {
    Nested(NestedEndpointOnDisk),
    Flat(FlatEndpointOnDisk),
}

impl From<EntryOnDisk> for EndpointEntry {
    fn from(entry: EntryOnDisk) -> Self {
        match entry {
            EntryOnDisk::Flat(flat) => {
                let mut e = EndpointEntry::new(flat.endpoint_url, false);
                e.nodes.push(NodeEntry {
                    id: NodeId::parse(&flat.node_id),
                    overrides: NodeOverrides::default(),
                });
                e
            }
            EntryOnDisk::Nested(nested) => {
                let mut e = EndpointEntry::new(nested.endpoint_url, nested.use_security);
                for n in nested.opc_nodes {
                    let raw_id = n
                        .id
                        .or(n.expanded_node_id)
                        .unwrap_or_default();
                    e.nodes.push(NodeEntry {
                        id: NodeId::parse(&raw_id),
                        overrides: NodeOverrides {
                            publishing_interval_ms: n.opc_publishing_interval,
                            sampling_interval_ms: n.opc_sampling_interval,
                            display_name: n.display_name,
                            heartbeat_interval_secs: n.heartbeat_interval,
                            skip_first: n.skip_first,
                        },
                    });
                }
                e
            }
        }
    }
}

impl From<&EndpointEntry> for NestedEndpointOnDisk {
    fn from(e: &EndpointEntry) -> Self {
        NestedEndpointOnDisk {
            endpoint_url: e.endpoint_url.clone(),
            use_security: e.use_security,
            opc_nodes: e
                .nodes
                .iter()
                .map(|n| OpcNodeOnDisk {
                    id: Some(n.id.raw().to_string()),
                    expanded_node_id: None,
                    opc_publishing_interval: n.overrides.publishing_interval_ms,
                    opc_sampling_interval: n.overrides.sampling_interval_ms,
                    display_name: n.overrides.display_name.clone(),
                    heartbeat_interval: n.overrides.heartbeat_interval_secs,
                    skip_first: n.overrides.skip_first,
                })
                .collect(),
        }
    }
}

/// Parse the whole configuration-file document: a JSON array of entries in
/// either accepted shape. A missing file is not an error at this layer — the
/// caller treats an absent path as an empty document (§4.1).
pub fn parse_document(raw: &str) -> crate::error::Result<Vec<EndpointEntry>> {
    let entries: Vec<EntryOnDisk> = serde_json::from_str(raw)
        .map_err(|e| crate::error::GatewayError::ConfigParse(e.to_string()))?;
    Ok(entries.into_iter().map(EndpointEntry::from).collect())
}

/// Serialize the whole configuration document, pretty-printed, in the
/// canonical nested shape.
pub fn serialize_document(entries: &[EndpointEntry]) -> crate::error::Result<String> {
    let on_disk: Vec<NestedEndpointOnDisk> = entries.iter().map(NestedEndpointOnDisk::from).collect();
    serde_json::to_string_pretty(&on_disk).map_err(|e| anyhow::anyhow!(e).into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_nested_shape() {
        let raw = r#"[
            { "EndpointUrl": "opc.tcp://s:1", "UseSecurity": true,
              "OpcNodes": [ { "Id": "ns=2;i=5", "HeartbeatInterval": 30 } ] }
        ]"#;
        let entries = parse_document(raw).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].endpoint_url, "opc.tcp://s:1");
        assert!(entries[0].use_security);
        assert_eq!(entries[0].nodes.len(), 1);
        assert_eq!(
            entries[0].nodes[0].overrides.heartbeat_interval_secs,
            Some(30)
        );
    }

    #[test]
    fn test_parse_legacy_flat_shape() {
        let raw = r#"[ { "EndpointUrl": "opc.tcp://s:1", "NodeId": "ns=1;i=2" } ]"#;
        let entries = parse_document(raw).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].nodes.len(), 1);
        assert_eq!(entries[0].nodes[0].id.raw(), "ns=1;i=2");
    }

    #[test]
    fn test_parse_expanded_node_id_synonym() {
        let raw = r#"[
            { "EndpointUrl": "opc.tcp://s:1",
              "OpcNodes": [ { "ExpandedNodeId": "nsu=http://x/;i=9" } ] }
        ]"#;
        let entries = parse_document(raw).unwrap();
        assert!(matches!(entries[0].nodes[0].id, NodeId::NamespaceUri { .. }));
    }

    #[test]
    fn test_round_trip_normalizes_to_canonical_shape() {
        let mut e = EndpointEntry::new("opc.tcp://s:1", false);
        e.nodes.push(NodeEntry {
            id: NodeId::parse("ns=2;i=5"),
            overrides: NodeOverrides {
                skip_first: Some(true),
                ..Default::default()
            },
        });
        let json = serialize_document(&[e]).unwrap();
        let back = parse_document(&json).unwrap();
        assert_eq!(back[0].endpoint_url, "opc.tcp://s:1");
        assert_eq!(back[0].nodes[0].overrides.skip_first, Some(true));
    }
}
