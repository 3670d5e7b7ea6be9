//! OPC UA node identifier parsing and canonicalization.

use serde::{Deserialize, Serialize};

use crate::error::GatewayError;

/// A node identifier as it appears in configuration: either a namespace-index
/// form (`ns=2;i=5`) or a namespace-uri expanded form (`nsu=http://...;i=5`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeId {
    /// Namespace-index node id, resolved directly once connected.
    NamespaceIndex { raw: String },
    /// Namespace-uri expanded node id; the namespace index is resolved from
    /// the session's namespace table after connect.
    NamespaceUri { raw: String },
}

impl NodeId {
    /// Parse an identifier string. `nsu=` prefixed strings are expanded node
    /// ids; everything else is treated as a namespace-index node id.
    pub fn parse(raw: &str) -> Self {
        if raw.starts_with("nsu=") {
            NodeId::NamespaceUri {
                raw: raw.to_string(),
            }
        } else {
            NodeId::NamespaceIndex {
                raw: raw.to_string(),
            }
        }
    }

    pub fn raw(&self) -> &str {
        match self {
            NodeId::NamespaceIndex { raw } | NodeId::NamespaceUri { raw } => raw,
        }
    }

    /// Resolve to both identifier forms using the session's namespace
    /// table (index = position, per §4.2 "fetch the namespace array").
    /// Returns [`GatewayError::BadNodeId`] for a malformed identifier or an
    /// out-of-range namespace index, and [`GatewayError::UnknownNamespace`]
    /// for a namespace-uri form not present in the table (§7 "node
    /// resolution failure" — the caller logs and leaves the item
    /// Unmonitored).
    pub fn resolve(&self, namespace_table: &[String]) -> Result<(String, String), GatewayError> {
        let raw = self.raw();
        let mut parts: Vec<&str> = raw.split(';').collect();
        if parts.is_empty() {
            return Err(GatewayError::BadNodeId(format!("empty node identifier: {raw}")));
        }
        let ns_part = parts.remove(0);
        let rest = parts.join(";");

        match self {
            NodeId::NamespaceIndex { .. } => {
                let index: usize = ns_part
                    .strip_prefix("ns=")
                    .unwrap_or("0")
                    .parse()
                    .map_err(|_| GatewayError::BadNodeId(format!("invalid namespace index in {raw}")))?;
                let uri = namespace_table.get(index).cloned().ok_or_else(|| {
                    GatewayError::BadNodeId(format!("namespace index {index} out of range for {raw}"))
                })?;
                Ok((raw.to_string(), format!("nsu={uri};{rest}")))
            }
            NodeId::NamespaceUri { .. } => {
                let uri = ns_part.strip_prefix("nsu=").unwrap_or(ns_part);
                let index = namespace_table
                    .iter()
                    .position(|u| u == uri)
                    .ok_or_else(|| GatewayError::UnknownNamespace(uri.to_string()))?;
                Ok((format!("ns={index};{rest}"), raw.to_string()))
            }
        }
    }

    /// Canonicalize one `key=value` node-identifier component. The numeric
    /// forms (`ns=`, the namespace index; `i=`, a numeric identifier) are
    /// parsed and reformatted so that leading zeros don't produce a
    /// different key — `i=5` and `i=05` must canonicalize identically
    /// (SPEC_FULL.md §B). String/GUID/opaque components (`s=`, `g=`, `b=`)
    /// are compared as-is.
    fn canonical_component(part: &str) -> String {
        match part.split_once('=') {
            Some(("ns", value)) | Some(("i", value)) => match value.parse::<u64>() {
                Ok(n) => format!("{}={n}", &part[..part.find('=').unwrap()]),
                Err(_) => part.to_string(),
            },
            _ => part.to_string(),
        }
    }

    /// Canonical key used for equality/dedup: endpoint + identifier, with the
    /// identifier's component key=value pairs numerically normalized and
    /// sorted so that `ns=2;i=5`, `i=5;ns=2`, and `ns=2;i=05` all compare
    /// equal.
    pub fn canonical_key(&self) -> String {
        let mut parts: Vec<String> = self
            .raw()
            .trim_start_matches("nsu=")
            .split(';')
            .map(Self::canonical_component)
            .collect();
        parts.sort_unstable();
        let prefix = if matches!(self, NodeId::NamespaceUri { .. }) {
            "nsu="
        } else {
            ""
        };
        format!("{prefix}{}", parts.join(";"))
    }
}
