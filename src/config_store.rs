//! Configuration Store (§4.1): the durable list of published-node entries.
//!
//! Mirrors the teacher's config-cache + config-file pattern (`BatataConfigService`
//! plus its on-disk snapshot processor): an in-memory map guarded by a single
//! mutex, with file I/O serialized behind a second mutex so a slow write
//! never blocks a concurrent read of the in-memory state. The in-memory
//! state is the source of truth; the file may lag on write failure (Open
//! Question, §9 — documented here and in DESIGN.md).

use parking_lot::Mutex;
use tracing::{error, info, warn};

use crate::error::Result;
use crate::model::{node_id::NodeId, EndpointEntry, NodeEntry, NodeOverrides};

struct ConfigState {
    endpoints: Vec<EndpointEntry>,
    version: u64,
}

/// Owns the persisted JSON document described in §4.1 and §6.
pub struct ConfigStore {
    path: String,
    state: Mutex<ConfigState>,
    file_lock: tokio::sync::Mutex<()>,
}

/// A continuation token opaque to callers: high 32 bits are the config
/// version at enumeration time, low 32 bits are the next offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContinuationToken(pub u64);

impl ContinuationToken {
    pub fn new(version: u64, offset: u32) -> Self {
        Self((version << 32) | offset as u64)
    }

    pub fn version(&self) -> u64 {
        self.0 >> 32
    }

    pub fn offset(&self) -> u32 {
        (self.0 & 0xFFFF_FFFF) as u32
    }
}

impl ConfigStore {
    /// Load the configuration file if present. A missing file is not an
    /// error (§4.1); a present-but-unparsable file is fatal at startup
    /// (§7) and is surfaced to the caller, who exits the process.
    pub async fn load(path: impl Into<String>) -> Result<Self> {
        let path = path.into();
        let endpoints = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => crate::model::config_entry::parse_document(&raw)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("no configuration file at {path}, starting empty");
                Vec::new()
            }
            Err(e) => return Err(anyhow::anyhow!("reading configuration file {path}: {e}").into()),
        };

        Ok(Self {
            path,
            state: Mutex::new(ConfigState {
                endpoints,
                version: 0,
            }),
            file_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// Current configuration version.
    pub fn version(&self) -> u64 {
        self.state.lock().version
    }

    /// Enumerate endpoints (optionally filtered), returning the version
    /// stamp a caller should embed in its pagination token.
    pub fn enumerate(&self, endpoint_filter: Option<&str>) -> (Vec<EndpointEntry>, u64) {
        self.enumerate_from(endpoint_filter, 0)
    }

    /// Enumerate endpoints matching `endpoint_filter`, skipping the first
    /// `offset` of them (§4.1 continuation-token offset, §4.5 pagination).
    pub fn enumerate_from(
        &self,
        endpoint_filter: Option<&str>,
        offset: usize,
    ) -> (Vec<EndpointEntry>, u64) {
        let guard = self.state.lock();
        let endpoints = guard
            .endpoints
            .iter()
            .filter(|e| endpoint_filter.is_none_or(|f| e.endpoint_url == f))
            .skip(offset)
            .cloned()
            .collect();
        (endpoints, guard.version)
    }

    /// Enumerate the nodes configured on one endpoint, skipping the first
    /// `offset` of them, for `GetConfiguredNodesOnEndpoint` pagination.
    pub fn enumerate_nodes_from(
        &self,
        endpoint_url: &str,
        offset: usize,
    ) -> (Vec<NodeEntry>, u64) {
        let guard = self.state.lock();
        let nodes = guard
            .endpoints
            .iter()
            .find(|e| e.endpoint_url == endpoint_url)
            .map(|e| e.nodes.iter().skip(offset).cloned().collect())
            .unwrap_or_default();
        (nodes, guard.version)
    }

    /// Validate a caller-supplied continuation token against the current
    /// version (§4.5, §8 property 8).
    pub fn check_token_version(&self, token: ContinuationToken) -> Result<()> {
        let current = self.version();
        if token.version() != current {
            return Err(crate::error::GatewayError::VersionMismatch {
                requested: token.version(),
                current,
            });
        }
        Ok(())
    }

    /// Add a node to an endpoint's configuration, creating the endpoint
    /// entry if needed. Returns `true` if this was a new node (version
    /// advances), `false` if the node was already configured.
    pub fn add_node(
        &self,
        endpoint_url: &str,
        use_security: bool,
        node_id: NodeId,
        overrides: NodeOverrides,
    ) -> bool {
        let mut guard = self.state.lock();
        let key = node_id.canonical_key();

        let endpoint = match guard
            .endpoints
            .iter_mut()
            .find(|e| e.endpoint_url == endpoint_url)
        {
            Some(e) => e,
            None => {
                guard
                    .endpoints
                    .push(EndpointEntry::new(endpoint_url, use_security));
                guard.endpoints.last_mut().unwrap()
            }
        };

        if endpoint.find_node(&key).is_some() {
            return false;
        }

        endpoint.nodes.push(NodeEntry {
            id: node_id,
            overrides,
        });
        guard.version += 1;
        true
    }

    /// Remove nodes from an endpoint. An empty `node_keys` removes all nodes
    /// on the endpoint. Returns the count removed.
    pub fn remove_nodes(&self, endpoint_url: &str, node_keys: &[String]) -> usize {
        let mut guard = self.state.lock();
        let Some(endpoint) = guard
            .endpoints
            .iter_mut()
            .find(|e| e.endpoint_url == endpoint_url)
        else {
            return 0;
        };

        let before = endpoint.nodes.len();
        if node_keys.is_empty() {
            endpoint.nodes.clear();
        } else {
            endpoint
                .nodes
                .retain(|n| !node_keys.contains(&n.id.canonical_key()));
        }
        let removed = before - endpoint.nodes.len();

        if endpoint.nodes.is_empty() {
            guard.endpoints.retain(|e| e.endpoint_url != endpoint_url);
        }

        if removed > 0 {
            guard.version += 1;
        }
        removed
    }

    /// Advance `NodeConfigVersion` for a structural runtime change not
    /// driven through [`ConfigStore::add_node`]/[`ConfigStore::remove_nodes`]
    /// — pruning an empty subscription or session (§3 invariants, §4.2 step
    /// 6). Callers persist only if this (or an add/remove) touched the
    /// version during their cycle.
    pub fn bump_version(&self) {
        self.state.lock().version += 1;
    }

    /// Update the authentication descriptor for an endpoint.
    pub fn set_auth(&self, endpoint_url: &str, auth: crate::model::AuthMode) -> bool {
        let mut guard = self.state.lock();
        let Some(endpoint) = guard
            .endpoints
            .iter_mut()
            .find(|e| e.endpoint_url == endpoint_url)
        else {
            return false;
        };
        if endpoint.auth == auth {
            return false;
        }
        endpoint.auth = auth;
        guard.version += 1;
        true
    }

    /// Persist the current structure to disk, pretty-printed. Write failures
    /// are logged and the caller continues (§4.1, §7) — the in-memory state
    /// stays the source of truth.
    pub async fn persist(&self) {
        let (snapshot, path) = {
            let guard = self.state.lock();
            (guard.endpoints.clone(), self.path.clone())
        };

        let _file_guard = self.file_lock.lock().await;
        let body = match crate::model::config_entry::serialize_document(&snapshot) {
            Ok(body) => body,
            Err(e) => {
                error!("failed to serialize configuration for persist: {e}");
                return;
            }
        };

        if let Err(e) = tokio::fs::write(&path, body).await {
            warn!("failed to write configuration file {path}: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::NodeOverrides;

    #[tokio::test]
    async fn test_load_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nodes.json");
        let store = ConfigStore::load(path.to_str().unwrap()).await.unwrap();
        assert_eq!(store.version(), 0);
        assert_eq!(store.enumerate(None).0.len(), 0);
    }

    #[tokio::test]
    async fn test_add_node_advances_version() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nodes.json");
        let store = ConfigStore::load(path.to_str().unwrap()).await.unwrap();

        let added = store.add_node(
            "opc.tcp://s:1",
            false,
            NodeId::parse("ns=1;i=2"),
            NodeOverrides::default(),
        );
        assert!(added);
        assert_eq!(store.version(), 1);

        let added_again = store.add_node(
            "opc.tcp://s:1",
            false,
            NodeId::parse("ns=1;i=2"),
            NodeOverrides::default(),
        );
        assert!(!added_again);
        assert_eq!(store.version(), 1);
    }

    #[tokio::test]
    async fn test_remove_nodes_empty_list_removes_all() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nodes.json");
        let store = ConfigStore::load(path.to_str().unwrap()).await.unwrap();
        store.add_node(
            "opc.tcp://s:1",
            false,
            NodeId::parse("ns=1;i=2"),
            NodeOverrides::default(),
        );
        store.add_node(
            "opc.tcp://s:1",
            false,
            NodeId::parse("ns=1;i=3"),
            NodeOverrides::default(),
        );
        let removed = store.remove_nodes("opc.tcp://s:1", &[]);
        assert_eq!(removed, 2);
        assert_eq!(store.enumerate(None).0.len(), 0);
    }

    #[tokio::test]
    async fn test_persist_then_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nodes.json");
        {
            let store = ConfigStore::load(path.to_str().unwrap()).await.unwrap();
            store.add_node(
                "opc.tcp://s:1",
                true,
                NodeId::parse("ns=2;i=5"),
                NodeOverrides::default(),
            );
            store.persist().await;
        }

        let reloaded = ConfigStore::load(path.to_str().unwrap()).await.unwrap();
        let (entries, _) = reloaded.enumerate(None);
        assert_eq!(entries.len(), 1);
        assert!(entries[0].use_security);
    }

    #[tokio::test]
    async fn test_continuation_token_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nodes.json");
        let store = ConfigStore::load(path.to_str().unwrap()).await.unwrap();
        let token = ContinuationToken::new(store.version(), 0);
        store.add_node(
            "opc.tcp://s:1",
            false,
            NodeId::parse("ns=1;i=2"),
            NodeOverrides::default(),
        );
        assert!(store.check_token_version(token).is_err());
    }
}
