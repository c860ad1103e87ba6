//! Peer-federation service (§4.1): peer CRUD, sync state, and the sync
//! engine. A process-wide singleton in spirit, but constructed explicitly
//! and handed to callers via `Arc` rather than kept as an ambient global
//! (§9 design note).

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{FederationError, FederationResult};
use crate::models::{
    NewPeerConfig, PeerConfig, PeerConfigUpdate, PeerSyncStatus, RecordKind, RegisteredRecord,
    SyncHistoryEntry, SyncMetadata, SyncMode, SyncResult,
};
use crate::peer_client::PeerClient;
use crate::peer_store::PeerStore;
use crate::record_store::RecordStore;
use crate::scan_store::ScanStore;
use crate::token_source::TokenSource;

struct ServiceState {
    peers: HashMap<String, PeerConfig>,
    sync_status: HashMap<String, PeerSyncStatus>,
}

pub struct PeerFederationService {
    state: Mutex<ServiceState>,
    peer_store: PeerStore,
    server_store: RecordStore,
    agent_store: RecordStore,
    scan_store: ScanStore,
    token_source: Arc<dyn TokenSource>,
    peer_client_timeout: Duration,
    peer_client_retry_attempts: u32,
}

impl PeerFederationService {
    /// Loads existing peers/sync-state from disk (creating fresh sync
    /// status for any peer missing one, per the source's `load_peers_and_state`).
    pub async fn load(
        peer_store: PeerStore,
        server_store: RecordStore,
        agent_store: RecordStore,
        scan_store: ScanStore,
        token_source: Arc<dyn TokenSource>,
    ) -> FederationResult<Self> {
        Self::load_with_client_options(
            peer_store,
            server_store,
            agent_store,
            scan_store,
            token_source,
            Duration::from_secs(30),
            3,
        )
        .await
    }

    pub async fn load_with_client_options(
        peer_store: PeerStore,
        server_store: RecordStore,
        agent_store: RecordStore,
        scan_store: ScanStore,
        token_source: Arc<dyn TokenSource>,
        peer_client_timeout: Duration,
        peer_client_retry_attempts: u32,
    ) -> FederationResult<Self> {
        peer_store.ensure_dirs().await?;
        let peers = peer_store.load_all_peers().await?;
        let mut sync_status = peer_store.load_sync_state().await?;
        for peer_id in peers.keys() {
            sync_status
                .entry(peer_id.clone())
                .or_insert_with(|| PeerSyncStatus::fresh(peer_id.clone()));
        }
        info!(peer_count = peers.len(), "loaded peer federation state");
        Ok(PeerFederationService {
            state: Mutex::new(ServiceState { peers, sync_status }),
            peer_store,
            server_store,
            agent_store,
            scan_store,
            token_source,
            peer_client_timeout,
            peer_client_retry_attempts,
        })
    }

    async fn persist_sync_status_locked(&self, state: &ServiceState) -> FederationResult<()> {
        self.peer_store.save_sync_state(&state.sync_status).await
    }

    pub async fn add_peer(&self, input: NewPeerConfig) -> FederationResult<PeerConfig> {
        let mut guard = self.state.lock().await;
        if guard.peers.contains_key(&input.peer_id) {
            return Err(FederationError::AlreadyExists(format!(
                "peer '{}' already exists",
                input.peer_id
            )));
        }
        let peer = PeerConfig::new(input, Utc::now())?;
        self.peer_store.save_peer(&peer).await?;
        guard
            .sync_status
            .insert(peer.peer_id.clone(), PeerSyncStatus::fresh(peer.peer_id.clone()));
        guard.peers.insert(peer.peer_id.clone(), peer.clone());
        self.persist_sync_status_locked(&guard).await?;
        Ok(peer)
    }

    pub async fn get_peer(&self, peer_id: &str) -> FederationResult<PeerConfig> {
        let guard = self.state.lock().await;
        guard
            .peers
            .get(peer_id)
            .cloned()
            .ok_or_else(|| FederationError::NotFound(format!("peer not found: {peer_id}")))
    }

    pub async fn get_peer_by_client_id(&self, client_id: &str) -> Option<PeerConfig> {
        let guard = self.state.lock().await;
        guard
            .peers
            .values()
            .find(|p| p.expected_client_id.as_deref() == Some(client_id))
            .cloned()
    }

    pub async fn update_peer(
        &self,
        peer_id: &str,
        update: PeerConfigUpdate,
    ) -> FederationResult<PeerConfig> {
        let mut guard = self.state.lock().await;
        let peer = guard
            .peers
            .get_mut(peer_id)
            .ok_or_else(|| FederationError::NotFound(format!("peer not found: {peer_id}")))?;
        peer.apply_update(update, Utc::now())?;
        let updated = peer.clone();
        self.peer_store.save_peer(&updated).await?;
        Ok(updated)
    }

    pub async fn remove_peer(&self, peer_id: &str) -> FederationResult<()> {
        let mut guard = self.state.lock().await;
        if !guard.peers.contains_key(peer_id) {
            return Err(FederationError::NotFound(format!(
                "peer not found: {peer_id}"
            )));
        }
        self.peer_store.delete_peer(peer_id).await?;
        guard.peers.remove(peer_id);
        guard.sync_status.remove(peer_id);
        self.persist_sync_status_locked(&guard).await?;
        Ok(())
    }

    pub async fn list_peers(&self, enabled: Option<bool>) -> Vec<PeerConfig> {
        let guard = self.state.lock().await;
        guard
            .peers
            .values()
            .filter(|p| enabled.map(|e| p.enabled == e).unwrap_or(true))
            .cloned()
            .collect()
    }

    pub async fn get_sync_status(&self, peer_id: &str) -> Option<PeerSyncStatus> {
        self.state.lock().await.sync_status.get(peer_id).cloned()
    }

    pub async fn update_sync_status(
        &self,
        peer_id: &str,
        status: PeerSyncStatus,
    ) -> FederationResult<()> {
        let mut guard = self.state.lock().await;
        guard.sync_status.insert(peer_id.to_string(), status);
        self.persist_sync_status_locked(&guard).await
    }

    pub async fn set_local_override(&self, path: &str, value: bool, kind: RecordKind) -> FederationResult<()> {
        let store = self.store_for(kind);
        let record = store
            .get(path)
            .await
            .ok_or_else(|| FederationError::NotFound(format!("record not found: {path}")))?;
        let mut metadata = record
            .sync_metadata
            .ok_or_else(|| FederationError::InvalidState(format!("{path} is not a federated record")))?;
        metadata.local_overrides = value;
        store.set_sync_metadata(path, metadata).await
    }

    fn store_for(&self, kind: RecordKind) -> &RecordStore {
        match kind {
            RecordKind::Server => &self.server_store,
            RecordKind::Agent => &self.agent_store,
        }
    }

    /// One sync cycle from `peer_id` into the local registry (§4.1.2).
    pub async fn sync_peer(&self, peer_id: &str) -> FederationResult<SyncResult> {
        let start = Instant::now();
        let sync_id = format!("sync-{}-{}", Utc::now().format("%Y%m%dT%H%M%S"), &Uuid::new_v4().simple().to_string()[..8]);

        let peer = self.get_peer(peer_id).await?;
        if !peer.enabled {
            return Err(FederationError::InvalidState(format!(
                "peer '{peer_id}' is disabled"
            )));
        }

        let since_generation = self
            .get_sync_status(peer_id)
            .await
            .map(|s| s.current_generation)
            .unwrap_or(0);
        let full_sync = since_generation == 0;

        {
            let mut guard = self.state.lock().await;
            if let Some(status) = guard.sync_status.get_mut(peer_id) {
                status.sync_in_progress = true;
                status.last_sync_attempt = Some(Utc::now());
            }
            self.persist_sync_status_locked(&guard).await?;
        }

        let started_at = Utc::now();
        let outcome = self.run_sync_attempt(&peer, since_generation).await;

        let mut guard = self.state.lock().await;
        let status = guard
            .sync_status
            .entry(peer_id.to_string())
            .or_insert_with(|| PeerSyncStatus::fresh(peer_id.to_string()));

        let duration = start.elapsed().as_secs_f64();
        let result = match outcome {
            Ok(counts) => {
                let should_advance = counts.servers_synced > 0 || counts.agents_synced > 0 || full_sync;
                let new_generation = if should_advance {
                    since_generation + 1
                } else {
                    since_generation
                };
                status.current_generation = new_generation;
                status.total_servers_synced += counts.servers_synced;
                status.total_agents_synced += counts.agents_synced;
                status.consecutive_failures = 0;
                status.is_healthy = true;
                status.last_successful_sync = Some(Utc::now());
                status.add_history_entry(SyncHistoryEntry {
                    sync_id: sync_id.clone(),
                    started_at,
                    completed_at: Some(Utc::now()),
                    success: true,
                    servers_synced: counts.servers_synced,
                    agents_synced: counts.agents_synced,
                    servers_orphaned: counts.servers_orphaned,
                    agents_orphaned: counts.agents_orphaned,
                    error_message: None,
                    sync_generation: new_generation,
                    full_sync,
                });
                SyncResult {
                    success: true,
                    peer_id: peer_id.to_string(),
                    servers_synced: counts.servers_synced,
                    agents_synced: counts.agents_synced,
                    servers_orphaned: counts.servers_orphaned,
                    agents_orphaned: counts.agents_orphaned,
                    error_message: None,
                    duration_seconds: duration,
                    new_generation,
                }
            }
            Err(message) => {
                status.consecutive_failures += 1;
                status.is_healthy = false;
                status.add_history_entry(SyncHistoryEntry {
                    sync_id: sync_id.clone(),
                    started_at,
                    completed_at: Some(Utc::now()),
                    success: false,
                    servers_synced: 0,
                    agents_synced: 0,
                    servers_orphaned: 0,
                    agents_orphaned: 0,
                    error_message: Some(message.clone()),
                    sync_generation: since_generation,
                    full_sync,
                });
                SyncResult {
                    success: false,
                    peer_id: peer_id.to_string(),
                    servers_synced: 0,
                    agents_synced: 0,
                    servers_orphaned: 0,
                    agents_orphaned: 0,
                    error_message: Some(message),
                    duration_seconds: duration,
                    new_generation: since_generation,
                }
            }
        };
        status.sync_in_progress = false;
        status.last_health_check = Some(Utc::now());
        self.persist_sync_status_locked(&guard).await?;
        Ok(result)
    }

    async fn run_sync_attempt(
        &self,
        peer: &PeerConfig,
        since_generation: u64,
    ) -> Result<SyncCounts, String> {
        let client = PeerClient::with_options(
            peer.clone(),
            self.token_source.clone(),
            self.peer_client_timeout,
            self.peer_client_retry_attempts,
        );

        let raw_servers = client
            .fetch_servers(Some(since_generation))
            .await
            .unwrap_or_default();
        let raw_agents = client
            .fetch_agents(Some(since_generation))
            .await
            .unwrap_or_default();

        let servers = apply_sync_mode_filter(peer, RecordKind::Server, raw_servers);
        let agents = apply_sync_mode_filter(peer, RecordKind::Agent, raw_agents);

        let target_generation = since_generation + 1;

        let (servers_synced, server_paths) = self
            .import_records(&self.server_store, RecordKind::Server, peer, &servers, target_generation)
            .await;
        let (agents_synced, agent_paths) = self
            .import_records(&self.agent_store, RecordKind::Agent, peer, &agents, target_generation)
            .await;

        let servers_orphaned = self
            .mark_orphans(&self.server_store, &peer.peer_id, &server_paths)
            .await;
        let agents_orphaned = self
            .mark_orphans(&self.agent_store, &peer.peer_id, &agent_paths)
            .await;

        Ok(SyncCounts {
            servers_synced,
            agents_synced,
            servers_orphaned,
            agents_orphaned,
        })
    }

    /// Imports each candidate item (§4.1.4). Returns the count actually
    /// imported and the set of original paths the peer reported, for
    /// orphan detection.
    async fn import_records(
        &self,
        store: &RecordStore,
        kind: RecordKind,
        peer: &PeerConfig,
        items: &[Value],
        target_generation: u64,
    ) -> (u64, HashSet<String>) {
        let mut imported = 0u64;
        let mut original_paths = HashSet::new();

        for item in items {
            let raw_path = match item.get("path").and_then(Value::as_str) {
                Some(p) => p,
                None => {
                    warn!(peer_id = %peer.peer_id, "skipping item with no path");
                    continue;
                }
            };
            let original_path = if raw_path.starts_with('/') {
                raw_path.to_string()
            } else {
                format!("/{raw_path}")
            };
            original_paths.insert(original_path.clone());

            let prefixed = format!("/{}{}", peer.peer_id, original_path);
            let existing = store.get(&prefixed).await;

            if let Some(existing) = &existing {
                if let Some(meta) = &existing.sync_metadata {
                    if meta.local_overrides {
                        continue;
                    }
                }
            }

            let metadata = SyncMetadata {
                source_peer_id: peer.peer_id.clone(),
                original_path: original_path.clone(),
                is_federated: true,
                synced_at: Utc::now(),
                sync_generation: target_generation,
                is_orphaned: false,
                orphaned_at: None,
                local_overrides: false,
                is_read_only: true,
            };

            let record = record_from_value(kind, prefixed.clone(), item, metadata);

            let result = if existing.is_some() {
                store.update(&prefixed, record).await
            } else {
                store.create(record).await
            };

            match result {
                Ok(()) => imported += 1,
                Err(e) => warn!(peer_id = %peer.peer_id, path = %prefixed, error = %e, "failed to store imported record"),
            }
        }

        (imported, original_paths)
    }

    /// §4.1.5: marks local records sourced from `peer_id` whose
    /// `original_path` is absent from this cycle's fetch as orphaned.
    async fn mark_orphans(
        &self,
        store: &RecordStore,
        peer_id: &str,
        seen_original_paths: &HashSet<String>,
    ) -> u64 {
        let mut orphaned = 0u64;
        let all = store.list_all().await;
        for record in all.values() {
            let Some(meta) = &record.sync_metadata else {
                continue;
            };
            if meta.source_peer_id != peer_id || meta.is_orphaned {
                continue;
            }
            if seen_original_paths.contains(&meta.original_path) {
                continue;
            }
            let mut updated = meta.clone();
            updated.is_orphaned = true;
            updated.orphaned_at = Some(Utc::now());
            if store.set_sync_metadata(&record.path, updated).await.is_ok() {
                orphaned += 1;
            }
        }
        orphaned
    }

    pub async fn sync_all_peers(&self, enabled_only: bool) -> HashMap<String, SyncResult> {
        let peers = self.list_peers(if enabled_only { Some(true) } else { None }).await;
        let futures = peers.into_iter().map(|peer| {
            let peer_id = peer.peer_id.clone();
            async move {
                let result = self.sync_peer(&peer_id).await;
                (peer_id, result)
            }
        });
        let outcomes = futures::future::join_all(futures).await;
        outcomes
            .into_iter()
            .map(|(peer_id, result)| {
                let sync_result = result.unwrap_or_else(|e| SyncResult {
                    success: false,
                    peer_id: peer_id.clone(),
                    servers_synced: 0,
                    agents_synced: 0,
                    servers_orphaned: 0,
                    agents_orphaned: 0,
                    error_message: Some(e.to_string()),
                    duration_seconds: 0.0,
                    new_generation: 0,
                });
                (peer_id, sync_result)
            })
            .collect()
    }

    pub fn server_store(&self) -> &RecordStore {
        &self.server_store
    }

    pub fn agent_store(&self) -> &RecordStore {
        &self.agent_store
    }

    pub fn scan_store(&self) -> &ScanStore {
        &self.scan_store
    }
}

struct SyncCounts {
    servers_synced: u64,
    agents_synced: u64,
    servers_orphaned: u64,
    agents_orphaned: u64,
}

/// §4.1.3: whitelist/tag_filter/all. Unknown modes already collapse to
/// `SyncMode::All` at the type level since the enum is exhaustive.
fn apply_sync_mode_filter(peer: &PeerConfig, kind: RecordKind, items: Vec<Value>) -> Vec<Value> {
    match peer.sync_mode {
        SyncMode::All => items,
        SyncMode::Whitelist => {
            let whitelist = match kind {
                RecordKind::Server => &peer.whitelist_servers,
                RecordKind::Agent => &peer.whitelist_agents,
            };
            items
                .into_iter()
                .filter(|item| {
                    item.get("path")
                        .and_then(Value::as_str)
                        .map(|p| whitelist.contains(p))
                        .unwrap_or(false)
                })
                .collect()
        }
        SyncMode::TagFilter => {
            if peer.tag_filters.is_empty() {
                return Vec::new();
            }
            items
                .into_iter()
                .filter(|item| item_matches_tag_filters(item, &peer.tag_filters))
                .collect()
        }
    }
}

fn item_matches_tag_filters(item: &Value, tag_filters: &HashSet<String>) -> bool {
    let mut tags: Vec<&str> = Vec::new();
    if let Some(arr) = item.get("tags").and_then(Value::as_array) {
        tags.extend(arr.iter().filter_map(Value::as_str));
    }
    if let Some(arr) = item.get("categories").and_then(Value::as_array) {
        tags.extend(arr.iter().filter_map(Value::as_str));
    }
    tags.iter().any(|t| tag_filters.contains(*t))
}

fn record_from_value(
    kind: RecordKind,
    path: String,
    item: &Value,
    metadata: SyncMetadata,
) -> RegisteredRecord {
    let visibility = item
        .get("visibility")
        .and_then(Value::as_str)
        .and_then(|v| serde_json::from_value(Value::String(v.to_string())).ok())
        .unwrap_or_default();
    let allowed_groups = item
        .get("allowed_groups")
        .and_then(Value::as_array)
        .map(|arr| arr.iter().filter_map(|v| v.as_str().map(String::from)).collect())
        .unwrap_or_default();
    let enabled = item.get("enabled").and_then(Value::as_bool).unwrap_or(true);

    let mut extras = serde_json::Map::new();
    if let Value::Object(map) = item {
        for (k, v) in map {
            if !matches!(k.as_str(), "path" | "visibility" | "allowed_groups" | "enabled") {
                extras.insert(k.clone(), v.clone());
            }
        }
    }

    RegisteredRecord {
        kind,
        path,
        enabled,
        visibility,
        allowed_groups,
        sync_metadata: Some(metadata),
        extras,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token_source::StaticTokenSource;

    async fn make_service(dir: &std::path::Path) -> PeerFederationService {
        let peer_store = PeerStore::new(dir.join("peers"), dir.join("state.json"));
        PeerFederationService::load(
            peer_store,
            RecordStore::new(RecordKind::Server),
            RecordStore::new(RecordKind::Agent),
            ScanStore::new(),
            Arc::new(StaticTokenSource(Some("tok".into()))),
        )
        .await
        .unwrap()
    }

    fn new_peer(id: &str) -> NewPeerConfig {
        NewPeerConfig {
            peer_id: id.into(),
            name: "Peer".into(),
            endpoint: "https://example.com".into(),
            enabled: true,
            sync_mode: SyncMode::All,
            whitelist_servers: Default::default(),
            whitelist_agents: Default::default(),
            tag_filters: Default::default(),
            sync_interval_minutes: 60,
            federation_token: Some("tok".into()),
            expected_client_id: None,
            expected_issuer: None,
        }
    }

    #[tokio::test]
    async fn add_peer_creates_fresh_status() {
        let dir = tempfile::tempdir().unwrap();
        let service = make_service(dir.path()).await;
        service.add_peer(new_peer("p1")).await.unwrap();
        let status = service.get_sync_status("p1").await.unwrap();
        assert_eq!(status.current_generation, 0);
        assert!(!status.sync_in_progress);
    }

    #[tokio::test]
    async fn add_duplicate_peer_errors() {
        let dir = tempfile::tempdir().unwrap();
        let service = make_service(dir.path()).await;
        service.add_peer(new_peer("p1")).await.unwrap();
        let result = service.add_peer(new_peer("p1")).await;
        assert!(matches!(result, Err(FederationError::AlreadyExists(_))));
    }

    #[tokio::test]
    async fn remove_peer_clears_status_and_file() {
        let dir = tempfile::tempdir().unwrap();
        let service = make_service(dir.path()).await;
        service.add_peer(new_peer("p1")).await.unwrap();
        service.remove_peer("p1").await.unwrap();
        assert!(service.get_peer("p1").await.is_err());
        assert!(service.get_sync_status("p1").await.is_none());
    }

    #[tokio::test]
    async fn syncing_disabled_peer_is_invalid_state() {
        let dir = tempfile::tempdir().unwrap();
        let service = make_service(dir.path()).await;
        let mut cfg = new_peer("p1");
        cfg.enabled = false;
        service.add_peer(cfg).await.unwrap();
        let result = service.sync_peer("p1").await;
        assert!(matches!(result, Err(FederationError::InvalidState(_))));
    }

    #[tokio::test]
    async fn sync_mode_filters_respect_whitelist() {
        let peer_cfg = PeerConfig::new(
            {
                let mut c = new_peer("p1");
                c.sync_mode = SyncMode::Whitelist;
                c.whitelist_servers = ["/s1".to_string()].into_iter().collect();
                c
            },
            Utc::now(),
        )
        .unwrap();
        let items = vec![
            serde_json::json!({"path": "/s1"}),
            serde_json::json!({"path": "/s2"}),
        ];
        let filtered = apply_sync_mode_filter(&peer_cfg, RecordKind::Server, items);
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0]["path"], "/s1");
    }

    #[tokio::test]
    async fn tag_filter_matches_tags_or_categories() {
        let peer_cfg = PeerConfig::new(
            {
                let mut c = new_peer("p1");
                c.sync_mode = SyncMode::TagFilter;
                c.tag_filters = ["infra".to_string()].into_iter().collect();
                c
            },
            Utc::now(),
        )
        .unwrap();
        let items = vec![
            serde_json::json!({"path": "/s1", "tags": ["infra"]}),
            serde_json::json!({"path": "/s2", "categories": ["other"]}),
        ];
        let filtered = apply_sync_mode_filter(&peer_cfg, RecordKind::Server, items);
        assert_eq!(filtered.len(), 1);
    }
}
