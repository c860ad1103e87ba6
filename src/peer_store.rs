//! Filesystem persistence for peer configs and sync state (§6.4).
//!
//! `peers_dir/{peer_id}.json` holds one `PeerConfig`; `peer_sync_state.json`
//! holds the whole `peer_id -> PeerSyncStatus` map as a single object. Writes
//! go through a temp-file-plus-rename so a concurrent reader never observes a
//! half-written file, mirroring the teacher's `FederationState::save_peers`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tracing::{error, warn};

use crate::error::{FederationError, FederationResult};
use crate::models::{validate_peer_id, PeerConfig, PeerSyncStatus};

pub struct PeerStore {
    peers_dir: PathBuf,
    sync_state_path: PathBuf,
}

impl PeerStore {
    pub fn new(peers_dir: impl Into<PathBuf>, sync_state_path: impl Into<PathBuf>) -> Self {
        PeerStore {
            peers_dir: peers_dir.into(),
            sync_state_path: sync_state_path.into(),
        }
    }

    /// Resolves `{peer_id}.json` inside `peers_dir`, refusing to return a
    /// path that would escape it even if `peer_id` somehow bypassed
    /// `validate_peer_id` (invariant #7 of the spec's testable properties).
    fn safe_peer_path(&self, peer_id: &str) -> FederationResult<PathBuf> {
        validate_peer_id(peer_id)?;
        let candidate = self.peers_dir.join(format!("{peer_id}.json"));
        let base = normalize(&self.peers_dir);
        let resolved = normalize(&candidate);
        if !resolved.starts_with(&base) {
            return Err(FederationError::InvalidInput(format!(
                "peer_id '{peer_id}' resolves outside the peers directory"
            )));
        }
        Ok(candidate)
    }

    pub async fn ensure_dirs(&self) -> FederationResult<()> {
        tokio::fs::create_dir_all(&self.peers_dir)
            .await
            .map_err(|e| FederationError::StorageFailure(format!("creating peers dir: {e}")))?;
        if let Some(parent) = self.sync_state_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| FederationError::StorageFailure(format!("creating state dir: {e}")))?;
        }
        Ok(())
    }

    pub async fn save_peer(&self, peer: &PeerConfig) -> FederationResult<()> {
        let path = self.safe_peer_path(&peer.peer_id)?;
        let json = serde_json::to_string_pretty(peer)
            .map_err(|e| FederationError::InternalError(format!("serializing peer: {e}")))?;
        write_atomic(&path, &json).await
    }

    pub async fn delete_peer(&self, peer_id: &str) -> FederationResult<()> {
        let path = self.safe_peer_path(peer_id)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(peer_id, "peer file already absent on disk");
                Ok(())
            }
            Err(e) => Err(FederationError::StorageFailure(format!(
                "deleting peer file: {e}"
            ))),
        }
    }

    /// Loads every `*.json` file in `peers_dir` (skipping the sync-state
    /// filename if it happens to live alongside them). Corrupt files are
    /// logged and skipped rather than aborting startup.
    pub async fn load_all_peers(&self) -> FederationResult<HashMap<String, PeerConfig>> {
        let mut peers = HashMap::new();
        let mut entries = match tokio::fs::read_dir(&self.peers_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(peers),
            Err(e) => {
                return Err(FederationError::StorageFailure(format!(
                    "reading peers dir: {e}"
                )))
            }
        };
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| FederationError::StorageFailure(format!("reading peers dir entry: {e}")))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match tokio::fs::read_to_string(&path).await {
                Ok(contents) => match serde_json::from_str::<PeerConfig>(&contents) {
                    Ok(peer) => {
                        if let Some(existing) = peers.insert(peer.peer_id.clone(), peer) {
                            warn!(
                                peer_id = %existing.peer_id,
                                "duplicate peer_id found across files; overwriting with later entry"
                            );
                        }
                    }
                    Err(e) => error!(path = %path.display(), error = %e, "skipping unreadable peer file"),
                },
                Err(e) => error!(path = %path.display(), error = %e, "failed to read peer file"),
            }
        }
        Ok(peers)
    }

    pub async fn load_sync_state(&self) -> FederationResult<HashMap<String, PeerSyncStatus>> {
        match tokio::fs::read_to_string(&self.sync_state_path).await {
            Ok(contents) => match serde_json::from_str(&contents) {
                Ok(map) => Ok(map),
                Err(e) => {
                    error!(error = %e, "sync state file is corrupt; starting from an empty map");
                    Ok(HashMap::new())
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(HashMap::new()),
            Err(e) => Err(FederationError::StorageFailure(format!(
                "reading sync state: {e}"
            ))),
        }
    }

    pub async fn save_sync_state(
        &self,
        state: &HashMap<String, PeerSyncStatus>,
    ) -> FederationResult<()> {
        let json = serde_json::to_string_pretty(state)
            .map_err(|e| FederationError::InternalError(format!("serializing sync state: {e}")))?;
        write_atomic(&self.sync_state_path, &json).await
    }
}

fn normalize(path: &Path) -> PathBuf {
    path.components().collect()
}

async fn write_atomic(path: &Path, contents: &str) -> FederationResult<()> {
    let tmp_path = path.with_extension("json.tmp");
    tokio::fs::write(&tmp_path, contents)
        .await
        .map_err(|e| FederationError::StorageFailure(format!("writing temp file: {e}")))?;
    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| FederationError::StorageFailure(format!("renaming into place: {e}")))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::NewPeerConfig;
    use chrono::Utc;
    use std::collections::HashSet;

    fn sample_peer(id: &str) -> PeerConfig {
        PeerConfig::new(
            NewPeerConfig {
                peer_id: id.into(),
                name: "Test Peer".into(),
                endpoint: "https://example.com".into(),
                enabled: true,
                sync_mode: crate::models::SyncMode::All,
                whitelist_servers: HashSet::new(),
                whitelist_agents: HashSet::new(),
                tag_filters: HashSet::new(),
                sync_interval_minutes: 60,
                federation_token: None,
                expected_client_id: None,
                expected_issuer: None,
            },
            Utc::now(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn save_and_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = PeerStore::new(dir.path().join("peers"), dir.path().join("state.json"));
        store.ensure_dirs().await.unwrap();
        let peer = sample_peer("p1");
        store.save_peer(&peer).await.unwrap();

        let loaded = store.load_all_peers().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded["p1"].endpoint, "https://example.com");
    }

    #[tokio::test]
    async fn delete_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = PeerStore::new(dir.path().join("peers"), dir.path().join("state.json"));
        store.ensure_dirs().await.unwrap();
        store.save_peer(&sample_peer("p1")).await.unwrap();
        store.delete_peer("p1").await.unwrap();
        let loaded = store.load_all_peers().await.unwrap();
        assert!(loaded.is_empty());
    }

    #[tokio::test]
    async fn rejects_traversal_peer_id() {
        let dir = tempfile::tempdir().unwrap();
        let store = PeerStore::new(dir.path().join("peers"), dir.path().join("state.json"));
        let result = store.safe_peer_path("../../etc/passwd");
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn sync_state_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = PeerStore::new(dir.path().join("peers"), dir.path().join("state.json"));
        store.ensure_dirs().await.unwrap();
        let mut map = HashMap::new();
        map.insert("p1".to_string(), PeerSyncStatus::fresh("p1"));
        store.save_sync_state(&map).await.unwrap();
        let loaded = store.load_sync_state().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded["p1"].peer_id, "p1");
    }
}
