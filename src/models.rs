//! Data model for the federation subsystem: peer configuration, sync state,
//! imported-record metadata, and the export envelope.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{FederationError, FederationResult};

pub const MIN_SYNC_INTERVAL_MINUTES: u32 = 5;
pub const MAX_SYNC_INTERVAL_MINUTES: u32 = 1440;
pub const DEFAULT_SYNC_INTERVAL_MINUTES: u32 = 60;
pub const MAX_SYNC_HISTORY_ENTRIES: usize = 100;
pub const MAX_CONNECTION_LOG_ENTRIES: usize = 1000;

const RESERVED_NAMES: [&str; 4] = ["con", "prn", "aux", "nul"];
const FORBIDDEN_CHARS: [char; 9] = ['/', '\\', '<', '>', ':', '"', '|', '?', '*'];

/// Rejects empty/whitespace-only ids, traversal sequences, filesystem-unsafe
/// characters, reserved device names, and anything over 255 bytes.
pub fn validate_peer_id(peer_id: &str) -> FederationResult<()> {
    if peer_id.trim().is_empty() {
        return Err(FederationError::InvalidInput(
            "peer_id must not be empty or whitespace".into(),
        ));
    }
    if peer_id.len() > 255 {
        return Err(FederationError::InvalidInput(
            "peer_id exceeds 255 characters".into(),
        ));
    }
    if peer_id.contains("..") || peer_id.contains('\0') {
        return Err(FederationError::InvalidInput(
            "peer_id contains a path traversal sequence".into(),
        ));
    }
    if peer_id.contains(FORBIDDEN_CHARS) {
        return Err(FederationError::InvalidInput(
            "peer_id contains a filesystem-unsafe character".into(),
        ));
    }
    if RESERVED_NAMES.contains(&peer_id.to_ascii_lowercase().as_str()) {
        return Err(FederationError::InvalidInput(format!(
            "peer_id '{peer_id}' is a reserved device name"
        )));
    }
    Ok(())
}

fn validate_endpoint(endpoint: &str) -> FederationResult<String> {
    if !endpoint.starts_with("http://") && !endpoint.starts_with("https://") {
        return Err(FederationError::InvalidInput(
            "endpoint must be an http:// or https:// URL".into(),
        ));
    }
    Ok(endpoint.trim_end_matches('/').to_string())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    All,
    Whitelist,
    TagFilter,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerConfig {
    pub peer_id: String,
    pub name: String,
    pub endpoint: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub sync_mode: SyncMode,
    #[serde(default)]
    pub whitelist_servers: HashSet<String>,
    #[serde(default)]
    pub whitelist_agents: HashSet<String>,
    #[serde(default)]
    pub tag_filters: HashSet<String>,
    #[serde(default = "default_sync_interval")]
    pub sync_interval_minutes: u32,
    #[serde(default)]
    pub federation_token: Option<String>,
    #[serde(default)]
    pub expected_client_id: Option<String>,
    #[serde(default)]
    pub expected_issuer: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Default for SyncMode {
    fn default() -> Self {
        SyncMode::All
    }
}

fn default_true() -> bool {
    true
}

fn default_sync_interval() -> u32 {
    DEFAULT_SYNC_INTERVAL_MINUTES
}

/// Fields a caller may supply when constructing a new peer. Validated and
/// normalized into a `PeerConfig` by `PeerFederationService::add_peer`.
#[derive(Debug, Clone, Deserialize)]
pub struct NewPeerConfig {
    pub peer_id: String,
    pub name: String,
    pub endpoint: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub sync_mode: SyncMode,
    #[serde(default)]
    pub whitelist_servers: HashSet<String>,
    #[serde(default)]
    pub whitelist_agents: HashSet<String>,
    #[serde(default)]
    pub tag_filters: HashSet<String>,
    #[serde(default = "default_sync_interval")]
    pub sync_interval_minutes: u32,
    #[serde(default)]
    pub federation_token: Option<String>,
    #[serde(default)]
    pub expected_client_id: Option<String>,
    #[serde(default)]
    pub expected_issuer: Option<String>,
}

/// Sparse update applied to an existing peer. `peer_id` is intentionally
/// absent: the original id is always retained regardless of what a caller
/// sends.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PeerConfigUpdate {
    pub name: Option<String>,
    pub endpoint: Option<String>,
    pub enabled: Option<bool>,
    pub sync_mode: Option<SyncMode>,
    pub whitelist_servers: Option<HashSet<String>>,
    pub whitelist_agents: Option<HashSet<String>>,
    pub tag_filters: Option<HashSet<String>>,
    pub sync_interval_minutes: Option<u32>,
    pub federation_token: Option<String>,
    pub expected_client_id: Option<String>,
    pub expected_issuer: Option<String>,
}

impl PeerConfig {
    pub fn new(input: NewPeerConfig, now: DateTime<Utc>) -> FederationResult<Self> {
        validate_peer_id(&input.peer_id)?;
        let endpoint = validate_endpoint(&input.endpoint)?;
        let interval = validate_interval(input.sync_interval_minutes)?;
        if matches!(input.sync_mode, SyncMode::Whitelist)
            && input.whitelist_servers.is_empty()
            && input.whitelist_agents.is_empty()
        {
            tracing::warn!(
                peer_id = %input.peer_id,
                "peer configured with whitelist sync_mode but no whitelisted paths; no items will import"
            );
        }
        if matches!(input.sync_mode, SyncMode::TagFilter) && input.tag_filters.is_empty() {
            tracing::warn!(
                peer_id = %input.peer_id,
                "peer configured with tag_filter sync_mode but no tags; no items will import"
            );
        }
        Ok(PeerConfig {
            peer_id: input.peer_id,
            name: input.name,
            endpoint,
            enabled: input.enabled,
            sync_mode: input.sync_mode,
            whitelist_servers: input.whitelist_servers,
            whitelist_agents: input.whitelist_agents,
            tag_filters: input.tag_filters,
            sync_interval_minutes: interval,
            federation_token: input.federation_token,
            expected_client_id: input.expected_client_id,
            expected_issuer: input.expected_issuer,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn apply_update(&mut self, update: PeerConfigUpdate, now: DateTime<Utc>) -> FederationResult<()> {
        if let Some(name) = update.name {
            self.name = name;
        }
        if let Some(endpoint) = update.endpoint {
            self.endpoint = validate_endpoint(&endpoint)?;
        }
        if let Some(enabled) = update.enabled {
            self.enabled = enabled;
        }
        if let Some(mode) = update.sync_mode {
            self.sync_mode = mode;
        }
        if let Some(wl) = update.whitelist_servers {
            self.whitelist_servers = wl;
        }
        if let Some(wl) = update.whitelist_agents {
            self.whitelist_agents = wl;
        }
        if let Some(tags) = update.tag_filters {
            self.tag_filters = tags;
        }
        if let Some(interval) = update.sync_interval_minutes {
            self.sync_interval_minutes = validate_interval(interval)?;
        }
        if update.federation_token.is_some() {
            self.federation_token = update.federation_token;
        }
        if update.expected_client_id.is_some() {
            self.expected_client_id = update.expected_client_id;
        }
        if update.expected_issuer.is_some() {
            self.expected_issuer = update.expected_issuer;
        }
        self.updated_at = now;
        Ok(())
    }
}

fn validate_interval(minutes: u32) -> FederationResult<u32> {
    if !(MIN_SYNC_INTERVAL_MINUTES..=MAX_SYNC_INTERVAL_MINUTES).contains(&minutes) {
        return Err(FederationError::InvalidInput(format!(
            "sync_interval_minutes must be between {MIN_SYNC_INTERVAL_MINUTES} and {MAX_SYNC_INTERVAL_MINUTES}, got {minutes}"
        )));
    }
    Ok(minutes)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncHistoryEntry {
    pub sync_id: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub success: bool,
    pub servers_synced: u64,
    pub agents_synced: u64,
    pub servers_orphaned: u64,
    pub agents_orphaned: u64,
    pub error_message: Option<String>,
    pub sync_generation: u64,
    pub full_sync: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerSyncStatus {
    pub peer_id: String,
    pub is_healthy: bool,
    pub last_health_check: Option<DateTime<Utc>>,
    pub last_successful_sync: Option<DateTime<Utc>>,
    pub last_sync_attempt: Option<DateTime<Utc>>,
    pub current_generation: u64,
    pub total_servers_synced: u64,
    pub total_agents_synced: u64,
    pub sync_in_progress: bool,
    pub consecutive_failures: u32,
    pub sync_history: Vec<SyncHistoryEntry>,
}

impl PeerSyncStatus {
    pub fn fresh(peer_id: impl Into<String>) -> Self {
        PeerSyncStatus {
            peer_id: peer_id.into(),
            is_healthy: true,
            last_health_check: None,
            last_successful_sync: None,
            last_sync_attempt: None,
            current_generation: 0,
            total_servers_synced: 0,
            total_agents_synced: 0,
            sync_in_progress: false,
            consecutive_failures: 0,
            sync_history: Vec::new(),
        }
    }

    /// Inserts newest-first, truncating to `MAX_SYNC_HISTORY_ENTRIES`.
    pub fn add_history_entry(&mut self, entry: SyncHistoryEntry) {
        self.sync_history.insert(0, entry);
        self.sync_history.truncate(MAX_SYNC_HISTORY_ENTRIES);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncMetadata {
    pub source_peer_id: String,
    pub original_path: String,
    #[serde(default = "default_true")]
    pub is_federated: bool,
    pub synced_at: DateTime<Utc>,
    pub sync_generation: u64,
    #[serde(default)]
    pub is_orphaned: bool,
    #[serde(default)]
    pub orphaned_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub local_overrides: bool,
    #[serde(default = "default_true")]
    pub is_read_only: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Visibility {
    Public,
    GroupRestricted,
    Internal,
}

impl Default for Visibility {
    fn default() -> Self {
        Visibility::Public
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Server,
    Agent,
}

/// The reference `server_store`/`agent_store` record shape (§9 design note):
/// explicit fields for everything the federation layer touches, plus an
/// `extras` bag so unknown keys from a peer round-trip intact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisteredRecord {
    pub kind: RecordKind,
    pub path: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub visibility: Visibility,
    #[serde(default)]
    pub allowed_groups: HashSet<String>,
    #[serde(default)]
    pub sync_metadata: Option<SyncMetadata>,
    #[serde(flatten)]
    pub extras: serde_json::Map<String, serde_json::Value>,
}

/// The reference `security_scan_repository` record shape (§9 design note):
/// minimal explicit fields plus an `extras` bag, keyed by `scan_id` and
/// cross-referenced against a server export by `server_path`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityScanRecord {
    pub scan_id: String,
    pub server_path: String,
    #[serde(flatten)]
    pub extras: serde_json::Map<String, serde_json::Value>,
}

/// Generic over the item type so the same envelope shape serves servers,
/// agents, and security scans (§4.5.1).
#[derive(Debug, Clone, Serialize)]
pub struct FederationExport<T> {
    pub items: Vec<T>,
    pub sync_generation: u64,
    pub total_count: usize,
    pub has_more: bool,
    pub registry_id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncResult {
    pub success: bool,
    pub peer_id: String,
    pub servers_synced: u64,
    pub agents_synced: u64,
    pub servers_orphaned: u64,
    pub agents_orphaned: u64,
    pub error_message: Option<String>,
    pub duration_seconds: f64,
    pub new_generation: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionLogEntry {
    pub timestamp: DateTime<Utc>,
    pub peer_id: String,
    #[serde(default)]
    pub peer_name: String,
    pub client_id: String,
    pub endpoint: String,
    #[serde(default)]
    pub items_requested: u64,
    #[serde(default = "default_true")]
    pub success: bool,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub request_id: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PeerSyncSummary {
    pub peer_id: String,
    #[serde(default)]
    pub peer_name: String,
    #[serde(default)]
    pub total_connections: u64,
    #[serde(default)]
    pub last_connection: Option<DateTime<Utc>>,
    #[serde(default)]
    pub servers_shared: u64,
    #[serde(default)]
    pub agents_shared: u64,
    #[serde(default)]
    pub successful_requests: u64,
    #[serde(default)]
    pub failed_requests: u64,
}

/// The authenticated principal for an inbound request — the `auth_gateway`
/// collaborator's output shape (§6.1).
#[derive(Debug, Clone, Default)]
pub struct Principal {
    pub username: String,
    pub client_id: Option<String>,
    pub scopes: HashSet<String>,
    pub groups: HashSet<String>,
}

impl Principal {
    pub fn has_federation_scope(&self) -> bool {
        self.scopes.contains("federation-service") || self.scopes.contains("federation/read")
    }
}

pub type SyncStateMap = HashMap<String, PeerSyncStatus>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_and_traversal_ids() {
        assert!(validate_peer_id("").is_err());
        assert!(validate_peer_id("   ").is_err());
        assert!(validate_peer_id("../etc/passwd").is_err());
        assert!(validate_peer_id("a/b").is_err());
        assert!(validate_peer_id("a*b").is_err());
        assert!(validate_peer_id("con").is_err());
        assert!(validate_peer_id("CON").is_err());
        assert!(validate_peer_id(&"x".repeat(256)).is_err());
    }

    #[test]
    fn accepts_normal_ids() {
        assert!(validate_peer_id("p1").is_ok());
        assert!(validate_peer_id("peer-east-1").is_ok());
    }

    #[test]
    fn endpoint_trailing_slash_stripped() {
        let now = Utc::now();
        let cfg = PeerConfig::new(
            NewPeerConfig {
                peer_id: "p1".into(),
                name: "Peer One".into(),
                endpoint: "https://example.com/".into(),
                enabled: true,
                sync_mode: SyncMode::All,
                whitelist_servers: HashSet::new(),
                whitelist_agents: HashSet::new(),
                tag_filters: HashSet::new(),
                sync_interval_minutes: 60,
                federation_token: None,
                expected_client_id: None,
                expected_issuer: None,
            },
            now,
        )
        .unwrap();
        assert_eq!(cfg.endpoint, "https://example.com");
    }

    #[test]
    fn rejects_out_of_range_interval() {
        let now = Utc::now();
        let result = PeerConfig::new(
            NewPeerConfig {
                peer_id: "p1".into(),
                name: "Peer One".into(),
                endpoint: "https://example.com".into(),
                enabled: true,
                sync_mode: SyncMode::All,
                whitelist_servers: HashSet::new(),
                whitelist_agents: HashSet::new(),
                tag_filters: HashSet::new(),
                sync_interval_minutes: 1,
                federation_token: None,
                expected_client_id: None,
                expected_issuer: None,
            },
            now,
        );
        assert!(result.is_err());
    }
}
