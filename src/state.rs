//! Application state shared across the export and admin HTTP surfaces,
//! constructed once in `main` and handed to handlers via axum's `State`
//! extractor (§9 design note: no ambient globals).

use std::sync::Arc;

use crate::audit::FederationAuditLog;
use crate::federation_service::PeerFederationService;
use crate::scheduler::PeerSyncScheduler;

#[derive(Clone)]
pub struct AppState {
    pub federation: Arc<PeerFederationService>,
    pub scheduler: Arc<PeerSyncScheduler>,
    pub audit: Arc<FederationAuditLog>,
    pub registry_id_override: Option<String>,
}

impl AppState {
    /// §4.5.1: configured id, else `registry-{hostname}`, else
    /// `registry-unknown`.
    pub fn registry_id(&self) -> String {
        if let Some(id) = &self.registry_id_override {
            return id.clone();
        }
        match hostname::get() {
            Ok(name) => format!("registry-{}", name.to_string_lossy()),
            Err(_) => "registry-unknown".to_string(),
        }
    }

    /// §4.5.1: `max(1, enabled_server_count + enabled_agent_count)`,
    /// falling back to 1 on any error computing the counts.
    pub async fn current_sync_generation(&self) -> u64 {
        let servers = self.federation.server_store().list_all().await;
        let agents = self.federation.agent_store().list_all().await;
        let enabled_servers = servers.values().filter(|r| r.enabled).count();
        let enabled_agents = agents.values().filter(|r| r.enabled).count();
        std::cmp::max(1, (enabled_servers + enabled_agents) as u64)
    }
}
