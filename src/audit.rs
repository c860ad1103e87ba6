//! Federation audit log (§4.4): a bounded connection history plus per-peer
//! summaries, both behind one lock — the same single-struct-single-lock
//! shape as the teacher's `FederationState`.

use std::collections::HashMap;

use chrono::Utc;
use tokio::sync::RwLock;

use crate::models::{ConnectionLogEntry, PeerSyncSummary, MAX_CONNECTION_LOG_ENTRIES};

struct AuditState {
    connection_logs: Vec<ConnectionLogEntry>,
    peer_summaries: HashMap<String, PeerSyncSummary>,
}

pub struct FederationAuditLog {
    state: RwLock<AuditState>,
}

impl Default for FederationAuditLog {
    fn default() -> Self {
        Self::new()
    }
}

impl FederationAuditLog {
    pub fn new() -> Self {
        FederationAuditLog {
            state: RwLock::new(AuditState {
                connection_logs: Vec::new(),
                peer_summaries: HashMap::new(),
            }),
        }
    }

    pub async fn log_connection(&self, mut entry: ConnectionLogEntry) {
        entry.timestamp = Utc::now();
        let mut guard = self.state.write().await;
        guard.connection_logs.insert(0, entry.clone());
        guard.connection_logs.truncate(MAX_CONNECTION_LOG_ENTRIES);

        let summary = guard
            .peer_summaries
            .entry(entry.peer_id.clone())
            .or_insert_with(|| PeerSyncSummary {
                peer_id: entry.peer_id.clone(),
                ..Default::default()
            });
        summary.total_connections += 1;
        summary.last_connection = Some(entry.timestamp);
        if summary.peer_name.is_empty() && !entry.peer_name.is_empty() {
            summary.peer_name = entry.peer_name.clone();
        }

        if entry.success {
            summary.successful_requests += 1;
            if entry.endpoint.contains("/servers") {
                summary.servers_shared = summary.servers_shared.max(entry.items_requested);
            }
            if entry.endpoint.contains("/agents") {
                summary.agents_shared = summary.agents_shared.max(entry.items_requested);
            }
        } else {
            summary.failed_requests += 1;
        }
    }

    pub async fn get_peer_connections(
        &self,
        peer_id: &str,
        limit: Option<usize>,
    ) -> Vec<ConnectionLogEntry> {
        let guard = self.state.read().await;
        let mut matches: Vec<ConnectionLogEntry> = guard
            .connection_logs
            .iter()
            .filter(|e| e.peer_id == peer_id)
            .cloned()
            .collect();
        if let Some(limit) = limit {
            matches.truncate(limit);
        }
        matches
    }

    pub async fn get_all_connections(&self, limit: Option<usize>) -> Vec<ConnectionLogEntry> {
        let guard = self.state.read().await;
        let mut all = guard.connection_logs.clone();
        if let Some(limit) = limit {
            all.truncate(limit);
        }
        all
    }

    pub async fn get_shared_resources_summary(&self) -> HashMap<String, PeerSyncSummary> {
        self.state.read().await.peer_summaries.clone()
    }

    pub async fn get_peer_summary(&self, peer_id: &str) -> Option<PeerSyncSummary> {
        self.state.read().await.peer_summaries.get(peer_id).cloned()
    }

    /// For tests only.
    pub async fn clear_logs(&self) {
        let mut guard = self.state.write().await;
        guard.connection_logs.clear();
        guard.peer_summaries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(peer_id: &str, endpoint: &str, items: u64, success: bool) -> ConnectionLogEntry {
        ConnectionLogEntry {
            timestamp: Utc::now(),
            peer_id: peer_id.to_string(),
            peer_name: "Peer".to_string(),
            client_id: "client-1".to_string(),
            endpoint: endpoint.to_string(),
            items_requested: items,
            success,
            error_message: None,
            request_id: None,
        }
    }

    #[tokio::test]
    async fn summary_tracks_max_items_shared() {
        let log = FederationAuditLog::new();
        log.log_connection(entry("p1", "/api/federation/servers", 5, true))
            .await;
        log.log_connection(entry("p1", "/api/federation/servers", 2, true))
            .await;
        let summary = log.get_peer_summary("p1").await.unwrap();
        assert_eq!(summary.servers_shared, 5);
        assert_eq!(summary.successful_requests, 2);
    }

    #[tokio::test]
    async fn failed_requests_increment_failure_counter() {
        let log = FederationAuditLog::new();
        log.log_connection(entry("p1", "/api/federation/servers", 0, false))
            .await;
        let summary = log.get_peer_summary("p1").await.unwrap();
        assert_eq!(summary.failed_requests, 1);
        assert_eq!(summary.successful_requests, 0);
    }

    #[tokio::test]
    async fn log_is_capped_and_newest_first() {
        let log = FederationAuditLog::new();
        for i in 0..5 {
            log.log_connection(entry("p1", "/api/federation/servers", i, true))
                .await;
        }
        let all = log.get_all_connections(None).await;
        assert_eq!(all.len(), 5);
        assert_eq!(all[0].items_requested, 4);
    }
}
