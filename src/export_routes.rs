//! Federation export endpoints (§4.5): the inbound HTTP surface peers pull
//! from. Every route but `/health` requires the federation scope and is
//! audited via the federation audit log.

use axum::extract::{Query, State};
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use crate::auth::{require_federation_scope, AuthenticatedPrincipal};
use crate::error::{FederationError, FederationResult};
use crate::models::{
    ConnectionLogEntry, FederationExport, Principal, RegisteredRecord, SecurityScanRecord, Visibility,
};
use crate::state::AppState;

const DEFAULT_PAGE_LIMIT: usize = 100;
const MAX_PAGE_LIMIT: usize = 1000;

#[derive(Debug, Deserialize)]
pub struct ExportQuery {
    limit: Option<usize>,
    offset: Option<usize>,
    since_generation: Option<u64>,
}

#[derive(Serialize)]
struct HealthBody {
    status: &'static str,
    federation_api_version: &'static str,
    registry_id: String,
}

pub fn export_routes() -> Router<AppState> {
    Router::new()
        .route("/api/federation/health", get(health))
        .route("/api/federation/servers", get(export_servers))
        .route("/api/federation/agents", get(export_agents))
        .route("/api/federation/security-scans", get(export_security_scans))
}

async fn health(State(state): State<AppState>) -> Json<HealthBody> {
    Json(HealthBody {
        status: "healthy",
        federation_api_version: "1.0",
        registry_id: state.registry_id(),
    })
}

fn validate_pagination(limit: Option<usize>, offset: Option<usize>) -> FederationResult<(usize, usize)> {
    let limit = limit.unwrap_or(DEFAULT_PAGE_LIMIT);
    let offset = offset.unwrap_or(0);
    if limit < 1 || limit > MAX_PAGE_LIMIT {
        return Err(FederationError::InvalidInput(format!(
            "limit must be between 1 and {MAX_PAGE_LIMIT}, got {limit}"
        )));
    }
    Ok((limit, offset))
}

fn is_visible(record: &RegisteredRecord, principal_groups: &std::collections::HashSet<String>) -> bool {
    match record.visibility {
        Visibility::Public => true,
        Visibility::Internal => false,
        Visibility::GroupRestricted => {
            !record.allowed_groups.is_empty()
                && record
                    .allowed_groups
                    .iter()
                    .any(|g| principal_groups.contains(g))
        }
    }
}

/// Steps 1-3 of §4.5.2: enabled, not federated (chain prevention), visible.
fn visible_local_records(
    all: std::collections::HashMap<String, RegisteredRecord>,
    principal: &Principal,
) -> Vec<RegisteredRecord> {
    all.into_values()
        .filter(|r| r.enabled)
        .filter(|r| !r.sync_metadata.as_ref().map(|m| m.is_federated).unwrap_or(false))
        .filter(|r| is_visible(r, &principal.groups))
        .collect()
}

fn apply_generation_filter(items: Vec<RegisteredRecord>, since_generation: Option<u64>) -> Vec<RegisteredRecord> {
    let Some(since) = since_generation else {
        return items;
    };
    items
        .into_iter()
        .filter(|r| match &r.sync_metadata {
            Some(meta) => meta.sync_generation > since,
            None => true,
        })
        .collect()
}

fn paginate<T>(mut items: Vec<T>, limit: usize, offset: usize) -> (Vec<T>, usize, bool) {
    let total_count = items.len();
    let has_more = total_count > offset + limit;
    let page = if offset >= items.len() {
        Vec::new()
    } else {
        let end = (offset + limit).min(items.len());
        items.drain(offset..end).collect()
    };
    (page, total_count, has_more)
}

async fn export_servers(
    State(state): State<AppState>,
    Query(query): Query<ExportQuery>,
    AuthenticatedPrincipal(principal): AuthenticatedPrincipal,
) -> FederationResult<Json<FederationExport<RegisteredRecord>>> {
    require_federation_scope(&principal)?;
    let (limit, offset) = validate_pagination(query.limit, query.offset)?;

    let all = state.federation.server_store().list_all().await;
    let filtered = visible_local_records(all, &principal);
    let filtered = apply_generation_filter(filtered, query.since_generation);
    let (items, total_count, has_more) = paginate(filtered, limit, offset);

    audit_export(&state, &principal, "/api/federation/servers", items.len()).await;

    Ok(Json(FederationExport {
        sync_generation: state.current_sync_generation().await,
        total_count,
        has_more,
        registry_id: state.registry_id(),
        items,
    }))
}

async fn export_agents(
    State(state): State<AppState>,
    Query(query): Query<ExportQuery>,
    AuthenticatedPrincipal(principal): AuthenticatedPrincipal,
) -> FederationResult<Json<FederationExport<RegisteredRecord>>> {
    require_federation_scope(&principal)?;
    let (limit, offset) = validate_pagination(query.limit, query.offset)?;

    let all = state.federation.agent_store().list_all().await;
    let filtered = visible_local_records(all, &principal);
    let filtered = apply_generation_filter(filtered, query.since_generation);
    let (items, total_count, has_more) = paginate(filtered, limit, offset);

    audit_export(&state, &principal, "/api/federation/agents", items.len()).await;

    Ok(Json(FederationExport {
        sync_generation: state.current_sync_generation().await,
        total_count,
        has_more,
        registry_id: state.registry_id(),
        items,
    }))
}

#[derive(Debug, Deserialize)]
pub struct ScanQuery {
    limit: Option<usize>,
    offset: Option<usize>,
}

/// §4.5.4: scans are gated by server visibility, not their own. Builds the
/// visible-server-path set the same way §4.5.2 steps 1-3 do (chain
/// prevention included), with no generation filter or pagination applied
/// to the servers themselves.
async fn export_security_scans(
    State(state): State<AppState>,
    Query(query): Query<ScanQuery>,
    AuthenticatedPrincipal(principal): AuthenticatedPrincipal,
) -> FederationResult<Json<FederationExport<SecurityScanRecord>>> {
    require_federation_scope(&principal)?;
    let (limit, offset) = validate_pagination(query.limit, query.offset)?;

    let all_servers = state.federation.server_store().list_all().await;
    let visible_servers = visible_local_records(all_servers, &principal);
    let visible_paths: std::collections::HashSet<String> =
        visible_servers.into_iter().map(|r| r.path).collect();

    let scans = state.federation.scan_store().list_all().await;
    let matching: Vec<SecurityScanRecord> = scans
        .into_values()
        .filter(|scan| visible_paths.contains(&scan.server_path))
        .collect();
    let (items, total_count, has_more) = paginate(matching, limit, offset);

    audit_export(&state, &principal, "/api/federation/security-scans", items.len()).await;

    Ok(Json(FederationExport {
        sync_generation: state.current_sync_generation().await,
        total_count,
        has_more,
        registry_id: state.registry_id(),
        items,
    }))
}

async fn audit_export(state: &AppState, principal: &Principal, endpoint: &str, items_requested: usize) {
    let (peer_id, peer_name) = match &principal.client_id {
        Some(client_id) => match state.federation.get_peer_by_client_id(client_id).await {
            Some(peer) => (peer.peer_id, peer.name),
            None => (principal.username.clone(), String::new()),
        },
        None => (principal.username.clone(), String::new()),
    };
    state
        .audit
        .log_connection(ConnectionLogEntry {
            timestamp: chrono::Utc::now(),
            peer_id,
            peer_name,
            client_id: principal.client_id.clone().unwrap_or_default(),
            endpoint: endpoint.to_string(),
            items_requested: items_requested as u64,
            success: true,
            error_message: None,
            request_id: None,
        })
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{RecordKind, SyncMetadata};
    use chrono::Utc;
    use std::collections::{HashMap, HashSet};

    fn record(path: &str, visibility: Visibility, allowed_groups: &[&str], federated: bool) -> RegisteredRecord {
        RegisteredRecord {
            kind: RecordKind::Server,
            path: path.to_string(),
            enabled: true,
            visibility,
            allowed_groups: allowed_groups.iter().map(|s| s.to_string()).collect(),
            sync_metadata: if federated {
                Some(SyncMetadata {
                    source_peer_id: "p1".into(),
                    original_path: path.to_string(),
                    is_federated: true,
                    synced_at: Utc::now(),
                    sync_generation: 1,
                    is_orphaned: false,
                    orphaned_at: None,
                    local_overrides: false,
                    is_read_only: true,
                })
            } else {
                None
            },
            extras: Default::default(),
        }
    }

    fn principal_with_groups(groups: &[&str]) -> Principal {
        Principal {
            username: "peer".into(),
            client_id: None,
            scopes: ["federation-service".to_string()].into_iter().collect(),
            groups: groups.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn scans_are_kept_only_for_visible_server_paths() {
        let mut servers = HashMap::new();
        servers.insert("/pub".to_string(), record("/pub", Visibility::Public, &[], false));
        servers.insert("/int".to_string(), record("/int", Visibility::Internal, &[], false));
        let visible_paths: HashSet<String> = visible_local_records(servers, &principal_with_groups(&[]))
            .into_iter()
            .map(|r| r.path)
            .collect();

        let scans = vec![
            SecurityScanRecord {
                scan_id: "scan-1".into(),
                server_path: "/pub".into(),
                extras: Default::default(),
            },
            SecurityScanRecord {
                scan_id: "scan-2".into(),
                server_path: "/int".into(),
                extras: Default::default(),
            },
        ];
        let matching: Vec<SecurityScanRecord> = scans
            .into_iter()
            .filter(|scan| visible_paths.contains(&scan.server_path))
            .collect();
        assert_eq!(matching.len(), 1);
        assert_eq!(matching[0].scan_id, "scan-1");
    }

    #[test]
    fn chain_prevention_drops_federated_records() {
        let mut all = HashMap::new();
        all.insert("/local".to_string(), record("/local", Visibility::Public, &[], false));
        all.insert("/p1/s1".to_string(), record("/p1/s1", Visibility::Public, &[], true));
        let visible = visible_local_records(all, &principal_with_groups(&[]));
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].path, "/local");
    }

    #[test]
    fn visibility_filters_by_group_membership() {
        let mut all = HashMap::new();
        all.insert("/pub".to_string(), record("/pub", Visibility::Public, &[], false));
        all.insert(
            "/eng".to_string(),
            record("/eng", Visibility::GroupRestricted, &["engineering"], false),
        );
        all.insert("/int".to_string(), record("/int", Visibility::Internal, &[], false));

        let eng_visible = visible_local_records(all.clone(), &principal_with_groups(&["engineering"]));
        let mut eng_paths: Vec<_> = eng_visible.iter().map(|r| r.path.clone()).collect();
        eng_paths.sort();
        assert_eq!(eng_paths, vec!["/eng".to_string(), "/pub".to_string()]);

        let sales_visible = visible_local_records(all.clone(), &principal_with_groups(&["sales"]));
        assert_eq!(sales_visible.len(), 1);
        assert_eq!(sales_visible[0].path, "/pub");

        let no_groups_visible = visible_local_records(all, &principal_with_groups(&[]));
        assert_eq!(no_groups_visible.len(), 1);
        assert_eq!(no_groups_visible[0].path, "/pub");
    }

    #[test]
    fn empty_allowed_groups_excludes_everyone() {
        let mut all = HashMap::new();
        all.insert(
            "/eng".to_string(),
            record("/eng", Visibility::GroupRestricted, &[], false),
        );
        let visible = visible_local_records(all, &principal_with_groups(&["engineering"]));
        assert!(visible.is_empty());
    }

    #[test]
    fn pagination_has_more_matches_formula() {
        let items: Vec<RegisteredRecord> = (0..5)
            .map(|i| record(&format!("/s{i}"), Visibility::Public, &[], false))
            .collect();
        let (page, total, has_more) = paginate(items, 2, 0);
        assert_eq!(page.len(), 2);
        assert_eq!(total, 5);
        assert!(has_more);

        let items: Vec<RegisteredRecord> = (0..5)
            .map(|i| record(&format!("/s{i}"), Visibility::Public, &[], false))
            .collect();
        let (page, total, has_more) = paginate(items, 10, 0);
        assert_eq!(page.len(), 5);
        assert_eq!(total, 5);
        assert!(!has_more);
    }

    #[test]
    fn offset_beyond_total_yields_empty_page() {
        let items: Vec<RegisteredRecord> = (0..3)
            .map(|i| record(&format!("/s{i}"), Visibility::Public, &[], false))
            .collect();
        let (page, total, has_more) = paginate(items, 10, 100);
        assert!(page.is_empty());
        assert_eq!(total, 3);
        assert!(!has_more);
    }

    #[test]
    fn generation_filter_keeps_unmetadata_items_unconditionally() {
        let items = vec![
            record("/native", Visibility::Public, &[], false),
            {
                let mut r = record("/old", Visibility::Public, &[], false);
                r.sync_metadata = Some(SyncMetadata {
                    source_peer_id: "p1".into(),
                    original_path: "/old".into(),
                    is_federated: false,
                    synced_at: Utc::now(),
                    sync_generation: 3,
                    is_orphaned: false,
                    orphaned_at: None,
                    local_overrides: false,
                    is_read_only: true,
                });
                r
            },
        ];
        let filtered = apply_generation_filter(items, Some(5));
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].path, "/native");
    }

    #[test]
    fn limit_out_of_range_rejected() {
        assert!(validate_pagination(Some(0), None).is_err());
        assert!(validate_pagination(Some(1001), None).is_err());
        assert!(validate_pagination(Some(1), None).is_ok());
        assert!(validate_pagination(Some(1000), None).is_ok());
    }
}
