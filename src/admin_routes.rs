//! Peer-management admin API (§6.3): CRUD over peer configs plus manual
//! sync triggers and topology data for a UI. Gated on "non-empty
//! principal", not the federation scope — this is an operator surface,
//! not a peer-to-peer one.

use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use std::f64::consts::PI;

use crate::auth::AuthenticatedPrincipal;
use crate::error::{FederationError, FederationResult};
use crate::models::{NewPeerConfig, PeerConfig, PeerConfigUpdate, PeerSyncStatus, SyncResult};
use crate::state::AppState;

const TOPOLOGY_RADIUS: f64 = 200.0;
const TOPOLOGY_CENTER_X: f64 = 400.0;
const TOPOLOGY_CENTER_Y: f64 = 300.0;

pub fn admin_routes() -> Router<AppState> {
    Router::new()
        .route("/api/v1/peers", get(list_peers).post(create_peer))
        .route("/api/v1/peers/topology", get(topology))
        .route("/api/v1/peers/sync", post(sync_all))
        .route(
            "/api/v1/peers/:id",
            get(get_peer).put(update_peer).delete(delete_peer),
        )
        .route("/api/v1/peers/:id/sync", post(sync_one))
        .route("/api/v1/peers/:id/status", get(status))
        .route("/api/v1/peers/:id/enable", post(enable))
        .route("/api/v1/peers/:id/disable", post(disable))
}

fn require_principal(principal: &crate::models::Principal) -> FederationResult<()> {
    if principal.username.is_empty() {
        return Err(FederationError::Unauthenticated);
    }
    Ok(())
}

async fn list_peers(
    State(state): State<AppState>,
    AuthenticatedPrincipal(principal): AuthenticatedPrincipal,
) -> FederationResult<Json<Vec<PeerConfig>>> {
    require_principal(&principal)?;
    Ok(Json(state.federation.list_peers(None).await))
}

async fn create_peer(
    State(state): State<AppState>,
    AuthenticatedPrincipal(principal): AuthenticatedPrincipal,
    Json(input): Json<NewPeerConfig>,
) -> FederationResult<Json<PeerConfig>> {
    require_principal(&principal)?;
    Ok(Json(state.federation.add_peer(input).await?))
}

async fn get_peer(
    State(state): State<AppState>,
    AuthenticatedPrincipal(principal): AuthenticatedPrincipal,
    Path(id): Path<String>,
) -> FederationResult<Json<PeerConfig>> {
    require_principal(&principal)?;
    Ok(Json(state.federation.get_peer(&id).await?))
}

async fn update_peer(
    State(state): State<AppState>,
    AuthenticatedPrincipal(principal): AuthenticatedPrincipal,
    Path(id): Path<String>,
    Json(update): Json<PeerConfigUpdate>,
) -> FederationResult<Json<PeerConfig>> {
    require_principal(&principal)?;
    Ok(Json(state.federation.update_peer(&id, update).await?))
}

async fn delete_peer(
    State(state): State<AppState>,
    AuthenticatedPrincipal(principal): AuthenticatedPrincipal,
    Path(id): Path<String>,
) -> FederationResult<()> {
    require_principal(&principal)?;
    state.federation.remove_peer(&id).await
}

async fn sync_one(
    State(state): State<AppState>,
    AuthenticatedPrincipal(principal): AuthenticatedPrincipal,
    Path(id): Path<String>,
) -> FederationResult<Json<SyncResult>> {
    require_principal(&principal)?;
    Ok(Json(state.federation.sync_peer(&id).await?))
}

async fn sync_all(
    State(state): State<AppState>,
    AuthenticatedPrincipal(principal): AuthenticatedPrincipal,
) -> FederationResult<Json<std::collections::HashMap<String, SyncResult>>> {
    require_principal(&principal)?;
    Ok(Json(state.federation.sync_all_peers(true).await))
}

async fn status(
    State(state): State<AppState>,
    AuthenticatedPrincipal(principal): AuthenticatedPrincipal,
    Path(id): Path<String>,
) -> FederationResult<Json<PeerSyncStatus>> {
    require_principal(&principal)?;
    state
        .federation
        .get_sync_status(&id)
        .await
        .map(Json)
        .ok_or_else(|| FederationError::NotFound(format!("no sync status for peer: {id}")))
}

async fn enable(
    State(state): State<AppState>,
    AuthenticatedPrincipal(principal): AuthenticatedPrincipal,
    Path(id): Path<String>,
) -> FederationResult<Json<PeerConfig>> {
    require_principal(&principal)?;
    let update = PeerConfigUpdate {
        enabled: Some(true),
        ..Default::default()
    };
    Ok(Json(state.federation.update_peer(&id, update).await?))
}

async fn disable(
    State(state): State<AppState>,
    AuthenticatedPrincipal(principal): AuthenticatedPrincipal,
    Path(id): Path<String>,
) -> FederationResult<Json<PeerConfig>> {
    require_principal(&principal)?;
    let update = PeerConfigUpdate {
        enabled: Some(false),
        ..Default::default()
    };
    Ok(Json(state.federation.update_peer(&id, update).await?))
}

#[derive(Debug, Serialize)]
struct TopologyNode {
    id: String,
    label: String,
    x: f64,
    y: f64,
    healthy: bool,
}

#[derive(Debug, Serialize)]
struct TopologyEdge {
    source: String,
    target: String,
    animated: bool,
}

#[derive(Debug, Serialize)]
struct Topology {
    nodes: Vec<TopologyNode>,
    edges: Vec<TopologyEdge>,
}

/// §6.3.2: peers placed evenly around a circle centered on a synthetic
/// local node; edge is animated when the peer is both enabled and healthy.
async fn topology(
    State(state): State<AppState>,
    AuthenticatedPrincipal(principal): AuthenticatedPrincipal,
) -> FederationResult<Json<Topology>> {
    require_principal(&principal)?;
    let peers = state.federation.list_peers(None).await;
    let registry_id = state.registry_id();

    let mut nodes = vec![TopologyNode {
        id: registry_id.clone(),
        label: registry_id.clone(),
        x: TOPOLOGY_CENTER_X,
        y: TOPOLOGY_CENTER_Y,
        healthy: true,
    }];
    let mut edges = Vec::new();

    let n = peers.len().max(1) as f64;
    for (i, peer) in peers.iter().enumerate() {
        let angle = 2.0 * PI * (i as f64) / n;
        let x = TOPOLOGY_CENTER_X + TOPOLOGY_RADIUS * angle.cos();
        let y = TOPOLOGY_CENTER_Y + TOPOLOGY_RADIUS * angle.sin();
        let healthy = state
            .federation
            .get_sync_status(&peer.peer_id)
            .await
            .map(|s| s.is_healthy)
            .unwrap_or(false);
        nodes.push(TopologyNode {
            id: peer.peer_id.clone(),
            label: peer.name.clone(),
            x,
            y,
            healthy,
        });
        edges.push(TopologyEdge {
            source: registry_id.clone(),
            target: peer.peer_id.clone(),
            animated: peer.enabled && healthy,
        });
    }

    Ok(Json(Topology { nodes, edges }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topology_angles_span_full_circle() {
        let n = 4.0_f64;
        let angles: Vec<f64> = (0..4).map(|i| 2.0 * PI * (i as f64) / n).collect();
        assert!((angles[0] - 0.0).abs() < 1e-9);
        assert!((angles[2] - PI).abs() < 1e-9);
    }

    #[test]
    fn require_principal_rejects_empty_username() {
        let principal = crate::models::Principal::default();
        assert!(require_principal(&principal).is_err());
    }

    #[test]
    fn require_principal_accepts_named_principal() {
        let principal = crate::models::Principal {
            username: "alice".into(),
            ..Default::default()
        };
        assert!(require_principal(&principal).is_ok());
    }
}
