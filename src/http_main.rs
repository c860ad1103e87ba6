//! Registry federation HTTP server.
//!
//! Serves the federation export API (what peers pull from this registry)
//! and the admin peer-management API (how operators configure peers and
//! trigger sync), backed by in-memory reference server/agent stores.
//!
//! Usage:
//!   FEDERATION_BIND_PORT=8088 registry-federation-http
//!
//! Endpoints:
//!   GET  /api/federation/health          - unauthenticated liveness probe
//!   GET  /api/federation/servers         - paginated, visibility-filtered export
//!   GET  /api/federation/agents          - paginated, visibility-filtered export
//!   GET  /api/federation/security-scans  - scans for visible servers
//!   GET  /api/v1/peers                   - list configured peers
//!   POST /api/v1/peers                   - register a peer
//!   GET  /api/v1/peers/topology          - peer mesh layout for a UI
//!   GET  /api/v1/peers/{id}              - fetch one peer
//!   PUT  /api/v1/peers/{id}              - update a peer
//!   DELETE /api/v1/peers/{id}            - remove a peer
//!   POST /api/v1/peers/sync              - trigger sync for all enabled peers
//!   POST /api/v1/peers/{id}/sync         - trigger sync for one peer
//!   GET  /api/v1/peers/{id}/status       - sync status and history
//!   POST /api/v1/peers/{id}/enable       - enable a peer
//!   POST /api/v1/peers/{id}/disable      - disable a peer

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;
use tracing_subscriber::EnvFilter;

use registry_federation::admin_routes::admin_routes;
use registry_federation::audit::FederationAuditLog;
use registry_federation::config::AppConfig;
use registry_federation::export_routes::export_routes;
use registry_federation::federation_service::PeerFederationService;
use registry_federation::models::RecordKind;
use registry_federation::peer_store::PeerStore;
use registry_federation::record_store::RecordStore;
use registry_federation::scan_store::ScanStore;
use registry_federation::scheduler::PeerSyncScheduler;
use registry_federation::state::AppState;
use registry_federation::token_source::OAuth2TokenSource;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = AppConfig::from_env();

    let peer_store = PeerStore::new(config.peers_dir.clone(), config.sync_state_path.clone());
    let server_store = RecordStore::new(RecordKind::Server);
    let agent_store = RecordStore::new(RecordKind::Agent);
    let scan_store = ScanStore::new();
    let token_source = Arc::new(OAuth2TokenSource::from_env());

    let federation = Arc::new(
        PeerFederationService::load_with_client_options(
            peer_store,
            server_store,
            agent_store,
            scan_store,
            token_source,
            Duration::from_secs(config.peer_client_timeout_seconds),
            config.peer_client_retry_attempts,
        )
        .await?,
    );

    let scheduler = Arc::new(PeerSyncScheduler::with_interval(
        Arc::clone(&federation),
        Duration::from_secs(config.scheduler_check_interval_seconds),
    ));
    scheduler.start().await;

    let state = AppState {
        federation,
        scheduler,
        audit: Arc::new(FederationAuditLog::new()),
        registry_id_override: config.registry_id_override.clone(),
    };

    let app = export_routes()
        .merge(admin_routes())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.bind_port));
    info!(%addr, "registry federation HTTP server listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
