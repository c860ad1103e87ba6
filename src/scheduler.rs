//! Peer sync scheduler (§4.3): a cooperative background loop that drives
//! periodic per-peer sync with duplicate suppression and a graceful,
//! bounded-wait stop.

use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::federation_service::PeerFederationService;
use crate::models::PeerConfig;

const DEFAULT_CHECK_INTERVAL_SECONDS: u64 = 30;
const STOP_MAX_WAIT_SECONDS: u64 = 30;
const STOP_POLL_INTERVAL_MS: u64 = 500;

pub struct PeerSyncScheduler {
    federation: Arc<PeerFederationService>,
    running: Arc<Mutex<bool>>,
    syncing_peers: Arc<Mutex<HashSet<String>>>,
    check_interval: Duration,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
}

impl PeerSyncScheduler {
    pub fn new(federation: Arc<PeerFederationService>) -> Self {
        Self::with_interval(federation, Duration::from_secs(DEFAULT_CHECK_INTERVAL_SECONDS))
    }

    pub fn with_interval(federation: Arc<PeerFederationService>, check_interval: Duration) -> Self {
        PeerSyncScheduler {
            federation,
            running: Arc::new(Mutex::new(false)),
            syncing_peers: Arc::new(Mutex::new(HashSet::new())),
            check_interval,
            loop_handle: Mutex::new(None),
        }
    }

    pub async fn is_running(&self) -> bool {
        *self.running.lock().await
    }

    pub async fn syncing_peers(&self) -> HashSet<String> {
        self.syncing_peers.lock().await.clone()
    }

    /// Idempotent: warns and returns if already running (§4.3.4).
    pub async fn start(self: &Arc<Self>) {
        let mut running = self.running.lock().await;
        if *running {
            warn!("scheduler already running; ignoring start()");
            return;
        }
        *running = true;
        drop(running);

        let this = Arc::clone(self);
        let handle = tokio::spawn(async move {
            this.run_loop().await;
        });
        *self.loop_handle.lock().await = Some(handle);
        info!("peer sync scheduler started");
    }

    async fn run_loop(self: Arc<Self>) {
        loop {
            if !*self.running.lock().await {
                break;
            }
            if let Err(e) = self.check_and_sync_peers().await {
                error!(error = %e, "error during scheduler tick");
            }
            tokio::select! {
                _ = tokio::time::sleep(self.check_interval) => {}
            }
            if !*self.running.lock().await {
                break;
            }
        }
    }

    async fn check_and_sync_peers(&self) -> anyhow::Result<()> {
        let enabled_peers = self.federation.list_peers(Some(true)).await;
        for peer in enabled_peers {
            let status = self.federation.get_sync_status(&peer.peer_id).await;
            let last_successful_sync = status.and_then(|s| s.last_successful_sync);
            if should_sync(&peer, last_successful_sync) {
                let this_federation = Arc::clone(&self.federation);
                let syncing_peers = Arc::clone(&self.syncing_peers);
                let peer_id = peer.peer_id.clone();
                // Intentionally not awaited here: the next tick must not
                // wait for this batch to finish (§4.3.1).
                tokio::spawn(async move {
                    sync_peer_safe(this_federation, syncing_peers, peer_id).await;
                });
            }
        }
        Ok(())
    }

    /// `stop()`: cancels the loop, then waits up to 30s for in-flight syncs
    /// to drain, polling every 500ms. Always returns (§4.3.4).
    pub async fn stop(&self) {
        let mut running = self.running.lock().await;
        if !*running {
            warn!("scheduler not running; ignoring stop()");
            return;
        }
        *running = false;
        drop(running);

        if let Some(handle) = self.loop_handle.lock().await.take() {
            handle.abort();
        }

        let mut waited = Duration::from_secs(0);
        let max_wait = Duration::from_secs(STOP_MAX_WAIT_SECONDS);
        let poll = Duration::from_millis(STOP_POLL_INTERVAL_MS);
        while waited < max_wait {
            if self.syncing_peers.lock().await.is_empty() {
                break;
            }
            tokio::time::sleep(poll).await;
            waited += poll;
        }
        let remaining = self.syncing_peers.lock().await;
        if !remaining.is_empty() {
            warn!(peers = ?*remaining, "scheduler stopped with syncs still in flight");
        }
    }

    /// Runs one guarded sync per enabled peer concurrently, returning a map
    /// of `peer_id -> success`, where success is the post-sync healthy flag.
    pub async fn trigger_sync_all(&self) -> HashMap<String, bool> {
        let enabled_peers = self.federation.list_peers(Some(true)).await;
        if enabled_peers.is_empty() {
            return HashMap::new();
        }
        let futures = enabled_peers.into_iter().map(|peer| {
            let federation = Arc::clone(&self.federation);
            let syncing_peers = Arc::clone(&self.syncing_peers);
            async move {
                let peer_id = peer.peer_id.clone();
                sync_peer_safe(federation.clone(), syncing_peers, peer_id.clone()).await;
                let healthy = federation
                    .get_sync_status(&peer_id)
                    .await
                    .map(|s| s.is_healthy)
                    .unwrap_or(false);
                (peer_id, healthy)
            }
        });
        futures::future::join_all(futures).await.into_iter().collect()
    }
}

/// §4.3.2, clock-skew clamped.
pub fn should_sync(peer: &PeerConfig, last_successful_sync: Option<chrono::DateTime<Utc>>) -> bool {
    if !peer.enabled {
        return false;
    }
    let Some(last) = last_successful_sync else {
        return true;
    };
    let elapsed = (Utc::now() - last).num_seconds().max(0);
    elapsed >= (peer.sync_interval_minutes as i64) * 60
}

/// §4.3.3: duplicate-suppressed, always clears the syncing marker on exit.
async fn sync_peer_safe(
    federation: Arc<PeerFederationService>,
    syncing_peers: Arc<Mutex<HashSet<String>>>,
    peer_id: String,
) {
    {
        let mut guard = syncing_peers.lock().await;
        if guard.contains(&peer_id) {
            return;
        }
        guard.insert(peer_id.clone());
    }

    match federation.get_peer(&peer_id).await {
        Ok(peer) if peer.enabled => match federation.sync_peer(&peer_id).await {
            Ok(result) => info!(peer_id = %peer_id, success = result.success, "scheduled sync completed"),
            Err(e) => error!(peer_id = %peer_id, error = %e, "scheduled sync failed"),
        },
        Ok(_) => info!(peer_id = %peer_id, "peer disabled before scheduled sync ran; skipping"),
        Err(_) => info!(peer_id = %peer_id, "peer removed before scheduled sync ran; skipping"),
    }

    syncing_peers.lock().await.remove(&peer_id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{NewPeerConfig, SyncMode};
    use chrono::Duration as ChronoDuration;

    fn peer(enabled: bool, interval_minutes: u32) -> PeerConfig {
        PeerConfig::new(
            NewPeerConfig {
                peer_id: "p1".into(),
                name: "Peer".into(),
                endpoint: "https://example.com".into(),
                enabled,
                sync_mode: SyncMode::All,
                whitelist_servers: Default::default(),
                whitelist_agents: Default::default(),
                tag_filters: Default::default(),
                sync_interval_minutes: interval_minutes,
                federation_token: None,
                expected_client_id: None,
                expected_issuer: None,
            },
            Utc::now(),
        )
        .unwrap()
    }

    #[test]
    fn disabled_peer_never_syncs() {
        assert!(!should_sync(&peer(false, 60), None));
    }

    #[test]
    fn never_synced_peer_always_due() {
        assert!(should_sync(&peer(true, 60), None));
    }

    #[test]
    fn interval_not_yet_elapsed_is_false() {
        let recent = Utc::now() - ChronoDuration::seconds(10);
        assert!(!should_sync(&peer(true, 60), Some(recent)));
    }

    #[test]
    fn interval_elapsed_is_true() {
        let old = Utc::now() - ChronoDuration::minutes(61);
        assert!(should_sync(&peer(true, 60), Some(old)));
    }

    #[test]
    fn future_last_sync_is_clamped_not_negative() {
        let future = Utc::now() + ChronoDuration::minutes(5);
        assert!(!should_sync(&peer(true, 60), Some(future)));
    }
}
