//! Application configuration (§1A): gathered once from the environment in
//! `main` rather than scattered `env::var` calls through the rest of the
//! crate.

use std::path::PathBuf;

const DEFAULT_BIND_PORT: u16 = 8088;
const DEFAULT_PEER_CLIENT_TIMEOUT_SECONDS: u64 = 10;
const DEFAULT_PEER_CLIENT_RETRY_ATTEMPTS: u32 = 3;
const DEFAULT_SCHEDULER_CHECK_INTERVAL_SECONDS: u64 = 30;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_port: u16,
    pub peers_dir: PathBuf,
    pub sync_state_path: PathBuf,
    pub peer_client_timeout_seconds: u64,
    pub peer_client_retry_attempts: u32,
    pub scheduler_check_interval_seconds: u64,
    pub registry_id_override: Option<String>,
}

impl AppConfig {
    /// Reads overrides from the environment, falling back to defaults
    /// rooted under the OS data directory when unset.
    pub fn from_env() -> Self {
        let data_dir = dirs::data_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("registry-federation");

        AppConfig {
            bind_port: env_u16("FEDERATION_BIND_PORT", DEFAULT_BIND_PORT),
            peers_dir: std::env::var("FEDERATION_PEERS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| data_dir.join("peers")),
            sync_state_path: std::env::var("FEDERATION_SYNC_STATE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| data_dir.join("sync_state.json")),
            peer_client_timeout_seconds: env_u64(
                "FEDERATION_PEER_CLIENT_TIMEOUT_SECONDS",
                DEFAULT_PEER_CLIENT_TIMEOUT_SECONDS,
            ),
            peer_client_retry_attempts: env_u32(
                "FEDERATION_PEER_CLIENT_RETRY_ATTEMPTS",
                DEFAULT_PEER_CLIENT_RETRY_ATTEMPTS,
            ),
            scheduler_check_interval_seconds: env_u64(
                "FEDERATION_SCHEDULER_INTERVAL_SECONDS",
                DEFAULT_SCHEDULER_CHECK_INTERVAL_SECONDS,
            ),
            registry_id_override: std::env::var("FEDERATION_REGISTRY_ID").ok(),
        }
    }
}

fn env_u16(key: &str, default: u16) -> u16 {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}
