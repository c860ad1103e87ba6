//! Minimal in-memory stand-in for the `security_scan_repository`
//! collaborator (§6.1), the source `get_security_scan_repository()` feeds
//! from. Same `Arc<RwLock<HashMap<...>>>` shape as `RecordStore`, scoped
//! down to what §4.5.4's export pipeline needs: list/get/create/delete,
//! keyed by `scan_id`.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::error::{FederationError, FederationResult};
use crate::models::SecurityScanRecord;

#[derive(Clone, Default)]
pub struct ScanStore {
    scans: Arc<RwLock<HashMap<String, SecurityScanRecord>>>,
}

impl ScanStore {
    pub fn new() -> Self {
        ScanStore {
            scans: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn list_all(&self) -> HashMap<String, SecurityScanRecord> {
        self.scans.read().await.clone()
    }

    pub async fn get(&self, scan_id: &str) -> Option<SecurityScanRecord> {
        self.scans.read().await.get(scan_id).cloned()
    }

    pub async fn create(&self, scan: SecurityScanRecord) -> FederationResult<()> {
        self.scans.write().await.insert(scan.scan_id.clone(), scan);
        Ok(())
    }

    pub async fn delete(&self, scan_id: &str) -> FederationResult<()> {
        self.scans
            .write()
            .await
            .remove(scan_id)
            .map(|_| ())
            .ok_or_else(|| FederationError::NotFound(format!("scan not found: {scan_id}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;

    fn sample(scan_id: &str, server_path: &str) -> SecurityScanRecord {
        SecurityScanRecord {
            scan_id: scan_id.to_string(),
            server_path: server_path.to_string(),
            extras: Map::new(),
        }
    }

    #[tokio::test]
    async fn create_list_get_delete() {
        let store = ScanStore::new();
        store.create(sample("scan-1", "/s1")).await.unwrap();
        assert_eq!(store.list_all().await.len(), 1);
        assert_eq!(store.get("scan-1").await.unwrap().server_path, "/s1");

        store.delete("scan-1").await.unwrap();
        assert!(store.get("scan-1").await.is_none());
    }

    #[tokio::test]
    async fn delete_missing_scan_errors() {
        let store = ScanStore::new();
        assert!(store.delete("missing").await.is_err());
    }
}
