//! Minimal in-memory stand-in for the `server_store`/`agent_store`
//! collaborators (§6.1). The federation subsystem is the thing under
//! implementation here, not a full registry, so this only goes as deep as
//! the sync engine and export endpoints need: list/get/enabled-check/
//! create/update/delete/set-enabled, keyed by record path.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::error::{FederationError, FederationResult};
use crate::models::{RecordKind, RegisteredRecord};

#[derive(Clone)]
pub struct RecordStore {
    kind: RecordKind,
    records: Arc<RwLock<HashMap<String, RegisteredRecord>>>,
}

impl RecordStore {
    pub fn new(kind: RecordKind) -> Self {
        RecordStore {
            kind,
            records: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn list_all(&self) -> HashMap<String, RegisteredRecord> {
        self.records.read().await.clone()
    }

    pub async fn get(&self, path: &str) -> Option<RegisteredRecord> {
        self.records.read().await.get(path).cloned()
    }

    pub async fn is_enabled(&self, path: &str) -> bool {
        self.records
            .read()
            .await
            .get(path)
            .map(|r| r.enabled)
            .unwrap_or(false)
    }

    pub async fn create(&self, record: RegisteredRecord) -> FederationResult<()> {
        if record.kind != self.kind {
            return Err(FederationError::InvalidInput(format!(
                "record kind mismatch: store holds {:?}, got {:?}",
                self.kind, record.kind
            )));
        }
        self.records
            .write()
            .await
            .insert(record.path.clone(), record);
        Ok(())
    }

    pub async fn update(&self, path: &str, record: RegisteredRecord) -> FederationResult<()> {
        let mut guard = self.records.write().await;
        if !guard.contains_key(path) {
            return Err(FederationError::NotFound(format!(
                "record not found: {path}"
            )));
        }
        guard.insert(path.to_string(), record);
        Ok(())
    }

    pub async fn delete(&self, path: &str) -> FederationResult<()> {
        self.records
            .write()
            .await
            .remove(path)
            .map(|_| ())
            .ok_or_else(|| FederationError::NotFound(format!("record not found: {path}")))
    }

    pub async fn set_state(&self, path: &str, enabled: bool) -> FederationResult<()> {
        let mut guard = self.records.write().await;
        let record = guard
            .get_mut(path)
            .ok_or_else(|| FederationError::NotFound(format!("record not found: {path}")))?;
        record.enabled = enabled;
        Ok(())
    }

    /// Sets `sync_metadata` on an existing record in place, used by orphan
    /// detection and `set_local_override` — the "generic set metadata
    /// update" mentioned in §4.1.5.
    pub async fn set_sync_metadata(
        &self,
        path: &str,
        metadata: crate::models::SyncMetadata,
    ) -> FederationResult<()> {
        let mut guard = self.records.write().await;
        let record = guard
            .get_mut(path)
            .ok_or_else(|| FederationError::NotFound(format!("record not found: {path}")))?;
        record.sync_metadata = Some(metadata);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Visibility;
    use serde_json::Map;

    fn sample(path: &str) -> RegisteredRecord {
        RegisteredRecord {
            kind: RecordKind::Server,
            path: path.to_string(),
            enabled: true,
            visibility: Visibility::Public,
            allowed_groups: Default::default(),
            sync_metadata: None,
            extras: Map::new(),
        }
    }

    #[tokio::test]
    async fn create_get_update_delete() {
        let store = RecordStore::new(RecordKind::Server);
        store.create(sample("/s1")).await.unwrap();
        assert!(store.get("/s1").await.is_some());
        assert!(store.is_enabled("/s1").await);

        store.set_state("/s1", false).await.unwrap();
        assert!(!store.is_enabled("/s1").await);

        store.delete("/s1").await.unwrap();
        assert!(store.get("/s1").await.is_none());
    }

    #[tokio::test]
    async fn update_missing_record_errors() {
        let store = RecordStore::new(RecordKind::Server);
        let result = store.update("/missing", sample("/missing")).await;
        assert!(result.is_err());
    }
}
