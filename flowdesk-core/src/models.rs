use crate::types::ProcessModel;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::RwLock;

// ── Model lifecycle ──
// created → edited (source replaced, deployment pointer left stale)
//         → published (pointer set) → revoked (pointer cleared)

/// Persistence trait for process models.
#[async_trait]
pub trait ModelStore: Send + Sync {
    /// Insert a new model. Keys are unique.
    async fn create(&self, model: &ProcessModel) -> Result<()>;
    async fn load(&self, id: &str) -> Result<Option<ProcessModel>>;
    async fn list(&self) -> Result<Vec<ProcessModel>>;
    /// Replace the editor source and bump the revision. `None` if the model is unknown.
    async fn save_source(&self, id: &str, source: Vec<u8>) -> Result<Option<ProcessModel>>;
    /// Point the model at a deployment (or clear the pointer). `false` if the model is unknown.
    async fn set_deployment(&self, id: &str, deployment_id: Option<String>) -> Result<bool>;
}

// ── MemoryModelStore ──

/// In-memory ModelStore for testing and POC.
pub struct MemoryModelStore {
    inner: RwLock<HashMap<String, ProcessModel>>,
}

impl MemoryModelStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for MemoryModelStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ModelStore for MemoryModelStore {
    async fn create(&self, model: &ProcessModel) -> Result<()> {
        let mut store = self.inner.write().map_err(|e| anyhow!("Lock: {}", e))?;
        if store.contains_key(&model.id) {
            return Err(anyhow!("Model {} already exists", model.id));
        }
        if store.values().any(|m| m.key == model.key) {
            return Err(anyhow!("Model key '{}' is already in use", model.key));
        }
        store.insert(model.id.clone(), model.clone());
        Ok(())
    }

    async fn load(&self, id: &str) -> Result<Option<ProcessModel>> {
        let store = self.inner.read().map_err(|e| anyhow!("Lock: {}", e))?;
        Ok(store.get(id).cloned())
    }

    async fn list(&self) -> Result<Vec<ProcessModel>> {
        let store = self.inner.read().map_err(|e| anyhow!("Lock: {}", e))?;
        let mut models: Vec<_> = store.values().cloned().collect();
        models.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(models)
    }

    async fn save_source(&self, id: &str, source: Vec<u8>) -> Result<Option<ProcessModel>> {
        let mut store = self.inner.write().map_err(|e| anyhow!("Lock: {}", e))?;
        let Some(model) = store.get_mut(id) else {
            return Ok(None);
        };
        model.editor_source = Some(source);
        model.revision += 1;
        model.last_updated_at = Utc::now();
        if let Some(meta) = model.meta_info.as_object_mut() {
            meta.insert("revision".to_string(), model.revision.into());
        }
        Ok(Some(model.clone()))
    }

    async fn set_deployment(&self, id: &str, deployment_id: Option<String>) -> Result<bool> {
        let mut store = self.inner.write().map_err(|e| anyhow!("Lock: {}", e))?;
        match store.get_mut(id) {
            Some(model) => {
                model.deployment_id = deployment_id;
                model.last_updated_at = Utc::now();
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_load_list() {
        let store = MemoryModelStore::new();
        let a = ProcessModel::new("Leave Request", "leave", "time off");
        let b = ProcessModel::new("Expense", "expense", "");
        store.create(&a).await.unwrap();
        store.create(&b).await.unwrap();

        let loaded = store.load(&a.id).await.unwrap().unwrap();
        assert_eq!(loaded.key, "leave");
        assert_eq!(loaded.meta_info["revision"], 1);
        assert!(!loaded.has_source());

        let all = store.list().await.unwrap();
        assert_eq!(all.len(), 2);
        assert!(store.load("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_duplicate_key_rejected() {
        let store = MemoryModelStore::new();
        store
            .create(&ProcessModel::new("A", "leave", ""))
            .await
            .unwrap();
        let err = store
            .create(&ProcessModel::new("B", "leave", ""))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("already in use"));
    }

    #[tokio::test]
    async fn test_save_source_bumps_revision_and_keeps_pointer() {
        let store = MemoryModelStore::new();
        let m = ProcessModel::new("Leave", "leave", "");
        store.create(&m).await.unwrap();
        assert!(store
            .set_deployment(&m.id, Some("dep-1".into()))
            .await
            .unwrap());

        let saved = store
            .save_source(&m.id, b"{}".to_vec())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(saved.revision, 2);
        assert_eq!(saved.meta_info["revision"], 2);
        assert_eq!(saved.deployment_id.as_deref(), Some("dep-1"));

        assert!(store.save_source("missing", vec![]).await.unwrap().is_none());
        assert!(!store.set_deployment("missing", None).await.unwrap());
    }
}
