use crate::flow::FlowInstance;
use async_trait::async_trait;
use opsmesh_core::OpsMeshResult;
use std::path::PathBuf;
use uuid::Uuid;

/// Durable copy of flow instances, written after every transition.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn save(&self, instance: &FlowInstance) -> OpsMeshResult<()>;
    async fn load(&self, instance_id: Uuid) -> OpsMeshResult<Option<FlowInstance>>;
    async fn remove(&self, instance_id: Uuid) -> OpsMeshResult<()>;
    async fn list(&self) -> OpsMeshResult<Vec<Uuid>>;
}

/// Keeps nothing. Instances live only in the orchestrator's memory.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopCheckpointStore;

#[async_trait]
impl CheckpointStore for NoopCheckpointStore {
    async fn save(&self, _instance: &FlowInstance) -> OpsMeshResult<()> {
        Ok(())
    }

    async fn load(&self, _instance_id: Uuid) -> OpsMeshResult<Option<FlowInstance>> {
        Ok(None)
    }

    async fn remove(&self, _instance_id: Uuid) -> OpsMeshResult<()> {
        Ok(())
    }

    async fn list(&self) -> OpsMeshResult<Vec<Uuid>> {
        Ok(Vec::new())
    }
}

/// One pretty-printed JSON file per instance.
pub struct FileCheckpointStore {
    dir: PathBuf,
}

impl FileCheckpointStore {
    pub async fn new(dir: PathBuf) -> OpsMeshResult<Self> {
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    fn instance_path(&self, id: Uuid) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn save(&self, instance: &FlowInstance) -> OpsMeshResult<()> {
        let path = self.instance_path(instance.instance_id);
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(instance)?;
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(tmp, path).await?;
        Ok(())
    }

    async fn load(&self, instance_id: Uuid) -> OpsMeshResult<Option<FlowInstance>> {
        let path = self.instance_path(instance_id);
        if !path.exists() {
            return Ok(None);
        }
        let data = tokio::fs::read_to_string(path).await?;
        let instance: FlowInstance = serde_json::from_str(&data)?;
        Ok(Some(instance))
    }

    async fn remove(&self, instance_id: Uuid) -> OpsMeshResult<()> {
        let path = self.instance_path(instance_id);
        if path.exists() {
            tokio::fs::remove_file(path).await?;
        }
        Ok(())
    }

    async fn list(&self) -> OpsMeshResult<Vec<Uuid>> {
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        let mut ids = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if let Some(stem) = entry
                .file_name()
                .to_str()
                .and_then(|name| name.strip_suffix(".json"))
            {
                if let Ok(id) = Uuid::parse_str(stem) {
                    ids.push(id);
                }
            }
        }
        ids.sort();
        Ok(ids)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::flow::FlowStatus;
    use opsmesh_core::Payload;

    #[tokio::test]
    async fn test_file_store_roundtrip_and_list() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path().join("checkpoints"))
            .await
            .unwrap();

        let mut instance = FlowInstance::new("appointment_checkin_v1", Payload::new());
        instance.status = FlowStatus::Active;
        instance.record_result("verify_appointment", "frontdesk", Payload::new());
        store.save(&instance).await.unwrap();

        let loaded = store.load(instance.instance_id).await.unwrap().unwrap();
        assert_eq!(loaded, instance);
        assert_eq!(store.list().await.unwrap(), vec![instance.instance_id]);

        store.remove(instance.instance_id).await.unwrap();
        assert!(store.load(instance.instance_id).await.unwrap().is_none());
        assert!(store.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_corrupt_checkpoint_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path().to_path_buf()).await.unwrap();
        let id = Uuid::new_v4();
        tokio::fs::write(dir.path().join(format!("{id}.json")), "{oops")
            .await
            .unwrap();
        assert!(matches!(
            store.load(id).await,
            Err(opsmesh_core::OpsMeshError::Json(_))
        ));
    }

    #[tokio::test]
    async fn test_noop_store_keeps_nothing() {
        let store = NoopCheckpointStore;
        let instance = FlowInstance::new("f", Payload::new());
        store.save(&instance).await.unwrap();
        assert!(store.load(instance.instance_id).await.unwrap().is_none());
    }
}
