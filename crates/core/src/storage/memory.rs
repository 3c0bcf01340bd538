use super::records::{RecordStore, RecordUpdate};
use crate::error::StoreError;
use crate::types::{DeploymentName, DeploymentRecord, ObjectIdentifier, RecordKey};
use async_trait::async_trait;
use std::collections::BTreeMap;
use tokio::sync::RwLock;

/// Process-local record store, ordered by `(deployment_name, deploy_time)`
#[derive(Default)]
pub struct InMemoryRecordStore {
    records: RwLock<BTreeMap<RecordKey, DeploymentRecord>>,
}

impl InMemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_records(records: impl IntoIterator<Item = DeploymentRecord>) -> Self {
        Self {
            records: RwLock::new(
                records
                    .into_iter()
                    .map(|record| (record.key(), record))
                    .collect(),
            ),
        }
    }

    pub async fn get(&self, key: &RecordKey) -> Option<DeploymentRecord> {
        self.records.read().await.get(key).cloned()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

#[async_trait]
impl RecordStore for InMemoryRecordStore {
    async fn put_record(&self, record: &DeploymentRecord) -> Result<(), StoreError> {
        self.records
            .write()
            .await
            .insert(record.key(), record.clone());
        Ok(())
    }

    async fn query_by_object(
        &self,
        object: &ObjectIdentifier,
        deployment: &DeploymentName,
    ) -> Result<Vec<DeploymentRecord>, StoreError> {
        Ok(self
            .records
            .read()
            .await
            .values()
            .filter(|r| &r.deployment_name == deployment && &r.object_identifier == object)
            .cloned()
            .collect())
    }

    async fn latest_records(
        &self,
        deployment: &DeploymentName,
        limit: usize,
    ) -> Result<Vec<DeploymentRecord>, StoreError> {
        Ok(self
            .records
            .read()
            .await
            .values()
            .rev()
            .filter(|r| &r.deployment_name == deployment)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn update_record(
        &self,
        key: &RecordKey,
        update: RecordUpdate,
    ) -> Result<(), StoreError> {
        let mut records = self.records.write().await;
        let record = records
            .get_mut(key)
            .ok_or_else(|| StoreError::RecordNotFound(key.clone()))?;
        update.apply(record);
        Ok(())
    }

    async fn query_by_deployment(
        &self,
        deployment: &DeploymentName,
    ) -> Result<Vec<DeploymentRecord>, StoreError> {
        Ok(self
            .records
            .read()
            .await
            .values()
            .filter(|r| &r.deployment_name == deployment)
            .cloned()
            .collect())
    }
}
