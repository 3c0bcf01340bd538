use crate::error::StoreError;
use crate::types::{
    AttemptKey, DeploymentName, DeploymentRecord, ExecutionId, ObjectIdentifier, RecordKey,
};
use async_trait::async_trait;

/// Targeted attribute update of one deployment record
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordUpdate {
    /// Set `executionArns[attempt_key]`, other attempts are left alone
    SetExecutionArn {
        attempt_key: AttemptKey,
        execution_id: ExecutionId,
    },
    SetError { message: String, code: String },
    SetPlanStatus(String),
}

impl RecordUpdate {
    pub fn apply(&self, record: &mut DeploymentRecord) {
        match self {
            Self::SetExecutionArn {
                attempt_key,
                execution_id,
            } => {
                record
                    .execution_arns
                    .insert(attempt_key.clone(), execution_id.clone());
            }
            Self::SetError { message, code } => {
                record.error_message = Some(message.clone());
                record.error_code = Some(code.clone());
            }
            Self::SetPlanStatus(status) => {
                record.deployment_plan_status = Some(status.clone());
            }
        }
    }
}

/// Keyed store of deployment records with a secondary index on
/// `(object_identifier, deployment_name)`.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Insert or replace a record
    async fn put_record(&self, record: &DeploymentRecord) -> Result<(), StoreError>;

    /// Every record of `deployment` built from `object`, template rows included
    async fn query_by_object(
        &self,
        object: &ObjectIdentifier,
        deployment: &DeploymentName,
    ) -> Result<Vec<DeploymentRecord>, StoreError>;

    /// Newest `limit` records of `deployment`, read with strong consistency
    async fn latest_records(
        &self,
        deployment: &DeploymentName,
        limit: usize,
    ) -> Result<Vec<DeploymentRecord>, StoreError>;

    /// Apply `update` to the record at `key`; fails with `RecordNotFound` if absent
    async fn update_record(&self, key: &RecordKey, update: RecordUpdate)
        -> Result<(), StoreError>;

    /// Every record of `deployment`, oldest first
    async fn query_by_deployment(
        &self,
        deployment: &DeploymentName,
    ) -> Result<Vec<DeploymentRecord>, StoreError>;
}
