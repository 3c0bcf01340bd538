// Collaborators the coordinator drives: the workflow engine and the deployment target

use crate::error::ControlError;
use crate::types::{ExecutionId, WorkflowId};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashSet};
use tokio::sync::RwLock;

/// Control plane of the workflow engine running deployment executions
#[async_trait]
pub trait WorkflowControl: Send + Sync {
    /// Executions of `workflow` that are currently running
    async fn list_running_executions(
        &self,
        workflow: &WorkflowId,
    ) -> Result<Vec<ExecutionId>, ControlError>;

    /// Request termination of a running execution
    async fn stop_execution(&self, execution: &ExecutionId, cause: &str)
        -> Result<(), ControlError>;
}

/// Reports whether a deployment target is mid-update
#[async_trait]
pub trait TargetProbe: Send + Sync {
    async fn is_busy(&self, target: &str) -> Result<bool, ControlError>;
}

/// A stop request observed by [`InMemoryWorkflowControl`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StopRequest {
    pub execution: ExecutionId,
    pub cause: String,
}

/// In-process workflow engine for tests and dry runs
#[derive(Default)]
pub struct InMemoryWorkflowControl {
    running: RwLock<BTreeMap<WorkflowId, Vec<ExecutionId>>>,
    stopped: RwLock<Vec<StopRequest>>,
    rejected: RwLock<HashSet<ExecutionId>>,
}

impl InMemoryWorkflowControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn start_execution(&self, workflow: &WorkflowId, execution: ExecutionId) {
        self.running
            .write()
            .await
            .entry(workflow.clone())
            .or_default()
            .push(execution);
    }

    /// Make every later stop request for `execution` fail
    pub async fn reject_stops_of(&self, execution: ExecutionId) {
        self.rejected.write().await.insert(execution);
    }

    pub async fn stop_requests(&self) -> Vec<StopRequest> {
        self.stopped.read().await.clone()
    }

    pub async fn is_running(&self, execution: &ExecutionId) -> bool {
        self.running
            .read()
            .await
            .values()
            .any(|executions| executions.contains(execution))
    }
}

#[async_trait]
impl WorkflowControl for InMemoryWorkflowControl {
    async fn list_running_executions(
        &self,
        workflow: &WorkflowId,
    ) -> Result<Vec<ExecutionId>, ControlError> {
        Ok(self
            .running
            .read()
            .await
            .get(workflow)
            .cloned()
            .unwrap_or_default())
    }

    async fn stop_execution(
        &self,
        execution: &ExecutionId,
        cause: &str,
    ) -> Result<(), ControlError> {
        if self.rejected.read().await.contains(execution) {
            return Err(ControlError::Rejected(format!(
                "Execution {} can not be stopped",
                execution
            )));
        }

        let mut running = self.running.write().await;
        let mut found = false;
        for executions in running.values_mut() {
            let before = executions.len();
            executions.retain(|e| e != execution);
            found |= executions.len() != before;
        }
        if !found {
            return Err(ControlError::Rejected(format!(
                "Execution does not exist or is not running: {}",
                execution
            )));
        }

        self.stopped.write().await.push(StopRequest {
            execution: execution.clone(),
            cause: cause.to_string(),
        });
        Ok(())
    }
}

/// In-process target probe with a settable busy set
#[derive(Default)]
pub struct InMemoryTargetProbe {
    busy: RwLock<HashSet<String>>,
}

impl InMemoryTargetProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_busy(&self, target: impl Into<String>, busy: bool) {
        let target = target.into();
        let mut targets = self.busy.write().await;
        if busy {
            targets.insert(target);
        } else {
            targets.remove(&target);
        }
    }
}

#[async_trait]
impl TargetProbe for InMemoryTargetProbe {
    async fn is_busy(&self, target: &str) -> Result<bool, ControlError> {
        Ok(self.busy.read().await.contains(target))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_stop_removes_running_execution() {
        let control = InMemoryWorkflowControl::new();
        let workflow = WorkflowId::new("deploy-sm");
        control
            .start_execution(&workflow, ExecutionId::new("e1"))
            .await;
        control
            .start_execution(&workflow, ExecutionId::new("e2"))
            .await;

        control
            .stop_execution(&ExecutionId::new("e1"), "superseded")
            .await
            .unwrap();

        assert_eq!(
            control.list_running_executions(&workflow).await.unwrap(),
            vec![ExecutionId::new("e2")]
        );
        assert_eq!(
            control.stop_requests().await,
            vec![StopRequest {
                execution: ExecutionId::new("e1"),
                cause: "superseded".to_string(),
            }]
        );
    }

    #[tokio::test]
    async fn test_stop_unknown_execution_rejected() {
        let control = InMemoryWorkflowControl::new();
        let err = control
            .stop_execution(&ExecutionId::new("ghost"), "cause")
            .await
            .unwrap_err();
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_probe_busy_toggle() {
        let probe = InMemoryTargetProbe::new();
        assert!(!probe.is_busy("app-stack").await.unwrap());
        probe.set_busy("app-stack", true).await;
        assert!(probe.is_busy("app-stack").await.unwrap());
        probe.set_busy("app-stack", false).await;
        assert!(!probe.is_busy("app-stack").await.unwrap());
    }
}
