// Execution coordinator: at most one live deployment execution per target

use crate::control::{TargetProbe, WorkflowControl};
use crate::error::CoordinatorError;
use crate::retry::{retry_transient, RetryConfig};
use crate::storage::{RecordStore, RecordUpdate};
use crate::types::{
    AttemptKey, DeploymentName, DeploymentRecord, ExecutionId, ObjectIdentifier, RecordKey,
    WorkflowId,
};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Cause attached to executions stopped because a newer one started
pub const SUPERSEDED_CAUSE: &str = "Stopped due to new execution started";

/// Cause attached to an execution that stops itself because its target is mid-update
pub const TARGET_BUSY_CAUSE: &str = "Stopped due to new stack update in progress";

/// How many of a deployment's newest attempts are checked during admission
pub const LATEST_ATTEMPTS_WINDOW: usize = 5;

#[derive(Debug, Clone, PartialEq)]
pub struct CoordinatorConfig {
    pub latest_attempts_window: usize,
    pub retry: RetryConfig,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            latest_attempts_window: LATEST_ATTEMPTS_WINDOW,
            retry: RetryConfig::default(),
        }
    }
}

/// Lifecycle of one trigger event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionPhase {
    Received,
    AdmissionChecked,
    /// Assigned to peers stopped during admission of a newer execution
    Superseded,
    RegisteredAndContinuing,
    TargetBusyChecked,
    SelfAborted,
    Proceeding,
}

impl ExecutionPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Superseded | Self::SelfAborted | Self::Proceeding)
    }
}

impl std::fmt::Display for ExecutionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Received => "received",
            Self::AdmissionChecked => "admission_checked",
            Self::Superseded => "superseded",
            Self::RegisteredAndContinuing => "registered_and_continuing",
            Self::TargetBusyChecked => "target_busy_checked",
            Self::SelfAborted => "self_aborted",
            Self::Proceeding => "proceeding",
        };
        write!(f, "{}", name)
    }
}

/// Start of a deployment workflow execution
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerEvent {
    pub execution: ExecutionId,
    pub workflow: WorkflowId,
    pub object_identifier: ObjectIdentifier,
    pub deployment_name: DeploymentName,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TriggerOutcome {
    /// The deploy attempt this execution belongs to
    pub record: RecordKey,
    /// Peer executions stopped as superseded
    pub superseded: Vec<ExecutionId>,
    /// `SelfAborted` or `Proceeding`
    pub phase: ExecutionPhase,
    /// Every phase this execution passed through, in order
    pub history: Vec<ExecutionPhase>,
}

impl TriggerOutcome {
    pub fn proceeds(&self) -> bool {
        self.phase == ExecutionPhase::Proceeding
    }
}

/// Tracks the phase of one trigger event
struct PhaseTracker<'a> {
    execution: &'a ExecutionId,
    history: Vec<ExecutionPhase>,
}

impl<'a> PhaseTracker<'a> {
    fn new(execution: &'a ExecutionId) -> Self {
        debug!("Execution {} entered phase {}", execution, ExecutionPhase::Received);
        Self {
            execution,
            history: vec![ExecutionPhase::Received],
        }
    }

    fn advance(&mut self, phase: ExecutionPhase) {
        debug!("Execution {} entered phase {}", self.execution, phase);
        self.history.push(phase);
    }
}

/// Coordinates concurrent executions that deploy the same target.
///
/// Holds no per-event state; one instance can serve any number of concurrent
/// trigger events.
pub struct ExecutionCoordinator {
    store: Arc<dyn RecordStore>,
    control: Arc<dyn WorkflowControl>,
    probe: Arc<dyn TargetProbe>,
    config: CoordinatorConfig,
}

impl ExecutionCoordinator {
    pub fn new(
        store: Arc<dyn RecordStore>,
        control: Arc<dyn WorkflowControl>,
        probe: Arc<dyn TargetProbe>,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            store,
            control,
            probe,
            config,
        }
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    async fn records_of_object(
        &self,
        object: &ObjectIdentifier,
        deployment: &DeploymentName,
    ) -> Result<Vec<DeploymentRecord>, CoordinatorError> {
        let records = retry_transient(&self.config.retry, "query_by_object", || {
            self.store.query_by_object(object, deployment)
        })
        .await?;
        Ok(records)
    }

    /// Apply `update` to every record of `(object, deployment)`; returns how many were updated
    async fn fan_out(
        &self,
        object: &ObjectIdentifier,
        deployment: &DeploymentName,
        update: RecordUpdate,
    ) -> Result<usize, CoordinatorError> {
        let records = self.records_of_object(object, deployment).await?;
        for record in &records {
            let key = record.key();
            retry_transient(&self.config.retry, "update_record", || {
                self.store.update_record(&key, update.clone())
            })
            .await?;
        }
        Ok(records.len())
    }

    /// Find the deploy attempt of `(object, deployment)`, ignoring template rows.
    ///
    /// When several attempts match, the first one in index order is returned.
    pub async fn lookup_deployment_record(
        &self,
        object: &ObjectIdentifier,
        deployment: &DeploymentName,
    ) -> Result<DeploymentRecord, CoordinatorError> {
        self.records_of_object(object, deployment)
            .await?
            .into_iter()
            .find(|record| !record.is_template())
            .ok_or_else(|| CoordinatorError::NotFound {
                object_identifier: object.clone(),
                deployment_name: deployment.clone(),
            })
    }

    /// Stop running executions of `workflow` that belong to `deployment`'s recent attempts.
    ///
    /// Executions of other deployment targets sharing the workflow are never
    /// touched. Stop failures are logged and skipped; the returned list holds
    /// the executions that were stopped.
    pub async fn admit_execution(
        &self,
        current: &ExecutionId,
        workflow: &WorkflowId,
        deployment: &DeploymentName,
    ) -> Result<Vec<ExecutionId>, CoordinatorError> {
        let others: Vec<ExecutionId> =
            retry_transient(&self.config.retry, "list_running_executions", || {
                self.control.list_running_executions(workflow)
            })
            .await?
            .into_iter()
            .filter(|execution| execution != current)
            .collect();

        if others.is_empty() {
            debug!("No other running executions of {}", workflow);
            return Ok(Vec::new());
        }

        let window = self.config.latest_attempts_window;
        let latest = retry_transient(&self.config.retry, "latest_records", || {
            self.store.latest_records(deployment, window)
        })
        .await?;
        let recorded: HashSet<&ExecutionId> = latest
            .iter()
            .flat_map(|record| record.execution_arns.values())
            .collect();

        let mut stopped = Vec::new();
        for execution in others.iter().filter(|e| recorded.contains(e)) {
            info!(
                "Stopping execution {} of {}: superseded by {}",
                execution, deployment, current
            );
            match self.control.stop_execution(execution, SUPERSEDED_CAUSE).await {
                Ok(()) => stopped.push(execution.clone()),
                Err(e) => warn!("Failed to stop superseded execution {}: {}", execution, e),
            }
        }
        Ok(stopped)
    }

    /// Record `execution` on every attempt of `(object, deployment)`
    pub async fn register_execution(
        &self,
        execution: &ExecutionId,
        object: &ObjectIdentifier,
        deployment: &DeploymentName,
    ) -> Result<usize, CoordinatorError> {
        let attempt_key = AttemptKey::from_execution(execution);
        let updated = self
            .fan_out(
                object,
                deployment,
                RecordUpdate::SetExecutionArn {
                    attempt_key: attempt_key.clone(),
                    execution_id: execution.clone(),
                },
            )
            .await?;

        info!(
            "Registered execution {} (attempt {}) on {} record(s) of {}",
            execution, attempt_key, updated, deployment
        );
        Ok(updated)
    }

    /// Record a deployment failure on every attempt of `(object, deployment)`
    pub async fn record_error(
        &self,
        deployment: &DeploymentName,
        object: &ObjectIdentifier,
        message: &str,
        code: &str,
    ) -> Result<usize, CoordinatorError> {
        let updated = self
            .fan_out(
                object,
                deployment,
                RecordUpdate::SetError {
                    message: message.to_string(),
                    code: code.to_string(),
                },
            )
            .await?;

        warn!(
            "Recorded error {} on {} record(s) of {}: {}",
            code, updated, deployment, message
        );
        Ok(updated)
    }

    /// Record the deployment plan status on every attempt of `(object, deployment)`
    pub async fn record_plan_status(
        &self,
        deployment: &DeploymentName,
        object: &ObjectIdentifier,
        status: &str,
    ) -> Result<usize, CoordinatorError> {
        let updated = self
            .fan_out(
                object,
                deployment,
                RecordUpdate::SetPlanStatus(status.to_string()),
            )
            .await?;

        info!(
            "Deployment plan status of {} set to {} on {} record(s)",
            deployment, status, updated
        );
        Ok(updated)
    }

    /// Resolve the deploy attempt an execution was registered on
    pub async fn find_record_by_execution(
        &self,
        execution: &ExecutionId,
        deployment: &DeploymentName,
    ) -> Result<DeploymentRecord, CoordinatorError> {
        retry_transient(&self.config.retry, "query_by_deployment", || {
            self.store.query_by_deployment(deployment)
        })
        .await?
        .into_iter()
        .find(|record| record.records_execution(execution))
        .ok_or_else(|| CoordinatorError::NoRecordForExecution {
            execution_id: execution.clone(),
            deployment_name: deployment.clone(),
        })
    }

    /// Stop `current` if `target` is mid-update.
    ///
    /// Returns `SelfAborted` when the target is busy, `Proceeding` otherwise.
    /// A failing stop request is logged; the execution still counts as aborted.
    pub async fn abort_if_target_busy(
        &self,
        target: &str,
        current: &ExecutionId,
    ) -> Result<ExecutionPhase, CoordinatorError> {
        let busy = retry_transient(&self.config.retry, "is_busy", || {
            self.probe.is_busy(target)
        })
        .await?;

        if !busy {
            return Ok(ExecutionPhase::Proceeding);
        }

        info!(
            "Target {} is being updated, stopping execution {}",
            target, current
        );
        if let Err(e) = self.control.stop_execution(current, TARGET_BUSY_CAUSE).await {
            warn!("Failed to stop execution {}: {}", current, e);
        }
        Ok(ExecutionPhase::SelfAborted)
    }

    /// Run the full admission sequence for one trigger event
    pub async fn handle_trigger(
        &self,
        event: &TriggerEvent,
    ) -> Result<TriggerOutcome, CoordinatorError> {
        let mut tracker = PhaseTracker::new(&event.execution);

        let record = self
            .lookup_deployment_record(&event.object_identifier, &event.deployment_name)
            .await?;

        let superseded = self
            .admit_execution(&event.execution, &event.workflow, &event.deployment_name)
            .await?;
        for execution in &superseded {
            debug!("Execution {} entered phase {}", execution, ExecutionPhase::Superseded);
        }
        tracker.advance(ExecutionPhase::AdmissionChecked);

        self.register_execution(
            &event.execution,
            &event.object_identifier,
            &event.deployment_name,
        )
        .await?;
        tracker.advance(ExecutionPhase::RegisteredAndContinuing);

        let phase = self
            .abort_if_target_busy(&record.stack_name, &event.execution)
            .await?;
        tracker.advance(ExecutionPhase::TargetBusyChecked);
        tracker.advance(phase);

        info!(
            "Execution {} of {} finished admission: {}",
            event.execution, event.deployment_name, phase
        );
        Ok(TriggerOutcome {
            record: record.key(),
            superseded,
            phase,
            history: tracker.history,
        })
    }
}
