use crate::types::{DeploymentName, ExecutionId, ObjectIdentifier, RecordKey};
use thiserror::Error;

/// A deployment plan that cannot be compiled into a state graph
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlanValidationError {
    #[error("The deployment plan can not be empty")]
    EmptyPlan,

    #[error("Field \"Name\" is missing in {location}")]
    MissingName { location: String },

    #[error("Field \"Name\" in {location} is not a string")]
    NameNotString { location: String },

    #[error("Duplicated step name detected, step names must be unique. Name: {0}")]
    DuplicateName(String),

    #[error("\"Next\" and \"End\" are not allowed in a deployment plan. Step name: {0}")]
    ForbiddenTransition(String),

    #[error("Error in step {step}: key {key} is not allowed for Choice. Allowed keys are: {allowed}")]
    DisallowedChoiceKey {
        step: String,
        key: String,
        allowed: String,
    },

    #[error("Error in step {step}: no \"{field}\" field specified")]
    MissingField { step: String, field: &'static str },

    #[error("Error in step {step}: \"{field}\" should be an array")]
    NotAnArray { step: String, field: &'static str },

    #[error("Error in step {step}: \"{field}\" should be an object")]
    NotAnObject { step: String, field: &'static str },

    #[error("Error in step {step}: \"{field}\" can not be empty")]
    EmptyBranch { step: String, field: &'static str },

    #[error("Each step in a deployment plan must be an object, found {0}")]
    StepNotAnObject(String),

    #[error("State {state} references unknown state {target}")]
    DanglingReference { state: String, target: String },

    #[error("State {0} can not be reached from the start state")]
    UnreachableState(String),

    #[error("Could not parse deployment plan: {0}")]
    Parse(String),
}

/// Failures talking to the deployment record store
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Record store backend error: {0}")]
    Backend(String),

    #[error("Record store call timed out")]
    Timeout,

    #[error("Could not (de)serialize deployment record: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Deployment record {0} does not exist")]
    RecordNotFound(RecordKey),
}

impl StoreError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Backend(_) | Self::Timeout)
    }
}

macro_rules! backend_error {
    ($($source:ty),* $(,)?) => {
        $(
            impl From<$source> for StoreError {
                fn from(err: $source) -> Self {
                    Self::Backend(err.to_string())
                }
            }
        )*
    };
}

backend_error!(
    redb::DatabaseError,
    redb::TransactionError,
    redb::TableError,
    redb::StorageError,
    redb::CommitError,
);

/// Failures talking to the workflow-execution control plane
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("Workflow control plane unavailable: {0}")]
    Unavailable(String),

    #[error("Workflow control call timed out")]
    Timeout,

    #[error("Workflow control rejected the request: {0}")]
    Rejected(String),
}

impl ControlError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Timeout)
    }
}

/// Errors surfaced by the execution coordinator
#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error(
        "No deploy data found for objectIdentifier={object_identifier}, deploymentName={deployment_name}"
    )]
    NotFound {
        object_identifier: ObjectIdentifier,
        deployment_name: DeploymentName,
    },

    #[error("No deployment record of {deployment_name} references execution {execution_id}")]
    NoRecordForExecution {
        execution_id: ExecutionId,
        deployment_name: DeploymentName,
    },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Control(#[from] ControlError),
}

impl CoordinatorError {
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::NotFound { .. } | Self::NoRecordForExecution { .. } => false,
            Self::Store(e) => e.is_retryable(),
            Self::Control(e) => e.is_retryable(),
        }
    }
}

/// Errors the retry boundary knows how to classify
pub trait Retryable {
    fn is_retryable(&self) -> bool;

    /// The error to report when a single attempt exceeds its time budget
    fn timed_out() -> Self;
}

impl Retryable for StoreError {
    fn is_retryable(&self) -> bool {
        StoreError::is_retryable(self)
    }

    fn timed_out() -> Self {
        Self::Timeout
    }
}

impl Retryable for ControlError {
    fn is_retryable(&self) -> bool {
        ControlError::is_retryable(self)
    }

    fn timed_out() -> Self {
        Self::Timeout
    }
}
