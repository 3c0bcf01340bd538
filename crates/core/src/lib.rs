// Core library: deployment plan compiler and execution coordinator

pub mod control;
pub mod coordinator;
pub mod error;
pub mod plan;
pub mod retry;
pub mod storage;
pub mod types;

pub use coordinator::{
    CoordinatorConfig, ExecutionCoordinator, ExecutionPhase, TriggerEvent, TriggerOutcome,
};
pub use error::{ControlError, CoordinatorError, PlanValidationError, StoreError};
pub use types::*;
