// Deployment plan model and compiler

pub mod analysis;
pub mod compiler;
pub mod state;
pub mod step;

pub use compiler::{compile, CompilerOptions, PlanCompiler, DEFAULT_MERGE_TYPE};
pub use state::{ChoiceRule, CompiledState, StateGraph, StateKind, Transition};
pub use step::{AuthoredPlan, AuthoredStep, StepKind};
