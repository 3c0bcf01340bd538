// Authored deployment plan steps, parsed from the simplified plan syntax

use crate::error::PlanValidationError;
use serde_json::{Map, Value};

pub const NAME_KEY: &str = "Name";
pub const TYPE_KEY: &str = "Type";
pub const NEXT_KEY: &str = "Next";
pub const END_KEY: &str = "End";
pub const IS_TRUE_KEY: &str = "IsTrue";
pub const IS_FALSE_KEY: &str = "IsFalse";
pub const CONDITION_KEY: &str = "Condition";
pub const BRANCHES_KEY: &str = "Branches";

pub const CHOICE_TYPE: &str = "Choice";
pub const PARALLEL_TYPE: &str = "Parallel";

const CHOICE_ALLOWED_KEYS: [&str; 5] = [NAME_KEY, TYPE_KEY, IS_TRUE_KEY, IS_FALSE_KEY, CONDITION_KEY];

/// One user-declared step of a deployment plan
#[derive(Debug, Clone, PartialEq)]
pub struct AuthoredStep {
    pub name: String,
    pub kind: StepKind,
}

/// Structural shape of an authored step
#[derive(Debug, Clone, PartialEq)]
pub enum StepKind {
    /// Any action step; `fields` holds everything except `Name`, including `Type`
    Task { fields: Map<String, Value> },
    Choice {
        condition: Map<String, Value>,
        is_true: Vec<AuthoredStep>,
        is_false: Option<Vec<AuthoredStep>>,
    },
    /// `fields` holds the non-structural extras (e.g. `ResultPath`)
    Parallel {
        branches: Vec<Vec<AuthoredStep>>,
        fields: Map<String, Value>,
    },
}

impl AuthoredStep {
    /// A generic action step with the given `Type` and no other fields
    pub fn task(name: impl Into<String>, step_type: impl Into<String>) -> Self {
        let mut fields = Map::new();
        fields.insert(TYPE_KEY.to_string(), Value::String(step_type.into()));
        Self {
            name: name.into(),
            kind: StepKind::Task { fields },
        }
    }

    pub fn step_type(&self) -> Option<&str> {
        match &self.kind {
            StepKind::Task { fields } => fields.get(TYPE_KEY).and_then(Value::as_str),
            StepKind::Choice { .. } => Some(CHOICE_TYPE),
            StepKind::Parallel { .. } => Some(PARALLEL_TYPE),
        }
    }
}

/// An ordered, non-empty list of authored steps
#[derive(Debug, Clone, PartialEq)]
pub struct AuthoredPlan {
    steps: Vec<AuthoredStep>,
}

impl AuthoredPlan {
    pub fn new(steps: Vec<AuthoredStep>) -> Result<Self, PlanValidationError> {
        if steps.is_empty() {
            return Err(PlanValidationError::EmptyPlan);
        }
        Ok(Self { steps })
    }

    pub fn steps(&self) -> &[AuthoredStep] {
        &self.steps
    }

    pub fn from_yaml_str(source: &str) -> Result<Self, PlanValidationError> {
        let value: Value = serde_yaml::from_str(source)
            .map_err(|e| PlanValidationError::Parse(e.to_string()))?;
        Self::from_value(&value)
    }

    pub fn from_json_str(source: &str) -> Result<Self, PlanValidationError> {
        let value: Value =
            serde_json::from_str(source).map_err(|e| PlanValidationError::Parse(e.to_string()))?;
        Self::from_value(&value)
    }

    /// Parse the plan from its step array
    pub fn from_value(value: &Value) -> Result<Self, PlanValidationError> {
        let Value::Array(items) = value else {
            return Err(PlanValidationError::Parse(
                "a deployment plan must be a list of steps".to_string(),
            ));
        };
        if items.is_empty() {
            return Err(PlanValidationError::EmptyPlan);
        }
        let steps = parse_list(items, None)?;
        Ok(Self { steps })
    }
}

/// Where a step list lives, for error messages
type Owner<'a> = Option<(&'a str, &'static str)>;

fn parse_list(items: &[Value], owner: Owner<'_>) -> Result<Vec<AuthoredStep>, PlanValidationError> {
    let mut steps: Vec<AuthoredStep> = Vec::with_capacity(items.len());
    for item in items {
        let location = match (steps.last(), owner) {
            (Some(previous), _) => format!("the step following {}", previous.name),
            (None, Some((step, field))) => {
                format!("the first step of \"{}\" in step {}", field, step)
            }
            (None, None) => "the first step".to_string(),
        };
        steps.push(parse_step(item, location)?);
    }
    Ok(steps)
}

fn parse_nested_list(
    value: &Value,
    step: &str,
    field: &'static str,
) -> Result<Vec<AuthoredStep>, PlanValidationError> {
    let Value::Array(items) = value else {
        return Err(PlanValidationError::NotAnArray {
            step: step.to_string(),
            field,
        });
    };
    if items.is_empty() {
        return Err(PlanValidationError::EmptyBranch {
            step: step.to_string(),
            field,
        });
    }
    parse_list(items, Some((step, field)))
}

fn parse_step(value: &Value, location: String) -> Result<AuthoredStep, PlanValidationError> {
    let Value::Object(object) = value else {
        return Err(PlanValidationError::StepNotAnObject(value.to_string()));
    };

    let name = match object.get(NAME_KEY) {
        None => return Err(PlanValidationError::MissingName { location }),
        Some(Value::String(name)) => name.clone(),
        Some(_) => return Err(PlanValidationError::NameNotString { location }),
    };

    if object.contains_key(NEXT_KEY) || object.contains_key(END_KEY) {
        return Err(PlanValidationError::ForbiddenTransition(name));
    }

    let kind = match object.get(TYPE_KEY).and_then(Value::as_str) {
        Some(CHOICE_TYPE) => parse_choice(&name, object)?,
        Some(PARALLEL_TYPE) => parse_parallel(&name, object)?,
        _ => {
            let mut fields = object.clone();
            fields.remove(NAME_KEY);
            StepKind::Task { fields }
        }
    };

    Ok(AuthoredStep { name, kind })
}

fn parse_choice(name: &str, object: &Map<String, Value>) -> Result<StepKind, PlanValidationError> {
    if let Some(key) = object
        .keys()
        .find(|key| !CHOICE_ALLOWED_KEYS.contains(&key.as_str()))
    {
        return Err(PlanValidationError::DisallowedChoiceKey {
            step: name.to_string(),
            key: key.clone(),
            allowed: CHOICE_ALLOWED_KEYS.join(","),
        });
    }

    let condition = match object.get(CONDITION_KEY) {
        None => {
            return Err(PlanValidationError::MissingField {
                step: name.to_string(),
                field: CONDITION_KEY,
            })
        }
        Some(Value::Object(condition)) => condition.clone(),
        Some(_) => {
            return Err(PlanValidationError::NotAnObject {
                step: name.to_string(),
                field: CONDITION_KEY,
            })
        }
    };

    let is_true = object
        .get(IS_TRUE_KEY)
        .ok_or_else(|| PlanValidationError::MissingField {
            step: name.to_string(),
            field: IS_TRUE_KEY,
        })?;
    let is_true = parse_nested_list(is_true, name, IS_TRUE_KEY)?;

    let is_false = object
        .get(IS_FALSE_KEY)
        .map(|branch| parse_nested_list(branch, name, IS_FALSE_KEY))
        .transpose()?;

    Ok(StepKind::Choice {
        condition,
        is_true,
        is_false,
    })
}

fn parse_parallel(name: &str, object: &Map<String, Value>) -> Result<StepKind, PlanValidationError> {
    let branches = match object.get(BRANCHES_KEY) {
        None => {
            return Err(PlanValidationError::MissingField {
                step: name.to_string(),
                field: BRANCHES_KEY,
            })
        }
        Some(Value::Array(branches)) if branches.is_empty() => {
            return Err(PlanValidationError::EmptyBranch {
                step: name.to_string(),
                field: BRANCHES_KEY,
            })
        }
        Some(Value::Array(branches)) => branches
            .iter()
            .map(|branch| parse_nested_list(branch, name, BRANCHES_KEY))
            .collect::<Result<Vec<_>, _>>()?,
        Some(_) => {
            return Err(PlanValidationError::NotAnArray {
                step: name.to_string(),
                field: BRANCHES_KEY,
            })
        }
    };

    let fields = object
        .iter()
        .filter(|(key, _)| ![NAME_KEY, TYPE_KEY, BRANCHES_KEY].contains(&key.as_str()))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();

    Ok(StepKind::Parallel { branches, fields })
}
