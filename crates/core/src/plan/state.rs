// Compiled state graph in the workflow engine's state-machine format

use super::step::{END_KEY, NEXT_KEY, TYPE_KEY};
use serde::ser::{SerializeMap, SerializeSeq};
use serde::{Serialize, Serializer};
use serde_json::{Map, Value};

pub const START_AT_KEY: &str = "StartAt";
pub const STATES_KEY: &str = "States";
pub const CHOICES_KEY: &str = "Choices";
pub const DEFAULT_KEY: &str = "Default";
pub const PASS_TYPE: &str = "Pass";

/// Where control goes after a state finishes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    Next(String),
    End,
}

/// One rule of a Choice state: the authored condition plus its target
#[derive(Debug, Clone, PartialEq)]
pub struct ChoiceRule {
    pub condition: Map<String, Value>,
    pub next: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StateKind {
    /// Authored action state; fields are emitted as written
    Task { fields: Map<String, Value> },
    Choice {
        rules: Vec<ChoiceRule>,
        default: String,
    },
    Parallel {
        branches: Vec<StateGraph>,
        fields: Map<String, Value>,
    },
    /// Synthetic join after a Parallel state
    Merge { merge_type: String },
    /// Synthetic terminal state
    Pass,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompiledState {
    pub name: String,
    pub kind: StateKind,
    /// `None` only for Choice states, which route through rules and `Default`
    pub transition: Option<Transition>,
}

impl CompiledState {
    pub fn is_synthetic(&self) -> bool {
        matches!(self.kind, StateKind::Merge { .. } | StateKind::Pass)
    }

    /// Names of every state this state can hand control to
    pub fn targets(&self) -> Vec<&str> {
        let mut targets = Vec::new();
        if let StateKind::Choice { rules, default } = &self.kind {
            targets.extend(rules.iter().map(|rule| rule.next.as_str()));
            targets.push(default.as_str());
        }
        if let Some(Transition::Next(next)) = &self.transition {
            targets.push(next.as_str());
        }
        targets
    }

    pub fn is_end(&self) -> bool {
        self.transition == Some(Transition::End)
    }

    pub fn type_tag(&self) -> Option<&str> {
        match &self.kind {
            StateKind::Task { fields } => fields.get(TYPE_KEY).and_then(Value::as_str),
            StateKind::Choice { .. } => Some("Choice"),
            StateKind::Parallel { .. } => Some("Parallel"),
            StateKind::Merge { merge_type } => Some(merge_type.as_str()),
            StateKind::Pass => Some(PASS_TYPE),
        }
    }
}

/// A fully linked state machine: a start state plus states in compile order
#[derive(Debug, Clone, PartialEq)]
pub struct StateGraph {
    pub start_at: String,
    pub states: Vec<CompiledState>,
}

impl StateGraph {
    pub fn get(&self, name: &str) -> Option<&CompiledState> {
        self.states.iter().find(|state| state.name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    /// Every state name in this graph and all nested Parallel branches
    pub fn state_names(&self) -> Vec<&str> {
        let mut names = Vec::new();
        for state in &self.states {
            names.push(state.name.as_str());
            if let StateKind::Parallel { branches, .. } = &state.kind {
                for branch in branches {
                    names.extend(branch.state_names());
                }
            }
        }
        names
    }

    /// `(state, target)` pairs whose target does not exist in the state's own scope.
    /// A missing `StartAt` is reported with the pseudo-state `"StartAt"`.
    pub fn dangling_references(&self) -> Vec<(String, String)> {
        let mut dangling = Vec::new();
        if !self.contains(&self.start_at) {
            dangling.push((START_AT_KEY.to_string(), self.start_at.clone()));
        }
        for state in &self.states {
            for target in state.targets() {
                if !self.contains(target) {
                    dangling.push((state.name.clone(), target.to_string()));
                }
            }
            if let StateKind::Parallel { branches, .. } = &state.kind {
                for branch in branches {
                    dangling.extend(branch.dangling_references());
                }
            }
        }
        dangling
    }

    /// Render the graph in the engine's JSON format
    pub fn to_json(&self) -> Value {
        // Serializing our own types into a Value cannot fail
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    pub fn to_json_pretty(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

impl Serialize for StateGraph {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(2))?;
        map.serialize_entry(START_AT_KEY, &self.start_at)?;
        map.serialize_entry(STATES_KEY, &StatesMap(&self.states))?;
        map.end()
    }
}

struct StatesMap<'a>(&'a [CompiledState]);

impl Serialize for StatesMap<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for state in self.0 {
            map.serialize_entry(&state.name, state)?;
        }
        map.end()
    }
}

struct Rules<'a>(&'a [ChoiceRule]);

impl Serialize for Rules<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(self.0.len()))?;
        for rule in self.0 {
            seq.serialize_element(&RuleBody(rule))?;
        }
        seq.end()
    }
}

struct RuleBody<'a>(&'a ChoiceRule);

impl Serialize for RuleBody<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let rule = self.0;
        let mut map = serializer.serialize_map(Some(rule.condition.len() + 1))?;
        for (key, value) in &rule.condition {
            if key != NEXT_KEY {
                map.serialize_entry(key, value)?;
            }
        }
        map.serialize_entry(NEXT_KEY, &rule.next)?;
        map.end()
    }
}

/// The state body, without its name
impl Serialize for CompiledState {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(None)?;
        match &self.kind {
            StateKind::Task { fields } => {
                for (key, value) in fields {
                    map.serialize_entry(key, value)?;
                }
            }
            StateKind::Choice { rules, default } => {
                map.serialize_entry(TYPE_KEY, "Choice")?;
                map.serialize_entry(CHOICES_KEY, &Rules(rules))?;
                map.serialize_entry(DEFAULT_KEY, default)?;
            }
            StateKind::Parallel { branches, fields } => {
                map.serialize_entry(TYPE_KEY, "Parallel")?;
                for (key, value) in fields {
                    map.serialize_entry(key, value)?;
                }
                map.serialize_entry(super::step::BRANCHES_KEY, branches)?;
            }
            StateKind::Merge { merge_type } => {
                map.serialize_entry(TYPE_KEY, merge_type)?;
            }
            StateKind::Pass => {
                map.serialize_entry(TYPE_KEY, PASS_TYPE)?;
            }
        }
        match &self.transition {
            Some(Transition::Next(next)) => map.serialize_entry(NEXT_KEY, next)?,
            Some(Transition::End) => map.serialize_entry(END_KEY, &true)?,
            None => {}
        }
        map.end()
    }
}
