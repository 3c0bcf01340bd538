// Compiles the simplified plan syntax into a fully linked state graph

use super::analysis::unreachable_states;
use super::state::{ChoiceRule, CompiledState, StateGraph, StateKind, Transition};
use super::step::{AuthoredPlan, AuthoredStep, StepKind, BRANCHES_KEY, IS_FALSE_KEY, IS_TRUE_KEY};
use crate::error::PlanValidationError;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

pub const DEFAULT_MERGE_TYPE: &str = "AttiniMergeOutput";

/// Compiler settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompilerOptions {
    /// Type tag of merge states; an authored step with this type is a merge marker
    #[serde(default = "default_merge_type")]
    pub merge_type: String,
}

fn default_merge_type() -> String {
    DEFAULT_MERGE_TYPE.to_string()
}

impl Default for CompilerOptions {
    fn default() -> Self {
        Self {
            merge_type: default_merge_type(),
        }
    }
}

/// Every state name produced anywhere in one compilation
#[derive(Debug, Default)]
struct NameRegistry {
    seen: HashSet<String>,
}

impl NameRegistry {
    fn register(&mut self, name: &str) -> Result<(), PlanValidationError> {
        if !self.seen.insert(name.to_string()) {
            return Err(PlanValidationError::DuplicateName(name.to_string()));
        }
        Ok(())
    }
}

/// Stateless deployment plan compiler
#[derive(Debug, Clone, Default)]
pub struct PlanCompiler {
    options: CompilerOptions,
}

impl PlanCompiler {
    pub fn new(options: CompilerOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &CompilerOptions {
        &self.options
    }

    /// Compile a plan into a state graph.
    ///
    /// Either the whole plan compiles or an error is returned; there is no
    /// partial result.
    pub fn compile(&self, plan: &AuthoredPlan) -> Result<StateGraph, PlanValidationError> {
        let mut names = NameRegistry::default();
        let graph = self.compile_scope(plan.steps(), None, &mut names)?;

        if let Some((state, target)) = graph.dangling_references().into_iter().next() {
            return Err(PlanValidationError::DanglingReference { state, target });
        }
        if let Some(state) = unreachable_states(&graph).into_iter().next() {
            return Err(PlanValidationError::UnreachableState(state));
        }

        tracing::debug!(
            "Compiled deployment plan: start_at={}, states={}, total_states={}",
            graph.start_at,
            graph.len(),
            names.seen.len()
        );
        Ok(graph)
    }

    /// Parse and compile a plan written in YAML (JSON is valid YAML too)
    pub fn compile_yaml(&self, source: &str) -> Result<StateGraph, PlanValidationError> {
        self.compile(&AuthoredPlan::from_yaml_str(source)?)
    }

    fn is_merge_marker(&self, step: &AuthoredStep) -> bool {
        matches!(&step.kind, StepKind::Task { .. })
            && step.step_type() == Some(self.options.merge_type.as_str())
    }

    fn compile_scope(
        &self,
        steps: &[AuthoredStep],
        owner: Option<(&str, &'static str)>,
        names: &mut NameRegistry,
    ) -> Result<StateGraph, PlanValidationError> {
        let first = steps.first().ok_or_else(|| match owner {
            Some((step, field)) => PlanValidationError::EmptyBranch {
                step: step.to_string(),
                field,
            },
            None => PlanValidationError::EmptyPlan,
        })?;

        let states = self.compile_sequence(steps, None, names)?;
        Ok(StateGraph {
            start_at: first.name.clone(),
            states,
        })
    }

    /// Compile a step list whose last step hands over to `trailing`
    fn compile_sequence(
        &self,
        steps: &[AuthoredStep],
        trailing: Option<&AuthoredStep>,
        names: &mut NameRegistry,
    ) -> Result<Vec<CompiledState>, PlanValidationError> {
        let mut states = Vec::new();
        for (index, step) in steps.iter().enumerate() {
            let successor = steps.get(index + 1).or(trailing);
            states.extend(self.compile_step(step, successor, names)?);
        }
        Ok(states)
    }

    fn compile_step(
        &self,
        step: &AuthoredStep,
        successor: Option<&AuthoredStep>,
        names: &mut NameRegistry,
    ) -> Result<Vec<CompiledState>, PlanValidationError> {
        match &step.kind {
            StepKind::Task { fields } => {
                names.register(&step.name)?;
                Ok(vec![CompiledState {
                    name: step.name.clone(),
                    kind: StateKind::Task {
                        fields: fields.clone(),
                    },
                    transition: Some(transition_to(successor)),
                }])
            }
            StepKind::Choice {
                condition,
                is_true,
                is_false,
            } => self.compile_choice(step, condition, is_true, is_false.as_deref(), successor, names),
            StepKind::Parallel { branches, fields } => {
                self.compile_parallel(step, branches, fields, successor, names)
            }
        }
    }

    fn compile_choice(
        &self,
        step: &AuthoredStep,
        condition: &serde_json::Map<String, serde_json::Value>,
        is_true: &[AuthoredStep],
        is_false: Option<&[AuthoredStep]>,
        successor: Option<&AuthoredStep>,
        names: &mut NameRegistry,
    ) -> Result<Vec<CompiledState>, PlanValidationError> {
        names.register(&step.name)?;

        let true_start = first_name(is_true, &step.name, IS_TRUE_KEY)?;
        let mut branch_states = self.compile_sequence(is_true, successor, names)?;

        let default = match is_false {
            Some(is_false) => {
                let false_start = first_name(is_false, &step.name, IS_FALSE_KEY)?;
                branch_states.extend(self.compile_sequence(is_false, successor, names)?);
                false_start
            }
            None => match successor {
                Some(next) => next.name.clone(),
                None => {
                    let end_name = format!("{}-End", step.name);
                    names.register(&end_name)?;
                    branch_states.push(CompiledState {
                        name: end_name.clone(),
                        kind: StateKind::Pass,
                        transition: Some(Transition::End),
                    });
                    end_name
                }
            },
        };

        let mut states = Vec::with_capacity(branch_states.len() + 1);
        states.push(CompiledState {
            name: step.name.clone(),
            kind: StateKind::Choice {
                rules: vec![ChoiceRule {
                    condition: condition.clone(),
                    next: true_start,
                }],
                default,
            },
            transition: None,
        });
        states.extend(branch_states);
        Ok(states)
    }

    fn compile_parallel(
        &self,
        step: &AuthoredStep,
        branches: &[Vec<AuthoredStep>],
        fields: &serde_json::Map<String, serde_json::Value>,
        successor: Option<&AuthoredStep>,
        names: &mut NameRegistry,
    ) -> Result<Vec<CompiledState>, PlanValidationError> {
        if branches.is_empty() {
            return Err(PlanValidationError::EmptyBranch {
                step: step.name.clone(),
                field: BRANCHES_KEY,
            });
        }

        let branches = branches
            .iter()
            .map(|branch| {
                self.compile_scope(branch, Some((step.name.as_str(), BRANCHES_KEY)), names)
            })
            .collect::<Result<Vec<_>, _>>()?;

        names.register(&step.name)?;

        // An authored merge marker right after the block already joins the branches
        if let Some(next) = successor.filter(|next| self.is_merge_marker(next)) {
            return Ok(vec![CompiledState {
                name: step.name.clone(),
                kind: StateKind::Parallel {
                    branches,
                    fields: fields.clone(),
                },
                transition: Some(Transition::Next(next.name.clone())),
            }]);
        }

        let merge_name = format!("{}-Merge", step.name);
        names.register(&merge_name)?;

        Ok(vec![
            CompiledState {
                name: step.name.clone(),
                kind: StateKind::Parallel {
                    branches,
                    fields: fields.clone(),
                },
                transition: Some(Transition::Next(merge_name.clone())),
            },
            CompiledState {
                name: merge_name,
                kind: StateKind::Merge {
                    merge_type: self.options.merge_type.clone(),
                },
                transition: Some(transition_to(successor)),
            },
        ])
    }
}

/// Compile a plan with default options
pub fn compile(plan: &AuthoredPlan) -> Result<StateGraph, PlanValidationError> {
    PlanCompiler::default().compile(plan)
}

fn transition_to(successor: Option<&AuthoredStep>) -> Transition {
    match successor {
        Some(next) => Transition::Next(next.name.clone()),
        None => Transition::End,
    }
}

fn first_name(
    steps: &[AuthoredStep],
    owner: &str,
    field: &'static str,
) -> Result<String, PlanValidationError> {
    steps
        .first()
        .map(|first| first.name.clone())
        .ok_or_else(|| PlanValidationError::EmptyBranch {
            step: owner.to_string(),
            field,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    fn compile_json(value: Value) -> Result<StateGraph, PlanValidationError> {
        compile(&AuthoredPlan::from_value(&value)?)
    }

    fn assert_all_targets_exist(graph: &StateGraph) {
        assert!(
            graph.dangling_references().is_empty(),
            "dangling: {:?}",
            graph.dangling_references()
        );
    }

    #[test]
    fn test_single_generic_step() {
        let graph = compile_json(json!([{"Name": "Deploy"}])).unwrap();
        assert_eq!(
            graph.to_json(),
            json!({"StartAt": "Deploy", "States": {"Deploy": {"End": true}}})
        );
    }

    #[test]
    fn test_sequence_is_linked() {
        let graph = compile_json(json!([
            {"Name": "Parameter", "Type": "Cfn", "Properties": {"StackName": "param"}},
            {"Name": "Lambda", "Type": "Cfn", "Properties": {"StackName": "lambda"}}
        ]))
        .unwrap();

        assert_eq!(
            graph.to_json(),
            json!({
                "StartAt": "Parameter",
                "States": {
                    "Parameter": {
                        "Type": "Cfn",
                        "Properties": {"StackName": "param"},
                        "Next": "Lambda"
                    },
                    "Lambda": {
                        "Type": "Cfn",
                        "Properties": {"StackName": "lambda"},
                        "End": true
                    }
                }
            })
        );
    }

    #[test]
    fn test_choice_as_last_step_gets_synthetic_end() {
        let graph = compile_json(json!([
            {"Name": "Parameter", "Type": "Cfn"},
            {
                "Name": "IsDev?",
                "Type": "Choice",
                "Condition": {"Variable": "$.env", "StringEquals": "dev"},
                "IsTrue": [{"Name": "LoadTest", "Type": "RunnerJob"}]
            }
        ]))
        .unwrap();

        assert_eq!(
            graph.to_json(),
            json!({
                "StartAt": "Parameter",
                "States": {
                    "Parameter": {"Type": "Cfn", "Next": "IsDev?"},
                    "IsDev?": {
                        "Type": "Choice",
                        "Choices": [{"Variable": "$.env", "StringEquals": "dev", "Next": "LoadTest"}],
                        "Default": "IsDev?-End"
                    },
                    "LoadTest": {"Type": "RunnerJob", "End": true},
                    "IsDev?-End": {"Type": "Pass", "End": true}
                }
            })
        );
        assert!(graph.get("IsDev?-End").unwrap().is_synthetic());
    }

    #[test]
    fn test_choice_defaults_to_following_step() {
        let graph = compile_json(json!([
            {
                "Name": "IsDev?",
                "Type": "Choice",
                "Condition": {"Variable": "$.env", "StringEquals": "dev"},
                "IsTrue": [{"Name": "A"}]
            },
            {"Name": "B"}
        ]))
        .unwrap();

        match &graph.get("IsDev?").unwrap().kind {
            StateKind::Choice { rules, default } => {
                assert_eq!(rules[0].next, "A");
                assert_eq!(default, "B");
            }
            other => panic!("expected choice, got {:?}", other),
        }
        assert!(graph.get("IsDev?-End").is_none());
        assert_eq!(
            graph.get("A").unwrap().transition,
            Some(Transition::Next("B".to_string()))
        );
        assert_eq!(graph.len(), 3);
    }

    #[test]
    fn test_choice_with_false_branch() {
        let graph = compile_json(json!([
            {"Name": "Parameter", "Type": "Cfn"},
            {
                "Name": "IsDev?",
                "Type": "Choice",
                "Condition": {"And": [
                    {"Variable": "$.foo.bar", "StringEquals": "dev"},
                    {"Variable": "$.foo.baz", "StringEquals": "qux"}
                ]},
                "IsTrue": [{"Name": "LoadTest", "Type": "RunnerJob"}],
                "IsFalse": [{"Name": "EchoCarl", "Type": "RunnerJob"}]
            },
            {"Name": "Lambda", "Type": "Cfn"}
        ]))
        .unwrap();

        assert_eq!(
            graph.to_json(),
            json!({
                "StartAt": "Parameter",
                "States": {
                    "Parameter": {"Type": "Cfn", "Next": "IsDev?"},
                    "IsDev?": {
                        "Type": "Choice",
                        "Choices": [{
                            "And": [
                                {"Variable": "$.foo.bar", "StringEquals": "dev"},
                                {"Variable": "$.foo.baz", "StringEquals": "qux"}
                            ],
                            "Next": "LoadTest"
                        }],
                        "Default": "EchoCarl"
                    },
                    "LoadTest": {"Type": "RunnerJob", "Next": "Lambda"},
                    "EchoCarl": {"Type": "RunnerJob", "Next": "Lambda"},
                    "Lambda": {"Type": "Cfn", "End": true}
                }
            })
        );
    }

    #[test]
    fn test_parallel_followed_by_step_gets_merge() {
        let graph = compile_json(json!([
            {
                "Name": "Fan",
                "Type": "Parallel",
                "Branches": [
                    [{"Name": "A1"}, {"Name": "A2"}],
                    [{"Name": "B1"}]
                ]
            },
            {"Name": "C"}
        ]))
        .unwrap();

        assert_eq!(
            graph.to_json(),
            json!({
                "StartAt": "Fan",
                "States": {
                    "Fan": {
                        "Type": "Parallel",
                        "Branches": [
                            {"StartAt": "A1", "States": {
                                "A1": {"Next": "A2"},
                                "A2": {"End": true}
                            }},
                            {"StartAt": "B1", "States": {
                                "B1": {"End": true}
                            }}
                        ],
                        "Next": "Fan-Merge"
                    },
                    "Fan-Merge": {"Type": "AttiniMergeOutput", "Next": "C"},
                    "C": {"End": true}
                }
            })
        );
        // Branch states live only in their nested graphs
        assert!(graph.get("A1").is_none());
        assert_eq!(graph.state_names().len(), 6);
    }

    #[test]
    fn test_parallel_before_authored_merge_links_directly() {
        let graph = compile_json(json!([
            {"Name": "Fan", "Type": "Parallel", "Branches": [[{"Name": "A"}], [{"Name": "B"}]]},
            {"Name": "AttiniMergeOutput", "Type": "AttiniMergeOutput"}
        ]))
        .unwrap();

        assert_eq!(
            graph.get("Fan").unwrap().transition,
            Some(Transition::Next("AttiniMergeOutput".to_string()))
        );
        assert!(graph.get("Fan-Merge").is_none());
        assert!(graph.get("AttiniMergeOutput").unwrap().is_end());
        assert_eq!(graph.len(), 2);
    }

    #[test]
    fn test_default_merge_marker_avoids_double_merge() {
        let graph = compile_json(json!([
            {"Name": "Fan", "Type": "Parallel", "Branches": [[{"Name": "A"}], [{"Name": "B"}]]},
            {"Name": "Join", "Type": "AttiniMergeOutput"}
        ]))
        .unwrap();

        assert!(graph.get("Fan-Merge").is_none());
        assert_eq!(
            graph.to_json()["States"],
            json!({
                "Fan": {
                    "Type": "Parallel",
                    "Branches": [
                        {"StartAt": "A", "States": {"A": {"End": true}}},
                        {"StartAt": "B", "States": {"B": {"End": true}}}
                    ],
                    "Next": "Join"
                },
                "Join": {"Type": "AttiniMergeOutput", "End": true}
            })
        );
    }

    #[test]
    fn test_adjacent_parallel_blocks_each_merge() {
        let graph = compile_json(json!([
            {"Name": "First", "Type": "Parallel", "Branches": [[{"Name": "A"}], [{"Name": "B"}]]},
            {"Name": "Second", "Type": "Parallel", "Branches": [[{"Name": "C"}], [{"Name": "D"}]]}
        ]))
        .unwrap();

        let names: Vec<&str> = graph.states.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["First", "First-Merge", "Second", "Second-Merge"]);
        assert_eq!(
            graph.get("First-Merge").unwrap().transition,
            Some(Transition::Next("Second".to_string()))
        );
        assert!(graph.get("Second-Merge").unwrap().is_end());
        assert_all_targets_exist(&graph);
    }

    #[test]
    fn test_custom_merge_type() {
        let compiler = PlanCompiler::new(CompilerOptions {
            merge_type: "JoinOutputs".to_string(),
        });
        let graph = compiler
            .compile_yaml(
                r#"
- Name: Fan
  Type: Parallel
  Branches:
    - - Name: A
    - - Name: B
- Name: Join
  Type: JoinOutputs
"#,
            )
            .unwrap();
        assert_eq!(
            graph.get("Fan").unwrap().transition,
            Some(Transition::Next("Join".to_string()))
        );

        let graph = compiler
            .compile_yaml("- Name: Fan\n  Type: Parallel\n  Branches:\n    - - Name: A\n")
            .unwrap();
        assert_eq!(graph.get("Fan-Merge").unwrap().type_tag(), Some("JoinOutputs"));
    }

    #[test]
    fn test_parallel_carries_extra_fields() {
        let graph = compile_json(json!([{
            "Name": "Fan",
            "Type": "Parallel",
            "ResultPath": "$.fan",
            "Branches": [[{"Name": "A"}]]
        }]))
        .unwrap();
        assert_eq!(graph.to_json()["States"]["Fan"]["ResultPath"], "$.fan");
    }

    #[test]
    fn test_nested_choice_inside_parallel_branch() {
        let graph = compile_json(json!([
            {
                "Name": "Fan",
                "Type": "Parallel",
                "Branches": [[{
                    "Name": "Check",
                    "Type": "Choice",
                    "Condition": {"Variable": "$.x", "BooleanEquals": true},
                    "IsTrue": [{"Name": "Yes"}]
                }]]
            },
            {"Name": "After"}
        ]))
        .unwrap();

        let StateKind::Parallel { branches, .. } = &graph.get("Fan").unwrap().kind else {
            panic!("expected parallel");
        };
        // Inside the branch there is no successor, so the choice ends through a synthetic Pass
        assert!(branches[0].contains("Check-End"));
        assert!(branches[0].get("Yes").unwrap().is_end());
        assert_all_targets_exist(&graph);
    }

    #[test]
    fn test_duplicate_top_level_name_rejected() {
        let err = compile_json(json!([{"Name": "A"}, {"Name": "A"}])).unwrap_err();
        assert_eq!(err, PlanValidationError::DuplicateName("A".to_string()));
    }

    #[test]
    fn test_duplicate_across_parallel_branches_rejected() {
        let err = compile_json(json!([{
            "Name": "Fan",
            "Type": "Parallel",
            "Branches": [[{"Name": "Same"}], [{"Name": "Same"}]]
        }]))
        .unwrap_err();
        assert_eq!(err, PlanValidationError::DuplicateName("Same".to_string()));
    }

    #[test]
    fn test_duplicate_between_branch_and_top_level_rejected() {
        let err = compile_json(json!([
            {"Name": "Fan", "Type": "Parallel", "Branches": [[{"Name": "Deploy"}]]},
            {"Name": "Deploy"}
        ]))
        .unwrap_err();
        assert_eq!(err, PlanValidationError::DuplicateName("Deploy".to_string()));
    }

    #[test]
    fn test_synthetic_name_collision_rejected() {
        let err = compile_json(json!([
            {"Name": "Fan", "Type": "Parallel", "Branches": [[{"Name": "A"}]]},
            {"Name": "Fan-Merge"}
        ]))
        .unwrap_err();
        assert_eq!(err, PlanValidationError::DuplicateName("Fan-Merge".to_string()));
    }

    #[test]
    fn test_duplicate_inside_choice_branches_rejected() {
        let err = compile_json(json!([{
            "Name": "Check",
            "Type": "Choice",
            "Condition": {"Variable": "$.x", "BooleanEquals": true},
            "IsTrue": [{"Name": "Same"}],
            "IsFalse": [{"Name": "Same"}]
        }]))
        .unwrap_err();
        assert_eq!(err, PlanValidationError::DuplicateName("Same".to_string()));
    }

    #[test]
    fn test_compile_is_deterministic() {
        let plan = AuthoredPlan::from_value(&json!([
            {"Name": "A", "Type": "Cfn"},
            {"Name": "Fan", "Type": "Parallel", "Branches": [[{"Name": "B"}], [{"Name": "C"}]]},
            {
                "Name": "Check",
                "Type": "Choice",
                "Condition": {"Variable": "$.x", "BooleanEquals": true},
                "IsTrue": [{"Name": "D"}]
            }
        ]))
        .unwrap();

        let first = compile(&plan).unwrap();
        let second = compile(&plan).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.to_json_pretty().unwrap(), second.to_json_pretty().unwrap());
    }

    #[test]
    fn test_structural_properties_hold() {
        let plan = AuthoredPlan::from_value(&json!([
            {"Name": "A"},
            {
                "Name": "Check",
                "Type": "Choice",
                "Condition": {"Variable": "$.x", "BooleanEquals": true},
                "IsTrue": [
                    {"Name": "Fan", "Type": "Parallel", "Branches": [[{"Name": "B"}], [{"Name": "C"}]]}
                ],
                "IsFalse": [{"Name": "D"}]
            },
            {"Name": "E"}
        ]))
        .unwrap();

        let graph = compile(&plan).unwrap();
        assert!(graph.len() >= plan.steps().len());
        assert_all_targets_exist(&graph);
        assert!(unreachable_states(&graph).is_empty());

        let names = graph.state_names();
        let unique: HashSet<&str> = names.iter().copied().collect();
        assert_eq!(names.len(), unique.len());
        for expected in ["A", "Check", "Fan", "Fan-Merge", "B", "C", "D", "E"] {
            assert!(unique.contains(expected), "missing {}", expected);
        }
        assert_eq!(
            graph.get("Fan-Merge").unwrap().transition,
            Some(Transition::Next("E".to_string()))
        );
    }

    #[test]
    fn test_manually_built_empty_branch_rejected() {
        let plan = AuthoredPlan::new(vec![AuthoredStep {
            name: "Fan".to_string(),
            kind: StepKind::Parallel {
                branches: vec![vec![]],
                fields: serde_json::Map::new(),
            },
        }])
        .unwrap();
        assert!(matches!(
            compile(&plan).unwrap_err(),
            PlanValidationError::EmptyBranch { field: BRANCHES_KEY, .. }
        ));
    }

    #[test]
    fn test_yaml_plan_end_to_end() {
        let graph = PlanCompiler::default()
            .compile_yaml(
                r#"
- Name: HelloWorldParameter
  Type: Cfn
  Properties:
    StackName: my-hello-world-parameter
    Template: /ssm-parameter.yaml
- Name: HelloWorldLambda
  Type: Cfn
  Properties:
    StackName: my-hello-world-lambda
    Parameters:
      SsmParameterKey.$: $.output.HelloWorldParameter.SsmParameterKey
"#,
            )
            .unwrap();

        assert_eq!(graph.start_at, "HelloWorldParameter");
        let json = graph.to_json();
        assert_eq!(json["States"]["HelloWorldParameter"]["Next"], "HelloWorldLambda");
        assert_eq!(
            json["States"]["HelloWorldLambda"]["Properties"]["Parameters"]["SsmParameterKey.$"],
            "$.output.HelloWorldParameter.SsmParameterKey"
        );
        assert_eq!(json["States"]["HelloWorldLambda"]["End"], true);
    }
}
