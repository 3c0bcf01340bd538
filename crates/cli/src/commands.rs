use crate::config::AppConfig;
use anyhow::{Context, Result};
use deployplan_core::control::{InMemoryTargetProbe, InMemoryWorkflowControl};
use deployplan_core::plan::{AuthoredPlan, PlanCompiler, StateGraph};
use deployplan_core::storage::{RecordStore, RedbRecordStore};
use deployplan_core::{
    CoordinatorConfig, DeploymentName, DeploymentRecord, ExecutionCoordinator, ExecutionId,
    ObjectIdentifier, TriggerEvent, TriggerOutcome,
};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let rendered = serde_json::to_string_pretty(value).context("Failed to render output")?;
    println!("{}", rendered);
    Ok(())
}

fn open_store(config: &AppConfig) -> Result<Arc<RedbRecordStore>> {
    let store =
        RedbRecordStore::new(config.records_path()).context("Failed to open record store")?;
    Ok(Arc::new(store))
}

/// Coordinator over the local store; workflow control and target probe are in-process
fn local_coordinator(
    store: Arc<RedbRecordStore>,
    control: Arc<InMemoryWorkflowControl>,
    probe: Arc<InMemoryTargetProbe>,
    config: CoordinatorConfig,
) -> ExecutionCoordinator {
    ExecutionCoordinator::new(store, control, probe, config)
}

fn store_coordinator(config: &AppConfig) -> Result<ExecutionCoordinator> {
    Ok(local_coordinator(
        open_store(config)?,
        Arc::new(InMemoryWorkflowControl::new()),
        Arc::new(InMemoryTargetProbe::new()),
        config.coordinator_config(),
    ))
}

pub fn compile_plan(config: &AppConfig, plan_path: &Path) -> Result<StateGraph> {
    let source = std::fs::read_to_string(plan_path)
        .with_context(|| format!("Failed to read plan {}", plan_path.display()))?;

    let plan = if plan_path.extension().is_some_and(|ext| ext == "json") {
        AuthoredPlan::from_json_str(&source)
    } else {
        AuthoredPlan::from_yaml_str(&source)
    }
    .with_context(|| format!("Invalid deployment plan {}", plan_path.display()))?;

    let graph = PlanCompiler::new(config.compiler.clone())
        .compile(&plan)
        .with_context(|| format!("Failed to compile {}", plan_path.display()))?;
    Ok(graph)
}

pub fn compile(config: &AppConfig, plan_path: &Path, output: Option<&Path>) -> Result<()> {
    let graph = compile_plan(config, plan_path)?;
    let rendered = graph
        .to_json_pretty()
        .context("Failed to render state machine definition")?;

    match output {
        Some(path) => {
            std::fs::write(path, rendered)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            tracing::info!(
                "Compiled {} states into {}",
                graph.state_names().len(),
                path.display()
            );
        }
        None => println!("{}", rendered),
    }
    Ok(())
}

pub async fn register_origin(config: &AppConfig, record_path: &Path) -> Result<()> {
    let content = std::fs::read_to_string(record_path)
        .with_context(|| format!("Failed to read record {}", record_path.display()))?;
    let record: DeploymentRecord =
        serde_json::from_str(&content).context("Failed to parse deployment record")?;

    open_store(config)?
        .put_record(&record)
        .await
        .context("Failed to store deployment record")?;

    tracing::info!("Registered deployment record {}", record.key());
    Ok(())
}

pub async fn lookup(config: &AppConfig, object: &str, deployment: &str) -> Result<()> {
    let record = store_coordinator(config)?
        .lookup_deployment_record(
            &ObjectIdentifier::new(object),
            &DeploymentName::new(deployment),
        )
        .await?;
    print_json(&record)
}

pub async fn register(
    config: &AppConfig,
    execution: &str,
    object: &str,
    deployment: &str,
) -> Result<()> {
    store_coordinator(config)?
        .register_execution(
            &ExecutionId::new(execution),
            &ObjectIdentifier::new(object),
            &DeploymentName::new(deployment),
        )
        .await
        .context("Failed to register execution")?;
    Ok(())
}

pub async fn record_error(
    config: &AppConfig,
    deployment: &str,
    object: &str,
    message: &str,
    code: &str,
) -> Result<()> {
    store_coordinator(config)?
        .record_error(
            &DeploymentName::new(deployment),
            &ObjectIdentifier::new(object),
            message,
            code,
        )
        .await
        .context("Failed to record error")?;
    Ok(())
}

pub async fn run_trigger(
    config: &AppConfig,
    event: TriggerEvent,
    running: &[String],
    busy: &[String],
) -> Result<TriggerOutcome> {
    let control = Arc::new(InMemoryWorkflowControl::new());
    control
        .start_execution(&event.workflow, event.execution.clone())
        .await;
    for execution in running {
        control
            .start_execution(&event.workflow, ExecutionId::new(execution.as_str()))
            .await;
    }

    let probe = Arc::new(InMemoryTargetProbe::new());
    for target in busy {
        probe.set_busy(target.as_str(), true).await;
    }

    let coordinator =
        local_coordinator(open_store(config)?, control, probe, config.coordinator_config());
    let outcome = coordinator.handle_trigger(&event).await?;
    Ok(outcome)
}

pub async fn trigger(
    config: &AppConfig,
    event: TriggerEvent,
    running: &[String],
    busy: &[String],
) -> Result<()> {
    let outcome = run_trigger(config, event, running, busy).await?;
    print_json(&outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use deployplan_core::{ExecutionPhase, RecordKey, WorkflowId};
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn test_config(dir: &TempDir) -> AppConfig {
        AppConfig::load(&dir.path().join("absent.toml"), dir.path().join("data")).unwrap()
    }

    fn write_file(dir: &TempDir, name: &str, content: &str) -> PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn test_compile_yaml_plan_to_file() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        let plan = write_file(
            &dir,
            "plan.yaml",
            "- Name: Parameter\n  Type: Cfn\n- Name: Lambda\n  Type: Cfn\n",
        );
        let output = dir.path().join("definition.json");

        compile(&config, &plan, Some(&output)).unwrap();

        let written: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&output).unwrap()).unwrap();
        assert_eq!(written["StartAt"], "Parameter");
        assert_eq!(written["States"]["Lambda"]["End"], true);
    }

    #[test]
    fn test_compile_rejects_invalid_plan() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        let plan = write_file(&dir, "plan.json", r#"[{"Name": "A"}, {"Name": "A"}]"#);

        let err = compile_plan(&config, &plan).unwrap_err();
        assert!(format!("{:#}", err).contains("Duplicated step name"));
    }

    #[tokio::test]
    async fn test_register_origin_then_trigger() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        let record = write_file(
            &dir,
            "record.json",
            r#"{
                "deploymentName": "dev-app",
                "deploymentTime": 1700000000000,
                "objectIdentifier": "obj-1",
                "stackName": "dev-app-stack",
                "executionArns": {"run-1": "sm:run-1:a"}
            }"#,
        );
        register_origin(&config, &record).await.unwrap();

        let outcome = run_trigger(
            &config,
            TriggerEvent {
                execution: ExecutionId::new("sm:run-2:b"),
                workflow: WorkflowId::new("deploy-sm"),
                object_identifier: ObjectIdentifier::new("obj-1"),
                deployment_name: DeploymentName::new("dev-app"),
            },
            &["sm:run-1:a".to_string()],
            &[],
        )
        .await
        .unwrap();

        assert_eq!(outcome.phase, ExecutionPhase::Proceeding);
        assert_eq!(outcome.superseded, vec![ExecutionId::new("sm:run-1:a")]);
        assert_eq!(
            outcome.record,
            RecordKey::new(DeploymentName::new("dev-app"), 1_700_000_000_000)
        );
    }
}
