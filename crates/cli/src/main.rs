use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod commands;
mod config;

use config::AppConfig;

#[derive(Parser, Debug)]
#[command(name = "deployplan")]
#[command(about = "Deployment plan compiler and execution coordinator", long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "deployplan.toml", env = "DEPLOYPLAN_CONFIG")]
    config: PathBuf,

    /// Data directory for the deployment record store
    #[arg(short, long, default_value = "./data", env = "DEPLOYPLAN_DATA_DIR")]
    data_dir: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Compile a YAML or JSON deployment plan into a state machine definition
    Compile {
        plan: PathBuf,

        /// Write the definition here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Store a deployment record read from a JSON file
    RegisterOrigin { record: PathBuf },

    /// Find the deploy attempt of an object
    Lookup {
        #[arg(long)]
        object: String,

        #[arg(long)]
        deployment: String,
    },

    /// Record an execution on every attempt of an object
    Register {
        #[arg(long)]
        execution: String,

        #[arg(long)]
        object: String,

        #[arg(long)]
        deployment: String,
    },

    /// Record a deployment failure on every attempt of an object
    RecordError {
        #[arg(long)]
        deployment: String,

        #[arg(long)]
        object: String,

        #[arg(long)]
        message: String,

        #[arg(long)]
        code: String,
    },

    /// Run admission for a new execution against the local record store
    Trigger {
        #[arg(long)]
        execution: String,

        #[arg(long)]
        workflow: String,

        #[arg(long)]
        object: String,

        #[arg(long)]
        deployment: String,

        /// Other executions of the workflow that are currently running
        #[arg(long)]
        running: Vec<String>,

        /// Deployment targets that are mid-update
        #[arg(long)]
        busy: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "deployplan=info".into()),
        )
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    tracing::debug!("Data directory: {}", args.data_dir.display());
    let config = AppConfig::load(&args.config, args.data_dir)?;

    match args.command {
        Command::Compile { plan, output } => commands::compile(&config, &plan, output.as_deref()),
        Command::RegisterOrigin { record } => commands::register_origin(&config, &record).await,
        Command::Lookup { object, deployment } => {
            commands::lookup(&config, &object, &deployment).await
        }
        Command::Register {
            execution,
            object,
            deployment,
        } => commands::register(&config, &execution, &object, &deployment).await,
        Command::RecordError {
            deployment,
            object,
            message,
            code,
        } => commands::record_error(&config, &deployment, &object, &message, &code).await,
        Command::Trigger {
            execution,
            workflow,
            object,
            deployment,
            running,
            busy,
        } => {
            let event = deployplan_core::TriggerEvent {
                execution: deployplan_core::ExecutionId::new(execution),
                workflow: deployplan_core::WorkflowId::new(workflow),
                object_identifier: deployplan_core::ObjectIdentifier::new(object),
                deployment_name: deployplan_core::DeploymentName::new(deployment),
            };
            commands::trigger(&config, event, &running, &busy).await
        }
    }
}
