use std::{path::PathBuf, process::ExitCode, sync::Arc};

use anyhow::{Context, Result};
use clap::Parser;
use quarry_api::RestApiClient;
use quarry_engine::{
    FileWarehouse, HandlerRegistry, MemoryWarehouse, Outcome, RunOptions, RunReport, Services, StaticCredentials, Warehouse,
    WorkflowRunner, load_workflow_file,
};
use quarry_types::{AuthKind, Workflow};
use tracing::{Level, info, warn};

const DEFAULT_API_BASE: &str = "https://www.googleapis.com";

/// Runs a Quarry workflow: each task in order, with the execution log
/// appended to the workflow's log table.
#[derive(Debug, Parser)]
#[command(name = "quarry", version, about)]
struct Cli {
    /// Workflow file (JSON or YAML).
    workflow: PathBuf,

    /// Project billed for remote calls, sent as the user project header.
    #[arg(long, env = "QUARRY_PROJECT")]
    project: Option<String>,

    /// User credentials file: a raw token or JSON with `access_token`.
    #[arg(long = "user", env = "QUARRY_USER_CREDENTIALS")]
    user_credentials: Option<PathBuf>,

    /// Service credentials file: a raw token or JSON with `access_token`.
    #[arg(long = "service", env = "QUARRY_SERVICE_CREDENTIALS")]
    service_credentials: Option<PathBuf>,

    /// API key sent with every remote call.
    #[arg(long = "key", env = "QUARRY_API_KEY")]
    api_key: Option<String>,

    #[arg(long, env = "QUARRY_API_BASE", default_value = DEFAULT_API_BASE)]
    api_base: String,

    /// Warehouse state file. Without one, the run uses an in-memory warehouse.
    #[arg(long, env = "QUARRY_WAREHOUSE")]
    warehouse: Option<PathBuf>,

    /// Run only this task (1-based).
    #[arg(long = "task")]
    task: Option<usize>,

    #[arg(short, long)]
    verbose: bool,

    /// Load and validate the workflow without running it.
    #[arg(long)]
    validate: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let workflow = match load_workflow_file(&cli.workflow) {
        Ok(workflow) => workflow,
        Err(error) => {
            eprintln!("error: {error:#}");
            return ExitCode::from(2);
        }
    };

    match run(&cli, &workflow).await {
        Ok(code) => ExitCode::from(code),
        Err(error) => {
            eprintln!("error: {error:#}");
            ExitCode::from(2)
        }
    }
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| default_level.into());
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_max_level(if verbose { Level::DEBUG } else { Level::INFO })
        .with_writer(std::io::stderr)
        .try_init();
}

async fn run(cli: &Cli, workflow: &Workflow) -> Result<u8> {
    let credentials = load_credentials(cli).await?;
    let options = RunOptions {
        only_task: cli.task,
        auth_override: credentials.single_kind(),
    };
    let services = Services::new(
        open_warehouse(cli).await?,
        Arc::new(api_client(cli)?),
        Arc::new(credentials),
    );
    let mut runner = WorkflowRunner::new(HandlerRegistry::builtin(), services).with_options(options);

    if cli.validate {
        runner.validate(workflow).with_context(|| format!("Invalid workflow: {}", cli.workflow.display()))?;
        println!("{}: {} tasks valid", cli.workflow.display(), workflow.tasks.len());
        return Ok(0);
    }

    info!(
        workflow = %cli.workflow.display(),
        project = cli.project.as_deref().unwrap_or("-"),
        tasks = workflow.tasks.len(),
        "starting workflow"
    );
    let report = runner.run(workflow).await;
    print_summary(&report);
    Ok(u8::try_from(report.exit_code()).unwrap_or(1))
}

fn api_client(cli: &Cli) -> Result<RestApiClient> {
    Ok(RestApiClient::new(&cli.api_base, cli.api_key.clone())?.with_project(cli.project.clone()))
}

async fn load_credentials(cli: &Cli) -> Result<StaticCredentials> {
    let mut credentials = StaticCredentials::new();
    if let Some(path) = &cli.user_credentials {
        credentials = credentials.with_token_file(AuthKind::User, path).await?;
    }
    if let Some(path) = &cli.service_credentials {
        credentials = credentials.with_token_file(AuthKind::Service, path).await?;
    }
    if credentials.is_empty() && !cli.validate {
        warn!("no credentials configured; tasks that need one will fail");
    }
    Ok(credentials)
}

async fn open_warehouse(cli: &Cli) -> Result<Arc<dyn Warehouse>> {
    let warehouse: Arc<dyn Warehouse> = match &cli.warehouse {
        Some(path) => Arc::new(
            FileWarehouse::open(path)
                .await
                .with_context(|| format!("Failed to open warehouse: {}", path.display()))?,
        ),
        None => Arc::new(MemoryWarehouse::new()),
    };
    Ok(warehouse)
}

fn print_summary(report: &RunReport) {
    for entry in report.log.entries() {
        let label = entry.description.clone().unwrap_or_else(|| entry.kind.to_string());
        match entry.outcome {
            Outcome::Success => println!("#{:<3} ok    {label} ({} rows)", entry.sequence, entry.rows_written),
            Outcome::Failure => println!(
                "#{:<3} FAIL  {label}: {}",
                entry.sequence,
                entry.error.as_deref().unwrap_or("unknown error")
            ),
        }
    }
    if let Some(error) = report.error.as_ref().filter(|_| report.log.is_empty()) {
        eprintln!("error: {error}");
    }
    if let Some(error) = &report.log_error {
        eprintln!("execution log not written: {error}");
    }
}
