use std::time::Duration;

use clap::{Parser, ValueEnum};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use etl_controller::catalog::{CatalogClient, SessionManager, ETL_JOB_KIND};
use etl_controller::config::ControllerConfig;
use etl_controller::controller::{Controller, JobSpec, JobState};
use etl_controller::engine::RemoteEngine;
use etl_controller::proto::catalog::Resource;
use etl_controller::shutdown::install_shutdown_handler;

#[derive(Parser, Debug)]
#[command(name = "etl-controller")]
#[command(version)]
#[command(about = "Executes catalog-managed ETL jobs on a remote query engine")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Start the controller process
    Run(RunArgs),

    /// Job management commands
    Job {
        #[command(flatten)]
        client: ClientArgs,

        #[command(subcommand)]
        command: JobCommands,
    },
}

// =============================================================================
// Controller Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct RunArgs {
    /// Catalog endpoint
    #[arg(long, default_value = "http://127.0.0.1:50051")]
    catalog_addr: String,

    /// Query engine endpoint
    #[arg(long, default_value = "http://127.0.0.1:50052")]
    engine_addr: String,

    /// Service account the controller authenticates as
    #[arg(long)]
    service_account_id: String,

    /// Secret of the service account
    #[arg(long)]
    service_account_secret: String,

    /// Connection deadline in seconds
    #[arg(long, default_value = "30")]
    rpc_timeout_secs: u64,

    /// Pause in milliseconds before restarting discovery after a failure
    #[arg(long, default_value = "1000")]
    retry_delay_ms: u64,
}

// =============================================================================
// Client Arguments (shared by job commands)
// =============================================================================

#[derive(Parser, Debug)]
struct ClientArgs {
    /// Catalog endpoint
    #[arg(long, short = 'a', default_value = "http://127.0.0.1:50051")]
    addr: String,

    /// Service account to authenticate as
    #[arg(long)]
    service_account_id: String,

    /// Secret of the service account
    #[arg(long)]
    service_account_secret: String,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

// =============================================================================
// Job Commands
// =============================================================================

#[derive(clap::Subcommand, Debug)]
enum JobCommands {
    /// Submit a new job
    Submit {
        /// Query text; may reference data sources as @source.table
        #[arg(long)]
        sql: String,

        /// Reference naming the table the result is written to
        #[arg(long)]
        target: String,
    },
    /// Show one job
    Status {
        /// The job's resource id
        job_id: String,
    },
    /// List jobs
    List {
        /// Only show jobs in this state (PENDING, RUNNING, FINISHED, FAILED)
        #[arg(long)]
        state: Option<String>,
    },
}

// =============================================================================
// JSON Output Types
// =============================================================================

#[derive(Serialize)]
struct JobSubmitOutput {
    job_id: String,
}

#[derive(Serialize)]
struct JobStatusOutput {
    job_id: String,
    creator_id: String,
    created_at: Option<String>,
    document: serde_json::Value,
}

#[derive(Serialize)]
struct JobListItem {
    job_id: String,
    state: String,
    target: String,
}

#[derive(Serialize)]
struct JobListOutput {
    jobs: Vec<JobListItem>,
    count: usize,
}

// =============================================================================
// Helper Functions
// =============================================================================

fn format_timestamp(ts: Option<&prost_types::Timestamp>) -> Option<String> {
    let ts = ts?;
    let datetime = chrono::DateTime::from_timestamp(ts.seconds, ts.nanos as u32)?;
    Some(datetime.to_rfc3339())
}

async fn connect_client(
    args: &ClientArgs,
) -> Result<(CatalogClient, SessionManager), Box<dyn std::error::Error>> {
    let (client, session) = CatalogClient::connect(&args.addr, Duration::from_secs(30)).await?;
    session
        .login(&args.service_account_id, &args.service_account_secret)
        .await?;
    Ok((client, session))
}

// =============================================================================
// Controller Entry Point
// =============================================================================

async fn run_controller(args: RunArgs) -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = ControllerConfig::new(args.catalog_addr, args.engine_addr)
        .with_service_account(args.service_account_id, args.service_account_secret)
        .with_rpc_timeout(Duration::from_secs(args.rpc_timeout_secs))
        .with_retry_delay(Duration::from_millis(args.retry_delay_ms));

    tracing::info!(
        catalog_addr = %config.catalog_addr,
        engine_addr = %config.engine_addr,
        service_account_id = %config.service_account_id,
        "starting etl-controller"
    );

    let (catalog, session) = CatalogClient::connect(&config.catalog_addr, config.rpc_timeout).await?;
    session
        .login(&config.service_account_id, &config.service_account_secret)
        .await?;
    let engine = RemoteEngine::connect(&config.engine_addr, config.rpc_timeout).await?;

    let shutdown = install_shutdown_handler();
    let controller = Controller::new(catalog, session, engine, &config);
    controller.run(shutdown).await?;

    Ok(())
}

// =============================================================================
// Client Command Handlers
// =============================================================================

async fn handle_job_submit(
    catalog: &CatalogClient,
    sql: String,
    target: String,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let spec = JobSpec {
        sql,
        target,
        state: JobState::Pending,
    };
    let resource = catalog
        .create_resource(ETL_JOB_KIND, serde_json::to_string(&spec)?)
        .await?;

    match output_format {
        OutputFormat::Json => {
            let output = JobSubmitOutput {
                job_id: resource.id,
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Table => {
            println!("Job submitted.");
            println!("Job ID: {}", resource.id);
        }
    }
    Ok(())
}

async fn handle_job_status(
    catalog: &CatalogClient,
    job_id: String,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let resource = catalog.get_resource(&job_id).await?;
    let document: serde_json::Value =
        serde_json::from_str(&resource.data).unwrap_or(serde_json::Value::Null);

    match output_format {
        OutputFormat::Json => {
            let output = JobStatusOutput {
                job_id: resource.id,
                creator_id: resource.creator_id,
                created_at: format_timestamp(resource.created_at.as_ref()),
                document,
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Table => {
            println!("Job ID:     {}", resource.id);
            println!("Creator:    {}", resource.creator_id);
            if let Some(created) = format_timestamp(resource.created_at.as_ref()) {
                println!("Created:    {}", created);
            }
            match JobSpec::parse(&resource.data) {
                Ok(spec) => {
                    println!("State:      {}", spec.state);
                    println!("Target:     {}", spec.target);
                    println!("SQL:        {}", spec.sql);
                }
                Err(_) => {
                    println!("Document:   {}", resource.data);
                }
            }
        }
    }
    Ok(())
}

async fn handle_job_list(
    catalog: &CatalogClient,
    state: Option<String>,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let filter = match state {
        Some(state) => {
            let state = state.to_uppercase();
            if !matches!(state.as_str(), "PENDING" | "RUNNING" | "FINISHED" | "FAILED") {
                return Err(format!("unknown job state: {state}").into());
            }
            format!(r#"$.state == "{state}""#)
        }
        None => String::new(),
    };
    let resources = catalog.list_resources(ETL_JOB_KIND, &filter).await?;

    let jobs: Vec<JobListItem> = resources.iter().map(job_list_item).collect();

    match output_format {
        OutputFormat::Json => {
            let output = JobListOutput {
                count: jobs.len(),
                jobs,
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Table => {
            if jobs.is_empty() {
                println!("No jobs found.");
            } else {
                println!("{:<38} {:<10} TARGET", "JOB ID", "STATE");
                println!("{}", "-".repeat(68));
                for job in &jobs {
                    println!("{:<38} {:<10} {}", job.job_id, job.state, job.target);
                }
                println!();
                println!("{} job(s)", jobs.len());
            }
        }
    }
    Ok(())
}

fn job_list_item(resource: &Resource) -> JobListItem {
    match JobSpec::parse(&resource.data) {
        Ok(spec) => JobListItem {
            job_id: resource.id.clone(),
            state: spec.state.to_string(),
            target: spec.target,
        },
        Err(_) => JobListItem {
            job_id: resource.id.clone(),
            state: "-".to_string(),
            target: "-".to_string(),
        },
    }
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    match args.command {
        Commands::Run(run_args) => {
            run_controller(run_args).await?;
        }
        Commands::Job { client, command } => {
            let (catalog, _session) = connect_client(&client).await?;

            match command {
                JobCommands::Submit { sql, target } => {
                    handle_job_submit(&catalog, sql, target, &client.output).await?;
                }
                JobCommands::Status { job_id } => {
                    handle_job_status(&catalog, job_id, &client.output).await?;
                }
                JobCommands::List { state } => {
                    handle_job_list(&catalog, state, &client.output).await?;
                }
            }
        }
    }

    Ok(())
}
