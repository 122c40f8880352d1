use std::path::Path;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use flowcheck::config::Config;
use flowcheck::engine::{HttpWorker, LifecycleController};
use flowcheck::storage::{ExecutionListQuery, ExecutionStatus, SqliteStorage};

#[derive(Parser)]
#[command(name = "flowcheck")]
#[command(about = "Execution tracking for API test flows", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP server
    Server {
        /// Overrides server.port
        #[arg(short, long, env = "FLOWCHECK_SERVER_PORT")]
        port: Option<u16>,
    },
    /// Work with flow documents
    Flow {
        #[command(subcommand)]
        action: FlowActions,
    },
    /// Work with test suites
    Suites {
        #[command(subcommand)]
        action: SuiteActions,
    },
    /// Inspect and control executions
    Executions {
        #[command(subcommand)]
        action: ExecutionActions,
    },
    /// Database maintenance and checks
    Db {
        #[command(subcommand)]
        action: DbActions,
    },
}

#[derive(Subcommand)]
enum FlowActions {
    /// Validate a JSON or YAML flow file and print its step order
    Validate {
        /// Path to the flow file
        file: String,
    },
}

#[derive(Subcommand)]
enum SuiteActions {
    /// Dispatch a suite to the worker
    Run {
        suite_id: String,
        /// Recorded as the execution's trigger
        #[arg(long, default_value = "cli")]
        triggered_by: String,
    },
}

#[derive(Subcommand)]
enum ExecutionActions {
    /// List executions, newest first
    List {
        /// Only executions of this suite
        #[arg(long)]
        suite: Option<String>,
        /// completed|failed|stopped|running|pending
        #[arg(long, value_parser = parse_status)]
        status: Option<ExecutionStatus>,
        #[arg(long, default_value = "1")]
        page: usize,
        #[arg(long, default_value = "20")]
        page_size: usize,
    },
    /// Show an execution with its cases and steps
    Show { execution_id: String },
    /// Stop a pending or running execution
    Stop { execution_id: String },
    /// Run an execution again with its original environment
    Retry { execution_id: String },
}

#[derive(Subcommand)]
enum DbActions {
    /// Run database integrity checks
    Check,
}

fn parse_status(s: &str) -> std::result::Result<ExecutionStatus, String> {
    s.to_lowercase().parse()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = Config::load();

    if let Err(e) = flowcheck::telemetry::init_tracing(&config.logging) {
        eprintln!("Failed to initialize logging: {}", e);
    }

    match cli.command {
        Commands::Server { port } => cmd_server(config, port).await?,
        Commands::Flow { action } => match action {
            FlowActions::Validate { file } => cmd_flow_validate(&file)?,
        },
        Commands::Suites { action } => match action {
            SuiteActions::Run {
                suite_id,
                triggered_by,
            } => cmd_suites_run(&config, &suite_id, &triggered_by).await?,
        },
        Commands::Executions { action } => match action {
            ExecutionActions::List {
                suite,
                status,
                page,
                page_size,
            } => {
                let query = ExecutionListQuery {
                    suite_id: suite,
                    status,
                    page,
                    page_size,
                };
                cmd_executions_list(&config, &query).await?
            }
            ExecutionActions::Show { execution_id } => {
                cmd_executions_show(&config, &execution_id).await?
            }
            ExecutionActions::Stop { execution_id } => {
                cmd_executions_stop(&config, &execution_id).await?
            }
            ExecutionActions::Retry { execution_id } => {
                cmd_executions_retry(&config, &execution_id).await?
            }
        },
        Commands::Db { action } => match action {
            DbActions::Check => cmd_db_check(&config).await?,
        },
    }

    Ok(())
}

// ============================================================================
// Server
// ============================================================================

async fn cmd_server(mut config: Config, port: Option<u16>) -> anyhow::Result<()> {
    use flowcheck::api::{create_router, AppState};
    use flowcheck::progress::ExecutionWatcher;
    use flowcheck::shutdown::ShutdownCoordinator;

    if let Some(port) = port {
        config.server.port = port;
    }

    flowcheck::metrics::init_metrics();

    let storage = get_storage(&config)?;
    let controller = get_controller(&config, storage.clone());

    let shutdown = ShutdownCoordinator::new();
    let _signals = shutdown.start_signal_listener();

    let watcher = ExecutionWatcher::new(storage, config.stream.settings())
        .with_shutdown(shutdown.clone());
    let app = create_router(AppState {
        controller,
        watcher,
    });

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!(
        address = %addr,
        worker = %config.worker.endpoint,
        "flowcheck server started"
    );
    println!("flowcheck server running on http://{}", addr);
    println!();
    println!("API endpoints:");
    println!("  POST /api/flows/validate");
    println!("  PUT  /api/test-cases/{{id}}");
    println!("  PUT  /api/test-suites/{{id}}");
    println!("  POST /api/test-suites/{{id}}/execute");
    println!("  GET  /api/executions/{{id}}");
    println!("  GET  /api/executions/{{id}}/stream (SSE)");
    println!("  GET  /api/executions/{{id}}/logs");
    println!("  POST /api/executions/{{id}}/stop");
    println!("  POST /api/executions/{{id}}/retry");
    println!();
    println!("Worker: {}", config.worker.endpoint);
    println!("Press Ctrl+C to stop");

    let drained = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.wait_for_shutdown().await })
        .await?;

    tracing::info!(
        reason = drained.reason().unwrap_or("listener closed"),
        "Server drained"
    );
    println!("Server stopped.");
    Ok(())
}

// ============================================================================
// Flows and suites
// ============================================================================

fn cmd_flow_validate(file: &str) -> anyhow::Result<()> {
    use flowcheck::flow::{parse_flow_file, validate_flow};

    let path = Path::new(file);
    if !path.exists() {
        anyhow::bail!("File not found: {}", file);
    }

    let flow = parse_flow_file(path)?;
    let validated = match validate_flow(&flow) {
        Ok(validated) => validated,
        Err(e) => {
            println!("✗ {}", e);
            println!("{}", serde_json::to_string_pretty(&e.report())?);
            anyhow::bail!("Flow is invalid ({})", e.code());
        }
    };

    println!("✓ Flow is valid");
    println!();
    println!("  Nodes: {}", flow.nodes.len());
    println!("  Steps: {}", validated.steps.len());
    println!("  References: {}", validated.references.len());
    if !validated.order.orphans.is_empty() {
        println!(
            "  Unreachable (run last): {}",
            validated.order.orphans.join(", ")
        );
    }
    println!();
    println!("{:<6} {:<24} {:<12} {:<10}", "ORDER", "NODE", "TYPE", "CLEANUP");
    println!("{}", "-".repeat(54));
    for step in &validated.steps {
        println!(
            "{:<6} {:<24} {:<12} {:<10}",
            step.order,
            step.node_id,
            step.step_type.to_string(),
            if step.is_cleanup { "yes" } else { "" }
        );
    }

    Ok(())
}

async fn cmd_suites_run(config: &Config, suite_id: &str, triggered_by: &str) -> anyhow::Result<()> {
    let controller = get_controller(config, get_storage(config)?);
    let receipt = controller.dispatch(suite_id, triggered_by).await?;

    println!("Execution: {}", receipt.execution_id);
    println!("Suite:     {} ({})", receipt.suite_name, receipt.suite_id);
    println!(
        "Cases:     {}  Steps: {}",
        receipt.total_cases, receipt.total_steps
    );
    if receipt.dispatched {
        println!("✓ Dispatched to {}", config.worker.endpoint);
        Ok(())
    } else {
        anyhow::bail!("Worker did not accept the execution; it was marked failed")
    }
}

// ============================================================================
// Executions
// ============================================================================

async fn cmd_executions_list(config: &Config, query: &ExecutionListQuery) -> anyhow::Result<()> {
    let storage = get_storage(config)?;
    let page = storage.query_executions(query).await?;

    if page.executions.is_empty() {
        println!("No executions found.");
        return Ok(());
    }

    println!(
        "{:<38} {:<20} {:<10} {:<6} {:<18}",
        "ID", "SUITE", "STATUS", "PASS", "STARTED"
    );
    println!("{}", "-".repeat(94));
    for item in &page.executions {
        let e = &item.execution;
        println!(
            "{:<38} {:<20} {:<10} {:<6} {:<18}",
            e.id,
            truncate(&e.suite_name, 20),
            e.status.as_str(),
            format!("{}%", item.pass_rate),
            e.start_time.format("%Y-%m-%d %H:%M")
        );
    }
    println!();
    println!(
        "Page {}/{} ({} total) | completed {} failed {} stopped {}",
        page.pagination.page,
        page.pagination.total_pages,
        page.pagination.total,
        page.stats.completed,
        page.stats.failed,
        page.stats.stopped
    );

    Ok(())
}

async fn cmd_executions_show(config: &Config, execution_id: &str) -> anyhow::Result<()> {
    let storage = get_storage(config)?;
    let Some(hierarchy) = storage.get_hierarchy(execution_id).await? else {
        anyhow::bail!("Execution not found: {}", execution_id);
    };
    let e = &hierarchy.execution;

    println!("Execution: {}", e.id);
    println!("Suite:     {} ({})", e.suite_name, e.suite_id);
    println!("Status:    {}", e.status.as_str());
    println!("Trigger:   {}", e.triggered_by);
    println!("Started:   {}", e.start_time.to_rfc3339());
    if let Some(duration) = e.duration {
        println!("Duration:  {}ms", duration);
    }
    println!(
        "Cases:     {} passed, {} failed, {} skipped of {} ({}%)",
        e.passed_cases,
        e.failed_cases,
        e.skipped_cases,
        e.total_cases,
        e.pass_rate()
    );
    if let Some(error) = &e.error_message {
        println!("Error:     {}", error);
    }

    for case in &hierarchy.cases {
        println!();
        println!(
            "[{}] {} ({})",
            case.status.as_str(),
            case.test_case_name,
            case.test_case_id
        );
        for step in &case.steps {
            let duration = step
                .duration
                .map(|d| format!("{}ms", d))
                .unwrap_or_default();
            println!(
                "  {:>3}. {:<10} {:<24} {}",
                step.order,
                step.status.as_str(),
                truncate(&step.node_name, 24),
                duration
            );
        }
    }

    Ok(())
}

async fn cmd_executions_stop(config: &Config, execution_id: &str) -> anyhow::Result<()> {
    let controller = get_controller(config, get_storage(config)?);
    let receipt = controller.stop(execution_id).await?;

    println!("✓ Execution {} stopped", receipt.execution_id);
    println!(
        "  Steps stopped: {}  Cases stopped: {}  Duration: {}ms",
        receipt.stopped_steps, receipt.stopped_cases, receipt.duration
    );
    if !receipt.worker_notified {
        println!("  Worker did not acknowledge the cancel signal");
    }
    Ok(())
}

async fn cmd_executions_retry(config: &Config, execution_id: &str) -> anyhow::Result<()> {
    let controller = get_controller(config, get_storage(config)?);
    let receipt = controller.retry(execution_id, "cli").await?;

    println!("Retry of {}: {}", execution_id, receipt.execution_id);
    if receipt.dispatched {
        println!("✓ Dispatched to {}", config.worker.endpoint);
        Ok(())
    } else {
        anyhow::bail!("Worker did not accept the execution; it was marked failed")
    }
}

// ============================================================================
// Database
// ============================================================================

async fn cmd_db_check(config: &Config) -> anyhow::Result<()> {
    let storage = get_storage(config)?;
    let health = storage.check_health().await?;

    println!(
        "Foreign keys: {}",
        if health.foreign_keys_enabled {
            "enabled"
        } else {
            "disabled"
        }
    );
    println!("Journal mode: {}", health.journal_mode);
    println!("Integrity check: {}", health.integrity_check);
    println!(
        "Foreign key violations: {}",
        health.foreign_key_violations.len()
    );
    for violation in &health.foreign_key_violations {
        println!("  - {}", violation);
    }
    println!(
        "Orphan rows: case_executions={} step_executions={}",
        health.orphaned_case_executions, health.orphaned_step_executions
    );

    let healthy = health.foreign_keys_enabled
        && health.integrity_check.eq_ignore_ascii_case("ok")
        && health.foreign_key_violations.is_empty()
        && health.orphaned_case_executions == 0
        && health.orphaned_step_executions == 0;

    if healthy {
        println!("✓ Database health check passed");
        Ok(())
    } else {
        anyhow::bail!("Database health check failed")
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn get_storage(config: &Config) -> anyhow::Result<SqliteStorage> {
    Ok(SqliteStorage::open(&config.database_path())?)
}

fn get_controller(config: &Config, storage: SqliteStorage) -> LifecycleController {
    let worker = HttpWorker::new(&config.worker.endpoint, config.worker.timeout_seconds);
    LifecycleController::new(storage, Arc::new(worker))
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max.saturating_sub(1)).collect();
        format!("{}…", kept)
    }
}
