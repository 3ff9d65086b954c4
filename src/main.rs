//! Stackwright CLI entrypoint.
//!
//! This is the main entrypoint for the stackwright command-line tool.

use std::collections::BTreeSet;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use stackwright::cli::{Cli, Commands, OutputFormatter, StateCommands};
use stackwright::config::{
    ConfigParser, ConfigValidator, PROVIDER_URL_VAR, StackConfig, StateBackend, find_config_file,
};
use stackwright::error::{OrchestrateError, Result, StackError};
use stackwright::orchestrator::{OrchestrationReport, Orchestrator};
use stackwright::planner::DependencyGraph;
use stackwright::provider::{HttpProvider, ProviderRegistry, SimulatedProvider};
use stackwright::resource::ResourceId;
use stackwright::state::{LocalStateStore, S3StateStore, STATE_DIR, StateStore};

use clap::Parser;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

/// Account id used by the simulated provider when none is configured.
const SIMULATED_ACCOUNT: &str = "000000000000";

/// Main entrypoint.
fn main() -> ExitCode {
    let cli = Cli::parse();

    init_logging(cli.verbose, cli.log_json);

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Failed to create async runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(cli)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Initializes the logging system. `RUST_LOG` overrides the verbosity flag.
fn init_logging(verbose: bool, json: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Main async entry point.
async fn run(cli: Cli) -> Result<()> {
    let formatter = OutputFormatter::new(cli.output);
    let config_path = cli.config.as_ref();

    match cli.command {
        Commands::Init { path, force } => cmd_init(&path, force),
        Commands::Validate { warnings } => cmd_validate(config_path, warnings, &formatter),
        Commands::Graph { dot } => cmd_graph(config_path, dot, &formatter),
        Commands::Plan { detailed } => cmd_plan(config_path, detailed, &formatter).await,
        Commands::Apply { yes } => cmd_apply(config_path, yes, &formatter).await,
        Commands::Status { detailed } => cmd_status(config_path, detailed, &formatter).await,
        Commands::Drift => cmd_drift(config_path, &formatter).await,
        Commands::Destroy { yes, targets } => {
            cmd_destroy(config_path, yes, targets, &formatter).await
        }
        Commands::Outputs => cmd_outputs(config_path, &formatter).await,
        Commands::State { command } => cmd_state(config_path, command, &formatter).await,
    }
}

/// Initialize a new stack.
fn cmd_init(path: &Path, force: bool) -> Result<()> {
    info!("Initializing new stack in: {}", path.display());

    let config_path = path.join("stackwright.yaml");
    let env_path = path.join(".env.example");
    let gitignore_path = path.join(".gitignore");

    if !force && config_path.exists() {
        eprintln!("Stack document already exists: {}", config_path.display());
        eprintln!("Use --force to overwrite.");
        return Ok(());
    }

    if !path.exists() {
        std::fs::create_dir_all(path)?;
    }

    std::fs::write(&config_path, include_str!("../templates/stackwright.yaml"))?;
    eprintln!("Created: {}", config_path.display());

    std::fs::write(&env_path, include_str!("../templates/.env.example"))?;
    eprintln!("Created: {}", env_path.display());

    let state_entry = format!("{STATE_DIR}/");
    if gitignore_path.exists() {
        let existing = std::fs::read_to_string(&gitignore_path)?;
        let missing: Vec<&str> = [".env", state_entry.as_str()]
            .into_iter()
            .filter(|entry| !existing.lines().any(|line| line.trim() == *entry))
            .collect();
        if !missing.is_empty() {
            let mut file = std::fs::OpenOptions::new()
                .append(true)
                .open(&gitignore_path)?;
            writeln!(file, "\n# stackwright")?;
            for entry in missing {
                writeln!(file, "{entry}")?;
            }
            eprintln!("Updated: {}", gitignore_path.display());
        }
    } else {
        std::fs::write(&gitignore_path, format!(".env\n{state_entry}\n"))?;
        eprintln!("Created: {}", gitignore_path.display());
    }

    eprintln!("\nStack initialized successfully!");
    eprintln!("Next steps:");
    eprintln!("  1. Copy .env.example to .env and set the provider endpoint");
    eprintln!("  2. Edit stackwright.yaml with your resources");
    eprintln!("  3. Run 'stackwright validate' to check the document");
    eprintln!("  4. Run 'stackwright plan' to see what will be provisioned");
    eprintln!("  5. Run 'stackwright apply' to provision the stack");

    Ok(())
}

/// Validate the stack document.
fn cmd_validate(
    config_path: Option<&PathBuf>,
    show_warnings: bool,
    formatter: &OutputFormatter,
) -> Result<()> {
    let config_file = resolve_config_path(config_path)?;
    info!("Validating stack document: {}", config_file.display());

    let parser = ConfigParser::new().with_base_path(config_dir(&config_file));
    parser.load_dotenv()?;
    let config = parser.load_with_env(&config_file)?;

    let result = ConfigValidator::new().validate(&config)?;
    DependencyGraph::build(&config.resources)?;

    emit(&formatter.format_validation(&result, show_warnings))?;
    if !formatter.is_json() {
        eprintln!("\nStack summary:");
        eprintln!("  Stack: {}", config.qualified_name());
        eprintln!("  Region: {}", config.project.region);
        eprintln!("  Resources: {}", config.resources.len());
        eprintln!("  Outputs: {}", config.outputs.len());
    }

    Ok(())
}

/// Print the dependency graph.
fn cmd_graph(config_path: Option<&PathBuf>, dot: bool, formatter: &OutputFormatter) -> Result<()> {
    let config_file = resolve_config_path(config_path)?;
    let config = load_config(&config_file)?;
    let graph = DependencyGraph::build(&config.resources)?;
    emit(&formatter.format_graph(&graph, dot))
}

/// Show the operation plan.
async fn cmd_plan(
    config_path: Option<&PathBuf>,
    detailed: bool,
    formatter: &OutputFormatter,
) -> Result<()> {
    let ctx = Context::load(config_path).await?;
    let registry = ctx.registry().await?;
    let orchestrator = Orchestrator::new(&ctx.config, &ctx.store, &registry);

    let (plan, diff) = orchestrator.plan_with_diff().await?;
    emit(&formatter.format_plan(&plan, detailed.then_some(&diff)))
}

/// Provision the stack.
async fn cmd_apply(
    config_path: Option<&PathBuf>,
    auto_approve: bool,
    formatter: &OutputFormatter,
) -> Result<()> {
    let ctx = Context::load(config_path).await?;
    let registry = ctx.registry().await?;
    let orchestrator = Orchestrator::new(&ctx.config, &ctx.store, &registry);

    if !auto_approve {
        let plan = orchestrator.plan().await?;
        emit(&formatter.format_plan(&plan, None))?;
        if plan.is_empty() {
            return Ok(());
        }
        if !confirm("Do you want to apply this plan? [y/N]: ", |input| {
            input.eq_ignore_ascii_case("y")
        })? {
            eprintln!("Apply cancelled.");
            return Ok(());
        }
    }

    let cancel = cancel_on_interrupt();
    let report = orchestrator.apply(&cancel).await?;
    finish_report(&report, formatter)
}

/// Show recorded resource status.
async fn cmd_status(
    config_path: Option<&PathBuf>,
    detailed: bool,
    formatter: &OutputFormatter,
) -> Result<()> {
    let ctx = Context::load(config_path).await?;
    match ctx.store.load().await? {
        Some(state) => emit(&formatter.format_status(&state, detailed)),
        None => {
            eprintln!("No state found. Run 'stackwright apply' first.");
            Ok(())
        }
    }
}

/// Check for drift.
async fn cmd_drift(config_path: Option<&PathBuf>, formatter: &OutputFormatter) -> Result<()> {
    let ctx = Context::load(config_path).await?;
    let registry = ctx.registry().await?;
    let orchestrator = Orchestrator::new(&ctx.config, &ctx.store, &registry);

    let report = orchestrator.check_drift().await?;
    emit(&formatter.format_drift(&report))?;
    if report.has_drift() {
        let drifted: BTreeSet<&ResourceId> = report.drifted.iter().map(|d| &d.resource).collect();
        return Err(OrchestrateError::DriftDetected {
            count: drifted.len(),
        }
        .into());
    }
    Ok(())
}

/// Delete provisioned resources.
async fn cmd_destroy(
    config_path: Option<&PathBuf>,
    auto_approve: bool,
    targets: Vec<String>,
    formatter: &OutputFormatter,
) -> Result<()> {
    let ctx = Context::load(config_path).await?;
    let registry = ctx.registry().await?;
    let orchestrator = Orchestrator::new(&ctx.config, &ctx.store, &registry);

    let Some(state) = ctx.store.load().await? else {
        eprintln!("No state found. Nothing to destroy.");
        return Ok(());
    };
    if state.resources.is_empty() {
        eprintln!("No resources to destroy.");
        return Ok(());
    }

    let targets: Vec<ResourceId> = targets.into_iter().map(ResourceId::from).collect();
    let targets = (!targets.is_empty()).then_some(targets.as_slice());

    if !auto_approve {
        eprintln!("The following resources will be deleted:");
        for record in state.resources.values() {
            if targets.is_none_or(|t| t.contains(&record.id)) {
                eprintln!("  - {} ({}, {})", record.id, record.resource_type, record.physical_name);
            }
        }
        if !confirm(
            "\nThis action is IRREVERSIBLE. Type 'destroy' to confirm: ",
            |input| input == "destroy",
        )? {
            eprintln!("Destroy cancelled.");
            return Ok(());
        }
    }

    let cancel = cancel_on_interrupt();
    let report = orchestrator.destroy(targets, &cancel).await?;
    finish_report(&report, formatter)
}

/// Show resolved attributes and stack outputs.
async fn cmd_outputs(config_path: Option<&PathBuf>, formatter: &OutputFormatter) -> Result<()> {
    let ctx = Context::load(config_path).await?;
    let registry = ProviderRegistry::new();
    let orchestrator = Orchestrator::new(&ctx.config, &ctx.store, &registry);
    emit(&formatter.format_outputs(&orchestrator.outputs().await?))
}

/// State management commands.
async fn cmd_state(
    config_path: Option<&PathBuf>,
    command: StateCommands,
    formatter: &OutputFormatter,
) -> Result<()> {
    let ctx = Context::load(config_path).await?;
    let store = &ctx.store;

    match command {
        StateCommands::Show => {
            if let Some(state) = store.load().await? {
                emit(&formatter.format_state(&state))?;
            } else {
                eprintln!("No state found.");
            }
        }
        StateCommands::Lock { holder } => {
            let holder = holder.unwrap_or_else(stackwright::state::generate_holder_id);
            let lock = store.acquire_lock(&holder).await?;
            eprintln!("State locked by {}: {}", lock.holder, lock.lock_id);
        }
        StateCommands::Unlock { lock_id, force } => {
            if force {
                if let Some(lock) = store.get_lock_info().await? {
                    warn!("Force unlocking state held by {}", lock.holder);
                }
                store.force_unlock().await?;
                eprintln!("State forcefully unlocked.");
            } else if let Some(id) = lock_id {
                store.release_lock(&id).await?;
                eprintln!("State unlocked.");
            } else {
                eprintln!("Please provide --lock-id or use --force");
            }
        }
    }

    Ok(())
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Loaded stack document and its state backend.
struct Context {
    config: StackConfig,
    store: Box<dyn StateStore>,
    state_dir: PathBuf,
}

impl Context {
    /// Loads the stack document and creates the configured state store.
    async fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        let config_file = resolve_config_path(config_path)?;
        let config = load_config(&config_file)?;

        let state_dir = config
            .state
            .path
            .as_ref()
            .map_or_else(|| config_dir(&config_file).join(STATE_DIR), PathBuf::from);

        let store: Box<dyn StateStore> = match config.state.backend {
            StateBackend::Local => Box::new(LocalStateStore::with_base_dir(&state_dir)),
            StateBackend::S3 => {
                let bucket = config
                    .state
                    .bucket
                    .as_deref()
                    .ok_or_else(|| StackError::internal("S3 bucket not configured"))?;
                Box::new(
                    S3StateStore::new(
                        bucket,
                        config.state.prefix.as_deref(),
                        config.state.region.as_deref(),
                    )
                    .await?,
                )
            }
        };
        debug!("Using {} state backend", store.backend_type());

        Ok(Self {
            config,
            store,
            state_dir,
        })
    }

    /// Builds the provider registry.
    ///
    /// Uses the HTTP provider when an endpoint is configured, otherwise the
    /// simulated provider persisted next to local state.
    async fn registry(&self) -> Result<ProviderRegistry> {
        if std::env::var(PROVIDER_URL_VAR).is_ok() {
            let url = ConfigParser::get_provider_url()?;
            info!("Using provider at {url}");
            let provider = HttpProvider::with_timeout(
                &url,
                ConfigParser::get_provider_token(),
                self.config.orchestration.operation_timeout_secs,
            )?;
            return Ok(ProviderRegistry::single(Arc::new(provider)));
        }

        warn!("{PROVIDER_URL_VAR} not set, using the simulated provider");
        let project = &self.config.project;
        let provider = SimulatedProvider::open(
            self.state_dir.join("simulated.json"),
            &project.region,
            project.account.as_deref().unwrap_or(SIMULATED_ACCOUNT),
        )
        .await?;
        Ok(ProviderRegistry::single(Arc::new(provider)))
    }
}

/// Resolves the stack document path.
fn resolve_config_path(config_path: Option<&PathBuf>) -> Result<PathBuf> {
    config_path.map_or_else(|| find_config_file("."), |path| Ok(path.clone()))
}

/// Directory containing the stack document.
fn config_dir(config_file: &Path) -> &Path {
    config_file
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
}

/// Loads, overrides and validates the stack document.
fn load_config(config_file: &Path) -> Result<StackConfig> {
    debug!("Loading stack document from: {}", config_file.display());

    let parser = ConfigParser::new().with_base_path(config_dir(config_file));
    parser.load_dotenv()?;
    let config = parser.load_with_env(config_file)?;

    ConfigValidator::new().validate(&config)?;
    Ok(config)
}

/// Returns a cancellation flag raised on Ctrl-C.
fn cancel_on_interrupt() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling in-flight operations");
            let _ = tx.send(true);
        }
    });
    rx
}

/// Prompts on stderr and checks the answer.
fn confirm(prompt: &str, accept: impl Fn(&str) -> bool) -> Result<bool> {
    eprint!("{prompt}");
    std::io::stderr().flush()?;

    let mut input = String::new();
    std::io::stdin().read_line(&mut input)?;
    Ok(accept(input.trim()))
}

/// Prints a pass report and fails unless the stack settled.
fn finish_report(report: &OrchestrationReport, formatter: &OutputFormatter) -> Result<()> {
    emit(&formatter.format_report(report))?;
    if report.is_settled() {
        return Ok(());
    }

    let execution = &report.execution;
    let error = if execution.cancelled() > 0 {
        OrchestrateError::Cancelled {
            reason: format!("{} operation(s) did not run", execution.cancelled()),
        }
    } else {
        OrchestrateError::PassFailed {
            failed: execution.failed(),
            blocked: execution.blocked(),
        }
    };
    Err(error.into())
}

/// Writes command output to stdout.
fn emit(output: &str) -> Result<()> {
    let mut stdout = std::io::stdout().lock();
    writeln!(stdout, "{output}")?;
    Ok(())
}
