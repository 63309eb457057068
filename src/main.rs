//! Flowguard - loop-proof flow control for content pipelines
//!
//! Command-line front end: runs scripted scenarios through the engine and
//! inspects configuration.

use anyhow::Context;
use clap::{Parser, Subcommand};
use colored::Colorize;
use flowguard::config::ConfigValidator;
use flowguard::flow::RunResult;
use flowguard::scenario::Scenario;
use flowguard::stage::{ContentRequest, StageId, StageTransitionTable};
use flowguard::{CancellationToken, CircuitBreakerRegistry, FlowConfig, FlowEngine};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "flowguard")]
#[command(version)]
#[command(about = "Bounded, loop-proof flow control for content pipelines", long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Project directory (defaults to current directory)
    #[arg(short, long, global = true, default_value = ".")]
    project: PathBuf,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a content request through the flow
    Run {
        /// Scenario file describing the request and scripted stage behavior
        #[arg(short, long, value_name = "FILE")]
        scenario: Option<PathBuf>,

        /// Topic for an all-pass run (ignored when --scenario is given)
        #[arg(short, long, default_value = "untitled")]
        topic: String,

        /// Mark the content as self-authored (skips research)
        #[arg(long)]
        original: bool,

        /// Skip the research stage
        #[arg(long)]
        skip_research: bool,

        /// Number of concurrent runs sharing one breaker registry
        #[arg(long, default_value = "1")]
        runs: u32,

        /// Configuration file (JSON or TOML) overriding project settings
        #[arg(short, long, value_name = "FILE")]
        config: Option<PathBuf>,

        /// Write the run results as JSON to this file
        #[arg(short, long, value_name = "FILE")]
        output: Option<PathBuf>,

        /// Print run results as JSON instead of a summary
        #[arg(long)]
        json: bool,
    },

    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Print the stage transition table
    Transitions,
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show current configuration
    Show {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Validate configuration
    Validate,

    /// Show configuration file paths
    Paths,
}

fn init_tracing(verbose: bool, json: bool) {
    let default_filter = if verbose {
        "flowguard=debug,info"
    } else {
        "flowguard=info,warn"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

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

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.json_logs);

    // Resolve project path
    let project_path = cli.project.canonicalize().unwrap_or(cli.project.clone());

    if !project_path.exists() {
        eprintln!(
            "{} Project directory does not exist: {}",
            "Error:".red().bold(),
            project_path.display()
        );
        std::process::exit(1);
    }

    match cli.command {
        Commands::Run {
            scenario,
            topic,
            original,
            skip_research,
            runs,
            config,
            output,
            json,
        } => {
            let config = match config {
                Some(path) => FlowConfig::from_file(&path)?,
                None => FlowConfig::load(&project_path)?,
            };
            let report = ConfigValidator::new().validate(&config);
            if !report.is_valid() {
                eprintln!("{}", report.verbose_report());
                std::process::exit(report.exit_code());
            }

            let scenario = match scenario {
                Some(path) => Scenario::from_file(&path)?,
                None => {
                    let mut request = ContentRequest::new(topic);
                    if original {
                        request = request.original();
                    }
                    request.skip_research = skip_research;
                    Scenario::happy_path(request)
                }
            };

            let results = run_scenario(config, &scenario, runs.max(1)).await?;

            if let Some(path) = output {
                write_results(&path, &results)?;
                info!(path = %path.display(), "Run results written");
            }

            if json {
                println!("{}", results_json(&results)?);
            } else {
                for result in &results {
                    print_result(result);
                }
            }

            let code = results
                .iter()
                .map(RunResult::exit_code)
                .find(|code| *code != 0)
                .unwrap_or(0);
            if code != 0 {
                std::process::exit(code);
            }
        }

        Commands::Config { action } => match action {
            ConfigAction::Show { json } => {
                let config = FlowConfig::load(&project_path)?;

                if json {
                    println!("{}", serde_json::to_string_pretty(&config)?);
                } else {
                    println!("\n{} Flow Configuration", "Config:".cyan().bold());
                    println!("{}", "─".repeat(40));
                    println!(
                        "   Breaker: {} failures, {}s recovery",
                        config.failure_threshold, config.recovery_timeout_secs
                    );
                    println!("   Default max retries: {}", config.default_max_retries);
                    for (operation, max) in &config.max_retries {
                        println!("     {}: {}", operation, max);
                    }
                    println!(
                        "   Backoff: {}ms base, {}ms cap, jitter {}",
                        config.retry_base_delay_ms, config.retry_max_delay_ms, config.retry_jitter
                    );
                    println!(
                        "   Execution limits: generation {}, validation {}, default {}",
                        config.generation_max_executions,
                        config.validation_max_executions,
                        config.default_max_executions
                    );
                    for (operation, max) in &config.max_executions {
                        println!("     {}: {}", operation, max);
                    }
                    println!(
                        "   Cycle detection: {} repeats, patterns up to {}, path of {}",
                        config.max_repeats, config.max_pattern_len, config.path_capacity
                    );
                    println!("   Max total duration: {}s", config.max_total_duration_secs);
                    println!(
                        "   History: cap {}, keep {} recent",
                        config.history_cap, config.history_keep_recent
                    );
                    println!(
                        "   Timeouts: stage {}s, review {}s",
                        config.stage_timeout_secs, config.review_timeout_secs
                    );
                }
            }

            ConfigAction::Validate => {
                let settings_path = FlowConfig::settings_path(&project_path);
                if settings_path.exists() {
                    println!("{} settings.json found", "OK".green());
                } else {
                    println!(
                        "{} settings.json not found (using defaults)",
                        "Info:".blue()
                    );
                }

                let config = match FlowConfig::load(&project_path) {
                    Ok(config) => config,
                    Err(e) => {
                        eprintln!("{} {:#}", "Error:".red(), e);
                        std::process::exit(1);
                    }
                };

                let report = ConfigValidator::new().validate(&config);
                for warning in &report.warnings {
                    println!("{} {}", "Warning:".yellow(), warning);
                }
                for error in &report.errors {
                    eprintln!("{} {}", "Error:".red(), error);
                }
                if report.is_valid() {
                    println!("{} {}", "OK".green(), report.summary());
                } else {
                    std::process::exit(report.exit_code());
                }
            }

            ConfigAction::Paths => {
                println!("\n{} Configuration Paths", "Config:".cyan().bold());
                println!("{}", "─".repeat(40));
                println!(
                    "   Project settings: {}",
                    FlowConfig::settings_path(&project_path).display()
                );
                match FlowConfig::user_settings_path() {
                    Some(path) => println!("   User settings: {}", path.display()),
                    None => println!("   User settings: (no config directory)"),
                }
            }
        },

        Commands::Transitions => {
            let table = StageTransitionTable::standard();
            println!("\n{} Stage Transitions", "Flow:".cyan().bold());
            println!("{}", "─".repeat(40));
            for from in StageId::ALL {
                let targets: Vec<String> = table
                    .successors(from)
                    .iter()
                    .map(ToString::to_string)
                    .collect();
                let targets = if targets.is_empty() {
                    "(terminal)".dimmed().to_string()
                } else {
                    targets.join(", ")
                };
                println!("   {:<16} -> {}", from.to_string(), targets);
            }
        }
    }

    Ok(())
}

/// Run `runs` copies of a scenario concurrently.
///
/// Each run gets its own scripted agents; all of them share one breaker
/// registry and one cancellation token wired to Ctrl-C.
async fn run_scenario(
    config: FlowConfig,
    scenario: &Scenario,
    runs: u32,
) -> anyhow::Result<Vec<RunResult>> {
    let registry = CircuitBreakerRegistry::shared(config.breaker_config());
    let cancel = CancellationToken::new();

    let engines = (0..runs)
        .map(|_| {
            FlowEngine::builder(config.clone())
                .all_stages(Arc::new(scenario.stage_mock()))
                .reviewer(Arc::new(scenario.reviewer()))
                .breakers(Arc::clone(&registry))
                .cancellation(cancel.clone())
                .build()
        })
        .collect::<Result<Vec<_>, _>>()
        .context("Failed to build flow engine")?;

    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling runs");
            interrupt.cancel();
        }
    });

    let runs = engines
        .iter()
        .map(|engine| engine.run(scenario.request.clone()));
    Ok(futures::future::join_all(runs).await)
}

/// A single run serializes as an object, several as an array.
fn results_json(results: &[RunResult]) -> serde_json::Result<String> {
    match results {
        [single] => serde_json::to_string_pretty(single),
        many => serde_json::to_string_pretty(many),
    }
}

fn write_results(path: &Path, results: &[RunResult]) -> anyhow::Result<()> {
    std::fs::write(path, results_json(results)?)
        .with_context(|| format!("Failed to write results to {}", path.display()))
}

fn print_result(result: &RunResult) {
    let status = if result.is_completed() {
        "Completed".green().bold()
    } else {
        "Failed".red().bold()
    };
    let summary = result.summary();

    println!("\n{} {} ({})", status, summary.topic, summary.run_id);
    println!("{}", "─".repeat(40));
    if let Some(reason) = &summary.reason {
        println!("   {} {}", "Reason:".yellow(), reason);
    }
    println!("   Transitions: {}", summary.transitions);
    println!("   Retries: {}", summary.retries);
    println!("   Circuit openings: {}", summary.circuit_openings);
    println!("   Elapsed: {}ms", summary.elapsed_ms);
    for (operation, count) in &summary.executions {
        println!("   {:<10} {} execution(s)", operation, count);
    }
}
