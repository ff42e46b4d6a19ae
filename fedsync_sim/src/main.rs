//! fedsync Simulator CLI
//!
//! Runs the built-in federation scenarios, or a federation described by a
//! configuration file with echo participants standing in for its federates.

use anyhow::Context;
use clap::Parser;
use fedsync_core::{ControlAction, FederationConfig, FederationManagerState};
use fedsync_sim::scenarios::ScenarioId;
use fedsync_sim::{ScenarioResult, ScenarioRunner, SimFederation, SimManager};
use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// fedsync deterministic federation simulator
#[derive(Parser, Debug)]
#[command(name = "fedsync-sim")]
#[command(about = "Run federation scenarios or a configured federation", long_about = None)]
struct Args {
    /// Run seed; 0 takes one from the clock
    #[arg(short, long, default_value = "42")]
    seed: u64,

    /// Scenario to run (lockstep, probabilistic_branching, late_joiner,
    /// pause_resume, coa_termination, flaky_service, all)
    #[arg(short = 'S', long, default_value = "all")]
    scenario: String,

    /// Repeat every scenario over this many consecutive seeds
    #[arg(long, default_value = "1")]
    seeds: usize,

    /// Federation configuration file; runs that federation instead of the
    /// scenarios
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Print the summary as JSON
    #[arg(long)]
    json: bool,
}

fn main() {
    let args = Args::parse();

    // RUST_LOG wins over --verbose
    let level = if args.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
    if let Err(err) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set tracing subscriber: {}", err);
    }

    let passed = match &args.config {
        Some(path) => run_configured(path, args.json).unwrap_or_else(|err| {
            error!("{:#}", err);
            false
        }),
        None => run_scenarios(&args),
    };

    // Non-zero exit marks a failed run
    if !passed {
        std::process::exit(1);
    }
}

fn run_scenarios(args: &Args) -> bool {
    if !args.json {
        info!("fedsync simulator v{}", env!("CARGO_PKG_VERSION"));
        info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    }

    let scenarios: Vec<ScenarioId> = if args.scenario == "all" {
        ScenarioId::all()
    } else {
        match args.scenario.parse() {
            Ok(scenario) => vec![scenario],
            Err(e) => {
                eprintln!("Error: {}", e);
                let names: Vec<&str> = ScenarioId::all().iter().map(ScenarioId::name).collect();
                eprintln!("Available scenarios: {}, all", names.join(", "));
                return false;
            }
        }
    };

    // Seed 0 picks one from the clock
    let base_seed = if args.seed == 0 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(1)
    } else {
        args.seed
    };

    let mut all_results: Vec<ScenarioResult> = Vec::new();
    for seed_offset in 0..args.seeds {
        let seed = base_seed.wrapping_add(seed_offset as u64);
        let runner = ScenarioRunner::new(seed);

        for scenario in &scenarios {
            let result = runner.run(*scenario);
            if !args.json {
                if result.passed {
                    info!("✓ {} (seed={}) PASSED", scenario.name(), seed);
                } else {
                    error!(
                        "✗ {} (seed={}) FAILED: {}",
                        scenario.name(),
                        seed,
                        result.failure_reason.as_deref().unwrap_or("unknown")
                    );
                }
            }
            all_results.push(result);
        }
    }

    let total = all_results.len();
    let failed: Vec<&ScenarioResult> = all_results.iter().filter(|r| !r.passed).collect();

    if args.json {
        let summary = serde_json::json!({
            "total": total,
            "passed": total - failed.len(),
            "failed": failed.len(),
            "results": &all_results,
        });
        match serde_json::to_string_pretty(&summary) {
            Ok(text) => println!("{}", text),
            Err(err) => eprintln!("Failed to encode summary: {}", err),
        }
    } else {
        info!("");
        info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
        if failed.is_empty() {
            info!("✅ All {} scenario runs passed!", total);
        } else {
            error!("❌ {}/{} scenario runs failed!", failed.len(), total);
            for result in &failed {
                error!(
                    "  - {} seed={}: {}",
                    result.scenario.name(),
                    result.seed,
                    result.failure_reason.as_deref().unwrap_or("unknown")
                );
            }
        }
    }

    failed.is_empty()
}

/// Runs the federation described by `path` in real time.
fn run_configured(path: &Path, json: bool) -> anyhow::Result<bool> {
    let config = FederationConfig::from_file(path)
        .with_context(|| format!("invalid federation configuration {}", path.display()))?;
    let experiment = config
        .load_experiment()
        .context("invalid experiment configuration")?;
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start runtime")?;

    let passed = runtime.block_on(async move {
        let auto_start = config.auto_start;
        let late_joiners: Vec<String> = experiment
            .late_joiner_federates
            .iter()
            .flat_map(|e| std::iter::repeat(e.federate_type.clone()).take(e.count))
            .collect();

        let mut world = SimFederation::new(config.seed, config, experiment)
            .context("failed to create federation")?;
        world.spawn_expected();

        let manager = world.manager().clone();
        tokio::spawn(read_commands(manager.clone()));
        if auto_start {
            manager.control(ControlAction::Start);
        } else {
            info!("Waiting for START on stdin");
        }

        // Late joiners arrive once the federation is under way
        let mut state = manager.subscribe_state();
        let running = state
            .wait_for(|s| s.is_stepping() || s.is_shutting_down())
            .await
            .is_ok_and(|s| s.is_stepping());
        if running {
            for federate_type in &late_joiners {
                world.spawn_participant(federate_type, true);
            }
        }

        let reports = world.finish().await;
        let failed = reports.iter().filter(|r| r.error.is_some()).count();
        if json {
            let summary = serde_json::json!({
                "federation": manager.config().federation_name,
                "steps": manager.steps_executed(),
                "final_time": manager.current_time(),
                "participants": reports.len(),
                "failed_participants": failed,
            });
            println!("{}", summary);
        } else {
            info!(
                federation = %manager.config().federation_name,
                steps = manager.steps_executed(),
                final_time = manager.current_time(),
                participants = reports.len(),
                failed,
                "Federation finished"
            );
        }
        anyhow::Ok(failed == 0)
    });

    // The stdin reader may still be blocked on a read
    runtime.shutdown_background();
    passed
}

/// Applies `start | pause | resume | terminate | status` lines from stdin.
async fn read_commands(manager: SimManager) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    info!("Commands: start | pause | resume | terminate | status");

    while let Ok(Some(line)) = lines.next_line().await {
        let command = line.trim();
        if command.is_empty() {
            continue;
        }
        if command.eq_ignore_ascii_case("status") {
            info!(
                state = %manager.state(),
                time = manager.current_time(),
                steps = manager.steps_executed(),
                waiting_for = manager.expected_left_to_join(),
                "Status"
            );
            continue;
        }

        match command.parse::<ControlAction>() {
            Ok(action) => {
                let response = manager.control(action);
                if response.is_accepted() {
                    info!(from = %response.previous_state, to = %response.new_state, "Command accepted");
                } else {
                    warn!(message = response.message.as_deref().unwrap_or(""), "Command rejected");
                }
            }
            Err(err) => warn!(%err, "Unknown command"),
        }

        if manager.state() == FederationManagerState::Terminated {
            break;
        }
    }
}
