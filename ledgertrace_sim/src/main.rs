//! LedgerTrace Simulator CLI
//!
//! Run deterministic contact-tracing scenarios over a simulated ledger.

use clap::Parser;
use ledgertrace_sim::scenarios::ScenarioId;
use ledgertrace_sim::{ScenarioResult, ScenarioRunner, SimConfig, SimError};
use std::path::Path;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

/// LedgerTrace simulation CLI
#[derive(Parser, Debug)]
#[command(name = "ledgertrace-sim")]
#[command(about = "Run deterministic contact-tracing simulations for LedgerTrace", long_about = None)]
struct Args {
    /// Master seed for determinism (0 = random from time)
    #[arg(short, long)]
    seed: Option<u64>,

    /// Number of agents
    #[arg(short, long)]
    agents: Option<usize>,

    /// Number of diagnosticians
    #[arg(short = 'D', long)]
    diagnosticians: Option<usize>,

    /// Scenario to run (outbreak, flaky_ledger, forgery, all)
    #[arg(short = 'S', long, default_value = "all")]
    scenario: String,

    /// Simulated duration in seconds
    #[arg(short, long)]
    duration: Option<f64>,

    /// JSON file with a SimConfig; flags override its values
    #[arg(short, long)]
    config: Option<String>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    /// JSON output for CI parsing
    #[arg(long)]
    json: bool,
}

fn load_config(args: &Args) -> Result<SimConfig, SimError> {
    let mut config = match &args.config {
        Some(path) => serde_json::from_str(&std::fs::read_to_string(Path::new(path))?)?,
        None => SimConfig::default(),
    };

    if let Some(seed) = args.seed {
        config.seed = if seed == 0 {
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_nanos() as u64)
                .unwrap_or(42)
        } else {
            seed
        };
    }
    if let Some(agents) = args.agents {
        config.num_agents = agents;
    }
    if let Some(diagnosticians) = args.diagnosticians {
        config.num_diagnosticians = diagnosticians;
    }
    if let Some(duration) = args.duration {
        config.max_duration_secs = duration;
    }

    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    // Initialize logging
    let level = if args.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .finish();
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set tracing subscriber: {}", e);
    }

    let config = match load_config(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(2);
        }
    };

    let scenarios: Vec<ScenarioId> = if args.scenario == "all" {
        ScenarioId::all()
    } else {
        match args.scenario.parse() {
            Ok(scenario) => vec![scenario],
            Err(e) => {
                eprintln!("Error: {}", e);
                eprintln!("Available scenarios: outbreak, flaky_ledger, forgery, all");
                std::process::exit(2);
            }
        }
    };

    if !args.json {
        info!("LedgerTrace Simulator v{}", env!("CARGO_PKG_VERSION"));
        info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
        info!(
            "seed={} agents={} diagnosticians={} duration={}s",
            config.seed, config.num_agents, config.num_diagnosticians, config.max_duration_secs
        );
    }

    let runner = ScenarioRunner::from_config(config);
    let mut results: Vec<ScenarioResult> = Vec::new();

    for scenario in scenarios {
        let result = runner.run(scenario).await;

        if !args.json {
            let m = &result.metrics;
            if result.passed {
                info!(
                    "✓ {} (seed={}) PASSED | check-ins={} notified={} quarantined={} infected={}",
                    scenario.name(),
                    result.seed,
                    m.world.check_ins,
                    m.world.notified,
                    m.quarantined,
                    m.infected
                );
            } else {
                error!(
                    "✗ {} (seed={}) FAILED: {}",
                    scenario.name(),
                    result.seed,
                    result.failure_reason.as_deref().unwrap_or("unknown")
                );
            }
        }
        results.push(result);
    }

    let total = results.len();
    let failed = results.iter().filter(|r| !r.passed).count();

    if args.json {
        let summary = serde_json::json!({
            "total": total,
            "passed": total - failed,
            "failed": failed,
            "results": results,
        });
        match serde_json::to_string_pretty(&summary) {
            Ok(text) => println!("{}", text),
            Err(e) => eprintln!("Failed to encode results: {}", e),
        }
    } else {
        info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
        if failed == 0 {
            info!("✅ All {} scenario runs passed!", total);
        } else {
            error!("❌ {}/{} scenario runs failed!", failed, total);
        }
    }

    if failed > 0 {
        std::process::exit(1);
    }
}
