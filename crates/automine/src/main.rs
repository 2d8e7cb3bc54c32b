//! AutoMine operator CLI.
//!
//! Commands:
//! - start: run a fleet of simulated agents against one quarry
//! - recall: broadcast a recall (or all-clear) to a running fleet
//! - configure: interactive wizard writing `config.<quarryId>`

use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use anyhow::Result;
use chrono::Local;
use clap::{Parser, Subcommand};
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

use automine::{FleetConfig, FleetRunner, SimConfig};
use quarry_kernel::{Message, MineError, QuarryConfig, StateStore, UdpBus};

/// Generate a timestamped output path from the given path.
/// e.g. "report.json" -> "report-20260802-010530.json"
fn timestamped_path(path: &Path) -> PathBuf {
    let timestamp = Local::now().format("%Y%m%d-%H%M%S");
    let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("report");
    let ext = path.extension().and_then(|s| s.to_str()).unwrap_or("json");
    let parent = path.parent().unwrap_or(Path::new("."));
    parent.join(format!("{stem}-{timestamp}.{ext}"))
}

#[derive(Parser)]
#[command(name = "automine")]
#[command(version)]
#[command(about = "Cooperative quarry-mining fleet coordinator")]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Directory holding per-agent stores and the quarry configuration
    #[arg(long, default_value = "./quarry-data")]
    data_dir: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a fleet of agents in the simulated quarry
    Start {
        /// Quarry to work (must match a config, or one is created)
        #[arg(long, default_value = "quarry-1")]
        quarry: String,

        /// Number of agents
        #[arg(long, default_value = "3")]
        agents: u32,

        /// Tick budget per agent
        #[arg(long, default_value = "100000")]
        max_ticks: u64,

        /// World generation seed
        #[arg(long, default_value = "0")]
        seed: u64,

        /// Ore veins scattered through the rock
        #[arg(long, default_value = "8")]
        ore_veins: usize,

        /// Starting fuel per agent
        #[arg(long, default_value = "10000")]
        fuel: u64,

        /// Output file for the run report
        #[arg(long, default_value = "report.json")]
        report: PathBuf,

        /// Listen for operator datagrams (recall, config updates) on this
        /// UDP port
        #[arg(long)]
        udp_port: Option<u16>,
    },

    /// Broadcast a recall to a running fleet
    Recall {
        /// Quarry to recall
        quarry: String,

        /// UDP port the fleet listens on
        #[arg(long, default_value = "7700")]
        port: u16,

        /// Clear the recall instead of raising it
        #[arg(long)]
        clear: bool,
    },

    /// Interactively write a quarry configuration
    Configure {
        /// Announce the new configuration to a fleet on this UDP port
        #[arg(long)]
        port: Option<u16>,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .compact()
        .init();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "automine failed");
            // Unrecoverable journal corruption gets its own exit code so
            // supervisors can tell it apart from transient failures.
            if e.downcast_ref::<MineError>()
                .map(|m| matches!(m, MineError::JournalCorrupt(_)))
                .unwrap_or(false)
            {
                ExitCode::from(2)
            } else {
                ExitCode::FAILURE
            }
        }
    }
}

#[tokio::main]
async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Start {
            quarry,
            agents,
            max_ticks,
            seed,
            ore_veins,
            fuel,
            report,
            udp_port,
        } => {
            let store = StateStore::open(&cli.data_dir, &quarry)?;
            let quarry_config = match store.load_config()? {
                Some(config) => config,
                None => {
                    info!(quarry = %quarry, "No configuration found; using defaults");
                    let config = QuarryConfig {
                        quarry_id: quarry.clone(),
                        ..QuarryConfig::default()
                    };
                    store.save_config(&config)?;
                    config
                }
            };

            let mut fleet = FleetConfig::new(quarry_config, agents, cli.data_dir.clone());
            fleet.max_ticks = max_ticks;
            fleet.udp_port = udp_port;
            fleet.sim = SimConfig {
                seed,
                initial_fuel: fuel,
                ore_veins,
                ..SimConfig::default()
            };

            let outcome = FleetRunner::new(fleet).run().await?;
            let report_path = timestamped_path(&report);
            outcome.save(&report_path)?;

            println!("\n=== Fleet Run Complete ===");
            println!("Quarry: {}", outcome.quarry_id);
            println!(
                "Tunnels: {}/{} done",
                outcome.tunnels_done, outcome.tunnels_total
            );
            println!("Blocks mined: {}", outcome.blocks_mined());
            for agent in &outcome.agents {
                println!(
                    "  agent-{}: {} ticks, {} blocks, {} ore, status {}",
                    agent.id,
                    agent.ticks,
                    agent.metrics.blocks_mined,
                    agent.metrics.ore_blocks_mined,
                    agent.status
                );
            }
            println!("Report saved to: {}", report_path.display());
        }

        Commands::Recall {
            quarry,
            port,
            clear,
        } => {
            let mut bus = UdpBus::operator(&quarry, port).await?;
            bus.send(None, Message::Recall { active: !clear }).await?;
            if clear {
                println!("Recall cleared for {quarry} on UDP port {port}");
            } else {
                println!("Recall broadcast for {quarry} on UDP port {port}");
            }
        }

        Commands::Configure { port } => {
            let stdin = std::io::stdin();
            let mut input = BufReader::new(stdin.lock());
            let mut output = std::io::stdout();
            let config = automine::wizard::run(&mut input, &mut output, &cli.data_dir)?;

            if let Some(port) = port {
                let mut bus = UdpBus::operator(&config.quarry_id, port).await?;
                bus.send(None, Message::ConfigUpdate { config: config.clone() })
                    .await?;
                println!(
                    "Announced config v{} for {} on UDP port {port}",
                    config.config_version, config.quarry_id
                );
            }
        }
    }
    // Give any in-flight datagrams a moment before the socket drops.
    tokio::time::sleep(Duration::from_millis(20)).await;
    Ok(())
}
