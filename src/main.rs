use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand, ValueEnum};

use stresswarden::config::StresswardenConfig;
use stresswarden::engine::local::LocalEngine;
use stresswarden::engine::ExecutionEngine;
use stresswarden::model::{
    Intensity, SafetyConfirmation, SessionMetrics, TestConfiguration, TestKind, TestSession,
};
use stresswarden::storage::{KvStore, MemoryStore, Persistence, SqliteStore};
use stresswarden::Orchestrator;

#[derive(Parser)]
#[command(
    name = "stresswarden",
    about = "Safety-gated network stress testing for networks you own",
    version,
    long_about = None
)]
struct Cli {
    /// Path to a TOML config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log filter, e.g. "debug" or "stresswarden=trace"
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Keep history and consent in memory only
    #[arg(long, global = true)]
    ephemeral: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Record the operator's safety acknowledgements
    ConfirmSafety {
        /// I own or administer the target network
        #[arg(long)]
        owns_target_network: bool,

        /// I am authorized to load-test the target
        #[arg(long)]
        has_authorization: bool,

        /// I understand the test may degrade the network
        #[arg(long)]
        understands_impact: bool,

        /// I accept the enforced rate and duration limits
        #[arg(long)]
        accepts_limits: bool,

        /// I will monitor the test while it runs
        #[arg(long)]
        will_monitor: bool,
    },

    /// Check a target and duration against the safety policy
    Validate {
        /// Target IPv4 address
        #[arg(long)]
        target: String,

        /// Test duration in seconds
        #[arg(long, default_value = "30", allow_negative_numbers = true)]
        duration: i64,
    },

    /// Run a stress test against the local engine (Ctrl-C aborts)
    Run {
        /// Target IPv4 address
        #[arg(long)]
        target: String,

        /// Kind of load to generate
        #[arg(long, value_enum, default_value = "latency")]
        kind: KindArg,

        /// Packet rate level
        #[arg(long, value_enum, default_value = "low")]
        intensity: IntensityArg,

        /// Test duration in seconds
        #[arg(long, default_value = "30", allow_negative_numbers = true)]
        duration: i64,

        /// Give every safety acknowledgement for this run
        #[arg(long)]
        confirm: bool,

        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },

    /// Show finished tests, most recent first
    History {
        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,

        /// Maximum number of entries
        #[arg(long)]
        limit: Option<usize>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum KindArg {
    PingFlood,
    Bandwidth,
    Latency,
    PacketLoss,
}

impl From<KindArg> for TestKind {
    fn from(arg: KindArg) -> Self {
        match arg {
            KindArg::PingFlood => TestKind::PingFlood,
            KindArg::Bandwidth => TestKind::BandwidthTest,
            KindArg::Latency => TestKind::LatencyTest,
            KindArg::PacketLoss => TestKind::PacketLoss,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum IntensityArg {
    Low,
    Medium,
    High,
}

impl From<IntensityArg> for Intensity {
    fn from(arg: IntensityArg) -> Self {
        match arg {
            IntensityArg::Low => Intensity::Low,
            IntensityArg::Medium => Intensity::Medium,
            IntensityArg::High => Intensity::High,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => StresswardenConfig::load(path)?,
        None => StresswardenConfig::load_or_default(),
    };
    stresswarden::logging::init(cli.log_level.as_deref(), &config.logging)?;

    let kv: Arc<dyn KvStore> = if cli.ephemeral {
        Arc::new(MemoryStore::default())
    } else {
        Arc::new(SqliteStore::open(&config.storage.path)?)
    };

    match cli.command {
        Commands::ConfirmSafety {
            owns_target_network,
            has_authorization,
            understands_impact,
            accepts_limits,
            will_monitor,
        } => {
            let confirmation = SafetyConfirmation {
                owns_target_network,
                has_authorization,
                understands_impact,
                accepts_limits,
                will_monitor,
            };
            let engine = Arc::new(LocalEngine::new(config.engine.clone()));
            let orch = Orchestrator::new(engine, &config, kv).await;
            let outcome = orch.confirm_safety(confirmation).await;
            orch.shutdown();
            match outcome {
                Ok(()) => println!("Safety confirmation recorded."),
                Err(e) => bail!("{}", e.message),
            }
        }
        Commands::Validate { target, duration } => {
            let test = TestConfiguration {
                target_ip: target,
                test_type: TestKind::LatencyTest,
                intensity: Intensity::Low,
                duration_seconds: duration,
            };
            let violations = stresswarden::safety::validate(&test);
            if violations.is_empty() {
                let engine = LocalEngine::new(config.engine.clone());
                let accepted = engine.validate_target(&test.target_ip).await.unwrap_or(false);
                println!("OK: {} for {}s", test.target_ip, test.duration_seconds);
                if !accepted {
                    bail!("engine refused target {}", test.target_ip);
                }
            } else {
                for v in &violations {
                    println!("- {}", v);
                }
                bail!("configuration rejected ({} violation(s))", violations.len());
            }
        }
        Commands::Run {
            target,
            kind,
            intensity,
            duration,
            confirm,
            json,
        } => {
            let test = TestConfiguration {
                target_ip: target,
                test_type: kind.into(),
                intensity: intensity.into(),
                duration_seconds: duration,
            };
            let engine: Arc<dyn ExecutionEngine> =
                Arc::new(LocalEngine::new(config.engine.clone()));
            let orch = Orchestrator::new(engine, &config, kv).await;
            let outcome = run_test(&orch, test, confirm, json).await;
            orch.shutdown();
            outcome?;
        }
        Commands::History { json, limit } => {
            let history = Persistence::new(kv).load_history();
            let shown: Vec<&TestSession> = history.iter().take(limit.unwrap_or(usize::MAX)).collect();
            if json {
                println!("{}", serde_json::to_string_pretty(&shown)?);
            } else if shown.is_empty() {
                println!("No tests recorded.");
            } else {
                println!(
                    "{:<36} | {:<15} | {:<11} | {:<9} | {:>8} | {:>6}",
                    "Test ID", "Target", "Kind", "Status", "Duration", "Loss %"
                );
                println!("{:-<36}-|-{:-<15}-|-{:-<11}-|-{:-<9}-|-{:-<8}-|-{:-<6}", "", "", "", "", "", "");
                for s in shown {
                    let loss = s
                        .final_metrics
                        .as_ref()
                        .map(|m| format!("{:.1}", m.packet_loss_percentage))
                        .unwrap_or_else(|| "-".into());
                    println!(
                        "{:<36} | {:<15} | {:<11} | {:<9} | {:>7}s | {:>6}",
                        s.test_id,
                        s.target_ip,
                        s.test_type.to_string(),
                        s.status.to_string(),
                        s.duration_seconds,
                        loss
                    );
                }
            }
        }
    }

    Ok(())
}

/// Start a test and follow it until it ends or Ctrl-C aborts it.
async fn run_test(
    orch: &Orchestrator,
    test: TestConfiguration,
    confirm: bool,
    json: bool,
) -> Result<()> {
    // 1. Consent and start
    if confirm {
        orch.confirm_safety(SafetyConfirmation::all()).await?;
    }
    let session = orch.start_test(test).await?;
    if !json {
        println!(
            "Started {} against {} ({}s). Ctrl-C to abort.",
            session.test_id, session.target_ip, session.duration_seconds
        );
    }

    // 2. Follow pushed state, polling as a fallback
    let mut updates = orch.subscribe();
    let mut poll = tokio::time::interval(Duration::from_secs(1));
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                orch.emergency_stop().await;
                if !json {
                    println!("\nAborted.");
                }
                break;
            }
            changed = updates.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = updates.borrow_and_update().clone();
                if !json {
                    print_metrics(&state.metrics);
                }
                if state.status.is_terminal() {
                    break;
                }
            }
            _ = poll.tick() => {
                if let Err(e) = orch.refresh_status().await {
                    tracing::warn!(error = %e, "status refresh failed");
                }
            }
        }
    }

    // 3. Report
    let state = orch.state();
    let finished = state
        .history
        .first()
        .filter(|s| s.test_id == session.test_id);
    if json {
        println!("{}", serde_json::to_string_pretty(&finished)?);
    } else if let Some(s) = finished {
        println!("\n=== {} {} ===", s.test_id, s.status);
        if let Some(m) = &s.final_metrics {
            print_metrics(m);
            println!();
        }
        if let Some(err) = &s.error_message {
            println!("Error: {}", err);
        }
    }
    Ok(())
}

fn print_metrics(m: &SessionMetrics) {
    println!(
        "sent {:>6}  recv {:>6}  loss {:>5.1}%  latency {:>7.2} ms  jitter {:>6.2} ms  {:>7.3} Mbps",
        m.packets_sent,
        m.packets_received,
        m.packet_loss_percentage,
        m.latency_ms,
        m.jitter_ms,
        m.throughput_mbps
    );
}
