//! ConformQ - Black-box wire-conformance testing for MQTT v3.1
//!
//! Usage:
//!   conformq [OPTIONS] <SCENARIO>
//!
//! Runs one named scenario against the configured broker or client
//! under test and exits 0 when every step matched, 1 otherwise. The
//! exit code is the contract consumed by the suite orchestration layer.

use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

use conformq::config::Config;
use conformq::scenario::ScenarioRunner;
use conformq::suite;

/// Log level for CLI
#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogLevel {
    /// Only errors
    Error,
    /// Warnings and errors
    Warn,
    /// Informational messages
    Info,
    /// Debug messages
    Debug,
    /// Trace messages (very verbose)
    Trace,
}

impl LogLevel {
    fn to_tracing_level(self) -> Level {
        match self {
            LogLevel::Error => Level::ERROR,
            LogLevel::Warn => Level::WARN,
            LogLevel::Info => Level::INFO,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Trace => Level::TRACE,
        }
    }
}

/// ConformQ - MQTT v3.1 wire-conformance scenario runner
#[derive(Parser, Debug)]
#[command(name = "conformq")]
#[command(author = "ConformQ Contributors")]
#[command(version = "0.1.0")]
#[command(about = "Black-box wire-conformance testing for MQTT v3.1 brokers and clients")]
struct Args {
    /// Scenario to run (see --list)
    scenario: Option<String>,

    /// List the built-in scenarios and exit
    #[arg(long)]
    list: bool,

    /// Configuration file path (TOML format)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Port override for the peer connection
    #[arg(short, long)]
    port: Option<u16>,

    /// Broker-under-test command override
    #[arg(long)]
    broker_cmd: Option<String>,

    /// Client-under-test command override
    #[arg(long)]
    client_cmd: Option<String>,

    /// Startup delay override in milliseconds
    #[arg(long)]
    startup_delay_ms: Option<u64>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, value_enum)]
    log_level: Option<LogLevel>,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    if args.list {
        for name in suite::SCENARIOS {
            println!("{}", name);
        }
        return;
    }

    // Load configuration file if specified, otherwise use defaults
    let mut config = match &args.config {
        Some(config_path) => match Config::load(config_path) {
            Ok(cfg) => cfg,
            Err(e) => {
                eprintln!("Error loading config file: {}", e);
                std::process::exit(1);
            }
        },
        None => Config::default(),
    };

    // Setup logging - CLI overrides config, config overrides default (warn)
    let log_level = args.log_level.unwrap_or_else(|| {
        match config.log.level.to_lowercase().as_str() {
            "error" => LogLevel::Error,
            "warn" => LogLevel::Warn,
            "info" => LogLevel::Info,
            "debug" => LogLevel::Debug,
            "trace" => LogLevel::Trace,
            _ => LogLevel::Warn,
        }
    });

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level.to_tracing_level())
        .with_target(false)
        .compact()
        .finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Error installing logger: {}", e);
        std::process::exit(1);
    }

    // CLI args override file config
    if let Some(port) = args.port {
        config.target.port = port;
    }
    if let Some(cmd) = args.broker_cmd {
        config.broker.command = cmd;
    }
    if let Some(cmd) = args.client_cmd {
        config.client.command = cmd;
    }
    if let Some(ms) = args.startup_delay_ms {
        config.timing.startup_delay = std::time::Duration::from_millis(ms);
    }

    let Some(name) = args.scenario else {
        eprintln!("No scenario given; use --list to see the built-in scenarios");
        std::process::exit(1);
    };

    let Some(scenario) = suite::build(&name, &config) else {
        eprintln!("Unknown scenario '{}'; use --list to see the built-in scenarios", name);
        std::process::exit(1);
    };

    let outcome = ScenarioRunner::run(scenario).await;

    // Failure output carries the expected-vs-actual summary and any
    // stderr the processes under test produced; success stays silent
    if let Some(failure) = &outcome.failure {
        eprintln!("FAIL: {}: {}", outcome.name, failure);
        for (process, stderr) in &outcome.process_stderr {
            eprintln!("--- {} stderr ---", process);
            eprint!("{}", stderr);
        }
    }

    std::process::exit(outcome.exit_code());
}
