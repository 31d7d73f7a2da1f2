mod clock;
mod engine;
mod error;
mod interval;
mod lock;
mod mist_config;
mod mode;
mod relay;
mod resolver;
mod run_state;
mod settings;
mod shutdown;
mod temperature;

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Mutex;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::EnvFilter;

use clock::SystemClock;
use engine::{DecisionEngine, RunContext};
use lock::{LockError, ProcessLock};
use relay::RelayBoard;
use resolver::{ConfigCache, ConfigResolver, HttpConfigProvider};
use run_state::FileRunState;
use settings::{SensorKind, Settings};
use temperature::{source_from_settings, RetryPolicy, TemperatureReader, TemperatureSource};

/// Decide whether to run the mist cooler right now, and run it if so.
#[derive(Parser, Debug)]
#[command(name = "mist-cooler", version)]
struct Cli {
    /// Station settings file.
    #[arg(short, long, env = "CONFIG_PATH", default_value = "mist-cooler.toml")]
    config: PathBuf,

    /// Read temperature from the on-board sensor.
    #[arg(short = 't', long = "builtin", conflicts_with = "external")]
    builtin: bool,

    /// Read temperature through the external helper program.
    #[arg(short = 'a', long = "external")]
    external: bool,

    /// Fetch and validate the remote config, print it, and exit.
    #[arg(long)]
    check_config: bool,
}

impl Cli {
    fn sensor_override(&self) -> Option<SensorKind> {
        match (self.builtin, self.external) {
            (true, _) => Some(SensorKind::Builtin),
            (_, true) => Some(SensorKind::External),
            _ => None,
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut settings = match settings::load(&cli.config) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("error: {e:#}");
            return ExitCode::FAILURE;
        }
    };
    if let Some(kind) = cli.sensor_override() {
        settings.sensor.kind = kind;
    }

    init_logging(settings.log_file.as_deref());

    let resolver = match build_resolver(&settings) {
        Ok(r) => r,
        Err(e) => {
            error!("{e:#}");
            return ExitCode::FAILURE;
        }
    };

    if cli.check_config {
        return check_config(&resolver).await;
    }

    run(&settings, &resolver).await
}

// ── Logging ─────────────────────────────────────────────────────────

fn init_logging(log_file: Option<&Path>) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let file = log_file.map(|path| {
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| (path, e))
    });

    match file {
        Some(Ok(f)) => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_ansi(false)
            .with_writer(BoxMakeWriter::new(Mutex::new(f)))
            .init(),
        other => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(BoxMakeWriter::new(std::io::stderr))
                .init();
            if let Some(Err((path, e))) = other {
                warn!(path = %path.display(), "cannot open log file, logging to stderr: {e}");
            }
        }
    }
}

// ── Wiring ──────────────────────────────────────────────────────────

fn build_resolver(settings: &Settings) -> Result<ConfigResolver> {
    let provider = HttpConfigProvider::new(settings).context("failed to build config client")?;
    let cache = ConfigCache::new(&settings.paths.config_cache, settings.cache_ttl());
    Ok(ConfigResolver::new(Box::new(provider), cache))
}

async fn check_config(resolver: &ConfigResolver) -> ExitCode {
    let config = match resolver.resolve().await {
        Ok(c) => c,
        Err(e) => {
            error!("{e}");
            return e.exit_code();
        }
    };

    let report = serde_json::json!({
        "mode": mode::classify(&config),
        "interval_sec": config.interval_sec(),
        "config": config,
    });
    match serde_json::to_string_pretty(&report) {
        Ok(text) => {
            println!("{text}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("cannot render config: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Take the run lock. The error is the exit status: 0 when another run
/// holds the lock, 1 when the lock file is unusable.
fn acquire_lock(path: &Path) -> Result<ProcessLock, u8> {
    ProcessLock::acquire(path).map_err(|e| match e {
        LockError::AlreadyRunning(path) => {
            info!(lock = %path.display(), "another run is in progress, exiting");
            0
        }
        other => {
            error!("{other}");
            1
        }
    })
}

async fn run(settings: &Settings, resolver: &ConfigResolver) -> ExitCode {
    let _lock = match acquire_lock(&settings.paths.lock_file) {
        Ok(lock) => lock,
        Err(status) => return ExitCode::from(status),
    };

    let (trigger, shutdown) = shutdown::channel();
    shutdown::listen_for_signals(trigger);

    let source = match source_from_settings(&settings.sensor) {
        Ok(s) => s,
        Err(e) => {
            error!("temperature source unavailable: {e:#}");
            return ExitCode::FAILURE;
        }
    };
    info!(source = source.name(), "temperature source selected");
    let reader = TemperatureReader::new(
        source,
        RetryPolicy::from(&settings.sensor),
        shutdown.clone(),
    );

    let mut board = RelayBoard::new(settings.relay_active_low);
    let run_state = FileRunState::new(&settings.paths.run_state);
    let clock = SystemClock;
    let ctx = RunContext {
        clock: &clock,
        run_state: &run_state,
        shutdown,
        relay_gpios: settings.relay_pins(),
    };

    match DecisionEngine::new(ctx, resolver, &reader, &mut board).run().await {
        Ok(outcome) => {
            info!(?outcome, "run complete");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("{e}");
            e.exit_code()
        }
    }
}
