// Runs the LO lock and bias loops against the simulated cartridge.
// Set RUST_LOG=debug to watch each step.
use anyhow::{bail, ensure, Context, Result};
use clap::{Args, Parser, Subcommand};
use lotune::{
    bias::{BiasCurrentServo, BiasServoProcedure},
    config::{BandConfig, Config},
    events::LogSink,
    maximizer::{IfPowerTarget, MaximizeParams, MaximizerProcedure},
    pll::{LockSearchProcedure, PllAdjustProcedure, PllLockController},
    sim::{PllModel, SimulatedFrontEnd},
    worker::{Procedure, TaskOutcome, WorkerTask},
    Band, Polarization,
};
use std::{path::PathBuf, sync::Arc, time::Duration};
use tracing::info;
use tracing_subscriber::EnvFilter;

const TASK_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Parser, Debug)]
#[command(version)]
/// LO lock and bias servo driver, simulated cartridge
struct Cli {
    /// Band configuration file, the built in presets if omitted
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug)]
struct Sim {
    /// Code the simulated PLL locks around
    #[arg(long, default_value_t = 2048)]
    lock_center: u16,
    /// Simulate a lock detector that never reads high
    #[arg(long)]
    broken_detector: bool,
    /// Keep configured settle delays instead of running flat out
    #[arg(long)]
    realtime: bool,
}

#[derive(Args, Debug)]
struct Tune {
    /// LO frequency in GHz
    #[arg(long, conflicts_with = "code")]
    lo: Option<f64>,
    /// Coarse tuning code
    #[arg(long)]
    code: Option<u16>,
    /// Codes either side of the coarse code, band default if omitted
    #[arg(short, long)]
    window: Option<u16>,
    #[arg(short, long)]
    step: Option<u16>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Search for PLL lock
    Lock {
        band: u8,
        #[command(flatten)]
        tune: Tune,
        #[command(flatten)]
        sim: Sim,
    },
    /// Lock, then trim the correction voltage
    Adjust {
        band: u8,
        #[command(flatten)]
        tune: Tune,
        /// Correction voltage target, V
        #[arg(short, long, default_value_t = 0.0)]
        target: f32,
        #[command(flatten)]
        sim: Sim,
    },
    /// Servo a PA drain voltage to a mixer current
    Bias {
        band: u8,
        #[arg(value_parser = clap::value_parser!(u8).range(0..=1))]
        pol: u8,
        /// Mixer current target, uA
        target: f32,
        /// Drain voltage to start from, V
        #[arg(long, default_value_t = 1.0)]
        start: f32,
        #[arg(short, long)]
        verbose: bool,
        #[command(flatten)]
        sim: Sim,
    },
    /// Maximize IF power over a PA drain voltage
    Maximize {
        band: u8,
        #[arg(value_parser = clap::value_parser!(u8).range(0..=1))]
        pol: u8,
        #[arg(long)]
        start: Option<f32>,
        #[arg(long)]
        step: Option<f32>,
        #[command(flatten)]
        sim: Sim,
    },
    /// Validate a TOML band configuration
    CheckConfig { file: PathBuf },
}

fn pol(n: u8) -> Polarization {
    if n == 0 {
        Polarization::Pol0
    } else {
        Polarization::Pol1
    }
}

fn band_config(config: &Config, band: u8, sim: &Sim) -> Result<BandConfig> {
    let b = *config
        .band(Band(band))
        .with_context(|| format!("band {band} is not configured"))?;
    Ok(if sim.realtime { b } else { b.without_delays() })
}

fn front_end(sim: &Sim) -> SimulatedFrontEnd {
    SimulatedFrontEnd::new(PllModel {
        lock_center: sim.lock_center,
        lock_detect_broken: sim.broken_detector,
        ..PllModel::default()
    })
}

fn run<P: Procedure>(task: &mut WorkerTask<P>) -> Result<()> {
    task.start()?;
    let outcome = task
        .wait(TASK_TIMEOUT)
        .with_context(|| format!("waiting for {}", task.name()))?;
    info!("{}: {outcome:?}", task.name());
    ensure!(outcome == TaskOutcome::Succeeded, "{} did not succeed", task.name());
    Ok(())
}

fn lock(
    config: BandConfig,
    tune: &Tune,
    sim: &Sim,
) -> Result<PllLockController<SimulatedFrontEnd>> {
    let controller = PllLockController::new(front_end(sim), config, Arc::new(LogSink))?;
    let coarse = match (tune.lo, tune.code) {
        (Some(lo), _) => controller.map().code_for_lo(&config.lo_chain, lo)?,
        (None, Some(code)) => code,
        (None, None) => bail!("give either --lo or --code"),
    };
    let mut task = WorkerTask::new(
        format!("lock-b{}", config.band),
        LockSearchProcedure {
            controller,
            coarse_code: coarse,
            window_steps: tune.window.unwrap_or(config.lock.window_steps),
            step_size: tune.step.unwrap_or(config.lock.step_size),
            result: None,
        },
    );
    run(&mut task)?;
    let procedure = task.take_procedure().context("lock search procedure lost")?;
    Ok(procedure.controller)
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => Config::load(path).with_context(|| format!("loading {}", path.display()))?,
        None => Config::presets(),
    };

    match cli.command {
        Command::Lock { band, tune, sim } => {
            let controller = lock(band_config(&config, band, &sim)?, &tune, &sim)?;
            println!("locked at code {}", controller.code());
            println!("{:#?}", controller.readings());
        }
        Command::Adjust {
            band,
            tune,
            target,
            sim,
        } => {
            let controller = lock(band_config(&config, band, &sim)?, &tune, &sim)?;
            let mut task = WorkerTask::new(
                format!("adjust-b{band}"),
                PllAdjustProcedure {
                    controller,
                    target_voltage: target,
                    result: None,
                },
            );
            run(&mut task)?;
            let procedure = task.take_procedure().context("adjust procedure lost")?;
            println!("adjusted to code {}", procedure.controller.code());
        }
        Command::Bias {
            band,
            pol: p,
            target,
            start,
            verbose,
            sim,
        } => {
            let b = band_config(&config, band, &sim)?;
            let servo = BiasCurrentServo::new(front_end(&sim), b.band, b.bias, Arc::new(LogSink));
            let mut task = WorkerTask::new(
                format!("bias-b{band}-pol{p}"),
                BiasServoProcedure {
                    servo,
                    pol: pol(p),
                    start_voltage: start,
                    target_current: target,
                    verbose,
                    result: None,
                },
            );
            let ran = run(&mut task);
            let procedure = task.take_procedure().context("bias procedure lost")?;
            if let Some(Ok(adj)) = &procedure.result {
                println!("{adj:?}");
            }
            ran?;
        }
        Command::Maximize {
            band,
            pol: p,
            start,
            step,
            sim,
        } => {
            let b = band_config(&config, band, &sim)?;
            let params = MaximizeParams {
                start: start.unwrap_or(b.maximizer.start),
                step: step.unwrap_or(b.maximizer.step),
                ..b.maximizer
            };
            let target = IfPowerTarget {
                hw: front_end(&sim),
                pol: pol(p),
                settle_ms: b.bias.settle_ms,
            };
            let mut task = WorkerTask::new(
                format!("maximize-b{band}-pol{p}"),
                MaximizerProcedure::new(target, params, b.band, Arc::new(LogSink)),
            );
            run(&mut task)?;
            let procedure = task.take_procedure().context("maximizer procedure lost")?;
            if let Some(Ok(v)) = procedure.result {
                println!("IF power peaks at {v:.3} V drain");
            }
        }
        Command::CheckConfig { file } => {
            let config = Config::load(&file).with_context(|| format!("loading {}", file.display()))?;
            println!("{config:#?}");
        }
    }
    Ok(())
}
