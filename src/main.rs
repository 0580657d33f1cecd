//! priosched - CLI

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use priosched::runtime::scheduler::{
    PriorityScheduler, RecurrenceMode, Scheduler, SchedulerConfig, SchedulerError, ShutdownMode,
    StatsSnapshot, TaskPriority, TickScheduler,
};
use priosched::util::config::{load_config_or_default, save_config};
use priosched::util::logger::{self, LogLevel};
use priosched::{NAME, VERSION};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Priority task scheduler demo driver
#[derive(Parser, Debug)]
#[command(name = "priosched")]
#[command(version = VERSION)]
#[command(about = NAME, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose output (repeat for trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    /// Scheduler config file (TOML)
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a random mixed-priority workload on the thread pool scheduler
    Run {
        /// One-time tasks to submit
        #[arg(long, default_value_t = 200)]
        tasks: usize,

        /// Recurring tasks to submit
        #[arg(long, default_value_t = 4)]
        recurring: usize,

        /// How long to let the workload run, in milliseconds
        #[arg(long, default_value_t = 2000)]
        duration_ms: u64,

        /// Seed for the workload generator
        #[arg(long)]
        seed: Option<u64>,
    },

    /// Drive the cooperative scheduler for a number of ticks
    Tick {
        /// Number of ticks
        #[arg(long, default_value_t = 50)]
        ticks: usize,

        /// Pause between ticks, in milliseconds
        #[arg(long, default_value_t = 10)]
        interval_ms: u64,
    },

    /// Print the effective configuration as TOML
    Config {
        /// Also write it to this file
        #[arg(long, value_name = "FILE")]
        save: Option<PathBuf>,
    },

    /// Print version information
    Version,
}

#[derive(Debug, Serialize)]
struct TickSummary {
    ticks: usize,
    executed: usize,
    failures: usize,
    queued: usize,
}

fn main() -> Result<()> {
    let args = Args::parse();
    logger::init_with_level(LogLevel::from_verbosity(args.verbose));

    let config = load_config_or_default(args.config.as_deref()).with_context(|| match &args.config {
        Some(path) => format!("Failed to load config: {}", path.display()),
        None => "Failed to load user config".to_string(),
    })?;

    match args.command {
        Commands::Run {
            tasks,
            recurring,
            duration_ms,
            seed,
        } => {
            let stats = run_workload(&config, tasks, recurring, Duration::from_millis(duration_ms), seed)?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        },
        Commands::Tick { ticks, interval_ms } => {
            let summary = drive_ticks(ticks, Duration::from_millis(interval_ms))?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        },
        Commands::Config { save } => {
            print!("{}", toml::to_string_pretty(&config)?);
            if let Some(path) = save {
                save_config(&config, &path)
                    .with_context(|| format!("Failed to save config: {}", path.display()))?;
            }
        },
        Commands::Version => {
            println!("{} {}", NAME, VERSION);
        },
    }

    Ok(())
}

fn random_priority(rng: &mut StdRng) -> TaskPriority {
    TaskPriority::ALL[rng.random_range(0..TaskPriority::ALL.len())]
}

fn run_workload(
    config: &SchedulerConfig,
    tasks: usize,
    recurring: usize,
    duration: Duration,
    seed: Option<u64>,
) -> Result<StatsSnapshot> {
    let mut rng = match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_os_rng(),
    };
    let scheduler = PriorityScheduler::new(config);

    for _ in 0..recurring {
        let period = Duration::from_millis(rng.random_range(50..250));
        let mode = if rng.random_bool(0.5) {
            RecurrenceMode::FixedRate
        } else {
            RecurrenceMode::FixedDelay
        };
        let work = Duration::from_millis(rng.random_range(1..10));
        scheduler
            .submit_recurring(move || thread::sleep(work), Duration::ZERO, period, mode, Some(random_priority(&mut rng)))
            .context("Failed to submit recurring task")?;
    }

    for _ in 0..tasks {
        let delay = Duration::from_millis(rng.random_range(0..duration.as_millis().max(1) as u64));
        let work = Duration::from_millis(rng.random_range(1..20));
        let priority = random_priority(&mut rng);
        let action = move || thread::sleep(work);
        let submitted = if delay.is_zero() {
            scheduler.submit(action, Some(priority))
        } else {
            scheduler.submit_after(action, delay, Some(priority))
        };
        submitted.context("Failed to submit task")?;
    }

    thread::sleep(duration);
    scheduler.shutdown_with(ShutdownMode::DrainPending);
    if !scheduler.await_termination(Duration::from_secs(10)) {
        tracing::warn!("workers still busy after 10s, discarding the rest");
        scheduler.shutdown_now();
    }
    Ok(scheduler.stats())
}

fn drive_ticks(
    ticks: usize,
    interval: Duration,
) -> Result<TickSummary> {
    let scheduler = TickScheduler::new(false);
    let runs = Arc::new(AtomicUsize::new(0));

    let periods = [
        (TaskPriority::High, 20, RecurrenceMode::FixedRate),
        (TaskPriority::Low, 50, RecurrenceMode::FixedDelay),
        (TaskPriority::Starvable, 100, RecurrenceMode::FixedRate),
    ];
    for (priority, period_ms, mode) in periods {
        let runs = runs.clone();
        scheduler.submit_recurring(
            move || {
                runs.fetch_add(1, Ordering::SeqCst);
            },
            Duration::ZERO,
            Duration::from_millis(period_ms),
            mode,
            Some(priority),
        )?;
    }

    let mut failures = 0;
    for _ in 0..ticks {
        match scheduler.tick() {
            Ok(ran) => tracing::debug!("tick ran {} tasks", ran),
            Err(SchedulerError::TaskFailed(failure)) => {
                tracing::warn!("{}", failure);
                failures += 1;
            },
            Err(err) => return Err(err.into()),
        }
        thread::sleep(interval);
    }

    Ok(TickSummary {
        ticks,
        executed: runs.load(Ordering::SeqCst),
        failures,
        queued: scheduler.queued_task_count(),
    })
}
