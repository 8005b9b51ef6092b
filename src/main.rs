//! epochrt - CLI
//!
//! Drives small task graphs on the runtime, mostly to watch the schedulers
//! and finish scopes at work.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use epochrt::runtime::{AccessMode, Arity, EventKind, SchedulerKind, StatsSnapshot};
use epochrt::util::config::RuntimeConfig;
use epochrt::util::logger::{self, LogLevel};
use epochrt::{Guid, Runtime, RuntimeResult, NAME, VERSION};
use tracing::info;

/// GUID-addressed task runtime
#[derive(Parser, Debug)]
#[command(name = "epochrt")]
#[command(version = VERSION)]
#[command(about = NAME, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,

    /// Config file (TOML)
    #[arg(short, long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Worker threads for pool schedulers
    #[arg(short, long, global = true)]
    workers: Option<usize>,

    /// Scheduler: inline, work-stealing or rayon
    #[arg(short, long, global = true)]
    scheduler: Option<SchedulerKind>,

    /// Log level
    #[arg(short, long, global = true)]
    log_level: Option<LogLevel>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Spawn a fan-out tree under one finish task
    Tree {
        #[arg(short, long, default_value_t = 3)]
        depth: u32,

        #[arg(short, long, default_value_t = 4)]
        fanout: u32,
    },

    /// Compute a Fibonacci number as a task graph with data objects
    Fib {
        #[arg(value_name = "N")]
        n: u64,
    },

    /// Print the effective configuration
    Config,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = RuntimeConfig::load(args.config.as_deref()).context("failed to load configuration")?;
    if let Some(workers) = args.workers {
        config = config.with_workers(workers);
    }
    if let Some(kind) = args.scheduler {
        config = config.with_scheduler(kind);
    }
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }
    config.validate()?;
    logger::init_with_level(config.logging.level);

    match args.command {
        Commands::Config => {
            print!("{}", config.to_toml_string()?);
            Ok(())
        }
        Commands::Tree { depth, fanout } => run_tree(config, depth, fanout),
        Commands::Fib { n } => run_fib(config, n),
    }
}

fn run_tree(
    config: RuntimeConfig,
    depth: u32,
    fanout: u32,
) -> Result<()> {
    let rt = Runtime::new(config)?;
    let leaves = Arc::new(AtomicU64::new(0));

    let node = {
        let leaves = leaves.clone();
        rt.create_template("tree-node", move |ctx, params, _deps| {
            let (remaining, fanout) = (params[0], params[1]);
            if remaining == 0 {
                leaves.fetch_add(1, Ordering::Relaxed);
                return Ok(Guid::NULL);
            }
            for _ in 0..fanout {
                ctx.task_builder(ctx.task_template())
                    .params([remaining - 1, fanout])
                    .slots(0)
                    .spawn()?;
            }
            Ok(Guid::NULL)
        })?
    };
    let started = Instant::now();
    let spawned = rt
        .task_builder(node)
        .params([u64::from(depth), u64::from(fanout)])
        .slots(0)
        .finish()
        .with_output_event()
        .spawn()?;
    rt.wait_idle();
    let output = spawned.output_event.ok_or_else(|| anyhow!("no output event"))?;
    if rt.event_payload(output)?.is_none() {
        bail!("finish scope did not complete");
    }
    info!(elapsed = ?started.elapsed(), "tree done");
    println!("leaves: {}", leaves.load(Ordering::Relaxed));
    report(&rt.stats().snapshot());
    rt.shutdown();
    Ok(())
}

fn run_fib(
    config: RuntimeConfig,
    n: u64,
) -> Result<()> {
    let rt = Runtime::new(config)?;
    let fib = build_fib(&rt)?;

    let started = Instant::now();
    let out = rt.create_event(EventKind::Sticky)?;
    let root = rt
        .task_builder(fib)
        .params([n, out.raw()])
        .finish()
        .with_output_event()
        .spawn()?;
    rt.wait_idle();
    let done = root.output_event.ok_or_else(|| anyhow!("no output event"))?;
    if rt.event_payload(done)?.is_none() {
        bail!("finish scope did not complete");
    }

    let result = rt
        .event_payload(out)?
        .ok_or_else(|| anyhow!("fib({}) produced no result", n))?;
    let value = rt
        .acquire(result, Guid::NULL, AccessMode::Const)?
        .and_then(|data| data.read_u64(0))
        .ok_or_else(|| anyhow!("result object unreadable"))?;
    info!(elapsed = ?started.elapsed(), "fib done");
    println!("fib({}) = {}", n, value);
    report(&rt.stats().snapshot());
    rt.shutdown();
    Ok(())
}

/// `fib(n, out)` satisfies `out` with a data object holding the result.
fn build_fib(rt: &Runtime) -> RuntimeResult<Guid> {
    let sum = rt.create_template_with_arity("fib-sum", Arity::Fixed(3), Arity::Fixed(2), |ctx, params, deps| {
        let mut total = 0;
        for dep in deps {
            total += dep.data().and_then(|data| data.read_u64(0)).unwrap_or(0);
            ctx.runtime().destroy(dep.guid())?;
        }
        let (db, handle) = ctx.create_data_object(8)?;
        // SAFETY: nobody else has seen this object yet.
        unsafe { handle.write_u64(0, total) };
        ctx.satisfy(Guid::from_raw(params[0]), db, 0)?;
        for raw in &params[1..] {
            ctx.runtime().destroy(Guid::from_raw(*raw))?;
        }
        Ok(Guid::NULL)
    })?;

    let fib = rt.create_template_with_arity("fib", Arity::Fixed(2), Arity::Fixed(0), move |ctx, params, _deps| {
        let (n, out) = (params[0], Guid::from_raw(params[1]));
        if n < 2 {
            let (db, handle) = ctx.create_data_object(8)?;
            // SAFETY: nobody else has seen this object yet.
            unsafe { handle.write_u64(0, n) };
            ctx.satisfy(out, db, 0)?;
            return Ok(Guid::NULL);
        }
        let left = ctx.runtime().create_event(EventKind::Once)?;
        let right = ctx.runtime().create_event(EventKind::Once)?;
        ctx.task_builder(sum)
            .params([out.raw(), left.raw(), right.raw()])
            .dependencies([left, right])
            .dependency_mode(AccessMode::Const)
            .spawn()?;
        let me = ctx.task_template();
        ctx.task_builder(me).params([n - 1, left.raw()]).spawn()?;
        ctx.task_builder(me).params([n - 2, right.raw()]).spawn()?;
        Ok(Guid::NULL)
    })?;
    Ok(fib)
}

fn report(stats: &StatsSnapshot) {
    println!(
        "tasks: {} created, {} completed, {} failed",
        stats.tasks_created, stats.tasks_completed, stats.tasks_failed
    );
    println!(
        "events: {} created, {} fired; data objects: {} created, {} freed",
        stats.events_created, stats.events_satisfied, stats.data_objects_created, stats.data_objects_freed
    );
}
