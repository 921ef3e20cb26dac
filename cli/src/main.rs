//! tether CLI - drives a portal from plain synchronous code.
//!
//! ```text
//! main() -> start_portal(TokioBackend) -> Portal::call / call_sync / start_task
//!                                               |
//!                                               v
//!                                  loop thread -> run_blocking -> worker
//!                                                                   |
//!                                                       run_sync_in_loop
//! ```
//!
//! Usage: `tether [JOBS]` runs JOBS blocking calls (default 4) through the
//! loop's default limiter and prints what each stage returned.

use std::env;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use tether_bridge::{
    BlockingOptions, Portal, TaskStatus, TokioBackend, default_thread_limiter, run_blocking,
    run_sync_in_loop, start_portal,
};
use tether_config::TetherConfig;

const DEFAULT_JOBS: usize = 4;

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(env_filter)
        .init();
}

fn parse_jobs() -> Result<usize> {
    match env::args().nth(1) {
        Some(raw) => raw
            .parse()
            .with_context(|| format!("JOBS must be a non-negative integer, got {raw:?}")),
        None => Ok(DEFAULT_JOBS),
    }
}

fn thread_label() -> String {
    thread::current().name().unwrap_or("unnamed").to_string()
}

fn run_demo(portal: &Portal, jobs: usize) -> Result<()> {
    let answer = portal.call(|| async { anyhow::Ok(21 * 2) })?;
    println!("call: 21 * 2 = {answer}");

    let loop_thread = portal.call_sync(|| anyhow::Ok(thread_label()))?;
    println!("call_sync: loop runs on thread {loop_thread:?}");

    let (server, address) = portal.start_task(
        |status: TaskStatus<String>| async move {
            status.started("inproc://tether-demo".to_string());
            tokio::time::sleep(Duration::from_millis(50)).await;
            anyhow::Ok("server drained")
        },
        Some("demo_server"),
    )?;
    println!("start_task: ready at {address}");

    let report = portal.call(move || async move {
        let limiter = default_thread_limiter()?;
        let mut lines = vec![format!(
            "limiter admits {} worker threads",
            limiter.total_tokens()
        )];
        for job in 0..jobs {
            let line = run_blocking(
                move || {
                    let worker = thread_label();
                    let hop = run_sync_in_loop(|| anyhow::Ok(thread_label()))?;
                    anyhow::Ok(format!("job {job}: worker {worker:?} called back into {hop:?}"))
                },
                BlockingOptions::default(),
            )
            .await?;
            lines.push(line);
        }
        anyhow::Ok(lines)
    })?;
    for line in report {
        println!("run_blocking: {line}");
    }

    println!("start_task: {}", server.result()?);
    Ok(())
}

fn main() -> Result<()> {
    init_tracing();

    let config = match TetherConfig::load() {
        Ok(config) => config,
        Err(err) => {
            tracing::warn!("Falling back to default config: {err}");
            TetherConfig::default()
        }
    };
    let jobs = parse_jobs()?;

    let hosted = start_portal(Arc::new(TokioBackend::from_config(&config)))?;
    let outcome = run_demo(hosted.portal(), jobs);

    let closed = match config.portal.shutdown_grace() {
        Some(grace) => hosted.close_within(grace),
        None => hosted.close(),
    };
    outcome?;
    closed?;
    Ok(())
}
