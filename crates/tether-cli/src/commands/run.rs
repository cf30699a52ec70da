//! `tether run`: the agent's composition root.
//!
//! Builds the one delivery queue of the process, the reporter pool draining
//! it, and the control channel feeding it, then waits for the channel to
//! close. A restart request from the server re-executes the binary.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tether_control::{
    ChannelExit, ControlChannel, Dispatcher, Endpoint, ReconnectBackoff, ShellExecutor,
};
use tether_delivery::{DeliveryQueue, ReporterConfig, ReporterPool, Session};
use tether_types::AgentConfig;
use tokio::time::Instant;
use tracing::{error, info, warn};

/// How long pending notices get to drain after the channel closes.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Run the agent until the server says quit, or Ctrl-C.
pub fn run(path: &Path) -> Result<()> {
    let config = AgentConfig::load(path)
        .with_context(|| format!("invalid configuration in {}", path.display()))?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to create tokio runtime")?;
    let exit = runtime.block_on(serve(config))?;
    runtime.shutdown_timeout(Duration::from_secs(1));

    if exit.restart_requested {
        info!("restart requested, re-executing agent");
        return reexec();
    }
    Ok(())
}

async fn serve(config: AgentConfig) -> Result<ChannelExit> {
    let session = Session::new(&config.server).context("failed to build HTTP session")?;
    let endpoint = Endpoint::from_config(&config.server, &config.control)
        .context("failed to configure control channel")?;

    let queue = Arc::new(DeliveryQueue::with_limits(
        config.delivery.queue_capacity,
        config.delivery.retry_limit,
    ));
    let pool = ReporterPool::spawn(
        ReporterConfig {
            workers: config.delivery.workers,
            request_timeout: config.delivery.request_timeout(),
        },
        Arc::clone(&queue),
        Arc::new(session),
    );

    let executor = Arc::new(ShellExecutor::new(
        Arc::clone(&queue),
        config.control.command_timeout(),
    ));
    let dispatcher = Dispatcher::new(Arc::clone(&queue), executor);
    let (channel, handle) = ControlChannel::new(endpoint, dispatcher);
    let channel = channel.with_backoff(ReconnectBackoff::new(
        config.control.reconnect_initial(),
        config.control.reconnect_max(),
    ));
    let mut channel_task = tokio::spawn(channel.run());

    let interrupt = handle.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("interrupt received, shutting down");
                interrupt.request_quit();
            }
            Err(e) => warn!(error = %e, "cannot listen for Ctrl-C"),
        }
    });

    let stats_every = config.delivery.stats_interval_secs;
    let mut ticker = tokio::time::interval(Duration::from_secs(stats_every.max(1)));
    ticker.tick().await;

    let exit = loop {
        tokio::select! {
            joined = &mut channel_task => break joined.context("control channel task failed")?,
            _ = ticker.tick(), if stats_every > 0 => log_stats(&pool, &queue),
        }
    };

    drain(&queue).await;
    log_stats(&pool, &queue);
    pool.shutdown().await;
    Ok(exit)
}

/// Give the pool a moment to deliver what is already queued (command
/// completion notices in particular) before shutting it down.
async fn drain(queue: &DeliveryQueue) {
    let deadline = Instant::now() + DRAIN_TIMEOUT;
    while !queue.is_empty() && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    if !queue.is_empty() {
        warn!(pending = queue.len(), "shutting down with undelivered requests");
    }
}

fn log_stats(pool: &ReporterPool, queue: &DeliveryQueue) {
    let s = pool.stats();
    info!(
        pending = queue.len(),
        dropped = queue.dropped(),
        success = s.success_total,
        failure = s.failure_total,
        ignored = s.ignored_total,
        success_rate = format_args!("{:.2}", s.success_rate),
        avg_delay_secs = format_args!("{:.3}", s.avg_delay_secs),
        avg_latency_secs = format_args!("{:.3}", s.avg_latency_secs),
        "delivery stats"
    );
}

/// Replace the current process with a fresh copy of the agent.
#[cfg(unix)]
fn reexec() -> Result<()> {
    use std::os::unix::process::CommandExt;

    let exe = std::env::current_exe().context("cannot locate agent binary")?;
    let err = std::process::Command::new(&exe)
        .args(std::env::args_os().skip(1))
        .exec();
    error!(error = %err, exe = %exe.display(), "re-exec failed");
    Err(err).context("failed to re-execute agent")
}

#[cfg(not(unix))]
fn reexec() -> Result<()> {
    let exe = std::env::current_exe().context("cannot locate agent binary")?;
    std::process::Command::new(&exe)
        .args(std::env::args_os().skip(1))
        .spawn()
        .context("failed to re-execute agent")?;
    Ok(())
}
