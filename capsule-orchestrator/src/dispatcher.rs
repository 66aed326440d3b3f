//! Fire-and-forget execution of hypervisor commands.
//!
//! A bounded queue decouples the request-handling path (strict latency
//! expectations) from backend calls that may take minutes. A fixed pool of
//! workers drains the queue; each dequeued command runs to terminal
//! resolution before the worker takes the next one. With more than one
//! worker, the state machine's from-state check is the correctness backstop
//! for commands racing on the same VM.

use std::time::Duration;

use async_channel::{Receiver, Sender};
use capsule_core::config::Config;
use capsule_core::error::{CapsuleError, ErrorKind, Result};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::commands::{CommandContext, HypervisorCommand};
use crate::retry::RetriableTask;

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub workers: usize,
    /// Queue bound; enqueue applies backpressure beyond this instead of
    /// letting a request burst grow an unbounded backlog.
    pub queue_depth: usize,
    pub retry_delay: Duration,
    pub retry_attempts: u32,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            queue_depth: 64,
            retry_delay: Duration::from_millis(1000),
            retry_attempts: 3,
        }
    }
}

impl DispatcherConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            workers: config.workers,
            queue_depth: config.queue_depth,
            retry_delay: Duration::from_millis(config.retry_delay_ms),
            retry_attempts: config.retry_attempts,
        }
    }
}

/// Owns the queue and the worker pool. Constructed once at process start
/// and shut down explicitly; holders enqueue through a shared reference.
pub struct CommandDispatcher {
    tx: Sender<Box<dyn HypervisorCommand>>,
    workers: Vec<JoinHandle<()>>,
}

impl CommandDispatcher {
    pub fn start(ctx: CommandContext, config: DispatcherConfig) -> Self {
        let (tx, rx) = async_channel::bounded(config.queue_depth.max(1));

        let workers = (0..config.workers.max(1))
            .map(|id| {
                let rx = rx.clone();
                let ctx = ctx.clone();
                let config = config.clone();
                tokio::spawn(worker_loop(id, rx, ctx, config))
            })
            .collect();

        Self { tx, workers }
    }

    /// Enqueue a command for asynchronous execution. Returns as soon as the
    /// command is queued; the outcome is observable only through the
    /// capsule's persisted state. Applies backpressure when the queue is
    /// full.
    pub async fn add_command(&self, cmd: Box<dyn HypervisorCommand>) -> Result<()> {
        self.tx
            .send(cmd)
            .await
            .map_err(|_| CapsuleError::Internal("dispatcher is shut down".to_string()))
    }

    /// Number of commands waiting in the queue.
    pub fn backlog(&self) -> usize {
        self.tx.len()
    }

    /// Close the queue, let the workers drain what was already enqueued,
    /// and join them.
    pub async fn shutdown(self) {
        self.tx.close();
        for worker in self.workers {
            if let Err(err) = worker.await {
                error!(error = %err, "dispatcher worker panicked");
            }
        }
    }
}

async fn worker_loop(
    id: usize,
    rx: Receiver<Box<dyn HypervisorCommand>>,
    ctx: CommandContext,
    config: DispatcherConfig,
) {
    info!(worker = id, "dispatcher worker started");

    while let Ok(cmd) = rx.recv().await {
        let retry = RetriableTask::new(
            config.retry_delay,
            config.retry_attempts,
            cmd.retryable_kinds().iter().copied(),
        );

        match retry.run(|| cmd.execute(&ctx)).await {
            Ok(()) => info!(worker = id, command = %cmd, "command completed"),
            Err(err) => {
                warn!(
                    worker = id,
                    command = %cmd,
                    error = %err,
                    "command failed terminally, running cleanup"
                );

                // The cleanup write can suffer the same transient store
                // faults as the primary operation.
                let cleanup_retry = RetriableTask::new(
                    config.retry_delay,
                    config.retry_attempts,
                    [ErrorKind::Database],
                );

                if let Err(cleanup_err) = cleanup_retry.run(|| cmd.cleanup_on_failed(&ctx)).await {
                    // Must not take the worker down or block the queue.
                    error!(
                        worker = id,
                        command = %cmd,
                        error = %cleanup_err,
                        "cleanup failed, dropping command"
                    );
                }
            }
        }
    }

    info!(worker = id, "dispatcher worker stopped");
}
