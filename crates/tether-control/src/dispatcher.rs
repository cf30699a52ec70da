//! Routing of decoded inbound queries.
//!
//! `command` queries are acknowledged through the delivery queue before the
//! command body is handed to a [`CommandExecutor`] on its own task, so a slow
//! command never holds up the read loop. Connection-level queries are
//! returned to the channel as a [`Disposition`].

use std::sync::Arc;

use async_trait::async_trait;
use tether_delivery::{DeliveryQueue, PendingRequest};
use tether_types::{ack_path, fin_path, CommandFinish, CommandRef, Query, COMMAND_EVENT_PRIORITY};
use tracing::{info, warn};

/// Runs the body of a command pushed by the management plane.
///
/// Implementations own the completion notice: once the command is done they
/// are expected to call [`report_finish`] (or enqueue the equivalent request).
#[async_trait]
pub trait CommandExecutor: Send + Sync + 'static {
    async fn execute(&self, command: CommandRef);
}

/// What the channel should do with its connection after a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Keep reading.
    Continue,
    /// Drop this connection and connect again.
    Reconnect,
    /// Close for good.
    Quit,
    /// Close for good and ask the supervisor to re-execute the agent.
    Restart,
}

/// Enqueue the receipt acknowledgement for a command.
pub fn report_ack(queue: &DeliveryQueue, command_id: &str) {
    queue.enqueue(PendingRequest::post(ack_path(command_id)).with_priority(COMMAND_EVENT_PRIORITY));
}

/// Enqueue the completion notice for a command.
pub fn report_finish(queue: &DeliveryQueue, command_id: &str, finish: &CommandFinish) {
    match PendingRequest::post(fin_path(command_id)).with_json(finish) {
        Ok(request) => queue.enqueue(request.with_priority(COMMAND_EVENT_PRIORITY)),
        Err(e) => warn!(command = command_id, error = %e, "failed to encode completion notice"),
    }
}

/// Maps inbound queries to their effects.
pub struct Dispatcher {
    queue: Arc<DeliveryQueue>,
    executor: Arc<dyn CommandExecutor>,
}

impl Dispatcher {
    pub fn new(queue: Arc<DeliveryQueue>, executor: Arc<dyn CommandExecutor>) -> Self {
        Self { queue, executor }
    }

    pub fn queue(&self) -> &Arc<DeliveryQueue> {
        &self.queue
    }

    /// Apply a query. Must be called from within a tokio runtime.
    pub fn dispatch(&self, query: Query) -> Disposition {
        match query {
            Query::Command(command) => self.dispatch_command(command),
            Query::Quit { reason } => {
                info!(reason = reason.as_deref().unwrap_or(""), "quit requested by server");
                Disposition::Quit
            }
            Query::Reconnect { reason } => {
                info!(reason = reason.as_deref().unwrap_or(""), "reconnect requested by server");
                Disposition::Reconnect
            }
            Query::Unknown(name) => {
                warn!(query = %name, "ignoring unknown query");
                Disposition::Continue
            }
        }
    }

    fn dispatch_command(&self, command: CommandRef) -> Disposition {
        info!(
            command = %command.id,
            shell = %command.shell,
            user = %command.user,
            "command received"
        );
        report_ack(&self.queue, &command.id);

        if command.is_internal("restart") {
            report_finish(
                &self.queue,
                &command.id,
                &CommandFinish {
                    success: true,
                    result: "restarting agent".into(),
                    elapsed_time: 0.0,
                },
            );
            return Disposition::Restart;
        }

        let executor = Arc::clone(&self.executor);
        tokio::spawn(async move {
            executor.execute(command).await;
        });
        Disposition::Continue
    }
}
