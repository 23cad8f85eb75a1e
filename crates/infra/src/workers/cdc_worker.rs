use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use newsrelay_events::MessageChannel;

use crate::dead_letter::DeadLetterPublishFailure;
use crate::pipelines::{CdcConsumer, ConsumerStats};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CdcWorkerConfig {
    pub name: String,
    /// Messages requested per `receive` call.
    pub batch_size: usize,
    /// Pause after an empty receive.
    pub idle_backoff: Duration,
    /// Pause after a channel or dead-letter failure.
    pub error_backoff: Duration,
}

impl Default for CdcWorkerConfig {
    fn default() -> Self {
        Self {
            name: "cdc-worker".to_string(),
            batch_size: 100,
            idle_backoff: Duration::from_millis(500),
            error_backoff: Duration::from_secs(1),
        }
    }
}

impl CdcWorkerConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_idle_backoff(mut self, idle_backoff: Duration) -> Self {
        self.idle_backoff = idle_backoff;
        self
    }

    pub fn with_error_backoff(mut self, error_backoff: Duration) -> Self {
        self.error_backoff = error_backoff;
        self
    }
}

/// One poll of the channel failed; the batch's unacknowledged tail is left for redelivery.
#[derive(Debug, Error)]
pub enum ConsumeError {
    #[error("channel error: {0}")]
    Channel(String),

    #[error(transparent)]
    DeadLetter(#[from] DeadLetterPublishFailure),
}

/// Handle to control and join a running CDC worker.
#[derive(Debug)]
pub struct WorkerHandle {
    name: String,
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
    stats: Arc<ConsumerStats>,
}

impl WorkerHandle {
    pub fn stats(&self) -> Arc<ConsumerStats> {
        self.stats.clone()
    }

    /// Request graceful shutdown and wait for the in-flight batch to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(err) = self.join.await {
            error!(worker = %self.name, error = %err, "cdc worker task failed");
        }
        info!(worker = %self.name, stats = ?self.stats.snapshot(), "cdc worker stopped");
    }
}

/// Polls a channel and drives every message through a [`CdcConsumer`].
///
/// - A message is acknowledged once it reached a terminal state
/// - A failed dead-letter publish stops the batch: that message and everything
///   after it stay unacknowledged, keeping per-key order on redelivery
/// - Shutdown is checked between batches, never in the middle of one
#[derive(Debug)]
pub struct CdcWorker;

impl CdcWorker {
    pub fn spawn<C>(consumer: CdcConsumer<C>, channel: C, config: CdcWorkerConfig) -> WorkerHandle
    where
        C: MessageChannel + 'static,
    {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let stats = consumer.stats();
        let name = config.name.clone();

        let join = tokio::spawn(worker_loop(consumer, channel, config, shutdown_rx));

        WorkerHandle {
            name,
            shutdown: shutdown_tx,
            join,
            stats,
        }
    }

    /// Receive one batch, handle it, acknowledge what reached a terminal state.
    ///
    /// Returns the number of messages received.
    pub async fn poll_once<C>(
        consumer: &CdcConsumer<C>,
        channel: &C,
        batch_size: usize,
    ) -> Result<usize, ConsumeError>
    where
        C: MessageChannel,
    {
        let messages = channel
            .receive(batch_size)
            .await
            .map_err(|e| ConsumeError::Channel(e.to_string()))?;

        let mut done = Vec::with_capacity(messages.len());
        let mut failure = None;
        for message in &messages {
            match consumer.handle(message).await {
                Ok(outcome) => {
                    debug!(message_id = %message.id, outcome = ?outcome, "message handled");
                    done.push(message.id.clone());
                }
                Err(err) => {
                    failure = Some(err);
                    break;
                }
            }
        }

        if !done.is_empty() {
            channel
                .acknowledge(&done)
                .await
                .map_err(|e| ConsumeError::Channel(e.to_string()))?;
        }

        match failure {
            Some(err) => Err(err.into()),
            None => Ok(messages.len()),
        }
    }
}

async fn worker_loop<C>(
    consumer: CdcConsumer<C>,
    channel: C,
    config: CdcWorkerConfig,
    mut shutdown_rx: watch::Receiver<bool>,
) where
    C: MessageChannel,
{
    info!(worker = %config.name, consumer = consumer.name(), "cdc worker started");

    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        let pause = match CdcWorker::poll_once(&consumer, &channel, config.batch_size).await {
            Ok(0) => config.idle_backoff,
            Ok(_) => continue,
            Err(err) => {
                error!(worker = %config.name, error = %err, "cdc poll failed");
                config.error_backoff
            }
        };

        tokio::select! {
            _ = tokio::time::sleep(pause) => {}
            changed = shutdown_rx.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }
}
