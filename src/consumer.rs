//! Per-queue consumer loop
//!
//! One consumer owns one long-poll loop over one queue URL. Received
//! messages are handed to the shared worker pool (or processed inline when
//! no pool is attached, as the reply consumer does) and the outcome decides
//! the message's fate:
//!
//! - handler success: ACK (delete)
//! - handler returned the NACK sentinel, or the pool rejected the job:
//!   NACK (visibility reset to one second, so the message redistributes)
//! - any other handler failure: neither, leaving redelivery to the queue
//!   service's own visibility timeout and ultimately its dead-letter queue

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;

use crate::client::{QueueService, ReceivedMessage};
use crate::codec::Codec;
use crate::error::{MqError, Result};
use crate::message::Message;
use crate::worker_pool::WorkerPool;

/// Visibility applied on NACK; short, so the message is quickly
/// re-available to any consumer of the queue
const NACK_VISIBILITY_SECS: i32 = 1;

/// Pause after a failed receive so a dead endpoint cannot spin the loop hot
const RECEIVE_ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Processes one decoded message; `Err(MqError::Nack)` requests redelivery
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: Message) -> Result<()>;
}

#[async_trait]
impl<F, Fut> MessageHandler for F
where
    F: Fn(Message) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<()>> + Send,
{
    async fn handle(&self, message: Message) -> Result<()> {
        self(message).await
    }
}

/// Long-poll consumer bound to one queue URL
pub struct Consumer {
    qsvc: Arc<dyn QueueService>,
    codec: Arc<dyn Codec>,
    queue_url: String,
    handler: Arc<dyn MessageHandler>,
    pool: Option<Arc<WorkerPool>>,
    read_timeout_secs: i32,
    stop_requested: Arc<AtomicBool>,
    poll_task: Mutex<Option<JoinHandle<()>>>,
}

impl Consumer {
    pub fn new(
        qsvc: Arc<dyn QueueService>,
        codec: Arc<dyn Codec>,
        queue_url: String,
        handler: Arc<dyn MessageHandler>,
        pool: Option<Arc<WorkerPool>>,
        read_timeout_secs: u64,
    ) -> Self {
        Self {
            qsvc,
            codec,
            queue_url,
            handler,
            pool,
            read_timeout_secs: read_timeout_secs.min(i32::MAX as u64) as i32,
            stop_requested: Arc::new(AtomicBool::new(false)),
            poll_task: Mutex::new(None),
        }
    }

    /// Spawn the long-poll loop
    pub fn start(&self) {
        let qsvc = Arc::clone(&self.qsvc);
        let codec = Arc::clone(&self.codec);
        let handler = Arc::clone(&self.handler);
        let pool = self.pool.clone();
        let queue_url = self.queue_url.clone();
        let stop_requested = Arc::clone(&self.stop_requested);
        let read_timeout_secs = self.read_timeout_secs;

        let task = tokio::spawn(async move {
            tracing::debug!(queue_url = %queue_url, "Consumer loop started");

            while !stop_requested.load(Ordering::Acquire) {
                let received = match qsvc
                    .receive_message(&queue_url, 1, read_timeout_secs)
                    .await
                {
                    Ok(received) => received,
                    Err(e) => {
                        tracing::warn!(
                            error = %e,
                            queue_url = %queue_url,
                            "receive_message failed, retrying"
                        );
                        tokio::time::sleep(RECEIVE_ERROR_BACKOFF).await;
                        continue;
                    }
                };

                if received.is_empty() {
                    // Long-poll window expired.
                    continue;
                }

                if received.len() > 1 {
                    tracing::error!(
                        count = received.len(),
                        queue_url = %queue_url,
                        "received more than one message from a max=1 poll"
                    );
                }

                for message in received {
                    dispatch(
                        &qsvc,
                        &codec,
                        &queue_url,
                        &handler,
                        pool.as_deref(),
                        message,
                    )
                    .await;
                }
            }

            tracing::debug!(queue_url = %queue_url, "Consumer loop stopped");
        });

        *self.poll_task.lock().expect("consumer lock poisoned") = Some(task);
    }

    pub fn queue_url(&self) -> &str {
        &self.queue_url
    }

    /// Request the loop to exit without waiting for it
    ///
    /// The outstanding long-poll runs down once (up to the configured read
    /// timeout) before the loop observes the flag.
    pub fn signal_stop(&self) {
        self.stop_requested.store(true, Ordering::Release);
    }

    /// Request the loop to exit and wait for it to finish
    pub async fn stop(&self) {
        self.signal_stop();

        let task = self.poll_task.lock().expect("consumer lock poisoned").take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                tracing::error!(error = %e, queue_url = %self.queue_url, "consumer loop panicked");
            }
        }
    }
}

/// Hand a received message to the pool, or process it inline when the
/// consumer has no pool attached
async fn dispatch(
    qsvc: &Arc<dyn QueueService>,
    codec: &Arc<dyn Codec>,
    queue_url: &str,
    handler: &Arc<dyn MessageHandler>,
    pool: Option<&WorkerPool>,
    received: ReceivedMessage,
) {
    match pool {
        Some(pool) => {
            let receipt_handle = received.receipt_handle.clone();
            let job = process(
                Arc::clone(qsvc),
                Arc::clone(codec),
                queue_url.to_string(),
                Arc::clone(handler),
                received,
            );

            if pool.try_submit(job).is_err() {
                tracing::debug!(queue_url = %queue_url, "worker pool saturated, nacking");
                nack(qsvc, queue_url, &receipt_handle).await;
            }
        }
        None => {
            process(
                Arc::clone(qsvc),
                Arc::clone(codec),
                queue_url.to_string(),
                Arc::clone(handler),
                received,
            )
            .await;
        }
    }
}

/// Decode, run the handler, and settle the message
async fn process(
    qsvc: Arc<dyn QueueService>,
    codec: Arc<dyn Codec>,
    queue_url: String,
    handler: Arc<dyn MessageHandler>,
    received: ReceivedMessage,
) {
    let receipt_handle = received.receipt_handle;

    let body = match codec.decode(&received.body) {
        Ok(body) => body,
        Err(e) => {
            // Undecodable payloads redeliver on the service-side visibility
            // timeout and eventually reach the dead-letter queue.
            tracing::error!(error = %e, queue_url = %queue_url, "failed to decode message body");
            return;
        }
    };

    let message = Message::new(body, received.attributes);

    match handler.handle(message).await {
        Ok(()) => {
            if let Err(e) = qsvc.delete_message(&queue_url, &receipt_handle).await {
                tracing::error!(error = %e, queue_url = %queue_url, "failed to ack message");
            }
        }
        Err(MqError::Nack) => nack(&qsvc, &queue_url, &receipt_handle).await,
        Err(e) => {
            tracing::warn!(
                error = %e,
                queue_url = %queue_url,
                "handler failed, leaving message to the visibility timeout"
            );
        }
    }
}

async fn nack(qsvc: &Arc<dyn QueueService>, queue_url: &str, receipt_handle: &str) {
    if let Err(e) = qsvc
        .change_message_visibility(queue_url, receipt_handle, NACK_VISIBILITY_SECS)
        .await
    {
        tracing::error!(error = %e, queue_url = %queue_url, "failed to nack message");
    }
}
