//! Reply correlator
//!
//! One ephemeral reply queue per process carries every query response. The
//! reply consumer maps the `__request_id` of each inbound message to the
//! rendezvous its query is parked on. Replies arriving after the waiter
//! timed out (or for ids this process never issued) are dropped.
//!
//! The reply queue is consumed without a worker pool: dispatch is trivial
//! and must not be starved by application handlers saturating the pool.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use uuid::Uuid;

use crate::client::QueueService;
use crate::codec::Codec;
use crate::consumer::{Consumer, MessageHandler};
use crate::error::Result;
use crate::message::Message;
use crate::registry::NameRegistry;
use crate::timeout_queue::TimeoutQueue;

/// 16 lowercase hex chars, used for request ids and the reply queue suffix
pub(crate) fn hex_token() -> String {
    Uuid::new_v4().simple().to_string()[..16].to_string()
}

#[derive(Default)]
struct PendingReplies {
    waiters: Mutex<HashMap<String, Arc<TimeoutQueue<Message>>>>,
}

impl PendingReplies {
    /// Set-if-absent registration: double registration returns the existing
    /// rendezvous
    fn register(&self, request_id: &str) -> Arc<TimeoutQueue<Message>> {
        let mut waiters = self.waiters.lock().expect("correlator lock poisoned");
        Arc::clone(
            waiters
                .entry(request_id.to_string())
                .or_insert_with(|| Arc::new(TimeoutQueue::new())),
        )
    }

    /// Atomically remove and return the rendezvous for `request_id`
    fn take(&self, request_id: &str) -> Option<Arc<TimeoutQueue<Message>>> {
        self.waiters
            .lock()
            .expect("correlator lock poisoned")
            .remove(request_id)
    }

    fn len(&self) -> usize {
        self.waiters.lock().expect("correlator lock poisoned").len()
    }
}

/// Routes an inbound reply to its waiting rendezvous
struct ReplyDispatcher {
    pending: Arc<PendingReplies>,
}

#[async_trait::async_trait]
impl MessageHandler for ReplyDispatcher {
    async fn handle(&self, message: Message) -> Result<()> {
        let Some(request_id) = message.request_id().map(str::to_string) else {
            tracing::warn!("reply message without __request_id, dropping");
            return Ok(());
        };

        match self.pending.take(&request_id) {
            Some(waiter) => waiter.push(message),
            None => {
                tracing::debug!(
                    request_id = %request_id,
                    "no waiter for reply (timed out or unknown), dropping"
                );
            }
        }

        Ok(())
    }
}

/// Per-process reply queue plus the pending-query correlation table
pub struct ReplyConsumer {
    queue_url: String,
    qsvc: Arc<dyn QueueService>,
    pending: Arc<PendingReplies>,
    consumer: Consumer,
}

impl ReplyConsumer {
    /// Create the ephemeral reply queue and start consuming it
    pub async fn start(
        registry: &NameRegistry,
        qsvc: Arc<dyn QueueService>,
        codec: Arc<dyn Codec>,
        reply_queue_prefix: &str,
        read_timeout_secs: u64,
    ) -> Result<Self> {
        let queue_name = format!("{reply_queue_prefix}{}", hex_token());
        let queue_url = registry.create_queue(&queue_name).await?;

        tracing::info!(queue_url = %queue_url, "Reply queue created");

        let pending = Arc::new(PendingReplies::default());
        let dispatcher = Arc::new(ReplyDispatcher {
            pending: Arc::clone(&pending),
        });

        let consumer = Consumer::new(
            Arc::clone(&qsvc),
            codec,
            queue_url.clone(),
            dispatcher,
            None,
            read_timeout_secs,
        );
        consumer.start();

        Ok(Self {
            queue_url,
            qsvc,
            pending,
            consumer,
        })
    }

    /// URL queries advertise in `__reply_queue_url`
    pub fn queue_url(&self) -> &str {
        &self.queue_url
    }

    /// Register a pending request and return the rendezvous to wait on
    pub fn register(&self, request_id: &str) -> Arc<TimeoutQueue<Message>> {
        self.pending.register(request_id)
    }

    /// Best-effort cleanup after a timed-out or failed query
    pub fn remove(&self, request_id: &str) {
        self.pending.take(request_id);
    }

    /// Count of in-flight queries, used to verify the table does not leak
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Stop the inner consumer and delete the reply queue
    ///
    /// Pending waiters are not failed explicitly; their timeouts fire
    /// naturally.
    pub async fn stop(&self) {
        self.consumer.stop().await;

        if let Err(e) = self.qsvc.delete_queue(&self.queue_url).await {
            tracing::error!(
                error = %e,
                queue_url = %self.queue_url,
                "failed to delete reply queue"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::JsonCodec;
    use crate::config::MqConfig;
    use crate::memory::{MemoryQueueService, MemoryTopicService};
    use crate::message::HEADER_REQUEST_ID;
    use serde_json::json;
    use std::time::Duration;

    #[test]
    fn test_hex_token_shape() {
        let token = hex_token();
        assert_eq!(token.len(), 16);
        assert!(token.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(token, hex_token());
    }

    #[test]
    fn test_register_is_set_if_absent() {
        let pending = PendingReplies::default();
        let first = pending.register("abc");
        let second = pending.register("abc");
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(pending.len(), 1);
    }

    async fn reply_consumer_on_memory() -> (Arc<MemoryQueueService>, ReplyConsumer) {
        let qsvc = Arc::new(MemoryQueueService::new());
        let tsvc = Arc::new(MemoryTopicService::new(Arc::clone(&qsvc)));
        let registry =
            NameRegistry::new(Arc::clone(&qsvc) as _, tsvc, &MqConfig::default()).unwrap();

        let reply = ReplyConsumer::start(
            &registry,
            Arc::clone(&qsvc) as _,
            Arc::new(JsonCodec),
            "reply-",
            1,
        )
        .await
        .unwrap();

        (qsvc, reply)
    }

    #[tokio::test]
    async fn test_dispatch_reaches_registered_waiter() {
        let (qsvc, reply) = reply_consumer_on_memory().await;

        let waiter = reply.register("req-1");

        let mut headers = HashMap::new();
        headers.insert(HEADER_REQUEST_ID.to_string(), "req-1".to_string());
        qsvc.send_message(reply.queue_url(), "{\"ok\":true}", &headers)
            .await
            .unwrap();

        let message = waiter.pop(Some(Duration::from_secs(5))).await.unwrap();
        assert_eq!(message.body, json!({"ok": true}));
        assert_eq!(reply.pending_count(), 0);

        reply.stop().await;
    }

    #[tokio::test]
    async fn test_unmatched_reply_is_dropped_and_acked() {
        let (qsvc, reply) = reply_consumer_on_memory().await;

        let mut headers = HashMap::new();
        headers.insert(HEADER_REQUEST_ID.to_string(), "nobody".to_string());
        qsvc.send_message(reply.queue_url(), "{}", &headers)
            .await
            .unwrap();

        // The dispatcher acks unknown replies; the queue drains.
        for _ in 0..100 {
            if qsvc.stored_message_count(&reply_queue_name(reply.queue_url())) == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        assert_eq!(
            qsvc.stored_message_count(&reply_queue_name(reply.queue_url())),
            0
        );

        reply.stop().await;
    }

    #[tokio::test]
    async fn test_stop_deletes_reply_queue() {
        let (qsvc, reply) = reply_consumer_on_memory().await;
        let name = reply_queue_name(reply.queue_url()).to_string();

        reply.stop().await;
        assert_eq!(qsvc.get_queue_url(&name, None).await.unwrap(), None);
    }

    fn reply_queue_name(url: &str) -> &str {
        url.rsplit('/').next().unwrap()
    }
}
