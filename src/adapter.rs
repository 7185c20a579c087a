//! Adapter façade
//!
//! The public surface of the messaging layer: lifecycle (`start`/`stop`),
//! the three producer verbs (`command`, `query`, `event`), and the consumer
//! registrations (`start_request_processor`,
//! `start_event_processor_with_queue`). One adapter value owns the service
//! clients, the name registry, the shared worker pool, every consumer it
//! started, and the lazily-created reply correlator.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::client::{QueueService, TopicService};
use crate::codec::{Codec, JsonCodec};
use crate::config::MqConfig;
use crate::consumer::{Consumer, MessageHandler};
use crate::error::{MqError, Result};
use crate::memory::{MemoryQueueService, MemoryTopicService};
use crate::message::{Message, ProtocolHeaders, Target};
use crate::registry::NameRegistry;
use crate::reply::{hex_token, ReplyConsumer};
use crate::worker_pool::WorkerPool;

/// Name probed on start to verify both services are reachable
const AVAILABILITY_PROBE: &str = "availability-check";

/// Application-side message processor
///
/// Request processors receive `call_command` and `call_query` dispatches by
/// method name; event processors receive `call_event` dispatches by event
/// type. Returning [`MqError::Nack`] requests redelivery.
#[async_trait]
pub trait MessageProcessor: Send + Sync {
    async fn call_command(&self, method: &str, message: Message) -> Result<()>;

    async fn call_query(&self, method: &str, message: Message) -> Result<Value>;

    async fn call_event(&self, event_type: &str, message: Message) -> Result<()>;
}

/// The messaging adapter surface the host framework drives
#[async_trait]
pub trait MqAdapter: Send + Sync {
    /// Construct clients, start the worker pool, verify service availability
    async fn start(&self) -> Result<()>;

    /// Stop all processors, drain the pool, drop clients and caches
    async fn stop(&self) -> Result<()>;

    /// Fire-and-forget point-to-point send to `"queue/method"`
    async fn command(&self, target: &str, body: Value) -> Result<()>;

    /// Request/reply to `"queue/method"`, waiting up to `timeout`
    /// (`mq_default_query_timeout` when `None`)
    async fn query(&self, target: &str, body: Value, timeout: Option<Duration>) -> Result<Value>;

    /// Publish to `"topic#event_type"`, creating the topic when missing
    async fn event(&self, target: &str, body: Value) -> Result<()>;

    /// Consume a request queue, dispatching commands and queries to
    /// `processor`
    async fn start_request_processor(
        &self,
        queue_name: &str,
        processor: Arc<dyn MessageProcessor>,
    ) -> Result<()>;

    /// Consume a topic through an adapter-managed private queue
    async fn start_event_processor(
        &self,
        topic_name: &str,
        processor: Arc<dyn MessageProcessor>,
    ) -> Result<()>;

    /// Subscribe `queue_name` to `topic_name` and consume it, dispatching
    /// events to `processor`
    async fn start_event_processor_with_queue(
        &self,
        topic_name: &str,
        queue_name: &str,
        processor: Arc<dyn MessageProcessor>,
    ) -> Result<()>;

    /// Signal every consumer, then join them all; total stop time is about
    /// one long-poll window rather than one per consumer
    async fn stop_all_processors(&self) -> Result<()>;
}

/// Everything that exists only between `start` and `stop`
struct Running {
    qsvc: Arc<dyn QueueService>,
    tsvc: Arc<dyn TopicService>,
    registry: Arc<NameRegistry>,
    pool: Arc<WorkerPool>,
    consumers: Mutex<Vec<Arc<Consumer>>>,
    reply: tokio::sync::Mutex<Option<Arc<ReplyConsumer>>>,
}

/// SQS/SNS-backed implementation of [`MqAdapter`]
pub struct SqsSnsAdapter {
    config: MqConfig,
    codec: Arc<dyn Codec>,
    injected_clients: Mutex<Option<(Arc<dyn QueueService>, Arc<dyn TopicService>)>>,
    running: tokio::sync::Mutex<Option<Arc<Running>>>,
}

impl SqsSnsAdapter {
    /// Adapter whose clients are built from config on `start`
    pub fn new(config: MqConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            codec: Arc::new(JsonCodec),
            injected_clients: Mutex::new(None),
            running: tokio::sync::Mutex::new(None),
        })
    }

    /// Adapter bound to caller-provided service clients (the `"memory"`
    /// selector and tests use this)
    pub fn with_clients(
        config: MqConfig,
        qsvc: Arc<dyn QueueService>,
        tsvc: Arc<dyn TopicService>,
    ) -> Result<Self> {
        let adapter = Self::new(config)?;
        *adapter
            .injected_clients
            .lock()
            .expect("adapter lock poisoned") = Some((qsvc, tsvc));
        Ok(adapter)
    }

    /// Replace the default JSON codec
    pub fn with_codec(mut self, codec: Arc<dyn Codec>) -> Self {
        self.codec = codec;
        self
    }

    /// Queries currently awaiting a reply
    ///
    /// Zero when the adapter is stopped or no query has run yet. Diagnostic:
    /// a value that only grows indicates leaked correlator entries.
    pub async fn pending_queries(&self) -> usize {
        match self.running.lock().await.as_ref() {
            Some(running) => match running.reply.lock().await.as_ref() {
                Some(reply) => reply.pending_count(),
                None => 0,
            },
            None => 0,
        }
    }

    async fn running(&self) -> Result<Arc<Running>> {
        self.running
            .lock()
            .await
            .clone()
            .ok_or_else(|| MqError::Config("adapter is not started".to_string()))
    }

    async fn build_clients(&self) -> Result<(Arc<dyn QueueService>, Arc<dyn TopicService>)> {
        if let Some(clients) = self
            .injected_clients
            .lock()
            .expect("adapter lock poisoned")
            .clone()
        {
            return Ok(clients);
        }

        #[cfg(feature = "aws")]
        return crate::aws::build_clients(&self.config).await;

        #[cfg(not(feature = "aws"))]
        Err(MqError::Config(
            "built without the aws feature and no clients were injected".to_string(),
        ))
    }

    /// Lazily create the reply correlator; a lock guards construction so
    /// concurrent first queries share one reply queue
    async fn reply_consumer(&self, running: &Running) -> Result<Arc<ReplyConsumer>> {
        let mut guard = running.reply.lock().await;
        if let Some(reply) = &*guard {
            return Ok(Arc::clone(reply));
        }

        let reply = Arc::new(
            ReplyConsumer::start(
                &running.registry,
                Arc::clone(&running.qsvc),
                Arc::clone(&self.codec),
                &self.config.reply_queue_prefix,
                self.config.aws_sqs_read_timeout,
            )
            .await?,
        );

        *guard = Some(Arc::clone(&reply));
        Ok(reply)
    }

    /// Resolve a queue URL, creating the queue when it does not exist
    async fn ensure_queue(&self, running: &Running, queue_name: &str) -> Result<String> {
        match running.registry.queue_url(queue_name).await? {
            Some(url) => Ok(url),
            None => running.registry.create_queue(queue_name).await,
        }
    }

    /// Resolve a topic ARN, creating the topic when it does not exist
    async fn ensure_topic(&self, running: &Running, topic_name: &str) -> Result<String> {
        match running.registry.topic_arn(topic_name).await? {
            Some(arn) => Ok(arn),
            None => running.registry.create_topic(topic_name).await,
        }
    }

    fn register_consumer(
        &self,
        running: &Running,
        queue_url: String,
        handler: Arc<dyn MessageHandler>,
        pool: Option<Arc<WorkerPool>>,
    ) {
        let consumer = Arc::new(Consumer::new(
            Arc::clone(&running.qsvc),
            Arc::clone(&self.codec),
            queue_url,
            handler,
            pool,
            self.config.aws_sqs_read_timeout,
        ));
        consumer.start();

        running
            .consumers
            .lock()
            .expect("adapter lock poisoned")
            .push(consumer);
    }
}

/// Signal all consumers, join them, then stop the reply correlator
async fn drain_processors(running: &Running) {
    let consumers = std::mem::take(
        &mut *running
            .consumers
            .lock()
            .expect("adapter lock poisoned"),
    );

    for consumer in &consumers {
        consumer.signal_stop();
    }
    for consumer in &consumers {
        consumer.stop().await;
    }

    if let Some(reply) = running.reply.lock().await.take() {
        reply.stop().await;
    }
}

#[async_trait]
impl MqAdapter for SqsSnsAdapter {
    async fn start(&self) -> Result<()> {
        let mut guard = self.running.lock().await;
        if guard.is_some() {
            return Err(MqError::Config("adapter is already started".to_string()));
        }

        let (qsvc, tsvc) = self.build_clients().await?;
        let registry = Arc::new(NameRegistry::new(
            Arc::clone(&qsvc),
            Arc::clone(&tsvc),
            &self.config,
        )?);

        // Availability check: both services must answer a harmless lookup.
        registry.queue_url(AVAILABILITY_PROBE).await?;
        registry.topic_arn(AVAILABILITY_PROBE).await?;

        let pool = Arc::new(WorkerPool::new(
            self.config.worker_pool_min_threads,
            self.config.worker_pool_max_threads,
            self.config.worker_pool_max_backlog,
        ));

        *guard = Some(Arc::new(Running {
            qsvc,
            tsvc,
            registry,
            pool,
            consumers: Mutex::new(Vec::new()),
            reply: tokio::sync::Mutex::new(None),
        }));

        tracing::info!(adapter = %self.config.adapter, "Messaging adapter started");
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let running = self.running.lock().await.take();

        if let Some(running) = running {
            drain_processors(&running).await;
            running.pool.shutdown().await;
            running.registry.clear();
            tracing::info!("Messaging adapter stopped");
        }

        Ok(())
    }

    async fn command(&self, target: &str, body: Value) -> Result<()> {
        let (queue, method) = Target::parse_queue(target)?;
        let running = self.running().await?;

        let queue_url = running
            .registry
            .queue_url(&queue)
            .await?
            .ok_or_else(|| MqError::Connection(format!("queue not found: {queue}")))?;

        let headers = ProtocolHeaders {
            method: Some(method.clone()),
            ..ProtocolHeaders::default()
        }
        .into_map();
        let payload = self.codec.encode(&body)?;

        running
            .qsvc
            .send_message(&queue_url, &payload, &headers)
            .await?;

        tracing::debug!(queue = %queue, method = %method, "Command sent");
        Ok(())
    }

    async fn query(&self, target: &str, body: Value, timeout: Option<Duration>) -> Result<Value> {
        let (queue, method) = Target::parse_queue(target)?;
        let running = self.running().await?;

        let queue_url = running
            .registry
            .queue_url(&queue)
            .await?
            .ok_or_else(|| MqError::Connection(format!("queue not found: {queue}")))?;

        let reply = self.reply_consumer(&running).await?;
        let request_id = hex_token();
        let waiter = reply.register(&request_id);

        let headers = ProtocolHeaders {
            method: Some(method.clone()),
            request_id: Some(request_id.clone()),
            reply_queue_url: Some(reply.queue_url().to_string()),
            ..ProtocolHeaders::default()
        }
        .into_map();
        let payload = self.codec.encode(&body)?;

        if let Err(e) = running
            .qsvc
            .send_message(&queue_url, &payload, &headers)
            .await
        {
            reply.remove(&request_id);
            return Err(e);
        }

        let timeout = timeout.unwrap_or_else(|| self.config.default_query_timeout());
        match waiter.pop(Some(timeout)).await {
            Some(message) => {
                tracing::debug!(queue = %queue, method = %method, "Query answered");
                Ok(message.body)
            }
            None => {
                reply.remove(&request_id);
                tracing::debug!(
                    queue = %queue,
                    method = %method,
                    request_id = %request_id,
                    "Query timed out"
                );
                Err(MqError::Timeout(timeout))
            }
        }
    }

    async fn event(&self, target: &str, body: Value) -> Result<()> {
        let (topic, event_type) = Target::parse_topic(target)?;
        let running = self.running().await?;

        let topic_arn = self.ensure_topic(&running, &topic).await?;

        let headers = ProtocolHeaders {
            event_type: Some(event_type.clone()),
            ..ProtocolHeaders::default()
        }
        .into_map();
        let payload = self.codec.encode(&body)?;

        running.tsvc.publish(&topic_arn, &payload, &headers).await?;

        tracing::debug!(topic = %topic, event_type = %event_type, "Event published");
        Ok(())
    }

    async fn start_request_processor(
        &self,
        queue_name: &str,
        processor: Arc<dyn MessageProcessor>,
    ) -> Result<()> {
        let running = self.running().await?;
        let queue_url = self.ensure_queue(&running, queue_name).await?;

        let dispatcher = Arc::new(RequestDispatcher {
            processor,
            qsvc: Arc::clone(&running.qsvc),
            codec: Arc::clone(&self.codec),
        });

        self.register_consumer(
            &running,
            queue_url,
            dispatcher,
            Some(Arc::clone(&running.pool)),
        );

        tracing::info!(queue = %queue_name, "Request processor started");
        Ok(())
    }

    async fn start_event_processor(
        &self,
        topic_name: &str,
        _processor: Arc<dyn MessageProcessor>,
    ) -> Result<()> {
        Err(MqError::Config(format!(
            "start_event_processor is not implemented for topic {topic_name:?}; \
             use start_event_processor_with_queue"
        )))
    }

    async fn start_event_processor_with_queue(
        &self,
        topic_name: &str,
        queue_name: &str,
        processor: Arc<dyn MessageProcessor>,
    ) -> Result<()> {
        let running = self.running().await?;

        let topic_arn = self.ensure_topic(&running, topic_name).await?;
        let queue_url = self.ensure_queue(&running, queue_name).await?;
        running.registry.subscribe(&topic_arn, &queue_url).await?;

        let dispatcher = Arc::new(EventDispatcher { processor });
        self.register_consumer(
            &running,
            queue_url,
            dispatcher,
            Some(Arc::clone(&running.pool)),
        );

        tracing::info!(
            topic = %topic_name,
            queue = %queue_name,
            "Event processor started"
        );
        Ok(())
    }

    async fn stop_all_processors(&self) -> Result<()> {
        if let Some(running) = self.running.lock().await.clone() {
            drain_processors(&running).await;
        }
        Ok(())
    }
}

/// Routes request-queue messages to `call_query` or `call_command`
struct RequestDispatcher {
    processor: Arc<dyn MessageProcessor>,
    qsvc: Arc<dyn QueueService>,
    codec: Arc<dyn Codec>,
}

impl RequestDispatcher {
    async fn respond(&self, reply_queue_url: &str, request_id: Option<String>, response: Value) -> Result<()> {
        let headers = ProtocolHeaders {
            request_id,
            ..ProtocolHeaders::default()
        }
        .into_map();

        let payload = self.codec.encode(&response)?;
        self.qsvc
            .send_message(reply_queue_url, &payload, &headers)
            .await
    }
}

#[async_trait]
impl MessageHandler for RequestDispatcher {
    async fn handle(&self, message: Message) -> Result<()> {
        let method = message.method().unwrap_or_default().to_string();

        match message.reply_queue_url().map(str::to_string) {
            Some(reply_queue_url) => {
                let request_id = message.request_id().map(str::to_string);
                let response = self.processor.call_query(&method, message).await?;

                // A response we cannot deliver is recovered: the request is
                // still acked and the requester observes its timeout.
                if let Err(e) = self.respond(&reply_queue_url, request_id, response).await {
                    tracing::error!(
                        error = %e,
                        reply_queue_url = %reply_queue_url,
                        "failed to deliver query response"
                    );
                }
                Ok(())
            }
            None => self.processor.call_command(&method, message).await,
        }
    }
}

/// Routes subscription-queue messages to `call_event`
struct EventDispatcher {
    processor: Arc<dyn MessageProcessor>,
}

#[async_trait]
impl MessageHandler for EventDispatcher {
    async fn handle(&self, message: Message) -> Result<()> {
        let event_type = message.event_type().unwrap_or_default().to_string();
        self.processor.call_event(&event_type, message).await
    }
}

/// Build an adapter from the `mq_adapter` selector
pub fn create_adapter(config: &MqConfig) -> Result<Arc<dyn MqAdapter>> {
    config.validate()?;

    match config.adapter.as_str() {
        "sqs_sns" => Ok(Arc::new(SqsSnsAdapter::new(config.clone())?)),
        "memory" => {
            let qsvc = Arc::new(MemoryQueueService::new());
            let tsvc = Arc::new(MemoryTopicService::new(Arc::clone(&qsvc)));
            Ok(Arc::new(SqsSnsAdapter::with_clients(
                config.clone(),
                qsvc,
                tsvc,
            )?))
        }
        other => Err(MqError::Config(format!("unknown mq_adapter {other:?}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_config() -> MqConfig {
        MqConfig {
            adapter: "memory".to_string(),
            aws_sqs_read_timeout: 1,
            ..MqConfig::default()
        }
    }

    #[test]
    fn test_factory_rejects_unknown_selector() {
        let config = MqConfig {
            adapter: "carrier-pigeon".to_string(),
            ..MqConfig::default()
        };
        assert!(matches!(
            create_adapter(&config),
            Err(MqError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_producer_calls_require_start() {
        let adapter = create_adapter(&memory_config()).unwrap();
        let result = adapter.command("users/create", serde_json::json!({})).await;
        assert!(matches!(result, Err(MqError::Config(_))));
    }

    #[tokio::test]
    async fn test_double_start_rejected() {
        let adapter = create_adapter(&memory_config()).unwrap();
        adapter.start().await.unwrap();
        assert!(adapter.start().await.is_err());
        adapter.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_without_start_is_noop() {
        let adapter = create_adapter(&memory_config()).unwrap();
        adapter.stop().await.unwrap();
        adapter.stop_all_processors().await.unwrap();
    }

    #[tokio::test]
    async fn test_restart_after_stop() {
        let adapter = create_adapter(&memory_config()).unwrap();
        adapter.start().await.unwrap();
        adapter.stop().await.unwrap();
        adapter.start().await.unwrap();
        adapter.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_start_event_processor_without_queue_rejected() {
        let adapter = create_adapter(&memory_config()).unwrap();
        adapter.start().await.unwrap();

        struct Noop;
        #[async_trait]
        impl MessageProcessor for Noop {
            async fn call_command(&self, _: &str, _: Message) -> Result<()> {
                Ok(())
            }
            async fn call_query(&self, _: &str, _: Message) -> Result<Value> {
                Ok(Value::Null)
            }
            async fn call_event(&self, _: &str, _: Message) -> Result<()> {
                Ok(())
            }
        }

        let result = adapter
            .start_event_processor("hello", Arc::new(Noop))
            .await;
        assert!(matches!(result, Err(MqError::Config(_))));

        adapter.stop().await.unwrap();
    }
}
