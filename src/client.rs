//! Queue and topic service client traits
//!
//! The adapter talks to the point-to-point queue service (QSVC, SQS-shaped)
//! and the topic fan-out service (TSVC, SNS-shaped) through these traits so
//! the runtime can be driven against the real AWS SDK clients or the
//! in-process pair from [`crate::memory`].

use std::collections::HashMap;

use async_trait::async_trait;

use crate::error::Result;

/// Queue attribute name carrying the queue's ARN
pub const ATTR_QUEUE_ARN: &str = "QueueArn";
/// Queue/topic attribute enabling at-rest encryption
pub const ATTR_KMS_MASTER_KEY_ID: &str = "KmsMasterKeyId";
/// Subscription attribute disabling the SNS JSON envelope
pub const ATTR_RAW_MESSAGE_DELIVERY: &str = "RawMessageDelivery";

/// A message pulled from a queue
#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    /// Raw body, as produced by the sender's codec
    pub body: String,

    /// String-typed message attributes (the adapter's header map)
    pub attributes: HashMap<String, String>,

    /// Opaque token for ack (delete) and nack (visibility reset)
    pub receipt_handle: String,
}

/// Point-to-point queue service operations
#[async_trait]
pub trait QueueService: Send + Sync {
    /// Create a queue, returning its URL. Idempotent per QSVC semantics.
    async fn create_queue(
        &self,
        name: &str,
        attributes: &HashMap<String, String>,
    ) -> Result<String>;

    /// Resolve a queue name to its URL.
    ///
    /// Returns `Ok(None)` when the queue does not exist; any other failure
    /// is a connection error. `owner_account_id` addresses queues owned by
    /// another account.
    async fn get_queue_url(
        &self,
        name: &str,
        owner_account_id: Option<&str>,
    ) -> Result<Option<String>>;

    async fn delete_queue(&self, queue_url: &str) -> Result<()>;

    /// Long-poll receive of up to `max_messages`, waiting `wait_time_secs`
    async fn receive_message(
        &self,
        queue_url: &str,
        max_messages: i32,
        wait_time_secs: i32,
    ) -> Result<Vec<ReceivedMessage>>;

    async fn send_message(
        &self,
        queue_url: &str,
        body: &str,
        attributes: &HashMap<String, String>,
    ) -> Result<()>;

    /// ACK: remove the message identified by `receipt_handle`
    async fn delete_message(&self, queue_url: &str, receipt_handle: &str) -> Result<()>;

    /// NACK support: make the message re-available after `visibility_timeout_secs`
    async fn change_message_visibility(
        &self,
        queue_url: &str,
        receipt_handle: &str,
        visibility_timeout_secs: i32,
    ) -> Result<()>;

    /// Fetch queue attributes by name (e.g. [`ATTR_QUEUE_ARN`])
    async fn get_queue_attributes(
        &self,
        queue_url: &str,
        attribute_names: &[&str],
    ) -> Result<HashMap<String, String>>;
}

/// Topic fan-out service operations
#[async_trait]
pub trait TopicService: Send + Sync {
    /// Create a topic, returning its ARN. Idempotent per TSVC semantics.
    async fn create_topic(
        &self,
        name: &str,
        attributes: &HashMap<String, String>,
    ) -> Result<String>;

    /// One page of topic ARNs plus the continuation token, if any
    async fn list_topics(
        &self,
        next_token: Option<&str>,
    ) -> Result<(Vec<String>, Option<String>)>;

    async fn publish(
        &self,
        topic_arn: &str,
        message: &str,
        attributes: &HashMap<String, String>,
    ) -> Result<()>;

    /// Subscribe an endpoint to a topic, returning the subscription ARN
    async fn subscribe(
        &self,
        topic_arn: &str,
        protocol: &str,
        endpoint: &str,
        attributes: &HashMap<String, String>,
    ) -> Result<String>;
}
