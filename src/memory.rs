//! In-process queue and topic services
//!
//! A broker-less implementation of the QSVC/TSVC contracts for local
//! development and tests: long-poll receive, per-delivery receipt handles,
//! visibility timeouts, delete-by-receipt, and topic fan-out into subscribed
//! queues with message attributes forwarded intact (raw delivery).
//!
//! Selected with `mq_adapter = "memory"`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::Instant;
use uuid::Uuid;

use crate::client::{QueueService, ReceivedMessage, TopicService, ATTR_QUEUE_ARN};
use crate::error::{MqError, Result};

const ACCOUNT_ID: &str = "000000000000";
const LIST_TOPICS_PAGE_SIZE: usize = 100;

/// Visibility applied to a received message until it is deleted or reset
const DEFAULT_VISIBILITY: Duration = Duration::from_secs(30);

struct StoredMessage {
    body: String,
    attributes: HashMap<String, String>,
    visible_at: Instant,
    /// Receipt of the most recent delivery; regenerated on every receive
    receipt_handle: Option<String>,
}

struct QueueState {
    url: String,
    attributes: HashMap<String, String>,
    messages: Vec<StoredMessage>,
}

/// In-process point-to-point queue service
pub struct MemoryQueueService {
    queues: Mutex<HashMap<String, QueueState>>,
    notify: Notify,
    default_visibility: Duration,
    /// `(queue name, owner account)` per `get_queue_url` call, for tests
    /// asserting resolution behavior
    url_lookups: Mutex<Vec<(String, Option<String>)>>,
}

impl Default for MemoryQueueService {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryQueueService {
    pub fn new() -> Self {
        Self::with_default_visibility(DEFAULT_VISIBILITY)
    }

    /// Override the visibility applied on receive; tests shrink this to
    /// observe redelivery without waiting the full production window
    pub fn with_default_visibility(default_visibility: Duration) -> Self {
        Self {
            queues: Mutex::new(HashMap::new()),
            notify: Notify::new(),
            default_visibility,
            url_lookups: Mutex::new(Vec::new()),
        }
    }

    /// Recorded `get_queue_url` calls, oldest first
    pub fn url_lookups(&self) -> Vec<(String, Option<String>)> {
        self.url_lookups.lock().expect("memory qsvc lock poisoned").clone()
    }

    /// Attributes a queue was created with, if it exists
    pub fn queue_attributes_of(&self, name: &str) -> Option<HashMap<String, String>> {
        self.queues
            .lock()
            .expect("memory qsvc lock poisoned")
            .get(name)
            .map(|q| q.attributes.clone())
    }

    /// Count of messages currently stored on a queue, visible or not
    pub fn stored_message_count(&self, name: &str) -> usize {
        self.queues
            .lock()
            .expect("memory qsvc lock poisoned")
            .get(name)
            .map(|q| q.messages.len())
            .unwrap_or(0)
    }

    fn queue_url_for(name: &str) -> String {
        format!("memory://{ACCOUNT_ID}/{name}")
    }

    fn queue_arn_for(name: &str) -> String {
        format!("arn:mq:qsvc:local:{ACCOUNT_ID}:{name}")
    }

    fn name_from_url(queue_url: &str) -> Result<&str> {
        queue_url
            .rsplit('/')
            .next()
            .filter(|n| !n.is_empty())
            .ok_or_else(|| MqError::Connection(format!("malformed queue URL {queue_url:?}")))
    }

    /// Deliver directly into a named queue; used by the topic service for
    /// subscription fan-out
    fn deliver(&self, queue_name: &str, body: &str, attributes: &HashMap<String, String>) {
        let mut queues = self.queues.lock().expect("memory qsvc lock poisoned");
        if let Some(queue) = queues.get_mut(queue_name) {
            queue.messages.push(StoredMessage {
                body: body.to_string(),
                attributes: attributes.clone(),
                visible_at: Instant::now(),
                receipt_handle: None,
            });
            drop(queues);
            self.notify.notify_waiters();
        } else {
            tracing::debug!(queue_name, "fan-out target queue missing, dropping message");
        }
    }

    /// Take up to `max` visible messages; also reports the next instant a
    /// currently-invisible message becomes visible so receivers can sleep
    /// precisely
    fn take_visible(
        &self,
        queue_url: &str,
        max: usize,
    ) -> Result<(Vec<ReceivedMessage>, Option<Instant>)> {
        let now = Instant::now();
        let mut queues = self.queues.lock().expect("memory qsvc lock poisoned");

        let queue = queues
            .values_mut()
            .find(|q| q.url == queue_url)
            .ok_or_else(|| MqError::Connection(format!("no such queue: {queue_url}")))?;

        let mut taken = Vec::new();
        let mut next_visible: Option<Instant> = None;

        for message in queue.messages.iter_mut() {
            if message.visible_at <= now {
                if taken.len() < max {
                    let receipt = Uuid::new_v4().simple().to_string();
                    message.receipt_handle = Some(receipt.clone());
                    message.visible_at = now + self.default_visibility;
                    taken.push(ReceivedMessage {
                        body: message.body.clone(),
                        attributes: message.attributes.clone(),
                        receipt_handle: receipt,
                    });
                    continue;
                }
                // Visible but over `max`: available to the next receive.
                next_visible = Some(now);
            }
            next_visible = Some(match next_visible {
                Some(at) => at.min(message.visible_at),
                None => message.visible_at,
            });
        }

        Ok((taken, next_visible))
    }
}

#[async_trait]
impl QueueService for MemoryQueueService {
    async fn create_queue(
        &self,
        name: &str,
        attributes: &HashMap<String, String>,
    ) -> Result<String> {
        let mut queues = self.queues.lock().expect("memory qsvc lock poisoned");
        let queue = queues.entry(name.to_string()).or_insert_with(|| QueueState {
            url: Self::queue_url_for(name),
            attributes: attributes.clone(),
            messages: Vec::new(),
        });
        Ok(queue.url.clone())
    }

    async fn get_queue_url(
        &self,
        name: &str,
        owner_account_id: Option<&str>,
    ) -> Result<Option<String>> {
        self.url_lookups
            .lock()
            .expect("memory qsvc lock poisoned")
            .push((name.to_string(), owner_account_id.map(str::to_string)));

        let queues = self.queues.lock().expect("memory qsvc lock poisoned");
        Ok(queues.get(name).map(|q| q.url.clone()))
    }

    async fn delete_queue(&self, queue_url: &str) -> Result<()> {
        let name = Self::name_from_url(queue_url)?.to_string();
        self.queues
            .lock()
            .expect("memory qsvc lock poisoned")
            .remove(&name);
        Ok(())
    }

    async fn receive_message(
        &self,
        queue_url: &str,
        max_messages: i32,
        wait_time_secs: i32,
    ) -> Result<Vec<ReceivedMessage>> {
        let deadline = Instant::now() + Duration::from_secs(wait_time_secs.max(0) as u64);
        let max = max_messages.max(1) as usize;

        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);

            let (taken, next_visible) = self.take_visible(queue_url, max)?;
            if !taken.is_empty() {
                return Ok(taken);
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }

            // Wake at the long-poll deadline, when an invisible message
            // becomes visible again, or when a send arrives.
            let wake_at = next_visible.map_or(deadline, |at| at.min(deadline));
            let _ = tokio::time::timeout_at(wake_at, notified).await;
        }
    }

    async fn send_message(
        &self,
        queue_url: &str,
        body: &str,
        attributes: &HashMap<String, String>,
    ) -> Result<()> {
        {
            let mut queues = self.queues.lock().expect("memory qsvc lock poisoned");
            let queue = queues
                .values_mut()
                .find(|q| q.url == queue_url)
                .ok_or_else(|| MqError::Connection(format!("no such queue: {queue_url}")))?;

            queue.messages.push(StoredMessage {
                body: body.to_string(),
                attributes: attributes.clone(),
                visible_at: Instant::now(),
                receipt_handle: None,
            });
        }

        self.notify.notify_waiters();
        Ok(())
    }

    async fn delete_message(&self, queue_url: &str, receipt_handle: &str) -> Result<()> {
        let mut queues = self.queues.lock().expect("memory qsvc lock poisoned");
        if let Some(queue) = queues.values_mut().find(|q| q.url == queue_url) {
            queue
                .messages
                .retain(|m| m.receipt_handle.as_deref() != Some(receipt_handle));
        }
        Ok(())
    }

    async fn change_message_visibility(
        &self,
        queue_url: &str,
        receipt_handle: &str,
        visibility_timeout_secs: i32,
    ) -> Result<()> {
        {
            let mut queues = self.queues.lock().expect("memory qsvc lock poisoned");
            let queue = queues
                .values_mut()
                .find(|q| q.url == queue_url)
                .ok_or_else(|| MqError::Connection(format!("no such queue: {queue_url}")))?;

            if let Some(message) = queue
                .messages
                .iter_mut()
                .find(|m| m.receipt_handle.as_deref() == Some(receipt_handle))
            {
                message.visible_at =
                    Instant::now() + Duration::from_secs(visibility_timeout_secs.max(0) as u64);
            }
        }

        self.notify.notify_waiters();
        Ok(())
    }

    async fn get_queue_attributes(
        &self,
        queue_url: &str,
        attribute_names: &[&str],
    ) -> Result<HashMap<String, String>> {
        let name = Self::name_from_url(queue_url)?.to_string();

        let queues = self.queues.lock().expect("memory qsvc lock poisoned");
        if !queues.contains_key(&name) {
            return Err(MqError::Connection(format!("no such queue: {queue_url}")));
        }

        let mut attributes = HashMap::new();
        if attribute_names.contains(&ATTR_QUEUE_ARN) {
            attributes.insert(ATTR_QUEUE_ARN.to_string(), Self::queue_arn_for(&name));
        }
        Ok(attributes)
    }
}

struct TopicState {
    arn: String,
    /// Subscribed queue ARNs
    subscriptions: Vec<String>,
}

/// In-process topic fan-out service, delivering into a [`MemoryQueueService`]
pub struct MemoryTopicService {
    qsvc: Arc<MemoryQueueService>,
    topics: Mutex<HashMap<String, TopicState>>,
}

impl MemoryTopicService {
    pub fn new(qsvc: Arc<MemoryQueueService>) -> Self {
        Self {
            qsvc,
            topics: Mutex::new(HashMap::new()),
        }
    }

    fn topic_arn_for(name: &str) -> String {
        format!("arn:mq:tsvc:local:{ACCOUNT_ID}:{name}")
    }

    fn queue_name_from_arn(queue_arn: &str) -> Option<&str> {
        queue_arn.rsplit(':').next().filter(|n| !n.is_empty())
    }
}

#[async_trait]
impl TopicService for MemoryTopicService {
    async fn create_topic(
        &self,
        name: &str,
        _attributes: &HashMap<String, String>,
    ) -> Result<String> {
        let mut topics = self.topics.lock().expect("memory tsvc lock poisoned");
        let topic = topics.entry(name.to_string()).or_insert_with(|| TopicState {
            arn: Self::topic_arn_for(name),
            subscriptions: Vec::new(),
        });
        Ok(topic.arn.clone())
    }

    async fn list_topics(
        &self,
        next_token: Option<&str>,
    ) -> Result<(Vec<String>, Option<String>)> {
        let topics = self.topics.lock().expect("memory tsvc lock poisoned");

        let mut arns: Vec<String> = topics.values().map(|t| t.arn.clone()).collect();
        arns.sort();

        let offset = match next_token {
            Some(token) => token
                .parse::<usize>()
                .map_err(|_| MqError::Connection(format!("invalid pagination token {token:?}")))?,
            None => 0,
        };

        let page: Vec<String> = arns
            .iter()
            .skip(offset)
            .take(LIST_TOPICS_PAGE_SIZE)
            .cloned()
            .collect();
        let next = (offset + page.len() < arns.len()).then(|| (offset + page.len()).to_string());

        Ok((page, next))
    }

    async fn publish(
        &self,
        topic_arn: &str,
        message: &str,
        attributes: &HashMap<String, String>,
    ) -> Result<()> {
        let subscriptions = {
            let topics = self.topics.lock().expect("memory tsvc lock poisoned");
            let topic = topics
                .values()
                .find(|t| t.arn == topic_arn)
                .ok_or_else(|| MqError::Connection(format!("no such topic: {topic_arn}")))?;
            topic.subscriptions.clone()
        };

        for queue_arn in subscriptions {
            if let Some(queue_name) = Self::queue_name_from_arn(&queue_arn) {
                self.qsvc.deliver(queue_name, message, attributes);
            }
        }

        Ok(())
    }

    async fn subscribe(
        &self,
        topic_arn: &str,
        _protocol: &str,
        endpoint: &str,
        _attributes: &HashMap<String, String>,
    ) -> Result<String> {
        let mut topics = self.topics.lock().expect("memory tsvc lock poisoned");
        let topic = topics
            .values_mut()
            .find(|t| t.arn == topic_arn)
            .ok_or_else(|| MqError::Connection(format!("no such topic: {topic_arn}")))?;

        if !topic.subscriptions.iter().any(|s| s == endpoint) {
            topic.subscriptions.push(endpoint.to_string());
        }

        Ok(format!("{topic_arn}:{}", Uuid::new_v4().simple()))
    }
}
