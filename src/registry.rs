//! Queue/topic name resolution
//!
//! Every logical name is prefixed with the configured namespace and run
//! through the transport alphabet translation (`.` is not legal in queue or
//! topic names, so it becomes `-`). The resulting fully qualified name is
//! the cache key for the lazily-populated URL and ARN registries.
//!
//! SDK calls happen outside the cache locks; results are inserted with
//! set-if-absent semantics, so concurrent resolvers agree on one entry.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::client::{
    QueueService, TopicService, ATTR_KMS_MASTER_KEY_ID, ATTR_QUEUE_ARN, ATTR_RAW_MESSAGE_DELIVERY,
};
use crate::config::MqConfig;
use crate::error::{MqError, Result};

/// Characters QSVC/TSVC reject, with their substitutions
const ALPHABET_MAP: [(char, char); 1] = [('.', '-')];

fn translate(name: &str) -> String {
    name.chars()
        .map(|c| {
            ALPHABET_MAP
                .iter()
                .find(|(from, _)| *from == c)
                .map(|(_, to)| *to)
                .unwrap_or(c)
        })
        .collect()
}

/// Name-to-URL/ARN resolver with per-process caches
pub struct NameRegistry {
    qsvc: Arc<dyn QueueService>,
    tsvc: Arc<dyn TopicService>,
    namespace: String,
    kms_master_key_id: Option<String>,
    /// Original (pre-namespace) queue name -> owning account id
    cross_account: HashMap<String, String>,
    queue_urls: Mutex<HashMap<String, String>>,
    topic_arns: Mutex<HashMap<String, String>>,
}

impl NameRegistry {
    pub fn new(
        qsvc: Arc<dyn QueueService>,
        tsvc: Arc<dyn TopicService>,
        config: &MqConfig,
    ) -> Result<Self> {
        Ok(Self {
            qsvc,
            tsvc,
            namespace: config.namespace.clone(),
            kms_master_key_id: config.aws_sqs_sns_kms_master_key_id.clone(),
            cross_account: config.cross_account_map()?,
            queue_urls: Mutex::new(HashMap::new()),
            topic_arns: Mutex::new(HashMap::new()),
        })
    }

    /// Fully qualified transport name: namespace prefix, then alphabet
    /// translation
    pub fn fqn(&self, name: &str) -> String {
        translate(&format!("{}{}", self.namespace, name))
    }

    fn creation_attributes(&self) -> HashMap<String, String> {
        let mut attributes = HashMap::new();
        if let Some(key) = &self.kms_master_key_id {
            attributes.insert(ATTR_KMS_MASTER_KEY_ID.to_string(), key.clone());
        }
        attributes
    }

    /// Resolve a queue name to its URL
    ///
    /// `Ok(None)` means the queue does not exist. Cross-account queues are
    /// looked up with their owning account, keyed by the original name.
    pub async fn queue_url(&self, name: &str) -> Result<Option<String>> {
        let fqn = self.fqn(name);

        if let Some(url) = self
            .queue_urls
            .lock()
            .expect("registry lock poisoned")
            .get(&fqn)
        {
            return Ok(Some(url.clone()));
        }

        let owner = self.cross_account.get(name).map(String::as_str);
        match self.qsvc.get_queue_url(&fqn, owner).await? {
            Some(url) => {
                let mut cache = self.queue_urls.lock().expect("registry lock poisoned");
                Ok(Some(cache.entry(fqn).or_insert(url).clone()))
            }
            None => Ok(None),
        }
    }

    /// Resolve a topic name to its ARN by scanning the paginated topic list
    ///
    /// `Ok(None)` means no topic with the matching name suffix exists.
    pub async fn topic_arn(&self, name: &str) -> Result<Option<String>> {
        let fqn = self.fqn(name);

        if let Some(arn) = self
            .topic_arns
            .lock()
            .expect("registry lock poisoned")
            .get(&fqn)
        {
            return Ok(Some(arn.clone()));
        }

        let mut next_token: Option<String> = None;
        loop {
            let (arns, next) = self.tsvc.list_topics(next_token.as_deref()).await?;

            if let Some(arn) = arns
                .into_iter()
                .find(|arn| arn.rsplit(':').next() == Some(fqn.as_str()))
            {
                let mut cache = self.topic_arns.lock().expect("registry lock poisoned");
                return Ok(Some(cache.entry(fqn).or_insert(arn).clone()));
            }

            match next {
                Some(token) => next_token = Some(token),
                None => return Ok(None),
            }
        }
    }

    /// Create a queue (idempotent) and cache its URL
    pub async fn create_queue(&self, name: &str) -> Result<String> {
        let fqn = self.fqn(name);
        let url = self
            .qsvc
            .create_queue(&fqn, &self.creation_attributes())
            .await?;

        tracing::info!(queue = %fqn, url = %url, "Queue created");

        let mut cache = self.queue_urls.lock().expect("registry lock poisoned");
        Ok(cache.entry(fqn).or_insert(url).clone())
    }

    /// Create a topic (idempotent) and cache its ARN
    pub async fn create_topic(&self, name: &str) -> Result<String> {
        let fqn = self.fqn(name);
        let arn = self
            .tsvc
            .create_topic(&fqn, &self.creation_attributes())
            .await?;

        tracing::info!(topic = %fqn, arn = %arn, "Topic created");

        let mut cache = self.topic_arns.lock().expect("registry lock poisoned");
        Ok(cache.entry(fqn).or_insert(arn).clone())
    }

    /// Delete a queue by URL and drop it from the cache
    pub async fn delete_queue(&self, queue_url: &str) -> Result<()> {
        self.qsvc.delete_queue(queue_url).await?;
        self.queue_urls
            .lock()
            .expect("registry lock poisoned")
            .retain(|_, url| url != queue_url);
        Ok(())
    }

    /// Wire a queue to a topic with raw message delivery
    ///
    /// Raw delivery keeps the body and attributes intact end-to-end instead
    /// of wrapping them in a JSON envelope on arrival at the queue.
    pub async fn subscribe(&self, topic_arn: &str, queue_url: &str) -> Result<String> {
        let queue_attributes = self
            .qsvc
            .get_queue_attributes(queue_url, &[ATTR_QUEUE_ARN])
            .await?;

        let queue_arn = queue_attributes.get(ATTR_QUEUE_ARN).ok_or_else(|| {
            MqError::Connection(format!("queue {queue_url} did not report its ARN"))
        })?;

        let mut attributes = HashMap::new();
        attributes.insert(ATTR_RAW_MESSAGE_DELIVERY.to_string(), "true".to_string());

        let subscription_arn = self
            .tsvc
            .subscribe(topic_arn, "sqs", queue_arn, &attributes)
            .await?;

        tracing::info!(
            topic_arn = %topic_arn,
            queue_arn = %queue_arn,
            "Queue subscribed to topic"
        );

        Ok(subscription_arn)
    }

    /// Drop all cached mappings; called on adapter stop
    pub fn clear(&self) {
        self.queue_urls
            .lock()
            .expect("registry lock poisoned")
            .clear();
        self.topic_arns
            .lock()
            .expect("registry lock poisoned")
            .clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryQueueService, MemoryTopicService};
    use std::sync::Arc;

    fn registry_with(config: MqConfig) -> (Arc<MemoryQueueService>, NameRegistry) {
        let qsvc = Arc::new(MemoryQueueService::new());
        let tsvc = Arc::new(MemoryTopicService::new(Arc::clone(&qsvc)));
        let registry = NameRegistry::new(Arc::clone(&qsvc) as _, tsvc, &config).unwrap();
        (qsvc, registry)
    }

    #[test]
    fn test_fqn_applies_namespace_then_translation() {
        let (_, registry) = registry_with(MqConfig {
            namespace: "svc.".to_string(),
            ..MqConfig::default()
        });

        assert_eq!(registry.fqn("users"), "svc-users");
        assert_eq!(registry.fqn("a.hello"), "svc-a-hello");
    }

    #[test]
    fn test_fqn_idempotent_without_namespace() {
        let (_, registry) = registry_with(MqConfig::default());

        let once = registry.fqn("a.hello");
        assert_eq!(registry.fqn(&once), once);
    }

    #[tokio::test]
    async fn test_queue_url_miss_is_absent_not_error() {
        let (_, registry) = registry_with(MqConfig::default());
        assert_eq!(registry.queue_url("ghost").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_queue_url_cached_after_first_lookup() {
        let (qsvc, registry) = registry_with(MqConfig::default());
        registry.create_queue("users").await.unwrap();

        // create_queue already cached the URL; no lookup should be issued.
        let url = registry.queue_url("users").await.unwrap();
        assert!(url.is_some());
        assert!(qsvc.url_lookups().is_empty());
    }

    #[tokio::test]
    async fn test_cross_account_lookup_uses_fqn_and_owner_account() {
        let (qsvc, registry) = registry_with(MqConfig {
            namespace: "svc.".to_string(),
            aws_sqs_cross_account_mapping: "shared:999".to_string(),
            ..MqConfig::default()
        });
        qsvc.create_queue("svc-shared", &HashMap::new()).await.unwrap();

        let url = registry.queue_url("shared").await.unwrap();
        assert!(url.is_some());

        let lookups = qsvc.url_lookups();
        assert_eq!(lookups.len(), 1);
        // The FQN goes to the service; the owner comes from the original name.
        assert_eq!(lookups[0].0, "svc-shared");
        assert_eq!(lookups[0].1.as_deref(), Some("999"));

        // Second resolution is served from cache.
        registry.queue_url("shared").await.unwrap();
        assert_eq!(qsvc.url_lookups().len(), 1);
    }

    #[tokio::test]
    async fn test_topic_arn_scan_matches_name_suffix() {
        let (_, registry) = registry_with(MqConfig::default());

        registry.create_topic("orders").await.unwrap();
        registry.clear();

        let arn = registry.topic_arn("orders").await.unwrap();
        assert!(arn.unwrap().ends_with(":orders"));
        assert_eq!(registry.topic_arn("ghost").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_create_queue_carries_kms_key() {
        let (qsvc, registry) = registry_with(MqConfig {
            aws_sqs_sns_kms_master_key_id: Some("kms-key-1".to_string()),
            ..MqConfig::default()
        });

        registry.create_queue("secure").await.unwrap();
        let attributes = qsvc.queue_attributes_of("secure").unwrap();
        assert_eq!(
            attributes.get(ATTR_KMS_MASTER_KEY_ID).map(String::as_str),
            Some("kms-key-1")
        );
    }

    #[tokio::test]
    async fn test_subscribe_wires_topic_to_queue() {
        let (qsvc, registry) = registry_with(MqConfig::default());

        let url = registry.create_queue("a.hello").await.unwrap();
        let arn = registry.create_topic("hello").await.unwrap();

        let subscription = registry.subscribe(&arn, &url).await.unwrap();
        assert!(subscription.starts_with(&arn));

        // Publishing through the topic lands on the subscribed queue.
        registry
            .tsvc
            .publish(&arn, "payload", &HashMap::new())
            .await
            .unwrap();
        let received = qsvc.receive_message(&url, 1, 1).await.unwrap();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].body, "payload");
    }
}
