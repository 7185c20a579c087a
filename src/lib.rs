//! Messaging adapter for SQS/SNS-shaped services
//!
//! Layers a three-verb messaging model on top of a point-to-point queue
//! service and a topic fan-out service:
//!
//! - **Command**: fire-and-forget point-to-point send
//! - **Query**: request/reply with a per-call timeout, correlated over a
//!   per-process ephemeral reply queue
//! - **Event**: publish/subscribe through topics fanned out into queues
//!
//! # Features
//!
//! - **Bounded worker pool**: handler concurrency is capped; saturation is
//!   surfaced to the queue service as a NACK, never as caller blocking
//! - **Name registry**: namespace prefixing, alphabet translation, cached
//!   URL/ARN resolution, cross-account queue lookup
//! - **Raw topic delivery**: subscriptions request raw message delivery so
//!   bodies and headers arrive intact end-to-end
//! - **In-memory backend**: a broker-less QSVC/TSVC pair for local
//!   development and tests (`mq_adapter = "memory"`)
//!
//! # Example
//!
//! ```rust,ignore
//! use mq_adapter_sqs::{create_adapter, MqConfig};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = MqConfig::from_env()?;
//!     let adapter = create_adapter(&config)?;
//!
//!     adapter.start().await?;
//!     adapter.command("users/create", json!({"name": "John"})).await?;
//!     let reply = adapter.query("users/get", json!({"id": 1}), None).await?;
//!     adapter.stop().await?;
//!     Ok(())
//! }
//! ```

// Module declarations
#[cfg(feature = "aws")]
pub mod aws;
pub mod adapter;
pub mod client;
pub mod codec;
pub mod config;
pub mod consumer;
pub mod error;
pub mod memory;
pub mod message;
pub mod registry;
pub mod reply;
pub mod timeout_queue;
pub mod worker_pool;

// Re-exports
pub use adapter::{create_adapter, MessageProcessor, MqAdapter, SqsSnsAdapter};
pub use client::{QueueService, ReceivedMessage, TopicService};
pub use codec::{Codec, JsonCodec};
pub use config::MqConfig;
pub use error::{MqError, Result};
pub use memory::{MemoryQueueService, MemoryTopicService};
pub use message::{Message, Target};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_module_exports() {
        // Verify all public types are accessible
        let _ = std::any::type_name::<MqConfig>();
        let _ = std::any::type_name::<MqError>();
        let _ = std::any::type_name::<SqsSnsAdapter>();
        let _ = std::any::type_name::<Message>();
        let _ = std::any::type_name::<MemoryQueueService>();
    }
}
