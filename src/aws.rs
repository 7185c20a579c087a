//! AWS SQS/SNS service clients
//!
//! Real implementations of the [`QueueService`] and [`TopicService`]
//! contracts over the official SDK clients. Headers ride as string-typed
//! message attributes; everything else is a direct mapping of the §6-style
//! operation set onto the fluent builders.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_sqs::types::QueueAttributeName;

use crate::client::{QueueService, ReceivedMessage, TopicService};
use crate::config::MqConfig;
use crate::error::{MqError, Result};

/// Build both clients from the adapter configuration
///
/// Region and credentials fall back to the SDK environment chain when not
/// set explicitly; endpoint overrides serve localstack-style deployments.
pub async fn build_clients(
    config: &MqConfig,
) -> Result<(Arc<dyn QueueService>, Arc<dyn TopicService>)> {
    let mut loader = aws_config::defaults(BehaviorVersion::latest());

    if let Some(region) = &config.aws_region {
        loader = loader.region(Region::new(region.clone()));
    }

    if let (Some(key_id), Some(secret)) = (
        &config.aws_access_key_id,
        &config.aws_secret_access_key,
    ) {
        loader = loader.credentials_provider(aws_sdk_sqs::config::Credentials::new(
            key_id.clone(),
            secret.clone(),
            None,
            None,
            "mq-config",
        ));
    }

    let base = loader.load().await;

    let mut sqs_config = aws_sdk_sqs::config::Builder::from(&base);
    if let Some(endpoint) = &config.aws_sqs_endpoint {
        sqs_config = sqs_config.endpoint_url(endpoint);
    }

    let mut sns_config = aws_sdk_sns::config::Builder::from(&base);
    if let Some(endpoint) = &config.aws_sns_endpoint {
        sns_config = sns_config.endpoint_url(endpoint);
    }

    let sqs = SqsQueueClient {
        client: aws_sdk_sqs::Client::from_conf(sqs_config.build()),
    };
    let sns = SnsTopicClient {
        client: aws_sdk_sns::Client::from_conf(sns_config.build()),
    };

    tracing::info!("AWS SQS/SNS clients constructed");
    Ok((Arc::new(sqs), Arc::new(sns)))
}

/// [`QueueService`] over `aws-sdk-sqs`
pub struct SqsQueueClient {
    client: aws_sdk_sqs::Client,
}

impl SqsQueueClient {
    pub fn new(client: aws_sdk_sqs::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl QueueService for SqsQueueClient {
    async fn create_queue(
        &self,
        name: &str,
        attributes: &HashMap<String, String>,
    ) -> Result<String> {
        let mut request = self.client.create_queue().queue_name(name);
        for (key, value) in attributes {
            request = request.attributes(QueueAttributeName::from(key.as_str()), value);
        }

        let response = request.send().await.map_err(MqError::connection)?;
        response
            .queue_url()
            .map(str::to_string)
            .ok_or_else(|| MqError::Connection(format!("create_queue({name}) returned no URL")))
    }

    async fn get_queue_url(
        &self,
        name: &str,
        owner_account_id: Option<&str>,
    ) -> Result<Option<String>> {
        let response = self
            .client
            .get_queue_url()
            .queue_name(name)
            .set_queue_owner_aws_account_id(owner_account_id.map(str::to_string))
            .send()
            .await;

        match response {
            Ok(response) => Ok(response.queue_url().map(str::to_string)),
            Err(err) => {
                let service_err = err.into_service_error();
                if service_err.is_queue_does_not_exist() {
                    Ok(None)
                } else {
                    Err(MqError::connection(service_err))
                }
            }
        }
    }

    async fn delete_queue(&self, queue_url: &str) -> Result<()> {
        self.client
            .delete_queue()
            .queue_url(queue_url)
            .send()
            .await
            .map_err(MqError::connection)?;
        Ok(())
    }

    async fn receive_message(
        &self,
        queue_url: &str,
        max_messages: i32,
        wait_time_secs: i32,
    ) -> Result<Vec<ReceivedMessage>> {
        let response = self
            .client
            .receive_message()
            .queue_url(queue_url)
            .max_number_of_messages(max_messages)
            .wait_time_seconds(wait_time_secs)
            .message_attribute_names("All")
            .send()
            .await
            .map_err(MqError::connection)?;

        let mut received = Vec::new();
        for message in response.messages() {
            let (Some(body), Some(receipt_handle)) = (message.body(), message.receipt_handle())
            else {
                tracing::warn!(queue_url = %queue_url, "received message without body or receipt");
                continue;
            };

            let mut attributes = HashMap::new();
            if let Some(message_attributes) = message.message_attributes() {
                for (key, value) in message_attributes {
                    if let Some(string_value) = value.string_value() {
                        attributes.insert(key.clone(), string_value.to_string());
                    }
                }
            }

            received.push(ReceivedMessage {
                body: body.to_string(),
                attributes,
                receipt_handle: receipt_handle.to_string(),
            });
        }

        Ok(received)
    }

    async fn send_message(
        &self,
        queue_url: &str,
        body: &str,
        attributes: &HashMap<String, String>,
    ) -> Result<()> {
        let mut request = self
            .client
            .send_message()
            .queue_url(queue_url)
            .message_body(body);

        for (key, value) in attributes {
            let attribute = aws_sdk_sqs::types::MessageAttributeValue::builder()
                .data_type("String")
                .string_value(value)
                .build()
                .map_err(MqError::connection)?;
            request = request.message_attributes(key, attribute);
        }

        request.send().await.map_err(MqError::connection)?;
        Ok(())
    }

    async fn delete_message(&self, queue_url: &str, receipt_handle: &str) -> Result<()> {
        self.client
            .delete_message()
            .queue_url(queue_url)
            .receipt_handle(receipt_handle)
            .send()
            .await
            .map_err(MqError::connection)?;
        Ok(())
    }

    async fn change_message_visibility(
        &self,
        queue_url: &str,
        receipt_handle: &str,
        visibility_timeout_secs: i32,
    ) -> Result<()> {
        self.client
            .change_message_visibility()
            .queue_url(queue_url)
            .receipt_handle(receipt_handle)
            .visibility_timeout(visibility_timeout_secs)
            .send()
            .await
            .map_err(MqError::connection)?;
        Ok(())
    }

    async fn get_queue_attributes(
        &self,
        queue_url: &str,
        attribute_names: &[&str],
    ) -> Result<HashMap<String, String>> {
        let mut request = self.client.get_queue_attributes().queue_url(queue_url);
        for name in attribute_names {
            request = request.attribute_names(QueueAttributeName::from(*name));
        }

        let response = request.send().await.map_err(MqError::connection)?;

        let mut attributes = HashMap::new();
        if let Some(returned) = response.attributes() {
            for (key, value) in returned {
                attributes.insert(key.as_str().to_string(), value.clone());
            }
        }
        Ok(attributes)
    }
}

/// [`TopicService`] over `aws-sdk-sns`
pub struct SnsTopicClient {
    client: aws_sdk_sns::Client,
}

impl SnsTopicClient {
    pub fn new(client: aws_sdk_sns::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl TopicService for SnsTopicClient {
    async fn create_topic(
        &self,
        name: &str,
        attributes: &HashMap<String, String>,
    ) -> Result<String> {
        let mut request = self.client.create_topic().name(name);
        for (key, value) in attributes {
            request = request.attributes(key, value);
        }

        let response = request.send().await.map_err(MqError::connection)?;
        response
            .topic_arn()
            .map(str::to_string)
            .ok_or_else(|| MqError::Connection(format!("create_topic({name}) returned no ARN")))
    }

    async fn list_topics(
        &self,
        next_token: Option<&str>,
    ) -> Result<(Vec<String>, Option<String>)> {
        let response = self
            .client
            .list_topics()
            .set_next_token(next_token.map(str::to_string))
            .send()
            .await
            .map_err(MqError::connection)?;

        let arns = response
            .topics()
            .iter()
            .filter_map(|topic| topic.topic_arn().map(str::to_string))
            .collect();

        Ok((arns, response.next_token().map(str::to_string)))
    }

    async fn publish(
        &self,
        topic_arn: &str,
        message: &str,
        attributes: &HashMap<String, String>,
    ) -> Result<()> {
        let mut request = self
            .client
            .publish()
            .topic_arn(topic_arn)
            .message(message);

        for (key, value) in attributes {
            let attribute = aws_sdk_sns::types::MessageAttributeValue::builder()
                .data_type("String")
                .string_value(value)
                .build()
                .map_err(MqError::connection)?;
            request = request.message_attributes(key, attribute);
        }

        request.send().await.map_err(MqError::connection)?;
        Ok(())
    }

    async fn subscribe(
        &self,
        topic_arn: &str,
        protocol: &str,
        endpoint: &str,
        attributes: &HashMap<String, String>,
    ) -> Result<String> {
        let mut request = self
            .client
            .subscribe()
            .topic_arn(topic_arn)
            .protocol(protocol)
            .endpoint(endpoint)
            .return_subscription_arn(true);

        for (key, value) in attributes {
            request = request.attributes(key, value);
        }

        let response = request.send().await.map_err(MqError::connection)?;
        response
            .subscription_arn()
            .map(str::to_string)
            .ok_or_else(|| {
                MqError::Connection(format!("subscribe({topic_arn}) returned no subscription ARN"))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    #[ignore = "requires AWS credentials or a localstack endpoint"]
    async fn test_build_clients() {
        let config = MqConfig {
            aws_region: Some("eu-west-1".to_string()),
            ..MqConfig::default()
        };
        assert!(build_clients(&config).await.is_ok());
    }
}
