//! Message envelope, protocol headers, and target addresses
//!
//! A message is a structured body plus a flat string-to-string header map.
//! Headers travel as QSVC/TSVC message attributes; keys starting with `__`
//! are reserved for the adapter protocol.

use std::collections::HashMap;

use serde_json::Value;

use crate::error::{MqError, Result};

/// Target method within a request queue
pub const HEADER_METHOD: &str = "__method";
/// Fan-out discriminator on a topic
pub const HEADER_EVENT_TYPE: &str = "__event_type";
/// Correlation token of a query
pub const HEADER_REQUEST_ID: &str = "__request_id";
/// Destination queue URL for a query response
pub const HEADER_REPLY_QUEUE_URL: &str = "__reply_queue_url";

/// Message envelope handed to processors and returned from queries
#[derive(Debug, Clone)]
pub struct Message {
    /// Structured body, opaque to the adapter
    pub body: Value,

    /// Transport headers, including the reserved `__*` protocol keys
    pub headers: HashMap<String, String>,
}

impl Message {
    pub fn new(body: Value, headers: HashMap<String, String>) -> Self {
        Self { body, headers }
    }

    pub fn method(&self) -> Option<&str> {
        self.headers.get(HEADER_METHOD).map(String::as_str)
    }

    pub fn event_type(&self) -> Option<&str> {
        self.headers.get(HEADER_EVENT_TYPE).map(String::as_str)
    }

    pub fn request_id(&self) -> Option<&str> {
        self.headers.get(HEADER_REQUEST_ID).map(String::as_str)
    }

    pub fn reply_queue_url(&self) -> Option<&str> {
        self.headers.get(HEADER_REPLY_QUEUE_URL).map(String::as_str)
    }
}

/// Typed view of the reserved headers, rendered to the wire map on send
#[derive(Debug, Default, Clone)]
pub struct ProtocolHeaders {
    pub method: Option<String>,
    pub event_type: Option<String>,
    pub request_id: Option<String>,
    pub reply_queue_url: Option<String>,
}

impl ProtocolHeaders {
    pub fn into_map(self) -> HashMap<String, String> {
        let mut map = HashMap::new();
        if let Some(method) = self.method {
            map.insert(HEADER_METHOD.to_string(), method);
        }
        if let Some(event_type) = self.event_type {
            map.insert(HEADER_EVENT_TYPE.to_string(), event_type);
        }
        if let Some(request_id) = self.request_id {
            map.insert(HEADER_REQUEST_ID.to_string(), request_id);
        }
        if let Some(reply_queue_url) = self.reply_queue_url {
            map.insert(HEADER_REPLY_QUEUE_URL.to_string(), reply_queue_url);
        }
        map
    }
}

/// Parsed target address
///
/// Commands and queries address `"<queue>/<method>"`; events address
/// `"<topic>#<event_type>"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Queue { queue: String, method: String },
    Topic { topic: String, event_type: String },
}

impl Target {
    /// Parse a command/query target of the form `"queue/method"`
    pub fn parse_queue(target: &str) -> Result<(String, String)> {
        match target.split_once('/') {
            Some((queue, method)) if !queue.is_empty() && !method.is_empty() => {
                Ok((queue.to_string(), method.to_string()))
            }
            _ => Err(MqError::Config(format!(
                "invalid command/query target {target:?}, expected \"queue/method\""
            ))),
        }
    }

    /// Parse an event target of the form `"topic#event_type"`
    pub fn parse_topic(target: &str) -> Result<(String, String)> {
        match target.split_once('#') {
            Some((topic, event_type)) if !topic.is_empty() && !event_type.is_empty() => {
                Ok((topic.to_string(), event_type.to_string()))
            }
            _ => Err(MqError::Config(format!(
                "invalid event target {target:?}, expected \"topic#event_type\""
            ))),
        }
    }
}
