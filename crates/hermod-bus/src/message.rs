//! Message envelope and builder

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::error::{BusError, BusResult};
use crate::pattern::validate_topic;
use crate::value::ValueContainer;

/// Unique message identifier using UUID v7 (time-ordered)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(pub uuid::Uuid);

impl MessageId {
    /// Create a new message ID
    pub fn new() -> Self {
        Self(uuid::Uuid::now_v7())
    }

    /// Parse from string
    pub fn from_string(s: &str) -> BusResult<Self> {
        uuid::Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| BusError::InvalidMessage(format!("bad message id: {e}")))
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Kind of message carried by the envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Command,
    #[default]
    Event,
    Query,
    Reply,
    Notification,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Command => "command",
            Self::Event => "event",
            Self::Query => "query",
            Self::Reply => "reply",
            Self::Notification => "notification",
        }
    }

    pub fn parse(s: &str) -> BusResult<Self> {
        match s {
            "command" => Ok(Self::Command),
            "event" => Ok(Self::Event),
            "query" => Ok(Self::Query),
            "reply" => Ok(Self::Reply),
            "notification" => Ok(Self::Notification),
            other => Err(BusError::InvalidMessage(format!(
                "unknown message type '{other}'"
            ))),
        }
    }
}

/// Delivery priority; total order from `Lowest` to `Critical`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Lowest,
    Low,
    #[default]
    Normal,
    High,
    Highest,
    Critical,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Lowest => "lowest",
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
            Self::Highest => "highest",
            Self::Critical => "critical",
        }
    }

    pub fn parse(s: &str) -> BusResult<Self> {
        match s {
            "lowest" => Ok(Self::Lowest),
            "low" => Ok(Self::Low),
            "normal" => Ok(Self::Normal),
            "high" => Ok(Self::High),
            "highest" => Ok(Self::Highest),
            "critical" => Ok(Self::Critical),
            other => Err(BusError::InvalidMessage(format!(
                "unknown priority '{other}'"
            ))),
        }
    }
}

/// Message envelope delivered by the bus.
///
/// The topic is immutable once the message is published; handlers receive
/// the envelope by shared reference. Headers use a sorted map so the wire
/// image of a given envelope is deterministic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub topic: String,
    pub source: Option<String>,
    pub target: Option<String>,
    pub correlation_id: Option<String>,
    pub trace_id: Option<String>,
    pub kind: MessageType,
    pub priority: Priority,
    pub timestamp: DateTime<Utc>,
    pub ttl: Option<Duration>,
    pub headers: BTreeMap<String, String>,
    pub payload: ValueContainer,
}

impl Message {
    /// Start building a message for `topic`
    pub fn builder(topic: impl Into<String>) -> MessageBuilder {
        MessageBuilder::new(topic)
    }

    /// Check whether the message has outlived its ttl
    pub fn is_expired(&self) -> bool {
        match self.ttl {
            Some(ttl) => {
                let age = Utc::now().signed_duration_since(self.timestamp);
                age.to_std().map(|age| age > ttl).unwrap_or(false)
            }
            None => false,
        }
    }

    /// Header lookup
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    /// Build a reply to this message.
    ///
    /// The reply correlates on this message's `correlation_id` when present,
    /// falling back to its `id`, and targets this message's `source`.
    pub fn reply_to(&self, topic: impl Into<String>) -> MessageBuilder {
        let correlation = self
            .correlation_id
            .clone()
            .unwrap_or_else(|| self.id.to_string());
        let mut builder = MessageBuilder::new(topic)
            .kind(MessageType::Reply)
            .correlation_id(correlation);
        if let Some(source) = &self.source {
            builder = builder.target(source.clone());
        }
        if let Some(trace) = &self.trace_id {
            builder = builder.trace_id(trace.clone());
        }
        builder
    }
}

/// Builder for [`Message`]
#[derive(Debug, Clone)]
pub struct MessageBuilder {
    topic: String,
    source: Option<String>,
    target: Option<String>,
    correlation_id: Option<String>,
    trace_id: Option<String>,
    kind: MessageType,
    priority: Priority,
    ttl: Option<Duration>,
    headers: BTreeMap<String, String>,
    payload: ValueContainer,
}

impl MessageBuilder {
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            source: None,
            target: None,
            correlation_id: None,
            trace_id: None,
            kind: MessageType::default(),
            priority: Priority::default(),
            ttl: None,
            headers: BTreeMap::new(),
            payload: ValueContainer::new(),
        }
    }

    pub fn source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    pub fn trace_id(mut self, id: impl Into<String>) -> Self {
        self.trace_id = Some(id.into());
        self
    }

    pub fn kind(mut self, kind: MessageType) -> Self {
        self.kind = kind;
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn payload(mut self, payload: ValueContainer) -> Self {
        self.payload = payload;
        self
    }

    /// Validate and build the message.
    ///
    /// Fails with `InvalidMessage` on an empty or malformed topic.
    pub fn build(self) -> BusResult<Message> {
        validate_topic(&self.topic)
            .map_err(|e| BusError::InvalidMessage(format!("topic '{}': {e}", self.topic)))?;

        Ok(Message {
            id: MessageId::new(),
            topic: self.topic,
            source: self.source,
            target: self.target,
            correlation_id: self.correlation_id,
            trace_id: self.trace_id,
            kind: self.kind,
            priority: self.priority,
            timestamp: Utc::now(),
            ttl: self.ttl,
            headers: self.headers,
            payload: self.payload,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_defaults() {
        let msg = Message::builder("user.created").build().unwrap();
        assert_eq!(msg.topic, "user.created");
        assert_eq!(msg.kind, MessageType::Event);
        assert_eq!(msg.priority, Priority::Normal);
        assert!(msg.ttl.is_none());
        assert!(!msg.is_expired());
    }

    #[test]
    fn test_builder_rejects_bad_topic() {
        assert!(Message::builder("").build().is_err());
        assert!(Message::builder("user..created").build().is_err());
        assert!(Message::builder("user.created").build().is_ok());
    }

    #[test]
    fn test_unique_ids() {
        let a = Message::builder("t.a").build().unwrap();
        let b = Message::builder("t.a").build().unwrap();
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_priority_order() {
        assert!(Priority::Critical > Priority::Highest);
        assert!(Priority::Highest > Priority::High);
        assert!(Priority::High > Priority::Normal);
        assert!(Priority::Normal > Priority::Low);
        assert!(Priority::Low > Priority::Lowest);
    }

    #[test]
    fn test_expiry() {
        let mut msg = Message::builder("t.a")
            .ttl(Duration::from_millis(10))
            .build()
            .unwrap();
        assert!(!msg.is_expired());
        msg.timestamp = Utc::now() - chrono::Duration::seconds(1);
        assert!(msg.is_expired());
    }

    #[test]
    fn test_reply_to_correlates_on_id() {
        let req = Message::builder("svc.echo")
            .kind(MessageType::Query)
            .source("client-a")
            .build()
            .unwrap();

        let reply = req.reply_to("svc.echo").build().unwrap();
        assert_eq!(reply.kind, MessageType::Reply);
        assert_eq!(reply.correlation_id, Some(req.id.to_string()));
        assert_eq!(reply.target.as_deref(), Some("client-a"));
    }

    #[test]
    fn test_reply_to_prefers_existing_correlation() {
        let req = Message::builder("svc.echo")
            .correlation_id("corr-1")
            .build()
            .unwrap();
        let reply = req.reply_to("svc.echo").build().unwrap();
        assert_eq!(reply.correlation_id.as_deref(), Some("corr-1"));
    }

    #[test]
    fn test_type_and_priority_parse() {
        for kind in [
            MessageType::Command,
            MessageType::Event,
            MessageType::Query,
            MessageType::Reply,
            MessageType::Notification,
        ] {
            assert_eq!(MessageType::parse(kind.as_str()).unwrap(), kind);
        }
        for p in [
            Priority::Lowest,
            Priority::Low,
            Priority::Normal,
            Priority::High,
            Priority::Highest,
            Priority::Critical,
        ] {
            assert_eq!(Priority::parse(p.as_str()).unwrap(), p);
        }
        assert!(MessageType::parse("bogus").is_err());
        assert!(Priority::parse("bogus").is_err());
    }
}
