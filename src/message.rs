//! A stored mail item and its typed attributes.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Well-known attribute names produced by the mail client.
pub mod fields {
    pub const SENDER: &str = "sender";
    pub const RECIPIENT: &str = "recipient";
    pub const SUBJECT: &str = "subject";
    pub const BODY: &str = "body";
    pub const RECEIVED_AT: &str = "received_at";
    pub const LABELS: &str = "labels";
    pub const MAILBOX: &str = "mailbox";
}

/// A typed attribute value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum AttributeValue {
    Text(String),
    Timestamp(DateTime<Utc>),
    Set(BTreeSet<String>),
}

impl AttributeValue {
    /// Short type name used in evaluation errors.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Text(_) => "text",
            Self::Timestamp(_) => "timestamp",
            Self::Set(_) => "set",
        }
    }
}

impl From<&str> for AttributeValue {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<String> for AttributeValue {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<DateTime<Utc>> for AttributeValue {
    fn from(ts: DateTime<Utc>) -> Self {
        Self::Timestamp(ts)
    }
}

impl From<BTreeSet<String>> for AttributeValue {
    fn from(set: BTreeSet<String>) -> Self {
        Self::Set(set)
    }
}

/// Attribute snapshot of a message, keyed by attribute name.
pub type Attributes = BTreeMap<String, AttributeValue>;

/// A stored mail item. `message_id` is assigned by the mail source and never changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub message_id: String,
    pub attributes: Attributes,
}

/// A message as returned by the mail client, before persistence.
pub type RawMessage = Message;

impl Message {
    pub fn new(message_id: impl Into<String>) -> Self {
        Self {
            message_id: message_id.into(),
            attributes: Attributes::new(),
        }
    }

    /// Builder-style attribute setter.
    pub fn with(mut self, name: &str, value: impl Into<AttributeValue>) -> Self {
        self.attributes.insert(name.to_string(), value.into());
        self
    }

    pub fn get(&self, name: &str) -> Option<&AttributeValue> {
        self.attributes.get(name)
    }

    /// The `received_at` attribute, if present and a timestamp.
    pub fn received_at(&self) -> Option<DateTime<Utc>> {
        match self.attributes.get(fields::RECEIVED_AT) {
            Some(AttributeValue::Timestamp(ts)) => Some(*ts),
            _ => None,
        }
    }

    /// Whether the message carries the given label (case-insensitive).
    pub fn has_label(&self, label: &str) -> bool {
        match self.attributes.get(fields::LABELS) {
            Some(AttributeValue::Set(labels)) => {
                labels.iter().any(|l| l.eq_ignore_ascii_case(label))
            }
            _ => false,
        }
    }
}

/// Build a label set from string slices.
pub fn label_set<I, S>(labels: I) -> BTreeSet<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    labels.into_iter().map(Into::into).collect()
}
