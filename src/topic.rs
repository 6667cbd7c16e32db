//! # Topic Router
//!
//! Parses and builds the gateway topic hierarchy:
//!
//! ```text
//! <gateway>/{config,request,response,act_value}                  core device
//! <gateway>/lightpost/<tag>/{config,request,response,act_value}  tagged lightpost
//! ```
//!
//! Every handler works on a [`TopicDescriptor`] produced here, so no other module
//! indexes into split topic strings.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Segment that introduces a device tag in a topic.
pub const LIGHTPOST_SEGMENT: &str = "lightpost";

/// Addressed device state: the shared core record or one lightpost tag.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Scope {
    Core,
    Device(String),
}

impl Scope {
    pub fn device(tag: impl Into<String>) -> Self {
        Scope::Device(tag.into())
    }

    pub fn tag(&self) -> Option<&str> {
        match self {
            Scope::Core => None,
            Scope::Device(tag) => Some(tag),
        }
    }
}

/// `core` names the core record, anything else is taken as a device tag. Accepts the
/// `lightpost/<tag>` form printed by `Display`. A tag can never hold a `/`.
impl FromStr for Scope {
    type Err = ClassificationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let tag = trimmed
            .strip_prefix(LIGHTPOST_SEGMENT)
            .and_then(|rest| rest.strip_prefix('/'))
            .unwrap_or(trimmed);

        match tag {
            "core" if tag.len() == trimmed.len() => Ok(Scope::Core),
            tag if tag.is_empty() || tag.contains('/') => {
                Err(ClassificationError::UnknownTopicShape(s.to_string()))
            }
            tag => Ok(Scope::Device(tag.to_string())),
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Scope::Core => write!(f, "core"),
            Scope::Device(tag) => write!(f, "{}/{}", LIGHTPOST_SEGMENT, tag),
        }
    }
}

/// Trailing topic segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Config,
    Request,
    Response,
    ActValue,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Config => "config",
            MessageKind::Request => "request",
            MessageKind::Response => "response",
            MessageKind::ActValue => "act_value",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageKind {
    type Err = ClassificationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "config" => Ok(MessageKind::Config),
            "request" => Ok(MessageKind::Request),
            "response" => Ok(MessageKind::Response),
            "act_value" => Ok(MessageKind::ActValue),
            other => Err(ClassificationError::UnknownKind(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TopicDescriptor {
    pub scope: Scope,
    pub kind: MessageKind,
}

impl fmt::Display for TopicDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} ({})", self.scope, self.kind)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClassificationError {
    #[error("Unrecognized topic shape: {0:?}")]
    UnknownTopicShape(String),

    #[error("Unknown message kind: {0:?}")]
    UnknownKind(String),
}

/// Classifies a topic string into scope and kind.
///
/// The scope is `Device(tag)` when a `lightpost` segment is followed by a tag and at
/// least one further segment, `Core` when no `lightpost` segment appears. The last
/// segment always decides the kind.
pub fn classify(topic: &str) -> Result<TopicDescriptor, ClassificationError> {
    let segments: Vec<&str> = topic.split('/').collect();

    let last = match segments.last() {
        Some(last) if !last.is_empty() => *last,
        _ => return Err(ClassificationError::UnknownTopicShape(topic.to_string())),
    };

    let scope = match segments.iter().position(|s| *s == LIGHTPOST_SEGMENT) {
        Some(idx) => {
            // the tag needs its own segment plus a kind segment after it
            if idx + 3 > segments.len() {
                return Err(ClassificationError::UnknownTopicShape(topic.to_string()));
            }
            let tag = segments[idx + 1];
            if tag.is_empty() {
                return Err(ClassificationError::UnknownTopicShape(topic.to_string()));
            }
            Scope::Device(tag.to_string())
        }
        None => Scope::Core,
    };

    let kind = last.parse::<MessageKind>()?;

    Ok(TopicDescriptor { scope, kind })
}

/// Builds topics below one gateway base, e.g. `d2mesh/gate2DB48EC0`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicScheme {
    base: String,
}

impl TopicScheme {
    pub fn new(base: impl Into<String>) -> Self {
        let base: String = base.into();
        Self {
            base: base.trim_end_matches('/').to_string(),
        }
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    pub fn topic_for(&self, scope: &Scope, kind: MessageKind) -> String {
        match scope {
            Scope::Core => format!("{}/{}", self.base, kind),
            Scope::Device(tag) => format!("{}/{}/{}/{}", self.base, LIGHTPOST_SEGMENT, tag, kind),
        }
    }

    /// Explicit inbound subscription list for the core device and every given tag.
    pub fn inbound_topics<'a>(&self, tags: impl IntoIterator<Item = &'a str>) -> Vec<String> {
        let mut topics = vec![
            self.topic_for(&Scope::Core, MessageKind::Config),
            self.topic_for(&Scope::Core, MessageKind::Request),
        ];
        for tag in tags {
            let scope = Scope::device(tag);
            topics.push(self.topic_for(&scope, MessageKind::Config));
            topics.push(self.topic_for(&scope, MessageKind::Request));
        }
        topics
    }

    /// Wildcard subscriptions covering tags that are not provisioned yet.
    pub fn inbound_filters(&self) -> Vec<String> {
        vec![
            self.topic_for(&Scope::Core, MessageKind::Config),
            self.topic_for(&Scope::Core, MessageKind::Request),
            format!("{}/{}/+/{}", self.base, LIGHTPOST_SEGMENT, MessageKind::Config),
            format!("{}/{}/+/{}", self.base, LIGHTPOST_SEGMENT, MessageKind::Request),
        ]
    }
}
