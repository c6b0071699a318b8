//! Typed channel keys for the shared pub/sub naming protocol.
//!
//! Every channel in the pipeline follows `{namespace}:{kind}:{args}`; the
//! streamer, ingester and processor all speak this scheme, so it is parsed
//! once here into a validated key instead of being split ad hoc at each
//! call site.

use std::fmt;

use thiserror::Error;

/// Wire token for the terminal batch of a window.
const LAST_TOKEN: &str = "LAST";

/// Position of a batch within its hour window: a numeric slot, or the
/// terminal sentinel meaning "no further batches for this window".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BatchIndex {
    Slot(u32),
    Last,
}

impl fmt::Display for BatchIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BatchIndex::Slot(i) => write!(f, "{}", i),
            BatchIndex::Last => write!(f, "{}", LAST_TOKEN),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChannelError {
    #[error("channel {0:?} is outside namespace {1:?}")]
    ForeignNamespace(String, String),
    #[error("channel {0:?} does not match {{ns}}:{{kind}}:{{args}}")]
    Malformed(String),
    #[error("unknown channel kind {0:?}")]
    UnknownKind(String),
    #[error("invalid batch index {0:?}")]
    InvalidIndex(String),
    #[error("invalid hour {0:?}, expected 0..=23")]
    InvalidHour(String),
}

/// A fully parsed channel name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKey {
    /// One batch of a window: `{ns}:data:{index|LAST}:{hour}`.
    Data { index: BatchIndex, hour: u8 },
    /// Replay request for one numeric slot: `{ns}:request:{slot}:{hour}`.
    Request { slot: u32, hour: u8 },
    /// Window complete and flushed: `{ns}:processor:{hour}`.
    Completed { hour: u8 },
}

impl ChannelKey {
    /// Parse a raw channel name against the given namespace. This is the
    /// single constructor for inbound keys; anything it rejects is dropped
    /// by the caller.
    pub fn parse(namespace: &str, channel: &str) -> Result<Self, ChannelError> {
        let rest = channel.strip_prefix(namespace).and_then(|r| r.strip_prefix(':'));
        let rest = match rest {
            Some(r) => r,
            None => {
                return Err(ChannelError::ForeignNamespace(
                    channel.to_string(),
                    namespace.to_string(),
                ))
            }
        };

        let parts: Vec<&str> = rest.split(':').collect();
        match parts.as_slice() {
            ["data", index, hour] => Ok(ChannelKey::Data {
                index: parse_index(index)?,
                hour: parse_hour(hour)?,
            }),
            ["request", slot, hour] => match parse_index(slot)? {
                BatchIndex::Slot(slot) => Ok(ChannelKey::Request {
                    slot,
                    hour: parse_hour(hour)?,
                }),
                BatchIndex::Last => Err(ChannelError::InvalidIndex(slot.to_string())),
            },
            ["processor", hour] => Ok(ChannelKey::Completed {
                hour: parse_hour(hour)?,
            }),
            [kind, ..] if !matches!(*kind, "data" | "request" | "processor") => {
                Err(ChannelError::UnknownKind(kind.to_string()))
            }
            _ => Err(ChannelError::Malformed(channel.to_string())),
        }
    }

    /// Render the key back into a publishable channel name.
    pub fn render(&self, namespace: &str) -> String {
        match self {
            ChannelKey::Data { index, hour } => {
                format!("{}:data:{}:{}", namespace, index, hour)
            }
            ChannelKey::Request { slot, hour } => {
                format!("{}:request:{}:{}", namespace, slot, hour)
            }
            ChannelKey::Completed { hour } => format!("{}:processor:{}", namespace, hour),
        }
    }

    pub fn hour(&self) -> u8 {
        match self {
            ChannelKey::Data { hour, .. }
            | ChannelKey::Request { hour, .. }
            | ChannelKey::Completed { hour } => *hour,
        }
    }

    /// Subscription pattern covering all data channels of a namespace.
    pub fn data_pattern(namespace: &str) -> String {
        format!("{}:data:*", namespace)
    }

    /// Subscription pattern covering all replay-request channels.
    pub fn request_pattern(namespace: &str) -> String {
        format!("{}:request:*", namespace)
    }

    /// Subscription pattern covering all completion notifications.
    pub fn completed_pattern(namespace: &str) -> String {
        format!("{}:processor:*", namespace)
    }
}

fn parse_index(raw: &str) -> Result<BatchIndex, ChannelError> {
    if raw == LAST_TOKEN {
        return Ok(BatchIndex::Last);
    }
    raw.parse::<u32>()
        .map(BatchIndex::Slot)
        .map_err(|_| ChannelError::InvalidIndex(raw.to_string()))
}

fn parse_hour(raw: &str) -> Result<u8, ChannelError> {
    match raw.parse::<u8>() {
        Ok(hour) if hour < 24 => Ok(hour),
        _ => Err(ChannelError::InvalidHour(raw.to_string())),
    }
}
