//! Path scheme and value encodings of the subscription tree.
//!
//! # Path Layout
//!
//! ```text
//! <root>/locks/subscription_<id>                               lock node
//! <root>/subscriptions/<id>/state                              "" | "INITIALIZED"
//! <root>/subscriptions/<id>/sessions/<session>                 weight, decimal
//! <root>/subscriptions/<id>/topics/<topic>/<partition>         partition record
//! <root>/subscriptions/<id>/topics/<topic>/<partition>/offset  offset, decimal
//! <root>/subscriptions/<id>/topology                           counter, decimal
//! ```
//!
//! The default root is `/nakadi`. Existing deployments read the same tree, so
//! the layout and the legacy record format must be kept byte-for-byte.
//!
//! # Partition Record Format
//!
//! Legacy (default): `session:next_session:STATE`, exactly three fields, an
//! empty field standing for "no session". Values cannot contain `:`.
//!
//! JSON (opt-in, for fresh stores only):
//! `{"session":"a","next_session":null,"state":"ASSIGNED"}`.
//!
//! Decoding detects the format from the first byte, so a store written with
//! either encoding stays readable after switching.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::error::{SubscriptionError, SubscriptionResult};
use super::partition_state::{Partition, PartitionKey, PartitionState};
use crate::constants::{
    LOCK_NODE_PREFIX, LOCKS_DIR, OFFSET_NODE, RECORD_DELIMITER, SESSIONS_NODE, STATE_NODE,
    SUBSCRIPTIONS_DIR, TOPICS_NODE, TOPOLOGY_NODE,
};
use crate::store::join_path;

/// Failure to decode or encode a stored value.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("{field} '{value}' contains the record delimiter")]
    DelimiterInValue { field: &'static str, value: String },

    #[error("expected 3 record fields, found {actual}")]
    FieldCount { actual: usize },

    #[error("unknown partition state '{0}'")]
    UnknownState(String),

    #[error("value is not valid UTF-8: {0}")]
    InvalidUtf8(#[from] std::str::Utf8Error),

    #[error("invalid JSON record: {0}")]
    Json(#[from] serde_json::Error),

    #[error("'{value}' is not a valid number")]
    InvalidNumber { value: String },
}

/// How partition records are written.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RecordEncoding {
    /// Colon-delimited `session:next:STATE`.
    #[default]
    Legacy,
    /// Self-describing JSON object.
    Json,
}

impl fmt::Display for RecordEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordEncoding::Legacy => f.write_str("legacy"),
            RecordEncoding::Json => f.write_str("json"),
        }
    }
}

impl FromStr for RecordEncoding {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "legacy" => Ok(RecordEncoding::Legacy),
            "json" => Ok(RecordEncoding::Json),
            other => Err(format!(
                "unknown record encoding '{}', expected 'legacy' or 'json'",
                other
            )),
        }
    }
}

/// Stored ownership fields of a partition (the key lives in the path).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionRecord {
    pub session: Option<String>,
    pub next_session: Option<String>,
    pub state: PartitionState,
}

impl PartitionRecord {
    pub fn from_partition(partition: &Partition) -> Self {
        Self {
            session: partition.session().map(str::to_string),
            next_session: partition.next_session().map(str::to_string),
            state: partition.state(),
        }
    }

    pub fn into_partition(self, key: PartitionKey) -> Partition {
        Partition::new(key, self.session, self.next_session, self.state)
    }

    pub fn encode(&self, encoding: RecordEncoding) -> Result<Vec<u8>, CodecError> {
        match encoding {
            RecordEncoding::Legacy => self.encode_legacy().map(String::into_bytes),
            RecordEncoding::Json => Ok(serde_json::to_vec(self)?),
        }
    }

    /// Decode a record written with either encoding.
    pub fn decode(data: &[u8]) -> Result<Self, CodecError> {
        if data.first() == Some(&b'{') {
            return Ok(serde_json::from_slice(data)?);
        }
        Self::decode_legacy(std::str::from_utf8(data)?)
    }

    fn encode_legacy(&self) -> Result<String, CodecError> {
        let session = legacy_field("session", self.session.as_deref())?;
        let next_session = legacy_field("next_session", self.next_session.as_deref())?;
        Ok(format!(
            "{session}{d}{next_session}{d}{state}",
            d = RECORD_DELIMITER,
            state = self.state
        ))
    }

    fn decode_legacy(value: &str) -> Result<Self, CodecError> {
        let fields: Vec<&str> = value.split(RECORD_DELIMITER).collect();
        let &[session, next_session, state] = fields.as_slice() else {
            return Err(CodecError::FieldCount {
                actual: fields.len(),
            });
        };
        let state = state
            .parse()
            .map_err(|_| CodecError::UnknownState(state.to_string()))?;
        Ok(Self {
            session: non_empty(session),
            next_session: non_empty(next_session),
            state,
        })
    }
}

fn legacy_field<'a>(field: &'static str, value: Option<&'a str>) -> Result<&'a str, CodecError> {
    let value = value.unwrap_or("");
    if value.contains(RECORD_DELIMITER) {
        return Err(CodecError::DelimiterInValue {
            field,
            value: value.to_string(),
        });
    }
    Ok(value)
}

fn non_empty(field: &str) -> Option<String> {
    (!field.is_empty()).then(|| field.to_string())
}

/// Encode a counter, offset or weight as a decimal string.
pub fn encode_number<T: fmt::Display>(value: T) -> Vec<u8> {
    value.to_string().into_bytes()
}

/// Decode a decimal string written by [`encode_number`].
pub fn decode_number<T: FromStr>(data: &[u8]) -> Result<T, CodecError> {
    let text = std::str::from_utf8(data)?;
    text.trim().parse().map_err(|_| CodecError::InvalidNumber {
        value: text.to_string(),
    })
}

/// Check that an identifier can be used as a path segment.
pub fn validate_identifier(kind: &'static str, value: &str) -> SubscriptionResult<()> {
    let reason = if value.is_empty() {
        Some("must not be empty")
    } else if value.contains('/') {
        Some("must not contain '/'")
    } else if value == "." || value == ".." {
        Some("must not be a relative path segment")
    } else {
        None
    };
    match reason {
        Some(reason) => Err(invalid(kind, value, reason)),
        None => Ok(()),
    }
}

/// Session ids are also stored inside partition records, so on top of the
/// path segment rules they may not contain the record delimiter.
pub fn validate_session_id(value: &str) -> SubscriptionResult<()> {
    validate_identifier("session id", value)?;
    if value.contains(RECORD_DELIMITER) {
        return Err(invalid("session id", value, "must not contain ':'"));
    }
    Ok(())
}

fn invalid(kind: &'static str, value: &str, reason: &'static str) -> SubscriptionError {
    SubscriptionError::InvalidIdentifier {
        kind,
        value: value.to_string(),
        reason,
    }
}

/// Paths of one subscription's nodes.
#[derive(Debug, Clone)]
pub struct SubscriptionPaths {
    lock: String,
    base: String,
}

impl SubscriptionPaths {
    pub fn new(root: &str, subscription_id: &str) -> Self {
        let locks = join_path(root, LOCKS_DIR);
        let subscriptions = join_path(root, SUBSCRIPTIONS_DIR);
        Self {
            lock: join_path(&locks, &format!("{}{}", LOCK_NODE_PREFIX, subscription_id)),
            base: join_path(&subscriptions, subscription_id),
        }
    }

    pub fn lock(&self) -> &str {
        &self.lock
    }

    /// Root of the subscription's own subtree.
    pub fn base(&self) -> &str {
        &self.base
    }

    pub fn state(&self) -> String {
        join_path(&self.base, STATE_NODE)
    }

    pub fn sessions(&self) -> String {
        join_path(&self.base, SESSIONS_NODE)
    }

    pub fn session(&self, session_id: &str) -> String {
        join_path(&self.sessions(), session_id)
    }

    pub fn topics(&self) -> String {
        join_path(&self.base, TOPICS_NODE)
    }

    pub fn topic(&self, topic: &str) -> String {
        join_path(&self.topics(), topic)
    }

    pub fn partition(&self, key: &PartitionKey) -> String {
        join_path(&self.topic(&key.topic), &key.partition)
    }

    pub fn offset(&self, key: &PartitionKey) -> String {
        join_path(&self.partition(key), OFFSET_NODE)
    }

    pub fn topology(&self) -> String {
        join_path(&self.base, TOPOLOGY_NODE)
    }
}
