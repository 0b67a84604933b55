//! Envelope carried by delay queues and mailboxes.

use crate::errors::SignalError;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A stored message: an id plus an opaque JSON payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub payload: String,
}

impl Message {
    pub fn new(id: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            payload: payload.into(),
        }
    }

    /// Wrap a serializable value under a fresh random id.
    pub fn encode<T: Serialize>(value: &T) -> Result<Self, SignalError> {
        Ok(Self::new(
            Uuid::new_v4().to_string(),
            serde_json::to_string(value)?,
        ))
    }

    /// Decode the payload as `T`.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, SignalError> {
        Ok(serde_json::from_str(&self.payload)?)
    }
}

/// A message fired by a [`DelayQueue`](super::DelayQueue), with the instant
/// it was scheduled for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DelayMessage {
    pub message: Message,
    pub due_at: DateTime<Utc>,
}
