use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;
use uuid::Uuid;

/// Phase outcome carried on an emitted event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventDisposition {
    Allow,
    Captcha,
    Custom,
    Deny,
}

impl EventDisposition {
    pub fn is_blocking(&self) -> bool {
        !matches!(self, EventDisposition::Allow)
    }
}

/// One security event, produced when either evaluation phase of a request
/// reached a non-allow outcome. Consumed by the downstream security pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityEvent {
    pub event_id: Uuid,
    pub occurred_at: DateTime<Utc>,
    pub engine: String,
    /// Matched rule identifiers, ordered by match time across both phases.
    pub rule_ids: Vec<String>,
    pub inband_disposition: EventDisposition,
    pub outofband_disposition: EventDisposition,
    pub method: String,
    pub path: String,
    pub client_ip: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Error)]
pub enum EventError {
    #[error("event bus closed")]
    Closed,
    #[error("event bus full")]
    Full,
}

pub type EventResult<T> = Result<T, EventError>;
