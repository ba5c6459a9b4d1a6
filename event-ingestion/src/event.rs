use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    ViewStart,
    ViewComplete,
    Like,
    SearchQuery,
    ClickResult,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::ViewStart => "view_start",
            EventType::ViewComplete => "view_complete",
            EventType::Like => "like",
            EventType::SearchQuery => "search_query",
            EventType::ClickResult => "click_result",
        }
    }

    fn requires_video(&self) -> bool {
        matches!(
            self,
            EventType::ViewStart | EventType::ViewComplete | EventType::Like | EventType::ClickResult
        )
    }

    fn requires_query(&self) -> bool {
        matches!(self, EventType::SearchQuery | EventType::ClickResult)
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "view_start" => Ok(EventType::ViewStart),
            "view_complete" => Ok(EventType::ViewComplete),
            "like" => Ok(EventType::Like),
            "search_query" => Ok(EventType::SearchQuery),
            "click_result" => Ok(EventType::ClickResult),
            other => Err(ValidationError::UnknownType(other.to_owned())),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("event_id is required")]
    MissingEventId,
    #[error("session_id is required")]
    MissingSessionId,
    #[error("type is required")]
    MissingType,
    #[error("timestamp is required")]
    MissingTimestamp,
    #[error("unknown event type: {0}")]
    UnknownType(String),
    #[error("video_id is required for {0}")]
    MissingVideoId(EventType),
    #[error("query is required for {0}")]
    MissingQuery(EventType),
    #[error("dwell_ms must not be negative, got {0}")]
    NegativeDwell(i64),
    #[error("dwell_ms must be at most {MAX_DWELL_MS}, got {0}")]
    DwellTooLarge(i64),
}

/// Longest dwell a single event may report: one day.
pub const MAX_DWELL_MS: i64 = 24 * 60 * 60 * 1000;

/// An event as submitted by a client, before validation.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RawEvent {
    #[serde(deserialize_with = "empty_as_none")]
    pub event_id: Option<Uuid>,
    #[serde(alias = "ts")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(rename = "type")]
    pub event_type: String,
    pub session_id: String,
    #[serde(deserialize_with = "empty_as_none")]
    pub user_id: Option<Uuid>,
    #[serde(deserialize_with = "empty_as_none")]
    pub video_id: Option<Uuid>,
    pub query: Option<String>,
    pub dwell_ms: Option<i64>,
}

// Clients send "" for ids they don't have
fn empty_as_none<'de, D>(deserializer: D) -> Result<Option<Uuid>, D::Error>
where
    D: Deserializer<'de>,
{
    let value: Option<String> = Option::deserialize(deserializer)?;
    match value.as_deref() {
        None | Some("") => Ok(None),
        Some(id) => Uuid::parse_str(id)
            .map(Some)
            .map_err(serde::de::Error::custom),
    }
}

/// A validated event. Only events of this type reach storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub event_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub event_type: EventType,
    pub session_id: String,
    pub user_id: Option<Uuid>,
    pub video_id: Option<Uuid>,
    pub query: Option<String>,
    pub dwell_ms: Option<i64>,
}

impl Event {
    /// Key for the coarse "last seen" signal: the user when known, else the session.
    pub fn signal_key(&self) -> String {
        match self.user_id {
            Some(user_id) => user_id.to_string(),
            None => self.session_id.clone(),
        }
    }
}

// The nil UUID is what a client sends when it zero-initialises the field
fn present(id: Option<Uuid>) -> Option<Uuid> {
    id.filter(|id| !id.is_nil())
}

impl TryFrom<RawEvent> for Event {
    type Error = ValidationError;

    fn try_from(raw: RawEvent) -> Result<Self, Self::Error> {
        let event_id = present(raw.event_id).ok_or(ValidationError::MissingEventId)?;
        if raw.session_id.is_empty() {
            return Err(ValidationError::MissingSessionId);
        }
        if raw.event_type.is_empty() {
            return Err(ValidationError::MissingType);
        }
        let timestamp = raw
            .timestamp
            .filter(|ts| *ts != DateTime::<Utc>::UNIX_EPOCH)
            .ok_or(ValidationError::MissingTimestamp)?;

        let event_type: EventType = raw.event_type.parse()?;
        let video_id = present(raw.video_id);
        let query = raw.query.filter(|q| !q.is_empty());

        if event_type.requires_video() && video_id.is_none() {
            return Err(ValidationError::MissingVideoId(event_type));
        }
        if event_type.requires_query() && query.is_none() {
            return Err(ValidationError::MissingQuery(event_type));
        }
        match raw.dwell_ms {
            Some(dwell_ms) if dwell_ms < 0 => return Err(ValidationError::NegativeDwell(dwell_ms)),
            Some(dwell_ms) if dwell_ms > MAX_DWELL_MS => {
                return Err(ValidationError::DwellTooLarge(dwell_ms))
            }
            _ => {}
        }

        Ok(Event {
            event_id,
            timestamp,
            event_type,
            session_id: raw.session_id,
            user_id: present(raw.user_id),
            video_id,
            query,
            dwell_ms: raw.dwell_ms,
        })
    }
}
