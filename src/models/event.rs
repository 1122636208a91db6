//! Observability events.
//!
//! A trace has no storage of its own: it is the set of events sharing
//! one trace id. The `response` event carries the full rollup.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Kind of an observability event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    Request,
    Embedding,
    Retrieval,
    Generation,
    Response,
    Upload,
    Reindex,
    System,
    Error,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Request => "request",
            Self::Embedding => "embedding",
            Self::Retrieval => "retrieval",
            Self::Generation => "generation",
            Self::Response => "response",
            Self::Upload => "upload",
            Self::Reindex => "reindex",
            Self::System => "system",
            Self::Error => "error",
        }
    }
}

/// Severity attached to an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Debug => "DEBUG",
            Self::Info => "INFO",
            Self::Warning => "WARNING",
            Self::Error => "ERROR",
        }
    }
}

/// A persisted observability record. Append-only; ordering within a
/// trace is by timestamp.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub event_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub event_type: EventType,
    pub level: LogLevel,
    /// Empty when the event does not belong to a request trace.
    pub trace_id: String,
    pub user_id: Option<i64>,
    pub user_email: Option<String>,
    pub message: String,
    pub query: Option<String>,
    pub response: Option<String>,
    /// Retrieved chunks with scores, serialized for the response rollup.
    pub chunks_json: Option<String>,
    pub latency_ms: Option<f64>,
    pub token_count: Option<u32>,
    /// `success` or `error`.
    pub status: Option<String>,
    pub error_detail: Option<String>,
    pub model_provider: Option<String>,
    pub model_name: Option<String>,
}

impl Event {
    pub fn new(event_type: EventType, message: impl Into<String>) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            event_type,
            level: LogLevel::Info,
            trace_id: String::new(),
            user_id: None,
            user_email: None,
            message: message.into(),
            query: None,
            response: None,
            chunks_json: None,
            latency_ms: None,
            token_count: None,
            status: None,
            error_detail: None,
            model_provider: None,
            model_name: None,
        }
    }

    pub fn level(mut self, level: LogLevel) -> Self {
        self.level = level;
        self
    }

    pub fn trace(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = trace_id.into();
        self
    }

    pub fn user(mut self, user_id: Option<i64>, user_email: Option<String>) -> Self {
        self.user_id = user_id;
        self.user_email = user_email;
        self
    }

    pub fn query(mut self, query: impl Into<String>) -> Self {
        self.query = Some(query.into());
        self
    }

    pub fn response(mut self, response: impl Into<String>) -> Self {
        self.response = Some(response.into());
        self
    }

    pub fn chunks_json(mut self, chunks_json: impl Into<String>) -> Self {
        self.chunks_json = Some(chunks_json.into());
        self
    }

    pub fn latency_ms(mut self, latency_ms: f64) -> Self {
        self.latency_ms = Some(latency_ms);
        self
    }

    pub fn token_count(mut self, token_count: u32) -> Self {
        self.token_count = Some(token_count);
        self
    }

    pub fn status(mut self, status: impl Into<String>) -> Self {
        self.status = Some(status.into());
        self
    }

    pub fn error_detail(mut self, detail: impl Into<String>) -> Self {
        self.error_detail = Some(detail.into());
        self
    }

    pub fn model(mut self, provider: impl Into<String>, name: impl Into<String>) -> Self {
        self.model_provider = Some(provider.into());
        self.model_name = Some(name.into());
        self
    }

    /// The compact projection delivered to live subscribers. The full
    /// row stays in the store for later query.
    pub fn compact(&self) -> CompactEvent {
        CompactEvent {
            timestamp: self.timestamp,
            event_type: self.event_type,
            level: self.level.as_str().to_string(),
            trace_id: self.trace_id.clone(),
            message: self.message.clone(),
            user_id: self.user_id,
            user_email: self.user_email.clone(),
            latency_ms: self.latency_ms,
            status: self.status.clone(),
            model_provider: self.model_provider.clone(),
            model_name: self.model_name.clone(),
        }
    }
}

/// Projection of an [`Event`] broadcast to streaming subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompactEvent {
    pub timestamp: DateTime<Utc>,
    pub event_type: EventType,
    pub level: String,
    pub trace_id: String,
    pub message: String,
    pub user_id: Option<i64>,
    pub user_email: Option<String>,
    pub latency_ms: Option<f64>,
    pub status: Option<String>,
    pub model_provider: Option<String>,
    pub model_name: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_sets_fields() {
        let event = Event::new(EventType::Retrieval, "retrieved 5 chunks")
            .trace("t-1")
            .latency_ms(12.5)
            .level(LogLevel::Debug);
        assert_eq!(event.event_type.as_str(), "retrieval");
        assert_eq!(event.trace_id, "t-1");
        assert_eq!(event.latency_ms, Some(12.5));
        assert_eq!(event.level.as_str(), "DEBUG");
    }

    #[test]
    fn compact_projection_drops_payload_fields() {
        let event = Event::new(EventType::Response, "done")
            .query("q")
            .response("a")
            .chunks_json("[]")
            .status("success");
        let compact = event.compact();
        assert_eq!(compact.status.as_deref(), Some("success"));
        // query/response/chunks stay in the store only
        let json = serde_json::to_value(&compact).unwrap();
        assert!(json.get("query").is_none());
        assert!(json.get("response").is_none());
    }
}
