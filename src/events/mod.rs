//! Unified observability: every event is persisted to the columnar
//! store and fanned out to live subscribers.
//!
//! A trace id is created at request ingress and copied into every event
//! emitted during that request. The `response` event carries the full
//! rollup and is emitted exactly once per request.

mod clickhouse;
mod memory;
mod stream;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use crate::error::Result;
use crate::models::{Event, EventType, LogLevel};

pub use clickhouse::ClickHouseEventStore;
pub use memory::MemoryEventStore;
pub use stream::{LiveStream, Subscription};

/// New trace id for a top-level request.
pub fn new_trace_id() -> String {
    Uuid::new_v4().to_string()
}

/// Token estimate used when a model does not report counts:
/// `ceil(words * 1.3)`.
pub fn estimate_tokens(text: &str) -> u32 {
    (text.split_whitespace().count() as f64 * 1.3).ceil() as u32
}

/// Filters for querying persisted events.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventQuery {
    pub limit: usize,
    pub offset: usize,
    pub event_type: Option<EventType>,
    pub level: Option<String>,
    pub trace_id: Option<String>,
    pub user_id: Option<i64>,
    pub status: Option<String>,
    /// Inclusive date bounds, `YYYY-MM-DD`.
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    /// Case-insensitive search over message and query.
    pub search: Option<String>,
}

impl EventQuery {
    pub fn recent(limit: usize) -> Self {
        Self {
            limit,
            ..Default::default()
        }
    }
}

/// Per-type rollup over a recent window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TypeStat {
    pub event_type: String,
    pub count: u64,
    pub avg_latency_ms: Option<f64>,
    pub errors: u64,
}

/// The columnar event store contract.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Create the database/table if absent. Idempotent.
    async fn ensure_schema(&self) -> Result<()>;

    /// Append one event.
    async fn insert(&self, event: &Event) -> Result<()>;

    /// Filtered, paginated query, newest first. Returns the page and
    /// the total match count.
    async fn query(&self, query: &EventQuery) -> Result<(Vec<Event>, u64)>;

    /// Histogram rollup by type over the last `hours`.
    async fn histogram(&self, hours: u32) -> Result<Vec<TypeStat>>;
}

/// Single entry point for emitting events.
pub struct EventBus {
    store: Arc<dyn EventStore>,
    stream: LiveStream,
}

impl EventBus {
    pub fn new(store: Arc<dyn EventStore>) -> Self {
        Self {
            store,
            stream: LiveStream::new(),
        }
    }

    pub fn stream(&self) -> &LiveStream {
        &self.stream
    }

    /// Persist the event, then fan its compact projection out to live
    /// subscribers. Persistence failures are logged, never propagated:
    /// observability must not take down the pipeline it observes.
    pub async fn emit(&self, event: Event) {
        if let Err(err) = self.store.insert(&event).await {
            warn!(error = %err, "event store write failed");
        }
        self.stream.broadcast(&event.compact());
    }

    pub async fn log_request(
        &self,
        query: &str,
        trace_id: &str,
        user_id: Option<i64>,
        user_email: Option<String>,
    ) {
        let preview: String = query.chars().take(80).collect();
        self.emit(
            Event::new(EventType::Request, format!("Query received: {preview}"))
                .trace(trace_id)
                .user(user_id, user_email)
                .query(query),
        )
        .await;
    }

    pub async fn log_retrieval(
        &self,
        chunk_count: usize,
        top_score: f32,
        duration_ms: f64,
        trace_id: &str,
    ) {
        self.emit(
            Event::new(
                EventType::Retrieval,
                format!("Retrieved {chunk_count} chunks (top score: {top_score:.3})"),
            )
            .trace(trace_id)
            .latency_ms(duration_ms),
        )
        .await;
    }

    pub async fn log_generation(
        &self,
        prompt_tokens: u32,
        completion_tokens: u32,
        duration_ms: f64,
        trace_id: &str,
        provider: &str,
        model: &str,
    ) {
        self.emit(
            Event::new(
                EventType::Generation,
                format!("Generated {completion_tokens} tokens in {duration_ms:.0}ms"),
            )
            .trace(trace_id)
            .latency_ms(duration_ms)
            .token_count(prompt_tokens + completion_tokens)
            .model(provider, model),
        )
        .await;
    }

    /// The full trace rollup. Exactly one per request.
    #[allow(clippy::too_many_arguments)]
    pub async fn log_response(
        &self,
        trace_id: &str,
        query: &str,
        response: &str,
        chunks_json: Option<String>,
        latency_ms: f64,
        token_count: u32,
        status: &str,
        error_detail: Option<String>,
        user_id: Option<i64>,
        provider: &str,
        model: &str,
    ) {
        let mut event = Event::new(
            EventType::Response,
            format!("Response completed in {latency_ms:.0}ms ({status})"),
        )
        .trace(trace_id)
        .user(user_id, None)
        .query(query)
        .response(response)
        .latency_ms(latency_ms)
        .token_count(token_count)
        .status(status)
        .model(provider, model);
        if let Some(detail) = error_detail {
            event = event.error_detail(detail).level(LogLevel::Error);
        }
        if let Some(chunks) = chunks_json {
            event = event.chunks_json(chunks);
        }
        self.emit(event).await;
    }

    pub async fn log_upload(
        &self,
        filename: &str,
        page_count: usize,
        chunk_count: usize,
        user_id: Option<i64>,
    ) {
        self.emit(
            Event::new(
                EventType::Upload,
                format!("Uploaded '{filename}' - {page_count} pages, {chunk_count} chunks"),
            )
            .user(user_id, None),
        )
        .await;
    }

    pub async fn log_error(&self, message: &str, detail: &str, trace_id: &str) {
        self.emit(
            Event::new(EventType::Error, message)
                .level(LogLevel::Error)
                .trace(trace_id)
                .status("error")
                .error_detail(detail),
        )
        .await;
    }

    pub async fn log_system(&self, message: &str) {
        self.emit(Event::new(EventType::System, message)).await;
    }
}
