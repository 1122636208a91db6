//! ClickHouse-backed event store.
//!
//! One append-only `events` MergeTree table ordered by
//! `(timestamp, event_type)`; the `response` rows double as the trace
//! index.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use clickhouse::{Client, Row};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::config::EventStoreSettings;
use crate::error::{Error, Result};
use crate::models::{Event, EventType, LogLevel};

use super::{EventQuery, EventStore, TypeStat};

const CREATE_TABLE: &str = "\
CREATE TABLE IF NOT EXISTS events (
    event_id UUID,
    timestamp DateTime64(3, 'UTC'),
    event_type String,
    level String,
    trace_id String,
    user_id Nullable(Int64),
    user_email Nullable(String),
    message String,
    query Nullable(String),
    response Nullable(String),
    chunks_json Nullable(String),
    latency_ms Nullable(Float64),
    token_count Nullable(UInt32),
    status Nullable(String),
    error_detail Nullable(String),
    model_provider Nullable(String),
    model_name Nullable(String)
) ENGINE = MergeTree()
ORDER BY (timestamp, event_type)";

#[derive(Debug, Row, Serialize, Deserialize)]
struct EventRow {
    #[serde(with = "clickhouse::serde::uuid")]
    event_id: Uuid,
    #[serde(with = "clickhouse::serde::chrono::datetime64::millis")]
    timestamp: DateTime<Utc>,
    event_type: String,
    level: String,
    trace_id: String,
    user_id: Option<i64>,
    user_email: Option<String>,
    message: String,
    query: Option<String>,
    response: Option<String>,
    chunks_json: Option<String>,
    latency_ms: Option<f64>,
    token_count: Option<u32>,
    status: Option<String>,
    error_detail: Option<String>,
    model_provider: Option<String>,
    model_name: Option<String>,
}

impl From<&Event> for EventRow {
    fn from(event: &Event) -> Self {
        Self {
            event_id: event.event_id,
            timestamp: event.timestamp,
            event_type: event.event_type.as_str().to_string(),
            level: event.level.as_str().to_string(),
            trace_id: event.trace_id.clone(),
            user_id: event.user_id,
            user_email: event.user_email.clone(),
            message: event.message.clone(),
            query: event.query.clone(),
            response: event.response.clone(),
            chunks_json: event.chunks_json.clone(),
            latency_ms: event.latency_ms,
            token_count: event.token_count,
            status: event.status.clone(),
            error_detail: event.error_detail.clone(),
            model_provider: event.model_provider.clone(),
            model_name: event.model_name.clone(),
        }
    }
}

fn parse_event_type(s: &str) -> EventType {
    match s {
        "request" => EventType::Request,
        "embedding" => EventType::Embedding,
        "retrieval" => EventType::Retrieval,
        "generation" => EventType::Generation,
        "response" => EventType::Response,
        "upload" => EventType::Upload,
        "reindex" => EventType::Reindex,
        "error" => EventType::Error,
        _ => EventType::System,
    }
}

fn parse_level(s: &str) -> LogLevel {
    match s {
        "DEBUG" => LogLevel::Debug,
        "WARNING" => LogLevel::Warning,
        "ERROR" => LogLevel::Error,
        _ => LogLevel::Info,
    }
}

impl From<EventRow> for Event {
    fn from(row: EventRow) -> Self {
        Event {
            event_id: row.event_id,
            timestamp: row.timestamp,
            event_type: parse_event_type(&row.event_type),
            level: parse_level(&row.level),
            trace_id: row.trace_id,
            user_id: row.user_id,
            user_email: row.user_email,
            message: row.message,
            query: row.query,
            response: row.response,
            chunks_json: row.chunks_json,
            latency_ms: row.latency_ms,
            token_count: row.token_count,
            status: row.status,
            error_detail: row.error_detail,
            model_provider: row.model_provider,
            model_name: row.model_name,
        }
    }
}

#[derive(Debug, Row, Deserialize)]
struct StatRow {
    event_type: String,
    cnt: u64,
    avg_latency: Option<f64>,
    error_count: u64,
}

fn cherr(err: clickhouse::error::Error) -> Error {
    Error::TransientExternal(format!("event store: {err}"))
}

/// Event store backed by a ClickHouse `events` table.
pub struct ClickHouseEventStore {
    client: Client,
    database: String,
}

impl ClickHouseEventStore {
    pub fn connect(settings: &EventStoreSettings) -> Self {
        let client = Client::default()
            .with_url(&settings.url)
            .with_database(&settings.database)
            .with_user(&settings.user)
            .with_password(&settings.password);
        Self {
            client,
            database: settings.database.clone(),
        }
    }

    /// Build the WHERE clause and bind its parameters in order.
    fn filtered(&self, select: &str, suffix: &str, query: &EventQuery) -> clickhouse::query::Query {
        let mut conditions: Vec<&str> = Vec::new();
        if query.event_type.is_some() {
            conditions.push("event_type = ?");
        }
        if query.level.is_some() {
            conditions.push("level = ?");
        }
        if query.trace_id.is_some() {
            conditions.push("trace_id = ?");
        }
        if query.user_id.is_some() {
            conditions.push("user_id = ?");
        }
        if query.status.is_some() {
            conditions.push("status = ?");
        }
        if query.start_date.is_some() {
            conditions.push("toDate(timestamp) >= ?");
        }
        if query.end_date.is_some() {
            conditions.push("toDate(timestamp) <= ?");
        }
        if query.search.is_some() {
            conditions.push("(message ILIKE ? OR query ILIKE ?)");
        }

        let where_sql = if conditions.is_empty() {
            "1 = 1".to_string()
        } else {
            conditions.join(" AND ")
        };
        let sql = format!("{select} WHERE {where_sql} {suffix}");

        let mut q = self.client.query(&sql);
        if let Some(event_type) = query.event_type {
            q = q.bind(event_type.as_str());
        }
        if let Some(level) = &query.level {
            q = q.bind(level.as_str());
        }
        if let Some(trace_id) = &query.trace_id {
            q = q.bind(trace_id.as_str());
        }
        if let Some(user_id) = query.user_id {
            q = q.bind(user_id);
        }
        if let Some(status) = &query.status {
            q = q.bind(status.as_str());
        }
        if let Some(start) = &query.start_date {
            q = q.bind(start.as_str());
        }
        if let Some(end) = &query.end_date {
            q = q.bind(end.as_str());
        }
        if let Some(search) = &query.search {
            let pattern = format!("%{search}%");
            q = q.bind(pattern.clone());
            q = q.bind(pattern);
        }
        q
    }
}

#[async_trait]
impl EventStore for ClickHouseEventStore {
    async fn ensure_schema(&self) -> Result<()> {
        // The database may not exist yet; issue its DDL from `default`.
        let admin = self.client.clone().with_database("default");
        admin
            .query(&format!("CREATE DATABASE IF NOT EXISTS {}", self.database))
            .execute()
            .await
            .map_err(cherr)?;

        self.client.query(CREATE_TABLE).execute().await.map_err(cherr)?;
        info!(database = %self.database, "event schema ready");
        Ok(())
    }

    async fn insert(&self, event: &Event) -> Result<()> {
        let mut insert = self.client.insert("events").map_err(cherr)?;
        insert.write(&EventRow::from(event)).await.map_err(cherr)?;
        insert.end().await.map_err(cherr)?;
        Ok(())
    }

    async fn query(&self, query: &EventQuery) -> Result<(Vec<Event>, u64)> {
        let total: u64 = self
            .filtered("SELECT count() FROM events", "", query)
            .fetch_one()
            .await
            .map_err(cherr)?;

        let limit = if query.limit == 0 { 50 } else { query.limit };
        let suffix = format!(
            "ORDER BY timestamp DESC LIMIT {limit} OFFSET {offset}",
            offset = query.offset
        );
        let rows: Vec<EventRow> = self
            .filtered("SELECT ?fields FROM events", &suffix, query)
            .fetch_all()
            .await
            .map_err(cherr)?;

        Ok((rows.into_iter().map(Event::from).collect(), total))
    }

    async fn histogram(&self, hours: u32) -> Result<Vec<TypeStat>> {
        let sql = format!(
            "SELECT event_type, count() AS cnt, avg(latency_ms) AS avg_latency, \
             countIf(status = 'error') AS error_count \
             FROM events \
             WHERE timestamp >= now() - INTERVAL {hours} HOUR \
             GROUP BY event_type ORDER BY cnt DESC"
        );
        let rows: Vec<StatRow> = self.client.query(&sql).fetch_all().await.map_err(cherr)?;

        Ok(rows
            .into_iter()
            .map(|row| TypeStat {
                event_type: row.event_type,
                count: row.cnt,
                avg_latency_ms: row.avg_latency,
                errors: row.error_count,
            })
            .collect())
    }
}
