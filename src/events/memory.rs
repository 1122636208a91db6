//! In-memory event store used by tests and local development.

use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{Duration, Utc};

use crate::error::Result;
use crate::models::Event;

use super::{EventQuery, EventStore, TypeStat};

/// Append-only event store held in process memory.
#[derive(Default)]
pub struct MemoryEventStore {
    events: Mutex<Vec<Event>>,
}

impl MemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn matches(event: &Event, query: &EventQuery) -> bool {
        if let Some(event_type) = query.event_type {
            if event.event_type != event_type {
                return false;
            }
        }
        if let Some(level) = &query.level {
            if event.level.as_str() != level {
                return false;
            }
        }
        if let Some(trace_id) = &query.trace_id {
            if &event.trace_id != trace_id {
                return false;
            }
        }
        if let Some(user_id) = query.user_id {
            if event.user_id != Some(user_id) {
                return false;
            }
        }
        if let Some(status) = &query.status {
            if event.status.as_deref() != Some(status.as_str()) {
                return false;
            }
        }
        let date = event.timestamp.format("%Y-%m-%d").to_string();
        if let Some(start) = &query.start_date {
            if date.as_str() < start.as_str() {
                return false;
            }
        }
        if let Some(end) = &query.end_date {
            if date.as_str() > end.as_str() {
                return false;
            }
        }
        if let Some(search) = &query.search {
            let needle = search.to_lowercase();
            let in_message = event.message.to_lowercase().contains(&needle);
            let in_query = event
                .query
                .as_deref()
                .map(|q| q.to_lowercase().contains(&needle))
                .unwrap_or(false);
            if !in_message && !in_query {
                return false;
            }
        }
        true
    }
}

#[async_trait]
impl EventStore for MemoryEventStore {
    async fn ensure_schema(&self) -> Result<()> {
        Ok(())
    }

    async fn insert(&self, event: &Event) -> Result<()> {
        self.events.lock().unwrap().push(event.clone());
        Ok(())
    }

    async fn query(&self, query: &EventQuery) -> Result<(Vec<Event>, u64)> {
        let events = self.events.lock().unwrap();
        let mut matched: Vec<Event> = events
            .iter()
            .filter(|e| Self::matches(e, query))
            .cloned()
            .collect();
        matched.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));

        let total = matched.len() as u64;
        let page: Vec<Event> = matched
            .into_iter()
            .skip(query.offset)
            .take(if query.limit == 0 { usize::MAX } else { query.limit })
            .collect();
        Ok((page, total))
    }

    async fn histogram(&self, hours: u32) -> Result<Vec<TypeStat>> {
        let cutoff = Utc::now() - Duration::hours(hours as i64);
        let events = self.events.lock().unwrap();

        let mut stats: Vec<TypeStat> = Vec::new();
        for event in events.iter().filter(|e| e.timestamp >= cutoff) {
            let name = event.event_type.as_str().to_string();
            let entry = match stats.iter_mut().find(|s| s.event_type == name) {
                Some(entry) => entry,
                None => {
                    stats.push(TypeStat {
                        event_type: name,
                        count: 0,
                        avg_latency_ms: None,
                        errors: 0,
                    });
                    stats.last_mut().unwrap()
                }
            };
            entry.count += 1;
            if event.status.as_deref() == Some("error") {
                entry.errors += 1;
            }
            if let Some(latency) = event.latency_ms {
                let prior = entry.avg_latency_ms.unwrap_or(0.0);
                let n = entry.count as f64;
                entry.avg_latency_ms = Some(prior + (latency - prior) / n);
            }
        }

        stats.sort_by(|a, b| b.count.cmp(&a.count));
        Ok(stats)
    }
}
