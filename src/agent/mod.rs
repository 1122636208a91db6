//! The agentic query pipeline: a deterministic state machine routing a
//! query through intent classification and, for document queries,
//! filter extraction, hybrid retrieval, and generation.
//!
//! ```text
//! start -> classify_intent
//! classify_intent - greeting     -> handle_greeting -> end
//!                 - out_of_scope -> handle_refusal  -> end
//!                 - else         -> extract_filters -> retrieve -> generate -> end
//! ```
//!
//! The pipeline never raises to the caller: every failure is folded
//! into the outcome and recorded on the trace's `response` event.

use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::{mpsc, Semaphore};
use tracing::warn;

use crate::embed::{Bm25Encoder, DenseEmbedder};
use crate::error::Error;
use crate::events::{estimate_tokens, new_trace_id, EventBus};
use crate::generate::{
    build_prompt, format_context, format_history, greeting_response, refusal_response,
    AnswerGenerator, Delta, GenerateRequest, GroupProfile, ProviderChoice, NO_ANSWER,
};
use crate::models::{Event, EventType, HistoryMessage};
use crate::query::{build_enhanced_query, extract_filters, Intent, IntentClassifier};
use crate::rerank::{rerank_hits, Reranker};
use crate::vectordb::{HybridSearch, MetadataFilters, SearchHit, VectorIndex};

/// History turns included in the generation prompt.
const PROMPT_HISTORY_TURNS: usize = 5;
/// Snippet length for client-facing sources.
const SNIPPET_CHARS: usize = 200;
/// Chunk text cap in the trace rollup.
const TRACE_CHUNK_CHARS: usize = 500;
/// Hits kept after the optional rerank pass.
const RERANK_TOP_K: usize = 5;

/// Per-request context resolved by the caller.
#[derive(Debug, Clone, Default)]
pub struct QueryContext {
    pub session_id: String,
    pub user_id: Option<i64>,
    pub user_email: Option<String>,
    /// Restrict the search to one group; `None` searches all
    /// accessible groups.
    pub group_id: Option<i64>,
    /// Groups the caller is a member of. Access control inside the
    /// retriever filters on these.
    pub group_ids: Vec<i64>,
    pub profile: GroupProfile,
    pub history: Vec<HistoryMessage>,
    pub provider_override: Option<ProviderChoice>,
    /// Opt-in: push extracted selectors as strict index filters.
    pub strict_filters: bool,
}

/// A trimmed, client-facing reference to a retrieved chunk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceRef {
    pub page_number: u32,
    pub filename: String,
    pub file_path: String,
    pub group_id: i64,
    pub score: f32,
    pub text_snippet: String,
    pub full_text: String,
}

impl SourceRef {
    fn from_hit(hit: &SearchHit) -> Self {
        let text = &hit.payload.text;
        let snippet = if text.chars().count() > SNIPPET_CHARS {
            let cut: String = text.chars().take(SNIPPET_CHARS).collect();
            format!("{cut}...")
        } else {
            text.clone()
        };
        Self {
            page_number: hit.payload.metadata.page_number,
            filename: hit.payload.metadata.filename.clone(),
            file_path: hit.payload.metadata.file_path.clone(),
            group_id: hit.payload.metadata.group_id,
            score: hit.score,
            text_snippet: snippet,
            full_text: text.clone(),
        }
    }
}

/// Everything the caller gets back from one query.
#[derive(Debug, Clone)]
pub struct AgentOutcome {
    pub answer: String,
    pub sources: Vec<SourceRef>,
    pub intent: String,
    pub confidence: f32,
    pub trace_id: String,
    pub retrieval_ms: f64,
    pub generation_ms: f64,
    pub total_ms: f64,
    /// `success` or `error`.
    pub status: String,
    pub error_detail: Option<String>,
}

/// Internal state threaded through the nodes.
struct AgentState {
    trace_id: String,
    intent: Intent,
    confidence: f32,
    filters: MetadataFilters,
    enhanced_query: String,
    hits: Vec<SearchHit>,
    sources: Vec<SourceRef>,
    answer: String,
    provider: String,
    model: String,
    retrieval_ms: f64,
    generation_ms: f64,
    error_detail: Option<String>,
    /// Whether a streaming sentinel has already been delivered.
    sentinel_sent: bool,
}

/// The compiled query pipeline.
pub struct Agent {
    classifier: IntentClassifier,
    embedder: Arc<dyn DenseEmbedder>,
    sparse: Bm25Encoder,
    index: Arc<dyn VectorIndex>,
    generator: Arc<dyn AnswerGenerator>,
    events: Arc<EventBus>,
    /// Optional cross-encoder pass over the retrieved hits.
    reranker: Option<Arc<dyn Reranker>>,
    /// Bounded permits for upstream calls so the request scheduler
    /// never saturates on network I/O.
    gate: Arc<Semaphore>,
}

impl Agent {
    pub fn new(
        classifier: IntentClassifier,
        embedder: Arc<dyn DenseEmbedder>,
        sparse: Bm25Encoder,
        index: Arc<dyn VectorIndex>,
        generator: Arc<dyn AnswerGenerator>,
        events: Arc<EventBus>,
        gate_permits: usize,
    ) -> Self {
        Self {
            classifier,
            embedder,
            sparse,
            index,
            generator,
            events,
            reranker: None,
            gate: Arc::new(Semaphore::new(gate_permits.max(1))),
        }
    }

    pub fn with_reranker(mut self, reranker: Arc<dyn Reranker>) -> Self {
        self.reranker = Some(reranker);
        self
    }

    /// Run a query, buffered.
    pub async fn run(&self, query: &str, ctx: &QueryContext) -> AgentOutcome {
        self.run_inner(query, ctx, None).await
    }

    /// Run a query, copying each generation delta into `stream` before
    /// the pipeline returns. The channel always ends with a sentinel.
    pub async fn run_stream(
        &self,
        query: &str,
        ctx: &QueryContext,
        stream: mpsc::Sender<Delta>,
    ) -> AgentOutcome {
        self.run_inner(query, ctx, Some(stream)).await
    }

    async fn run_inner(
        &self,
        query: &str,
        ctx: &QueryContext,
        stream: Option<mpsc::Sender<Delta>>,
    ) -> AgentOutcome {
        let started = Instant::now();
        let trace_id = new_trace_id();
        self.events
            .log_request(query, &trace_id, ctx.user_id, ctx.user_email.clone())
            .await;

        let mut state = AgentState {
            trace_id: trace_id.clone(),
            intent: Intent::DocumentQuery,
            confidence: 0.0,
            filters: MetadataFilters::default(),
            enhanced_query: query.to_string(),
            hits: Vec::new(),
            sources: Vec::new(),
            answer: String::new(),
            provider: String::new(),
            model: String::new(),
            retrieval_ms: 0.0,
            generation_ms: 0.0,
            error_detail: None,
            sentinel_sent: false,
        };

        if ctx.group_ids.is_empty() && ctx.group_id.is_none() {
            state.answer = "You are not assigned to any groups.".to_string();
            state.error_detail = Some("caller has no accessible groups".to_string());
        } else {
            self.classify_node(query, ctx, &mut state).await;
            match state.intent {
                Intent::Greeting => self.greeting_node(query, &mut state, stream.as_ref()).await,
                Intent::OutOfScope => self.refusal_node(&mut state, stream.as_ref()).await,
                _ => {
                    self.filter_node(query, &mut state).await;
                    if self.retrieve_node(ctx, &mut state).await {
                        self.generate_node(query, ctx, &mut state, stream.as_ref())
                            .await;
                    }
                }
            }
        }

        // Every streamed request ends with exactly one sentinel, even
        // on paths that never reached the generator.
        if let Some(tx) = &stream {
            if !state.sentinel_sent {
                let sentinel = match &state.error_detail {
                    Some(detail) => Delta::Failed(detail.clone()),
                    None => Delta::Done {
                        provider: state.provider.clone(),
                        model: state.model.clone(),
                    },
                };
                let _ = tx.send(sentinel).await;
            }
        }

        let total_ms = started.elapsed().as_secs_f64() * 1000.0;
        let status = if state.error_detail.is_some() {
            "error"
        } else {
            "success"
        };

        self.log_rollup(query, ctx, &state, total_ms, status).await;

        AgentOutcome {
            answer: state.answer,
            sources: state.sources,
            intent: state.intent.as_str().to_string(),
            confidence: state.confidence,
            trace_id,
            retrieval_ms: state.retrieval_ms,
            generation_ms: state.generation_ms,
            total_ms,
            status: status.to_string(),
            error_detail: state.error_detail,
        }
    }

    async fn classify_node(&self, query: &str, ctx: &QueryContext, state: &mut AgentState) {
        let (intent, confidence) = self.classifier.classify(query, &ctx.history).await;
        state.intent = intent;
        state.confidence = confidence;

        self.events
            .emit(
                Event::new(
                    EventType::System,
                    format!(
                        "Intent classified: {} (confidence: {confidence:.2})",
                        intent.as_str()
                    ),
                )
                .trace(&state.trace_id),
            )
            .await;
    }

    async fn greeting_node(
        &self,
        query: &str,
        state: &mut AgentState,
        stream: Option<&mpsc::Sender<Delta>>,
    ) {
        state.answer = greeting_response(query);
        state.sentinel_sent = self.send_canned(&state.answer, stream).await;
    }

    async fn refusal_node(&self, state: &mut AgentState, stream: Option<&mpsc::Sender<Delta>>) {
        state.answer = refusal_response();
        state.sentinel_sent = self.send_canned(&state.answer, stream).await;
    }

    /// Returns true when a sentinel was delivered to a live stream.
    async fn send_canned(&self, answer: &str, stream: Option<&mpsc::Sender<Delta>>) -> bool {
        let Some(tx) = stream else {
            return false;
        };
        let _ = tx.send(Delta::Token(answer.to_string())).await;
        let _ = tx
            .send(Delta::Done {
                provider: String::new(),
                model: String::new(),
            })
            .await;
        true
    }

    async fn filter_node(&self, query: &str, state: &mut AgentState) {
        state.filters = extract_filters(query);
        state.enhanced_query = build_enhanced_query(query, &state.filters);

        let message = if state.filters.is_empty() {
            "No filters extracted".to_string()
        } else {
            format!(
                "Extracted filters: {}",
                serde_json::to_string(&state.filters).unwrap_or_default()
            )
        };
        self.events
            .emit(Event::new(EventType::System, message).trace(&state.trace_id))
            .await;
    }

    /// Returns false when retrieval failed and the pipeline must stop.
    async fn retrieve_node(&self, ctx: &QueryContext, state: &mut AgentState) -> bool {
        let started = Instant::now();

        let group_ids = match ctx.group_id {
            Some(group) => vec![group],
            None => ctx.group_ids.clone(),
        };

        let result = async {
            let _permit = self
                .gate
                .acquire()
                .await
                .map_err(|_| Error::Internal("request gate closed".into()))?;

            let dense = self.embedder.embed(&state.enhanced_query).await?;
            let sparse = self.sparse.encode(&state.enhanced_query);

            let filters = if ctx.strict_filters && !state.filters.is_empty() {
                Some(state.filters.clone())
            } else {
                None
            };
            let search =
                HybridSearch::new(dense, sparse, group_ids).with_filters(filters);
            self.index.search_hybrid(&search).await
        }
        .await;

        state.retrieval_ms = started.elapsed().as_secs_f64() * 1000.0;

        match result {
            Ok(mut hits) => {
                if let Some(reranker) = &self.reranker {
                    hits = rerank_hits(
                        reranker.as_ref(),
                        &state.enhanced_query,
                        hits,
                        RERANK_TOP_K,
                    )
                    .await;
                }
                state.sources = hits.iter().map(SourceRef::from_hit).collect();
                let top_score = hits.first().map(|h| h.score).unwrap_or(0.0);
                self.events
                    .log_retrieval(hits.len(), top_score, state.retrieval_ms, &state.trace_id)
                    .await;
                state.hits = hits;
                true
            }
            Err(err) => {
                warn!(error = %err, "retrieval failed");
                state.error_detail = Some(err.to_string());
                state.answer = format!(
                    "Something went wrong while searching your documents. \
                     Please try again (trace {}).",
                    state.trace_id
                );
                self.events
                    .log_error("Retrieval failed", &err.to_string(), &state.trace_id)
                    .await;
                false
            }
        }
    }

    async fn generate_node(
        &self,
        query: &str,
        ctx: &QueryContext,
        state: &mut AgentState,
        stream: Option<&mpsc::Sender<Delta>>,
    ) {
        let started = Instant::now();

        if state.hits.is_empty() {
            state.answer = NO_ANSWER.to_string();
            state.sentinel_sent = self.send_canned(NO_ANSWER, stream).await;
            return;
        }

        let context = format_context(&state.hits);
        let history = format_history(&ctx.history, PROMPT_HISTORY_TURNS);
        let parts = build_prompt(ctx.profile, &context, query, &history);
        let request =
            GenerateRequest::new(parts).with_override(ctx.provider_override.clone());

        let result = async {
            let _permit = self
                .gate
                .acquire()
                .await
                .map_err(|_| Error::Internal("request gate closed".into()))?;
            match stream {
                Some(tx) => self.generator.generate_stream(&request, tx.clone()).await,
                None => self.generator.generate(&request).await,
            }
        }
        .await;

        state.generation_ms = started.elapsed().as_secs_f64() * 1000.0;
        // The generator's stream path always terminates the channel
        // itself, with Done or Failed.
        state.sentinel_sent = stream.is_some();

        match result {
            Ok(answer) => {
                let prompt_tokens = estimate_tokens(&request.user_prompt);
                let completion_tokens = estimate_tokens(&answer.text);
                self.events
                    .log_generation(
                        prompt_tokens,
                        completion_tokens,
                        state.generation_ms,
                        &state.trace_id,
                        &answer.provider,
                        &answer.model,
                    )
                    .await;
                state.answer = answer.text;
                state.provider = answer.provider;
                state.model = answer.model;
            }
            Err(err) => {
                // Provider failures become a typed outcome, never a
                // propagated exception.
                warn!(error = %err, "generation failed");
                state.error_detail = Some(err.to_string());
                state.answer = format!(
                    "The language model could not produce an answer. \
                     Please try again (trace {}).",
                    state.trace_id
                );
                self.events
                    .log_error("Generation failed", &err.to_string(), &state.trace_id)
                    .await;
            }
        }
    }

    async fn log_rollup(
        &self,
        query: &str,
        ctx: &QueryContext,
        state: &AgentState,
        total_ms: f64,
        status: &str,
    ) {
        let trace_chunks: Vec<serde_json::Value> = state
            .hits
            .iter()
            .map(|hit| {
                let text = &hit.payload.text;
                let capped: String = if text.chars().count() > TRACE_CHUNK_CHARS {
                    format!(
                        "{}...",
                        text.chars().take(TRACE_CHUNK_CHARS).collect::<String>()
                    )
                } else {
                    text.clone()
                };
                json!({
                    "text": capped,
                    "score": hit.score,
                    "page_number": hit.payload.metadata.page_number,
                    "file_path": hit.payload.metadata.file_path,
                    "group_id": hit.payload.metadata.group_id,
                })
            })
            .collect();
        let chunks_json = if trace_chunks.is_empty() {
            None
        } else {
            serde_json::to_string(&trace_chunks).ok()
        };

        let context_text: String = state
            .hits
            .iter()
            .map(|h| h.payload.text.as_str())
            .collect::<Vec<_>>()
            .join(" ");
        let tokens = estimate_tokens(&format!("{query} {context_text}"))
            + estimate_tokens(&state.answer);

        self.events
            .log_response(
                &state.trace_id,
                query,
                &state.answer,
                chunks_json,
                total_ms,
                tokens,
                status,
                state.error_detail.clone(),
                ctx.user_id,
                &state.provider,
                &state.model,
            )
            .await;
    }
}
