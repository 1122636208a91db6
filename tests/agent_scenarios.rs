//! End-to-end scenarios for the query pipeline, run against in-memory
//! collaborators.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use docrig::agent::{Agent, QueryContext};
use docrig::chat::{ChatRequest, ChatService};
use docrig::embed::{Bm25Encoder, DenseEmbedder};
use docrig::error::Result;
use docrig::events::{EventBus, EventQuery, EventStore, MemoryEventStore};
use docrig::generate::{
    refusal_response, AnswerGenerator, Delta, GenerateRequest, GeneratedAnswer, GroupProfile,
    NO_ANSWER,
};
use docrig::models::EventType;
use docrig::query::IntentClassifier;
use docrig::store::{ConversationStore, MemoryConversationStore};
use docrig::vectordb::{ChunkPayload, IndexPoint, MemoryIndex, PayloadMetadata, VectorIndex};

/// Deterministic toy embedding: character histogram over 8 buckets.
struct HashEmbedder;

#[async_trait]
impl DenseEmbedder for HashEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut v = vec![0.0f32; 8];
        for b in text.bytes() {
            v[(b % 8) as usize] += 1.0;
        }
        Ok(v)
    }

    fn dimension(&self) -> usize {
        8
    }
}

/// Generator that answers with a citation built from the first context
/// anchor it finds in the prompt, proving the anchor survived prompt
/// assembly.
struct CitingGenerator;

#[async_trait]
impl AnswerGenerator for CitingGenerator {
    async fn generate(&self, request: &GenerateRequest) -> Result<GeneratedAnswer> {
        let prompt = &request.user_prompt;
        let answer = match prompt.find("Source [") {
            Some(start) => {
                let anchor_start = start + "Source [".len();
                let anchor_end = prompt[anchor_start..]
                    .find(']')
                    .map(|i| anchor_start + i)
                    .unwrap_or(anchor_start);
                let anchor = &prompt[anchor_start..anchor_end];
                // Anchor reads "X.pdf, Page 7"; the citation format the
                // rules demand is "[Page 7, X.pdf]".
                match anchor.split_once(", Page ") {
                    Some((filename, page)) => {
                        format!("The measured value is 42 kW. [Page {page}, {filename}]")
                    }
                    None => NO_ANSWER.to_string(),
                }
            }
            None => NO_ANSWER.to_string(),
        };
        Ok(GeneratedAnswer {
            text: answer,
            provider: "cloud-chat".into(),
            model: "test-model".into(),
        })
    }
}

fn point(id: &str, group_id: i64, page: u32, filename: &str, text: &str) -> IndexPoint {
    IndexPoint {
        id: id.to_string(),
        dense: vec![1.0; 8],
        sparse: Bm25Encoder::default().encode(text),
        payload: ChunkPayload {
            text: text.to_string(),
            metadata: PayloadMetadata {
                group_id,
                page_number: page,
                file_path: format!("group_{group_id}/{filename}"),
                filename: filename.to_string(),
                section: String::new(),
                chunk_type: "prose".into(),
                extraction_method: "structural".into(),
                doc_id: None,
                vehicle_model: None,
                chassis_no: None,
                test_date: None,
                test_type: None,
                test_parameters: vec![],
                compliance_status: vec![],
                standards: vec![],
                keywords: vec![],
            },
        },
    }
}

struct Harness {
    agent: Agent,
    index: Arc<MemoryIndex>,
    events: Arc<MemoryEventStore>,
}

fn harness() -> Harness {
    let index = Arc::new(MemoryIndex::new());
    let events = Arc::new(MemoryEventStore::new());
    let bus = Arc::new(EventBus::new(events.clone()));

    let agent = Agent::new(
        IntentClassifier::rule_only(),
        Arc::new(HashEmbedder),
        Bm25Encoder::default(),
        index.clone(),
        Arc::new(CitingGenerator),
        bus,
        10,
    );

    Harness {
        agent,
        index,
        events,
    }
}

fn ctx(groups: Vec<i64>) -> QueryContext {
    QueryContext {
        group_ids: groups,
        profile: GroupProfile::Technical,
        ..Default::default()
    }
}

#[tokio::test]
async fn s1_out_of_scope_query_is_refused_without_retrieval() {
    let h = harness();
    let outcome = h.agent.run("what is today's weather?", &ctx(vec![1])).await;

    assert_eq!(outcome.intent, "out_of_scope");
    assert!(outcome.sources.is_empty());
    assert_eq!(outcome.answer, refusal_response());
    assert_eq!(outcome.status, "success");
}

#[tokio::test]
async fn s2_greeting_short_circuits_with_zero_latencies() {
    let h = harness();
    let outcome = h.agent.run("hello", &ctx(vec![1])).await;

    assert_eq!(outcome.intent, "greeting");
    assert!(outcome.sources.is_empty());
    assert_eq!(outcome.retrieval_ms, 0.0);
    assert_eq!(outcome.generation_ms, 0.0);
}

#[tokio::test]
async fn s3_filter_extraction_is_visible_on_the_trace() {
    let h = harness();
    h.index
        .upsert(vec![point("p1", 1, 3, "ETR_02_24_12.pdf", "Brake test summary")])
        .await
        .unwrap();

    let outcome = h
        .agent
        .run("Summarize ETR-02-24-12 for Pro 3012", &ctx(vec![1]))
        .await;
    assert_eq!(outcome.intent, "document_query");

    let (events, _) = h
        .events
        .query(&EventQuery {
            event_type: Some(EventType::System),
            limit: 50,
            ..Default::default()
        })
        .await
        .unwrap();
    let filter_event = events
        .iter()
        .find(|e| e.message.starts_with("Extracted filters"))
        .expect("filter extraction event");
    assert!(filter_event.message.contains("ETR_02_24_12"));
    assert!(filter_event.message.contains("Pro 3012"));
}

#[tokio::test]
async fn s4_answers_cite_page_and_document() {
    let h = harness();
    h.index
        .upsert(vec![point(
            "p1",
            1,
            7,
            "X.pdf",
            "Maximum engine power output measured at 42 kW during the performance run.",
        )])
        .await
        .unwrap();

    let outcome = h
        .agent
        .run("what is the maximum engine power?", &ctx(vec![1]))
        .await;
    assert!(
        outcome.answer.contains("[Page 7, X.pdf]"),
        "answer was: {}",
        outcome.answer
    );
    assert_eq!(outcome.sources.len(), 1);
    assert_eq!(outcome.sources[0].page_number, 7);
    assert_eq!(outcome.sources[0].filename, "X.pdf");
}

#[tokio::test]
async fn s5_empty_retrieval_yields_exact_refusal_sentence() {
    let h = harness();
    let outcome = h
        .agent
        .run("what is the cooling capacity?", &ctx(vec![1]))
        .await;

    assert_eq!(outcome.answer, NO_ANSWER);
    assert!(outcome.sources.is_empty());
    assert_eq!(outcome.status, "success");
}

#[tokio::test]
async fn access_confinement_holds_for_hybrid_retrieval() {
    let h = harness();
    h.index
        .upsert(vec![
            point("a", 1, 1, "a.pdf", "noise test results for group one"),
            point("b", 2, 1, "b.pdf", "noise test results for group two"),
            point("c", 3, 1, "c.pdf", "noise test results for group three"),
        ])
        .await
        .unwrap();

    let outcome = h.agent.run("noise test results", &ctx(vec![1, 3])).await;
    assert!(!outcome.sources.is_empty());
    for source in &outcome.sources {
        assert!(
            [1, 3].contains(&source.group_id),
            "chunk from group {} leaked",
            source.group_id
        );
    }
}

#[tokio::test]
async fn trace_is_complete_for_document_queries() {
    let h = harness();
    h.index
        .upsert(vec![point("p1", 1, 2, "r.pdf", "steering wheel torque data")])
        .await
        .unwrap();

    let outcome = h.agent.run("steering torque?", &ctx(vec![1])).await;
    let trace = outcome.trace_id.clone();

    let (events, _) = h
        .events
        .query(&EventQuery {
            trace_id: Some(trace.clone()),
            limit: 100,
            ..Default::default()
        })
        .await
        .unwrap();

    let count_of = |t: EventType| events.iter().filter(|e| e.event_type == t).count();
    assert_eq!(count_of(EventType::Request), 1);
    assert_eq!(count_of(EventType::Response), 1, "exactly one response rollup");
    assert!(count_of(EventType::Retrieval) >= 1);
    assert!(count_of(EventType::Generation) >= 1);

    let response = events
        .iter()
        .find(|e| e.event_type == EventType::Response)
        .unwrap();
    assert_eq!(response.status.as_deref(), Some("success"));
    assert!(response.chunks_json.is_some());
    assert!(response.token_count.unwrap() > 0);
}

#[tokio::test]
async fn greetings_still_produce_a_single_response_event() {
    let h = harness();
    let outcome = h.agent.run("hello", &ctx(vec![1])).await;

    let (events, _) = h
        .events
        .query(&EventQuery {
            trace_id: Some(outcome.trace_id.clone()),
            event_type: Some(EventType::Response),
            limit: 10,
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(events.len(), 1);
}

#[tokio::test]
async fn streaming_run_ends_with_sentinel_after_tokens() {
    let h = harness();
    h.index
        .upsert(vec![point("p1", 1, 4, "s.pdf", "axle load distribution table")])
        .await
        .unwrap();

    let (tx, mut rx) = mpsc::channel(32);
    let outcome = h.agent.run_stream("axle load?", &ctx(vec![1]), tx).await;

    let mut tokens = String::new();
    let mut saw_done = false;
    while let Some(delta) = rx.recv().await {
        match delta {
            Delta::Token(t) => {
                assert!(!saw_done, "token after sentinel");
                tokens.push_str(&t);
            }
            Delta::Done { .. } => saw_done = true,
            Delta::Failed(e) => panic!("stream failed: {e}"),
        }
    }
    assert!(saw_done);
    assert_eq!(tokens, outcome.answer);
}

#[tokio::test]
async fn empty_group_memberships_never_reach_retrieval() {
    let h = harness();
    let outcome = h.agent.run("anything", &ctx(vec![])).await;
    assert!(outcome.answer.contains("not assigned to any groups"));
    assert!(outcome.sources.is_empty());
}

#[tokio::test]
async fn chat_persists_both_turns_with_sources_and_intent() {
    let h = harness();
    h.index
        .upsert(vec![point("p1", 1, 5, "c.pdf", "coolant temperature readings")])
        .await
        .unwrap();

    let conversations = Arc::new(MemoryConversationStore::new());
    let service = ChatService::new(
        Arc::new(harness_agent(&h)),
        None,
        conversations.clone(),
    );

    let turn = service
        .chat(
            &ChatRequest {
                message: "what was the coolant temperature?".into(),
                ..Default::default()
            },
            7,
            None,
            vec![1],
            GroupProfile::General,
        )
        .await
        .unwrap();

    assert!(!turn.session_id.is_empty());
    let messages = conversations
        .recent_messages(turn.conversation_id, 10)
        .await
        .unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].content, "what was the coolant temperature?");
    assert_eq!(messages[1].intent.as_deref(), Some("document_query"));
    assert!(messages[1].sources_json.is_some());

    // Second turn in the same conversation sees the history fallback.
    let turn2 = service
        .chat(
            &ChatRequest {
                message: "and the maximum?".into(),
                conversation_id: Some(turn.conversation_id),
                session_id: Some(turn.session_id.clone()),
                ..Default::default()
            },
            7,
            None,
            vec![1],
            GroupProfile::General,
        )
        .await
        .unwrap();
    assert_eq!(turn2.conversation_id, turn.conversation_id);
    // Short query with history classifies as follow-up.
    assert_eq!(turn2.outcome.intent, "follow_up");
}

/// Build a second agent sharing the harness's index and event store
/// (the ChatService takes ownership of its agent).
fn harness_agent(h: &Harness) -> Agent {
    Agent::new(
        IntentClassifier::rule_only(),
        Arc::new(HashEmbedder),
        Bm25Encoder::default(),
        h.index.clone(),
        Arc::new(CitingGenerator),
        Arc::new(EventBus::new(h.events.clone())),
        10,
    )
}

#[tokio::test]
async fn sparse_only_matches_are_still_retrievable() {
    // A document whose dense vector is orthogonal to the query still
    // surfaces through the sparse space.
    let h = harness();
    let mut p = point("p1", 1, 1, "z.pdf", "gradeability percentage on test slope");
    p.dense = vec![0.0; 8];
    p.sparse = Bm25Encoder::default().encode("gradeability percentage on test slope");
    h.index.upsert(vec![p]).await.unwrap();

    let outcome = h.agent.run("gradeability percentage", &ctx(vec![1])).await;
    assert_eq!(outcome.sources.len(), 1);
}

#[tokio::test]
async fn dense_only_search_respects_groups_too() {
    let h = harness();
    h.index
        .upsert(vec![
            point("a", 1, 1, "a.pdf", "text"),
            point("b", 2, 1, "b.pdf", "text"),
        ])
        .await
        .unwrap();

    let query_vec = HashEmbedder.embed("text").await.unwrap();
    let hits = h.index.search_dense(&query_vec, &[2], 10).await.unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].payload.metadata.group_id, 2);
}
