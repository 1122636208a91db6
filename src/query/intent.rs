//! Intent classification: rules first, LLM fallback for low confidence.

use std::sync::Arc;
use std::sync::OnceLock;

use regex::{Regex, RegexBuilder};
use tracing::{debug, warn};

use crate::generate::{AnswerGenerator, GenerateRequest};
use crate::models::HistoryMessage;

/// Categorical classification of a user utterance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent {
    Greeting,
    DocumentQuery,
    FollowUp,
    Clarification,
    OutOfScope,
}

impl Intent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Greeting => "greeting",
            Self::DocumentQuery => "document_query",
            Self::FollowUp => "follow_up",
            Self::Clarification => "clarification",
            Self::OutOfScope => "out_of_scope",
        }
    }

    /// All intents, used to map LLM fallback output.
    fn all() -> [Intent; 5] {
        [
            Self::Greeting,
            Self::DocumentQuery,
            Self::FollowUp,
            Self::Clarification,
            Self::OutOfScope,
        ]
    }
}

/// Confidence below which the LLM fallback kicks in.
const LLM_FALLBACK_THRESHOLD: f32 = 0.75;

fn ci(pattern: &str) -> Regex {
    RegexBuilder::new(pattern)
        .case_insensitive(true)
        .build()
        .expect("invalid intent pattern")
}

struct RuleSet {
    greetings: Vec<Regex>,
    follow_ups: Vec<Regex>,
    out_of_scope: Vec<Regex>,
}

fn rules() -> &'static RuleSet {
    static RULES: OnceLock<RuleSet> = OnceLock::new();
    RULES.get_or_init(|| RuleSet {
        greetings: vec![
            ci(r"^(hi|hello|hey|good\s*(morning|afternoon|evening)|greetings)[\s!.,]*$"),
            ci(r"^(how\s+are\s+you|what'?s\s+up|howdy)[\s!?,]*$"),
            ci(r"^(thanks?|thank\s+you|bye|goodbye|see\s+you)[\s!.,]*$"),
        ],
        follow_ups: vec![
            ci(r"^(what|which|how|where|when|why|who)\s+(about|is|are|was|were)\s+(it|this|that|these|those)"),
            ci(r"^(tell\s+me\s+more|more\s+details|explain|elaborate)"),
            ci(r"^(and|also|additionally|furthermore)\b"),
            ci(r"^(can\s+you|could\s+you)\s+(also|explain|show)"),
        ],
        out_of_scope: vec![
            ci(r"(weather|news|joke|song|music|movie|game|sport)"),
            ci(r"(write\s+code|python|javascript|programming)"),
            ci(r"(recipe|cook|food|restaurant)"),
        ],
    })
}

/// Rule-based fast path.
pub fn classify_rules(query: &str, has_history: bool) -> (Intent, f32) {
    let q = query.trim().to_lowercase();
    let r = rules();

    for pattern in &r.greetings {
        if pattern.is_match(&q) {
            return (Intent::Greeting, 0.95);
        }
    }

    if has_history {
        for pattern in &r.follow_ups {
            if pattern.is_match(&q) {
                return (Intent::FollowUp, 0.85);
            }
        }
        // Very short queries with history are likely follow-ups.
        if q.split_whitespace().count() <= 3 {
            return (Intent::FollowUp, 0.7);
        }
    }

    for pattern in &r.out_of_scope {
        if pattern.is_match(&q) {
            return (Intent::OutOfScope, 0.8);
        }
    }

    (Intent::DocumentQuery, 0.9)
}

/// Classifier with optional LLM fallback.
pub struct IntentClassifier {
    llm: Option<Arc<dyn AnswerGenerator>>,
    /// Always consult the LLM, even when the rules are confident.
    always_use_llm: bool,
}

impl IntentClassifier {
    pub fn rule_only() -> Self {
        Self {
            llm: None,
            always_use_llm: false,
        }
    }

    pub fn with_llm(llm: Arc<dyn AnswerGenerator>, always_use_llm: bool) -> Self {
        Self {
            llm: Some(llm),
            always_use_llm,
        }
    }

    /// Classify a query. The LLM fallback never raises; on any error
    /// the rule-based result stands.
    pub async fn classify(&self, query: &str, history: &[HistoryMessage]) -> (Intent, f32) {
        let rule_result = classify_rules(query, !history.is_empty());

        let wants_llm = self.always_use_llm || rule_result.1 < LLM_FALLBACK_THRESHOLD;
        if !wants_llm {
            return rule_result;
        }
        let Some(llm) = &self.llm else {
            return rule_result;
        };

        match self.classify_llm(llm.as_ref(), query, history).await {
            Some(result) => result,
            None => rule_result,
        }
    }

    async fn classify_llm(
        &self,
        llm: &dyn AnswerGenerator,
        query: &str,
        history: &[HistoryMessage],
    ) -> Option<(Intent, f32)> {
        let context: String = history
            .iter()
            .rev()
            .take(3)
            .rev()
            .map(|m| format!("{}: {}", m.role.as_str(), m.content))
            .collect::<Vec<_>>()
            .join("\n");

        let prompt = format!(
            "Classify the user's intent into exactly one of these categories:\n\
             - GREETING: simple greetings, thanks, or farewells\n\
             - DOCUMENT_QUERY: questions about vehicle documents, test reports, specifications\n\
             - FOLLOW_UP: continuation or clarification of the previous conversation\n\
             - CLARIFICATION: the user is asking what was meant earlier\n\
             - OUT_OF_SCOPE: anything unrelated to vehicle documentation\n\n\
             Conversation history:\n{}\n\n\
             User message: {}\n\n\
             Respond with ONLY the category name (e.g. DOCUMENT_QUERY):",
            if context.is_empty() { "(no history)" } else { &context },
            query
        );

        let request = GenerateRequest::user_only(prompt);
        match llm.generate(&request).await {
            Ok(answer) => {
                let upper = answer.text.trim().to_uppercase();
                for intent in Intent::all() {
                    if upper.contains(&intent.as_str().to_uppercase()) {
                        debug!(intent = intent.as_str(), "llm intent fallback");
                        return Some((intent, 0.9));
                    }
                }
                Some((Intent::DocumentQuery, 0.6))
            }
            Err(err) => {
                warn!(error = %err, "llm intent fallback failed, keeping rule result");
                None
            }
        }
    }
}
