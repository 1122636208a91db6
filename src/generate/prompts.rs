//! Prompt assembly per group profile, plus the canned responses used by
//! the agent's terminal nodes.

use crate::models::HistoryMessage;
use crate::vectordb::SearchHit;

/// The exact sentence returned when context cannot answer the question.
pub const NO_ANSWER: &str = "This information is not available in the uploaded documents.";

/// A named prompt template family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GroupProfile {
    Technical,
    Compliance,
    #[default]
    General,
}

impl GroupProfile {
    pub fn parse(s: &str) -> Self {
        match s {
            "technical" => Self::Technical,
            "compliance" => Self::Compliance,
            _ => Self::General,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Technical => "technical",
            Self::Compliance => "compliance",
            Self::General => "general",
        }
    }
}

/// System and user halves of an assembled prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptParts {
    pub system: String,
    pub user: String,
}

/// Strict grounding rules shared by every profile.
const GROUNDING_RULES: &str = "\
## CRITICAL RULES - YOU MUST FOLLOW THESE:
1. Answer ONLY from the CONTEXT below. Do NOT use external or pre-trained knowledge.
2. If a specific question cannot be answered from the context, respond ONLY with: \"This information is not available in the uploaded documents.\"
3. If the query is broad (a bare document name or topic), summarize what the context contains about it or list the matching documents.
4. NEVER fabricate data, names, values, standards, or references.
5. Every claim must be traceable to the context. Cite sources as [Page X, Document Name].
6. Reproduce numbers, units, and test results exactly as they appear; do not paraphrase them.
7. When a table in the context is relevant, reproduce it faithfully in pipe-delimited Markdown.";

/// Assemble the prompt pair for a profile.
pub fn build_prompt(
    profile: GroupProfile,
    context: &str,
    query: &str,
    history: &str,
) -> PromptParts {
    let system = match profile {
        GroupProfile::Technical => format!(
            "You are a senior vehicle test engineer assistant specializing in technical \
             documentation analysis.\n\n\
             ## YOUR EXPERTISE:\n\
             - Vehicle performance testing (brake, cooling, steering, acceleration)\n\
             - Engine specifications and diagnostics\n\
             - Chassis and component details\n\
             - Test procedures and measurements\n\
             {GROUNDING_RULES}\n\
             ## FORMATTING RULES:\n\
             - Give specific technical values with units (e.g. \"825 Nm @ 1200-1600 rpm\")\n\
             - Reference test conditions (laden/unladen, temperature, speed)\n\
             - Format specification tables properly\n\
             - Cite sources: [Page X, Document Name]"
        ),
        GroupProfile::Compliance => format!(
            "You are a vehicle compliance and regulatory specialist assistant.\n\n\
             ## YOUR EXPERTISE:\n\
             - Regulatory standards (AIS, Euro norms, safety regulations)\n\
             - Certification requirements and homologation documentation\n\
             - Compliance testing procedures and limits\n\
             {GROUNDING_RULES}\n\
             ## FORMATTING RULES:\n\
             - Highlight compliance status (PASS/FAIL/MEETING/NOT MEETING)\n\
             - Reference specific standards and norms (e.g. \"AIS 153\", \"Euro V\")\n\
             - Include permissible limits versus actual values when available\n\
             - Cite sources with page numbers"
        ),
        GroupProfile::General => format!(
            "You are a helpful assistant for vehicle test documentation.\n\
             {GROUNDING_RULES}\n\
             ## FORMATTING RULES:\n\
             - Be clear and concise\n\
             - Include relevant data with proper formatting\n\
             - Cite sources: [Page X, Filename]"
        ),
    };

    let user = format!(
        "## CONTEXT (Retrieved from documents):\n{}\n\n\
         ## CONVERSATION HISTORY:\n{}\n\n\
         ## USER QUESTION:\n{}",
        context,
        if history.is_empty() {
            "(New conversation)"
        } else {
            history
        },
        query
    );

    PromptParts { system, user }
}

/// Format retrieved hits into citation-ready context blocks.
pub fn format_context(hits: &[SearchHit]) -> String {
    let mut context = String::new();
    for hit in hits {
        let meta = &hit.payload.metadata;
        let mut source = format!("[{}, Page {}", meta.filename, meta.page_number);
        if !meta.section.is_empty() {
            source.push_str(", ");
            source.push_str(&meta.section);
        }
        source.push(']');
        context.push_str(&format!("Source {}:\n{}\n\n", source, hit.payload.text));
    }
    context
}

/// Render the last `last_n` history turns as `ROLE: content` lines.
pub fn format_history(history: &[HistoryMessage], last_n: usize) -> String {
    let skip = history.len().saturating_sub(last_n);
    history[skip..]
        .iter()
        .map(|m| format!("{}: {}", m.role.as_str().to_uppercase(), m.content))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Canned response for greeting intents; keyed on farewell/thanks.
pub fn greeting_response(query: &str) -> String {
    let q = query.to_lowercase();

    if ["bye", "goodbye", "see you"].iter().any(|w| q.contains(w)) {
        return "Goodbye! Come back any time you have questions about your vehicle documentation."
            .to_string();
    }
    if q.contains("thank") {
        return "You're welcome! Let me know if you need anything else.".to_string();
    }

    "Hello! I'm your vehicle documentation assistant. I can help you with:\n\n\
     - **Test reports** - performance, brake, cooling, steering tests\n\
     - **Vehicle specifications** - engine, chassis, component details\n\
     - **Compliance information** - regulatory standards, certifications\n\n\
     What would you like to know about your documents?"
        .to_string()
}

/// Canned response for out-of-scope queries.
pub fn refusal_response() -> String {
    "I'm specialized in vehicle test documentation and can't help with that topic.\n\n\
     I can assist you with:\n\
     - Vehicle test reports and performance data\n\
     - Technical specifications and component details\n\
     - Compliance and regulatory information\n\n\
     Please ask about your uploaded vehicle documents!"
        .to_string()
}
