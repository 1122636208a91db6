//! Structured selector detection in user queries.
//!
//! Detects document ids, vehicle models, chassis numbers, and test-type
//! phrases so retrieval can filter on payload metadata. The enhanced
//! query keeps the literal tokens visible to the sparse index even when
//! they only appear in payload metadata.

use std::sync::OnceLock;

use regex::{Regex, RegexBuilder};

use crate::vectordb::MetadataFilters;

struct QueryPatterns {
    doc_id: Regex,
    vehicle_model: Regex,
    chassis_no: Regex,
    test_type: Regex,
}

fn patterns() -> &'static QueryPatterns {
    fn ci(pattern: &str) -> Regex {
        RegexBuilder::new(pattern)
            .case_insensitive(true)
            .build()
            .expect("invalid query pattern")
    }

    static PATTERNS: OnceLock<QueryPatterns> = OnceLock::new();
    PATTERNS.get_or_init(|| QueryPatterns {
        // Engineering test report ids: ETR_02_24_12, ETR-01-25-03, ...
        doc_id: ci(r"ETR[-_]?\d{1,2}[-_]\d{2}[-_]\d{1,4}"),
        // Vehicle models: Pro 3012, Pro 6028XPT, Pro 2110 XPT, ...
        vehicle_model: ci(r"Pro\s*\d{4}(?:\s*[A-Z]{2,4})?"),
        // Chassis numbers: MC2BHGRC0RB110801
        chassis_no: ci(r"MC[0-9A-Z]{14,17}"),
        test_type: ci(
            r"(?:brake\s*test|noise\s*test|performance\s*test|emission\s*test|endurance\s*test|durability\s*test|gradeability|fuel\s*consumption|acceleration|load\s*test)",
        ),
    })
}

/// Detect structured selectors in a query.
pub fn extract_filters(query: &str) -> MetadataFilters {
    let p = patterns();
    let mut filters = MetadataFilters::default();

    if let Some(m) = p.doc_id.find(query) {
        filters.doc_id = Some(m.as_str().replace('-', "_").to_uppercase());
    }
    if let Some(m) = p.vehicle_model.find(query) {
        filters.vehicle_model = Some(m.as_str().trim().to_string());
    }
    if let Some(m) = p.chassis_no.find(query) {
        filters.chassis_no = Some(m.as_str().to_uppercase());
    }
    if let Some(m) = p.test_type.find(query) {
        filters.test_type = Some(m.as_str().to_lowercase().replace(' ', "_"));
    }

    filters
}

/// Append matched selectors to the query so the sparse index scores the
/// literal tokens.
pub fn build_enhanced_query(query: &str, filters: &MetadataFilters) -> String {
    let mut parts = Vec::new();
    if let Some(doc_id) = &filters.doc_id {
        parts.push(format!("Document: {doc_id}"));
    }
    if let Some(model) = &filters.vehicle_model {
        parts.push(format!("Vehicle: {model}"));
    }
    if let Some(chassis) = &filters.chassis_no {
        parts.push(format!("Chassis: {chassis}"));
    }

    if parts.is_empty() {
        query.to_string()
    } else {
        format!("{} [{}]", query, parts.join(" | "))
    }
}
