//! Structured metadata extraction from report text.
//!
//! A fixed regex catalogue pulls identifiers, models, standards, and
//! test vocabulary out of a text blob. Extraction never fails: fields
//! that do not match stay unset.

use std::sync::OnceLock;

use regex::{Regex, RegexBuilder};

use crate::models::ChunkMetadata;

/// Test types commonly found in vehicle reports.
const TEST_TYPES: &[&str] = &[
    "gradability",
    "brake",
    "noise",
    "cooling",
    "weighment",
    "agility",
    "articulation",
    "steering",
    "suspension",
    "emission",
    "durability",
    "performance",
    "safety",
];

/// Domain keywords carried into the chunk payload verbatim.
const VEHICLE_TERMS: &[&str] = &[
    "CNG", "BSVI", "BSIV", "kW", "torque", "power", "GVW", "diesel", "petrol", "hybrid", "EV",
    "electric",
];

struct Patterns {
    vehicle_model: Regex,
    chassis_no: Regex,
    test_date: Regex,
    report_no: Regex,
    registration_no: Regex,
    engine_model: Regex,
    gvw: Regex,
    power: Regex,
    standards: Regex,
    compliance_pass: Regex,
    compliance_fail: Regex,
}

fn ci(pattern: &str) -> Regex {
    RegexBuilder::new(pattern)
        .case_insensitive(true)
        .build()
        .expect("invalid metadata pattern")
}

fn patterns() -> &'static Patterns {
    static PATTERNS: OnceLock<Patterns> = OnceLock::new();
    PATTERNS.get_or_init(|| Patterns {
        vehicle_model: ci(r"Model:\s*([A-Za-z0-9][A-Za-z0-9 \-]*?)(?:\n|$)"),
        chassis_no: ci(r"Chassis\s*(?:No\.?|Number)?:?\s*([A-Z0-9]+)"),
        test_date: ci(r"Date:\s*(\d{2}[.\-/]\d{2}[.\-/]\d{4})"),
        report_no: ci(r"(?:Test\s*Report\s*No\.?|ETR):?\s*(ETR[_\-]?\d+[_\-]?\d*[_\-]?\d*)"),
        registration_no: ci(
            r"(?:Reg(?:istration)?\.?\s*No\.?|Regd\.?\s*No\.?):?\s*([A-Z]{2}\d{2}[A-Z]{1,3}\d{4})",
        ),
        engine_model: ci(r"Engine\s*(?:Model|Type):?\s*([A-Za-z0-9][A-Za-z0-9 \-]*?)(?:\n|$)"),
        gvw: ci(r"(?:GVW|Gross\s*Vehicle\s*Weight):?\s*(\d+(?:\.\d+)?)\s*(?:kg)?"),
        power: ci(r"(?:Power|Max\.?\s*Power):?\s*(\d+(?:\.\d+)?)\s*(?:kW|hp)"),
        standards: ci(r"\b(?:IS|AIS)[\s:\-]*\d+(?:[:\-]\d+)*\b"),
        compliance_pass: ci(r"\b(?:meeting|pass(?:ed)?|compliant)\b"),
        compliance_fail: ci(r"\b(?:not\s+meeting|fail(?:ed)?|non[\-\s]?compliant)\b"),
    })
}

fn capture(re: &Regex, text: &str) -> Option<String> {
    re.captures(text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Extract metadata from a text blob. `doc_name` seeds the `doc_id`.
pub fn extract_metadata(text: &str, doc_name: &str) -> ChunkMetadata {
    let p = patterns();
    let mut meta = ChunkMetadata {
        doc_id: (!doc_name.is_empty()).then(|| doc_name.to_string()),
        ..Default::default()
    };

    meta.vehicle_model = capture(&p.vehicle_model, text);
    meta.chassis_no = capture(&p.chassis_no, text);
    meta.test_date = capture(&p.test_date, text);
    meta.report_no = capture(&p.report_no, text);
    meta.registration_no = capture(&p.registration_no, text);
    meta.engine_model = capture(&p.engine_model, text);
    meta.gvw = capture(&p.gvw, text);
    meta.power = capture(&p.power, text);

    for m in p.standards.find_iter(text) {
        let standard = m.as_str().to_string();
        if !meta.standards.contains(&standard) {
            meta.standards.push(standard);
        }
    }

    let lower = text.to_lowercase();
    for test in TEST_TYPES {
        if lower.contains(test) {
            meta.test_parameters.push(test.to_string());
        }
    }
    meta.test_type = meta.test_parameters.first().cloned();

    if p.compliance_pass.is_match(text) {
        meta.compliance_status.push("pass".to_string());
    }
    if p.compliance_fail.is_match(text) {
        meta.compliance_status.push("fail".to_string());
    }

    for term in VEHICLE_TERMS {
        if text.contains(term) && !meta.keywords.contains(&term.to_string()) {
            meta.keywords.push(term.to_string());
        }
    }

    meta
}

/// Merge document-level and chunk-level metadata.
///
/// List fields union; scalar fields take the chunk value when the chunk
/// found one.
pub fn merge_metadata(doc: &ChunkMetadata, chunk: &ChunkMetadata) -> ChunkMetadata {
    let mut merged = doc.clone();

    for (target, source) in [
        (&mut merged.keywords, &chunk.keywords),
        (&mut merged.test_parameters, &chunk.test_parameters),
        (&mut merged.compliance_status, &chunk.compliance_status),
        (&mut merged.standards, &chunk.standards),
    ] {
        for value in source {
            if !target.contains(value) {
                target.push(value.clone());
            }
        }
    }

    if chunk.test_type.is_some() {
        merged.test_type = chunk.test_type.clone();
    }
    if chunk.vehicle_model.is_some() {
        merged.vehicle_model = chunk.vehicle_model.clone();
    }
    if chunk.chassis_no.is_some() {
        merged.chassis_no = chunk.chassis_no.clone();
    }

    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "Test Report No: ETR_02_24_12\n\
        Model: Pro 3012\n\
        Chassis No: MC2BHGRC0RB110801\n\
        Date: 15.03.2024\n\
        Engine Model: E494 CNG\n\
        GVW: 12500 kg\n\
        Max Power: 125 kW\n\
        Brake test conducted per AIS 153 and IS 11852-2001. Result: meeting requirements.";

    #[test]
    fn extracts_scalar_fields() {
        let meta = extract_metadata(SAMPLE, "etr_02_24_12.pdf");
        assert_eq!(meta.doc_id.as_deref(), Some("etr_02_24_12.pdf"));
        assert_eq!(meta.vehicle_model.as_deref(), Some("Pro 3012"));
        assert_eq!(meta.chassis_no.as_deref(), Some("MC2BHGRC0RB110801"));
        assert_eq!(meta.test_date.as_deref(), Some("15.03.2024"));
        assert_eq!(meta.report_no.as_deref(), Some("ETR_02_24_12"));
        assert_eq!(meta.gvw.as_deref(), Some("12500"));
        assert_eq!(meta.power.as_deref(), Some("125"));
    }

    #[test]
    fn extracts_standards_and_compliance() {
        let meta = extract_metadata(SAMPLE, "");
        assert!(meta.standards.iter().any(|s| s.contains("153")));
        assert!(meta.standards.iter().any(|s| s.contains("11852")));
        assert_eq!(meta.compliance_status, vec!["pass"]);
    }

    #[test]
    fn test_types_and_keywords() {
        let meta = extract_metadata(SAMPLE, "");
        assert_eq!(meta.test_type.as_deref(), Some("brake"));
        assert!(meta.test_parameters.contains(&"brake".to_string()));
        assert!(meta.keywords.contains(&"CNG".to_string()));
        assert!(meta.keywords.contains(&"kW".to_string()));
    }

    #[test]
    fn never_fails_on_arbitrary_text() {
        let meta = extract_metadata("completely unrelated text", "");
        assert!(meta.vehicle_model.is_none());
        assert!(meta.standards.is_empty());
        assert!(meta.compliance_status.is_empty());
    }

    #[test]
    fn failure_verbs_flag_fail_status() {
        let meta = extract_metadata("Cooling test failed, not meeting AIS 153.", "");
        assert!(meta.compliance_status.contains(&"fail".to_string()));
    }

    #[test]
    fn merge_unions_lists_and_overrides_scalars() {
        let doc = ChunkMetadata {
            test_type: Some("brake".into()),
            vehicle_model: Some("Pro 3012".into()),
            keywords: vec!["CNG".into()],
            standards: vec!["AIS 153".into()],
            ..Default::default()
        };
        let chunk = ChunkMetadata {
            test_type: Some("noise".into()),
            keywords: vec!["torque".into(), "CNG".into()],
            ..Default::default()
        };

        let merged = merge_metadata(&doc, &chunk);
        assert_eq!(merged.test_type.as_deref(), Some("noise"));
        assert_eq!(merged.vehicle_model.as_deref(), Some("Pro 3012"));
        assert_eq!(merged.keywords, vec!["CNG".to_string(), "torque".to_string()]);
        assert_eq!(merged.standards, vec!["AIS 153".to_string()]);
    }
}
