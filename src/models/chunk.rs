//! Retrieval units and their derived metadata.

use serde::{Deserialize, Serialize};

/// Shape of a retrieval unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChunkKind {
    Prose,
    /// Tables are never split across chunks.
    Table,
    /// A whole slide, unless the slide was exceptionally long.
    Slide,
    /// Vision caption for an embedded image; tagged distinctly so
    /// downstream consumers may weight them.
    ImageCaption,
}

impl ChunkKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Prose => "prose",
            Self::Table => "table",
            Self::Slide => "slide",
            Self::ImageCaption => "image-caption",
        }
    }
}

/// A chunk as produced by the chunker, before indexing enriches it with
/// document identity and metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct RawChunk {
    pub text: String,
    pub page_number: u32,
    pub kind: ChunkKind,
}

/// Structured fields pulled from report text for filter support.
///
/// Every field is optional or empty; extraction never fails, it just
/// leaves what it cannot find unset.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChunkMetadata {
    pub doc_id: Option<String>,
    pub section: Option<String>,
    pub vehicle_model: Option<String>,
    pub chassis_no: Option<String>,
    pub test_date: Option<String>,
    pub test_type: Option<String>,
    pub report_no: Option<String>,
    pub registration_no: Option<String>,
    pub engine_model: Option<String>,
    pub gvw: Option<String>,
    pub power: Option<String>,
    #[serde(default)]
    pub test_parameters: Vec<String>,
    #[serde(default)]
    pub compliance_status: Vec<String>,
    #[serde(default)]
    pub standards: Vec<String>,
    #[serde(default)]
    pub keywords: Vec<String>,
}
