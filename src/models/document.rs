//! Document descriptors for uploaded artifacts.
//!
//! A record is created before the ingestion job is dispatched and is
//! mutated only by the worker or an explicit retry.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Processing status of a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingStatus {
    Pending,
    Processing,
    Done,
    Failed,
}

impl ProcessingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "processing" => Some(Self::Processing),
            "done" => Some(Self::Done),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    /// Whether a terminal record may be reset to `pending` by retry.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }
}

/// Declared kind of an uploaded file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentKind {
    Pdf,
    Pptx,
    /// Legacy format, converted to PDF before extraction.
    Ppt,
}

impl DocumentKind {
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_lowercase().as_str() {
            "pdf" => Some(Self::Pdf),
            "pptx" => Some(Self::Pptx),
            "ppt" => Some(Self::Ppt),
            _ => None,
        }
    }

    pub fn from_path(path: &Path) -> Option<Self> {
        path.extension()
            .and_then(|e| e.to_str())
            .and_then(Self::from_extension)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pdf => "pdf",
            Self::Pptx => "pptx",
            Self::Ppt => "ppt",
        }
    }
}

/// A document record as stored by the relational collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentRecord {
    pub id: i64,
    /// Sanitized display name.
    pub filename: String,
    /// SHA-256 of the raw bytes; unique per owning group.
    pub content_hash: String,
    pub group_id: i64,
    /// Object-store key, empty when the file only exists locally.
    pub object_key: String,
    /// Local path fallback used when no object key is set.
    pub local_path: Option<PathBuf>,
    pub status: ProcessingStatus,
    /// Failure message, set only when `status == Failed`.
    pub error: Option<String>,
    pub chunk_count: u32,
    /// Opaque handle of the task currently processing this record.
    pub task_handle: Option<String>,
    pub uploaded_at: DateTime<Utc>,
}

impl DocumentRecord {
    /// Compute SHA-256 hash of content.
    pub fn compute_hash(content: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(content);
        hex::encode(hasher.finalize())
    }
}

/// Fields required to create a document record at upload time.
#[derive(Debug, Clone)]
pub struct NewDocument {
    pub filename: String,
    pub content_hash: String,
    pub group_id: i64,
    pub object_key: String,
    pub local_path: Option<PathBuf>,
}

/// Sanitize a display filename to safe characters.
pub fn sanitize_filename(filename: &str) -> String {
    let (name, ext) = match filename.rsplit_once('.') {
        Some((n, e)) => (n, Some(e)),
        None => (filename, None),
    };
    let mut safe: String = name
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect();
    safe = safe.trim_start_matches('.').to_string();
    if safe.is_empty() {
        safe = "document".to_string();
    }
    match ext {
        Some(e) => format!("{}.{}", safe, e.to_lowercase()),
        None => safe,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_stable_hex_sha256() {
        let h = DocumentRecord::compute_hash(b"hello");
        assert_eq!(h.len(), 64);
        assert_eq!(h, DocumentRecord::compute_hash(b"hello"));
        assert_ne!(h, DocumentRecord::compute_hash(b"hello!"));
    }

    #[test]
    fn kind_from_extension() {
        assert_eq!(DocumentKind::from_extension("PDF"), Some(DocumentKind::Pdf));
        assert_eq!(DocumentKind::from_extension("pptx"), Some(DocumentKind::Pptx));
        assert_eq!(DocumentKind::from_extension("ppt"), Some(DocumentKind::Ppt));
        assert_eq!(DocumentKind::from_extension("docx"), None);
    }

    #[test]
    fn status_round_trip() {
        for s in [
            ProcessingStatus::Pending,
            ProcessingStatus::Processing,
            ProcessingStatus::Done,
            ProcessingStatus::Failed,
        ] {
            assert_eq!(ProcessingStatus::parse(s.as_str()), Some(s));
        }
        assert!(ProcessingStatus::Done.is_terminal());
        assert!(!ProcessingStatus::Processing.is_terminal());
    }

    #[test]
    fn sanitize_replaces_unsafe_characters() {
        assert_eq!(sanitize_filename("My Report (2024).PDF"), "My_Report__2024_.pdf");
        assert_eq!(sanitize_filename("..hidden.pdf"), "hidden.pdf");
        assert_eq!(sanitize_filename(""), "document");
    }
}
