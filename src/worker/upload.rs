//! Upload service: validation, hash-based dedupe, object storage, and
//! job dispatch. Extraction never runs on the request path; the record
//! is created `pending` and handed to the broker.

use std::sync::Arc;

use tracing::info;

use crate::error::{Error, Result};
use crate::models::{sanitize_filename, DocumentKind, DocumentRecord, NewDocument};
use crate::store::{object_key, DocumentStore, ObjectStore};

use super::{Broker, IngestJob};

/// Upload validation limits.
#[derive(Debug, Clone)]
pub struct UploadLimits {
    pub allowed_extensions: Vec<String>,
    pub max_file_size_bytes: u64,
}

impl Default for UploadLimits {
    fn default() -> Self {
        Self {
            allowed_extensions: vec!["pdf".into(), "pptx".into(), "ppt".into()],
            max_file_size_bytes: 50 * 1024 * 1024,
        }
    }
}

fn content_type_for(kind: DocumentKind) -> &'static str {
    match kind {
        DocumentKind::Pdf => "application/pdf",
        DocumentKind::Pptx => {
            "application/vnd.openxmlformats-officedocument.presentationml.presentation"
        }
        DocumentKind::Ppt => "application/vnd.ms-powerpoint",
    }
}

/// Accept an upload: validate, dedupe, store the object, create the
/// pending record, and dispatch the ingestion job.
pub async fn upload_document(
    documents: &Arc<dyn DocumentStore>,
    objects: &Arc<dyn ObjectStore>,
    broker: &Arc<dyn Broker>,
    limits: &UploadLimits,
    bytes: Vec<u8>,
    filename: &str,
    group_id: i64,
) -> Result<DocumentRecord> {
    let extension = filename
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_lowercase())
        .unwrap_or_default();
    if !limits.allowed_extensions.contains(&extension) {
        return Err(Error::InputInvalid(format!(
            "file type not allowed, accepted: {}",
            limits.allowed_extensions.join(", ")
        )));
    }
    let kind = DocumentKind::from_extension(&extension)
        .ok_or_else(|| Error::InputInvalid(format!("unsupported file type: {extension}")))?;

    if bytes.len() as u64 > limits.max_file_size_bytes {
        return Err(Error::InputInvalid(format!(
            "file too large, maximum is {} bytes",
            limits.max_file_size_bytes
        )));
    }

    // Content detection guards against renamed uploads; unknown content
    // is allowed through (legacy office formats confuse sniffers).
    if let Some(detected) = infer::get(&bytes) {
        let mime = detected.mime_type();
        let plausible = matches!(
            mime,
            "application/pdf"
                | "application/zip"
                | "application/vnd.openxmlformats-officedocument.presentationml.presentation"
                | "application/vnd.ms-powerpoint"
                | "application/x-ole-storage"
        );
        if !plausible {
            return Err(Error::InputInvalid(format!(
                "file content looks like {mime}, not {extension}"
            )));
        }
    }

    let content_hash = DocumentRecord::compute_hash(&bytes);
    if let Some(existing) = documents.find_by_hash(&content_hash, group_id).await? {
        return Err(Error::InputInvalid(format!(
            "duplicate file, already exists as '{}'",
            existing.filename
        )));
    }

    let safe_name = sanitize_filename(filename);
    let key = object_key(group_id, &content_hash, &safe_name);
    objects.put(&key, bytes, content_type_for(kind)).await?;

    let record = documents
        .create(NewDocument {
            filename: safe_name.clone(),
            content_hash,
            group_id,
            object_key: key,
            local_path: None,
        })
        .await?;

    broker
        .dispatch(&IngestJob {
            document_id: record.id,
        })
        .await?;

    info!(document = record.id, filename = %safe_name, group_id, "upload accepted");
    Ok(record)
}

/// Explicit retry: reset a terminal record to `pending` and re-dispatch.
pub async fn retry_document(
    documents: &Arc<dyn DocumentStore>,
    broker: &Arc<dyn Broker>,
    document_id: i64,
) -> Result<()> {
    documents.reset_for_retry(document_id).await?;
    broker.dispatch(&IngestJob { document_id }).await?;
    info!(document = document_id, "retry dispatched");
    Ok(())
}

/// Destroy a document together with its object and its index entries.
pub async fn delete_document(
    documents: &Arc<dyn DocumentStore>,
    objects: &Arc<dyn ObjectStore>,
    index: &Arc<dyn crate::vectordb::VectorIndex>,
    document_id: i64,
) -> Result<()> {
    let record = documents
        .get(document_id)
        .await?
        .ok_or_else(|| Error::DataConsistency(format!("document {document_id} not found")))?;

    if !record.object_key.is_empty() {
        objects.delete(&record.object_key).await?;
        index.delete_by_file_path(&record.object_key).await?;
    } else {
        index.delete_by_file_path(&record.filename).await?;
    }
    documents.delete(document_id).await?;
    info!(document = document_id, "document destroyed");
    Ok(())
}
