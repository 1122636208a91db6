//! Vision model adapter: page OCR and image captioning over the local
//! generate endpoint.

use async_trait::async_trait;
use base64::Engine;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// OCR timeout. Full-page transcription of dense scans is slow.
const OCR_TIMEOUT_SECS: u64 = 600;
/// Captioning is bounded tighter; captions are short.
const CAPTION_TIMEOUT_SECS: u64 = 300;

const OCR_PROMPT: &str = "You are a precise OCR engine. Transcribe every word of text visible \
on this document page exactly as it appears: headers, titles, paragraphs, numbered lists, \
captions, footnotes, and page numbers. Where an image appears, output [IMAGE] and nothing \
else about it. Do not paraphrase or summarize; transcribe verbatim, paying attention to \
small print, units, and technical terms.";

const CAPTION_PROMPT: &str = "Describe this image for a document search index. State what \
kind of visual it is (diagram, chart, photo, schematic), what it shows, any labels or \
annotations, and key values that are readable. Be factual; do not guess at details that \
are not visible.";

/// Vision-capable model used for OCR substitution and image captions.
#[async_trait]
pub trait VisionModel: Send + Sync {
    /// Transcribe a rendered page image (PNG bytes).
    async fn ocr_page(&self, image: &[u8]) -> Result<String>;

    /// Caption an embedded raster image for retrieval.
    async fn caption_image(&self, image: &[u8]) -> Result<String>;
}

/// Ollama-compatible vision client: `/api/generate` with an images array.
pub struct OllamaVision {
    client: reqwest::Client,
    base_url: String,
    model: String,
}

#[derive(Serialize)]
struct VisionRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    images: Vec<String>,
    stream: bool,
    options: VisionOptions,
}

#[derive(Serialize)]
struct VisionOptions {
    temperature: f32,
    num_predict: u32,
}

#[derive(Deserialize)]
struct VisionResponse {
    response: String,
}

impl OllamaVision {
    pub fn new(base_url: &str, model: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
        }
    }

    async fn call(&self, image: &[u8], prompt: &str, timeout_secs: u64) -> Result<String> {
        let encoded = base64::engine::general_purpose::STANDARD.encode(image);
        let url = format!("{}/api/generate", self.base_url);

        let resp = self
            .client
            .post(&url)
            .timeout(std::time::Duration::from_secs(timeout_secs))
            .json(&VisionRequest {
                model: &self.model,
                prompt,
                images: vec![encoded],
                stream: false,
                options: VisionOptions {
                    temperature: 0.0,
                    num_predict: 4096,
                },
            })
            .send()
            .await?
            .error_for_status()?;

        let body: VisionResponse = resp
            .json()
            .await
            .map_err(|e| Error::PermanentExternal(format!("vision response: {e}")))?;

        Ok(body.response.trim().to_string())
    }
}

#[async_trait]
impl VisionModel for OllamaVision {
    async fn ocr_page(&self, image: &[u8]) -> Result<String> {
        let text = self.call(image, OCR_PROMPT, OCR_TIMEOUT_SECS).await?;
        if text.is_empty() {
            warn!(model = %self.model, "vision OCR returned empty result");
        } else {
            debug!(model = %self.model, chars = text.len(), "vision OCR complete");
        }
        Ok(text)
    }

    async fn caption_image(&self, image: &[u8]) -> Result<String> {
        let caption = self.call(image, CAPTION_PROMPT, CAPTION_TIMEOUT_SECS).await?;
        debug!(model = %self.model, chars = caption.len(), "caption generated");
        Ok(caption)
    }
}
