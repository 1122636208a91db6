//! Intermediate page records produced by the extractor.
//!
//! Pages are ephemeral: they exist only while an ingestion task runs.

use serde::{Deserialize, Serialize};

/// Which pipeline produced a page's text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExtractionMethod {
    /// Structural text and table extraction from the file format.
    Structural,
    /// The page raster was transcribed by the vision model.
    VisionOcr,
    /// Raw text extraction after the structural path failed entirely.
    Fallback,
}

impl ExtractionMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Structural => "structural",
            Self::VisionOcr => "vision-ocr",
            Self::Fallback => "fallback",
        }
    }
}

/// A table extracted from a page, rendered as pipe-delimited markdown.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageTable {
    pub markdown: String,
    pub rows: usize,
    pub cols: usize,
}

/// A raster image embedded in a page.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageImage {
    #[serde(skip)]
    pub bytes: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

/// One extracted page: combined text, its tables, its images, and the
/// captions generated for those images.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page {
    /// 1-based page (or slide) index.
    pub number: u32,
    /// Narrative text plus inline table blocks, or OCR output when the
    /// structural text was rejected.
    pub text: String,
    pub tables: Vec<PageTable>,
    pub images: Vec<PageImage>,
    /// Vision captions for the page's images, in image order.
    pub captions: Vec<String>,
    pub method: ExtractionMethod,
}

impl Page {
    pub fn new(number: u32, text: String, method: ExtractionMethod) -> Self {
        Self {
            number,
            text,
            tables: Vec::new(),
            images: Vec::new(),
            captions: Vec::new(),
            method,
        }
    }

    pub fn word_count(&self) -> usize {
        self.text.split_whitespace().count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn method_tags() {
        assert_eq!(ExtractionMethod::Structural.as_str(), "structural");
        assert_eq!(ExtractionMethod::VisionOcr.as_str(), "vision-ocr");
        assert_eq!(ExtractionMethod::Fallback.as_str(), "fallback");
    }

    #[test]
    fn word_count_splits_on_whitespace() {
        let page = Page::new(1, "brake  test\nresults".into(), ExtractionMethod::Structural);
        assert_eq!(page.word_count(), 3);
    }
}
