//! Presentation parsing contract.
//!
//! Like the PDF parser, the PPTX reader is an external collaborator.
//! One slide yields one page; the extractor assembles shape text,
//! tables, speaker notes, and image captions into the slide's text.

use std::path::Path;

use crate::error::Result;
use crate::extract::pdf::{RawImage, RawTable};

/// Content of a single slide as reported by the parser.
#[derive(Debug, Clone, Default)]
pub struct SlideContent {
    /// Visible text of every shape, in shape order.
    pub texts: Vec<String>,
    pub tables: Vec<RawTable>,
    /// Speaker notes, if the slide has a notes frame.
    pub notes: Option<String>,
    /// Embedded pictures.
    pub images: Vec<RawImage>,
}

/// An open slide deck.
pub trait SlideDeck: Send {
    fn slide_count(&self) -> usize;

    /// Content of a slide (0-based index).
    fn slide(&self, index: usize) -> Result<SlideContent>;
}

/// Opens presentation files.
pub trait SlideDeckBackend: Send + Sync {
    fn open(&self, path: &Path) -> Result<Box<dyn SlideDeck>>;
}
