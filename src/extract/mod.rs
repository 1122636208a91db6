//! Document extraction: turns an uploaded file into ordered pages.
//!
//! PDFs get a structural pass with a vision-OCR substitution for pages
//! whose text is unreadable; presentations yield one page per slide.
//! The parsers themselves live behind backend traits.

mod convert;
pub mod pdf;
pub mod pptx;
mod structural;

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::embed::VisionModel;
use crate::error::{Error, Result};
use crate::models::{DocumentKind, ExtractionMethod, Page, PageImage};

pub use convert::convert_ppt_to_pdf;
pub use pdf::{detect_layout_tables, PdfBackend, PdfDocument, RawImage, RawTable};
pub use pptx::{SlideContent, SlideDeck, SlideDeckBackend};
pub use structural::StructuralPdfBackend;

/// Turns a local file into ordered pages.
#[async_trait]
pub trait DocumentExtractor: Send + Sync {
    async fn extract(&self, path: &Path, kind: DocumentKind) -> Result<Vec<Page>>;
}

/// Extraction thresholds.
#[derive(Debug, Clone)]
pub struct ExtractorConfig {
    /// Minimum stripped text length for a structural page to be kept.
    pub min_text_chars: usize,
    /// More CID placeholders than this (with the residual text still
    /// short) rejects the page.
    pub max_cid_markers: usize,
    /// Minimum pixel edge for an embedded image to be extracted.
    pub min_image_px: u32,
}

impl Default for ExtractorConfig {
    fn default() -> Self {
        Self {
            min_text_chars: 50,
            max_cid_markers: 5,
            min_image_px: 100,
        }
    }
}

/// The production extractor.
pub struct Extractor {
    pdf: Arc<dyn PdfBackend>,
    /// Structural presentation parser. When absent, presentations are
    /// converted to PDF and take the PDF path.
    decks: Option<Arc<dyn SlideDeckBackend>>,
    vision: Arc<dyn VisionModel>,
    config: ExtractorConfig,
}

impl Extractor {
    pub fn new(
        pdf: Arc<dyn PdfBackend>,
        decks: Option<Arc<dyn SlideDeckBackend>>,
        vision: Arc<dyn VisionModel>,
        config: ExtractorConfig,
    ) -> Self {
        Self {
            pdf,
            decks,
            vision,
            config,
        }
    }

    /// Whether a page's structural text is readable enough to keep.
    fn accept_structural(&self, text: &str) -> bool {
        let stripped = text.trim();
        if stripped.chars().count() >= self.config.min_text_chars {
            let cid_count = pdf::count_cid_markers(text);
            if cid_count > self.config.max_cid_markers {
                let residual = pdf::strip_cid_markers(text);
                return residual.trim().chars().count() >= self.config.min_text_chars;
            }
            return true;
        }
        false
    }

    async fn extract_pdf(&self, path: &Path) -> Result<Vec<Page>> {
        let doc = match self.pdf.open(path) {
            Ok(doc) => doc,
            Err(err) => {
                warn!(path = %path.display(), error = %err, "structural pdf open failed, using raw text");
                return self.raw_fallback(path);
            }
        };

        let count = doc.page_count();
        if count == 0 {
            return self.raw_fallback(path);
        }

        let mut pages = Vec::with_capacity(count);
        for index in 0..count {
            pages.push(self.extract_pdf_page(doc.as_ref(), index).await);
        }
        Ok(pages)
    }

    async fn extract_pdf_page(&self, doc: &dyn PdfDocument, index: usize) -> Page {
        let number = (index + 1) as u32;
        let text = match doc.page_text(index) {
            Ok(text) => text,
            Err(err) => {
                warn!(page = number, error = %err, "page text extraction failed");
                String::new()
            }
        };
        let raw_tables = doc.page_tables(index).unwrap_or_default();

        // Images above the minimum size are kept regardless of which
        // text path runs.
        let images: Vec<PageImage> = doc
            .page_images(index)
            .unwrap_or_default()
            .into_iter()
            .filter(|img| {
                img.width >= self.config.min_image_px && img.height >= self.config.min_image_px
            })
            .map(|img| PageImage {
                bytes: img.bytes,
                width: img.width,
                height: img.height,
            })
            .collect();

        let mut page = if self.accept_structural(&text) {
            let mut combined = vec![text.trim_end().to_string()];
            let mut tables = Vec::new();
            for (i, raw) in raw_tables.iter().enumerate() {
                if let Some(table) = pdf::render_table_markdown(raw) {
                    combined.push(format!(
                        "\n[TABLE {} - {} rows x {} columns]\n{}",
                        i + 1,
                        table.rows,
                        table.cols,
                        table.markdown
                    ));
                    tables.push(table);
                }
            }
            let mut page = Page::new(number, combined.join("\n"), ExtractionMethod::Structural);
            page.tables = tables;
            page
        } else {
            // The OCR path cannot recover table structure, so tables
            // from this page are dropped.
            match self.ocr_page(doc, index).await {
                Some(ocr_text) => Page::new(number, ocr_text, ExtractionMethod::VisionOcr),
                None => {
                    warn!(page = number, "vision OCR unavailable, keeping structural text");
                    Page::new(number, text, ExtractionMethod::Structural)
                }
            }
        };

        for image in &images {
            match self.vision.caption_image(&image.bytes).await {
                Ok(caption) if !caption.is_empty() => page.captions.push(caption),
                Ok(_) => {}
                Err(err) => warn!(page = number, error = %err, "image captioning failed"),
            }
        }
        page.images = images;
        page
    }

    async fn ocr_page(&self, doc: &dyn PdfDocument, index: usize) -> Option<String> {
        let raster = match doc.render_page_png(index) {
            Ok(raster) => raster,
            Err(err) => {
                warn!(page = index + 1, error = %err, "page raster failed");
                return None;
            }
        };
        match self.vision.ocr_page(&raster).await {
            Ok(text) if !text.is_empty() => Some(text),
            Ok(_) => None,
            Err(err) => {
                warn!(page = index + 1, error = %err, "vision OCR failed");
                None
            }
        }
    }

    /// Convert a presentation to PDF and run the PDF path.
    async fn convert_and_extract(&self, path: &Path) -> Result<Vec<Page>> {
        let out_dir = path
            .parent()
            .ok_or_else(|| Error::InputInvalid("file has no parent directory".into()))?;
        let pdf_path = convert_ppt_to_pdf(path, out_dir).await?;
        self.extract_pdf(&pdf_path).await
    }

    /// Simplest raw extraction, used when the structural library fails
    /// entirely. Never produces zero pages for a file that opens.
    fn raw_fallback(&self, path: &Path) -> Result<Vec<Page>> {
        let raw = self.pdf.raw_text(path)?;
        let mut pages: Vec<Page> = raw
            .split('\u{c}')
            .enumerate()
            .filter(|(_, text)| !text.trim().is_empty())
            .map(|(i, text)| Page::new((i + 1) as u32, text.trim().to_string(), ExtractionMethod::Fallback))
            .collect();
        if pages.is_empty() {
            pages.push(Page::new(1, raw.trim().to_string(), ExtractionMethod::Fallback));
        }
        Ok(pages)
    }

    async fn extract_pptx(&self, path: &Path) -> Result<Vec<Page>> {
        let Some(decks) = &self.decks else {
            return self.convert_and_extract(path).await;
        };
        let deck = decks.open(path)?;
        let count = deck.slide_count();
        if count == 0 {
            return Err(Error::PermanentExternal(
                "presentation contains no slides".into(),
            ));
        }

        let mut pages = Vec::with_capacity(count);
        for index in 0..count {
            let content = deck.slide(index)?;
            pages.push(self.assemble_slide(index, content).await);
        }
        Ok(pages)
    }

    async fn assemble_slide(&self, index: usize, content: SlideContent) -> Page {
        let number = (index + 1) as u32;
        let mut parts: Vec<String> = content
            .texts
            .iter()
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .collect();

        let mut tables = Vec::new();
        for raw in &content.tables {
            if let Some(table) = pdf::render_table_markdown(raw) {
                parts.push(format!(
                    "--- Table Data ---\n{}\n--- End Table ---",
                    table.markdown
                ));
                tables.push(table);
            }
        }

        if let Some(notes) = content.notes.as_deref().map(str::trim).filter(|n| !n.is_empty()) {
            parts.push(format!("--- Speaker Notes ---\n{notes}\n--- End Notes ---"));
        }

        let mut captions = Vec::new();
        for image in &content.images {
            match self.vision.caption_image(&image.bytes).await {
                Ok(caption) if !caption.is_empty() => {
                    parts.push(format!(
                        "--- Image Content ---\n{caption}\n--- End Image ---"
                    ));
                    captions.push(caption);
                }
                Ok(_) => {}
                Err(err) => warn!(slide = number, error = %err, "slide image captioning failed"),
            }
        }

        let mut page = Page::new(number, parts.join("\n\n"), ExtractionMethod::Structural);
        page.tables = tables;
        page.captions = captions;
        page.images = content
            .images
            .into_iter()
            .map(|img| PageImage {
                bytes: img.bytes,
                width: img.width,
                height: img.height,
            })
            .collect();
        page
    }
}

#[async_trait]
impl DocumentExtractor for Extractor {
    async fn extract(&self, path: &Path, kind: DocumentKind) -> Result<Vec<Page>> {
        debug!(path = %path.display(), kind = kind.as_str(), "extracting document");
        match kind {
            DocumentKind::Pdf => self.extract_pdf(path).await,
            DocumentKind::Pptx => self.extract_pptx(path).await,
            DocumentKind::Ppt => self.convert_and_extract(path).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct StubDoc {
        pages: Vec<StubPage>,
    }

    #[derive(Clone)]
    struct StubPage {
        text: String,
        tables: Vec<RawTable>,
        images: Vec<(u32, u32)>,
    }

    impl PdfDocument for StubDoc {
        fn page_count(&self) -> usize {
            self.pages.len()
        }

        fn page_text(&self, index: usize) -> Result<String> {
            Ok(self.pages[index].text.clone())
        }

        fn page_tables(&self, index: usize) -> Result<Vec<RawTable>> {
            Ok(self.pages[index].tables.clone())
        }

        fn page_images(&self, index: usize) -> Result<Vec<RawImage>> {
            Ok(self.pages[index]
                .images
                .iter()
                .map(|(w, h)| RawImage {
                    bytes: vec![0u8; 4],
                    width: *w,
                    height: *h,
                })
                .collect())
        }

        fn render_page_png(&self, _index: usize) -> Result<Vec<u8>> {
            Ok(vec![1, 2, 3])
        }
    }

    struct StubPdfBackend {
        pages: Vec<StubPage>,
        fail_open: bool,
        raw: String,
    }

    impl PdfBackend for StubPdfBackend {
        fn open(&self, _path: &Path) -> Result<Box<dyn PdfDocument>> {
            if self.fail_open {
                return Err(Error::PermanentExternal("corrupt xref".into()));
            }
            Ok(Box::new(StubDoc {
                pages: self.pages.clone(),
            }))
        }

        fn raw_text(&self, _path: &Path) -> Result<String> {
            Ok(self.raw.clone())
        }
    }

    struct StubDeckBackend {
        slides: Vec<SlideContent>,
    }

    struct StubDeckDoc {
        slides: Vec<SlideContent>,
    }

    impl SlideDeck for StubDeckDoc {
        fn slide_count(&self) -> usize {
            self.slides.len()
        }

        fn slide(&self, index: usize) -> Result<SlideContent> {
            Ok(self.slides[index].clone())
        }
    }

    impl SlideDeckBackend for StubDeckBackend {
        fn open(&self, _path: &Path) -> Result<Box<dyn SlideDeck>> {
            Ok(Box::new(StubDeckDoc {
                slides: self.slides.clone(),
            }))
        }
    }

    #[derive(Default)]
    struct StubVision {
        ocr_calls: Mutex<usize>,
    }

    #[async_trait]
    impl VisionModel for StubVision {
        async fn ocr_page(&self, _image: &[u8]) -> Result<String> {
            *self.ocr_calls.lock().unwrap() += 1;
            Ok("OCR transcription of the page".to_string())
        }

        async fn caption_image(&self, _image: &[u8]) -> Result<String> {
            Ok("a brake circuit schematic".to_string())
        }
    }

    fn long_text() -> String {
        "The brake test was performed on the laden vehicle at sixty kilometres per hour over dry asphalt.".to_string()
    }

    fn extractor(pdf: StubPdfBackend, decks: Vec<SlideContent>) -> (Extractor, Arc<StubVision>) {
        let vision = Arc::new(StubVision::default());
        let ex = Extractor::new(
            Arc::new(pdf),
            Some(Arc::new(StubDeckBackend { slides: decks })),
            vision.clone(),
            ExtractorConfig::default(),
        );
        (ex, vision)
    }

    #[tokio::test]
    async fn readable_page_stays_structural_with_inline_table() {
        let table = RawTable {
            rows: vec![
                vec!["Parameter".into(), "Value".into()],
                vec!["Speed".into(), "60 km/h".into()],
            ],
        };
        let (ex, vision) = extractor(
            StubPdfBackend {
                pages: vec![StubPage {
                    text: long_text(),
                    tables: vec![table],
                    images: vec![],
                }],
                fail_open: false,
                raw: String::new(),
            },
            vec![],
        );

        let pages = ex.extract(Path::new("a.pdf"), DocumentKind::Pdf).await.unwrap();
        assert_eq!(pages.len(), 1);
        assert_eq!(pages[0].method, ExtractionMethod::Structural);
        assert!(pages[0].text.contains("[TABLE 1 - 2 rows x 2 columns]"));
        assert!(pages[0].text.contains("| Speed | 60 km/h |"));
        assert_eq!(*vision.ocr_calls.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn short_page_is_replaced_by_ocr_and_tables_dropped() {
        let table = RawTable {
            rows: vec![vec!["a".into()], vec!["b".into()]],
        };
        let (ex, vision) = extractor(
            StubPdfBackend {
                pages: vec![StubPage {
                    text: "p 7".into(),
                    tables: vec![table],
                    images: vec![],
                }],
                fail_open: false,
                raw: String::new(),
            },
            vec![],
        );

        let pages = ex.extract(Path::new("a.pdf"), DocumentKind::Pdf).await.unwrap();
        assert_eq!(pages[0].method, ExtractionMethod::VisionOcr);
        assert_eq!(pages[0].text, "OCR transcription of the page");
        assert!(pages[0].tables.is_empty());
        assert_eq!(*vision.ocr_calls.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn cid_garbage_triggers_ocr_despite_length() {
        let garbage = format!("{} tail", "(cid:101)".repeat(30));
        let (ex, _vision) = extractor(
            StubPdfBackend {
                pages: vec![StubPage {
                    text: garbage,
                    tables: vec![],
                    images: vec![],
                }],
                fail_open: false,
                raw: String::new(),
            },
            vec![],
        );

        let pages = ex.extract(Path::new("a.pdf"), DocumentKind::Pdf).await.unwrap();
        assert_eq!(pages[0].method, ExtractionMethod::VisionOcr);
    }

    #[tokio::test]
    async fn small_images_are_filtered_and_large_ones_captioned() {
        let (ex, _vision) = extractor(
            StubPdfBackend {
                pages: vec![StubPage {
                    text: long_text(),
                    tables: vec![],
                    images: vec![(32, 32), (640, 480)],
                }],
                fail_open: false,
                raw: String::new(),
            },
            vec![],
        );

        let pages = ex.extract(Path::new("a.pdf"), DocumentKind::Pdf).await.unwrap();
        assert_eq!(pages[0].images.len(), 1);
        assert_eq!(pages[0].images[0].width, 640);
        assert_eq!(pages[0].captions.len(), 1);
        assert!(pages[0].captions[0].contains("schematic"));
    }

    #[tokio::test]
    async fn open_failure_falls_back_to_raw_text_pages() {
        let (ex, _vision) = extractor(
            StubPdfBackend {
                pages: vec![],
                fail_open: true,
                raw: "first page\u{c}second page".into(),
            },
            vec![],
        );

        let pages = ex.extract(Path::new("a.pdf"), DocumentKind::Pdf).await.unwrap();
        assert_eq!(pages.len(), 2);
        assert!(pages.iter().all(|p| p.method == ExtractionMethod::Fallback));
        assert_eq!(pages[0].text, "first page");
        assert_eq!(pages[1].number, 2);
    }

    #[tokio::test]
    async fn slides_assemble_text_tables_notes_and_captions() {
        let slide = SlideContent {
            texts: vec!["Cooling system overview".into(), "Radiator layout".into()],
            tables: vec![RawTable {
                rows: vec![
                    vec!["Sensor".into(), "Reading".into()],
                    vec!["Inlet".into(), "82 C".into()],
                ],
            }],
            notes: Some("Mention the revised fan shroud.".into()),
            images: vec![RawImage {
                bytes: vec![0; 4],
                width: 800,
                height: 600,
            }],
        };
        let (ex, _vision) = extractor(
            StubPdfBackend {
                pages: vec![],
                fail_open: false,
                raw: String::new(),
            },
            vec![slide],
        );

        let pages = ex.extract(Path::new("deck.pptx"), DocumentKind::Pptx).await.unwrap();
        assert_eq!(pages.len(), 1);
        let page = &pages[0];
        assert_eq!(page.method, ExtractionMethod::Structural);
        assert!(page.text.contains("Cooling system overview"));
        assert!(page.text.contains("--- Table Data ---"));
        assert!(page.text.contains("| Inlet | 82 C |"));
        assert!(page.text.contains("--- Speaker Notes ---"));
        assert!(page.text.contains("Mention the revised fan shroud."));
        assert!(page.text.contains("--- Image Content ---"));
        assert_eq!(page.captions.len(), 1);
    }
}
