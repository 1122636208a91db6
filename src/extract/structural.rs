//! Structural PDF backend.
//!
//! lopdf provides the document model: page tree, and embedded image
//! XObjects. Layout text comes from `pdftotext -layout`, and tables are
//! detected from the column-aligned output; `pdftoppm` renders page
//! rasters for vision OCR. Raw-text fallback prefers `pdftotext` and
//! drops to the pure-Rust `pdf-extract` when the binary is missing.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Mutex;

use lopdf::{Dictionary, Document, Object, ObjectId};
use tracing::{debug, warn};

use crate::error::{Error, Result};

use super::pdf::{detect_layout_tables, PdfBackend, PdfDocument, RawImage, RawTable};

/// Backend combining the lopdf document model with poppler's tools.
pub struct StructuralPdfBackend;

impl StructuralPdfBackend {
    pub fn new() -> Self {
        Self
    }
}

impl Default for StructuralPdfBackend {
    fn default() -> Self {
        Self::new()
    }
}

fn run_tool(tool: &str, args: &[&str]) -> Result<Vec<u8>> {
    which::which(tool)
        .map_err(|_| Error::PermanentExternal(format!("external tool not found: {tool}")))?;

    let output = Command::new(tool).args(args).output()?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(Error::PermanentExternal(format!("{tool}: {stderr}")));
    }
    Ok(output.stdout)
}

impl PdfBackend for StructuralPdfBackend {
    fn open(&self, path: &Path) -> Result<Box<dyn PdfDocument>> {
        let doc = Document::load(path)
            .map_err(|e| Error::PermanentExternal(format!("pdf parse: {e}")))?;

        let page_map = doc.get_pages();
        let mut numbers: Vec<u32> = page_map.keys().copied().collect();
        numbers.sort_unstable();
        let page_ids: Vec<ObjectId> = numbers.iter().map(|n| page_map[n]).collect();

        if page_ids.is_empty() {
            return Err(Error::PermanentExternal("pdf has no pages".into()));
        }

        debug!(path = %path.display(), pages = page_ids.len(), "opened pdf");
        Ok(Box::new(StructuralDocument {
            path: path.to_path_buf(),
            doc,
            page_ids,
            layout_cache: Mutex::new(HashMap::new()),
        }))
    }

    fn raw_text(&self, path: &Path) -> Result<String> {
        match run_tool("pdftotext", &[&path.to_string_lossy(), "-"]) {
            Ok(out) => Ok(String::from_utf8_lossy(&out).to_string()),
            Err(err) => {
                warn!(error = %err, "pdftotext unavailable, using pdf-extract");
                pdf_extract::extract_text(path)
                    .map_err(|e| Error::PermanentExternal(format!("raw text extraction: {e}")))
            }
        }
    }
}

struct StructuralDocument {
    path: PathBuf,
    doc: Document,
    /// Page object ids in page order.
    page_ids: Vec<ObjectId>,
    /// Layout text per page; text and table extraction share one
    /// `pdftotext` run.
    layout_cache: Mutex<HashMap<usize, String>>,
}

impl StructuralDocument {
    fn layout_text(&self, index: usize) -> Result<String> {
        if let Some(text) = self.layout_cache.lock().unwrap().get(&index) {
            return Ok(text.clone());
        }

        let page = (index + 1).to_string();
        let out = run_tool(
            "pdftotext",
            &[
                "-f",
                &page,
                "-l",
                &page,
                "-layout",
                &self.path.to_string_lossy(),
                "-",
            ],
        )?;
        let text = String::from_utf8_lossy(&out).to_string();
        self.layout_cache
            .lock()
            .unwrap()
            .insert(index, text.clone());
        Ok(text)
    }
}

impl PdfDocument for StructuralDocument {
    fn page_count(&self) -> usize {
        self.page_ids.len()
    }

    fn page_text(&self, index: usize) -> Result<String> {
        self.layout_text(index)
    }

    fn page_tables(&self, index: usize) -> Result<Vec<RawTable>> {
        Ok(detect_layout_tables(&self.layout_text(index)?))
    }

    fn page_images(&self, index: usize) -> Result<Vec<RawImage>> {
        Ok(collect_page_images(&self.doc, self.page_ids[index]))
    }

    fn render_page_png(&self, index: usize) -> Result<Vec<u8>> {
        let page = (index + 1).to_string();
        let dir = tempfile::tempdir()?;
        let prefix = dir.path().join("page");

        run_tool(
            "pdftoppm",
            &[
                "-f",
                &page,
                "-l",
                &page,
                "-png",
                "-r",
                "150",
                &self.path.to_string_lossy(),
                &prefix.to_string_lossy(),
            ],
        )?;

        // pdftoppm numbers its output; take whatever it produced.
        let entry = std::fs::read_dir(dir.path())?
            .filter_map(|e| e.ok())
            .find(|e| e.path().extension().map(|x| x == "png").unwrap_or(false))
            .ok_or_else(|| Error::PermanentExternal("pdftoppm produced no raster".into()))?;

        Ok(std::fs::read(entry.path())?)
    }
}

/// Embedded raster images on a page: JPEG-encoded (DCTDecode) image
/// XObjects from the page resources, following `/Parent` inheritance.
/// Other encodings carry raw pixel data the vision model cannot read
/// and are skipped.
fn collect_page_images(doc: &Document, page_id: ObjectId) -> Vec<RawImage> {
    let mut images = Vec::new();

    let Some(xobjects) = page_xobjects(doc, page_id) else {
        return images;
    };

    for (name, object) in xobjects.iter() {
        let Object::Reference(object_id) = object else {
            continue;
        };
        let Ok(Object::Stream(stream)) = doc.get_object(*object_id) else {
            continue;
        };

        if !is_name(&stream.dict, b"Subtype", b"Image") {
            continue;
        }

        let width = dict_int(&stream.dict, b"Width").unwrap_or(0) as u32;
        let height = dict_int(&stream.dict, b"Height").unwrap_or(0) as u32;
        if width == 0 || height == 0 {
            continue;
        }

        if !has_filter(&stream.dict, b"DCTDecode") {
            debug!(
                name = %String::from_utf8_lossy(name),
                "skipping non-JPEG image xobject"
            );
            continue;
        }

        images.push(RawImage {
            bytes: stream.content.clone(),
            width,
            height,
        });
    }

    images
}

/// XObject dictionary of a page, resolving the inherited `/Resources`.
fn page_xobjects(doc: &Document, page_id: ObjectId) -> Option<Dictionary> {
    let mut current = Some(page_id);
    while let Some(id) = current {
        let dict = doc.get_dictionary(id).ok()?;
        if let Ok(resources) = dict.get(b"Resources") {
            let resources = resolve_dict(doc, resources)?;
            let xobjects = resources.get(b"XObject").ok()?;
            return resolve_dict(doc, xobjects);
        }
        current = dict.get(b"Parent").ok().and_then(|p| match p {
            Object::Reference(parent_id) => Some(*parent_id),
            _ => None,
        });
    }
    None
}

fn resolve_dict(doc: &Document, object: &Object) -> Option<Dictionary> {
    match object {
        Object::Dictionary(dict) => Some(dict.clone()),
        Object::Reference(id) => match doc.get_object(*id).ok()? {
            Object::Dictionary(dict) => Some(dict.clone()),
            _ => None,
        },
        _ => None,
    }
}

fn dict_int(dict: &Dictionary, key: &[u8]) -> Option<i64> {
    dict.get(key).ok().and_then(|o| o.as_i64().ok())
}

fn is_name(dict: &Dictionary, key: &[u8], expected: &[u8]) -> bool {
    matches!(dict.get(key), Ok(Object::Name(name)) if name.as_slice() == expected)
}

/// Whether the stream's `/Filter` entry (name or array) names `filter`.
fn has_filter(dict: &Dictionary, filter: &[u8]) -> bool {
    match dict.get(b"Filter") {
        Ok(Object::Name(name)) => name.as_slice() == filter,
        Ok(Object::Array(entries)) => entries
            .iter()
            .any(|e| matches!(e, Object::Name(name) if name.as_slice() == filter)),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lopdf::{dictionary, Stream};

    /// Build a one-page document carrying the given image XObjects.
    fn document_with_images(streams: Vec<(&str, Stream)>) -> (Document, ObjectId) {
        let mut doc = Document::with_version("1.5");
        let pages_id = doc.new_object_id();

        let mut xobjects = Dictionary::new();
        for (name, stream) in streams {
            let stream_id = doc.add_object(Object::Stream(stream));
            xobjects.set(name.as_bytes().to_vec(), Object::Reference(stream_id));
        }
        let resources = dictionary! {
            "XObject" => Object::Dictionary(xobjects),
        };

        let page_id = doc.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => Object::Reference(pages_id),
            "Resources" => Object::Dictionary(resources),
        });
        doc.objects.insert(
            pages_id,
            Object::Dictionary(dictionary! {
                "Type" => "Pages",
                "Kids" => vec![Object::Reference(page_id)],
                "Count" => 1,
            }),
        );
        let catalog_id = doc.add_object(dictionary! {
            "Type" => "Catalog",
            "Pages" => Object::Reference(pages_id),
        });
        doc.trailer.set("Root", Object::Reference(catalog_id));

        (doc, page_id)
    }

    fn jpeg_stream(width: i64, height: i64, bytes: &[u8]) -> Stream {
        Stream::new(
            dictionary! {
                "Type" => "XObject",
                "Subtype" => "Image",
                "Width" => width,
                "Height" => height,
                "ColorSpace" => "DeviceRGB",
                "BitsPerComponent" => 8,
                "Filter" => "DCTDecode",
            },
            bytes.to_vec(),
        )
    }

    #[test]
    fn jpeg_xobjects_are_extracted_with_dimensions() {
        let (doc, page_id) =
            document_with_images(vec![("Im0", jpeg_stream(640, 480, b"\xff\xd8jpegdata"))]);

        let images = collect_page_images(&doc, page_id);
        assert_eq!(images.len(), 1);
        assert_eq!(images[0].width, 640);
        assert_eq!(images[0].height, 480);
        assert_eq!(images[0].bytes, b"\xff\xd8jpegdata");
    }

    #[test]
    fn non_jpeg_and_non_image_xobjects_are_skipped() {
        let flate = Stream::new(
            dictionary! {
                "Type" => "XObject",
                "Subtype" => "Image",
                "Width" => 64,
                "Height" => 64,
                "Filter" => "FlateDecode",
            },
            vec![0u8; 16],
        );
        let form = Stream::new(
            dictionary! {
                "Type" => "XObject",
                "Subtype" => "Form",
            },
            vec![0u8; 4],
        );
        let (doc, page_id) = document_with_images(vec![("Im0", flate), ("Fm0", form)]);

        assert!(collect_page_images(&doc, page_id).is_empty());
    }

    #[test]
    fn filter_arrays_are_recognized() {
        let mut stream = jpeg_stream(100, 100, b"data");
        stream.dict.set(
            "Filter",
            Object::Array(vec![Object::Name(b"DCTDecode".to_vec())]),
        );
        let (doc, page_id) = document_with_images(vec![("Im0", stream)]);

        assert_eq!(collect_page_images(&doc, page_id).len(), 1);
    }

    #[test]
    fn zero_sized_images_are_ignored() {
        let (doc, page_id) = document_with_images(vec![("Im0", jpeg_stream(0, 80, b"data"))]);
        assert!(collect_page_images(&doc, page_id).is_empty());
    }

    #[test]
    fn resources_are_inherited_from_the_page_tree() {
        // Resources live on the Pages node, not the page itself.
        let mut doc = Document::with_version("1.5");
        let pages_id = doc.new_object_id();

        let stream_id = doc.add_object(Object::Stream(jpeg_stream(320, 200, b"jpeg")));
        let mut xobjects = Dictionary::new();
        xobjects.set(b"Im0".to_vec(), Object::Reference(stream_id));

        let page_id = doc.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => Object::Reference(pages_id),
        });
        doc.objects.insert(
            pages_id,
            Object::Dictionary(dictionary! {
                "Type" => "Pages",
                "Kids" => vec![Object::Reference(page_id)],
                "Count" => 1,
                "Resources" => Object::Dictionary(dictionary! {
                    "XObject" => Object::Dictionary(xobjects),
                }),
            }),
        );

        let images = collect_page_images(&doc, page_id);
        assert_eq!(images.len(), 1);
        assert_eq!(images[0].width, 320);
    }
}
