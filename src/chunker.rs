//! Splits extracted pages into retrieval units.
//!
//! Prose is window-chunked over whitespace tokens; tables are emitted
//! verbatim as single chunks; slides stay whole unless exceptionally
//! long; image captions become their own tagged chunks.

use crate::models::{ChunkKind, DocumentKind, Page, RawChunk};

/// Chunking parameters, in words.
#[derive(Debug, Clone, Copy)]
pub struct ChunkConfig {
    pub chunk_size: usize,
    pub overlap: usize,
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            chunk_size: 300,
            overlap: 50,
        }
    }
}

/// A slide up to 1.5x the chunk size still counts as one semantic unit.
const SLIDE_SLACK: f64 = 1.5;

/// Split text into overlapping word windows. Empty trailing windows are
/// dropped.
pub fn chunk_text(text: &str, chunk_size: usize, overlap: usize) -> Vec<String> {
    let words: Vec<&str> = text.split_whitespace().collect();
    if words.is_empty() || chunk_size == 0 {
        return Vec::new();
    }

    let step = if overlap < chunk_size {
        chunk_size - overlap
    } else {
        chunk_size
    };

    let mut chunks = Vec::new();
    let mut start = 0;
    while start < words.len() {
        let end = (start + chunk_size).min(words.len());
        chunks.push(words[start..end].join(" "));
        if end == words.len() {
            break;
        }
        start += step;
    }
    chunks
}

/// Chunk extracted pages into retrieval units.
pub fn chunk_pages(pages: &[Page], kind: DocumentKind, config: &ChunkConfig) -> Vec<RawChunk> {
    let mut chunks = Vec::new();

    for page in pages {
        let text = page.text.trim();

        if matches!(kind, DocumentKind::Pptx) {
            // One slide is conceptually one semantic unit.
            let limit = (config.chunk_size as f64 * SLIDE_SLACK) as usize;
            if page.word_count() <= limit {
                if !text.is_empty() {
                    chunks.push(RawChunk {
                        text: text.to_string(),
                        page_number: page.number,
                        kind: ChunkKind::Slide,
                    });
                }
                push_captions(&mut chunks, page);
                continue;
            }
            // Massive slides fall through to standard chunking.
        }

        if has_table_markers(text) {
            chunks.extend(chunk_with_tables(text, page.number, config));
        } else {
            for piece in chunk_text(text, config.chunk_size, config.overlap) {
                chunks.push(RawChunk {
                    text: piece,
                    page_number: page.number,
                    kind: ChunkKind::Prose,
                });
            }
        }

        push_captions(&mut chunks, page);
    }

    chunks
}

fn push_captions(chunks: &mut Vec<RawChunk>, page: &Page) {
    for caption in &page.captions {
        let caption = caption.trim();
        if !caption.is_empty() {
            chunks.push(RawChunk {
                text: caption.to_string(),
                page_number: page.number,
                kind: ChunkKind::ImageCaption,
            });
        }
    }
}

fn has_table_markers(text: &str) -> bool {
    text.contains("[TABLE") || text.contains("### Table") || text.contains("--- Table Data ---")
        || text.lines().any(is_pipe_row)
}

fn is_pipe_row(line: &str) -> bool {
    line.trim_start().starts_with('|')
}

enum Segment {
    Text(String),
    Table(String),
}

/// Split page text into prose and table segments, keeping each table
/// intact.
fn split_segments(text: &str) -> Vec<Segment> {
    let lines: Vec<&str> = text.lines().collect();
    let mut segments = Vec::new();
    let mut buffer: Vec<&str> = Vec::new();
    let mut i = 0;

    let flush = |buffer: &mut Vec<&str>, segments: &mut Vec<Segment>| {
        let joined = buffer.join("\n");
        if !joined.trim().is_empty() {
            segments.push(Segment::Text(joined));
        }
        buffer.clear();
    };

    while i < lines.len() {
        let trimmed = lines[i].trim_start();

        if trimmed.starts_with("[TABLE") || trimmed.starts_with("### Table") {
            flush(&mut buffer, &mut segments);
            let mut block = vec![lines[i]];
            i += 1;
            while i < lines.len() && is_pipe_row(lines[i]) {
                block.push(lines[i]);
                i += 1;
            }
            segments.push(Segment::Table(block.join("\n")));
            continue;
        }

        if trimmed.starts_with("--- Table Data ---") {
            flush(&mut buffer, &mut segments);
            let mut block = vec![lines[i]];
            i += 1;
            while i < lines.len() {
                block.push(lines[i]);
                let done = lines[i].trim_start().starts_with("--- End Table ---");
                i += 1;
                if done {
                    break;
                }
            }
            segments.push(Segment::Table(block.join("\n")));
            continue;
        }

        if is_pipe_row(lines[i]) {
            // Bare markdown table: consecutive pipe rows qualify when a
            // separator rule row is present, otherwise they are prose.
            let start = i;
            while i < lines.len() && is_pipe_row(lines[i]) {
                i += 1;
            }
            let block = lines[start..i].join("\n");
            if block.contains("---") {
                flush(&mut buffer, &mut segments);
                segments.push(Segment::Table(block));
            } else {
                buffer.extend_from_slice(&lines[start..i]);
            }
            continue;
        }

        buffer.push(lines[i]);
        i += 1;
    }
    flush(&mut buffer, &mut segments);

    segments
}

fn chunk_with_tables(text: &str, page_number: u32, config: &ChunkConfig) -> Vec<RawChunk> {
    let mut chunks = Vec::new();

    for segment in split_segments(text) {
        match segment {
            Segment::Text(prose) => {
                for piece in chunk_text(&prose, config.chunk_size, config.overlap) {
                    chunks.push(RawChunk {
                        text: piece,
                        page_number,
                        kind: ChunkKind::Prose,
                    });
                }
            }
            Segment::Table(table) => chunks.push(RawChunk {
                text: table.trim().to_string(),
                page_number,
                kind: ChunkKind::Table,
            }),
        }
    }

    chunks
}
