//! Data models for docrig.

mod chunk;
mod conversation;
mod document;
mod event;
mod page;

pub use chunk::{ChunkKind, ChunkMetadata, RawChunk};
pub use conversation::{ChatMessage, Conversation, HistoryMessage, Role};
pub use document::{
    sanitize_filename, DocumentKind, DocumentRecord, NewDocument, ProcessingStatus,
};
pub use event::{CompactEvent, Event, EventType, LogLevel};
pub use page::{ExtractionMethod, Page, PageImage, PageTable};
