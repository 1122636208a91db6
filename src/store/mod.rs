//! External collaborator contracts: object store, document records,
//! and durable conversations. Each trait ships with an in-memory
//! implementation used by tests and local development.

mod conversations;
mod documents;
mod object;

pub use conversations::{ConversationStore, MemoryConversationStore};
pub use documents::{DocumentStore, JsonDocumentStore, MemoryDocumentStore};
pub use object::{object_key, MemoryObjectStore, ObjectStore, S3ObjectStore};
