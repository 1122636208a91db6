//! docrig - multi-tenant retrieval-augmented question answering over
//! engineering documents.
//!
//! The core pipelines: ingestion (extract -> chunk -> embed -> index),
//! hybrid retrieval with group-scoped access control, an agentic router
//! from intent to answer, asynchronous ingestion with crash-safe retry,
//! and a unified observability trail with a live fan-out.

pub mod agent;
pub mod app;
pub mod chat;
pub mod chunker;
pub mod cli;
pub mod config;
pub mod embed;
pub mod error;
pub mod events;
pub mod extract;
pub mod generate;
pub mod indexer;
pub mod metadata;
pub mod models;
pub mod query;
pub mod rerank;
pub mod session;
pub mod store;
pub mod vectordb;
pub mod worker;
