//! Composition root: wires the production adapters together for the
//! CLI entry points.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::warn;

use crate::agent::Agent;
use crate::chunker::ChunkConfig;
use crate::config::Settings;
use crate::embed::{Bm25Encoder, DenseEmbedder, OllamaEmbedder, OllamaVision};
use crate::error::Result;
use crate::events::{ClickHouseEventStore, EventBus, EventStore};
use crate::extract::{DocumentExtractor, Extractor, ExtractorConfig, StructuralPdfBackend};
use crate::generate::{AnswerGenerator, GeneratorConfig, LlmGenerator};
use crate::indexer::Indexer;
use crate::query::IntentClassifier;
use crate::session::SessionCache;
use crate::store::{
    ConversationStore, DocumentStore, JsonDocumentStore, MemoryConversationStore, ObjectStore,
    S3ObjectStore,
};
use crate::vectordb::{QdrantIndex, VectorIndex};
use crate::worker::{IngestWorker, RetryPolicy};

/// Where the single-node document catalog lives.
fn catalog_path() -> PathBuf {
    std::env::var("DOCRIG_DATA_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("./data"))
        .join("documents.json")
}

/// Shared production components.
pub struct AppContext {
    pub settings: Settings,
    pub documents: Arc<dyn DocumentStore>,
    pub objects: Arc<dyn ObjectStore>,
    pub index: Arc<dyn VectorIndex>,
    pub events: Arc<EventBus>,
    pub event_store: Arc<dyn EventStore>,
    pub embedder: Arc<dyn DenseEmbedder>,
    pub sparse: Bm25Encoder,
    pub generator: Arc<LlmGenerator>,
    pub extractor: Arc<dyn DocumentExtractor>,
    pub conversations: Arc<dyn ConversationStore>,
    pub cache: Option<SessionCache>,
}

impl AppContext {
    pub async fn init(settings: Settings) -> Result<Self> {
        let embedder: Arc<dyn DenseEmbedder> = Arc::new(OllamaEmbedder::new(
            &settings.embedding.base_url,
            &settings.embedding.model,
            settings.embedding.dimension,
        ));
        let sparse = Bm25Encoder::default();

        let index: Arc<dyn VectorIndex> = Arc::new(QdrantIndex::connect(
            &settings.vector_index.url,
            &settings.vector_index.collection,
            settings.embedding.dimension,
        )?);

        let event_store: Arc<dyn EventStore> =
            Arc::new(ClickHouseEventStore::connect(&settings.event_store));
        let events = Arc::new(EventBus::new(event_store.clone()));

        let s3 = S3ObjectStore::connect(&settings.object_store).await;
        let objects: Arc<dyn ObjectStore> = Arc::new(s3);

        let vision = Arc::new(OllamaVision::new(
            &settings.llm.local_base_url,
            &settings.llm.vision_model,
        ));
        let extractor: Arc<dyn DocumentExtractor> = Arc::new(Extractor::new(
            Arc::new(StructuralPdfBackend::new()),
            None,
            vision,
            ExtractorConfig::default(),
        ));

        let generator = Arc::new(LlmGenerator::new(GeneratorConfig::from_settings(
            &settings.llm,
        )));

        let documents: Arc<dyn DocumentStore> = Arc::new(JsonDocumentStore::open(&catalog_path())?);
        let conversations: Arc<dyn ConversationStore> = Arc::new(MemoryConversationStore::new());

        let cache = match SessionCache::connect(&settings.redis_url, settings.session_ttl_secs)
            .await
        {
            Ok(cache) => Some(cache),
            Err(err) => {
                warn!(error = %err, "session cache unavailable, history falls back to the durable store");
                None
            }
        };

        Ok(Self {
            settings,
            documents,
            objects,
            index,
            events,
            event_store,
            embedder,
            sparse,
            generator,
            extractor,
            conversations,
            cache,
        })
    }

    pub fn chunk_config(&self) -> ChunkConfig {
        ChunkConfig {
            chunk_size: self.settings.ingest.chunk_size_words,
            overlap: self.settings.ingest.chunk_overlap_words,
        }
    }

    pub fn indexer(&self) -> Indexer {
        Indexer::new(
            self.embedder.clone(),
            self.sparse.clone(),
            self.index.clone(),
            self.chunk_config(),
        )
    }

    pub fn worker(&self) -> IngestWorker {
        IngestWorker::new(
            self.documents.clone(),
            self.objects.clone(),
            self.extractor.clone(),
            self.indexer(),
            self.events.clone(),
            RetryPolicy {
                max_retries: self.settings.ingest.max_retries,
                delay: std::time::Duration::from_secs(self.settings.ingest.retry_delay_secs),
            },
        )
    }

    pub fn agent(&self) -> Agent {
        let generator: Arc<dyn AnswerGenerator> = self.generator.clone();
        Agent::new(
            IntentClassifier::with_llm(generator.clone(), false),
            self.embedder.clone(),
            self.sparse.clone(),
            self.index.clone(),
            generator,
            self.events.clone(),
            self.settings.request_gate_permits,
        )
    }
}
