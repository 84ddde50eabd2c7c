use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use flume::Sender;

use crate::compression::{LlmSummarizer, Summarizer};
use crate::config::EngineConfig;
use crate::database::ChatDatabase;
use crate::engine::{ChatEngine, Collaborators};
use crate::events::{EngineEvent, EventSink};
use crate::llm_client::{CompletionProvider, LlmClient};
use crate::message_log::MessageLog;
use crate::retrieval::{Embedder, HttpEmbedder, QdrantIndex, VectorIndex};

pub struct EngineRuntime {
    pub config: EngineConfig,
    pub engine: Arc<ChatEngine>,
    pub database: Arc<ChatDatabase>,
}

/// Wires the engine from configuration. Any collaborator left unset is built
/// from its HTTP implementation.
pub struct EngineRuntimeBuilder {
    config: EngineConfig,
    event_tx: Sender<EngineEvent>,
    embedder: Option<Arc<dyn Embedder>>,
    index: Option<Arc<dyn VectorIndex>>,
    provider: Option<Arc<dyn CompletionProvider>>,
    summarizer: Option<Arc<dyn Summarizer>>,
}

impl EngineRuntimeBuilder {
    pub fn new(config: EngineConfig, event_tx: Sender<EngineEvent>) -> Self {
        Self {
            config,
            event_tx,
            embedder: None,
            index: None,
            provider: None,
            summarizer: None,
        }
    }

    pub fn with_embedder(mut self, embedder: Arc<dyn Embedder>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    pub fn with_index(mut self, index: Arc<dyn VectorIndex>) -> Self {
        self.index = Some(index);
        self
    }

    pub fn with_provider(mut self, provider: Arc<dyn CompletionProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn with_summarizer(mut self, summarizer: Arc<dyn Summarizer>) -> Self {
        self.summarizer = Some(summarizer);
        self
    }

    pub fn build(self) -> Result<EngineRuntime> {
        let config = self.config.validated();
        let retrieval_timeout = Duration::from_secs(config.retrieval.timeout_secs.max(1));

        let embedder: Arc<dyn Embedder> = match self.embedder {
            Some(embedder) => embedder,
            None => Arc::new(
                HttpEmbedder::new(
                    config.retrieval.embedding_api_url.clone(),
                    config.retrieval.embedding_api_key.clone(),
                    config.retrieval.embedding_model.clone(),
                    retrieval_timeout,
                )
                .context("Failed to build embedding client")?,
            ),
        };

        let index: Arc<dyn VectorIndex> = match self.index {
            Some(index) => index,
            None => Arc::new(
                QdrantIndex::new(
                    config.retrieval.qdrant_url.clone(),
                    config.retrieval.qdrant_api_key.clone(),
                    config.retrieval.qdrant_collection.clone(),
                    retrieval_timeout,
                )
                .context("Failed to build Qdrant client")?,
            ),
        };

        let provider: Arc<dyn CompletionProvider> = match self.provider {
            Some(provider) => provider,
            None => Arc::new(
                LlmClient::new(
                    config.llm_api_url.clone(),
                    config.llm_api_key.clone().unwrap_or_default(),
                    config.llm_model.clone(),
                )
                .context("Failed to build LLM client")?,
            ),
        };

        let summarizer: Arc<dyn Summarizer> = match self.summarizer {
            Some(summarizer) => summarizer,
            None => Arc::new(LlmSummarizer::new(
                provider.clone(),
                Some(config.summary_model().to_string()),
            )),
        };

        let database = Arc::new(
            ChatDatabase::new(&config.database_path)
                .with_context(|| format!("Failed to open database {}", config.database_path))?,
        );
        let log = Arc::new(MessageLog::new(database.clone()));

        tracing::info!(
            "Engine ready (model: {}, summary model: {}, retrieval: {}, compression: {:?})",
            config.llm_model,
            config.summary_model(),
            if config.retrieval.enabled {
                config.retrieval.qdrant_collection.as_str()
            } else {
                "disabled"
            },
            config.memory.compression_mode
        );

        let engine = Arc::new(ChatEngine::new(
            &config,
            log,
            Collaborators {
                embedder,
                index,
                provider,
                summarizer,
            },
            EventSink::new(self.event_tx),
        ));

        Ok(EngineRuntime {
            config,
            engine,
            database,
        })
    }
}

impl EngineRuntime {
    pub fn bootstrap(config: EngineConfig, event_tx: Sender<EngineEvent>) -> Result<Self> {
        EngineRuntimeBuilder::new(config, event_tx).build()
    }
}
