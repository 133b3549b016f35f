//! Wiring of providers, stores, and services.
//!
//! [`Pipeline`] is built once at startup and cloned into every HTTP
//! handler and CLI command. All members are reference counted.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};

use compileflow_core::embedding::Embedder;
use compileflow_core::store::{JobStore, TemplateStore};

use crate::agent::Orchestrator;
use crate::blob::{BlobStore, LocalBlobStore};
use crate::classify::Classifier;
use crate::config::Config;
use crate::db;
use crate::embedding::create_embedder;
use crate::extract::{ChunkSettings, Extractor};
use crate::llm::{create_model, MultimodalModel};
use crate::migrate;
use crate::segmenter::Segmenter;
use crate::sqlite_store::{SqliteJobStore, SqliteTemplateStore};
use crate::suggest::Suggester;
use crate::templates::TemplateService;

#[derive(Clone)]
pub struct Pipeline {
    config: Arc<Config>,
    jobs: Arc<dyn JobStore>,
    blobs: Arc<dyn BlobStore>,
    http: reqwest::Client,
    segmenter: Segmenter,
    extractor: Extractor,
    suggester: Suggester,
    templates: TemplateService,
    orchestrator: Arc<Orchestrator>,
}

impl Pipeline {
    /// Open the database (running migrations), and create the configured
    /// model and embedding providers.
    pub async fn from_config(config: Config) -> Result<Self> {
        let pool = db::connect(&config).await?;
        migrate::migrate(&pool).await?;

        let model = create_model(&config.model).context("Failed to create model provider")?;
        let embedder =
            create_embedder(&config.embedding).context("Failed to create embedding provider")?;
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.model.timeout_secs))
            .build()?;
        let blobs = Arc::new(LocalBlobStore::from_config(&config.storage));

        Ok(Self::new(
            config,
            model,
            embedder,
            Arc::new(SqliteTemplateStore::new(pool.clone())),
            Arc::new(SqliteJobStore::new(pool)),
            blobs,
            http,
        ))
    }

    pub fn new(
        config: Config,
        model: Arc<dyn MultimodalModel>,
        embedder: Arc<dyn Embedder>,
        template_store: Arc<dyn TemplateStore>,
        jobs: Arc<dyn JobStore>,
        blobs: Arc<dyn BlobStore>,
        http: reqwest::Client,
    ) -> Self {
        let classifier = Classifier::new(model.clone());
        let segmenter = Segmenter::new(classifier, blobs.clone());
        let extractor = Extractor::new(
            model.clone(),
            jobs.clone(),
            ChunkSettings::from(&config.pipeline),
        );
        let suggester = Suggester::new(model.clone());
        let templates = TemplateService::new(
            template_store,
            embedder,
            config.pipeline.match_top_k,
        );
        let orchestrator = Arc::new(Orchestrator::new(
            model,
            jobs.clone(),
            blobs.clone(),
            http.clone(),
            templates.clone(),
            extractor.clone(),
            suggester.clone(),
            config.pipeline.max_agent_steps,
        ));

        Self {
            config: Arc::new(config),
            jobs,
            blobs,
            http,
            segmenter,
            extractor,
            suggester,
            templates,
            orchestrator,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn jobs(&self) -> &dyn JobStore {
        self.jobs.as_ref()
    }

    pub fn blobs(&self) -> &dyn BlobStore {
        self.blobs.as_ref()
    }

    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    pub fn segmenter(&self) -> &Segmenter {
        &self.segmenter
    }

    pub fn extractor(&self) -> &Extractor {
        &self.extractor
    }

    pub fn suggester(&self) -> &Suggester {
        &self.suggester
    }

    pub fn templates(&self) -> &TemplateService {
        &self.templates
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }
}
