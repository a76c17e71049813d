use std::sync::Arc;

use anyhow::{Context, Result};
use flume::Sender;

use crate::config::AppConfig;
use crate::database::AnalysisDatabase;
use crate::llm_client::{LlmClient, StreamingChatClient};
use crate::pipeline::pair::PairPipeline;
use crate::pipeline::{PipelineEvent, SubjectPipeline};
use crate::scraper::{HttpProfileScraper, ProfileScraper};

/// Shared wiring for the service: one database, one fallback invoker, one
/// scrape client. Pipelines are minted per subject mount on top of these.
pub struct AnalysisRuntime {
    pub config: AppConfig,
    pub db: Arc<AnalysisDatabase>,
    pub llm: Arc<LlmClient>,
    pub streaming: Arc<StreamingChatClient>,
    pub scraper: Arc<dyn ProfileScraper>,
    pub event_tx: Sender<PipelineEvent>,
}

impl AnalysisRuntime {
    pub fn bootstrap(config: AppConfig, event_tx: Sender<PipelineEvent>) -> Result<Self> {
        let db = Arc::new(
            AnalysisDatabase::new(&config.database_path)
                .with_context(|| format!("Failed to open database at {}", config.database_path))?,
        );
        tracing::info!("Analysis database initialized: {}", config.database_path);

        let llm = Arc::new(LlmClient::new(&config));
        let streaming = Arc::new(StreamingChatClient::new(&config));
        let scraper: Arc<dyn ProfileScraper> =
            Arc::new(HttpProfileScraper::new(config.scraper_api_url.clone()));

        Ok(Self {
            config,
            db,
            llm,
            streaming,
            scraper,
            event_tx,
        })
    }

    /// A fresh single-subject pipeline for one mount of `username`.
    pub fn subject_pipeline(&self, username: &str) -> SubjectPipeline {
        SubjectPipeline::new(
            username,
            self.db.clone(),
            self.scraper.clone(),
            self.llm.clone(),
            self.config.clone(),
            self.event_tx.clone(),
        )
    }

    /// A fresh pair pipeline for one mount of the two subjects.
    pub fn pair_pipeline(&self, username_a: &str, username_b: &str) -> PairPipeline {
        PairPipeline::new(
            username_a,
            username_b,
            self.db.clone(),
            self.scraper.clone(),
            self.llm.clone(),
            self.config.clone(),
            self.event_tx.clone(),
        )
    }
}
