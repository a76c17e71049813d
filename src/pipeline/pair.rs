use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};

use crate::config::AppConfig;
use crate::database::{ordered_usernames, AnalysisDatabase, Pair};
use crate::json_recovery::recover_object;
use crate::llm_client::LlmClient;
use crate::prompts;
use crate::scraper::ProfileScraper;

use super::{is_stale, AnalysisMode, PipelineEvent, Steps, SubjectPipeline};

/// Composite progress for a pair: both members' step flags plus the
/// compatibility stage's own pair of flags.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct PairSteps {
    pub user1_steps: Steps,
    pub user2_steps: Steps,
    pub compatibility_started: bool,
    pub compatibility_completed: bool,
}

#[derive(Debug, Clone)]
pub struct PairOutcome {
    pub steps: PairSteps,
    pub user1_result: Option<Map<String, Value>>,
    pub user2_result: Option<Map<String, Value>>,
    pub compatibility_result: Option<Map<String, Value>>,
    pub unlocked: bool,
}

/// Composes two subject pipelines and adds a compatibility stage gated on
/// both scrapes finishing.
///
/// The member pipelines run concurrently in scrape-only mode; no ordering
/// between them is guaranteed or needed. Usernames are held in
/// lexicographic order so the prompt's profile1/profile2 labels are stable
/// no matter which subject initiated the pair. Like the subject machine,
/// `run` is latched per instance.
pub struct PairPipeline {
    user1: String,
    user2: String,
    db: Arc<AnalysisDatabase>,
    llm: Arc<LlmClient>,
    config: AppConfig,
    event_tx: flume::Sender<PipelineEvent>,
    user1_pipeline: SubjectPipeline,
    user2_pipeline: SubjectPipeline,
    ran: AtomicBool,
}

impl PairPipeline {
    pub fn new(
        username_a: &str,
        username_b: &str,
        db: Arc<AnalysisDatabase>,
        scraper: Arc<dyn ProfileScraper>,
        llm: Arc<LlmClient>,
        config: AppConfig,
        event_tx: flume::Sender<PipelineEvent>,
    ) -> Self {
        let (user1, user2) = ordered_usernames(username_a, username_b);
        let user1_pipeline = SubjectPipeline::new(
            &user1,
            db.clone(),
            scraper.clone(),
            llm.clone(),
            config.clone(),
            event_tx.clone(),
        );
        let user2_pipeline = SubjectPipeline::new(
            &user2,
            db.clone(),
            scraper,
            llm.clone(),
            config.clone(),
            event_tx.clone(),
        );
        Self {
            user1,
            user2,
            db,
            llm,
            config,
            event_tx,
            user1_pipeline,
            user2_pipeline,
            ran: AtomicBool::new(false),
        }
    }

    pub async fn run(&self) -> Result<PairOutcome> {
        let mut pair = self.db.get_or_create_pair(&self.user1, &self.user2)?;

        if self.ran.swap(true, Ordering::SeqCst) {
            return self.snapshot(&pair);
        }

        tracing::info!(
            "Pair pipeline starting for {} / {}",
            self.user1,
            self.user2
        );

        let (outcome1, outcome2) = tokio::join!(
            self.user1_pipeline.run(AnalysisMode::ScrapeOnly),
            self.user2_pipeline.run(AnalysisMode::ScrapeOnly),
        );
        let outcome1 = outcome1?;
        let outcome2 = outcome2?;

        if outcome1.steps.tweet_scrape_completed
            && outcome2.steps.tweet_scrape_completed
            && should_run_compatibility(&pair, Utc::now(), self.config.pair_stale_secs)
        {
            self.run_compatibility(&mut pair).await?;
        }

        Ok(PairOutcome {
            steps: PairSteps {
                user1_steps: outcome1.steps,
                user2_steps: outcome2.steps,
                compatibility_started: pair.analysis_started,
                compatibility_completed: pair.analysis_completed,
            },
            user1_result: outcome1.result,
            user2_result: outcome2.result,
            compatibility_result: pair.analysis.clone(),
            unlocked: pair.unlocked,
        })
    }

    fn snapshot(&self, pair: &Pair) -> Result<PairOutcome> {
        let user1 = self.db.get_or_create_user(&self.user1)?;
        let user2 = self.db.get_or_create_user(&self.user2)?;
        Ok(PairOutcome {
            steps: PairSteps {
                user1_steps: Steps::from_subject(&user1),
                user2_steps: Steps::from_subject(&user2),
                compatibility_started: pair.analysis_started,
                compatibility_completed: pair.analysis_completed,
            },
            user1_result: user1.analysis,
            user2_result: user2.analysis,
            compatibility_result: pair.analysis.clone(),
            unlocked: pair.unlocked,
        })
    }

    /// Compatibility stage. The report covers both subjects at once, so a
    /// fresh result replaces the stored payload instead of merging.
    async fn run_compatibility(&self, pair: &mut Pair) -> Result<()> {
        pair.mark_analysis_started(Utc::now());
        self.db.update_pair(pair)?;

        let profile1 = self
            .db
            .get_user(&pair.user1)?
            .with_context(|| format!("Pair member '{}' missing from store", pair.user1))?;
        let profile2 = self
            .db
            .get_user(&pair.user2)?
            .with_context(|| format!("Pair member '{}' missing from store", pair.user2))?;

        let payload = prompts::pair_payload(&profile1, &profile2)?;
        let Some(content) = self.llm.complete(prompts::PAIR_PROMPT, &payload).await else {
            tracing::warn!(
                "No model back-end produced a compatibility report for {} / {}",
                pair.user1,
                pair.user2
            );
            return Ok(());
        };

        let Some(parsed) = recover_object(&content) else {
            tracing::warn!(
                "Could not recover a JSON object from the compatibility output for {} / {}",
                pair.user1,
                pair.user2
            );
            return Ok(());
        };

        pair.analysis = Some(parsed);
        pair.mark_analysis_completed(Utc::now());
        self.db.update_pair(pair)?;
        if let Some(result) = pair.analysis.clone() {
            let _ = self.event_tx.send(PipelineEvent::CompatibilityResultUpdated {
                pair_id: pair.id.clone(),
                result,
            });
        }
        tracing::info!(
            "Compatibility analysis completed for {} / {}",
            pair.user1,
            pair.user2
        );
        Ok(())
    }
}

/// The compatibility stage never reruns once completed, and an in-flight
/// start blocks a retry only until the pair staleness threshold passes.
pub fn should_run_compatibility(pair: &Pair, now: DateTime<Utc>, stale_after_secs: i64) -> bool {
    !pair.analysis_completed
        && (!pair.analysis_started || is_stale(pair.analysis_started_at, now, stale_after_secs))
}
