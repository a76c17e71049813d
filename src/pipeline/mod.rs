use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use serde_json::{Map, Value};

use crate::config::AppConfig;
use crate::database::{AnalysisDatabase, Subject};
use crate::json_recovery::recover_object;
use crate::llm_client::LlmClient;
use crate::prompts;
use crate::scraper::ProfileScraper;

pub mod pair;

/// Progress flags surfaced to the UI, mirroring the persisted subject.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Steps {
    pub profile_scraped: bool,
    pub tweet_scrape_started: bool,
    pub tweet_scrape_completed: bool,
    pub analysis_started: bool,
    pub analysis_completed: bool,
    pub paid_analysis_started: bool,
    pub paid_analysis_completed: bool,
}

impl Steps {
    pub fn from_subject(subject: &Subject) -> Self {
        Self {
            profile_scraped: subject.profile_scraped,
            tweet_scrape_started: subject.tweet_scrape_started,
            tweet_scrape_completed: subject.tweet_scrape_completed,
            analysis_started: subject.analysis_started,
            analysis_completed: subject.analysis_completed,
            paid_analysis_started: subject.paid_analysis_started,
            paid_analysis_completed: subject.paid_analysis_completed,
        }
    }
}

/// Progress pushed toward the UI while a pipeline runs.
#[derive(Debug, Clone)]
pub enum PipelineEvent {
    StepsChanged {
        username: String,
        steps: Steps,
    },
    ResultUpdated {
        username: String,
        result: Map<String, Value>,
    },
    ScrapeFailed {
        username: String,
        error: String,
    },
    CompatibilityResultUpdated {
        pair_id: String,
        result: Map<String, Value>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnalysisMode {
    Full,
    /// Scrape without analyzing; the pair machine runs its members this way.
    ScrapeOnly,
}

/// What a run leaves behind for the caller: current step flags plus the
/// persisted result payload, if any.
#[derive(Debug, Clone)]
pub struct AnalysisOutcome {
    pub steps: Steps,
    pub result: Option<Map<String, Value>>,
}

/// Drives one subject through scrape -> analysis -> persistence.
///
/// An instance belongs to one mount of the subject. `run` is latched: the
/// hosting surface may call it repeatedly (re-renders, remounts), but the
/// sequence executes at most once per instance; later calls return the
/// persisted snapshot. A previous mount's in-flight run is NOT cancelled;
/// the staleness thresholds make abandoned runs retryable, which means
/// execution is at-least-once and concurrent runs against one subject can
/// interleave writes (last writer wins).
pub struct SubjectPipeline {
    username: String,
    db: Arc<AnalysisDatabase>,
    scraper: Arc<dyn ProfileScraper>,
    llm: Arc<LlmClient>,
    config: AppConfig,
    event_tx: flume::Sender<PipelineEvent>,
    ran: AtomicBool,
}

impl SubjectPipeline {
    pub fn new(
        username: &str,
        db: Arc<AnalysisDatabase>,
        scraper: Arc<dyn ProfileScraper>,
        llm: Arc<LlmClient>,
        config: AppConfig,
        event_tx: flume::Sender<PipelineEvent>,
    ) -> Self {
        Self {
            username: username.to_string(),
            db,
            scraper,
            llm,
            config,
            event_tx,
            ran: AtomicBool::new(false),
        }
    }

    /// Run whichever stages still need to run for this subject. Idempotent
    /// per instance: subsequent calls are no-ops returning the snapshot.
    pub async fn run(&self, mode: AnalysisMode) -> Result<AnalysisOutcome> {
        let mut subject = self.db.get_or_create_user(&self.username)?;

        if self.ran.swap(true, Ordering::SeqCst) {
            return Ok(AnalysisOutcome {
                steps: Steps::from_subject(&subject),
                result: subject.analysis,
            });
        }

        tracing::info!("Analysis pipeline starting for {}", self.username);

        let mut scrape_completed = subject.tweet_scrape_completed;
        if should_run_tweet_scrape(&subject, Utc::now(), self.config.scrape_stale_secs) {
            scrape_completed = self.run_tweet_scrape(&mut subject).await?;
        }

        if mode == AnalysisMode::Full
            && should_run_analysis(
                &subject,
                scrape_completed,
                self.config.paywall,
                Utc::now(),
                self.config.analysis_stale_secs,
            )
        {
            self.run_analysis(&mut subject).await?;
        }

        Ok(AnalysisOutcome {
            steps: Steps::from_subject(&subject),
            result: subject.analysis.clone(),
        })
    }

    /// Scrape stage. Failure is non-fatal: flags stay retryable and the UI
    /// gets an error notification.
    async fn run_tweet_scrape(&self, subject: &mut Subject) -> Result<bool> {
        subject.mark_scrape_started(Utc::now());
        self.db.update_user(subject)?;
        self.emit_steps(subject);

        match self.scraper.process_scraped_user(&subject.username).await {
            Ok(scraped) => {
                if scraped.name.is_some() {
                    subject.name = scraped.name;
                }
                if scraped.profile_picture.is_some() {
                    subject.profile_picture = scraped.profile_picture;
                }
                subject.full_profile = Some(scraped.full_profile);
                subject.tweets = Some(scraped.tweets);
                subject.mark_scrape_completed(Utc::now());
                self.db.update_user(subject)?;
                self.emit_steps(subject);
                Ok(true)
            }
            Err(e) => {
                tracing::warn!("Scrape failed for {}: {}", subject.username, e);
                let _ = self.event_tx.send(PipelineEvent::ScrapeFailed {
                    username: subject.username.clone(),
                    error: e.to_string(),
                });
                Ok(false)
            }
        }
    }

    /// Analysis stage. Model or parse failure aborts without flipping the
    /// completion flag, leaving the stage for staleness retry; persistence
    /// failures propagate.
    async fn run_analysis(&self, subject: &mut Subject) -> Result<()> {
        subject.mark_analysis_started(Utc::now());
        self.db.update_user(subject)?;
        self.emit_steps(subject);

        let payload = prompts::subject_payload(subject)?;
        let Some(content) = self
            .llm
            .complete(prompts::SINGLE_SUBJECT_PROMPT, &payload)
            .await
        else {
            tracing::warn!(
                "No model back-end produced content for {}; analysis stays retryable",
                subject.username
            );
            return Ok(());
        };

        let Some(parsed) = recover_object(&content) else {
            tracing::warn!(
                "Could not recover a JSON object from model output for {}",
                subject.username
            );
            return Ok(());
        };

        subject.merge_analysis(parsed);
        subject.mark_analysis_completed(Utc::now());
        self.db.update_user(subject)?;
        self.emit_steps(subject);
        if let Some(result) = subject.analysis.clone() {
            let _ = self.event_tx.send(PipelineEvent::ResultUpdated {
                username: subject.username.clone(),
                result,
            });
        }
        tracing::info!("Analysis completed for {}", subject.username);
        Ok(())
    }

    fn emit_steps(&self, subject: &Subject) {
        let _ = self.event_tx.send(PipelineEvent::StepsChanged {
            username: subject.username.clone(),
            steps: Steps::from_subject(subject),
        });
    }
}

fn is_stale(started_at: Option<DateTime<Utc>>, now: DateTime<Utc>, stale_after_secs: i64) -> bool {
    match started_at {
        Some(started) => now - started > ChronoDuration::seconds(stale_after_secs),
        // A started flag without its timestamp is treated as stale.
        None => true,
    }
}

/// Scrape stage runs when it never started, or started long enough ago
/// without completing that the earlier attempt counts as abandoned.
pub fn should_run_tweet_scrape(
    subject: &Subject,
    now: DateTime<Utc>,
    stale_after_secs: i64,
) -> bool {
    !subject.tweet_scrape_started
        || (!subject.tweet_scrape_completed
            && is_stale(subject.tweet_scrape_started_at, now, stale_after_secs))
}

/// Analysis stage requires a completed scrape, the paywall gate when
/// enabled, and either a fresh start or a stale abandoned attempt.
pub fn should_run_analysis(
    subject: &Subject,
    scrape_completed: bool,
    paywall: bool,
    now: DateTime<Utc>,
    stale_after_secs: i64,
) -> bool {
    let unlocked_check = if paywall { subject.unlocked } else { true };
    unlocked_check
        && scrape_completed
        && (!subject.analysis_started
            || (!subject.analysis_completed
                && is_stale(subject.analysis_started_at, now, stale_after_secs)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModelBackend;
    use crate::llm_client::{ChatCompletionRequest, ChatTransport};
    use crate::scraper::ScrapedProfile;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    struct FakeScraper {
        calls: AtomicUsize,
        fail: bool,
    }

    impl FakeScraper {
        fn new(fail: bool) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                fail,
            })
        }
    }

    #[async_trait]
    impl ProfileScraper for FakeScraper {
        async fn process_scraped_user(&self, username: &str) -> Result<ScrapedProfile> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                anyhow::bail!("scrape service returned error 500");
            }
            Ok(ScrapedProfile {
                name: Some(format!("{} display", username)),
                profile_picture: None,
                full_profile: json!({"bio": "test bio"}),
                tweets: json!([{"text": "hello world"}]),
            })
        }
    }

    struct StubTransport {
        responses: Mutex<Vec<Result<serde_json::Value>>>,
        calls: AtomicUsize,
    }

    impl StubTransport {
        fn returning(content: &str) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(vec![Ok(json!({
                    "data": {"choices": [{"message": {"role": "assistant", "content": content}}]}
                }))]),
                calls: AtomicUsize::new(0),
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(Vec::new()),
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl ChatTransport for StubTransport {
        async fn post_completion(
            &self,
            _request: &ChatCompletionRequest,
        ) -> Result<serde_json::Value> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.responses
                .lock()
                .unwrap()
                .pop()
                .unwrap_or_else(|| Err(anyhow::anyhow!("node unreachable")))
        }
    }

    fn test_config() -> AppConfig {
        AppConfig {
            model_backends: vec![ModelBackend {
                model: "test-model".to_string(),
                node_id: "test-node".to_string(),
            }],
            ..AppConfig::default()
        }
    }

    fn build_pipeline(
        username: &str,
        scraper: Arc<FakeScraper>,
        transport: Arc<StubTransport>,
    ) -> (
        SubjectPipeline,
        Arc<AnalysisDatabase>,
        flume::Receiver<PipelineEvent>,
        tempfile::TempDir,
    ) {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = Arc::new(AnalysisDatabase::new(dir.path().join("test.db")).expect("open db"));
        let config = test_config();
        let llm = Arc::new(LlmClient::with_transport(
            transport,
            config.project.clone(),
            config.model_backends.clone(),
        ));
        let (event_tx, event_rx) = flume::unbounded();
        let pipeline = SubjectPipeline::new(username, db.clone(), scraper, llm, config, event_tx);
        (pipeline, db, event_rx, dir)
    }

    fn stale(minutes: i64) -> DateTime<Utc> {
        Utc::now() - ChronoDuration::minutes(minutes)
    }

    #[test]
    fn scrape_runs_when_never_started() {
        let subject = Subject::new("alice");
        assert!(should_run_tweet_scrape(&subject, Utc::now(), 60));
    }

    #[test]
    fn scrape_retries_only_after_staleness_threshold() {
        let mut subject = Subject::new("alice");
        subject.mark_scrape_started(stale(2));
        assert!(should_run_tweet_scrape(&subject, Utc::now(), 60));

        let mut subject = Subject::new("alice");
        subject.mark_scrape_started(Utc::now() - ChronoDuration::seconds(10));
        assert!(!should_run_tweet_scrape(&subject, Utc::now(), 60));
    }

    #[test]
    fn completed_scrape_never_reruns() {
        let mut subject = Subject::new("alice");
        subject.mark_scrape_started(stale(10));
        subject.mark_scrape_completed(stale(9));
        assert!(!should_run_tweet_scrape(&subject, Utc::now(), 60));
    }

    #[test]
    fn analysis_requires_completed_scrape() {
        let subject = Subject::new("alice");
        assert!(!should_run_analysis(&subject, false, false, Utc::now(), 60));
        assert!(should_run_analysis(&subject, true, false, Utc::now(), 60));
    }

    #[test]
    fn paywall_gates_analysis_on_unlocked() {
        let mut subject = Subject::new("alice");
        assert!(!should_run_analysis(&subject, true, true, Utc::now(), 60));
        subject.unlocked = true;
        assert!(should_run_analysis(&subject, true, true, Utc::now(), 60));
    }

    #[test]
    fn stale_analysis_is_retried_and_fresh_is_not() {
        let mut subject = Subject::new("alice");
        subject.mark_analysis_started(stale(2));
        assert!(should_run_analysis(&subject, true, false, Utc::now(), 60));

        let mut subject = Subject::new("alice");
        subject.mark_analysis_started(Utc::now() - ChronoDuration::seconds(10));
        assert!(!should_run_analysis(&subject, true, false, Utc::now(), 60));

        let mut subject = Subject::new("alice");
        subject.mark_analysis_started(stale(10));
        subject.mark_analysis_completed(stale(9));
        assert!(!should_run_analysis(&subject, true, false, Utc::now(), 60));
    }

    #[tokio::test]
    async fn fresh_subject_runs_both_stages() {
        let scraper = FakeScraper::new(false);
        let transport = StubTransport::returning(r#"{"roast": "fresh take", "mbti": "INTJ"}"#);
        let (pipeline, db, event_rx, _dir) =
            build_pipeline("alice", scraper.clone(), transport.clone());

        let outcome = pipeline.run(AnalysisMode::Full).await.unwrap();
        assert!(outcome.steps.tweet_scrape_completed);
        assert!(outcome.steps.analysis_completed);
        assert_eq!(
            outcome
                .result
                .as_ref()
                .and_then(|r| r.get("roast"))
                .and_then(Value::as_str),
            Some("fresh take")
        );

        let stored = db.get_user("alice").unwrap().unwrap();
        assert!(stored.analysis_completed);
        assert!(stored.tweets.is_some());
        assert_eq!(scraper.calls.load(Ordering::SeqCst), 1);

        let events: Vec<_> = event_rx.drain().collect();
        assert!(events
            .iter()
            .any(|e| matches!(e, PipelineEvent::ResultUpdated { .. })));
    }

    #[tokio::test]
    async fn run_is_latched_per_instance() {
        let scraper = FakeScraper::new(false);
        let transport = StubTransport::returning(r#"{"roast": "once"}"#);
        let (pipeline, _db, _event_rx, _dir) =
            build_pipeline("alice", scraper.clone(), transport);

        pipeline.run(AnalysisMode::Full).await.unwrap();
        let second = pipeline.run(AnalysisMode::Full).await.unwrap();

        assert_eq!(scraper.calls.load(Ordering::SeqCst), 1);
        // The latched call still reports the persisted state.
        assert!(second.steps.analysis_completed);
    }

    #[tokio::test]
    async fn scrape_failure_leaves_stage_retryable_and_skips_analysis() {
        let scraper = FakeScraper::new(true);
        let transport = StubTransport::returning(r#"{"roast": "unreachable"}"#);
        let (pipeline, db, event_rx, _dir) =
            build_pipeline("alice", scraper, transport.clone());

        let outcome = pipeline.run(AnalysisMode::Full).await.unwrap();
        assert!(outcome.steps.tweet_scrape_started);
        assert!(!outcome.steps.tweet_scrape_completed);
        assert!(!outcome.steps.analysis_started);
        assert_eq!(transport.calls.load(Ordering::SeqCst), 0);

        let stored = db.get_user("alice").unwrap().unwrap();
        assert!(stored.tweet_scrape_started);
        assert!(!stored.tweet_scrape_completed);

        let events: Vec<_> = event_rx.drain().collect();
        assert!(events
            .iter()
            .any(|e| matches!(e, PipelineEvent::ScrapeFailed { .. })));
    }

    #[tokio::test]
    async fn exhausted_models_leave_analysis_incomplete() {
        let scraper = FakeScraper::new(false);
        let transport = StubTransport::failing();
        let (pipeline, db, _event_rx, _dir) = build_pipeline("alice", scraper, transport);

        let outcome = pipeline.run(AnalysisMode::Full).await.unwrap();
        assert!(outcome.steps.analysis_started);
        assert!(!outcome.steps.analysis_completed);

        let stored = db.get_user("alice").unwrap().unwrap();
        assert!(stored.analysis_started);
        assert!(!stored.analysis_completed);
        assert!(stored.analysis.is_none());
    }

    #[tokio::test]
    async fn unrecoverable_model_output_is_treated_as_no_result() {
        let scraper = FakeScraper::new(false);
        let transport = StubTransport::returning("the stars are silent today");
        let (pipeline, db, _event_rx, _dir) = build_pipeline("alice", scraper, transport);

        let outcome = pipeline.run(AnalysisMode::Full).await.unwrap();
        assert!(!outcome.steps.analysis_completed);

        let stored = db.get_user("alice").unwrap().unwrap();
        assert!(!stored.analysis_completed);
    }

    #[tokio::test]
    async fn new_result_merges_over_existing_payload() {
        let scraper = FakeScraper::new(false);
        let transport = StubTransport::returning(r#"{"roast": "y"}"#);
        let (pipeline, db, _event_rx, _dir) = build_pipeline("alice", scraper, transport);

        // A prior run left a partial payload and a stale started flag.
        let mut seeded = Subject::new("alice");
        seeded.mark_scrape_started(stale(5));
        seeded.mark_scrape_completed(stale(5));
        seeded.mark_analysis_started(stale(3));
        seeded.analysis = Some(
            json!({"roast": "x", "extra": "e"})
                .as_object()
                .unwrap()
                .clone(),
        );
        db.update_user(&seeded).unwrap();

        let outcome = pipeline.run(AnalysisMode::Full).await.unwrap();
        let result = outcome.result.unwrap();
        assert_eq!(result.get("roast").and_then(Value::as_str), Some("y"));
        assert_eq!(result.get("extra").and_then(Value::as_str), Some("e"));
    }

    #[tokio::test]
    async fn scrape_only_mode_never_calls_the_model() {
        let scraper = FakeScraper::new(false);
        let transport = StubTransport::returning(r#"{"roast": "unused"}"#);
        let (pipeline, db, _event_rx, _dir) =
            build_pipeline("alice", scraper, transport.clone());

        let outcome = pipeline.run(AnalysisMode::ScrapeOnly).await.unwrap();
        assert!(outcome.steps.tweet_scrape_completed);
        assert!(!outcome.steps.analysis_started);
        assert_eq!(transport.calls.load(Ordering::SeqCst), 0);

        let stored = db.get_user("alice").unwrap().unwrap();
        assert!(!stored.analysis_started);
    }
}
