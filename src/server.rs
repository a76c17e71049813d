use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::body::Body;
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{Duration as ChronoDuration, Utc};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};

use crate::config::AppConfig;
use crate::database::{AnalysisDatabase, Subject};
use crate::llm_client::StreamingChatClient;
use crate::prompts;
use crate::runtime::AnalysisRuntime;
use crate::stream_decoder::{EventStreamDecoder, StreamItem};

#[derive(Clone)]
pub struct ServerState {
    pub db: Arc<AnalysisDatabase>,
    pub streaming: Arc<StreamingChatClient>,
    pub config: AppConfig,
}

pub async fn serve(runtime: AnalysisRuntime) -> Result<()> {
    let bind_addr = runtime
        .config
        .bind_addr
        .parse::<SocketAddr>()
        .context("Invalid bind address (expected host:port)")?;

    let state = Arc::new(ServerState {
        db: runtime.db.clone(),
        streaming: runtime.streaming.clone(),
        config: runtime.config.clone(),
    });

    let app = Router::new()
        .route("/health", get(health))
        .route("/analyze", post(analyze))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("Failed to bind server to {}", bind_addr))?;
    tracing::info!("tweetscope listening on http://{}", bind_addr);
    axum::serve(listener, app).await.context("Server failed")?;
    Ok(())
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

#[derive(Debug, Deserialize)]
struct AnalyzeRequest {
    username: String,
    #[serde(default)]
    full: bool,
}

#[derive(Debug, Serialize)]
struct AnalyzeError {
    error: String,
}

fn error_json(message: impl Into<String>) -> Json<AnalyzeError> {
    Json(AnalyzeError {
        error: message.into(),
    })
}

/// Streaming analysis route: triggers the subject's analysis server-side
/// and streams the decoded final-output text back as plain text. The
/// structured result is merged and persisted when the `outputs` record
/// arrives, exactly as in the non-streaming pipeline.
async fn analyze(
    State(state): State<Arc<ServerState>>,
    Json(body): Json<AnalyzeRequest>,
) -> Response {
    match start_analysis_stream(state, body).await {
        Ok(response) => response,
        Err(e) => {
            tracing::error!("Analyze route failed: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, error_json(e.to_string())).into_response()
        }
    }
}

async fn start_analysis_stream(state: Arc<ServerState>, body: AnalyzeRequest) -> Result<Response> {
    let Some(mut subject) = state.db.get_user(&body.username)? else {
        return Ok((
            StatusCode::NOT_FOUND,
            error_json(format!("User not found: {}", body.username)),
        )
            .into_response());
    };

    if already_running(&subject, body.full, state.config.route_guard_secs, Utc::now()) {
        return Ok(error_json("Analysis already started").into_response());
    }

    let tweets_markdown = subject
        .tweets
        .as_ref()
        .map(|tweets| prompts::format_tweets_markdown(tweets, &subject.username))
        .unwrap_or_default();
    let profile_json = subject
        .full_profile
        .as_ref()
        .map(serde_json::to_string_pretty)
        .transpose()
        .context("Failed to serialize subject profile")?
        .unwrap_or_default();
    let payload = format!("Profile:\n{}\n\nTweets:\n{}\n", profile_json, tweets_markdown);

    let Some(upstream) = state
        .streaming
        .open(prompts::SINGLE_SUBJECT_PROMPT, &payload)
        .await
    else {
        return Ok((
            StatusCode::BAD_REQUEST,
            error_json("No model back-end accepted the streaming request"),
        )
            .into_response());
    };

    let now = Utc::now();
    if body.full {
        subject.mark_paid_analysis_started(now);
    } else {
        subject.mark_analysis_started(now);
    }
    state.db.update_user(&subject)?;

    let (tx, rx) = flume::unbounded::<std::result::Result<String, std::io::Error>>();
    let db = state.db.clone();
    let full = body.full;
    tokio::spawn(async move {
        let mut decoder = EventStreamDecoder::new();
        let mut byte_stream = upstream.bytes_stream();
        loop {
            match byte_stream.next().await {
                Some(Ok(chunk)) => {
                    for item in decoder.feed(&chunk) {
                        handle_stream_item(&db, &mut subject, full, item, &tx);
                    }
                }
                Some(Err(e)) => {
                    tracing::warn!("Stream read error for {}: {}", subject.username, e);
                    break;
                }
                None => break,
            }
        }
        for item in decoder.finish() {
            handle_stream_item(&db, &mut subject, full, item, &tx);
        }
    });

    let response = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(Body::from_stream(rx.into_stream()))
        .context("Failed to build streaming response")?;
    Ok(response)
}

fn handle_stream_item(
    db: &AnalysisDatabase,
    subject: &mut Subject,
    full: bool,
    item: StreamItem,
    tx: &flume::Sender<std::result::Result<String, std::io::Error>>,
) {
    match item {
        StreamItem::Text(text) => {
            // Drop errors: a disconnected client must not stop persistence.
            let _ = tx.send(Ok(text));
        }
        StreamItem::Outputs(output) => {
            subject.merge_analysis(output);
            let now = Utc::now();
            if full {
                subject.mark_paid_analysis_completed(now);
            } else {
                subject.mark_analysis_completed(now);
            }
            if let Err(e) = db.update_user(subject) {
                tracing::error!("Failed to persist analysis for {}: {}", subject.username, e);
                // Reset the flags so a later mount retries the stage.
                if full {
                    subject.paid_analysis_started = false;
                    subject.paid_analysis_completed = false;
                } else {
                    subject.analysis_started = false;
                    subject.analysis_completed = false;
                }
                let _ = db.update_user(subject);
            }
        }
    }
}

/// Duplicate-trigger guard: the stage is already done, or a recent start is
/// presumed still in flight.
fn already_running(
    subject: &Subject,
    full: bool,
    guard_secs: i64,
    now: chrono::DateTime<Utc>,
) -> bool {
    let (started, started_at, completed) = if full {
        (
            subject.paid_analysis_started,
            subject.paid_analysis_started_at,
            subject.paid_analysis_completed,
        )
    } else {
        (
            subject.analysis_started,
            subject.analysis_started_at,
            subject.analysis_completed,
        )
    };

    completed
        || (started
            && started_at
                .map(|t| now - t < ChronoDuration::seconds(guard_secs))
                .unwrap_or(false))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guard_blocks_completed_and_recent_starts() {
        let now = Utc::now();

        let mut subject = Subject::new("alice");
        assert!(!already_running(&subject, false, 180, now));

        subject.mark_analysis_started(now - ChronoDuration::seconds(30));
        assert!(already_running(&subject, false, 180, now));

        subject.mark_analysis_started(now - ChronoDuration::minutes(10));
        assert!(!already_running(&subject, false, 180, now));

        subject.mark_analysis_completed(now);
        assert!(already_running(&subject, false, 180, now));
    }

    #[test]
    fn guard_tracks_the_paid_tier_separately() {
        let now = Utc::now();

        let mut subject = Subject::new("alice");
        subject.mark_analysis_started(now);
        subject.mark_analysis_completed(now);

        // The standard tier being done does not block the paid tier.
        assert!(already_running(&subject, false, 180, now));
        assert!(!already_running(&subject, true, 180, now));

        subject.mark_paid_analysis_started(now - ChronoDuration::seconds(10));
        assert!(already_running(&subject, true, 180, now));
    }
}
