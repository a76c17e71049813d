use anyhow::{Context, Result};
use flume::unbounded;
use tracing_subscriber::EnvFilter;
use tweetscope::config::AppConfig;
use tweetscope::runtime::AnalysisRuntime;
use tweetscope::server::serve;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,tweetscope=debug")),
        )
        .init();

    let config = AppConfig::load();
    let (event_tx, _event_rx) = unbounded();
    let runtime = AnalysisRuntime::bootstrap(config, event_tx)
        .context("failed to bootstrap analysis runtime")?;

    tracing::info!(
        "Starting analysis service (override bind with TWEETSCOPE_BIND, model list with TWEETSCOPE_MODEL_BACKENDS)"
    );

    let server_rt = tokio::runtime::Runtime::new().context("failed to start server runtime")?;
    server_rt.block_on(serve(runtime))
}
