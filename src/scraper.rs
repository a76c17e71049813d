use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Result of one scrape run: the profile record plus collected tweets,
/// both kept loosely typed since the scrape service owns their shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScrapedProfile {
    pub name: Option<String>,
    pub profile_picture: Option<String>,
    pub full_profile: Value,
    pub tweets: Value,
}

/// The scrape collaborator. Implementations fetch the subject's profile
/// and recent tweets; errors mean the scrape failed and the stage stays
/// retryable.
#[async_trait]
pub trait ProfileScraper: Send + Sync {
    async fn process_scraped_user(&self, username: &str) -> Result<ScrapedProfile>;
}

#[derive(Debug, Serialize)]
struct ScrapeRequest<'a> {
    username: &'a str,
}

/// Scrape service spoken to over HTTP.
pub struct HttpProfileScraper {
    api_url: String,
    client: reqwest::Client,
}

impl HttpProfileScraper {
    pub fn new(api_url: String) -> Self {
        Self {
            api_url,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl ProfileScraper for HttpProfileScraper {
    async fn process_scraped_user(&self, username: &str) -> Result<ScrapedProfile> {
        let url = format!("{}/scrape", self.api_url);

        let response = self
            .client
            .post(&url)
            .json(&ScrapeRequest { username })
            .send()
            .await
            .context("Failed to reach scrape service")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unable to read body".to_string());
            anyhow::bail!("Scrape service returned error {}: {}", status, body);
        }

        response
            .json()
            .await
            .context("Failed to parse scrape service response")
    }
}
