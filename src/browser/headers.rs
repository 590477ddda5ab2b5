use std::collections::HashMap;
use std::time::Duration;
use anyhow::{Result, Context};
use rand::{thread_rng, Rng};
use reqwest::Client;
use serde::{Serialize, Deserialize};
use tracing::{debug, warn};

use crate::cli::config::HeaderProviderSettings;

/// One rotating identity: a user agent plus the browser headers that go with it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeaderSet {
    pub user_agent: String,
    pub headers: HashMap<String, String>,
}

/// Rotating header provider. The pool is loaded once at startup, either from
/// a remote header endpoint or from the built-in fallback sets, and a random
/// set is handed out per request.
pub struct HeaderProvider {
    /// Available header sets to rotate through
    sets: Vec<HeaderSet>,
}

/// Response shape of the remote header endpoint
#[derive(Debug, Deserialize)]
struct ProviderResponse {
    result: Vec<HashMap<String, String>>,
}

impl HeaderProvider {
    /// Load the header pool. Prefers the remote endpoint when configured,
    /// falling back to the built-in sets on any failure.
    pub async fn load(settings: &HeaderProviderSettings) -> Result<Self> {
        if let (Some(endpoint), Some(api_key)) = (&settings.endpoint, &settings.api_key) {
            match Self::fetch_remote(endpoint, api_key, settings.num_results).await {
                Ok(sets) if !sets.is_empty() => {
                    debug!("Loaded {} header sets from provider", sets.len());
                    return Ok(Self { sets });
                }
                Ok(_) => {
                    warn!("Header provider returned no header sets, using fallback pool");
                }
                Err(e) => {
                    warn!("Header provider unreachable, using fallback pool: {:#}", e);
                }
            }
        }

        Self::from_fallback(settings)
    }

    /// Build the pool from the configured fallback user agents
    pub fn from_fallback(settings: &HeaderProviderSettings) -> Result<Self> {
        if settings.fallback_user_agents.is_empty() {
            anyhow::bail!("No fallback user agents configured");
        }

        let sets = settings
            .fallback_user_agents
            .iter()
            .map(|user_agent| HeaderSet {
                user_agent: user_agent.clone(),
                headers: Self::standard_headers(user_agent),
            })
            .collect();

        Ok(Self { sets })
    }

    /// Fetch header sets from the remote provider endpoint
    async fn fetch_remote(endpoint: &str, api_key: &str, num_results: usize) -> Result<Vec<HeaderSet>> {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("Failed to create HTTP client")?;

        let response: ProviderResponse = client
            .get(endpoint)
            .query(&[
                ("api_key", api_key.to_string()),
                ("num_results", num_results.to_string()),
            ])
            .send()
            .await
            .context("Failed to query header provider")?
            .error_for_status()
            .context("Header provider rejected the request")?
            .json()
            .await
            .context("Failed to parse header provider response")?;

        let sets = response
            .result
            .into_iter()
            .filter_map(|headers| {
                let user_agent = headers
                    .iter()
                    .find(|(k, _)| k.eq_ignore_ascii_case("user-agent"))
                    .map(|(_, v)| v.clone())?;

                Some(HeaderSet { user_agent, headers })
            })
            .collect();

        Ok(sets)
    }

    /// Pick a random header set for the next request
    pub fn pick(&self) -> HeaderSet {
        let mut rng = thread_rng();
        self.sets[rng.gen_range(0..self.sets.len())].clone()
    }

    /// Size of the loaded pool
    pub fn pool_size(&self) -> usize {
        self.sets.len()
    }

    /// Standard browser headers paired with a user agent
    fn standard_headers(user_agent: &str) -> HashMap<String, String> {
        let mut headers = HashMap::new();

        headers.insert("User-Agent".to_string(), user_agent.to_string());
        headers.insert(
            "Accept".to_string(),
            "text/html,application/xhtml+xml,application/xml;q=0.9,image/webp,*/*;q=0.8".to_string(),
        );
        headers.insert("Accept-Language".to_string(), "en-US,en;q=0.9".to_string());
        headers.insert("Accept-Encoding".to_string(), "gzip, deflate, br".to_string());
        headers.insert("Connection".to_string(), "keep-alive".to_string());
        headers.insert("Upgrade-Insecure-Requests".to_string(), "1".to_string());

        headers
    }
}
