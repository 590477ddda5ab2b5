use serde::{Serialize, Deserialize};
use thiserror::Error;

use crate::proxy::PoolExhausted;

/// What kind of page a task targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskKind {
    /// The single catalog root page that seeds the crawl
    Root,
    /// A product detail page
    Detail,
}

/// A unit of crawl work. Created when a URL is discovered, consumed exactly
/// once by the render fetcher, immutable after creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlTask {
    /// URL to render
    pub url: String,

    /// Root or detail page
    pub kind: TaskKind,

    /// Settle delay before the DOM snapshot, in milliseconds
    pub render_wait_ms: u64,

    /// Whether to scroll to the bottom to trigger lazy loading
    pub scroll: bool,
}

impl CrawlTask {
    /// Task for the catalog root page
    pub fn root(url: &str, settle_secs: u64) -> Self {
        Self {
            url: url.to_string(),
            kind: TaskKind::Root,
            render_wait_ms: settle_secs * 1000,
            scroll: true,
        }
    }

    /// Task for a product detail page
    pub fn detail(url: &str) -> Self {
        Self {
            url: url.to_string(),
            kind: TaskKind::Detail,
            render_wait_ms: 0,
            scroll: false,
        }
    }
}

/// Result of a completed fetch. Owned transiently by the stage that produced
/// it; the extractor consumes it and nothing retains it afterwards.
#[derive(Debug, Clone)]
pub struct FetchResult {
    /// URL that was rendered
    pub url: String,

    /// Fully rendered DOM snapshot
    pub html: String,

    /// HTTP status of the navigation
    pub status: u16,

    /// Proxy address the request went through (None = direct)
    pub proxy_used: Option<String>,

    /// Wall-clock render time in milliseconds
    pub elapsed_ms: u64,
}

/// Fetch failure taxonomy
#[derive(Debug, Error)]
pub enum FetchError {
    /// The wait condition never satisfied within the timeout budget
    #[error("Render wait timed out for {url}")]
    Timeout { url: String },

    /// The response signature matched a ban heuristic
    #[error("Request banned by target for {url} ({reason})")]
    Banned { url: String, reason: String },

    /// Transport-level failure
    #[error("Network failure for {url}: {reason}")]
    Network { url: String, reason: String },

    /// No proxy left to route through; fatal for scheduling
    #[error(transparent)]
    Pool(#[from] PoolExhausted),
}
