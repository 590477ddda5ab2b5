pub mod controller;
pub mod discover;
pub mod fetcher;
pub mod task;

// Re-export common types
pub use controller::{CrawlerController, CrawlSummary};
pub use discover::LinkDiscoverer;
pub use fetcher::RenderFetcher;
pub use task::{CrawlTask, TaskKind, FetchResult, FetchError};
