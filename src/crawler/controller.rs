use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use anyhow::{Result, Context};
use chrono::{DateTime, Utc};
use futures::stream::{FuturesUnordered, StreamExt};
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration, Instant};
use tracing::{debug, info, warn, error};
use uuid::Uuid;

use crate::browser::headers::HeaderProvider;
use crate::browser::session::{RenderTransport, WebDriverTransport};
use crate::cli::config::CrawlerConfig;
use crate::crawler::discover::LinkDiscoverer;
use crate::crawler::fetcher::RenderFetcher;
use crate::crawler::task::{CrawlTask, FetchError};
use crate::extract::{normalize, ProductExtractor, ProductRecord};
use crate::proxy::ProxyRotator;
use crate::storage::{run_sink, CsvSink, RecordSink};

/// Outcome accounting for one crawl run. The crawl never silently truncates:
/// every dropped or abandoned page shows up here.
#[derive(Debug, Clone)]
pub struct CrawlSummary {
    pub crawl_id: String,
    pub started_at: DateTime<Utc>,
    /// Detail URLs found on the root page (after the optional cap)
    pub discovered: usize,
    /// Records that reached the output sink
    pub records_written: usize,
    /// Pages dropped because extraction failed
    pub dropped_extract: usize,
    /// Pages dropped because normalization failed
    pub dropped_normalize: usize,
    /// Pages abandoned after the fetch retry budget
    pub abandoned: usize,
    /// Pages never fetched because the crawl stopped first
    pub skipped: usize,
    /// Total fetch retry attempts
    pub retries: usize,
    pub elapsed_ms: u64,
}

#[derive(Default)]
struct CrawlCounters {
    dropped_extract: AtomicUsize,
    dropped_normalize: AtomicUsize,
    abandoned: AtomicUsize,
    skipped: AtomicUsize,
    pool_exhausted: AtomicBool,
}

/// Orchestrates one crawl: root fetch, link discovery, bounded fan-out over
/// detail pages, and fan-in into the output sink.
pub struct CrawlerController {
    config: CrawlerConfig,
    fetcher: Arc<RenderFetcher>,
    discoverer: LinkDiscoverer,
    extractor: Arc<ProductExtractor>,
    rotator: Option<Arc<ProxyRotator>>,
}

impl CrawlerController {
    /// Create a controller with the real WebDriver transport
    pub async fn new(config: CrawlerConfig) -> Result<Self> {
        let headers = Arc::new(HeaderProvider::load(&config.headers).await?);
        info!("Header pool ready with {} sets", headers.pool_size());

        let transport: Arc<dyn RenderTransport> =
            Arc::new(WebDriverTransport::new(config.render.clone()));

        Self::assemble(config, transport, headers)
    }

    /// Wire the pipeline stages around a transport. Separate from `new` so
    /// tests can substitute a fake renderer.
    pub fn assemble(
        config: CrawlerConfig,
        transport: Arc<dyn RenderTransport>,
        headers: Arc<HeaderProvider>,
    ) -> Result<Self> {
        let rotator = if config.proxy.enabled && !config.proxy.proxy_list.is_empty() {
            Some(Arc::new(ProxyRotator::from_settings(&config.proxy)))
        } else {
            None
        };

        let fetcher = Arc::new(RenderFetcher::new(
            transport,
            rotator.clone(),
            headers,
            config.site.clone(),
            config.render.clone(),
            &config.crawl,
        ));

        let discoverer = LinkDiscoverer::new(&config.site)?;
        let extractor = Arc::new(ProductExtractor::new(&config.site.structured_data_selector)?);

        Ok(Self {
            config,
            fetcher,
            discoverer,
            extractor,
            rotator,
        })
    }

    /// Run the crawl to completion and return the summary
    pub async fn run(&self) -> Result<CrawlSummary> {
        let crawl_id = Uuid::new_v4().to_string();
        let started_at = Utc::now();
        let started = Instant::now();

        info!(
            "Starting crawl {} from {}",
            crawl_id, self.config.site.root_url
        );
        if let Some(rotator) = &self.rotator {
            info!("Proxy rotation enabled over {} entries", rotator.pool_size().await);
        }

        // One writer task owns the sink and drains the record channel
        let (records_tx, records_rx) = mpsc::channel::<ProductRecord>(64);
        let sink: Box<dyn RecordSink> = Box::new(CsvSink::create(&self.config.output.path)?);
        let writer = tokio::spawn(run_sink(sink, records_rx));

        // The root fetch is the single ordered prerequisite; without its
        // links the crawl cannot proceed
        let root_task = CrawlTask::root(
            &self.config.site.root_url,
            self.config.render.settle_secs,
        );
        let root = self
            .fetcher
            .fetch(&root_task)
            .await
            .context("Root fetch failed; cannot discover product links")?;

        // Banned proxies come back lazily on rotation; the sweep keeps the
        // active set honest during long stretches without rotation. Spawned
        // only once the crawl is committed, so an early return cannot leak it.
        let sweeper = self.rotator.clone().map(|rotator| {
            tokio::spawn(async move {
                let mut tick = tokio::time::interval(Duration::from_secs(30));
                loop {
                    tick.tick().await;
                    rotator.reactivate_expired().await;
                }
            })
        });

        let mut urls = self.discoverer.discover(&root.html);
        if let Some(limit) = self.config.crawl.max_products {
            urls.truncate(limit);
        }
        let discovered = urls.len();
        info!("Discovered {} product detail pages", discovered);

        let counters = Arc::new(CrawlCounters::default());
        let stop = Arc::new(AtomicBool::new(false));

        let mut workers = FuturesUnordered::new();
        let mut abort_handles = Vec::with_capacity(urls.len());

        for url in urls {
            let handle = tokio::spawn(process_detail(
                url,
                self.fetcher.clone(),
                self.extractor.clone(),
                records_tx.clone(),
                stop.clone(),
                counters.clone(),
            ));
            abort_handles.push(handle.abort_handle());
            workers.push(handle);
        }
        drop(records_tx);

        let drain = async {
            while let Some(joined) = workers.next().await {
                if let Err(e) = joined {
                    if !e.is_cancelled() {
                        error!("Detail worker failed: {}", e);
                    }
                }
            }
        };
        tokio::pin!(drain);

        // Global deadline: stop scheduling, give in-flight fetches a grace
        // period, then cancel whatever is left
        if let Some(secs) = self.config.crawl.crawl_timeout_secs {
            if timeout(Duration::from_secs(secs), &mut drain).await.is_err() {
                warn!("Crawl timeout reached; draining in-flight fetches");
                stop.store(true, Ordering::SeqCst);

                let grace = Duration::from_secs(self.config.crawl.drain_grace_secs);
                if timeout(grace, &mut drain).await.is_err() {
                    warn!("Grace period expired; cancelling remaining fetches");
                    for handle in &abort_handles {
                        handle.abort();
                    }
                    drain.await;
                }
            }
        } else {
            drain.await;
        }

        if let Some(sweeper) = sweeper {
            sweeper.abort();
        }

        let records_written = writer
            .await
            .context("Output writer task failed")?
            .context("Output sink failed")?;

        let summary = CrawlSummary {
            crawl_id: crawl_id.clone(),
            started_at,
            discovered,
            records_written,
            dropped_extract: counters.dropped_extract.load(Ordering::Relaxed),
            dropped_normalize: counters.dropped_normalize.load(Ordering::Relaxed),
            abandoned: counters.abandoned.load(Ordering::Relaxed),
            skipped: counters.skipped.load(Ordering::Relaxed),
            retries: self.fetcher.retry_total(),
            elapsed_ms: started.elapsed().as_millis() as u64,
        };

        info!(
            "Crawl {} finished: {} written, {} dropped in extraction, {} dropped in normalization, \
             {} abandoned, {} skipped, {} retries",
            summary.crawl_id,
            summary.records_written,
            summary.dropped_extract,
            summary.dropped_normalize,
            summary.abandoned,
            summary.skipped,
            summary.retries,
        );

        if counters.pool_exhausted.load(Ordering::SeqCst) {
            // The partial dataset is already on disk
            anyhow::bail!(
                "Crawl halted: proxy pool exhausted after {} records",
                summary.records_written
            );
        }

        Ok(summary)
    }
}

/// One detail page through the whole pipeline: fetch, extract, normalize,
/// hand off to the sink. Per-record failures are counted and logged, never
/// propagated: one missing record does not abort the crawl.
async fn process_detail(
    url: String,
    fetcher: Arc<RenderFetcher>,
    extractor: Arc<ProductExtractor>,
    records_tx: mpsc::Sender<ProductRecord>,
    stop: Arc<AtomicBool>,
    counters: Arc<CrawlCounters>,
) {
    if stop.load(Ordering::SeqCst) {
        counters.skipped.fetch_add(1, Ordering::Relaxed);
        return;
    }

    let task = CrawlTask::detail(&url);

    let permit = match fetcher.reserve(&url).await {
        Ok(permit) => permit,
        Err(e) => {
            warn!("Abandoning {}: {}", url, e);
            counters.abandoned.fetch_add(1, Ordering::Relaxed);
            return;
        }
    };

    // The crawl deadline may have passed while this page waited for a slot
    if stop.load(Ordering::SeqCst) {
        counters.skipped.fetch_add(1, Ordering::Relaxed);
        return;
    }

    let fetched = match fetcher.fetch_reserved(&task, permit).await {
        Ok(result) => result,
        Err(FetchError::Pool(e)) => {
            error!("{}; halting new fetches", e);
            counters.pool_exhausted.store(true, Ordering::SeqCst);
            counters.abandoned.fetch_add(1, Ordering::Relaxed);
            stop.store(true, Ordering::SeqCst);
            return;
        }
        Err(e) => {
            warn!("Abandoning {} after retries: {}", url, e);
            counters.abandoned.fetch_add(1, Ordering::Relaxed);
            return;
        }
    };

    debug!(
        "Rendered {} (status {}) in {} ms via {:?}",
        fetched.url, fetched.status, fetched.elapsed_ms, fetched.proxy_used
    );

    let raw = match extractor.extract(&fetched.url, &fetched.html) {
        Ok(raw) => raw,
        Err(e) => {
            warn!("Dropping {}: {}", url, e);
            counters.dropped_extract.fetch_add(1, Ordering::Relaxed);
            return;
        }
    };

    let record = match normalize(raw) {
        Ok(record) => record,
        Err(e) => {
            warn!("Dropping {}: {}", url, e);
            counters.dropped_normalize.fetch_add(1, Ordering::Relaxed);
            return;
        }
    };

    if records_tx.send(record).await.is_err() {
        warn!("Output sink closed; record for {} lost", url);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use tempfile::tempdir;
    use crate::browser::headers::HeaderSet;
    use crate::browser::script::RenderPlan;
    use crate::browser::session::{RenderedPage, TransportError};
    use crate::proxy::ProxyEntry;

    /// Serves canned HTML per URL, like a tiny static site
    struct SiteTransport {
        pages: HashMap<String, String>,
    }

    #[async_trait]
    impl RenderTransport for SiteTransport {
        async fn render(
            &self,
            url: &str,
            _plan: &RenderPlan,
            _proxy: Option<&ProxyEntry>,
            _headers: &HeaderSet,
        ) -> Result<RenderedPage, TransportError> {
            match self.pages.get(url) {
                Some(html) => Ok(RenderedPage {
                    html: html.clone(),
                    status: 200,
                    elapsed_ms: 1,
                }),
                None => Err(TransportError::Network(format!("no such page: {}", url))),
            }
        }
    }

    /// Like SiteTransport, but each render takes a fixed amount of time and
    /// render starts are counted.
    struct SlowTransport {
        pages: HashMap<String, String>,
        delay: Duration,
        renders_started: AtomicUsize,
    }

    #[async_trait]
    impl RenderTransport for SlowTransport {
        async fn render(
            &self,
            url: &str,
            _plan: &RenderPlan,
            _proxy: Option<&ProxyEntry>,
            _headers: &HeaderSet,
        ) -> Result<RenderedPage, TransportError> {
            self.renders_started.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;

            match self.pages.get(url) {
                Some(html) => Ok(RenderedPage {
                    html: html.clone(),
                    status: 200,
                    elapsed_ms: 1,
                }),
                None => Err(TransportError::Network(format!("no such page: {}", url))),
            }
        }
    }

    fn detail_page(name: &str, sku: &str, price: &str) -> String {
        format!(
            r#"<html><head><script type="application/ld+json">{{
                "name": "{name}",
                "description": "<p>{name}</p><br>Cotton",
                "sku": "{sku}",
                "image": "https://img.example/{sku}.jpg",
                "offers": {{
                    "priceCurrency": "MXN",
                    "price": "{price}",
                    "availability": "http://schema.org/category/InStock"
                }}
            }}</script></head><body></body></html>"#
        )
    }

    fn root_page(paths: &[&str]) -> String {
        let tiles: String = paths
            .iter()
            .map(|p| format!(r#"<div class="pdp-link"><a href="{}">x</a></div>"#, p))
            .collect();
        format!("<html><body>{}</body></html>", tiles)
    }

    #[tokio::test]
    async fn crawl_produces_records_and_accounts_for_drops() {
        let dir = tempdir().unwrap();

        let mut config = CrawlerConfig::default();
        config.crawl.max_retries = 0;
        config.render.settle_secs = 0;
        config.output.path = dir.path().join("products.csv");

        let mut pages = HashMap::new();
        pages.insert(
            config.site.root_url.clone(),
            root_page(&["/p/a.html", "/p/b.html", "/p/bad.html"]),
        );
        pages.insert(
            "https://www.cyamoda.com/p/a.html".to_string(),
            detail_page("Camisa A", "SKU-A", "129.99"),
        );
        pages.insert(
            "https://www.cyamoda.com/p/b.html".to_string(),
            detail_page("Camisa B", "SKU-B", "89.50"),
        );
        // bad.html has no structured-data block
        pages.insert(
            "https://www.cyamoda.com/p/bad.html".to_string(),
            "<html><body>nothing here</body></html>".to_string(),
        );

        let headers = Arc::new(HeaderProvider::from_fallback(&config.headers).unwrap());
        let controller = CrawlerController::assemble(
            config.clone(),
            Arc::new(SiteTransport { pages }),
            headers,
        )
        .unwrap();

        let summary = controller.run().await.unwrap();

        assert_eq!(summary.discovered, 3);
        assert_eq!(summary.records_written, 2);
        assert_eq!(summary.dropped_extract, 1);
        assert_eq!(summary.dropped_normalize, 0);
        assert_eq!(summary.abandoned, 0);

        let mut reader = csv::Reader::from_path(&config.output.path).unwrap();
        let mut records: Vec<ProductRecord> =
            reader.deserialize().collect::<Result<_, _>>().unwrap();
        records.sort_by(|a, b| a.sku.cmp(&b.sku));

        assert_eq!(records.len(), 2);
        assert_eq!(records[0].sku, "SKU-A");
        assert_eq!(records[0].price, 129.99);
        assert_eq!(records[0].availability, "InStock");
        assert_eq!(records[0].description, " Camisa A  Cotton");

        // Detail URLs are unique keys within the run
        let mut urls: Vec<_> = records.iter().map(|r| r.url.clone()).collect();
        urls.dedup();
        assert_eq!(urls.len(), 2);
    }

    #[tokio::test]
    async fn unreachable_detail_pages_are_abandoned_not_fatal() {
        let dir = tempdir().unwrap();

        let mut config = CrawlerConfig::default();
        config.crawl.max_retries = 0;
        config.crawl.retry_backoff_ms = 1;
        config.render.settle_secs = 0;
        config.output.path = dir.path().join("products.csv");

        let mut pages = HashMap::new();
        pages.insert(
            config.site.root_url.clone(),
            root_page(&["/p/a.html", "/p/gone.html"]),
        );
        pages.insert(
            "https://www.cyamoda.com/p/a.html".to_string(),
            detail_page("Camisa A", "SKU-A", "129.99"),
        );

        let headers = Arc::new(HeaderProvider::from_fallback(&config.headers).unwrap());
        let controller = CrawlerController::assemble(
            config.clone(),
            Arc::new(SiteTransport { pages }),
            headers,
        )
        .unwrap();

        let summary = controller.run().await.unwrap();
        assert_eq!(summary.records_written, 1);
        assert_eq!(summary.abandoned, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_stops_scheduling_new_fetches() {
        let dir = tempdir().unwrap();

        let mut config = CrawlerConfig::default();
        config.crawl.concurrency = 1;
        config.crawl.max_retries = 0;
        config.crawl.crawl_timeout_secs = Some(1);
        config.crawl.drain_grace_secs = 30;
        config.render.settle_secs = 0;
        config.output.path = dir.path().join("products.csv");

        let mut pages = HashMap::new();
        pages.insert(
            config.site.root_url.clone(),
            root_page(&["/p/a.html", "/p/b.html", "/p/c.html"]),
        );
        pages.insert(
            "https://www.cyamoda.com/p/a.html".to_string(),
            detail_page("Camisa A", "SKU-A", "129.99"),
        );
        pages.insert(
            "https://www.cyamoda.com/p/b.html".to_string(),
            detail_page("Camisa B", "SKU-B", "89.50"),
        );
        pages.insert(
            "https://www.cyamoda.com/p/c.html".to_string(),
            detail_page("Camisa C", "SKU-C", "49.00"),
        );

        // Each render takes 5s against a 1s deadline, so the deadline expires
        // while the first detail page is still in flight
        let transport = Arc::new(SlowTransport {
            pages,
            delay: Duration::from_secs(5),
            renders_started: AtomicUsize::new(0),
        });

        let headers = Arc::new(HeaderProvider::from_fallback(&config.headers).unwrap());
        let controller =
            CrawlerController::assemble(config.clone(), transport.clone(), headers).unwrap();

        let summary = controller.run().await.unwrap();

        // Root plus the one in-flight detail page; the pages still queued
        // behind the concurrency limit never start a render
        assert_eq!(transport.renders_started.load(Ordering::SeqCst), 2);
        assert_eq!(summary.records_written, 1);
        assert_eq!(summary.skipped, 2);
        assert_eq!(summary.abandoned, 0);
    }

    #[tokio::test]
    async fn root_fetch_failure_is_fatal() {
        let dir = tempdir().unwrap();

        let mut config = CrawlerConfig::default();
        config.crawl.max_retries = 0;
        config.crawl.retry_backoff_ms = 1;
        config.output.path = dir.path().join("products.csv");

        let headers = Arc::new(HeaderProvider::from_fallback(&config.headers).unwrap());
        let controller = CrawlerController::assemble(
            config,
            Arc::new(SiteTransport {
                pages: HashMap::new(),
            }),
            headers,
        )
        .unwrap();

        let err = controller.run().await.unwrap_err();
        assert!(err.to_string().contains("Root fetch failed"));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_root_with_rotation_enabled_returns_cleanly() {
        let dir = tempdir().unwrap();

        let mut config = CrawlerConfig::default();
        config.crawl.max_retries = 0;
        config.crawl.retry_backoff_ms = 1;
        config.proxy.enabled = true;
        config.output.path = dir.path().join("products.csv");

        let headers = Arc::new(HeaderProvider::from_fallback(&config.headers).unwrap());
        let controller = CrawlerController::assemble(
            config,
            Arc::new(SiteTransport {
                pages: HashMap::new(),
            }),
            headers,
        )
        .unwrap();

        let err = controller.run().await.unwrap_err();
        assert!(err.to_string().contains("Root fetch failed"));

        // No crawl-lifetime task is left behind to wake up later
        tokio::time::advance(Duration::from_secs(120)).await;
        tokio::task::yield_now().await;
    }
}
