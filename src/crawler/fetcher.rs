use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::browser::headers::HeaderProvider;
use crate::browser::script::RenderPlan;
use crate::browser::session::{RenderTransport, RenderedPage, TransportError};
use crate::cli::config::{CrawlSettings, RenderSettings, SiteSettings};
use crate::crawler::task::{CrawlTask, FetchError, FetchResult};
use crate::proxy::ProxyRotator;

/// Render fetcher: navigates one task through the browser transport with a
/// rotating proxy/header identity, detects bans, and retries with a fresh
/// identity up to a bounded count. Every fetch holds one slot of the global
/// concurrency limiter for its whole lifetime, retries included.
pub struct RenderFetcher {
    transport: Arc<dyn RenderTransport>,

    /// Shared proxy pool; None disables proxying entirely
    rotator: Option<Arc<ProxyRotator>>,

    /// Shared header pool
    headers: Arc<HeaderProvider>,

    /// Global fetch concurrency limiter
    limiter: Arc<Semaphore>,

    site: SiteSettings,
    render: RenderSettings,

    max_retries: u32,
    backoff: Duration,

    /// Total retry attempts across the crawl, for the final summary
    retries: AtomicUsize,
}

impl RenderFetcher {
    pub fn new(
        transport: Arc<dyn RenderTransport>,
        rotator: Option<Arc<ProxyRotator>>,
        headers: Arc<HeaderProvider>,
        site: SiteSettings,
        render: RenderSettings,
        crawl: &CrawlSettings,
    ) -> Self {
        Self {
            transport,
            rotator,
            headers,
            limiter: Arc::new(Semaphore::new(crawl.concurrency)),
            site,
            render,
            max_retries: crawl.max_retries,
            backoff: Duration::from_millis(crawl.retry_backoff_ms),
            retries: AtomicUsize::new(0),
        }
    }

    /// Reserve a fetch slot. Split from `fetch` so callers can notice a
    /// stopped crawl between the wait for a slot and the render it would
    /// trigger.
    pub async fn reserve(&self, url: &str) -> Result<OwnedSemaphorePermit, FetchError> {
        self.limiter
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| FetchError::Network {
                url: url.to_string(),
                reason: "concurrency limiter closed".to_string(),
            })
    }

    /// Fetch a task, rotating identity between attempts
    pub async fn fetch(&self, task: &CrawlTask) -> Result<FetchResult, FetchError> {
        let permit = self.reserve(&task.url).await?;
        self.fetch_reserved(task, permit).await
    }

    /// Fetch with an already reserved slot, held across retries
    pub async fn fetch_reserved(
        &self,
        task: &CrawlTask,
        permit: OwnedSemaphorePermit,
    ) -> Result<FetchResult, FetchError> {
        let _permit = permit;
        let mut attempt = 0u32;

        loop {
            match self.attempt(task).await {
                Ok(result) => return Ok(result),

                // No proxy left means no forward progress; never retried
                Err(FetchError::Pool(e)) => return Err(FetchError::Pool(e)),

                Err(e) if attempt < self.max_retries => {
                    attempt += 1;
                    self.retries.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        "Fetch attempt {}/{} failed for {}: {}",
                        attempt, self.max_retries, task.url, e
                    );

                    // Bans rotate to a fresh identity immediately; transient
                    // transport errors back off first
                    if !matches!(e, FetchError::Banned { .. }) {
                        sleep(self.backoff * attempt).await;
                    }
                }

                Err(e) => return Err(e),
            }
        }
    }

    /// One render attempt with a freshly rotated proxy/header pair
    async fn attempt(&self, task: &CrawlTask) -> Result<FetchResult, FetchError> {
        let proxy = match &self.rotator {
            Some(rotator) => Some(rotator.next().await?),
            None => None,
        };
        let headers = self.headers.pick();
        let plan = RenderPlan::for_task(task, &self.site, &self.render);

        debug!(
            "Rendering {} via {}",
            task.url,
            proxy.as_ref().map_or("direct connection", |p| p.address.as_str())
        );

        let page = self
            .transport
            .render(&task.url, &plan, proxy.as_ref(), &headers)
            .await
            .map_err(|e| match e {
                TransportError::Timeout(_) => FetchError::Timeout {
                    url: task.url.clone(),
                },
                TransportError::Network(reason) => FetchError::Network {
                    url: task.url.clone(),
                    reason,
                },
            })?;

        if let Some(reason) = self.ban_reason(&page) {
            if let (Some(rotator), Some(entry)) = (&self.rotator, proxy.as_ref()) {
                rotator.report_banned(entry).await;
            }
            return Err(FetchError::Banned {
                url: task.url.clone(),
                reason,
            });
        }

        Ok(FetchResult {
            url: task.url.clone(),
            html: page.html,
            status: page.status,
            proxy_used: proxy.map(|p| p.address),
            elapsed_ms: page.elapsed_ms,
        })
    }

    /// Ban heuristic: blocking status codes or content signatures
    fn ban_reason(&self, page: &RenderedPage) -> Option<String> {
        if page.status == 403 || page.status == 429 {
            return Some(format!("status {}", page.status));
        }

        let lowered = page.html.to_lowercase();
        self.render
            .ban_markers
            .iter()
            .find(|marker| lowered.contains(&marker.to_lowercase()))
            .map(|marker| format!("content marker '{}'", marker))
    }

    /// Total retry attempts so far
    pub fn retry_total(&self) -> usize {
        self.retries.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use crate::browser::headers::HeaderSet;
    use crate::cli::config::CrawlerConfig;
    use crate::proxy::ProxyEntry;

    /// Scripted transport: plays back a queue of responses and records which
    /// proxy served each request.
    struct FakeTransport {
        responses: Mutex<VecDeque<Result<RenderedPage, TransportError>>>,
        proxies_seen: Mutex<Vec<Option<String>>>,
    }

    impl FakeTransport {
        fn new(responses: Vec<Result<RenderedPage, TransportError>>) -> Self {
            Self {
                responses: Mutex::new(responses.into()),
                proxies_seen: Mutex::new(Vec::new()),
            }
        }

        fn page(html: &str, status: u16) -> RenderedPage {
            RenderedPage {
                html: html.to_string(),
                status,
                elapsed_ms: 5,
            }
        }
    }

    #[async_trait]
    impl RenderTransport for FakeTransport {
        async fn render(
            &self,
            _url: &str,
            _plan: &RenderPlan,
            proxy: Option<&ProxyEntry>,
            _headers: &HeaderSet,
        ) -> Result<RenderedPage, TransportError> {
            self.proxies_seen
                .lock()
                .unwrap()
                .push(proxy.map(|p| p.address.clone()));

            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(TransportError::Network("script exhausted".to_string())))
        }
    }

    fn make_fetcher(
        transport: Arc<FakeTransport>,
        rotator: Option<Arc<ProxyRotator>>,
    ) -> RenderFetcher {
        let config = CrawlerConfig::default();
        let headers = Arc::new(HeaderProvider::from_fallback(&config.headers).unwrap());

        RenderFetcher::new(
            transport,
            rotator,
            headers,
            config.site.clone(),
            config.render.clone(),
            &config.crawl,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn transient_network_failure_is_retried() {
        let transport = Arc::new(FakeTransport::new(vec![
            Err(TransportError::Network("connection reset".to_string())),
            Ok(FakeTransport::page("<html>ok</html>", 200)),
        ]));

        let fetcher = make_fetcher(transport.clone(), None);
        let task = CrawlTask::detail("https://www.cyamoda.com/p/1.html");

        let result = fetcher.fetch(&task).await.unwrap();
        assert_eq!(result.html, "<html>ok</html>");
        assert_eq!(result.proxy_used, None);
        assert_eq!(fetcher.retry_total(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_are_bounded() {
        let transport = Arc::new(FakeTransport::new(vec![]));
        let fetcher = make_fetcher(transport.clone(), None);
        let task = CrawlTask::detail("https://www.cyamoda.com/p/1.html");

        let err = fetcher.fetch(&task).await.unwrap_err();
        assert!(matches!(err, FetchError::Network { .. }));

        // max_retries = 3 means 4 attempts total
        assert_eq!(transport.proxies_seen.lock().unwrap().len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn banned_response_rotates_proxy_and_reports_ban() {
        let transport = Arc::new(FakeTransport::new(vec![
            Ok(FakeTransport::page("<html>Access Denied</html>", 200)),
            Ok(FakeTransport::page("<html>ok</html>", 200)),
        ]));

        let rotator = Arc::new(ProxyRotator::new(
            vec!["10.0.0.1:8080".to_string(), "10.0.0.2:8080".to_string()],
            Duration::from_secs(300),
        ));

        let fetcher = make_fetcher(transport.clone(), Some(rotator.clone()));
        let task = CrawlTask::detail("https://www.cyamoda.com/p/1.html");

        let result = fetcher.fetch(&task).await.unwrap();
        assert_eq!(result.html, "<html>ok</html>");

        // The banned proxy left the rotation and the retry used the other one
        assert_eq!(rotator.active_count().await, 1);
        let seen = transport.proxies_seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_ne!(seen[0], seen[1]);
    }

    #[tokio::test(start_paused = true)]
    async fn blocking_status_code_is_a_ban() {
        let transport = Arc::new(FakeTransport::new(vec![
            Ok(FakeTransport::page("<html></html>", 403)),
            Ok(FakeTransport::page("<html></html>", 429)),
            Ok(FakeTransport::page("<html>ok</html>", 200)),
        ]));

        let fetcher = make_fetcher(transport.clone(), None);
        let task = CrawlTask::detail("https://www.cyamoda.com/p/1.html");

        let result = fetcher.fetch(&task).await.unwrap();
        assert_eq!(result.status, 200);
        assert_eq!(fetcher.retry_total(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_pool_fails_without_retry() {
        let transport = Arc::new(FakeTransport::new(vec![]));
        let rotator = Arc::new(ProxyRotator::new(
            vec!["10.0.0.1:8080".to_string()],
            Duration::from_secs(300),
        ));
        let banned = rotator.next().await.unwrap();
        rotator.report_banned(&banned).await;

        let fetcher = make_fetcher(transport.clone(), Some(rotator));
        let task = CrawlTask::detail("https://www.cyamoda.com/p/1.html");

        let err = fetcher.fetch(&task).await.unwrap_err();
        assert!(matches!(err, FetchError::Pool(_)));
        assert!(transport.proxies_seen.lock().unwrap().is_empty());
    }
}
