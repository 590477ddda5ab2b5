use async_trait::async_trait;
use thirtyfour::prelude::*;
use thirtyfour::error::WebDriverError;
use thirtyfour::ChromeCapabilities;
use thiserror::Error;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, error};

use crate::browser::headers::HeaderSet;
use crate::browser::script::{RenderPlan, RenderStep};
use crate::cli::config::RenderSettings;
use crate::proxy::ProxyEntry;

/// A fully rendered page snapshot
#[derive(Debug, Clone)]
pub struct RenderedPage {
    pub html: String,
    pub status: u16,
    pub elapsed_ms: u64,
}

/// Transport-level failures, before any ban heuristic is applied
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Render wait timed out on selector: {0}")]
    Timeout(String),

    #[error("Transport failure: {0}")]
    Network(String),
}

/// A browser-backed page renderer. The crawl pipeline only depends on this
/// trait, so tests substitute a fake renderer for the real WebDriver.
#[async_trait]
pub trait RenderTransport: Send + Sync {
    async fn render(
        &self,
        url: &str,
        plan: &RenderPlan,
        proxy: Option<&ProxyEntry>,
        headers: &HeaderSet,
    ) -> Result<RenderedPage, TransportError>;
}

/// WebDriver-backed transport. Each request gets a fresh browser session so
/// the proxy and header identity can change between requests.
pub struct WebDriverTransport {
    config: RenderSettings,
}

impl WebDriverTransport {
    /// Create a new transport against the configured WebDriver endpoint
    pub fn new(config: RenderSettings) -> Self {
        Self { config }
    }

    /// Build browser capabilities for one request identity
    fn build_capabilities(
        &self,
        proxy: Option<&ProxyEntry>,
        headers: &HeaderSet,
    ) -> Result<ChromeCapabilities, TransportError> {
        let mut caps = DesiredCapabilities::chrome();

        // Set user agent
        caps.add_chrome_arg(&format!("--user-agent={}", headers.user_agent))
            .map_err(transport_failure)?;

        // Set language from the header set where present
        if let Some(accept_language) = headers.headers.get("Accept-Language") {
            let lang = accept_language.split(',').next().unwrap_or("en-US");
            caps.add_chrome_arg(&format!("--lang={}", lang))
                .map_err(transport_failure)?;
        }

        // Set headless mode if configured
        if self.config.headless {
            caps.set_headless().map_err(transport_failure)?;
        }

        // Route the session through the selected proxy
        if let Some(proxy) = proxy {
            caps.add_chrome_arg(&format!("--proxy-server=http://{}", proxy.address))
                .map_err(transport_failure)?;
        }

        // Mask the automation fingerprint
        caps.add_chrome_arg("--disable-blink-features=AutomationControlled")
            .map_err(transport_failure)?;
        caps.add_chrome_arg("--disable-dev-shm-usage")
            .map_err(transport_failure)?;
        caps.add_chrome_option("excludeSwitches", serde_json::json!(["enable-automation"]))
            .map_err(transport_failure)?;
        caps.add_chrome_option("useAutomationExtension", serde_json::json!(false))
            .map_err(transport_failure)?;

        Ok(caps)
    }

    /// Navigate and execute the render script, returning the DOM snapshot
    async fn run_plan(
        &self,
        driver: &WebDriver,
        url: &str,
        plan: &RenderPlan,
    ) -> Result<(String, u16), TransportError> {
        debug!("Navigating to: {}", url);
        driver.goto(url).await.map_err(transport_failure)?;

        for step in &plan.steps {
            match step {
                RenderStep::WaitForSelector { selector, timeout } => {
                    driver
                        .query(By::Css(selector))
                        .wait(*timeout, Duration::from_millis(250))
                        .first()
                        .await
                        .map_err(|_| TransportError::Timeout(selector.clone()))?;
                }
                RenderStep::ScrollToBottom => {
                    driver
                        .execute("window.scrollBy(0, document.body.scrollHeight);", Vec::new())
                        .await
                        .map_err(transport_failure)?;
                }
                RenderStep::Settle(delay) => {
                    debug!("Settling for {:?} before snapshot", delay);
                    sleep(*delay).await;
                }
            }
        }

        let html = driver.source().await.map_err(transport_failure)?;
        let status = self.response_status(driver).await.unwrap_or(200);

        Ok((html, status))
    }

    /// Read the navigation status code where the browser exposes it.
    /// Older engines lack `responseStatus`, in which case ban detection
    /// relies on the content markers instead.
    async fn response_status(&self, driver: &WebDriver) -> Option<u16> {
        let ret = driver
            .execute(
                "const e = performance.getEntriesByType('navigation')[0]; \
                 return (e && e.responseStatus) || 0;",
                Vec::new(),
            )
            .await
            .ok()?;

        let status: u64 = ret.convert().ok()?;
        if (100..600).contains(&status) {
            Some(status as u16)
        } else {
            None
        }
    }
}

#[async_trait]
impl RenderTransport for WebDriverTransport {
    async fn render(
        &self,
        url: &str,
        plan: &RenderPlan,
        proxy: Option<&ProxyEntry>,
        headers: &HeaderSet,
    ) -> Result<RenderedPage, TransportError> {
        let started = Instant::now();

        let caps = self.build_capabilities(proxy, headers)?;

        let driver = WebDriver::new(&self.config.webdriver_url, caps)
            .await
            .map_err(transport_failure)?;

        driver
            .set_page_load_timeout(Duration::from_secs(self.config.page_load_timeout_secs))
            .await
            .map_err(transport_failure)?;

        let result = self.run_plan(&driver, url, plan).await;

        // Always release the browser, even when the plan failed
        if let Err(e) = driver.quit().await {
            error!("Error closing browser session: {}", e);
        }

        let (html, status) = result?;

        Ok(RenderedPage {
            html,
            status,
            elapsed_ms: started.elapsed().as_millis() as u64,
        })
    }
}

fn transport_failure(e: WebDriverError) -> TransportError {
    TransportError::Network(e.to_string())
}
