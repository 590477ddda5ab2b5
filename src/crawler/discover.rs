use std::collections::HashSet;
use anyhow::Result;
use regex::Regex;
use scraper::{Html, Selector};
use url::Url;
use tracing::{debug, warn};

use crate::cli::config::SiteSettings;

/// Extracts product detail links from a rendered catalog root page.
/// Relative links resolve against the site origin; output is deduplicated by
/// exact URL string and preserves document order.
pub struct LinkDiscoverer {
    /// Compiled product-link selector
    selector: Selector,

    /// Base origin for resolving relative links
    base: Url,

    /// Compiled regex patterns for URL inclusion
    include_patterns: Vec<Regex>,

    /// Compiled regex patterns for URL exclusion
    exclude_patterns: Vec<Regex>,
}

impl LinkDiscoverer {
    /// Create a discoverer from the site settings
    pub fn new(site: &SiteSettings) -> Result<Self> {
        let selector = Selector::parse(&site.product_link_selector).map_err(|e| {
            anyhow::anyhow!(
                "Invalid product link selector '{}': {}",
                site.product_link_selector,
                e
            )
        })?;

        let base = Url::parse(&site.origin)
            .map_err(|e| anyhow::anyhow!("Invalid site origin '{}': {}", site.origin, e))?;

        let include_patterns = compile_patterns(&site.url_patterns.include);
        let exclude_patterns = compile_patterns(&site.url_patterns.exclude);

        Ok(Self {
            selector,
            base,
            include_patterns,
            exclude_patterns,
        })
    }

    /// Extract all product detail URLs from the rendered page
    pub fn discover(&self, html: &str) -> Vec<String> {
        let document = Html::parse_document(html);

        let mut seen = HashSet::new();
        let mut urls = Vec::new();

        for element in document.select(&self.selector) {
            let Some(href) = element.value().attr("href") else {
                continue;
            };

            // Absolute links pass through; relative ones resolve against the
            // site origin
            let resolved = match Url::parse(href) {
                Ok(url) => url,
                Err(_) => match self.base.join(href) {
                    Ok(url) => url,
                    Err(e) => {
                        debug!("Skipping unresolvable link '{}': {}", href, e);
                        continue;
                    }
                },
            };

            let url = resolved.to_string();

            if !self.passes_filters(&url) {
                continue;
            }

            if seen.insert(url.clone()) {
                urls.push(url);
            }
        }

        urls
    }

    /// Apply the configured include/exclude patterns
    fn passes_filters(&self, url: &str) -> bool {
        for pattern in &self.exclude_patterns {
            if pattern.is_match(url) {
                debug!("Skipping URL matching exclusion pattern: {}", url);
                return false;
            }
        }

        if !self.include_patterns.is_empty()
            && !self.include_patterns.iter().any(|p| p.is_match(url))
        {
            debug!("Skipping URL not matching any inclusion pattern: {}", url);
            return false;
        }

        true
    }
}

fn compile_patterns(patterns: &[String]) -> Vec<Regex> {
    patterns
        .iter()
        .filter_map(|pattern| match Regex::new(pattern) {
            Ok(regex) => Some(regex),
            Err(e) => {
                warn!("Invalid URL pattern '{}': {}", pattern, e);
                None
            }
        })
        .collect()
}
