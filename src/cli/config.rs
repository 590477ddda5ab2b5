use anyhow::{Result, Context};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::fs;
use tracing::{info, debug, error};

/// Main configuration structure
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct CrawlerConfig {
    pub crawl: CrawlSettings,
    pub site: SiteSettings,
    pub render: RenderSettings,
    pub proxy: ProxySettings,
    pub headers: HeaderProviderSettings,
    pub output: OutputSettings,
}

/// Crawl orchestration settings
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct CrawlSettings {
    /// Maximum number of detail pages rendered concurrently
    pub concurrency: usize,
    /// Retries per task before it is abandoned
    pub max_retries: u32,
    /// Base backoff between retries in milliseconds
    pub retry_backoff_ms: u64,
    /// Overall crawl deadline in seconds (None = unbounded)
    pub crawl_timeout_secs: Option<u64>,
    /// How long in-flight fetches may drain after the deadline
    pub drain_grace_secs: u64,
    /// Cap on the number of detail pages to process (None = all discovered)
    pub max_products: Option<usize>,
}

/// Target-site settings: where to start and what the pages look like.
/// Selectors live here so the parsing stages stay testable against fixtures.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SiteSettings {
    /// Catalog root URL, the single entry point of a crawl
    pub root_url: String,
    /// Origin used to resolve relative product links
    pub origin: String,
    /// CSS selector matching product anchors on the root page
    pub product_link_selector: String,
    /// CSS selector matching the embedded JSON-LD block on detail pages
    pub structured_data_selector: String,
    pub url_patterns: UrlPatterns,
}

/// URL pattern settings
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct UrlPatterns {
    pub include: Vec<String>,
    pub exclude: Vec<String>,
}

/// Headless rendering settings
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RenderSettings {
    /// WebDriver endpoint, e.g. a local chromedriver
    pub webdriver_url: String,
    pub headless: bool,
    /// How long a wait-for-selector step may block, in seconds
    pub wait_timeout_secs: u64,
    /// Settle delay after the root-page scroll, in seconds
    pub settle_secs: u64,
    pub page_load_timeout_secs: u64,
    /// Content signatures that indicate the requester has been blocked
    pub ban_markers: Vec<String>,
}

/// Proxy pool settings
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ProxySettings {
    pub enabled: bool,
    /// Seconds a banned proxy sits out before it re-enters rotation
    pub cooldown_secs: u64,
    /// Egress addresses as host:port strings
    pub proxy_list: Vec<String>,
}

/// Header rotation settings. The remote endpoint is an external collaborator
/// returning browser header sets; the fallback pool is used when it is
/// unconfigured or unreachable.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct HeaderProviderSettings {
    pub endpoint: Option<String>,
    pub api_key: Option<String>,
    pub num_results: usize,
    pub fallback_user_agents: Vec<String>,
}

/// Output settings
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct OutputSettings {
    /// Path of the CSV dataset
    pub path: PathBuf,
}

impl Default for CrawlerConfig {
    fn default() -> Self {
        Self {
            crawl: CrawlSettings {
                concurrency: 16,
                max_retries: 3,
                retry_backoff_ms: 1000,
                crawl_timeout_secs: None,
                drain_grace_secs: 60,
                max_products: None,
            },
            site: SiteSettings {
                root_url: "https://www.cyamoda.com/todos-los-productos/?start=0&sz=264&grid-view=grid-2".to_string(),
                origin: "https://www.cyamoda.com".to_string(),
                product_link_selector: ".pdp-link a".to_string(),
                structured_data_selector: "script[type='application/ld+json']".to_string(),
                url_patterns: UrlPatterns {
                    include: vec![],
                    exclude: vec![],
                },
            },
            render: RenderSettings {
                webdriver_url: "http://localhost:4444".to_string(),
                headless: true,
                wait_timeout_secs: 60,
                settle_secs: 30,
                page_load_timeout_secs: 90,
                ban_markers: vec![
                    "captcha".to_string(),
                    "access denied".to_string(),
                    "unusual traffic".to_string(),
                ],
            },
            proxy: ProxySettings {
                enabled: false,
                cooldown_secs: 300,
                proxy_list: vec![
                    "187.188.169.169:8080".to_string(),
                    "177.229.210.66:8080".to_string(),
                    "201.77.110.129:999".to_string(),
                    "200.39.120.45:999".to_string(),
                    "45.231.170.137:999".to_string(),
                    "189.240.60.168:9090".to_string(),
                ],
            },
            headers: HeaderProviderSettings {
                endpoint: None,
                api_key: None,
                num_results: 50,
                fallback_user_agents: vec![
                    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36".to_string(),
                    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36".to_string(),
                    "Mozilla/5.0 (X11; Linux x86_64; rv:121.0) Gecko/20100101 Firefox/121.0".to_string(),
                ],
            },
            output: OutputSettings {
                path: PathBuf::from("products.csv"),
            },
        }
    }
}

impl CrawlerConfig {
    /// Get the path to the config directory
    fn config_dir() -> PathBuf {
        let mut path = if let Some(proj_dirs) = directories::ProjectDirs::from("com", "catalog-crawler", "catalog-crawler") {
            proj_dirs.config_dir().to_path_buf()
        } else {
            PathBuf::from("./config")
        };

        // Create the sites directory if it doesn't exist
        path.push("sites");
        if !path.exists() {
            if let Err(e) = fs::create_dir_all(&path) {
                error!("Failed to create config directory: {}", e);
            }
        }

        // Move back up to the config directory
        path.pop();
        path
    }

    /// Load the default configuration
    pub fn load_default() -> Result<Self> {
        let config_dir = Self::config_dir();
        let config_path = config_dir.join("default.yaml");

        if config_path.exists() {
            Self::load_from_file(&config_path)
        } else {
            // Create and save the default configuration
            info!("Default configuration not found. Creating...");
            let config = Self::default();
            config.save_as_default()?;
            Ok(config)
        }
    }

    /// Load a configuration profile
    pub fn load_profile(profile: &str) -> Result<Self> {
        let config_dir = Self::config_dir();
        let profile_path = config_dir.join("sites").join(format!("{}.yaml", profile));

        if profile_path.exists() {
            Self::load_from_file(&profile_path)
        } else {
            anyhow::bail!("Profile '{}' not found", profile)
        }
    }

    /// Load configuration from a file
    fn load_from_file(path: &Path) -> Result<Self> {
        debug!("Loading configuration from: {}", path.display());
        let contents = fs::read_to_string(path)
            .context(format!("Failed to read configuration file: {}", path.display()))?;

        let config: Self = serde_yaml::from_str(&contents)
            .context(format!("Failed to parse configuration file: {}", path.display()))?;

        Ok(config)
    }

    /// Save the configuration as the default
    pub fn save_as_default(&self) -> Result<()> {
        let config_dir = Self::config_dir();
        let config_path = config_dir.join("default.yaml");

        self.save_to_file(&config_path)
    }

    /// Save the configuration as a profile
    pub fn save_as_profile(&self, profile: &str) -> Result<()> {
        let config_dir = Self::config_dir();
        let sites_dir = config_dir.join("sites");

        // Create the sites directory if it doesn't exist
        if !sites_dir.exists() {
            fs::create_dir_all(&sites_dir)
                .context(format!("Failed to create sites directory: {}", sites_dir.display()))?;
        }

        let profile_path = sites_dir.join(format!("{}.yaml", profile));
        self.save_to_file(&profile_path)
    }

    /// Save the configuration to a file
    fn save_to_file(&self, path: &Path) -> Result<()> {
        debug!("Saving configuration to: {}", path.display());

        // Create parent directory if it doesn't exist
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                fs::create_dir_all(parent)
                    .context(format!("Failed to create directory: {}", parent.display()))?;
            }
        }

        let contents = serde_yaml::to_string(self)
            .context("Failed to serialize configuration")?;

        fs::write(path, contents)
            .context(format!("Failed to write configuration file: {}", path.display()))?;

        Ok(())
    }

    /// List all available profiles
    pub fn list_profiles() -> Result<Vec<String>> {
        let config_dir = Self::config_dir();
        let sites_dir = config_dir.join("sites");

        if !sites_dir.exists() {
            return Ok(vec![]);
        }

        let mut profiles = Vec::new();

        for entry in fs::read_dir(sites_dir)? {
            let entry = entry?;
            let path = entry.path();

            if path.is_file() && path.extension().map_or(false, |ext| ext == "yaml") {
                if let Some(stem) = path.file_stem() {
                    if let Some(name) = stem.to_str() {
                        profiles.push(name.to_string());
                    }
                }
            }
        }

        Ok(profiles)
    }
}
