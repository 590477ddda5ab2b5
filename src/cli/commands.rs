use anyhow::{Result, Context};
use std::path::PathBuf;
use tracing::{info, warn};

use crate::cli::config::CrawlerConfig;
use crate::crawler::controller::CrawlerController;
use crate::proxy;

/// Load either a named profile or the default configuration
fn load_config(profile: Option<&str>) -> Result<CrawlerConfig> {
    match profile {
        Some(name) => CrawlerConfig::load_profile(name)
            .context(format!("Failed to load profile: {}", name)),
        None => CrawlerConfig::load_default(),
    }
}

/// Run a crawl and print the resulting summary
pub async fn crawl(
    url: Option<String>,
    profile: Option<String>,
    limit: Option<usize>,
    output: Option<PathBuf>,
    timeout: Option<u64>,
) -> Result<()> {
    let mut config = load_config(profile.as_deref())?;

    // Override configuration with command line parameters if provided
    if let Some(url) = url {
        config.site.root_url = url;
    }

    if let Some(limit) = limit {
        config.crawl.max_products = Some(limit);
    }

    if let Some(output) = output {
        config.output.path = output;
    }

    if let Some(timeout) = timeout {
        config.crawl.crawl_timeout_secs = Some(timeout);
    }

    let output_path = config.output.path.clone();

    let controller = CrawlerController::new(config).await?;
    let summary = controller.run().await?;

    println!("Crawl ID: {}", summary.crawl_id);
    println!("Started: {}", summary.started_at);
    println!("Discovered: {} detail pages", summary.discovered);
    println!("Written: {} records", summary.records_written);
    println!(
        "Dropped: {} (extraction {}, normalization {})",
        summary.dropped_extract + summary.dropped_normalize,
        summary.dropped_extract,
        summary.dropped_normalize,
    );
    println!("Abandoned: {} pages", summary.abandoned);
    if summary.skipped > 0 {
        println!("Skipped: {} pages (crawl stopped early)", summary.skipped);
    }
    println!("Retries: {}", summary.retries);
    println!("Elapsed: {} ms", summary.elapsed_ms);

    info!("Dataset written to: {}", output_path.display());

    Ok(())
}

/// Probe the proxy pool and print per-entry health
pub async fn check_proxies(profile: Option<String>, probe_url: String) -> Result<()> {
    let config = load_config(profile.as_deref())?;

    if config.proxy.proxy_list.is_empty() {
        warn!("No proxies configured");
        return Ok(());
    }

    let report = proxy::manager::check_pool(&config.proxy, &probe_url).await?;

    let working = report.iter().filter(|h| h.working).count();
    println!("Proxy pool health ({}/{} working):", working, report.len());
    for health in &report {
        let status = if health.working { "ok" } else { "failed" };
        println!("  {:<24} {}", health.address, status);
    }

    Ok(())
}

/// List all available configuration profiles
pub fn list_profiles() -> Result<()> {
    let profiles = CrawlerConfig::list_profiles()?;

    println!("Available configuration profiles:");
    for profile in profiles {
        println!("  - {}", profile);
    }

    Ok(())
}

/// Manage a specific configuration profile
pub fn manage_profile(profile_name: String) -> Result<()> {
    // Load the profile if it exists
    match CrawlerConfig::load_profile(&profile_name) {
        Ok(config) => {
            // Display the configuration
            println!("Profile: {}", profile_name);
            println!("{:#?}", config);
        }
        Err(_) => {
            // Profile doesn't exist, create a new one
            warn!(
                "Profile '{}' does not exist. Creating a default profile.",
                profile_name
            );
            let config = CrawlerConfig::default();
            config.save_as_profile(&profile_name)?;
            println!("Created default profile: {}", profile_name);
        }
    }

    Ok(())
}

/// Show the current configuration
pub fn show_config() -> Result<()> {
    let config = CrawlerConfig::load_default()?;
    println!("Current configuration:");
    println!("{:#?}", config);

    Ok(())
}
