pub mod commands;
pub mod config;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Write logs to this file in addition to the console
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Crawl the catalog and write the product dataset
    Crawl {
        /// Override the configured catalog root URL
        #[arg(short, long)]
        url: Option<String>,

        /// Site profile to use (defaults to the default configuration)
        #[arg(short, long)]
        profile: Option<String>,

        /// Maximum number of detail pages to process
        #[arg(short, long)]
        limit: Option<usize>,

        /// Output CSV path
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Overall crawl deadline in seconds
        #[arg(short, long)]
        timeout: Option<u64>,
    },

    /// Manage configuration profiles
    Config {
        /// Profile name to manage
        #[arg(required = false)]
        profile: Option<String>,

        /// List all available profiles
        #[arg(short, long)]
        list: bool,
    },

    /// Probe the configured proxy pool and report which entries answer
    Proxies {
        /// Site profile to read the pool from
        #[arg(short, long)]
        profile: Option<String>,

        /// URL to probe through each proxy
        #[arg(long, default_value = "https://www.google.com")]
        probe_url: String,
    },
}

/// Parse command line arguments
pub fn parse_args() -> Cli {
    Cli::parse()
}

/// Process the command
pub async fn process_command(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Crawl {
            url,
            profile,
            limit,
            output,
            timeout,
        } => {
            info!("Starting catalog crawl");
            commands::crawl(url, profile, limit, output, timeout).await
        }
        Commands::Config { profile, list } => {
            if list {
                info!("Listing all configuration profiles");
                commands::list_profiles()
            } else if let Some(profile_name) = profile {
                info!("Managing configuration profile: {}", profile_name);
                commands::manage_profile(profile_name)
            } else {
                info!("Showing current configuration");
                commands::show_config()
            }
        }
        Commands::Proxies { profile, probe_url } => {
            info!("Probing configured proxy pool");
            commands::check_proxies(profile, probe_url).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_cli() {
        use clap::CommandFactory;
        Cli::command().debug_assert()
    }
}
