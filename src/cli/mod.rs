pub mod commands;
pub mod config;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::info;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Log at debug level
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Also write logs to this file
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Crawl a site from a seed URL
    Crawl {
        /// Seed URL to start crawling from
        #[arg(required = true)]
        url: String,

        /// Configuration profile to use, the default configuration otherwise
        #[arg(short, long)]
        profile: Option<String>,

        /// Maximum follow-link depth, 0 for unlimited
        #[arg(short, long)]
        depth: Option<u32>,

        /// Requests dispatched per second
        #[arg(short, long)]
        speed: Option<f64>,

        /// Run on the redis bus so remote agents can share the work
        #[arg(long)]
        distributed: bool,
    },

    /// Run a download agent on the redis bus
    Agent {
        /// Configuration profile to use
        #[arg(short, long)]
        profile: Option<String>,
    },

    /// Run the statistics service and agent center on the redis bus
    Center {
        /// Configuration profile to use
        #[arg(short, long)]
        profile: Option<String>,
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
}

/// Parse command line arguments
pub fn parse_args() -> Cli {
    Cli::parse()
}

/// Process the command
pub async fn process_command(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Crawl { url, profile, depth, speed, distributed } => {
            info!("Starting crawl on {}", url);
            commands::crawl(url, profile, depth, speed, distributed).await
        },
        Commands::Agent { profile } => {
            info!("Starting agent");
            commands::agent(profile).await
        },
        Commands::Center { profile } => {
            info!("Starting agent center");
            commands::center(profile).await
        },
        Commands::Config { profile, list } => {
            if list {
                info!("Listing all configuration profiles");
                commands::list_profiles().await
            } else if let Some(profile_name) = profile {
                info!("Managing configuration profile: {}", profile_name);
                commands::manage_profile(profile_name).await
            } else {
                info!("Showing current configuration");
                commands::show_config().await
            }
        },
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

    #[test]
    fn test_parse_crawl() {
        let cli = Cli::try_parse_from([
            "spider", "crawl", "http://example.test/", "--depth", "2", "--speed", "5", "--distributed", "-v",
        ])
        .unwrap();
        assert!(cli.verbose);
        match cli.command {
            Commands::Crawl { url, profile, depth, speed, distributed } => {
                assert_eq!(url, "http://example.test/");
                assert_eq!(profile, None);
                assert_eq!(depth, Some(2));
                assert_eq!(speed, Some(5.0));
                assert!(distributed);
            }
            _ => panic!("expected crawl"),
        }
    }
}
