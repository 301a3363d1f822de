use anyhow::Result;
use chrono::Utc;
use clap::{Parser, Subcommand};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod cache;
mod config;
mod context;
mod error;
mod http;
mod mock;
mod models;
mod providers;
mod recovery;
mod waybar;

use cache::CacheState;
use config::Config;
use context::FetchContext;
use http::{HttpTransport, ReqwestTransport};
use models::{Provider, UsageResult};
use providers::claude::ClaudeProvider;
use providers::codex::CodexProvider;
use providers::openrouter::OpenRouterProvider;
use providers::ProviderFetcher;

#[derive(Parser)]
#[command(name = "usage-bar")]
#[command(about = "Monitor API quota/usage for AI coding tools")]
struct Cli {
    /// Debug logging on stderr
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print JSON for Waybar (uses the cache while it is fresh)
    Waybar {
        /// Use mock data instead of real providers
        #[arg(long)]
        mock: bool,
    },
    /// Print all provider status to terminal
    Status,
    /// Force fetch and update cache
    Fetch,
    /// Remove cached usage data
    ClearCache,
    /// Run provider login flows and clear the cache
    RecoverAuth,
}

fn setup_logging(verbose: bool) {
    // stdout belongs to Waybar
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if verbose {
            EnvFilter::new("usage_bar=debug")
        } else {
            EnvFilter::new("usage_bar=warn")
        }
    });

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_target(false)
                .without_time()
                .with_writer(std::io::stderr),
        )
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    let config = Config::load().unwrap_or_else(|err| {
        warn!(error = ?err, "using default config");
        Config::default()
    });
    let cache_path = CacheState::cache_path();

    match cli.command {
        Commands::Waybar { mock } => {
            let results = if mock {
                mock::mock_results(Utc::now())
            } else {
                cached_or_fetch(&config, &cache_path).await
            };
            let output = waybar::format(&results, Utc::now());
            println!("{}", serde_json::to_string(&output)?);
        }
        Commands::Status => {
            let results = cached_or_fetch(&config, &cache_path).await;
            println!("{}", waybar::format_status(&results, Utc::now()));
        }
        Commands::Fetch => {
            let results = fetch_and_save(&config, &cache_path).await;
            println!("{}", waybar::format_status(&results, Utc::now()));
        }
        Commands::ClearCache => {
            CacheState::clear(&cache_path)?;
            println!("Cache cleared.");
        }
        Commands::RecoverAuth => {
            let mut stdout = std::io::stdout();
            recovery::run_auth_recovery(
                &mut stdout,
                &recovery::SystemExecutor,
                || CacheState::clear(&cache_path),
                recovery::DEFAULT_TARGETS,
            )?;
        }
    }

    Ok(())
}

async fn cached_or_fetch(config: &Config, cache_path: &Path) -> Vec<UsageResult> {
    if let Some(results) = CacheState::load_fresh(cache_path, config.cache_ttl(), Utc::now()) {
        debug!(path = %cache_path.display(), "using cached results");
        return results;
    }
    fetch_and_save(config, cache_path).await
}

async fn fetch_and_save(config: &Config, cache_path: &Path) -> Vec<UsageResult> {
    let providers = build_providers(config);
    let ctx = FetchContext::background();

    // Ctrl-C abandons in-flight requests instead of waiting out the timeout
    let canceller = ctx.clone();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            canceller.cancel();
        }
    });

    let results = providers::fetch_all(&ctx, &providers, config.provider_timeout()).await;
    interrupt.abort();

    if let Err(err) = CacheState::new(results.clone()).save_to(cache_path) {
        warn!(error = ?err, "failed to save cache");
    }
    results
}

fn build_providers(config: &Config) -> Vec<Box<dyn ProviderFetcher>> {
    let http: Arc<dyn HttpTransport> = Arc::new(ReqwestTransport::new());

    Provider::ALL
        .into_iter()
        .filter(|provider| {
            let enabled = config.is_provider_enabled(*provider);
            if !enabled {
                debug!(provider = provider.display_name(), "disabled in config");
            }
            enabled
        })
        .map(|provider| -> Box<dyn ProviderFetcher> {
            let credentials_path = config.credentials_path(provider);
            match provider {
                Provider::Claude => {
                    let mut claude = ClaudeProvider::new(http.clone());
                    if let Some(path) = credentials_path {
                        claude = claude.with_credentials_path(path);
                    }
                    Box::new(claude)
                }
                Provider::Codex => {
                    let mut codex = CodexProvider::new(http.clone());
                    if let Some(path) = credentials_path {
                        codex = codex.with_credentials_path(path);
                    }
                    Box::new(codex)
                }
                // keyed by environment, there is no credential file
                Provider::OpenRouter => Box::new(OpenRouterProvider::from_env(http.clone())),
            }
        })
        .collect()
}
