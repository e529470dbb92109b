#![deny(unsafe_code)]

//! ctxpack CLI: runs collections against a project and manages the cache.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use ctxpack_config::AppConfig;
use ctxpack_core::{CollectOptions, CollectionResult, Collector, InjectionPolicy, ResultCache};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// ctxpack: relevance-ranked, token-budgeted project context.
#[derive(Parser)]
#[command(name = "ctxpack", version = ctxpack_core::build_info::VERSION, about, long_about = None)]
struct Cli {
    /// Path to configuration file.
    #[arg(short, long, default_value = "ctxpack.toml")]
    config: PathBuf,

    /// Increase log verbosity (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Collect context for a query.
    Collect {
        /// Natural-language query.
        query: String,

        /// Project root.
        #[arg(short, long, default_value = ".")]
        root: PathBuf,

        /// Token budget (defaults to `collector.default_max_tokens`).
        #[arg(long)]
        max_tokens: Option<u32>,

        /// Maximum number of files.
        #[arg(long)]
        max_files: Option<usize>,

        /// Maximum total content bytes.
        #[arg(long)]
        max_bytes: Option<u64>,

        /// Injection policy: full, selective, sectional, or minimal.
        #[arg(long)]
        policy: Option<InjectionPolicy>,

        /// Bypass the result cache.
        #[arg(long)]
        no_cache: bool,

        /// Print the full result as JSON.
        #[arg(long, conflicts_with = "content")]
        json: bool,

        /// Print file contents after the summary table.
        #[arg(long)]
        content: bool,
    },

    /// Inspect or clear the result cache.
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },

    /// Validate and display configuration.
    Config {
        /// Show the resolved configuration.
        #[arg(long)]
        show: bool,
    },
}

#[derive(Subcommand)]
enum CacheAction {
    /// Show entry count, size, and ceiling.
    Stats,
    /// Remove every cached result.
    Clear,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let (config, found) = load_config(&cli.config).await?;

    let filter = match cli.verbose {
        0 => config.logging.level.as_str(),
        1 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(std::io::stderr)
        .init();
    if !found {
        info!(path = %cli.config.display(), "Config file not found, using defaults");
    }

    match cli.command {
        Commands::Collect {
            query,
            root,
            max_tokens,
            max_files,
            max_bytes,
            policy,
            no_cache,
            json,
            content,
        } => {
            let options = CollectOptions {
                max_tokens,
                max_files,
                max_total_bytes: max_bytes,
                use_cache: !no_cache,
                policy,
            };
            let result = cmd_collect(root, query, options, config).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                print!("{}", render(&result, content));
            }
        }
        Commands::Cache { action } => cmd_cache(&config, action)?,
        Commands::Config { show } => cmd_config(&cli.config, &config, show)?,
    }

    Ok(())
}

async fn cmd_collect(
    root: PathBuf,
    query: String,
    options: CollectOptions,
    config: AppConfig,
) -> Result<CollectionResult> {
    // Collection is blocking filesystem and subprocess work.
    tokio::task::spawn_blocking(move || -> Result<CollectionResult> {
        let collector = Collector::new(&root, &config)?;
        Ok(collector.collect(&query, &options)?)
    })
    .await
    .context("collection task panicked")?
}

fn cmd_cache(config: &AppConfig, action: CacheAction) -> Result<()> {
    let Some(path) = config.cache.resolved_path() else {
        println!("Cache persistence is disabled; nothing on disk.");
        return Ok(());
    };
    let cache = ResultCache::from_config(&config.cache);
    match action {
        CacheAction::Stats => {
            let stats = cache.stats();
            println!("path:    {}", path.display());
            println!("entries: {}", stats.entries);
            println!("bytes:   {} / {}", stats.bytes, stats.max_bytes);
        }
        CacheAction::Clear => {
            let entries = cache.stats().entries;
            cache.clear();
            cache
                .persist()
                .with_context(|| format!("failed to write {}", path.display()))?;
            println!("Cleared {entries} entries from {}", path.display());
        }
    }
    Ok(())
}

fn cmd_config(config_path: &Path, config: &AppConfig, show: bool) -> Result<()> {
    if show {
        let toml_str = toml::to_string_pretty(config).context("TOML error")?;
        println!("{toml_str}");
    } else {
        println!("Configuration at '{}' is valid.", config_path.display());
    }
    Ok(())
}

/// Load and validate `path`, or fall back to defaults when it does not exist.
async fn load_config(path: &Path) -> Result<(AppConfig, bool)> {
    if tokio::fs::try_exists(path).await.unwrap_or(false) {
        let config = AppConfig::load(path)
            .await
            .with_context(|| format!("invalid configuration at '{}'", path.display()))?;
        Ok((config, true))
    } else {
        Ok((AppConfig::default(), false))
    }
}

fn render(result: &CollectionResult, with_content: bool) -> String {
    let meta = &result.metadata;
    let mut out = format!(
        "{} files, {}/{} tokens, {} scanned, {} excluded, {} ms{}{}\n",
        result.files.len(),
        meta.total_tokens,
        meta.max_tokens,
        meta.files_scanned,
        meta.excluded_count,
        meta.elapsed_ms,
        if meta.external_search_used { ", rg" } else { "" },
        if meta.cached { ", cached" } else { "" },
    );
    for file in &result.files {
        out.push_str(&format!(
            "{:>5} {:>6}  {}{}\n",
            file.priority,
            file.tokens,
            file.path,
            if file.truncated { " (truncated)" } else { "" },
        ));
    }
    if with_content {
        for file in &result.files {
            out.push_str(&format!("\n==> {} <==\n{}", file.path, file.content));
            if !file.content.ends_with('\n') {
                out.push('\n');
            }
        }
    }
    out
}
