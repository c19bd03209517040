mod cli;

use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use hybrid_cache::CacheManager;
use hybrid_cache::config::loader::{DEFAULT_CONFIG_FILE, load_config};

use cli::{Cli, Commands};

#[tokio::main]
async fn main() {
    // Load .env file if present (before anything else)
    if let Err(e) = dotenvy::dotenv() {
        // Not an error if .env doesn't exist - it's optional
        if !matches!(e, dotenvy::Error::Io(ref io_err) if io_err.kind() == std::io::ErrorKind::NotFound)
        {
            eprintln!("Warning: Failed to load .env file: {e}");
        }
    }

    hybrid_cache::observability::init_tracing_with_level("warn");
    hybrid_cache::metrics::init_metrics();

    if let Err(e) = run().await {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();
    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| DEFAULT_CONFIG_FILE.to_string());

    let cfg = load_config(Some(&config_path)).context("Configuration error")?;
    hybrid_cache::observability::apply_logging_level(&cfg.logging.level);
    tracing::info!(path = %config_path, "Configuration loaded");

    let manager = CacheManager::from_config(&cfg)
        .await
        .context("Cache initialization failed")?;
    let outcome = execute(&manager, cli.command).await;
    manager.shutdown().await;
    outcome
}

async fn execute(manager: &CacheManager, command: Commands) -> Result<()> {
    match command {
        Commands::Get(args) => match manager.get::<serde_json::Value>(&args.key).await? {
            Some(value) => println!("{}", serde_json::to_string_pretty(&value)?),
            None => anyhow::bail!("{}: not cached", args.key),
        },
        Commands::Set(args) => {
            let value: serde_json::Value =
                serde_json::from_str(&args.value).context("value must be valid JSON")?;
            let ttl = args.ttl_secs.map(Duration::from_secs);
            manager.set(&args.key, &value, ttl).await?;
            println!("OK");
        }
        Commands::Exists(args) => {
            println!("{}", manager.exists(&args.key).await?);
        }
        Commands::Remove(args) => {
            println!("{}", manager.remove(&args.key).await?);
        }
        Commands::RemovePrefix(args) => {
            manager.remove_by_prefix(&args.prefix)?.wait().await?;
            println!("OK");
        }
        Commands::Clear => {
            manager.clear()?.wait().await?;
            println!("OK");
        }
        Commands::Lock(args) => {
            let expiry = args.expiry_secs.map(Duration::from_secs);
            let hold = Duration::from_millis(args.hold_ms);
            let key = args.key.clone();
            let acquired = manager
                .try_acquire_and_run(&args.key, expiry, || async move {
                    println!("acquired {key}");
                    tokio::time::sleep(hold).await;
                    Ok(())
                })
                .await?;
            if !acquired {
                println!("held elsewhere");
            }
        }
        Commands::Stats => {
            let stats = manager.stats();
            println!("instance_id:  {}", stats.instance_id);
            println!("distributed:  {}", stats.distributed);
            println!("backplane:    {}", stats.backplane);
            println!(
                "local:        {} entries, {} hits, {} misses, {} evictions",
                stats.local.entries, stats.local.hits, stats.local.misses, stats.local.evictions
            );
            println!("in_flight:    {}", stats.in_flight);
            println!("pending_jobs: {}", stats.pending_jobs);
            if let Some(rendered) = hybrid_cache::metrics::render_metrics() {
                println!();
                print!("{rendered}");
            }
        }
    }

    Ok(())
}
