use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "hybrid-cache")]
#[command(about = "Inspect and maintain a hybrid cache deployment")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Configuration file (default: hybrid-cache.toml)
    #[arg(short, long, global = true, env = "HYBRID_CACHE_CONFIG")]
    pub config: Option<String>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Print the cached JSON value of a key
    Get(KeyArgs),
    /// Store a JSON value
    Set(SetArgs),
    /// Check whether a key is cached
    Exists(KeyArgs),
    /// Remove a key from both tiers
    Remove(KeyArgs),
    /// Remove every key starting with a prefix
    RemovePrefix(PrefixArgs),
    /// Remove every key owned by the cache
    Clear,
    /// Take a distributed lock and hold it for a while
    Lock(LockArgs),
    /// Print cache statistics and Prometheus metrics
    Stats,
}

#[derive(clap::Args)]
pub struct KeyArgs {
    pub key: String,
}

#[derive(clap::Args)]
pub struct SetArgs {
    pub key: String,
    /// Value as JSON, e.g. '{"name":"Ada"}'
    pub value: String,
    /// Time to live in seconds (default: cache.default_ttl_minutes)
    #[arg(long)]
    pub ttl_secs: Option<u64>,
}

#[derive(clap::Args)]
pub struct PrefixArgs {
    pub prefix: String,
}

#[derive(clap::Args)]
pub struct LockArgs {
    pub key: String,
    /// Lock expiry in seconds (default: lock.expiry_secs)
    #[arg(long)]
    pub expiry_secs: Option<u64>,
    /// How long to hold the lock before releasing it
    #[arg(long, default_value_t = 1000)]
    pub hold_ms: u64,
}
