use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use authcache_core::claims::decode_unverified;
use authcache_core::{
    load_config, AssetCache, CacheConfig, CredentialCache, CredentialProvider,
    HttpCredentialProvider, PrefetchQueue, QueueItem, ResolveOptions, StaticCredentialProvider,
    SystemClock,
};
use chrono::{TimeZone, Utc};
use clap::{Args, Parser, Subcommand};
use serde_json::{json, Value as JsonValue};
use tracing::debug;
use walkdir::WalkDir;

#[derive(Parser)]
#[command(name = "authcache", version, about = "Authenticated asset cache utilities")]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct GlobalArgs {
    /// TOML config file; env vars and flags override it
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Directory holding cached assets
    #[arg(long, global = true)]
    cache_dir: Option<PathBuf>,
    /// Fixed credential sent with downloads
    #[arg(long, global = true, env = "AUTHCACHE_TOKEN", hide_env_values = true)]
    token: Option<String>,
    /// Token endpoint answering POST {"force_refresh": bool} with {"token": "..."}
    #[arg(long, global = true, env = "AUTHCACHE_TOKEN_ENDPOINT")]
    token_endpoint: Option<String>,
    /// Bearer key for the token endpoint
    #[arg(long, global = true, env = "AUTHCACHE_TOKEN_API_KEY", hide_env_values = true)]
    token_api_key: Option<String>,
    /// Verbose per-request logging
    #[arg(long, global = true)]
    diagnostics: bool,
    /// Pretty-print JSON output
    #[arg(long, global = true)]
    pretty: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Resolve one asset to a local file, downloading it when needed
    Fetch(FetchArgs),
    /// Warm the cache from a JSON manifest of {"key", "url"} items
    Prefetch(PrefetchArgs),
    /// Delete every cached file
    Clear,
    /// Decode a credential's claims without verifying it
    InspectToken(InspectTokenArgs),
    /// Print effective config and on-disk usage
    Status,
}

#[derive(Args)]
struct FetchArgs {
    key: String,
    url: String,
    /// Download again even when a valid file is cached
    #[arg(long)]
    force: bool,
}

#[derive(Args)]
struct PrefetchArgs {
    manifest: PathBuf,
    #[arg(long)]
    max_initial: Option<usize>,
    #[arg(long)]
    concurrency: Option<usize>,
}

#[derive(Args)]
struct InspectTokenArgs {
    token: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let cfg = effective_config(&cli.global)?;
    authcache_log::init(cfg.diagnostics);
    debug!(cache_dir = %cfg.cache_dir.display(), "configuration loaded");

    let pretty = cli.global.pretty;
    match cli.command {
        Commands::Fetch(args) => {
            let cache = build_cache(&cli.global, &cfg)?;
            let opts = ResolveOptions {
                force_refresh: args.force,
            };
            let path = cache.resolve(&args.key, &args.url, opts).await?;
            emit(
                &json!({ "key": args.key, "path": path, "stats": cache.stats() }),
                pretty,
            );
            if path.is_none() {
                bail!("asset {} could not be resolved", args.key);
            }
        }
        Commands::Prefetch(args) => {
            let items = read_manifest(&args.manifest)?;
            let cache = build_cache(&cli.global, &cfg)?;
            let queue = PrefetchQueue::for_cache(&cache, cfg.prefetch.clone());
            let report = queue.enqueue(
                items,
                args.max_initial.unwrap_or(cfg.prefetch.max_initial),
                args.concurrency.unwrap_or(cfg.prefetch.concurrency),
            );
            queue.wait_idle().await;
            emit(&json!({ "report": report, "stats": cache.stats() }), pretty);
        }
        Commands::Clear => {
            let cache = build_cache(&cli.global, &cfg)?;
            let report = cache.clear_all().await;
            emit(&serde_json::to_value(report)?, pretty);
        }
        Commands::InspectToken(args) => {
            emit(&inspect_token(&args.token)?, pretty);
        }
        Commands::Status => {
            let (files, bytes) = disk_usage(&cfg.cache_dir);
            emit(
                &json!({
                    "cache_dir": cfg.cache_dir,
                    "files": files,
                    "bytes": bytes,
                    "credential_source": credential_source(&cli.global),
                    "config": cfg,
                }),
                pretty,
            );
        }
    }
    Ok(())
}

/// Defaults, then the TOML file, then `AUTHCACHE_*` env, then flags.
fn effective_config(global: &GlobalArgs) -> Result<CacheConfig> {
    let mut cfg = match &global.config {
        Some(path) => load_config(path)?,
        None => CacheConfig::default(),
    };
    cfg.apply_env();
    if let Some(dir) = &global.cache_dir {
        cfg.cache_dir = dir.clone();
    }
    if global.diagnostics {
        cfg.diagnostics = true;
    }
    cfg.validate()?;
    Ok(cfg)
}

fn provider(global: &GlobalArgs, cfg: &CacheConfig) -> Result<Arc<dyn CredentialProvider>> {
    if let Some(token) = &global.token {
        return Ok(Arc::new(StaticCredentialProvider::new(token.clone())));
    }
    if let Some(endpoint) = &global.token_endpoint {
        let mut http = HttpCredentialProvider::new(endpoint, cfg.credential.fetch_timeout())
            .context("token endpoint")?;
        if let Some(key) = &global.token_api_key {
            http = http.with_api_key(key.clone());
        }
        return Ok(Arc::new(http));
    }
    // No source: every fetch is refused and downloads go out anonymously if allowed.
    Ok(Arc::new(StaticCredentialProvider::new(String::new())))
}

fn credential_source(global: &GlobalArgs) -> &'static str {
    if global.token.is_some() {
        "static"
    } else if global.token_endpoint.is_some() {
        "endpoint"
    } else {
        "none"
    }
}

fn build_cache(global: &GlobalArgs, cfg: &CacheConfig) -> Result<AssetCache> {
    let clock = SystemClock::shared();
    let credentials = CredentialCache::new(provider(global, cfg)?, cfg.credential.clone(), clock.clone());
    Ok(AssetCache::new(cfg, credentials, clock)?)
}

fn read_manifest(path: &Path) -> Result<Vec<QueueItem>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("read manifest {}", path.display()))?;
    let items: Vec<QueueItem> = serde_json::from_str(&text)
        .with_context(|| format!("parse manifest {}", path.display()))?;
    Ok(items)
}

fn inspect_token(token: &str) -> Result<JsonValue> {
    let claims = decode_unverified(token).context("decode token")?;
    let now_ms = Utc::now().timestamp_millis();
    let expires_at = claims
        .expires_at_ms()
        .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
        .map(|dt| dt.to_rfc3339());
    let expires_in_secs = claims.expires_at_ms().map(|ms| expires_in_secs(ms, now_ms));
    Ok(json!({
        "sub": claims.sub,
        "exp": claims.exp,
        "iat": claims.iat,
        "expires_at": expires_at,
        "expires_in_secs": expires_in_secs,
        "expired": expires_in_secs.map(|secs| secs <= 0),
        "claims": claims.raw,
    }))
}

/// Whole seconds until expiry, negative once expired. Saturates on absurd `exp` values.
fn expires_in_secs(expires_at_ms: i64, now_ms: i64) -> i64 {
    expires_at_ms.saturating_sub(now_ms) / 1000
}

fn disk_usage(dir: &Path) -> (u64, u64) {
    if !dir.is_dir() {
        return (0, 0);
    }
    WalkDir::new(dir)
        .min_depth(1)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
        .fold((0, 0), |(files, bytes), e| {
            let size = e.metadata().map(|m| m.len()).unwrap_or(0);
            (files + 1, bytes + size)
        })
}

fn emit(value: &JsonValue, pretty: bool) {
    if pretty {
        println!(
            "{}",
            serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
        );
    } else {
        println!("{}", value);
    }
}
