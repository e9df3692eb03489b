//! mailpoolctl - Maintenance commands for a mailpool database
//!
//! Operates on the same SQLite file the gateway uses. Sessions are never
//! opened here, so no transport is required.

use anyhow::{Context, Result, bail};
use log::{error, info};
use mailpool::{
    AccountIdentity, BatchItem, BatchOrchestrator, EmailCache, HttpIdentityProvider, ItemStatus,
    RefreshTokenSink, Settings, SqliteStore, TokenCache, TokenStore,
};
use serde_json::json;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

const USAGE: &str = "\
Usage: mailpoolctl <command> [args]

Commands:
  stats                              Token, cache and batch summary
  purge-tokens                       Delete expired access tokens
  evict-account <email>              Drop every token and cache row for an account
  batch <id> [pending|success|failed]  Show a batch and its items
  purge-batches <days>               Delete batches that finished more than <days> ago
  refresh <accounts.json> [concurrency]  Force a token refresh for each account

Settings are read from ~/.config/mailpool/mailpool.json when present.
Set MAILPOOL_CONFIG_DIR to use another directory.";

/// Logs rotated refresh tokens; the account layer owns persisting them
struct LogRotations;

impl RefreshTokenSink for LogRotations {
    fn refresh_token_rotated(&self, account: &AccountIdentity, _new_refresh_token: &str) {
        info!(
            "Refresh token rotated for {}; update the account record",
            account.email
        );
    }
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    if let Err(e) = run(&args) {
        error!("{:#}", e);
        std::process::exit(1);
    }
}

fn run(args: &[String]) -> Result<()> {
    let Some(command) = args.first() else {
        println!("{}", USAGE);
        return Ok(());
    };

    if let Err(e) = config::init() {
        error!("Failed to initialize config directory: {}", e);
    }
    let settings = Settings::load()?;
    let db_path = settings
        .database_path()
        .context("Could not determine database path")?;
    let store = Arc::new(SqliteStore::open(&db_path)?);

    match command.as_str() {
        "stats" => stats(&settings, &store),
        "purge-tokens" => {
            let tokens = token_cache(&settings, &store);
            let purged = tokens.purge_expired()?;
            print_json(&json!({ "purged_tokens": purged }))
        }
        "evict-account" => {
            let email = args.get(1).context("evict-account needs an email")?;
            let tokens = token_cache(&settings, &store);
            tokens.invalidate(email);
            let cache = EmailCache::new(Some(store.clone()), &settings.cache);
            let rows = cache.purge_account(email);
            print_json(&json!({ "account": mailpool::account_key(email), "cache_rows": rows }))
        }
        "batch" => {
            let id = args.get(1).context("batch needs a batch id")?;
            let status = match args.get(2) {
                Some(s) => Some(
                    ItemStatus::parse(s).with_context(|| format!("Unknown item status: {}", s))?,
                ),
                None => None,
            };
            let orchestrator = BatchOrchestrator::new(store.clone(), settings.batch.clone());
            let Some(progress) = orchestrator.progress(id)? else {
                bail!("No batch with id {}", id);
            };
            let items = orchestrator.items(id, status)?;
            print_json(&json!({ "progress": progress, "items": items }))
        }
        "purge-batches" => {
            let days = args.get(1).context("purge-batches needs a number of days")?;
            let days: u64 = days
                .parse()
                .with_context(|| format!("Invalid number of days: {}", days))?;
            let orchestrator = BatchOrchestrator::new(store.clone(), settings.batch.clone());
            let purged =
                orchestrator.purge_finished(Duration::from_secs(days.saturating_mul(86_400)))?;
            print_json(&json!({ "purged_batches": purged }))
        }
        "refresh" => {
            let path = args.get(1).context("refresh needs an accounts file")?;
            let concurrency = match args.get(2) {
                Some(n) => Some(
                    n.parse::<usize>()
                        .with_context(|| format!("Invalid concurrency: {}", n))?,
                ),
                None => None,
            };
            refresh(&settings, &store, Path::new(path), concurrency)
        }
        other => {
            println!("{}", USAGE);
            bail!("Unknown command: {}", other)
        }
    }
}

fn token_cache(settings: &Settings, store: &Arc<SqliteStore>) -> TokenCache {
    let provider = Arc::new(HttpIdentityProvider::from_settings(&settings.identity));
    let token_store: Arc<dyn TokenStore> = store.clone();
    TokenCache::new(provider, token_store, &settings.identity, &settings.tokens)
}

fn stats(settings: &Settings, store: &Arc<SqliteStore>) -> Result<()> {
    let cache = EmailCache::new(Some(store.clone()), &settings.cache);
    let orchestrator = BatchOrchestrator::new(store.clone(), settings.batch.clone());
    let cache_stats = cache.stats();

    print_json(&json!({
        "stored_tokens": store.count_tokens()?,
        "lists": cache_stats.list_usage,
        "details": cache_stats.detail_usage,
        "recent_batches": orchestrator.recent(10)?,
    }))
}

fn refresh(
    settings: &Settings,
    store: &Arc<SqliteStore>,
    path: &Path,
    concurrency: Option<usize>,
) -> Result<()> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let accounts: Vec<AccountIdentity> = serde_json::from_str(&raw)
        .with_context(|| format!("Failed to parse accounts from {}", path.display()))?;
    info!("Refreshing tokens for {} account(s)", accounts.len());

    let tokens = token_cache(settings, store).with_sink(Arc::new(LogRotations));
    let orchestrator = BatchOrchestrator::new(store.clone(), settings.batch.clone());
    let items = accounts
        .into_iter()
        .map(|account| BatchItem::new(account.key(), account))
        .collect();

    let progress = orchestrator.run("refresh_tokens", items, concurrency, |account| {
        tokens.refresh(&account).map(|_| ())
    })?;
    let failed = orchestrator.items(&progress.batch_id, Some(ItemStatus::Failed))?;

    print_json(&json!({ "progress": progress, "failed": failed }))
}

fn print_json(value: &serde_json::Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
