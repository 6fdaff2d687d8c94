//! Runs one batch refresh of the company cache.
//!
//! Usage: `refresh_company_cache [max_companies]`. Without an argument the
//! configured `REFRESH_MAX_COMPANIES` bound is used.

use company_context_api::config::Config;
use company_context_api::handlers::AppState;
use std::env;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let config = Config::from_env()?;
    if config.database_url.is_none() {
        anyhow::bail!("DATABASE_URL must be set to refresh the persistent company cache");
    }

    let max = match env::args().nth(1) {
        Some(raw) => raw
            .parse::<usize>()
            .map_err(|_| anyhow::anyhow!("max_companies must be a positive integer, got '{}'", raw))?,
        None => config.refresh.max_companies,
    };

    let state = AppState::from_config(config).await?;
    tracing::info!("Starting company cache refresh (max {})", max);

    let report = state.cache().refresh_batch(max).await?;

    tracing::info!(
        "Refresh complete. Selected {}, refreshed {}, failed {} in {} ms",
        report.selected,
        report.refreshed,
        report.failures.len(),
        report.duration_ms
    );
    for failure in &report.failures {
        tracing::warn!("  {}: {}", failure.key, failure.error);
    }
    println!("{}", serde_json::to_string_pretty(&report)?);

    Ok(())
}
