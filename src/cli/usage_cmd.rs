use std::sync::Arc;

use anyhow::{bail, Result};
use chrono::Utc;
use tracing::{debug, warn};

use crate::cli::output::{print_json, OutputOptions};
use crate::core::aggregator::Aggregator;
use crate::core::config::AppConfig;
use crate::core::context::Context;
use crate::core::models::usage::AllQuotas;
use crate::core::providers::Registry;

/// Load config, falling back to defaults when the file is unusable.
pub fn load_config() -> AppConfig {
    let config = AppConfig::load().unwrap_or_else(|e| {
        warn!(error = %e, "Ignoring unreadable config, using defaults");
        AppConfig::default()
    });
    for issue in config.validate() {
        warn!("Config issue: {}", issue);
    }
    config
}

pub fn build_aggregator(config: &AppConfig) -> Aggregator {
    let ctx = Arc::new(Context::from_config(config));
    let cache = ctx.cache.clone();
    debug!(dir = %cache.dir().display(), "Using cache directory");
    Aggregator::new(Registry::builtin(ctx), cache)
}

pub async fn run(provider_filter: Option<String>, refresh: bool, opts: &OutputOptions) -> Result<()> {
    let aggregator = build_aggregator(&load_config());
    let quotas = collect(&aggregator, provider_filter.as_deref(), refresh).await?;
    print_json(&quotas, opts)
}

async fn collect(aggregator: &Aggregator, provider: Option<&str>, refresh: bool) -> Result<AllQuotas> {
    let provider = provider.filter(|p| *p != "all");
    if let Some(id) = provider {
        if aggregator.registry().get(id).is_none() {
            bail!("Unknown provider: '{}'", id);
        }
    }

    if refresh {
        aggregator.invalidate(provider).await;
    }

    match provider {
        Some(id) => match aggregator.get_quota_for(id).await {
            Some(quota) => Ok(AllQuotas {
                providers: vec![quota],
                fetched_at: Utc::now(),
            }),
            None => bail!("Unknown provider: '{}'", id),
        },
        None => Ok(aggregator.get_all_quotas().await),
    }
}
