use anyhow::Result;
use serde::Serialize;

use crate::cli::output::{print_json, OutputOptions};
use crate::cli::usage_cmd::{build_aggregator, load_config};
use crate::core::aggregator::Aggregator;
use crate::core::providers::ProviderId;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ProviderEntry {
    id: String,
    display_name: String,
    available: bool,
    auth: &'static str,
    cache_keys: Vec<&'static str>,
}

pub async fn run(opts: &OutputOptions) -> Result<()> {
    let aggregator = build_aggregator(&load_config());
    print_json(&entries(&aggregator).await, opts)
}

async fn entries(aggregator: &Aggregator) -> Vec<ProviderEntry> {
    aggregator
        .availability()
        .await
        .into_iter()
        .map(|(provider, available)| ProviderEntry {
            id: provider.id().to_string(),
            display_name: provider.display_name().to_string(),
            available,
            auth: ProviderId::from_id(provider.id()).map_or("", |p| p.auth_hint()),
            cache_keys: provider.cache_keys().to_vec(),
        })
        .collect()
}
