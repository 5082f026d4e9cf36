//! `toolmesh tools`: Inspect providers and the tools they expose.

use serde_json::json;
use toolmesh_core::protocol::discovery::BatchedDiscovery;
use toolmesh_core::{ProviderStatus, ProviderTool, ToolmeshConfig};

use super::{print_json, Session};

fn check_provider(config: &ToolmeshConfig, provider: Option<&str>) -> Result<(), String> {
    match provider {
        Some(name) if config.provider(name).is_none() => {
            Err(format!("Provider '{}' is not configured", name))
        }
        _ => Ok(()),
    }
}

/// List every tool across connected providers, optionally for one provider.
pub async fn list(config: &ToolmeshConfig, provider: Option<&str>, as_json: bool) -> Result<(), String> {
    check_provider(config, provider)?;

    let session = Session::open(config).await;
    let tools: Vec<_> = session
        .manager
        .available_tools()
        .await
        .into_iter()
        .filter(|t| provider.map_or(true, |p| t.provider_name == p))
        .collect();
    let tools = prioritized(config, tools);
    let statuses = session.manager.statuses().await;
    session.close().await;

    if as_json {
        print_json(&json!(tools));
        return Ok(());
    }

    for status in statuses
        .iter()
        .filter(|s| provider.map_or(true, |p| s.provider_id == p))
    {
        let label = match status.status {
            ProviderStatus::Connected => console::style(status.status.as_str()).green(),
            ProviderStatus::Error => console::style(status.status.as_str()).red(),
            _ => console::style(status.status.as_str()).yellow(),
        };
        match &status.last_error {
            Some(error) if status.status != ProviderStatus::Connected => {
                println!("{} [{}] {}", status.provider_id, label, error)
            }
            _ => println!("{} [{}]", status.provider_id, label),
        }
    }
    println!();
    print_table(&tools);
    Ok(())
}

/// List tools from the discovery cache without starting any provider.
/// Providers whose entry is missing or older than the TTL are reported as
/// not cached.
pub fn list_cached(
    config: &ToolmeshConfig,
    provider: Option<&str>,
    as_json: bool,
) -> Result<(), String> {
    check_provider(config, provider)?;
    let cache = config
        .discovery_cache()
        .ok_or("Discovery cache is disabled (discovery.cacheTtlSecs is 0)")?;
    let client = config.build_client(Some(cache));

    let mut tools: Vec<ProviderTool> = Vec::new();
    let mut missing: Vec<&str> = Vec::new();
    for configured in config
        .providers
        .iter()
        .filter(|p| provider.map_or(true, |name| p.name == name))
    {
        match client.cached_tools(&configured.name) {
            Some(cached) => tools.extend(
                cached
                    .into_iter()
                    .map(|tool| ProviderTool::new(tool, configured.name.clone())),
            ),
            None => missing.push(&configured.name),
        }
    }
    tools.sort_by(|a, b| {
        a.provider_name
            .cmp(&b.provider_name)
            .then_with(|| a.tool.name.cmp(&b.tool.name))
    });
    let tools = prioritized(config, tools);

    if as_json {
        print_json(&json!(tools));
        return Ok(());
    }
    for name in missing {
        println!("{} [{}]", name, console::style("not cached").yellow());
    }
    print_table(&tools);
    Ok(())
}

/// Tools matching `discovery.batch.priorityKeywords` are listed first.
fn prioritized(config: &ToolmeshConfig, tools: Vec<ProviderTool>) -> Vec<ProviderTool> {
    BatchedDiscovery::new(config.discovery.batch.clone()).prioritize(tools)
}

fn print_table(tools: &[ProviderTool]) {
    if tools.is_empty() {
        println!("No tools available.");
        return;
    }

    println!("┌──────────────────┬──────────────────────┬──────────────────────────────────────────┐");
    println!("│ Provider         │ Tool                 │ Description                              │");
    println!("├──────────────────┼──────────────────────┼──────────────────────────────────────────┤");
    for entry in tools {
        println!(
            "│ {:<16} │ {:<20} │ {:<40} │",
            truncate(&entry.provider_name, 16),
            truncate(&entry.tool.name, 20),
            truncate(entry.tool.description.as_deref().unwrap_or(""), 40),
        );
    }
    println!("└──────────────────┴──────────────────────┴──────────────────────────────────────────┘");
    println!("{} tool(s)", tools.len());
}

pub(crate) fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max.saturating_sub(1)).collect();
    out.push('…');
    out
}
