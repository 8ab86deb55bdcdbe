//! `librarium ls`: list registered providers and their readiness.

use std::sync::Arc;

use crate::commands::{current_dir, fail};
use crate::config::{CliOverrides, Config};
use crate::install;
use crate::providers::resolve_api_key;
use crate::registry::Registry;

pub async fn exec() -> i32 {
    let cwd = match current_dir() {
        Ok(cwd) => cwd,
        Err(e) => return fail(&e),
    };
    let config = match Config::load(&cwd, &CliOverrides::default()) {
        Ok(config) => Arc::new(config),
        Err(e) => return fail(&e),
    };
    let registry = Registry::initialize(&config, install::detect(), &cwd).await;

    println!(
        "{:<28} {:<14} {:<8} {:<9} {}",
        "ID", "TIER", "SOURCE", "KEY", "ASYNC"
    );
    for provider in registry.list() {
        let descriptor = provider.descriptor();
        let entry = config.provider_entry(&descriptor.id);
        let key = if !descriptor.requires_api_key {
            "n/a"
        } else if resolve_api_key(
            entry.and_then(|e| e.api_key.as_deref()),
            &descriptor.env_var,
        )
        .is_some()
        {
            "set"
        } else {
            "missing"
        };
        let enabled = entry.map(|e| e.is_enabled()).unwrap_or(false);
        let marker = if enabled { "" } else { " (disabled)" };
        println!(
            "{:<28} {:<14} {:<8} {:<9} {}{marker}",
            descriptor.id,
            descriptor.tier.as_str(),
            descriptor.source.to_string(),
            key,
            if descriptor.capabilities.submit { "yes" } else { "no" },
        );
    }
    0
}
