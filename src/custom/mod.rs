//! Trusted custom-provider loading.
//!
//! Two source kinds share one subprocess transport: `script` entries run
//! the configured command directly, `npm` entries run the module behind a
//! Node host shim. An entry is loaded only when its id appears in
//! `trustedProviderIds`; every rejection is a warning, never a hard error,
//! so one bad plugin cannot take the run down.

pub mod ipc;
pub mod node;
pub mod protocol;

use std::path::Path;
use std::sync::Arc;

use crate::config::{Config, CustomProviderEntry};
use crate::custom::ipc::{Invocation, IpcProvider};
use crate::install::InstallMethod;
use crate::providers::{BUILTIN_IDS, Provider};
use crate::types::{ProviderDescriptor, ProviderSource};

/// Load every trusted, valid custom provider from the config.
pub async fn load_custom_providers(
    config: &Config,
    install: InstallMethod,
    project_dir: &Path,
) -> Vec<Arc<dyn Provider>> {
    let mut loaded: Vec<Arc<dyn Provider>> = Vec::new();

    // Deterministic load order regardless of map iteration.
    let mut ids: Vec<&String> = config.custom_providers.keys().collect();
    ids.sort();

    for id in ids {
        let entry = &config.custom_providers[id];

        if !config.trusted_provider_ids.contains(id.as_str()) {
            tracing::warn!(
                "custom provider '{id}' is not in trustedProviderIds, skipping"
            );
            continue;
        }
        if BUILTIN_IDS.contains(&id.as_str()) {
            tracing::warn!("custom provider '{id}' collides with a built-in id, skipping");
            continue;
        }

        // The provider's own config entry rides along in the envelope; its
        // apiKey field is an env-ref string, never a resolved secret.
        let provider_config = config
            .providers
            .get(id.as_str())
            .and_then(|e| serde_json::to_value(e).ok());

        match load_one(id, entry, provider_config, install, project_dir).await {
            Ok(provider) => {
                tracing::info!(
                    "loaded custom provider '{id}' ({})",
                    provider.descriptor().source
                );
                loaded.push(provider);
            }
            Err(reason) => {
                tracing::warn!("custom provider '{id}' skipped: {reason}");
            }
        }
    }

    loaded
}

async fn load_one(
    id: &str,
    entry: &CustomProviderEntry,
    provider_config: Option<serde_json::Value>,
    install: InstallMethod,
    project_dir: &Path,
) -> Result<Arc<dyn Provider>, String> {
    let (invocation, source) = match entry.kind.as_str() {
        "script" => {
            let command = entry
                .command
                .as_deref()
                .filter(|c| !c.is_empty())
                .ok_or_else(|| "script provider requires 'command'".to_string())?;
            let cwd = entry.cwd.as_deref().map(|c| {
                let path = Path::new(c);
                if path.is_absolute() {
                    path.to_path_buf()
                } else {
                    project_dir.join(path)
                }
            });
            (
                Invocation {
                    command: command.to_string(),
                    args: entry.args.clone(),
                    env: entry.env.clone(),
                    cwd,
                },
                ProviderSource::Script,
            )
        }
        "npm" => {
            if !install.supports_npm_providers() {
                return Err(format!(
                    "npm providers are unavailable under a {install} install"
                ));
            }
            let module = entry
                .module
                .as_deref()
                .filter(|m| !m.is_empty())
                .ok_or_else(|| "npm provider requires 'module'".to_string())?;
            let module_path = node::resolve_module(module, project_dir)
                .ok_or_else(|| format!("module '{module}' not found"))?;
            (node::module_invocation(&module_path), ProviderSource::Npm)
        }
        other => return Err(format!("unknown custom provider type '{other}'")),
    };

    let described = ipc::describe(
        &invocation,
        id,
        provider_config.as_ref(),
        entry.options.as_ref(),
    )
    .await
    .map_err(|e| format!("describe failed: {e}"))?;

    if let Some(declared) = described.id.as_deref()
        && declared != id
    {
        return Err(format!(
            "declared id '{declared}' does not match configured id '{id}'"
        ));
    }
    if !described.capabilities.execute {
        return Err("provider does not declare the mandatory execute capability".to_string());
    }
    let requires_api_key = described.requires_api_key.unwrap_or(true);
    let env_var = described.env_var.unwrap_or_default();
    if requires_api_key && env_var.is_empty() {
        return Err("provider requires an API key but declares no envVar".to_string());
    }

    let descriptor = ProviderDescriptor {
        id: id.to_string(),
        display_name: described.display_name,
        tier: described.tier,
        env_var,
        source,
        requires_api_key,
        capabilities: described.capabilities,
    };

    Ok(Arc::new(IpcProvider::new(
        descriptor,
        invocation,
        provider_config,
        entry.options.clone(),
    )))
}
