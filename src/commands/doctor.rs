//! `librarium doctor`: sanity-check config files, keys, and providers.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::commands::{current_dir, fail};
use crate::config::{
    CliOverrides, Config, global_config_path, project_config_path, read_config_file,
};
use crate::install;
use crate::providers::{ProviderOptions, resolve_api_key};
use crate::registry::Registry;

pub async fn exec() -> i32 {
    let cwd = match current_dir() {
        Ok(cwd) => cwd,
        Err(e) => return fail(&e),
    };
    let mut problems = 0usize;

    let install_method = install::detect();
    println!("install method: {install_method}");

    for (label, path) in [
        ("global config", global_config_path()),
        ("project config", Some(project_config_path(&cwd))),
    ] {
        match path {
            Some(path) if path.exists() => match read_config_file(&path) {
                Ok(_) => println!("  ok {label}: {}", path.display()),
                Err(e) => {
                    problems += 1;
                    println!("  !! {label}: {e}");
                }
            },
            Some(path) => println!("  -- {label}: {} (absent)", path.display()),
            None => println!("  -- {label}: no location resolvable"),
        }
    }

    let config = match Config::load(&cwd, &CliOverrides::default()) {
        Ok(config) => Arc::new(config),
        Err(e) => return fail(&e),
    };
    for warning in &config.warnings {
        println!("  !! {warning}");
    }

    let registry = Registry::initialize(&config, install_method, &cwd).await;
    for provider in registry.list() {
        let descriptor = provider.descriptor();
        let entry = config.provider_entry(&descriptor.id);
        if entry.is_none() {
            println!("  -- {}: not configured", descriptor.id);
            continue;
        }
        let key = resolve_api_key(
            entry.and_then(|e| e.api_key.as_deref()),
            &descriptor.env_var,
        );
        if descriptor.requires_api_key && key.is_none() {
            problems += 1;
            println!("  !! {}: {} not set", descriptor.id, descriptor.env_var);
            continue;
        }
        if descriptor.capabilities.test {
            let mut opts = ProviderOptions::new(Duration::from_secs(15));
            opts.api_key = key;
            opts.cancel = CancellationToken::new();
            let outcome = provider.test(&opts).await;
            if outcome.ok {
                println!("  ok {}: test passed", descriptor.id);
            } else {
                problems += 1;
                println!(
                    "  !! {}: test failed: {}",
                    descriptor.id,
                    outcome.error.as_deref().unwrap_or("unknown error")
                );
            }
        } else {
            println!("  ok {}: key present", descriptor.id);
        }
    }

    if problems == 0 {
        println!("all checks passed");
        0
    } else {
        println!("{problems} problem(s) found");
        1
    }
}
