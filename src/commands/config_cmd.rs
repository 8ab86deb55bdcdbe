//! `librarium config`: print the merged (or global) configuration.
//! `apiKey` values are env-ref strings as written, never resolved secrets.

use clap::Args;
use serde_json::json;

use crate::commands::{current_dir, fail};
use crate::config::{CliOverrides, Config, global_config_path, read_config_file};

#[derive(Debug, Args)]
pub struct ConfigArgs {
    /// Show only the global config file.
    #[arg(long)]
    pub global: bool,

    /// Print compact JSON.
    #[arg(long)]
    pub json: bool,
}

pub async fn exec(args: ConfigArgs) -> i32 {
    if args.global {
        let Some(path) = global_config_path() else {
            eprintln!("error: no global config location resolvable");
            return 2;
        };
        if !path.exists() {
            println!("no global config at {}", path.display());
            return 0;
        }
        let file = match read_config_file(&path) {
            Ok(file) => file,
            Err(e) => return fail(&e),
        };
        return print_value(&serde_json::to_value(&file).unwrap_or_default(), args.json);
    }

    let cwd = match current_dir() {
        Ok(cwd) => cwd,
        Err(e) => return fail(&e),
    };
    let config = match Config::load(&cwd, &CliOverrides::default()) {
        Ok(config) => config,
        Err(e) => return fail(&e),
    };

    let mut trusted: Vec<&String> = config.trusted_provider_ids.iter().collect();
    trusted.sort();
    let value = json!({
        "defaults": {
            "outputDir": config.defaults.output_dir,
            "maxParallel": config.defaults.max_parallel,
            "timeout": config.defaults.timeout,
            "asyncTimeout": config.defaults.async_timeout,
            "asyncPollInterval": config.defaults.async_poll_interval,
            "mode": config.defaults.mode,
        },
        "providers": config.providers,
        "customProviders": config.custom_providers,
        "trustedProviderIds": trusted,
        "groups": config.groups,
    });
    print_value(&value, args.json)
}

fn print_value(value: &serde_json::Value, compact: bool) -> i32 {
    let rendered = if compact {
        serde_json::to_string(value)
    } else {
        serde_json::to_string_pretty(value)
    };
    match rendered {
        Ok(text) => {
            println!("{text}");
            0
        }
        Err(e) => {
            eprintln!("error: {e}");
            2
        }
    }
}
