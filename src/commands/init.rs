//! `librarium init`: write a starter project config. Refuses to clobber
//! an existing one. `--auto` enables exactly the built-ins whose API key
//! env var is currently set.

use clap::Args;

use crate::commands::{current_dir, fail};
use crate::config::{
    CONFIG_VERSION, ConfigFile, DefaultsFile, ProviderEntry, project_config_path,
    write_config_file,
};
use crate::registry;

#[derive(Debug, Args)]
pub struct InitArgs {
    /// Enable every built-in provider whose API key is present in the
    /// environment.
    #[arg(long)]
    pub auto: bool,
}

pub async fn exec(args: InitArgs) -> i32 {
    let cwd = match current_dir() {
        Ok(cwd) => cwd,
        Err(e) => return fail(&e),
    };
    let path = project_config_path(&cwd);
    if path.exists() {
        eprintln!("error: {} already exists", path.display());
        return 2;
    }

    let mut file = ConfigFile {
        version: Some(CONFIG_VERSION),
        defaults: Some(DefaultsFile::default()),
        ..Default::default()
    };

    let mut enabled = Vec::new();
    for descriptor in registry::builtin_descriptors() {
        let available = !descriptor.requires_api_key
            || std::env::var(&descriptor.env_var).is_ok_and(|v| !v.trim().is_empty());
        if args.auto && !available {
            continue;
        }
        let entry = ProviderEntry {
            api_key: (!descriptor.env_var.is_empty())
                .then(|| format!("${}", descriptor.env_var)),
            enabled: args.auto.then_some(true),
            ..Default::default()
        };
        if args.auto {
            enabled.push(descriptor.id.clone());
        }
        file.providers.insert(descriptor.id, entry);
    }

    if let Err(e) = write_config_file(&path, &file) {
        return fail(&e);
    }
    println!("wrote {}", path.display());
    if args.auto {
        if enabled.is_empty() {
            println!("no provider API keys detected in the environment");
        } else {
            println!("enabled: {}", enabled.join(", "));
        }
    } else {
        println!("edit it to enable providers, or rerun with --auto");
    }
    0
}
