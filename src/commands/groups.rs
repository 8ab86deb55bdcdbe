//! `librarium groups`: list, add, or remove named provider groups.
//!
//! Edits land in the project file when `.librarium.json` exists in the
//! working directory, otherwise in the global file.

use std::path::PathBuf;

use clap::Subcommand;

use crate::commands::{current_dir, fail};
use crate::config::{
    self, CliOverrides, Config, ConfigFile, read_config_file, write_config_file,
};

#[derive(Debug, Subcommand)]
pub enum GroupsCmd {
    /// Create or replace a group.
    Add {
        name: String,
        #[arg(required = true)]
        ids: Vec<String>,
    },
    /// Delete a group.
    Remove { name: String },
}

pub async fn exec(cmd: Option<GroupsCmd>) -> i32 {
    let cwd = match current_dir() {
        Ok(cwd) => cwd,
        Err(e) => return fail(&e),
    };

    match cmd {
        None => {
            let config = match Config::load(&cwd, &CliOverrides::default()) {
                Ok(config) => config,
                Err(e) => return fail(&e),
            };
            if config.groups.is_empty() {
                println!("No groups configured.");
                return 0;
            }
            let mut names: Vec<&String> = config.groups.keys().collect();
            names.sort();
            for name in names {
                println!("{name}: {}", config.groups[name].join(", "));
            }
            0
        }
        Some(GroupsCmd::Add { name, ids }) => mutate(&cwd, |file| {
            file.groups.insert(name.clone(), ids.clone());
            println!("group '{name}' set to {}", ids.join(", "));
            Ok(())
        }),
        Some(GroupsCmd::Remove { name }) => mutate(&cwd, |file| {
            if file.groups.remove(&name).is_none() {
                return Err(format!("group '{name}' not found"));
            }
            println!("group '{name}' removed");
            Ok(())
        }),
    }
}

fn target_path(cwd: &std::path::Path) -> Option<PathBuf> {
    let project = config::project_config_path(cwd);
    if project.exists() {
        return Some(project);
    }
    config::global_config_path()
}

fn mutate<F>(cwd: &std::path::Path, apply: F) -> i32
where
    F: FnOnce(&mut ConfigFile) -> Result<(), String>,
{
    let Some(path) = target_path(cwd) else {
        eprintln!("error: no writable config location found");
        return 2;
    };
    let mut file = if path.exists() {
        match read_config_file(&path) {
            Ok(file) => file,
            Err(e) => return fail(&e),
        }
    } else {
        ConfigFile {
            version: Some(config::CONFIG_VERSION),
            ..Default::default()
        }
    };

    if let Err(message) = apply(&mut file) {
        eprintln!("error: {message}");
        return 2;
    }
    if let Err(e) = write_config_file(&path, &file) {
        return fail(&e);
    }
    0
}
