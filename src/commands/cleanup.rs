//! `librarium cleanup`: delete run directories older than a cutoff.

use std::time::{Duration, SystemTime};

use clap::Args;
use serde_json::json;

use crate::commands::{current_dir, fail};
use crate::config::{CliOverrides, Config};

#[derive(Debug, Args)]
pub struct CleanupArgs {
    /// Delete run directories older than this many days.
    #[arg(long, default_value_t = 30)]
    pub days: u64,

    /// List what would be deleted without deleting.
    #[arg(long)]
    pub dry_run: bool,

    /// Print results as JSON.
    #[arg(long)]
    pub json: bool,
}

pub async fn exec(args: CleanupArgs) -> i32 {
    let cwd = match current_dir() {
        Ok(cwd) => cwd,
        Err(e) => return fail(&e),
    };
    let config = match Config::load(&cwd, &CliOverrides::default()) {
        Ok(config) => config,
        Err(e) => return fail(&e),
    };

    let base = cwd.join(&config.defaults.output_dir);
    let cutoff = SystemTime::now() - Duration::from_secs(args.days * 24 * 60 * 60);

    let mut entries = match tokio::fs::read_dir(&base).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            if args.json {
                println!("[]");
            } else {
                println!("nothing to clean up ({} does not exist)", base.display());
            }
            return 0;
        }
        Err(e) => return fail(&e.into()),
    };

    let mut removed = Vec::new();
    loop {
        let entry = match entries.next_entry().await {
            Ok(Some(entry)) => entry,
            Ok(None) => break,
            Err(e) => return fail(&e.into()),
        };
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let modified = match entry.metadata().await.and_then(|m| m.modified()) {
            Ok(modified) => modified,
            Err(e) => {
                tracing::warn!("skipping {}: {e}", path.display());
                continue;
            }
        };
        if modified >= cutoff {
            continue;
        }
        if !args.dry_run
            && let Err(e) = tokio::fs::remove_dir_all(&path).await
        {
            eprintln!("error: failed to remove {}: {e}", path.display());
            continue;
        }
        removed.push(path);
    }

    if args.json {
        let report: Vec<_> = removed
            .iter()
            .map(|p| json!({"path": p.display().to_string(), "deleted": !args.dry_run}))
            .collect();
        println!(
            "{}",
            serde_json::to_string_pretty(&report).unwrap_or_else(|_| "[]".to_string())
        );
    } else if removed.is_empty() {
        println!("no run directories older than {} days", args.days);
    } else {
        let verb = if args.dry_run { "would remove" } else { "removed" };
        for path in &removed {
            println!("{verb} {}", path.display());
        }
        println!("{} directorie(s)", removed.len());
    }
    0
}
