//! `librarium status`: inspect async task handles across run directories,
//! optionally waiting for them and retrieving finished artifacts.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Args;
use tokio_util::sync::CancellationToken;

use crate::commands::{current_dir, fail};
use crate::config::{CliOverrides, Config};
use crate::install;
use crate::registry::Registry;
use crate::tasks::{self, PollSettings};
use crate::types::{TaskHandle, TaskStatus};

#[derive(Debug, Args)]
pub struct StatusArgs {
    /// Poll pending tasks until they settle, then retrieve results.
    #[arg(long)]
    pub wait: bool,

    /// Retrieve already-completed tasks without waiting.
    #[arg(long)]
    pub retrieve: bool,

    /// Print handles as JSON.
    #[arg(long)]
    pub json: bool,
}

pub async fn exec(args: StatusArgs) -> i32 {
    let cwd = match current_dir() {
        Ok(cwd) => cwd,
        Err(e) => return fail(&e),
    };
    let config = match Config::load(&cwd, &CliOverrides::default()) {
        Ok(config) => Arc::new(config),
        Err(e) => return fail(&e),
    };
    let registry = Arc::new(Registry::initialize(&config, install::detect(), &cwd).await);

    let base = cwd.join(&config.defaults.output_dir);
    let all = match tasks::scan_tasks(
        &base,
        &[
            TaskStatus::Pending,
            TaskStatus::Running,
            TaskStatus::Completed,
            TaskStatus::Failed,
        ],
    )
    .await
    {
        Ok(found) => found,
        Err(e) => return fail(&e),
    };

    if args.json {
        let handles: Vec<&TaskHandle> = all.iter().map(|(_, h)| h).collect();
        match serde_json::to_string_pretty(&handles) {
            Ok(json) => println!("{json}"),
            Err(e) => eprintln!("error: {e}"),
        }
    } else if all.is_empty() {
        println!("No async tasks.");
    } else {
        for (dir, handle) in &all {
            println!(
                "{}  {}  task {}  [{}]",
                dir.file_name().unwrap_or_default().to_string_lossy(),
                handle.provider,
                handle.task_id,
                handle.status
            );
        }
    }

    if !args.wait && !args.retrieve {
        return 0;
    }

    // One pass per directory that still has work to do.
    let mut dirs: BTreeMap<PathBuf, ()> = BTreeMap::new();
    for (dir, handle) in &all {
        let relevant = if args.wait {
            handle.status.is_open() || handle.status == TaskStatus::Completed
        } else {
            handle.status == TaskStatus::Completed
        };
        if relevant {
            dirs.insert(dir.clone(), ());
        }
    }

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        });
    }

    let mut failures = 0usize;
    for dir in dirs.keys() {
        let reports = if args.wait {
            let settings = PollSettings::from_config(&config, cancel.clone());
            tasks::wait_for_tasks(&registry, &config, dir, &settings).await
        } else {
            tasks::retrieve_completed(&registry, &config, dir, &cancel).await
        };
        match reports {
            Ok(reports) => {
                for report in reports {
                    if report.status.succeeded() {
                        println!(
                            "{}: retrieved {} words, {} citations",
                            report.id, report.word_count, report.citation_count
                        );
                    } else {
                        failures += 1;
                        println!(
                            "{}: {} ({})",
                            report.id,
                            report.status,
                            report.error.as_deref().unwrap_or("unknown error")
                        );
                    }
                }
            }
            Err(e) => {
                failures += 1;
                eprintln!("error: {}: {e}", dir.display());
            }
        }
    }

    if failures == 0 { 0 } else { 1 }
}
