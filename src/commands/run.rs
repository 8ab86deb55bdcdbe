//! `librarium run <query>`: fan the query out and persist the run record.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Args;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::commands::{current_dir, fail};
use crate::config::{CliOverrides, Config};
use crate::dispatch::{self, DispatchRequest, ProgressEvent};
use crate::install;
use crate::normalize::dedup_citations;
use crate::output;
use crate::registry::Registry;
use crate::types::{DispatchMode, MANIFEST_VERSION, RunManifest, SourceSummary};

#[derive(Debug, Args)]
pub struct RunArgs {
    /// The research query.
    pub query: String,

    /// Comma-separated provider ids to run.
    #[arg(short = 'p', long = "providers", value_delimiter = ',')]
    pub providers: Option<Vec<String>>,

    /// Named provider group from config.
    #[arg(short = 'g', long)]
    pub group: Option<String>,

    /// Dispatch mode: sync, async, or mixed.
    #[arg(short = 'm', long)]
    pub mode: Option<String>,

    /// Output root directory.
    #[arg(short = 'o', long = "output")]
    pub output: Option<String>,

    /// Maximum concurrent providers.
    #[arg(long)]
    pub parallel: Option<usize>,

    /// Per-provider timeout in seconds.
    #[arg(long)]
    pub timeout: Option<u64>,

    /// Print the run manifest as JSON instead of the human summary.
    #[arg(long)]
    pub json: bool,
}

pub async fn exec(args: RunArgs) -> i32 {
    let cwd = match current_dir() {
        Ok(cwd) => cwd,
        Err(e) => return fail(&e),
    };

    let mode_override = match args.mode.as_deref().map(str::parse::<DispatchMode>) {
        Some(Ok(mode)) => Some(mode),
        Some(Err(e)) => {
            eprintln!("error: {e}");
            return 2;
        }
        None => None,
    };

    let overrides = CliOverrides {
        output_dir: args.output.clone(),
        max_parallel: args.parallel,
        timeout: args.timeout,
        mode: mode_override,
    };
    let config = match Config::load(&cwd, &overrides) {
        Ok(config) => Arc::new(config),
        Err(e) => return fail(&e),
    };

    let registry = Arc::new(
        Registry::initialize(&config, install::detect(), &cwd).await,
    );

    let selection = match select_providers(&config, args.providers, args.group.as_deref()) {
        Ok(ids) => ids,
        Err(message) => {
            eprintln!("error: {message}");
            return 2;
        }
    };

    let base = cwd.join(&config.defaults.output_dir);
    let run_dir = match output::create_run_dir(&base, &args.query).await {
        Ok(dir) => dir,
        Err(e) => return fail(&e),
    };
    if let Err(e) = output::write_prompt(&run_dir.path, &args.query).await {
        return fail(&e);
    }

    // Ctrl-C cancels every in-flight provider call.
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("interrupt received, cancelling");
                cancel.cancel();
            }
        });
    }

    let (progress_tx, mut progress_rx) = mpsc::unbounded_channel();
    let quiet = args.json;
    let printer = tokio::spawn(async move {
        while let Some(event) = progress_rx.recv().await {
            if quiet {
                continue;
            }
            match event {
                ProgressEvent::Started { id } => eprintln!("  {id}: started"),
                ProgressEvent::Completed { id, status } => eprintln!("  {id}: {status}"),
                ProgressEvent::Error { id, message } => eprintln!("  {id}: error: {message}"),
                ProgressEvent::AsyncSubmitted { id, task_id } => {
                    eprintln!("  {id}: submitted async task {task_id}")
                }
                ProgressEvent::FallbackStarted { primary, fallback } => {
                    eprintln!("  {primary}: trying fallback {fallback}")
                }
            }
        }
    });

    let request = DispatchRequest {
        query: args.query.clone(),
        provider_ids: selection,
        mode: config.defaults.mode,
        output_dir: run_dir.path.clone(),
    };
    let outcome = match dispatch::dispatch(
        registry,
        config.clone(),
        request,
        Some(progress_tx),
        cancel,
    )
    .await
    {
        Ok(outcome) => outcome,
        Err(e) => return fail(&e),
    };
    let _ = printer.await;

    let sources = dedup_citations(&outcome.citations);
    let exit_code = dispatch::compute_exit_code(&outcome.reports);

    let manifest = RunManifest {
        version: MANIFEST_VERSION,
        timestamp: run_dir.timestamp,
        slug: run_dir.slug.clone(),
        query: args.query.clone(),
        mode: config.defaults.mode,
        output_dir: absolute(&run_dir.path),
        providers: outcome.reports,
        sources: SourceSummary {
            total: outcome.citations.len(),
            unique: sources.len(),
            file: output::SOURCES_FILE.to_string(),
        },
        async_tasks: outcome.handles,
        exit_code,
    };

    if let Err(e) = output::write_sources(&run_dir.path, &sources).await {
        return fail(&e);
    }
    if let Err(e) = output::write_summary(&run_dir.path, &manifest, &sources).await {
        return fail(&e);
    }
    if let Err(e) = output::write_manifest(&run_dir.path, &manifest).await {
        return fail(&e);
    }

    if args.json {
        match serde_json::to_string_pretty(&manifest) {
            Ok(json) => println!("{json}"),
            Err(e) => eprintln!("error: failed to encode manifest: {e}"),
        }
    } else {
        println!();
        println!("{}", output::render_summary(&manifest, &sources));
        println!("Run written to {}", manifest.output_dir);
    }

    exit_code
}

/// Selection precedence: explicit ids, then the named group, then the
/// group called `default`, then every enabled configured provider.
fn select_providers(
    config: &Config,
    explicit: Option<Vec<String>>,
    group: Option<&str>,
) -> Result<Vec<String>, String> {
    if let Some(ids) = explicit {
        let ids: Vec<String> = ids
            .into_iter()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        if ids.is_empty() {
            return Err("no providers selected".to_string());
        }
        return Ok(ids);
    }
    if let Some(name) = group {
        return config
            .groups
            .get(name)
            .cloned()
            .filter(|g| !g.is_empty())
            .ok_or_else(|| format!("unknown or empty group '{name}'"));
    }
    if let Some(default) = config.groups.get("default").filter(|g| !g.is_empty()) {
        return Ok(default.clone());
    }
    let mut ids: Vec<String> = config
        .providers
        .iter()
        .filter(|(_, entry)| entry.is_enabled())
        .map(|(id, _)| id.clone())
        .collect();
    ids.sort();
    if ids.is_empty() {
        return Err(
            "no providers configured; run `librarium init --auto` or pass --providers".to_string(),
        );
    }
    Ok(ids)
}

fn absolute(path: &PathBuf) -> String {
    std::fs::canonicalize(path)
        .unwrap_or_else(|_| path.clone())
        .to_string_lossy()
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProviderEntry;

    fn config_with_groups() -> Config {
        let mut config = Config::default();
        config
            .groups
            .insert("fast".to_string(), vec!["exa".to_string()]);
        config.groups.insert(
            "default".to_string(),
            vec!["tavily".to_string(), "exa".to_string()],
        );
        config
            .providers
            .insert("brave-search".to_string(), ProviderEntry::default());
        config
    }

    #[test]
    fn explicit_ids_win() {
        let ids = select_providers(
            &config_with_groups(),
            Some(vec!["exa".into(), "tavily".into()]),
            Some("fast"),
        )
        .unwrap();
        assert_eq!(ids, vec!["exa", "tavily"]);
    }

    #[test]
    fn named_group_beats_default() {
        let ids = select_providers(&config_with_groups(), None, Some("fast")).unwrap();
        assert_eq!(ids, vec!["exa"]);
    }

    #[test]
    fn default_group_beats_configured_providers() {
        let ids = select_providers(&config_with_groups(), None, None).unwrap();
        assert_eq!(ids, vec!["tavily", "exa"]);
    }

    #[test]
    fn falls_back_to_enabled_providers() {
        let mut config = config_with_groups();
        config.groups.remove("default");
        let ids = select_providers(&config, None, None).unwrap();
        assert_eq!(ids, vec!["brave-search"]);
    }

    #[test]
    fn unknown_group_errors() {
        assert!(select_providers(&config_with_groups(), None, Some("nope")).is_err());
    }
}
