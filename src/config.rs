//! Layered configuration: global file, project file, CLI overrides.
//!
//! Both files are strict-schema JSON; unknown fields are rejected
//! everywhere except inside free-form `options` blocks. CLI overrides
//! apply to `defaults` only. Provider maps, custom providers, trusted ids,
//! and groups merge per key across the file layers, later layer winning.

use std::collections::{HashMap, HashSet};
use std::env;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::LibrariumError;
use crate::providers::LEGACY_IDS;
use crate::types::DispatchMode;

pub const PROJECT_CONFIG_FILE: &str = ".librarium.json";
pub const CONFIG_VERSION: u32 = 1;

pub const DEFAULT_OUTPUT_DIR: &str = "./agents/librarium";
pub const DEFAULT_MAX_PARALLEL: usize = 4;
pub const DEFAULT_TIMEOUT_SECS: u64 = 300;
pub const DEFAULT_ASYNC_TIMEOUT_SECS: u64 = 1800;
pub const DEFAULT_ASYNC_POLL_INTERVAL_SECS: u64 = 30;

// ---------------------------------------------------------------------------
// File schema
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct ConfigFile {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub defaults: Option<DefaultsFile>,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub providers: HashMap<String, ProviderEntry>,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub custom_providers: HashMap<String, CustomProviderEntry>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub trusted_provider_ids: Vec<String>,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub groups: HashMap<String, Vec<String>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct DefaultsFile {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_dir: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_parallel: Option<usize>,
    /// Seconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    /// Seconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub async_timeout: Option<u64>,
    /// Seconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub async_poll_interval: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<DispatchMode>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct ProviderEntry {
    /// Env-ref string: a leading `$` names an environment variable looked
    /// up at use time; anything else is a literal key. Never resolved when
    /// the config is written back out.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Free-form; the only place unknown fields are accepted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub options: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback: Option<String>,
}

impl ProviderEntry {
    pub fn is_enabled(&self) -> bool {
        self.enabled.unwrap_or(true)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct CustomProviderEntry {
    /// `npm` or `script`.
    #[serde(rename = "type")]
    pub kind: String,
    /// npm: module specifier.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub module: Option<String>,
    /// script: executable.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub env: HashMap<String, String>,
    /// Resolved relative to the invoking project when not absolute.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub options: Option<Value>,
}

// ---------------------------------------------------------------------------
// Resolved config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Defaults {
    pub output_dir: String,
    pub max_parallel: usize,
    pub timeout: u64,
    pub async_timeout: u64,
    pub async_poll_interval: u64,
    pub mode: DispatchMode,
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            output_dir: DEFAULT_OUTPUT_DIR.to_string(),
            max_parallel: DEFAULT_MAX_PARALLEL,
            timeout: DEFAULT_TIMEOUT_SECS,
            async_timeout: DEFAULT_ASYNC_TIMEOUT_SECS,
            async_poll_interval: DEFAULT_ASYNC_POLL_INTERVAL_SECS,
            mode: DispatchMode::Mixed,
        }
    }
}

/// CLI-level overrides; only `defaults` can be overridden from the
/// command line.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub output_dir: Option<String>,
    pub max_parallel: Option<usize>,
    pub timeout: Option<u64>,
    pub mode: Option<DispatchMode>,
}

#[derive(Debug, Clone, Default)]
pub struct Config {
    pub defaults: Defaults,
    pub providers: HashMap<String, ProviderEntry>,
    pub custom_providers: HashMap<String, CustomProviderEntry>,
    pub trusted_provider_ids: HashSet<String>,
    pub groups: HashMap<String, Vec<String>>,
    /// Non-fatal findings from migration and fallback validation.
    pub warnings: Vec<String>,
}

impl Config {
    /// Load and merge all layers for the given working directory.
    pub fn load(cwd: &Path, overrides: &CliOverrides) -> Result<Self, LibrariumError> {
        let mut merged = ConfigFile::default();

        if let Some(path) = global_config_path()
            && path.exists()
        {
            let layer = read_config_file(&path)?;
            merged.merge(layer);
            tracing::debug!("loaded global config from {}", path.display());
        }

        let project_path = project_config_path(cwd);
        if project_path.exists() {
            let layer = read_config_file(&project_path)?;
            merged.merge(layer);
            tracing::debug!("loaded project config from {}", project_path.display());
        }

        Self::resolve(merged, overrides)
    }

    /// Resolve one merged file plus CLI overrides into the runtime config.
    pub fn resolve(mut file: ConfigFile, overrides: &CliOverrides) -> Result<Self, LibrariumError> {
        let mut warnings = Vec::new();
        migrate_legacy_ids(&mut file, &mut warnings);

        let defaults_file = file.defaults.unwrap_or_default();
        let base = Defaults::default();
        let defaults = Defaults {
            output_dir: overrides
                .output_dir
                .clone()
                .or(defaults_file.output_dir)
                .unwrap_or(base.output_dir),
            max_parallel: overrides
                .max_parallel
                .or(defaults_file.max_parallel)
                .unwrap_or(base.max_parallel)
                .max(1),
            timeout: overrides
                .timeout
                .or(defaults_file.timeout)
                .unwrap_or(base.timeout)
                .max(1),
            async_timeout: defaults_file
                .async_timeout
                .unwrap_or(base.async_timeout)
                .max(1),
            async_poll_interval: defaults_file
                .async_poll_interval
                .unwrap_or(base.async_poll_interval)
                .max(1),
            mode: overrides.mode.or(defaults_file.mode).unwrap_or(base.mode),
        };

        let mut config = Self {
            defaults,
            providers: file.providers,
            custom_providers: file.custom_providers,
            trusted_provider_ids: file.trusted_provider_ids.into_iter().collect(),
            groups: file.groups,
            warnings,
        };
        validate_fallbacks(&mut config);

        for warning in &config.warnings {
            tracing::warn!("{warning}");
        }
        Ok(config)
    }

    pub fn provider_entry(&self, id: &str) -> Option<&ProviderEntry> {
        self.providers.get(id)
    }
}

// ---------------------------------------------------------------------------
// Layer merge
// ---------------------------------------------------------------------------

impl ConfigFile {
    /// Merge a later layer on top of this one. Defaults merge field-wise;
    /// maps merge per key with the later entry replacing the earlier one.
    pub fn merge(&mut self, other: ConfigFile) {
        if other.version.is_some() {
            self.version = other.version;
        }
        match (&mut self.defaults, other.defaults) {
            (Some(mine), Some(theirs)) => {
                if theirs.output_dir.is_some() {
                    mine.output_dir = theirs.output_dir;
                }
                if theirs.max_parallel.is_some() {
                    mine.max_parallel = theirs.max_parallel;
                }
                if theirs.timeout.is_some() {
                    mine.timeout = theirs.timeout;
                }
                if theirs.async_timeout.is_some() {
                    mine.async_timeout = theirs.async_timeout;
                }
                if theirs.async_poll_interval.is_some() {
                    mine.async_poll_interval = theirs.async_poll_interval;
                }
                if theirs.mode.is_some() {
                    mine.mode = theirs.mode;
                }
            }
            (mine @ None, theirs @ Some(_)) => *mine = theirs,
            _ => {}
        }
        for (k, v) in other.providers {
            self.providers.insert(k, v);
        }
        for (k, v) in other.custom_providers {
            self.custom_providers.insert(k, v);
        }
        for id in other.trusted_provider_ids {
            if !self.trusted_provider_ids.contains(&id) {
                self.trusted_provider_ids.push(id);
            }
        }
        for (k, v) in other.groups {
            self.groups.insert(k, v);
        }
    }
}

// ---------------------------------------------------------------------------
// Legacy-id migration
// ---------------------------------------------------------------------------

fn migrate_legacy_ids(file: &mut ConfigFile, warnings: &mut Vec<String>) {
    for (legacy, canonical) in LEGACY_IDS {
        if let Some(entry) = file.providers.remove(*legacy) {
            if file.providers.contains_key(*canonical) {
                warnings.push(format!(
                    "both '{legacy}' and '{canonical}' are configured; keeping '{canonical}'"
                ));
            } else {
                warnings.push(format!(
                    "provider id '{legacy}' is deprecated; migrated to '{canonical}'"
                ));
                file.providers.insert((*canonical).to_string(), entry);
            }
        }
    }

    for (name, members) in file.groups.iter_mut() {
        let mut rewritten = false;
        for member in members.iter_mut() {
            if let Some((_, canonical)) = LEGACY_IDS.iter().find(|(l, _)| l == member) {
                *member = (*canonical).to_string();
                rewritten = true;
            }
        }
        if rewritten {
            warnings.push(format!(
                "group '{name}' contained legacy provider ids; rewritten"
            ));
        }
    }

    for (id, entry) in file.providers.iter_mut() {
        if let Some(fallback) = entry.fallback.as_mut()
            && let Some((_, canonical)) = LEGACY_IDS.iter().find(|(l, _)| l == fallback)
        {
            warnings.push(format!(
                "fallback of '{id}' used a legacy id; rewritten to '{canonical}'"
            ));
            *fallback = (*canonical).to_string();
        }
    }
}

// ---------------------------------------------------------------------------
// Fallback validation
// ---------------------------------------------------------------------------

fn validate_fallbacks(config: &mut Config) {
    let known: HashSet<&str> = crate::providers::BUILTIN_IDS
        .iter()
        .copied()
        .chain(config.custom_providers.keys().map(String::as_str))
        .collect();

    let mut warnings = Vec::new();
    for (id, entry) in &config.providers {
        let Some(fallback) = entry.fallback.as_deref() else {
            continue;
        };
        if fallback == id {
            warnings.push(format!("provider '{id}' lists itself as fallback"));
            continue;
        }
        if !known.contains(fallback) {
            warnings.push(format!("provider '{id}' has unknown fallback '{fallback}'"));
            continue;
        }
        // Chains are never followed, so a fallback with its own fallback
        // is almost certainly a misconfiguration.
        if config
            .providers
            .get(fallback)
            .and_then(|e| e.fallback.as_deref())
            .is_some()
        {
            warnings.push(format!(
                "fallback '{fallback}' of '{id}' has its own fallback, which will not be followed"
            ));
        }
    }
    config.warnings.extend(warnings);
}

// ---------------------------------------------------------------------------
// Paths and file IO
// ---------------------------------------------------------------------------

/// XDG-compliant global config path: ~/.config/librarium/config.json
pub fn global_config_path() -> Option<PathBuf> {
    if let Ok(xdg) = env::var("XDG_CONFIG_HOME") {
        Some(PathBuf::from(xdg).join("librarium/config.json"))
    } else if let Ok(home) = env::var("HOME") {
        Some(PathBuf::from(home).join(".config/librarium/config.json"))
    } else {
        None
    }
}

pub fn project_config_path(cwd: &Path) -> PathBuf {
    cwd.join(PROJECT_CONFIG_FILE)
}

pub fn read_config_file(path: &Path) -> Result<ConfigFile, LibrariumError> {
    let contents = std::fs::read_to_string(path).map_err(|e| LibrariumError::ConfigLoad {
        path: path.display().to_string(),
        message: e.to_string(),
    })?;
    let file: ConfigFile =
        serde_json::from_str(&contents).map_err(|e| LibrariumError::ConfigLoad {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
    if let Some(version) = file.version
        && version != CONFIG_VERSION
    {
        return Err(LibrariumError::ConfigLoad {
            path: path.display().to_string(),
            message: format!("unsupported config version {version} (expected {CONFIG_VERSION})"),
        });
    }
    Ok(file)
}

/// Atomic write with owner-only permissions. Config files can name key
/// env-refs and plugin commands; nobody else needs to read them.
pub fn write_config_file(path: &Path, file: &ConfigFile) -> Result<(), LibrariumError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(file)
        .map_err(|e| LibrariumError::Other(format!("failed to encode config: {e}")))?;

    let tmp_path = path.with_extension("json.tmp");
    std::fs::write(&tmp_path, json.as_bytes())?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&tmp_path, std::fs::Permissions::from_mode(0o600))?;
    }
    if let Err(e) = std::fs::rename(&tmp_path, path) {
        let _ = std::fs::remove_file(&tmp_path);
        return Err(e.into());
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(json: &str) -> ConfigFile {
        serde_json::from_str(json).expect("invalid JSON in test")
    }

    fn resolve(json: &str) -> Config {
        Config::resolve(parse(json), &CliOverrides::default()).unwrap()
    }

    #[test]
    fn empty_config_gets_defaults() {
        let config = resolve("{}");
        assert_eq!(config.defaults.output_dir, DEFAULT_OUTPUT_DIR);
        assert_eq!(config.defaults.max_parallel, DEFAULT_MAX_PARALLEL);
        assert_eq!(config.defaults.mode, DispatchMode::Mixed);
    }

    #[test]
    fn unknown_top_level_field_is_rejected() {
        assert!(serde_json::from_str::<ConfigFile>(r#"{"banana": 1}"#).is_err());
        assert!(
            serde_json::from_str::<ConfigFile>(r#"{"providers": {"exa": {"apiKeyy": "x"}}}"#)
                .is_err()
        );
    }

    #[test]
    fn unknown_fields_allowed_inside_options() {
        let config =
            resolve(r#"{"providers": {"exa": {"options": {"anything": {"goes": true}}}}}"#);
        assert!(config.providers["exa"].options.is_some());
    }

    #[test]
    fn merge_defaults_field_wise() {
        let mut base = parse(r#"{"defaults": {"maxParallel": 2, "timeout": 60}}"#);
        base.merge(parse(r#"{"defaults": {"timeout": 120}}"#));
        let defaults = base.defaults.unwrap();
        assert_eq!(defaults.max_parallel, Some(2));
        assert_eq!(defaults.timeout, Some(120));
    }

    #[test]
    fn merge_providers_per_key() {
        let mut base =
            parse(r#"{"providers": {"exa": {"enabled": false}, "tavily": {"model": "m"}}}"#);
        base.merge(parse(r#"{"providers": {"exa": {"enabled": true}}}"#));
        assert_eq!(base.providers["exa"].enabled, Some(true));
        assert_eq!(base.providers["tavily"].model.as_deref(), Some("m"));
    }

    #[test]
    fn cli_overrides_apply_to_defaults_only() {
        let overrides = CliOverrides {
            output_dir: Some("/tmp/out".into()),
            max_parallel: Some(8),
            timeout: Some(10),
            mode: Some(DispatchMode::Sync),
        };
        let config =
            Config::resolve(parse(r#"{"defaults": {"maxParallel": 2}}"#), &overrides).unwrap();
        assert_eq!(config.defaults.output_dir, "/tmp/out");
        assert_eq!(config.defaults.max_parallel, 8);
        assert_eq!(config.defaults.timeout, 10);
        assert_eq!(config.defaults.mode, DispatchMode::Sync);
    }

    #[test]
    fn legacy_provider_key_is_migrated_with_warning() {
        let config = resolve(r#"{"providers": {"perplexity-sonar": {"model": "m"}}}"#);
        assert!(!config.providers.contains_key("perplexity-sonar"));
        assert_eq!(
            config.providers["perplexity-sonar-pro"].model.as_deref(),
            Some("m")
        );
        assert_eq!(
            config
                .warnings
                .iter()
                .filter(|w| w.contains("perplexity-sonar"))
                .count(),
            1
        );
    }

    #[test]
    fn canonical_entry_wins_over_legacy() {
        let config = resolve(
            r#"{"providers": {
                "perplexity-sonar": {"model": "old"},
                "perplexity-sonar-pro": {"model": "new"}
            }}"#,
        );
        assert_eq!(
            config.providers["perplexity-sonar-pro"].model.as_deref(),
            Some("new")
        );
        assert!(config.warnings.iter().any(|w| w.contains("keeping")));
    }

    #[test]
    fn group_members_are_rewritten() {
        let config = resolve(r#"{"groups": {"fast": ["exa-search", "tavily"]}}"#);
        assert_eq!(config.groups["fast"], vec!["exa", "tavily"]);
        assert!(config.warnings.iter().any(|w| w.contains("group 'fast'")));
    }

    #[test]
    fn fallback_targets_are_rewritten() {
        let config = resolve(r#"{"providers": {"tavily": {"fallback": "brave"}}}"#);
        assert_eq!(
            config.providers["tavily"].fallback.as_deref(),
            Some("brave-search")
        );
    }

    #[test]
    fn self_fallback_warns() {
        let config = resolve(r#"{"providers": {"exa": {"fallback": "exa"}}}"#);
        assert!(config.warnings.iter().any(|w| w.contains("itself")));
    }

    #[test]
    fn unknown_fallback_warns() {
        let config = resolve(r#"{"providers": {"exa": {"fallback": "nonexistent"}}}"#);
        assert!(config.warnings.iter().any(|w| w.contains("unknown fallback")));
    }

    #[test]
    fn chained_fallback_warns() {
        let config = resolve(
            r#"{"providers": {
                "exa": {"fallback": "tavily"},
                "tavily": {"fallback": "brave-search"}
            }}"#,
        );
        assert!(
            config
                .warnings
                .iter()
                .any(|w| w.contains("will not be followed"))
        );
    }

    #[test]
    fn version_mismatch_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"version": 9}"#).unwrap();
        let err = read_config_file(&path).unwrap_err();
        assert!(err.to_string().contains("unsupported config version"));
    }

    #[test]
    fn parse_error_names_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{not json").unwrap();
        let err = read_config_file(&path).unwrap_err();
        assert!(err.to_string().contains("config.json"));
    }

    #[test]
    fn written_config_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let mut file = ConfigFile {
            version: Some(CONFIG_VERSION),
            ..Default::default()
        };
        file.groups
            .insert("default".to_string(), vec!["exa".to_string()]);
        write_config_file(&path, &file).unwrap();
        let back = read_config_file(&path).unwrap();
        assert_eq!(back.groups["default"], vec!["exa"]);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }
}
