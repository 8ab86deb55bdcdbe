//! Provider registry: id to provider map, built once per invocation and
//! read-only afterwards. Lookups resolve legacy ids to their canonical
//! replacements first.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use crate::config::Config;
use crate::custom::load_custom_providers;
use crate::install::InstallMethod;
use crate::providers::brave::BraveProvider;
use crate::providers::exa::ExaProvider;
use crate::providers::gemini::GeminiDeepResearchProvider;
use crate::providers::grok::GrokProvider;
use crate::providers::http::HttpClient;
use crate::providers::openai::OpenAiDeepResearchProvider;
use crate::providers::perplexity::{SonarDeepResearchProvider, SonarProvider};
use crate::providers::tavily::TavilyProvider;
use crate::providers::{LEGACY_IDS, Provider};

pub struct Registry {
    providers: HashMap<String, Arc<dyn Provider>>,
}

impl Registry {
    /// Build the registry: all built-ins plus every trusted custom
    /// provider that loads cleanly.
    pub async fn initialize(config: &Config, install: InstallMethod, project_dir: &Path) -> Self {
        let mut providers: HashMap<String, Arc<dyn Provider>> = HashMap::new();

        for provider in builtin_providers() {
            providers.insert(provider.descriptor().id.clone(), provider);
        }

        for provider in load_custom_providers(config, install, project_dir).await {
            let id = provider.descriptor().id.clone();
            providers.insert(id, provider);
        }

        Self { providers }
    }

    /// Registry with an explicit provider set, used by tests and the poll
    /// loop fakes.
    pub fn with_providers(list: Vec<Arc<dyn Provider>>) -> Self {
        let mut providers = HashMap::new();
        for provider in list {
            providers.insert(provider.descriptor().id.clone(), provider);
        }
        Self { providers }
    }

    /// Map a legacy id to its canonical form; unknown ids pass through.
    pub fn canonical_id(id: &str) -> &str {
        LEGACY_IDS
            .iter()
            .find(|(legacy, _)| *legacy == id)
            .map(|(_, canonical)| *canonical)
            .unwrap_or(id)
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn Provider>> {
        self.providers.get(Self::canonical_id(id)).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.providers.contains_key(Self::canonical_id(id))
    }

    /// All providers sorted by id.
    pub fn list(&self) -> Vec<Arc<dyn Provider>> {
        let mut all: Vec<Arc<dyn Provider>> = self.providers.values().cloned().collect();
        all.sort_by(|a, b| a.descriptor().id.cmp(&b.descriptor().id));
        all
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

/// Descriptors of every built-in, without touching the network or config.
pub fn builtin_descriptors() -> Vec<crate::types::ProviderDescriptor> {
    builtin_providers()
        .iter()
        .map(|p| p.descriptor().clone())
        .collect()
}

fn builtin_providers() -> Vec<Arc<dyn Provider>> {
    let http = HttpClient::new();
    vec![
        Arc::new(SonarProvider::new(http.clone())),
        Arc::new(SonarDeepResearchProvider::new(http.clone())),
        Arc::new(OpenAiDeepResearchProvider::new(http.clone())),
        Arc::new(GeminiDeepResearchProvider::new(http.clone())),
        Arc::new(GrokProvider::new(http.clone())),
        Arc::new(ExaProvider::new(http.clone())),
        Arc::new(TavilyProvider::new(http.clone())),
        Arc::new(BraveProvider::new(http)),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::BUILTIN_IDS;

    #[test]
    fn builtins_cover_the_reserved_id_list() {
        let providers = builtin_providers();
        let ids: Vec<String> = providers
            .iter()
            .map(|p| p.descriptor().id.clone())
            .collect();
        assert_eq!(ids.len(), BUILTIN_IDS.len());
        for id in BUILTIN_IDS {
            assert!(ids.iter().any(|i| i == id), "missing builtin {id}");
        }
    }

    #[test]
    fn legacy_lookup_resolves_to_canonical() {
        let registry = Registry::with_providers(builtin_providers());
        let via_legacy = registry.get("perplexity-sonar").unwrap();
        let via_canonical = registry.get("perplexity-sonar-pro").unwrap();
        assert_eq!(
            via_legacy.descriptor().id,
            via_canonical.descriptor().id
        );
    }

    #[test]
    fn unknown_id_is_absent() {
        let registry = Registry::with_providers(builtin_providers());
        assert!(registry.get("does-not-exist").is_none());
    }

    #[test]
    fn list_is_sorted_by_id() {
        let registry = Registry::with_providers(builtin_providers());
        let ids: Vec<String> = registry
            .list()
            .iter()
            .map(|p| p.descriptor().id.clone())
            .collect();
        let mut sorted = ids.clone();
        sorted.sort();
        assert_eq!(ids, sorted);
    }
}
