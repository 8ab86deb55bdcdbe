//! URL canonicalization and cross-provider citation deduplication.
//!
//! Normalization is a pure function of the input url. The canonical key
//! drops the scheme, lowercases the host, strips a leading `www.`, removes
//! known tracking parameters, and strips trailing slashes. Retained query
//! parameters keep their encounter order; this is a best-effort key, not a
//! full RFC 3986 canonicalization.

use std::collections::HashMap;

use url::Url;

use crate::types::{Citation, SourceEntry};

/// Query parameters removed during normalization.
const TRACKING_PARAMS: [&str; 11] = [
    "utm_source",
    "utm_medium",
    "utm_campaign",
    "utm_term",
    "utm_content",
    "ref",
    "fbclid",
    "gclid",
    "msclkid",
    "mc_cid",
    "mc_eid",
];

/// Canonical dedup key for a citation url.
pub fn normalize_url(raw: &str) -> String {
    let parsed = match Url::parse(raw.trim()) {
        Ok(u) => u,
        // Unparseable inputs still need a stable key.
        Err(_) => return raw.trim().to_lowercase().trim_end_matches('/').to_string(),
    };

    let mut host = parsed
        .host_str()
        .map(|h| h.to_lowercase())
        .unwrap_or_default();
    if let Some(stripped) = host.strip_prefix("www.") {
        host = stripped.to_string();
    }
    if let Some(port) = parsed.port() {
        host.push(':');
        host.push_str(&port.to_string());
    }

    let mut out = host;
    out.push_str(parsed.path());

    let retained: Vec<(String, String)> = parsed
        .query_pairs()
        .filter(|(k, _)| !TRACKING_PARAMS.contains(&k.as_ref()))
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    if !retained.is_empty() {
        let mut query = url::form_urlencoded::Serializer::new(String::new());
        for (k, v) in &retained {
            query.append_pair(k, v);
        }
        out.push('?');
        out.push_str(&query.finish());
    }

    if let Some(fragment) = parsed.fragment() {
        out.push('#');
        out.push_str(fragment);
    }

    out.trim_end_matches('/').to_string()
}

/// Bucket citations by normalized url and rank buckets by citation count.
///
/// Every occurrence counts, including repeats from the same provider; the
/// `providers` sequence holds distinct ids in first-seen order. The result
/// is sorted by count descending with a stable first-seen tie-break.
pub fn dedup_citations(citations: &[Citation]) -> Vec<SourceEntry> {
    let mut buckets: Vec<SourceEntry> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();

    for citation in citations {
        if citation.url.is_empty() {
            continue;
        }
        let key = normalize_url(&citation.url);
        let idx = *index.entry(key.clone()).or_insert_with(|| {
            buckets.push(SourceEntry {
                url: citation.url.clone(),
                normalized_url: key,
                title: None,
                providers: Vec::new(),
                citation_count: 0,
            });
            buckets.len() - 1
        });

        let bucket = &mut buckets[idx];
        bucket.citation_count += 1;
        if !bucket.providers.iter().any(|p| p == &citation.provider) {
            bucket.providers.push(citation.provider.clone());
        }
        if bucket.title.is_none()
            && let Some(title) = citation.title.as_deref().filter(|t| !t.is_empty())
        {
            bucket.title = Some(title.to_string());
        }
    }

    // Vec::sort_by is stable, so equal counts keep first-seen order.
    buckets.sort_by(|a, b| b.citation_count.cmp(&a.citation_count));
    buckets
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cite(url: &str, provider: &str) -> Citation {
        Citation {
            url: url.to_string(),
            title: None,
            snippet: None,
            provider: provider.to_string(),
        }
    }

    #[test]
    fn scheme_www_and_trailing_slash_collapse() {
        let forms = [
            "https://example.com/docs",
            "http://example.com/docs",
            "https://www.example.com/docs/",
            "https://EXAMPLE.com/docs",
        ];
        let keys: Vec<String> = forms.iter().map(|u| normalize_url(u)).collect();
        assert!(keys.iter().all(|k| k == "example.com/docs"), "{keys:?}");
    }

    #[test]
    fn tracking_params_removed_others_kept() {
        assert_eq!(
            normalize_url("https://a.com/p?utm_source=x&q=rust&fbclid=y"),
            "a.com/p?q=rust"
        );
        assert_eq!(normalize_url("https://a.com/p?utm_source=x"), "a.com/p");
    }

    #[test]
    fn retained_param_order_is_preserved() {
        assert_eq!(normalize_url("https://a.com/p?b=2&a=1"), "a.com/p?b=2&a=1");
        assert_eq!(normalize_url("https://a.com/p?a=1&b=2"), "a.com/p?a=1&b=2");
    }

    #[test]
    fn fragment_kept_port_kept() {
        assert_eq!(
            normalize_url("https://a.com/p#section"),
            "a.com/p#section"
        );
        assert_eq!(normalize_url("http://a.com:8080/p"), "a.com:8080/p");
    }

    #[test]
    fn unparseable_falls_back_to_lowercase_strip() {
        assert_eq!(normalize_url("Not A Url/"), "not a url");
    }

    #[test]
    fn dedup_counts_every_occurrence() {
        let citations = vec![
            cite("https://a.com/x", "p1"),
            cite("https://www.a.com/x/", "p2"),
            cite("https://a.com/x", "p1"),
        ];
        let sources = dedup_citations(&citations);
        assert_eq!(sources.len(), 1);
        assert_eq!(sources[0].citation_count, 3);
        assert_eq!(sources[0].providers, vec!["p1", "p2"]);
        assert_eq!(sources[0].url, "https://a.com/x");
    }

    #[test]
    fn dedup_takes_first_nonempty_title() {
        let citations = vec![
            Citation {
                url: "https://a.com/x".into(),
                title: Some(String::new()),
                snippet: None,
                provider: "p1".into(),
            },
            Citation {
                url: "https://a.com/x".into(),
                title: Some("The Title".into()),
                snippet: None,
                provider: "p2".into(),
            },
        ];
        let sources = dedup_citations(&citations);
        assert_eq!(sources[0].title.as_deref(), Some("The Title"));
    }

    #[test]
    fn empty_urls_are_skipped() {
        let citations = vec![cite("", "p1"), cite("https://a.com", "p2")];
        let sources = dedup_citations(&citations);
        assert_eq!(sources.len(), 1);
        assert_eq!(sources[0].providers, vec!["p2"]);
    }
}
