//! Normalizer properties: canonicalization is a pure function, dedup is
//! idempotent, ranking is stable.

use librarium::normalize::{dedup_citations, normalize_url};
use librarium::types::Citation;

fn cite(url: &str, provider: &str) -> Citation {
    Citation {
        url: url.to_string(),
        title: None,
        snippet: None,
        provider: provider.to_string(),
    }
}

#[test]
fn cross_provider_dedup_ranks_by_count() {
    // Three spellings of the same page across three providers, plus one
    // singleton.
    let citations = vec![
        cite("https://a.example/x", "p1"),
        cite("https://www.a.example/x/", "p2"),
        cite("https://a.example/x", "p3"),
        cite("https://b.example/y", "p1"),
    ];
    let sources = dedup_citations(&citations);

    assert_eq!(sources.len(), 2);
    assert_eq!(sources[0].normalized_url, "a.example/x");
    assert_eq!(sources[0].citation_count, 3);
    assert_eq!(sources[0].providers, vec!["p1", "p2", "p3"]);
    assert_eq!(sources[0].url, "https://a.example/x");

    assert_eq!(sources[1].normalized_url, "b.example/y");
    assert_eq!(sources[1].citation_count, 1);
}

#[test]
fn normalization_is_invariant_across_trivial_differences() {
    let variants = [
        "https://Docs.Example.com/guide?utm_source=news&id=7",
        "http://docs.example.com/guide/?id=7&utm_campaign=x",
        "https://www.docs.example.com/guide?id=7&fbclid=abc",
    ];
    let keys: Vec<String> = variants.iter().map(|u| normalize_url(u)).collect();
    assert!(
        keys.iter().all(|k| k == "docs.example.com/guide?id=7"),
        "{keys:?}"
    );
}

#[test]
fn dedup_is_idempotent_modulo_counts() {
    let citations = vec![
        cite("https://a.com/x", "p1"),
        cite("https://a.com/x", "p2"),
        cite("https://b.com/y", "p1"),
    ];
    let first = dedup_citations(&citations);

    // Feed the deduplicated urls back through as singleton citations.
    let again: Vec<Citation> = first
        .iter()
        .map(|s| cite(&s.url, &s.providers[0]))
        .collect();
    let second = dedup_citations(&again);

    let first_keys: Vec<&str> = first.iter().map(|s| s.normalized_url.as_str()).collect();
    let second_keys: Vec<&str> = second.iter().map(|s| s.normalized_url.as_str()).collect();
    assert_eq!(first_keys, second_keys);
    assert!(second.iter().all(|s| s.citation_count == 1));
}

#[test]
fn equal_counts_preserve_first_seen_order() {
    let citations = vec![
        cite("https://z.com/1", "p1"),
        cite("https://m.com/2", "p1"),
        cite("https://a.com/3", "p1"),
    ];
    let sources = dedup_citations(&citations);
    let keys: Vec<&str> = sources.iter().map(|s| s.normalized_url.as_str()).collect();
    assert_eq!(keys, vec!["z.com/1", "m.com/2", "a.com/3"]);
}

#[test]
fn same_provider_duplicates_count_separately() {
    let citations = vec![
        cite("https://a.com/x", "p1"),
        cite("https://a.com/x", "p1"),
    ];
    let sources = dedup_citations(&citations);
    assert_eq!(sources[0].citation_count, 2);
    assert_eq!(sources[0].providers, vec!["p1"]);
}
