//! Run directory layout and manifest contents.

use librarium::normalize::dedup_citations;
use librarium::output::{
    self, MANIFEST_FILE, PROMPT_FILE, SOURCES_FILE, SUMMARY_FILE, create_run_dir, slugify,
};
use librarium::types::{
    Citation, DispatchMode, MANIFEST_VERSION, ProviderReport, ProviderResult, ReportStatus,
    RunManifest, SourceSummary, Tier,
};

fn sample_result() -> ProviderResult {
    ProviderResult {
        provider: "exa".to_string(),
        tier: Tier::RawSearch,
        content: "# Findings\n\npooling is good".to_string(),
        citations: vec![
            Citation {
                url: "https://pgbouncer.org".to_string(),
                title: Some("PgBouncer".to_string()),
                snippet: None,
                provider: "exa".to_string(),
            },
            Citation {
                url: "https://www.pgbouncer.org/".to_string(),
                title: None,
                snippet: None,
                provider: "exa".to_string(),
            },
        ],
        duration_ms: 1200,
        model: None,
        token_usage: None,
        error: None,
    }
}

#[test]
fn slug_matches_contract() {
    assert_eq!(
        slugify("PostgreSQL: Connection pooling!!"),
        "postgresql-connection-pooling"
    );
}

#[tokio::test]
async fn run_dir_name_embeds_timestamp_and_slug() {
    let base = tempfile::tempdir().unwrap();
    let run = create_run_dir(base.path(), "PostgreSQL: Connection pooling!!")
        .await
        .unwrap();
    let name = run.path.file_name().unwrap().to_string_lossy().into_owned();
    assert!(name.ends_with("-postgresql-connection-pooling"), "{name}");
    assert!(run.path.is_dir());
    assert!(run.timestamp > 0);
}

#[tokio::test]
async fn full_run_layout_is_written() {
    let base = tempfile::tempdir().unwrap();
    let run = create_run_dir(base.path(), "connection pooling").await.unwrap();

    output::write_prompt(&run.path, "connection pooling")
        .await
        .unwrap();

    let result = sample_result();
    let (output_file, meta_file) = output::write_provider_artifacts(&run.path, &result)
        .await
        .unwrap();
    assert_eq!(output_file, "exa.md");
    assert_eq!(meta_file, "exa.meta.json");

    let sources = dedup_citations(&result.citations);
    assert_eq!(sources.len(), 1);
    assert_eq!(sources[0].citation_count, 2);
    output::write_sources(&run.path, &sources).await.unwrap();

    let manifest = RunManifest {
        version: MANIFEST_VERSION,
        timestamp: run.timestamp,
        slug: run.slug.clone(),
        query: "connection pooling".to_string(),
        mode: DispatchMode::Mixed,
        output_dir: run.path.to_string_lossy().into_owned(),
        providers: vec![ProviderReport {
            id: "exa".to_string(),
            tier: Tier::RawSearch,
            status: ReportStatus::Success,
            duration_ms: 1200,
            word_count: result.word_count(),
            citation_count: 2,
            output_file: Some(output_file),
            meta_file: Some(meta_file),
            error: None,
            fallback_for: None,
        }],
        sources: SourceSummary {
            total: 2,
            unique: 1,
            file: SOURCES_FILE.to_string(),
        },
        async_tasks: vec![],
        exit_code: 0,
    };
    output::write_summary(&run.path, &manifest, &sources)
        .await
        .unwrap();
    output::write_manifest(&run.path, &manifest).await.unwrap();

    for file in [PROMPT_FILE, SUMMARY_FILE, SOURCES_FILE, MANIFEST_FILE] {
        assert!(run.path.join(file).exists(), "missing {file}");
    }

    // Content written verbatim.
    let md = std::fs::read_to_string(run.path.join("exa.md")).unwrap();
    assert_eq!(md, result.content);

    // Manifest round-trips with the documented shape.
    let manifest_json: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(run.path.join(MANIFEST_FILE)).unwrap())
            .unwrap();
    assert_eq!(manifest_json["version"], 1);
    assert_eq!(manifest_json["sources"]["unique"], 1);
    assert_eq!(manifest_json["providers"][0]["status"], "success");
    assert_eq!(manifest_json["exitCode"], 0);

    // No task file for a run without async handles.
    assert!(!run.path.join("async-tasks.json").exists());
}

#[tokio::test]
async fn summary_mentions_counts_and_sources() {
    let result = sample_result();
    let sources = dedup_citations(&result.citations);
    let manifest = RunManifest {
        version: MANIFEST_VERSION,
        timestamp: 1,
        slug: "s".to_string(),
        query: "connection pooling".to_string(),
        mode: DispatchMode::Sync,
        output_dir: "/tmp/x".to_string(),
        providers: vec![
            ProviderReport {
                id: "exa".to_string(),
                tier: Tier::RawSearch,
                status: ReportStatus::Success,
                duration_ms: 1200,
                word_count: 4,
                citation_count: 2,
                output_file: None,
                meta_file: None,
                error: None,
                fallback_for: None,
            },
            ProviderReport {
                id: "tavily".to_string(),
                tier: Tier::RawSearch,
                status: ReportStatus::Error,
                duration_ms: 300,
                word_count: 0,
                citation_count: 0,
                output_file: None,
                meta_file: None,
                error: Some("HTTP 500".to_string()),
                fallback_for: None,
            },
        ],
        sources: SourceSummary {
            total: 2,
            unique: 1,
            file: SOURCES_FILE.to_string(),
        },
        async_tasks: vec![],
        exit_code: 1,
    };

    let summary = output::render_summary(&manifest, &sources);
    assert!(summary.contains("**Query:** connection pooling"));
    assert!(summary.contains("1 succeeded, 1 failed, 0 async-pending"));
    assert!(summary.contains("1 unique sources"));
    assert!(summary.contains("### exa [success]"));
    assert!(summary.contains("### tavily [error]"));
    assert!(summary.contains("HTTP 500"));
    assert!(summary.contains("pgbouncer.org"));
}
