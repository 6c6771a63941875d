//! Adapter construction from configuration.

use std::path::PathBuf;

use pulse_common::{parse_config, AppConfig, IngestError, SourceKind};
use pulse_sources::{build_adapter, CursorMode, RetryPolicy};

const CONFIG: &str = r#"
[[sources]]
id = "reddit"
kind = "social_post"
subreddits = ["personalfinance"]
terms = ["Chase"]

[[sources]]
id = "cfpb"
kind = "complaint_registry"
[sources.companies]
chase = ["JPMORGAN CHASE & CO."]

[[sources]]
id = "trends"
kind = "trend_sample"
[sources.keywords]
chase = ["Chase Bank"]

[[sources]]
id = "glassdoor"
kind = "employee_review"
[sources.company_ids]
chase = "5224839"
"#;

fn app(with_secrets: bool) -> AppConfig {
    let secret = |v: &str| with_secrets.then(|| v.to_string());
    AppConfig {
        database_url: None,
        landing_dir: PathBuf::from("./landing"),
        config_path: PathBuf::from("pulse.toml"),
        reddit_client_id: secret("id"),
        reddit_client_secret: secret("secret"),
        reddit_user_agent: "pulse-test/0.1".to_string(),
        rapidapi_key: secret("key"),
        rapidapi_host: secret("reviews.example"),
        serpapi_key: secret("serp"),
    }
}

#[test]
fn builds_every_variant_when_secrets_are_present() {
    let config = parse_config(CONFIG).unwrap();
    let app = app(true);
    let kinds: Vec<_> = config
        .sources
        .iter()
        .map(|s| {
            let adapter =
                build_adapter(s, &app, reqwest::Client::new(), RetryPolicy::immediate(1)).unwrap();
            assert_eq!(adapter.source_id(), &s.id);
            (adapter.kind(), adapter.cursor_mode())
        })
        .collect();

    assert_eq!(
        kinds,
        vec![
            (SourceKind::SocialPost, CursorMode::Incremental),
            (SourceKind::ComplaintRegistry, CursorMode::Incremental),
            (SourceKind::TrendSample, CursorMode::Stateless),
            (SourceKind::EmployeeReview, CursorMode::Incremental),
        ]
    );
}

#[test]
fn missing_secrets_are_config_errors() {
    let config = parse_config(CONFIG).unwrap();
    let app = app(false);
    for source in config.sources.iter().filter(|s| s.kind() != SourceKind::ComplaintRegistry) {
        let err = build_adapter(source, &app, reqwest::Client::new(), RetryPolicy::default())
            .err()
            .unwrap();
        assert!(matches!(err, IngestError::Config(_)), "{}: {err}", source.id);
    }
}
