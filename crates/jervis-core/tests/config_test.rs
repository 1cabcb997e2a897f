use jervis_core::config::Config;

#[test]
fn default_config() {
    let cfg = Config::default();
    assert_eq!(cfg.general.project_name, "jervis");
    assert_eq!(cfg.logging.level, "info");
    assert_eq!(cfg.polling.polling_interval_ms, 60_000);
    assert_eq!(cfg.background.qualification_concurrency, 8);
    assert_eq!(cfg.qualifier.initial_backoff_ms, 5_000);
    assert!(!cfg.weaviate.auto_migrate.enabled);
    assert_eq!(cfg.retry.http.max_attempts, 3);
    cfg.validate().expect("defaults validate");
}

#[test]
fn config_roundtrip() {
    let cfg = Config::default();
    let toml_str = cfg.to_toml().expect("serialize to toml");
    assert!(toml_str.contains("jervis"));

    let parsed: Config = toml::from_str(&toml_str).expect("parse toml back");
    assert_eq!(parsed.general.project_name, cfg.general.project_name);
    assert_eq!(parsed.polling.polling_interval_ms, cfg.polling.polling_interval_ms);
    assert_eq!(parsed.rate_limit.max_requests_per_second, cfg.rate_limit.max_requests_per_second);
    parsed.validate().expect("config validates");
}

#[test]
fn config_partial_toml_fills_defaults() {
    let partial = r#"
[general]
project_name = "my-kb"

[polling]
polling_interval_ms = 15000
"#;
    let cfg: Config = toml::from_str(partial).expect("parse partial");
    assert_eq!(cfg.general.project_name, "my-kb");
    assert_eq!(cfg.polling.polling_interval_ms, 15_000);
    assert_eq!(cfg.logging.level, "info");
    assert_eq!(cfg.background.qualification_concurrency, 8);
    cfg.validate().expect("config validates");
}

#[test]
fn invalid_qualifier_backoff_fails_validation() {
    let mut cfg = Config::default();
    cfg.qualifier.initial_backoff_ms = 999_999;
    cfg.qualifier.max_backoff_ms = 1;
    let err = cfg.validate().expect_err("validation should fail");
    assert!(err.to_string().contains("qualifier"));
}

#[test]
fn invalid_retry_backoff_fails_validation() {
    let mut cfg = Config::default();
    cfg.retry.http.initial_backoff_ms = 999_999;
    cfg.retry.http.max_backoff_ms = 1;
    let err = cfg.validate().expect_err("validation should fail");
    assert!(err.to_string().contains("retry"));
}
