//! Integration tests for configuration loading

use parkhub::domain::Tariff;
use parkhub::infra::Config;
use std::io::Write;
use std::time::Duration;
use tempfile::NamedTempFile;

#[test]
fn test_load_config_from_file() {
    let mut temp_file = NamedTempFile::new().unwrap();

    let config_content = r#"
[site]
id = "test-site"

[server]
http_port = 8181

[observers]
enabled = false
port = 9191
stall_timeout_ms = 750

[billing]
default_tariff = "почасовой"
fallback_rate = 300

[journal]
enabled = false
file = "/tmp/parkhub-test.jsonl"

[metrics]
interval_secs = 15

[[facilities]]
name = "Lot 7"
capacity = 3
spots = ["7-1", "7-2"]

[[facilities.tariffs]]
kind = "почасовой"
price_per_hour = 150
"#;

    temp_file.write_all(config_content.as_bytes()).unwrap();
    temp_file.flush().unwrap();

    let config = Config::from_file(temp_file.path()).unwrap();

    assert_eq!(config.site_id(), "test-site");
    assert_eq!(config.http_port(), 8181);
    assert!(!config.observers_enabled());
    assert_eq!(config.observer_port(), 9191);
    assert_eq!(config.observer_stall_timeout(), Duration::from_millis(750));
    assert_eq!(config.default_tariff(), "почасовой");
    assert_eq!(config.fallback_rate(), 300);
    assert!(!config.journal_enabled());
    assert_eq!(config.metrics_interval_secs(), 15);

    let seed = &config.facilities()[0];
    assert_eq!(seed.name, "Lot 7");
    assert_eq!(seed.capacity(), 3);
    assert_eq!(seed.spots, vec!["7-1", "7-2"]);
    assert_eq!(seed.tariffs, vec![Tariff::new("почасовой", 150)]);
}

#[test]
fn test_load_from_path_fallback() {
    let config = Config::load_from_path("/nonexistent/config.toml");
    assert_eq!(config.http_port(), 8080);
    assert_eq!(config.fallback_rate(), 250);
    assert_eq!(config.config_file(), "default");
}

#[test]
fn test_invalid_seed_rejected() {
    let mut temp_file = NamedTempFile::new().unwrap();
    temp_file.write_all(b"[[facilities]]\nname = \"Ghost\"\n").unwrap();
    temp_file.flush().unwrap();

    assert!(Config::from_file(temp_file.path()).is_err());
}

#[test]
fn test_dev_config_parses() {
    let config = Config::from_file(concat!(env!("CARGO_MANIFEST_DIR"), "/config/dev.toml")).unwrap();
    assert_eq!(config.facilities().len(), 2);
    assert_eq!(config.facilities()[1].capacity(), 2);
}
