// tests/ingest_config.rs
use jma_feed_ingest::config::{IngestConfig, ENV_CONFIG_PATH};
use jma_feed_ingest::ingest::types::FrequencyClass;
use std::{env, fs};

fn clear_env() {
    env::remove_var(ENV_CONFIG_PATH);
    env::remove_var("PERIODIC_FETCH_INTERVAL");
    env::remove_var("DOWNLOAD_LIMIT_THRESHOLD");
    env::remove_var("DATABASE_URL");
}

#[serial_test::serial]
#[test]
fn default_uses_env_then_fallbacks() {
    // Isolate CWD so the repo's own config/ is not picked up
    let old = env::current_dir().unwrap();
    let tmp = tempfile::tempdir().unwrap();
    env::set_current_dir(tmp.path()).unwrap();
    clear_env();

    // 1) Nothing on disk → built-in JMA feeds
    let cfg = IngestConfig::load_default().unwrap();
    assert_eq!(cfg.sources.len(), 6);

    // 2) ./config/ingest.toml
    let cfg_dir = tmp.path().join("config");
    fs::create_dir_all(&cfg_dir).unwrap();
    fs::write(
        cfg_dir.join("ingest.toml"),
        r#"
daily_quota_bytes = 1000
[[sources]]
id = "only"
url = "https://feeds.test/only.xml"
category = "その他"
frequency = "low"
"#,
    )
    .unwrap();
    let cfg = IngestConfig::load_default().unwrap();
    assert_eq!(cfg.sources.len(), 1);
    assert_eq!(cfg.sources[0].frequency, FrequencyClass::Low);
    assert_eq!(cfg.daily_quota_bytes, 1000);

    // 3) Env path wins
    let p_env = tmp.path().join("other.toml");
    fs::write(&p_env, "base_interval_secs = 42\n").unwrap();
    env::set_var(ENV_CONFIG_PATH, p_env.display().to_string());
    let cfg = IngestConfig::load_default().unwrap();
    assert_eq!(cfg.base_interval_secs, 42);
    assert_eq!(cfg.sources.len(), 6);

    // 4) Env path to nowhere is an error
    env::set_var(ENV_CONFIG_PATH, tmp.path().join("nope.toml").display().to_string());
    assert!(IngestConfig::load_default().is_err());

    clear_env();
    env::set_current_dir(&old).unwrap();
}

#[serial_test::serial]
#[test]
fn env_overrides_interval_and_threshold() {
    let tmp = tempfile::tempdir().unwrap();
    let p = tmp.path().join("ingest.toml");
    fs::write(&p, "soft_threshold = 0.9\n").unwrap();
    clear_env();

    env::set_var("PERIODIC_FETCH_INTERVAL", "600  # ten minutes");
    env::set_var("DOWNLOAD_LIMIT_THRESHOLD", "0.5");
    env::set_var("DATABASE_URL", "sqlite::memory:");
    let cfg = IngestConfig::load_from(&p).unwrap();
    assert_eq!(cfg.base_interval_secs, 600);
    assert!((cfg.soft_threshold - 0.5).abs() < 1e-9);
    assert_eq!(cfg.database_url, "sqlite::memory:");

    env::set_var("DOWNLOAD_LIMIT_THRESHOLD", "2.0");
    assert!(IngestConfig::load_from(&p).is_err());

    env::set_var("PERIODIC_FETCH_INTERVAL", "soon");
    assert!(IngestConfig::load_from(&p).is_err());

    clear_env();
}
