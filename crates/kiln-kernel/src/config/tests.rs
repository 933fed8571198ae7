//! Tests for hot-reload configuration loading

use super::*;
use std::fs;
use std::path::PathBuf;
use tempfile::TempDir;

fn create_test_file(dir: &TempDir, filename: &str, content: &str) -> PathBuf {
    let path = dir.path().join(filename);
    fs::write(&path, content).unwrap();
    path
}

fn no_env() -> Environment {
    Environment::with_prefix(ENV_PREFIX).source(Some(config::Map::new()))
}

#[test]
fn test_detect_format() {
    assert_eq!(detect_format("kiln.yaml").unwrap(), FileFormat::Yaml);
    assert_eq!(detect_format("kiln.yml").unwrap(), FileFormat::Yaml);
    assert_eq!(detect_format("kiln.toml").unwrap(), FileFormat::Toml);
    assert_eq!(detect_format("kiln.json").unwrap(), FileFormat::Json);
    assert!(matches!(
        detect_format("kiln.txt"),
        Err(ConfigError::UnsupportedFormat(_))
    ));
    assert!(detect_format("kiln").is_err());
}

#[test]
fn test_defaults() {
    let config = HotReloadConfig::default();
    assert_eq!(config.unload_timeout(), Duration::from_secs(5));
    assert_eq!(config.poll_interval(), Duration::from_millis(10));
    assert!(config.verify_api_version);
    assert!(config.retain_unresolved);
    assert!(config.shadow_dir().ends_with("kiln-shadow"));
    assert!(config.validate().is_ok());
}

#[test]
fn test_builders() {
    let config = HotReloadConfig::new()
        .with_unload_timeout(Duration::from_millis(200))
        .with_poll_interval(Duration::from_millis(5))
        .with_shadow_dir("/tmp/kiln-test")
        .with_api_version_check(false)
        .with_retain_unresolved(false)
        .with_watch_debounce(Duration::from_millis(50));

    assert_eq!(config.unload_timeout_ms, 200);
    assert_eq!(config.poll_interval_ms, 5);
    assert_eq!(config.shadow_dir(), PathBuf::from("/tmp/kiln-test"));
    assert!(!config.verify_api_version);
    assert!(!config.retain_unresolved);
    assert_eq!(config.watch_debounce(), Duration::from_millis(50));
}

#[test]
fn test_validate_rejects_bad_intervals() {
    let zero_poll = HotReloadConfig::new().with_poll_interval(Duration::ZERO);
    assert!(matches!(
        zero_poll.validate(),
        Err(ConfigError::Invalid { field: "poll_interval_ms", .. })
    ));

    let short_timeout = HotReloadConfig::new()
        .with_poll_interval(Duration::from_millis(100))
        .with_unload_timeout(Duration::from_millis(10));
    assert!(matches!(
        short_timeout.validate(),
        Err(ConfigError::Invalid { field: "unload_timeout_ms", .. })
    ));
}

#[test]
fn test_from_file_toml_partial() {
    let temp_dir = TempDir::new().unwrap();
    let path = create_test_file(
        &temp_dir,
        "kiln.toml",
        r#"
unload_timeout_ms = 1500
shadow_dir = "/var/tmp/kiln"
watch_extensions = ["so"]
"#,
    );

    let config = HotReloadConfig::from_file_with_env(&path, no_env()).unwrap();
    assert_eq!(config.unload_timeout_ms, 1500);
    assert_eq!(config.shadow_dir(), PathBuf::from("/var/tmp/kiln"));
    assert_eq!(config.watch_extensions, vec!["so".to_string()]);
    // Unset fields keep their defaults.
    assert_eq!(config.poll_interval_ms, 10);
    assert!(config.verify_api_version);
}

#[test]
fn test_from_file_yaml_and_json() {
    let temp_dir = TempDir::new().unwrap();
    let yaml = create_test_file(
        &temp_dir,
        "kiln.yaml",
        "poll_interval_ms: 20\nverify_api_version: false\n",
    );
    let json = create_test_file(&temp_dir, "kiln.json", r#"{ "watch_debounce_ms": 75 }"#);

    let from_yaml = HotReloadConfig::from_file_with_env(&yaml, no_env()).unwrap();
    assert_eq!(from_yaml.poll_interval_ms, 20);
    assert!(!from_yaml.verify_api_version);

    let from_json = HotReloadConfig::from_file_with_env(&json, no_env()).unwrap();
    assert_eq!(from_json.watch_debounce_ms, 75);
}

#[test]
fn test_env_overrides_file() {
    let temp_dir = TempDir::new().unwrap();
    let path = create_test_file(&temp_dir, "kiln.toml", "unload_timeout_ms = 1500\n");

    let mut vars = config::Map::new();
    vars.insert("KILN_UNLOAD_TIMEOUT_MS".to_string(), "750".to_string());
    vars.insert("KILN_RETAIN_UNRESOLVED".to_string(), "false".to_string());
    let env = Environment::with_prefix(ENV_PREFIX).source(Some(vars));

    let config = HotReloadConfig::from_file_with_env(&path, env).unwrap();
    assert_eq!(config.unload_timeout_ms, 750);
    assert!(!config.retain_unresolved);
}

#[test]
fn test_invalid_file_values_fail_validation() {
    let temp_dir = TempDir::new().unwrap();
    let path = create_test_file(&temp_dir, "kiln.toml", "poll_interval_ms = 0\n");

    let result = HotReloadConfig::from_file_with_env(&path, no_env());
    assert!(matches!(result, Err(ConfigError::Invalid { .. })));
}

#[test]
fn test_missing_file_is_io_error() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("absent.toml");
    assert!(matches!(
        HotReloadConfig::from_file_with_env(&path, no_env()),
        Err(ConfigError::Io(_))
    ));
}

#[test]
fn test_substitute_env_vars_leaves_unset_untouched() {
    let content = "dir = \"${KILN_TEST_SURELY_UNSET_VAR}\" and $KILN_TEST_SURELY_UNSET_VAR";
    assert_eq!(substitute_env_vars(content).unwrap(), content);
}

#[test]
fn test_from_str_generic() {
    #[derive(serde::Deserialize, Debug, PartialEq)]
    struct Scene {
        name: String,
        entities: u32,
    }

    let scene: Scene = from_str("name = \"arena\"\nentities = 4\n", FileFormat::Toml).unwrap();
    assert_eq!(
        scene,
        Scene {
            name: "arena".to_string(),
            entities: 4
        }
    );
}

#[test]
fn test_load_config_detects_format() {
    let temp_dir = TempDir::new().unwrap();
    let path = create_test_file(&temp_dir, "kiln.json", r#"{"poll_interval_ms": 25}"#);

    let config: HotReloadConfig = load_config(path.to_str().unwrap()).unwrap();
    assert_eq!(config.poll_interval(), Duration::from_millis(25));
    assert_eq!(config.unload_timeout_ms, 5_000);

    assert!(matches!(
        load_config::<HotReloadConfig>("kiln.ini"),
        Err(ConfigError::UnsupportedFormat(_))
    ));
}

#[test]
fn test_oversized_durations_saturate() {
    let config = HotReloadConfig::new()
        .with_unload_timeout(Duration::MAX)
        .with_poll_interval(Duration::from_millis(7))
        .with_watch_debounce(Duration::MAX);
    assert_eq!(config.unload_timeout_ms, u64::MAX);
    assert_eq!(config.poll_interval_ms, 7);
    assert_eq!(config.watch_debounce_ms, u64::MAX);
}
