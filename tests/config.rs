use std::fs;
use std::time::Duration;

use assert_matches::assert_matches;

use sample_upload::config::{Config, ConfigLoader};
use sample_upload::domain::Technology;
use sample_upload::error::UploadError;

#[test]
fn resolve_full_config() {
    let config: Config = serde_json::from_str(
        r#"{
            "schema_version": 1,
            "base_url": "https://samples.example.org/",
            "project_id": 42,
            "technology": "ont",
            "host_genome": "Human",
            "part_size_mb": 16,
            "heartbeat_secs": 30,
            "max_part_retries": 5,
            "object_store_endpoint": "http://localhost:9000",
            "accelerate": true
        }"#,
    )
    .unwrap();

    let resolved = ConfigLoader::resolve_config(config).unwrap();
    assert_eq!(resolved.base_url.as_deref(), Some("https://samples.example.org"));
    assert_eq!(resolved.require_base_url().unwrap(), "https://samples.example.org");
    assert_eq!(resolved.project_id, Some(42));
    assert_eq!(resolved.technology, Technology::Nanopore);
    assert_eq!(resolved.host_genome.as_deref(), Some("Human"));
    assert_eq!(resolved.part_size, 16 * 1024 * 1024);
    assert_eq!(resolved.heartbeat_interval, Duration::from_secs(30));
    assert_eq!(resolved.max_part_retries, 5);
    assert_eq!(
        resolved.object_store_endpoint.as_deref(),
        Some("http://localhost:9000")
    );
    assert!(resolved.accelerate);
}

#[test]
fn unknown_technology_is_rejected() {
    let config: Config = serde_json::from_str(r#"{ "technology": "sanger" }"#).unwrap();
    assert_matches!(
        ConfigLoader::resolve_config(config),
        Err(UploadError::InvalidTechnology(_))
    );
}

#[test]
fn zero_heartbeat_is_rejected() {
    let config: Config = serde_json::from_str(r#"{ "heartbeat_secs": 0 }"#).unwrap();
    assert_matches!(
        ConfigLoader::resolve_config(config),
        Err(UploadError::ConfigValue(_))
    );
}

#[test]
fn explicit_path_must_exist() {
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("nope.json");
    let err = ConfigLoader::resolve_or_default(missing.to_str()).unwrap_err();
    assert_matches!(err, UploadError::ConfigRead(_));
}

#[test]
fn write_then_resolve() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sample-upload.json");
    ConfigLoader::write_default(&path, "https://samples.example.org").unwrap();
    let content = fs::read_to_string(&path).unwrap();
    assert!(content.contains("base_url"));

    let resolved = ConfigLoader::resolve(path.to_str()).unwrap();
    assert_eq!(resolved.schema_version, 1);
    assert_eq!(resolved.base_url.as_deref(), Some("https://samples.example.org"));
    assert_eq!(resolved.technology, Technology::Illumina);
}

#[test]
fn malformed_json_is_a_parse_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("broken.json");
    fs::write(&path, "{ not json").unwrap();
    assert_matches!(
        ConfigLoader::resolve(path.to_str()),
        Err(UploadError::ConfigParse(_))
    );
}
