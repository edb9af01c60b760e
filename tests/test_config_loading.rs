//! Configuration loading and validation tests
//!
//! Tests focus on BEHAVIOR of configuration loading from disk: what a node
//! operator writes in the file, and what the node refuses to start with.

use decada_node::config::{ConfigError, NodeConfig};
use decada_node::crypto::KeyKind;
use std::io::Write;
use std::path::PathBuf;
use tempfile::NamedTempFile;

fn write_config(content: &str) -> NamedTempFile {
    let mut temp_file = NamedTempFile::new().unwrap();
    write!(temp_file, "{content}").unwrap();
    temp_file
}

const MINIMAL: &str = r#"
[device]
uid = "0123456789ABCDEF"

[cloud]
api_url = "https://ag.decada.gov.sg"
org_id = "o15000000000001"
product_key = "PK1"

[store]
path = "/var/lib/decada-node/state.json"
"#;

#[test]
fn test_config_loads_successfully_from_valid_toml() {
    let temp_file = write_config(MINIMAL);

    let config = NodeConfig::load_from_file(temp_file.path()).unwrap();

    assert_eq!(config.device.uid, "0123456789ABCDEF");
    assert_eq!(config.cloud.api_url, "https://ag.decada.gov.sg");
    assert_eq!(config.cloud.org_id, "o15000000000001");
    assert_eq!(config.cloud.product_key, "PK1");
    assert_eq!(
        config.store.path,
        PathBuf::from("/var/lib/decada-node/state.json")
    );
}

#[test]
fn test_omitted_sections_take_defaults() {
    let temp_file = write_config(MINIMAL);
    let config = NodeConfig::load_from_file(temp_file.path()).unwrap();

    assert_eq!(config.key_kind(), KeyKind::Software);
    assert_eq!(config.broker_port(), 18885);
    assert_eq!(config.mqtt.broker_host, "mqtt.decada.gov.sg");
    assert_eq!(config.mqtt.root_ca_path, None);
    assert_eq!(config.provisioning.issue_authority, "ECC");
    assert_eq!(config.provisioning.max_certificate_attempts, None);
    assert_eq!(config.supervisor.retry_delay_ms, 1000);
    assert_eq!(config.supervisor.liveness_interval_secs, 10);
    assert_eq!(config.supervisor.queue_retry_attempts, 10);
    assert_eq!(config.sensors.poll_rate_secs, 60);
    assert_eq!(config.sensors.readings_path, None);
    assert_eq!(config.cloud.access_secret_env, "DECADA_ACCESS_SECRET");
}

#[test]
fn test_full_config_overrides_defaults() {
    let temp_file = write_config(
        r#"
[device]
uid = "abc123"
secure_element = true

[cloud]
api_url = "https://staging.decada.gov.sg"
org_id = "o1"
product_key = "PK2"
access_key_env = "MY_KEY"
access_secret_env = "MY_SECRET"
request_timeout_secs = 5

[mqtt]
broker_host = "broker.internal"
keep_alive_secs = 120
root_ca_path = "/etc/decada-node/roots.pem"

[provisioning]
max_creation_attempts = 10
cert_valid_days = 30

[supervisor]
max_failed_reconnections = 3
retry_delay_ms = 250

[store]
path = "state.json"

[sensors]
poll_rate_secs = 15
readings_path = "/run/sensors/latest.json"
"#,
    );

    let config = NodeConfig::load_from_file(temp_file.path()).unwrap();

    assert_eq!(config.key_kind(), KeyKind::SecureElement);
    assert_eq!(config.broker_port(), 18886);
    assert_eq!(config.cloud.access_key_env, "MY_KEY");
    assert_eq!(config.request_timeout().as_secs(), 5);
    assert_eq!(config.mqtt.broker_host, "broker.internal");
    assert_eq!(config.mqtt.keep_alive_secs, 120);
    assert_eq!(
        config.mqtt.root_ca_path,
        Some(PathBuf::from("/etc/decada-node/roots.pem"))
    );
    assert_eq!(config.provisioning.max_creation_attempts, Some(10));
    assert_eq!(config.provisioning.cert_valid_days, 30);
    assert_eq!(config.supervisor.max_failed_reconnections, 3);
    assert_eq!(config.supervisor.retry_delay_ms, 250);
    assert_eq!(config.sensors.poll_rate_secs, 15);
    assert_eq!(
        config.sensors.readings_path,
        Some(PathBuf::from("/run/sensors/latest.json"))
    );
}

#[test]
fn test_missing_file_is_a_read_error() {
    let result = NodeConfig::load_from_file(std::path::Path::new(
        "/definitely/not/here/decada-node.toml",
    ));
    assert!(matches!(result, Err(ConfigError::FileRead(_))));
}

#[test]
fn test_malformed_toml_is_a_parse_error() {
    let temp_file = write_config("[device\nuid = ");
    let result = NodeConfig::load_from_file(temp_file.path());
    assert!(matches!(result, Err(ConfigError::TomlParse(_))));
}

#[test]
fn test_missing_required_section_is_rejected() {
    let temp_file = write_config(
        r#"
[device]
uid = "abc123"

[store]
path = "state.json"
"#,
    );
    assert!(matches!(
        NodeConfig::load_from_file(temp_file.path()),
        Err(ConfigError::TomlParse(_))
    ));
}

#[test]
fn test_invalid_device_uid_is_rejected() {
    for uid in ["", "abc-123", "node 1", "ünïcode"] {
        let content = MINIMAL.replace("0123456789ABCDEF", uid);
        let result = NodeConfig::from_toml_str(&content);
        assert!(
            matches!(result, Err(ConfigError::InvalidDeviceId(_))),
            "uid {uid:?} should be rejected"
        );
    }
}

#[test]
fn test_zero_values_are_rejected() {
    for (section, line) in [
        ("[supervisor]", "max_failed_reconnections = 0"),
        ("[supervisor]", "liveness_interval_secs = 0"),
        ("[sensors]", "poll_rate_secs = 0"),
        ("[provisioning]", "max_creation_attempts = 0"),
    ] {
        let content = format!("{MINIMAL}\n{section}\n{line}\n");
        assert!(
            matches!(
                NodeConfig::from_toml_str(&content),
                Err(ConfigError::InvalidConfig(_))
            ),
            "{section} {line} should be rejected"
        );
    }
}

#[test]
fn test_keep_alive_must_fit_the_protocol_field() {
    let content = format!("{MINIMAL}\n[mqtt]\nkeep_alive_secs = 70000\n");
    assert!(matches!(
        NodeConfig::from_toml_str(&content),
        Err(ConfigError::InvalidConfig(msg)) if msg.contains("keep_alive_secs")
    ));
}

#[test]
fn test_poll_rate_is_capped_at_one_day() {
    let content = format!("{MINIMAL}\n[sensors]\npoll_rate_secs = 86401\n");
    assert!(matches!(
        NodeConfig::from_toml_str(&content),
        Err(ConfigError::InvalidConfig(msg)) if msg.contains("poll_rate_secs")
    ));

    let content = format!("{MINIMAL}\n[sensors]\npoll_rate_secs = 86400\n");
    assert!(NodeConfig::from_toml_str(&content).is_ok());
}

#[test]
fn test_credentials_resolve_from_named_environment_variables() {
    let content = MINIMAL.replace(
        "product_key = \"PK1\"",
        "product_key = \"PK1\"\naccess_key_env = \"DECADA_LOADING_TEST_KEY\"\naccess_secret_env = \"DECADA_LOADING_TEST_SECRET\"",
    );
    let config = NodeConfig::from_toml_str(&content).unwrap();

    std::env::set_var("DECADA_LOADING_TEST_KEY", "AK9");
    std::env::remove_var("DECADA_LOADING_TEST_SECRET");

    assert_eq!(config.get_access_key().unwrap(), "AK9");
    assert!(matches!(
        config.get_access_secret(),
        Err(ConfigError::EnvVarNotFound(name)) if name == "DECADA_LOADING_TEST_SECRET"
    ));

    // Empty counts as unset
    std::env::set_var("DECADA_LOADING_TEST_SECRET", "");
    assert!(config.get_access_secret().is_err());
}

#[test]
fn test_config_round_trips_through_toml() {
    let config = NodeConfig::from_toml_str(MINIMAL).unwrap();
    let rendered = toml::to_string_pretty(&config).unwrap();
    assert_eq!(NodeConfig::from_toml_str(&rendered).unwrap(), config);
}

#[test]
fn test_shipped_example_config_is_valid() {
    let config = NodeConfig::from_toml_str(include_str!("../decada-node.example.toml")).unwrap();
    assert_eq!(config.broker_port(), 18885);
    assert_eq!(config.provisioning.max_creation_attempts, None);
}
