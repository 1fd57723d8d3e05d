use des_core::config::{defaults, DesConfig};
use std::io::Write;

#[test]
fn test_load_from_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(
        file,
        r#"
data_dir = "/srv/des"

[mqtt]
host = "mqtt.example"
port = 8883
username = "svc"

[defaults]
latitude = 49.0
longitude = -120.0
"#
    )
    .unwrap();

    let config = DesConfig::from_file(file.path()).unwrap();
    assert_eq!(config.data_dir.to_str(), Some("/srv/des"));
    assert_eq!(config.mqtt.port, 8883);
    assert_eq!(config.mqtt.username.as_deref(), Some("svc"));
    assert_eq!(config.mqtt.client_id_prefix, defaults::MQTT_CLIENT_PREFIX);
    assert_eq!(config.defaults.latitude, 49.0);
    assert_eq!(config.defaults.server_app, defaults::SERVER_APP);
}

#[test]
fn test_missing_file_is_config_error() {
    let dir = tempfile::tempdir().unwrap();
    let err = DesConfig::from_file(dir.path().join("absent.toml")).unwrap_err();
    assert!(matches!(err, des_core::Error::Config(_)));
}
