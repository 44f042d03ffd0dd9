#![cfg(test)]

use crate::config::{Config, ConfigError};

/// Parse a TOML string into a `Config` and run the validation logic.
fn load_config_from_str(toml_str: &str) -> Result<Config, ConfigError> {
    let cfg: Config = toml::from_str(toml_str).expect("TOML parse error");
    cfg.validate()?;
    Ok(cfg)
}

#[test]
fn test_basic_config() {
    let toml = r#"
        [retriever]
        id = "viewer-1"
        log_level = "debug"

        [dimse]
        local_aet = "VIEWER"
        port = 11113

        [archive]
        ae_title = "PACS"
        host = "pacs.local"
        port = 104
        retrieve_port = 11112

        [storage]
        cache_dir = "/tmp/cache"
    "#;

    let result = load_config_from_str(toml);
    assert!(result.is_ok(), "Configuration should parse and validate");

    let config = result.unwrap();
    assert_eq!(config.retriever.id, "viewer-1");
    assert_eq!(config.dimse.local_aet, "VIEWER");
    assert_eq!(config.dimse.port, 11113);
    // unset values keep their defaults
    assert_eq!(config.dimse.max_pdu, 65536);
    assert_eq!(config.archive.retrieve_service_port(), 11112);
    assert_eq!(config.storage.cache_dir.to_str(), Some("/tmp/cache"));
}

#[test]
fn test_defaults_apply() {
    let toml = r#"
        [retriever]
        id = "viewer-1"

        [archive]
        ae_title = "PACS"
        host = "pacs.local"
        port = 104
    "#;

    let config = load_config_from_str(toml).unwrap();
    assert_eq!(config.retriever.log_level, "info");
    assert_eq!(config.dimse.local_aet, "RETRIEVE_SCU");
    assert!(!config.logging.log_to_file);
    assert!(config.storage.cache_dir.ends_with("cache"));
}

#[test]
fn test_bad_log_level_is_rejected() {
    let toml = r#"
        [retriever]
        id = "viewer-1"
        log_level = "loud"

        [archive]
        ae_title = "PACS"
        host = "pacs.local"
        port = 104
    "#;

    assert!(matches!(
        load_config_from_str(toml),
        Err(ConfigError::InvalidLogLevel(level)) if level == "loud"
    ));
}
