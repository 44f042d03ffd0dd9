use std::io::Write;

use pacs_retrieve::config::{Config, ConfigError};
use tempfile::NamedTempFile;

const ARCHIVE: &str = r#"
    [archive]
    ae_title = "PACS"
    host = "127.0.0.1"
    port = 104
"#;

fn load_config_from_str(toml: &str) -> Result<Config, ConfigError> {
    let config: Config = toml::from_str(toml).expect("TOML parse error");
    config.validate()?;
    Ok(config)
}

#[test]
fn test_load_from_file() {
    let mut file = NamedTempFile::new().unwrap();
    write!(
        file,
        r#"
        [retriever]
        id = "viewer-1"

        [dimse]
        local_aet = "VIEWER"
        {ARCHIVE}
        "#
    )
    .unwrap();

    let config = Config::load(file.path()).expect("config should load");
    assert_eq!(config.dimse.local_aet, "VIEWER");
    assert_eq!(config.archive.address(), "127.0.0.1:104");
}

#[test]
fn test_missing_file_reports_path() {
    let err = Config::load("/nonexistent/retriever.toml").unwrap_err();
    assert!(matches!(err, ConfigError::Io { .. }));
    assert!(err.to_string().contains("retriever.toml"));
}

#[test]
fn test_empty_retriever_id_is_rejected() {
    let toml = format!("[retriever]\nid = \"\"\n{ARCHIVE}");
    assert!(matches!(
        load_config_from_str(&toml),
        Err(ConfigError::InvalidRetrieverId)
    ));
}

#[test]
fn test_log_file_path_required_when_logging_to_file() {
    let toml = format!("[retriever]\nid = \"r\"\n[logging]\nlog_to_file = true\n{ARCHIVE}");
    assert!(matches!(
        load_config_from_str(&toml),
        Err(ConfigError::MissingLogFilePath)
    ));
}

#[test]
fn test_invalid_local_aet_is_rejected() {
    let toml = format!(
        "[retriever]\nid = \"r\"\n[dimse]\nlocal_aet = \"THIS_AE_TITLE_IS_TOO_LONG\"\n{ARCHIVE}"
    );
    assert!(matches!(
        load_config_from_str(&toml),
        Err(ConfigError::Dimse(_))
    ));
}

#[test]
fn test_archive_without_host_is_rejected() {
    let toml = r#"
        [retriever]
        id = "r"

        [archive]
        ae_title = "PACS"
        host = ""
        port = 104
    "#;
    assert!(matches!(
        load_config_from_str(toml),
        Err(ConfigError::Dimse(_))
    ));
}

#[test]
fn test_max_pdu_out_of_range_is_rejected() {
    let toml = format!("[retriever]\nid = \"r\"\n[dimse]\nmax_pdu = 1024\n{ARCHIVE}");
    assert!(load_config_from_str(&toml).is_err());
}
