//! Integration tests for logging system

use bridge_traits::time::LogLevel;
use core_runtime::logging::{init_logging, redact_if_sensitive, strip_path, LogFormat, LoggingConfig};
use core_runtime::Error;

#[test]
fn test_logging_config_defaults() {
    let config = LoggingConfig::default();

    assert_eq!(config.level, LogLevel::Info);
    assert!(config.redact_pii);
    assert!(config.enable_spans);
    assert!(config.logger_sink.is_none());
}

#[test]
fn test_invalid_filter_is_a_config_error() {
    let config = LoggingConfig::default()
        .with_format(LogFormat::Compact)
        .with_filter("core_sync=[broken");

    match init_logging(config) {
        Err(Error::Config(message)) => assert!(message.contains("Invalid log filter")),
        other => panic!("expected config error, got {other:?}"),
    }
}

#[test]
fn test_redaction_helpers() {
    assert_eq!(redact_if_sensitive("bearer_token", "xyz"), "[REDACTED]");
    assert_eq!(redact_if_sensitive("remote_id", "abc123"), "abc123");

    assert_eq!(strip_path("Documents/taxes/2019.pdf"), "2019.pdf");
    assert_eq!(strip_path(""), "");
}
