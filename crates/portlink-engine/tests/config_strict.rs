#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]
#![allow(clippy::panic)]

use portlink_core::ErrorCode;
use portlink_engine::config;

#[test]
fn deny_unknown_fields_nested() {
    let bad = r#"
version: 1
engine:
  allowed_origins: ["https://app.example"]
  send_retriez: 3 # typo should fail
"#;

    let err = config::load_from_str(bad).expect_err("must fail");
    assert_eq!(err.code(), ErrorCode::Config);
}

#[test]
fn ok_minimal_config() {
    let ok = r#"
version: 1
engine:
  allowed_origins: ["https://app.example"]
"#;
    let cfg = config::load_from_str(ok).expect("must parse");
    assert_eq!(cfg.version, 1);
    assert_eq!(cfg.engine.allowed_origins, vec!["https://app.example"]);
    assert_eq!(cfg.engine.send_timeout_ms, 10_000);
    assert_eq!(cfg.engine.send_retries, 1);
    assert!(cfg.heartbeat.enabled);
    assert_eq!(cfg.heartbeat.interval_ms, 15_000);
}

#[test]
fn rejects_unsupported_version() {
    let err = config::load_from_str("version: 2\n").expect_err("must fail");
    assert_eq!(err.code(), ErrorCode::Config);
}

#[test]
fn rejects_out_of_range_timeouts() {
    let bad = r#"
version: 1
engine:
  allowed_origins: ["https://app.example"]
  handshake_timeout_ms: 10
"#;
    let err = config::load_from_str(bad).expect_err("must fail");
    assert_eq!(err.code(), ErrorCode::Config);

    let bad = r#"
version: 1
engine:
  allowed_origins: ["https://app.example"]
heartbeat:
  interval_ms: 1000
  timeout_ms: 1000
"#;
    let err = config::load_from_str(bad).expect_err("must fail");
    assert_eq!(err.code(), ErrorCode::Config);
}

#[test]
fn rejects_malformed_allowed_origin() {
    let bad = r#"
version: 1
engine:
  allowed_origins: ["not an origin"]
"#;
    let err = config::load_from_str(bad).expect_err("must fail");
    assert_eq!(err.code(), ErrorCode::Config);
}
