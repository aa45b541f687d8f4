//! 错误处理单元测试
//!
//! 测试运行级错误与主机级错误的分类和输出

use bastion_fleet::error::{ErrorKind, HostError, RunError, SecretError};
use bastion_fleet::models::ExecutionResult;

#[test]
fn test_run_error_messages() {
    assert_eq!(
        RunError::unreachable("203.0.113.10:22: connection refused").to_string(),
        "Bastion unreachable: 203.0.113.10:22: connection refused"
    );
    assert_eq!(
        RunError::auth_failed("public key rejected").to_string(),
        "Bastion authentication failed: public key rejected"
    );
    assert_eq!(
        RunError::inventory("duplicate role 'api'").to_string(),
        "Invalid inventory: duplicate role 'api'"
    );
}

#[test]
fn test_target_secret_error_converts_to_host_error() {
    let err: HostError = SecretError::malformed("api-key: invalid key").into();
    assert_eq!(err.kind, ErrorKind::SecretMalformed);
    assert!(err.message.contains("api-key"));
}

#[test]
fn test_host_error_serialization() {
    let err = HostError::relay_refused("10.0.1.10:22: connection refused");
    let json = serde_json::to_value(&err).unwrap();
    assert_eq!(json["kind"], "relay_refused");
    assert_eq!(json["message"], "10.0.1.10:22: connection refused");
    assert_eq!(err.to_string(), "relay_refused: 10.0.1.10:22: connection refused");
}

#[test]
fn test_failed_result_has_no_exit_status() {
    let result = ExecutionResult::failed("db", HostError::timeout("exceeded"), 30.0);
    assert!(result.exit_status.is_none());
    assert!(result.timed_out());
    assert!(!result.is_success());

    let json = serde_json::to_value(&result).unwrap();
    assert!(json["exit_status"].is_null());
    assert_eq!(json["error"]["kind"], "command_timeout");
}

#[test]
fn test_error_kind_labels() {
    let kinds = [
        (ErrorKind::SecretUnavailable, "secret_unavailable"),
        (ErrorKind::SecretAccessDenied, "secret_access_denied"),
        (ErrorKind::SecretMalformed, "secret_malformed"),
        (ErrorKind::RelayRefused, "relay_refused"),
        (ErrorKind::TargetAuthFailed, "target_auth_failed"),
        (ErrorKind::CommandTimeout, "command_timeout"),
        (ErrorKind::ChannelClosed, "channel_closed"),
        (ErrorKind::TaskAborted, "task_aborted"),
    ];
    for (kind, label) in kinds {
        assert_eq!(kind.to_string(), label);
        assert_eq!(serde_json::to_value(kind).unwrap(), label);
    }
}
