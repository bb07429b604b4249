//! Tests for error types.

use super::*;

#[test]
fn test_error_transience() {
    assert!(!QueueError::QueueNotFound {
        queue_name: "test".to_string(),
    }
    .is_transient());

    assert!(QueueError::ConnectionFailed {
        message: "network error".to_string(),
    }
    .is_transient());

    assert!(QueueError::ProviderError {
        provider: "AwsSqs".to_string(),
        code: "ThrottlingException".to_string(),
        message: "slow down".to_string(),
    }
    .is_transient());

    assert!(!QueueError::AuthenticationFailed {
        message: "bad signature".to_string(),
    }
    .is_transient());
}

#[test]
fn test_not_found_classification() {
    assert!(QueueError::QueueNotFound {
        queue_name: "gone".to_string(),
    }
    .is_not_found());

    assert!(QueueError::MessageNotFound {
        receipt: "r-1".to_string(),
    }
    .is_not_found());

    assert!(!QueueError::Timeout {
        duration: Duration::from_secs(1),
    }
    .is_not_found());
}

#[test]
fn test_retry_suggestions() {
    let timeout = QueueError::Timeout {
        duration: Duration::from_secs(30),
    };
    assert_eq!(timeout.retry_after(), Some(Duration::from_secs(1)));

    let not_found = QueueError::QueueNotFound {
        queue_name: "test".to_string(),
    };
    assert_eq!(not_found.retry_after(), None);
}

#[test]
fn test_lock_error_transience() {
    assert!(LockError::Transport {
        message: "503".to_string()
    }
    .is_transient());
    assert!(!LockError::Lost {
        resource_key: "orders".to_string()
    }
    .is_transient());
}

#[test]
fn test_host_error_display_names_operation_context() {
    let err = HostError::Transport {
        attempts: 3,
        source: QueueError::ConnectionFailed {
            message: "refused".to_string(),
        },
    };

    let text = err.to_string();
    assert!(text.contains("3 attempts"), "unexpected: {text}");
    assert!(text.contains("refused"), "unexpected: {text}");
}
