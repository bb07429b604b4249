//! Tests for the host executor run loop.

use super::*;
use crate::client::{DeleteOutcome, MockQueueClient};
use crate::config::{ListenerOptions, SingletonOptions};
use crate::handler::FnHandler;
use crate::message::{MessageId, QueueName, ReceiptHandle, ReceivedMessage};
use crate::providers::InMemoryProvider;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;

fn queue() -> QueueName {
    QueueName::new("orders".to_string()).unwrap()
}

fn job_config() -> HostConfig {
    let mut config = HostConfig::new(queue());
    config.host.batch_size = 5;
    config.host.visibility_timeout_secs = 30;
    config
}

fn listener_config() -> HostConfig {
    let mut config = job_config();
    config.mode = RunMode::Listener;
    config
}

fn singleton_options() -> SingletonOptions {
    SingletonOptions {
        lease_duration_secs: 30,
        minimum_polling_interval_ms: 1_000,
        maximum_polling_interval_ms: 4_000,
        max_retries: 0,
        ..Default::default()
    }
}

fn provider_with(bodies: &[&str]) -> InMemoryProvider {
    let provider = InMemoryProvider::new();
    provider.create_queue(&queue());
    for body in bodies {
        provider.send_message(&queue(), body.to_string());
    }
    provider
}

fn fast_retry() -> RetryPolicy {
    RetryPolicy::new(3, Duration::from_millis(100), Duration::from_secs(1), 2.0).without_jitter()
}

async fn succeed(_message: Message) -> anyhow::Result<()> {
    Ok(())
}

async fn fail_on_body(message: Message, failing_body: &'static str) -> anyhow::Result<()> {
    if message.body_as_str() == Some(failing_body) {
        anyhow::bail!("cannot process '{}'", failing_body);
    }
    Ok(())
}

fn executor(config: HostConfig, provider: &InMemoryProvider, handler: Arc<dyn MessageHandler>) -> HostExecutor {
    HostExecutor::new(config, Arc::new(provider.clone()), handler)
        .unwrap()
        .with_retry_policy(fast_retry())
}

fn cancel_after(delay: Duration) -> CancellationToken {
    let token = CancellationToken::new();
    let canceller = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        canceller.cancel();
    });
    token
}

// ============================================================================
// Construction Tests
// ============================================================================

#[test]
fn test_invalid_configuration_is_rejected_before_running() {
    let mut config = listener_config();
    config.listener = ListenerOptions {
        minimum_polling_interval_ms: 500,
        maximum_polling_interval_ms: 100,
        new_batch_threshold: None,
    };
    let handler = Arc::new(FnHandler::new(|m, _| succeed(m)));

    let result = HostExecutor::new(config, Arc::new(InMemoryProvider::new()), handler);

    assert!(matches!(result, Err(HostError::Configuration(_))));
}

// ============================================================================
// Job Mode Tests
// ============================================================================

mod job_mode_tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_job_drains_queue() {
        let provider = provider_with(&["a", "b", "c", "d", "e", "f", "g"]);
        let handler = Arc::new(FnHandler::new(|m, _| succeed(m)));

        let summary = executor(job_config(), &provider, handler)
            .run(CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(summary.outcome, RunOutcome::Drained);
        assert_eq!(summary.processed, 7);
        assert_eq!(summary.succeeded, 7);
        // Batches of 5 and 2, then one empty receive.
        assert_eq!(summary.polls, 3);
        assert_eq!(provider.message_count(&queue()), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_job_on_empty_queue_stops_after_max_empty_polls() {
        let provider = provider_with(&[]);
        let mut config = job_config();
        config.host.max_empty_polls = 3;
        let handler = Arc::new(FnHandler::new(|m, _| succeed(m)));

        let summary = executor(config, &provider, handler)
            .run(CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(summary.outcome, RunOutcome::Drained);
        assert_eq!(summary.polls, 3);
        assert_eq!(summary.processed, 0);
    }

    /// Verify only the failed message of a batch is released; the rest are deleted
    #[tokio::test]
    async fn test_failed_message_is_released_others_acknowledged() {
        let delivered = Arc::new(AtomicBool::new(false));
        let mut mock = MockQueueClient::new();
        mock.expect_receive_batch().returning(move |_, _, _, _| {
            if delivered.swap(true, Ordering::SeqCst) {
                return Ok(vec![]);
            }
            Ok((0..5)
                .map(|i| ReceivedMessage {
                    message_id: MessageId::new(),
                    receipt_handle: ReceiptHandle::new(format!("receipt-{}", i)).unwrap(),
                    body: Bytes::from(if i == 2 { "poison" } else { "ok" }),
                    attributes: HashMap::new(),
                })
                .collect())
        });
        mock.expect_delete()
            .withf(|_, receipt| receipt.as_str() != "receipt-2")
            .times(4)
            .returning(|_, _| Ok(DeleteOutcome::Deleted));
        mock.expect_change_visibility()
            .withf(|_, receipt, timeout| receipt.as_str() == "receipt-2" && timeout.is_zero())
            .times(1)
            .returning(|_, receipt, _| Ok(receipt.clone()));
        let handler = Arc::new(FnHandler::new(|m, _| fail_on_body(m, "poison")));

        let summary = HostExecutor::new(job_config(), Arc::new(mock), handler)
            .unwrap()
            .run(CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(summary.processed, 5);
        assert_eq!(summary.succeeded, 4);
        assert_eq!(summary.failed, 1);
    }

    /// Verify a panicking handler is treated as a failure and its message redelivered
    #[tokio::test(start_paused = true)]
    async fn test_handler_panic_releases_message() {
        let provider = provider_with(&["explode"]);
        let handler = Arc::new(FnHandler::new(|message: Message, _| async move {
            if message.dequeue_count() == Some(1) {
                panic!("handler blew up");
            }
            Ok::<_, anyhow::Error>(())
        }));

        let summary = executor(job_config(), &provider, handler)
            .run(CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(summary.failed, 1);
        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.outcome, RunOutcome::Drained);
        assert_eq!(provider.message_count(&queue()), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_receive_failures_are_retried() {
        let provider = provider_with(&["a"]);
        provider.inject_receive_failures(2);
        let handler = Arc::new(FnHandler::new(|m, _| succeed(m)));

        let summary = executor(job_config(), &provider, handler)
            .run(CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.polls, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_persistent_receive_failure_ends_job() {
        let provider = provider_with(&["a"]);
        provider.inject_receive_failures(10);
        let handler = Arc::new(FnHandler::new(|m, _| succeed(m)));

        let err = executor(job_config(), &provider, handler)
            .run(CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, HostError::Transport { attempts: 3, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_queue_fails_without_retrying() {
        let provider = InMemoryProvider::new();
        let handler = Arc::new(FnHandler::new(|m, _| succeed(m)));

        let err = executor(job_config(), &provider, handler)
            .run(CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            HostError::Queue(crate::error::QueueError::QueueNotFound { .. })
        ));
    }
}

// ============================================================================
// Lease Renewal Tests
// ============================================================================

mod lease_renewal_tests {
    use super::*;

    /// Verify a handler outliving the visibility window keeps its message hidden
    #[tokio::test(start_paused = true)]
    async fn test_long_running_handler_renews_lease() {
        let provider = provider_with(&["slow"]);
        let mut config = job_config();
        config.host.visibility_timeout_secs = 10;
        let observed = Arc::new(Mutex::new(None));

        let observer = provider.clone();
        let seen = observed.clone();
        let handler = Arc::new(FnHandler::new(move |message: Message, _| {
            let observer = observer.clone();
            let seen = seen.clone();
            async move {
                tokio::time::sleep(Duration::from_secs(27)).await;
                let hidden = observer.invisible_for(&queue(), &message.message_id);
                *seen.lock().unwrap() = hidden;
                Ok::<_, anyhow::Error>(())
            }
        }));

        let summary = executor(config, &provider, handler)
            .run(CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(summary.succeeded, 1);
        // Renewed at 25s for another 10s.
        assert_eq!(*observed.lock().unwrap(), Some(Duration::from_secs(8)));
        assert_eq!(provider.message_count(&queue()), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_quick_handler_does_not_renew() {
        let mut mock = MockQueueClient::new();
        let delivered = Arc::new(AtomicBool::new(false));
        mock.expect_receive_batch().returning(move |_, _, _, _| {
            if delivered.swap(true, Ordering::SeqCst) {
                return Ok(vec![]);
            }
            Ok(vec![ReceivedMessage {
                message_id: MessageId::new(),
                receipt_handle: ReceiptHandle::new("receipt-1".to_string()).unwrap(),
                body: Bytes::from_static(b"fast"),
                attributes: HashMap::new(),
            }])
        });
        mock.expect_change_visibility().never();
        mock.expect_delete()
            .times(1)
            .returning(|_, _| Ok(DeleteOutcome::Deleted));
        let handler = Arc::new(FnHandler::new(|m, _| succeed(m)));

        let summary = HostExecutor::new(job_config(), Arc::new(mock), handler)
            .unwrap()
            .run(CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(summary.succeeded, 1);
    }

    /// Verify the acknowledgement uses the receipt issued by the last renewal
    /// while the handler still sees the message as delivered
    #[tokio::test(start_paused = true)]
    async fn test_acknowledge_uses_renewed_receipt() {
        let mut mock = MockQueueClient::new();
        let delivered = Arc::new(AtomicBool::new(false));
        mock.expect_receive_batch().returning(move |_, _, _, _| {
            if delivered.swap(true, Ordering::SeqCst) {
                return Ok(vec![]);
            }
            Ok(vec![ReceivedMessage {
                message_id: MessageId::new(),
                receipt_handle: ReceiptHandle::new("pop-0".to_string()).unwrap(),
                body: Bytes::from_static(b"slow"),
                attributes: HashMap::new(),
            }])
        });
        let renewals = Arc::new(AtomicU32::new(0));
        let counter = renewals.clone();
        mock.expect_change_visibility()
            .returning(move |_, receipt, _| {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                assert_eq!(receipt.as_str(), format!("pop-{}", n));
                Ok(ReceiptHandle::new(format!("pop-{}", n + 1)).unwrap())
            });
        mock.expect_delete()
            .withf(|_, receipt| receipt.as_str() == "pop-2")
            .times(1)
            .returning(|_, _| Ok(DeleteOutcome::Deleted));
        let mut config = job_config();
        config.host.visibility_timeout_secs = 10;
        let handler = Arc::new(FnHandler::new(|message: Message, _| async move {
            // Renewals every 5s: at 5s and 10s.
            tokio::time::sleep(Duration::from_secs(12)).await;
            assert_eq!(message.receipt_handle.as_str(), "pop-0");
            Ok::<_, anyhow::Error>(())
        }));

        let summary = HostExecutor::new(config, Arc::new(mock), handler)
            .unwrap()
            .run(CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(summary.succeeded, 1);
        assert_eq!(renewals.load(Ordering::SeqCst), 2);
    }
}

// ============================================================================
// Listener Mode Tests
// ============================================================================

mod listener_mode_tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_listener_processes_messages_until_cancelled() {
        let provider = provider_with(&[]);
        let sender = provider.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(30)).await;
            sender.send_message(&queue(), "late");
        });
        let handler = Arc::new(FnHandler::new(|m, _| succeed(m)));

        let summary = executor(listener_config(), &provider, handler)
            .run(cancel_after(Duration::from_secs(60)))
            .await
            .unwrap();

        assert_eq!(summary.outcome, RunOutcome::Cancelled);
        assert_eq!(summary.succeeded, 1);
        assert_eq!(provider.message_count(&queue()), 0);
    }

    /// Verify quiet receives back off exponentially up to the maximum interval
    #[tokio::test(start_paused = true)]
    async fn test_listener_backs_off_on_empty_queue() {
        let provider = provider_with(&[]);
        let mut config = listener_config();
        config.listener = ListenerOptions {
            minimum_polling_interval_ms: 100,
            maximum_polling_interval_ms: 1_600,
            new_batch_threshold: None,
        };
        let handler = Arc::new(FnHandler::new(|m, _| succeed(m)));

        let summary = executor(config, &provider, handler)
            .run(cancel_after(Duration::from_secs(10)))
            .await
            .unwrap();

        // Polls at 0, 0.2, 0.6, 1.4, 3.0, 4.6, 6.2, 7.8 and 9.4 seconds.
        assert_eq!(summary.polls, 9);
    }

    #[tokio::test(start_paused = true)]
    async fn test_listener_keeps_polling_through_receive_failures() {
        let provider = provider_with(&["a"]);
        provider.inject_receive_failures(20);
        let handler = Arc::new(FnHandler::new(|m, _| succeed(m)));

        let summary = executor(listener_config(), &provider, handler)
            .run(cancel_after(Duration::from_secs(60)))
            .await
            .unwrap();

        assert_eq!(summary.outcome, RunOutcome::Cancelled);
        assert_eq!(summary.succeeded, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_reaches_handler() {
        let provider = provider_with(&["wait-for-shutdown"]);
        let handler = Arc::new(FnHandler::new(|_message: Message, cancellation: CancellationToken| async move {
            cancellation.cancelled().await;
            Ok::<_, anyhow::Error>(())
        }));

        let summary = executor(listener_config(), &provider, handler)
            .run(cancel_after(Duration::from_secs(5)))
            .await
            .unwrap();

        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.abandoned, 0);
        assert_eq!(provider.message_count(&queue()), 0);
    }

    /// Verify handlers ignoring shutdown are abandoned after the grace period
    #[tokio::test(start_paused = true)]
    async fn test_grace_period_abandons_stuck_handler() {
        let provider = provider_with(&["stuck"]);
        let mut config = listener_config();
        config.host.shutdown_grace_period_ms = 2_000;
        let handler = Arc::new(FnHandler::new(|_message: Message, _| async move {
            tokio::time::sleep(Duration::from_secs(3_600)).await;
            Ok::<_, anyhow::Error>(())
        }));
        let start = Instant::now();

        let summary = executor(config, &provider, handler)
            .run(cancel_after(Duration::from_secs(1)))
            .await
            .unwrap();

        assert_eq!(summary.abandoned, 1);
        assert_eq!(summary.succeeded, 0);
        assert_eq!(start.elapsed(), Duration::from_secs(3));
        // Left to expire and be redelivered.
        assert_eq!(provider.in_flight_count(&queue()), 1);
    }
}

// ============================================================================
// Singleton Tests
// ============================================================================

mod singleton_tests {
    use super::*;
    use crate::singleton::{AcquireOutcome, InMemoryLockCollaborator};

    fn singleton(mut config: HostConfig) -> HostConfig {
        config.singleton = Some(singleton_options());
        config
    }

    #[tokio::test(start_paused = true)]
    async fn test_singleton_job_runs_and_releases_lock() {
        let provider = provider_with(&["a", "b"]);
        let locks = InMemoryLockCollaborator::new();
        let handler = Arc::new(FnHandler::new(|m, _| succeed(m)));

        let summary = executor(singleton(job_config()), &provider, handler)
            .with_lock_collaborator(Arc::new(locks.clone()))
            .run(CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(summary.outcome, RunOutcome::Drained);
        assert_eq!(summary.succeeded, 2);
        assert_eq!(locks.holder("orders").await, None);
    }

    /// Verify a job finding the lock held elsewhere ends without touching the queue
    #[tokio::test(start_paused = true)]
    async fn test_singleton_job_with_busy_lock_does_not_poll() {
        let provider = provider_with(&["a"]);
        let locks = InMemoryLockCollaborator::new();
        let other = locks
            .acquire("orders", "other-instance", Duration::from_secs(60))
            .await
            .unwrap();
        assert!(matches!(other, AcquireOutcome::Acquired(_)));
        let handler = Arc::new(FnHandler::new(|m, _| succeed(m)));

        let summary = executor(singleton(job_config()), &provider, handler)
            .with_lock_collaborator(Arc::new(locks.clone()))
            .run(CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(summary.outcome, RunOutcome::LockNotAcquired);
        assert_eq!(summary.polls, 0);
        assert_eq!(provider.visible_count(&queue()), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lost_lock_stops_listener() {
        let provider = provider_with(&[]);
        let locks = InMemoryLockCollaborator::new();
        let breaker = locks.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(35)).await;
            breaker.break_lease("orders").await;
        });
        let handler = Arc::new(FnHandler::new(|m, _| succeed(m)));

        let err = executor(singleton(listener_config()), &provider, handler)
            .with_lock_collaborator(Arc::new(locks))
            .run(CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, HostError::LockLost(LockError::Lost { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_standby_listener_takes_over_after_release() {
        let provider = provider_with(&["a"]);
        let locks = InMemoryLockCollaborator::new();
        locks
            .acquire("orders", "other-instance", Duration::from_secs(60))
            .await
            .unwrap();
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let handler = Arc::new(FnHandler::new(move |_message: Message, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Ok::<_, anyhow::Error>(()) }
        }));
        let breaker = locks.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(10)).await;
            breaker.break_lease("orders").await;
        });

        let summary = executor(singleton(listener_config()), &provider, handler)
            .with_lock_collaborator(Arc::new(locks.clone()))
            .run(cancel_after(Duration::from_secs(30)))
            .await
            .unwrap();

        assert_eq!(summary.outcome, RunOutcome::Cancelled);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(locks.holder("orders").await, None);
    }
}

#[test]
fn test_panic_message_extracts_text() {
    let payload: Box<dyn Any + Send> = Box::new("boom");
    assert_eq!(panic_message(payload.as_ref()), "boom");

    let payload: Box<dyn Any + Send> = Box::new(String::from("bang"));
    assert_eq!(panic_message(payload.as_ref()), "bang");

    let payload: Box<dyn Any + Send> = Box::new(42u8);
    assert_eq!(panic_message(payload.as_ref()), "non-string panic payload");
}
