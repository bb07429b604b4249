//! Tests for the in-memory queue provider.

use super::*;

fn queue() -> QueueName {
    QueueName::new("orders".to_string()).unwrap()
}

fn all_attributes() -> Vec<String> {
    vec!["All".to_string()]
}

// ============================================================================
// Receive Tests
// ============================================================================

mod receive_tests {
    use super::*;

    #[tokio::test]
    async fn test_receive_from_missing_queue_fails() {
        let provider = InMemoryProvider::new();

        let result = provider
            .receive_batch(&queue(), 1, Duration::from_secs(30), &[])
            .await;

        assert!(matches!(result, Err(QueueError::QueueNotFound { .. })));
    }

    #[tokio::test]
    async fn test_receive_empty_queue_returns_empty_batch() {
        let provider = InMemoryProvider::new();
        provider.create_queue(&queue());

        let messages = provider
            .receive_batch(&queue(), 4, Duration::from_secs(30), &[])
            .await
            .unwrap();

        assert!(messages.is_empty());
    }

    #[tokio::test]
    async fn test_receive_respects_max_count_and_order() {
        let provider = InMemoryProvider::new();
        let first = provider.send_message(&queue(), "one");
        let second = provider.send_message(&queue(), "two");
        provider.send_message(&queue(), "three");

        let messages = provider
            .receive_batch(&queue(), 2, Duration::from_secs(30), &[])
            .await
            .unwrap();

        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].message_id, first);
        assert_eq!(messages[1].message_id, second);
        assert_eq!(provider.visible_count(&queue()), 1);
        assert_eq!(provider.in_flight_count(&queue()), 2);
    }

    /// Verify the in-flight count stays consistent while producers enqueue
    #[tokio::test]
    async fn test_in_flight_count_with_concurrent_sends() {
        let provider = InMemoryProvider::new();
        provider.send_message(&queue(), "leased");
        provider
            .receive_batch(&queue(), 1, Duration::from_secs(30), &[])
            .await
            .unwrap();

        let producer = provider.clone();
        let sender = std::thread::spawn(move || {
            for i in 0..2_000 {
                producer.send_message(&queue(), format!("message-{}", i));
            }
        });
        for _ in 0..2_000 {
            assert_eq!(provider.in_flight_count(&queue()), 1);
        }
        sender.join().unwrap();

        assert_eq!(provider.in_flight_count(&queue()), 1);
        assert_eq!(provider.visible_count(&queue()), 2_000);
    }

    #[tokio::test]
    async fn test_batch_larger_than_limit_fails() {
        let provider = InMemoryProvider::new();
        provider.create_queue(&queue());

        let result = provider
            .receive_batch(&queue(), 33, Duration::from_secs(30), &[])
            .await;

        assert!(matches!(result, Err(QueueError::BatchTooLarge { .. })));
    }

    /// Verify a message reappears once its visibility timeout elapses
    #[tokio::test(start_paused = true)]
    async fn test_message_reappears_after_visibility_timeout() {
        let provider = InMemoryProvider::new();
        let id = provider.send_message(&queue(), "payload");

        let first = provider
            .receive_batch(&queue(), 1, Duration::from_secs(30), &all_attributes())
            .await
            .unwrap();
        assert_eq!(first.len(), 1);

        tokio::time::advance(Duration::from_secs(29)).await;
        let hidden = provider
            .receive_batch(&queue(), 1, Duration::from_secs(30), &[])
            .await
            .unwrap();
        assert!(hidden.is_empty());

        tokio::time::advance(Duration::from_secs(1)).await;
        let again = provider
            .receive_batch(&queue(), 1, Duration::from_secs(30), &all_attributes())
            .await
            .unwrap();

        assert_eq!(again.len(), 1);
        assert_eq!(again[0].message_id, id);
        assert_ne!(again[0].receipt_handle, first[0].receipt_handle);
        assert_eq!(
            again[0]
                .attributes
                .get("ApproximateReceiveCount")
                .map(String::as_str),
            Some("2")
        );
    }

    #[tokio::test]
    async fn test_attributes_only_when_requested() {
        let provider = InMemoryProvider::new();
        provider.send_message(&queue(), "payload");

        let messages = provider
            .receive_batch(&queue(), 1, Duration::from_secs(30), &[])
            .await
            .unwrap();

        assert!(messages[0].attributes.is_empty());
    }

    #[tokio::test]
    async fn test_injected_failures_are_consumed() {
        let provider = InMemoryProvider::new();
        provider.create_queue(&queue());
        provider.inject_receive_failures(2);

        for _ in 0..2 {
            let err = provider
                .receive_batch(&queue(), 1, Duration::from_secs(30), &[])
                .await
                .unwrap_err();
            assert!(err.is_transient());
        }

        assert!(provider
            .receive_batch(&queue(), 1, Duration::from_secs(30), &[])
            .await
            .is_ok());
    }
}

// ============================================================================
// Delete Tests
// ============================================================================

mod delete_tests {
    use super::*;

    #[tokio::test]
    async fn test_delete_removes_message() {
        let provider = InMemoryProvider::new();
        let id = provider.send_message(&queue(), "payload");
        let messages = provider
            .receive_batch(&queue(), 1, Duration::from_secs(30), &[])
            .await
            .unwrap();

        let outcome = provider
            .delete(&queue(), &messages[0].receipt_handle)
            .await
            .unwrap();

        assert_eq!(outcome, DeleteOutcome::Deleted);
        assert!(!provider.contains(&queue(), &id));
    }

    #[tokio::test]
    async fn test_double_delete_reports_not_found() {
        let provider = InMemoryProvider::new();
        provider.send_message(&queue(), "payload");
        let messages = provider
            .receive_batch(&queue(), 1, Duration::from_secs(30), &[])
            .await
            .unwrap();
        let receipt = &messages[0].receipt_handle;

        provider.delete(&queue(), receipt).await.unwrap();
        let second = provider.delete(&queue(), receipt).await.unwrap();

        assert_eq!(second, DeleteOutcome::NotFound);
    }

    /// Verify deleting from a deleted queue is not an error
    #[tokio::test]
    async fn test_delete_from_vanished_queue_reports_not_found() {
        let provider = InMemoryProvider::new();
        provider.send_message(&queue(), "payload");
        let messages = provider
            .receive_batch(&queue(), 1, Duration::from_secs(30), &[])
            .await
            .unwrap();
        assert!(provider.delete_queue(&queue()));

        let outcome = provider
            .delete(&queue(), &messages[0].receipt_handle)
            .await
            .unwrap();

        assert_eq!(outcome, DeleteOutcome::NotFound);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_receipt_cannot_delete_redelivered_message() {
        let provider = InMemoryProvider::new();
        let id = provider.send_message(&queue(), "payload");
        let first = provider
            .receive_batch(&queue(), 1, Duration::from_secs(5), &[])
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(5)).await;
        provider
            .receive_batch(&queue(), 1, Duration::from_secs(5), &[])
            .await
            .unwrap();

        let outcome = provider
            .delete(&queue(), &first[0].receipt_handle)
            .await
            .unwrap();

        assert_eq!(outcome, DeleteOutcome::NotFound);
        assert!(provider.contains(&queue(), &id));
    }
}

// ============================================================================
// Visibility Tests
// ============================================================================

mod visibility_tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_zero_visibility_requeues_immediately() {
        let provider = InMemoryProvider::new();
        let id = provider.send_message(&queue(), "payload");
        let messages = provider
            .receive_batch(&queue(), 1, Duration::from_secs(30), &[])
            .await
            .unwrap();

        let current = provider
            .change_visibility(&queue(), &messages[0].receipt_handle, Duration::ZERO)
            .await
            .unwrap();

        assert_eq!(current, messages[0].receipt_handle);
        assert_eq!(provider.visible_count(&queue()), 1);
        assert_eq!(provider.invisible_for(&queue(), &id), Some(Duration::ZERO));
    }

    #[tokio::test(start_paused = true)]
    async fn test_change_visibility_counts_from_now() {
        let provider = InMemoryProvider::new();
        let id = provider.send_message(&queue(), "payload");
        let messages = provider
            .receive_batch(&queue(), 1, Duration::from_secs(30), &[])
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(20)).await;
        provider
            .change_visibility(
                &queue(),
                &messages[0].receipt_handle,
                Duration::from_secs(30),
            )
            .await
            .unwrap();

        assert_eq!(
            provider.invisible_for(&queue(), &id),
            Some(Duration::from_secs(30))
        );
    }

    #[tokio::test]
    async fn test_change_visibility_with_unknown_receipt_fails() {
        let provider = InMemoryProvider::new();
        provider.create_queue(&queue());
        let receipt = ReceiptHandle::new("unknown".to_string()).unwrap();

        let err = provider
            .change_visibility(&queue(), &receipt, Duration::ZERO)
            .await
            .unwrap_err();

        assert!(matches!(err, QueueError::MessageNotFound { .. }));
    }

    #[tokio::test]
    async fn test_batch_change_reports_failed_positions() {
        let provider = InMemoryProvider::new();
        provider.send_message(&queue(), "a");
        provider.send_message(&queue(), "b");
        let messages = provider
            .receive_batch(&queue(), 2, Duration::from_secs(30), &[])
            .await
            .unwrap();
        let receipts = vec![
            messages[0].receipt_handle.clone(),
            ReceiptHandle::new("stale".to_string()).unwrap(),
            messages[1].receipt_handle.clone(),
        ];

        let err = provider
            .change_visibility_batch(&queue(), &receipts, Duration::ZERO)
            .await
            .unwrap_err();

        match err {
            QueueError::BatchEntriesFailed { failed, .. } => assert_eq!(failed, vec!["m1"]),
            other => panic!("unexpected error: {other:?}"),
        }
        // Valid entries were still applied.
        assert_eq!(provider.visible_count(&queue()), 2);
    }
}
