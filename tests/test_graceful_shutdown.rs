//! Graceful shutdown tests
//!
//! In-flight scans must settle before the connection is closed, and
//! deliveries arriving while draining go back to the queue unprocessed.


use analysis_consumer::consumer::ConsumerState;
use analysis_consumer::testing::{wait_until, Journal, LogCapture, MockConnector, MockScanner};
use analysis_consumer::transport::Disposition;
use analysis_consumer::ConsumerError;
use std::sync::Arc;
use test_helpers::{build_consumer, request_payload, start, test_settings, TIMEOUT};

#[tokio::test]
async fn test_shutdown_drains_in_flight_before_closing() {
    let capture = LogCapture::new();
    let _guard = tracing::subscriber::set_default(capture.subscriber());

    let journal = Journal::default();
    let connector = MockConnector::new().with_journal(journal.clone());
    let scanner = Arc::new(MockScanner::succeeding().gated().with_journal(journal.clone()));
    let consumer = build_consumer(test_settings(), connector.clone(), scanner.clone());
    let run = start(&consumer);

    let session = connector.wait_for_session(1, TIMEOUT).await.unwrap();
    let in_flight: Vec<_> = ["http://a.example", "http://b.example"]
        .iter()
        .enumerate()
        .map(|(i, url)| session.deliver(request_payload(&i.to_string(), url)))
        .collect();
    let started = scanner.clone();
    assert!(wait_until(|| started.call_count() == 2, TIMEOUT).await);

    let coordinator = consumer.clone();
    let shutdown = tokio::spawn(async move { coordinator.shutdown("SIGINT").await });
    let draining = consumer.clone();
    assert!(wait_until(|| draining.is_shutting_down(), TIMEOUT).await);
    assert_eq!(consumer.state(), ConsumerState::ShuttingDown);

    // Arrives while draining
    let late = session.deliver(request_payload("late", "http://c.example"));
    assert_eq!(late.wait_settled(TIMEOUT).await, Some(Disposition::Requeue));
    assert_eq!(scanner.call_count(), 2);
    assert!(!session.is_closed());

    scanner.release(2);
    shutdown.await.unwrap().unwrap();
    run.await.unwrap().unwrap();

    for delivery in &in_flight {
        assert_eq!(delivery.dispositions(), vec![Disposition::Ack]);
    }
    assert_eq!(session.published().len(), 2);
    assert_eq!(session.close_calls(), 1);
    assert!(!session.observer_attached());

    let close = journal.position("close").unwrap();
    let entries = journal.entries();
    let last_ack = entries
        .iter()
        .rposition(|e| e == "settle:Ack")
        .unwrap();
    assert!(last_ack < close, "closed before settling: {entries:?}");
    assert_eq!(journal.count("settle:Requeue"), 1);

    // No reconnect after the deliberate close
    assert_eq!(connector.attempt_count(), 1);

    let waiting = capture
        .line_index("Waiting for pending scans to complete...")
        .unwrap();
    let closing = capture
        .line_index("Closing connection to RabbitMQ server...")
        .unwrap();
    let complete = capture.line_index("Graceful shutdown complete.").unwrap();
    assert!(waiting < closing);
    assert!(closing < complete);

    let metrics = consumer.metrics().snapshot();
    assert_eq!(metrics.messages.requeued_during_shutdown, 1);
    assert_eq!(metrics.messages.acked, 2);
}

#[tokio::test]
async fn test_shutdown_with_nothing_in_flight_closes_immediately() {
    let connector = MockConnector::new();
    let consumer = build_consumer(
        test_settings(),
        connector.clone(),
        Arc::new(MockScanner::succeeding()),
    );
    let run = start(&consumer);

    let session = connector.wait_for_session(1, TIMEOUT).await.unwrap();
    assert!(wait_until(|| session.is_consuming(), TIMEOUT).await);

    consumer.shutdown("SIGTERM").await.unwrap();
    run.await.unwrap().unwrap();

    assert!(session.is_closed());
    assert_eq!(session.close_calls(), 1);
    assert_eq!(consumer.state(), ConsumerState::ShuttingDown);
}

#[tokio::test]
async fn test_second_shutdown_request_is_ignored() {
    let connector = MockConnector::new();
    let consumer = build_consumer(
        test_settings(),
        connector.clone(),
        Arc::new(MockScanner::succeeding()),
    );
    let _run = start(&consumer);
    let session = connector.wait_for_session(1, TIMEOUT).await.unwrap();

    consumer.shutdown("SIGINT").await.unwrap();
    consumer.shutdown("SIGTERM").await.unwrap();

    assert_eq!(session.close_calls(), 1);
}

#[tokio::test]
async fn test_shutdown_before_run_never_connects() {
    let connector = MockConnector::new();
    let consumer = build_consumer(
        test_settings(),
        connector.clone(),
        Arc::new(MockScanner::succeeding()),
    );

    consumer.shutdown("SIGQUIT").await.unwrap();
    consumer.run().await.unwrap();

    assert_eq!(connector.attempt_count(), 0);
}

#[tokio::test]
async fn test_connect_failure_during_shutdown_is_not_reported() {
    let capture = LogCapture::new();
    let _guard = tracing::subscriber::set_default(capture.subscriber());

    let connector = MockConnector::always_failing().gated();
    let consumer = build_consumer(
        test_settings(),
        connector.clone(),
        Arc::new(MockScanner::succeeding()),
    );
    let run = start(&consumer);

    let attempted = connector.clone();
    assert!(wait_until(|| attempted.attempt_count() == 1, TIMEOUT).await);

    consumer.shutdown("SIGTERM").await.unwrap();
    connector.release(1);
    run.await.unwrap().unwrap();

    assert_eq!(connector.attempt_count(), 1);
    assert_eq!(consumer.metrics().snapshot().connection.failures, 0);
    let contents = capture.contents();
    assert!(!contents.contains("Failed to connect to RabbitMQ"));
    assert!(!contents.contains("Reconnecting to RabbitMQ"));
}

#[tokio::test]
async fn test_close_failure_is_reported() {
    let capture = LogCapture::new();
    let _guard = tracing::subscriber::set_default(capture.subscriber());

    let connector = MockConnector::new();
    let consumer = build_consumer(
        test_settings(),
        connector.clone(),
        Arc::new(MockScanner::succeeding()),
    );
    let _run = start(&consumer);
    let session = connector.wait_for_session(1, TIMEOUT).await.unwrap();
    session.set_fail_close(true);

    let result = consumer.shutdown("SIGTERM").await;
    assert!(matches!(result, Err(ConsumerError::Shutdown { .. })));
    assert!(capture.contents().contains("Error during shutdown"));
    assert!(!capture.contents().contains("Graceful shutdown complete."));
}

#[tokio::test]
async fn test_state_stays_shutting_down_after_close() {
    let connector = MockConnector::new();
    let consumer = build_consumer(
        test_settings(),
        connector.clone(),
        Arc::new(MockScanner::succeeding()),
    );
    let mut states = consumer.subscribe_state();
    let run = start(&consumer);
    let _session = connector.wait_for_session(1, TIMEOUT).await.unwrap();

    consumer.shutdown("SIGINT").await.unwrap();
    run.await.unwrap().unwrap();

    assert_eq!(*states.borrow_and_update(), ConsumerState::ShuttingDown);
    assert!(!states.has_changed().unwrap_or(false));
}
