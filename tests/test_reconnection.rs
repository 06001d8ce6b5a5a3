//! Reconnection behavior under virtual time
//!
//! Connection attempts are timestamped by the mock connector with tokio's
//! clock, so with paused time the gaps between attempts are exact.


use analysis_consumer::consumer::{AtMaxPolicy, ConsumerSettings, ConsumerState, ReconnectConfig};
use analysis_consumer::testing::{wait_until, LogCapture, MockConnector, MockScanner};
use analysis_consumer::transport::Disposition;
use std::sync::Arc;
use std::time::Duration;
use test_helpers::{build_consumer, request_payload, start, test_settings};

const LONG: Duration = Duration::from_secs(300);

fn secs(values: &[u64]) -> Vec<Duration> {
    values.iter().map(|s| Duration::from_secs(*s)).collect()
}

fn settings_with_backoff(initial: u64, max: u64, at_max: AtMaxPolicy) -> ConsumerSettings {
    ConsumerSettings {
        reconnect: ReconnectConfig {
            initial_delay: Duration::from_secs(initial),
            max_delay: Duration::from_secs(max),
            at_max,
        },
        ..test_settings()
    }
}

#[tokio::test(start_paused = true)]
async fn test_retry_delays_double_until_connected() {
    let connector = MockConnector::failing_first(4);
    let consumer = build_consumer(
        test_settings(),
        connector.clone(),
        Arc::new(MockScanner::succeeding()),
    );
    let _run = start(&consumer);

    let session = connector.wait_for_session(1, LONG).await.unwrap();
    assert!(wait_until(|| session.is_consuming(), LONG).await);

    assert_eq!(connector.attempt_count(), 5);
    assert_eq!(connector.attempt_gaps(), secs(&[1, 2, 4, 8]));
    assert_eq!(consumer.state(), ConsumerState::Consuming);
    assert_eq!(consumer.reconnect_delay().await, Duration::from_secs(1));
}

#[tokio::test(start_paused = true)]
async fn test_delay_resets_after_reaching_max() {
    let capture = LogCapture::new();
    let _guard = tracing::subscriber::set_default(capture.subscriber());

    let connector = MockConnector::always_failing();
    let consumer = build_consumer(
        settings_with_backoff(1, 4, AtMaxPolicy::Reset),
        connector.clone(),
        Arc::new(MockScanner::succeeding()),
    );
    let _run = start(&consumer);

    let attempts = connector.clone();
    assert!(wait_until(|| attempts.attempt_count() >= 6, LONG).await);

    assert_eq!(connector.attempt_gaps()[..5], secs(&[1, 2, 4, 1, 2])[..]);
    assert!(capture
        .contents()
        .contains("Max attempts reached. Resetting reconnection delay."));
    assert!(capture.contents().contains("Failed to connect to RabbitMQ"));
    assert!(capture.contents().contains("Reconnection attempt failed"));
}

#[tokio::test(start_paused = true)]
async fn test_plateau_keeps_retrying_at_max() {
    let connector = MockConnector::always_failing();
    let consumer = build_consumer(
        settings_with_backoff(1, 4, AtMaxPolicy::Plateau),
        connector.clone(),
        Arc::new(MockScanner::succeeding()),
    );
    let _run = start(&consumer);

    let attempts = connector.clone();
    assert!(wait_until(|| attempts.attempt_count() >= 6, LONG).await);

    assert_eq!(connector.attempt_gaps()[..5], secs(&[1, 2, 4, 4, 4])[..]);
}

#[tokio::test(start_paused = true)]
async fn test_lost_connection_reconnects_and_resumes_consuming() {
    let connector = MockConnector::failing_first(2);
    let consumer = build_consumer(
        test_settings(),
        connector.clone(),
        Arc::new(MockScanner::succeeding()),
    );
    let _run = start(&consumer);

    let first = connector.wait_for_session(1, LONG).await.unwrap();
    assert!(wait_until(|| first.is_consuming(), LONG).await);

    first.drop_connection("CONNECTION_FORCED - broker forced connection closure");
    let second = connector.wait_for_session(2, LONG).await.unwrap();
    assert!(wait_until(|| second.is_consuming(), LONG).await);

    // Backoff was reset by the earlier successful connection
    let gaps = connector.attempt_gaps();
    assert_eq!(gaps.last(), Some(&Duration::from_secs(1)));

    assert!(!first.observer_attached());
    assert_eq!(first.close_calls(), 1);

    let delivery = second.deliver(request_payload("9", "http://example.org"));
    assert_eq!(delivery.wait_settled(LONG).await, Some(Disposition::Ack));

    let metrics = consumer.metrics().snapshot();
    assert_eq!(metrics.connection.losses, 1);
    assert_eq!(metrics.connection.established, 2);
}

#[tokio::test(start_paused = true)]
async fn test_connection_error_triggers_reconnect() {
    let capture = LogCapture::new();
    let _guard = tracing::subscriber::set_default(capture.subscriber());

    let connector = MockConnector::new();
    let consumer = build_consumer(
        test_settings(),
        connector.clone(),
        Arc::new(MockScanner::succeeding()),
    );
    let _run = start(&consumer);

    let first = connector.wait_for_session(1, LONG).await.unwrap();
    assert!(wait_until(|| first.is_consuming(), LONG).await);

    first.simulate_error("heartbeat timeout");
    let second = connector.wait_for_session(2, LONG).await.unwrap();
    assert!(wait_until(|| second.is_consuming(), LONG).await);

    let contents = capture.contents();
    assert!(contents.contains("Connection to RabbitMQ got an error"));
    assert!(contents.contains("Connection to RabbitMQ closed. Attempting to reconnect..."));
    assert!(contents.contains("Reconnecting to RabbitMQ in 1000ms"));
}

#[tokio::test(start_paused = true)]
async fn test_consumer_setup_failure_retries_with_fresh_connection() {
    let connector = MockConnector::new();
    connector.fail_consume_next(1);
    let consumer = build_consumer(
        test_settings(),
        connector.clone(),
        Arc::new(MockScanner::succeeding()),
    );
    let _run = start(&consumer);

    let second = connector.wait_for_session(2, LONG).await.unwrap();
    assert!(wait_until(|| second.is_consuming(), LONG).await);

    let sessions = connector.sessions();
    let first = &sessions[0];
    assert!(!first.is_consuming());
    assert_eq!(first.close_calls(), 1);
    assert_eq!(connector.attempt_gaps(), secs(&[1]));
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_interrupts_reconnect_wait() {
    let connector = MockConnector::always_failing();
    let consumer = build_consumer(
        settings_with_backoff(60, 600, AtMaxPolicy::Reset),
        connector.clone(),
        Arc::new(MockScanner::succeeding()),
    );
    let run = start(&consumer);

    let states = consumer.clone();
    assert!(
        wait_until(
            || matches!(states.state(), ConsumerState::Reconnecting(_)),
            LONG
        )
        .await
    );

    let started = tokio::time::Instant::now();
    consumer.shutdown("SIGTERM").await.unwrap();
    run.await.unwrap().unwrap();

    assert!(started.elapsed() < Duration::from_secs(60));
    assert_eq!(connector.attempt_count(), 1);
    assert_eq!(consumer.state(), ConsumerState::ShuttingDown);
}
