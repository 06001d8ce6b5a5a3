//! Mock broker, scanner and log capture
//!
//! The mocks share a [`Journal`] so tests can assert the relative order of
//! scans, dispositions and connection teardown.

use crate::protocol::{AnalysisRequest, AnalysisResult, Grade, Rating, Score};
use crate::scanner::{ScanError, Scanner};
use crate::transport::{
    BrokerConnector, BrokerDelivery, BrokerError, BrokerSession, ConnectionObserver,
    ConnectionOptions, DeliveryStream, Disposition,
};
use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::time::Instant;
use tracing_subscriber::fmt::MakeWriter;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Poll `condition` every millisecond until it holds or `timeout` elapses
pub async fn wait_until<F: Fn() -> bool>(condition: F, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while !condition() {
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    true
}

/// Ordered record of interesting events across all mocks
#[derive(Debug, Clone, Default)]
pub struct Journal(Arc<Mutex<Vec<String>>>);

impl Journal {
    pub fn record(&self, entry: impl Into<String>) {
        lock(&self.0).push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        lock(&self.0).clone()
    }

    pub fn position(&self, entry: &str) -> Option<usize> {
        lock(&self.0).iter().position(|e| e == entry)
    }

    pub fn count(&self, prefix: &str) -> usize {
        lock(&self.0).iter().filter(|e| e.starts_with(prefix)).count()
    }
}

#[derive(Debug, Default)]
struct ConnectorState {
    fail_next: usize,
    fail_always: bool,
    fail_consume_next: usize,
    attempts: Vec<Instant>,
    sessions: Vec<MockSession>,
}

/// Scripted connector; every successful attempt creates a new [`MockSession`]
#[derive(Debug, Clone, Default)]
pub struct MockConnector {
    state: Arc<Mutex<ConnectorState>>,
    gate: Option<Arc<Semaphore>>,
    journal: Journal,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// The first `count` attempts fail, later ones succeed
    pub fn failing_first(count: usize) -> Self {
        let connector = Self::new();
        lock(&connector.state).fail_next = count;
        connector
    }

    pub fn always_failing() -> Self {
        let connector = Self::new();
        lock(&connector.state).fail_always = true;
        connector
    }

    pub fn with_journal(self, journal: Journal) -> Self {
        Self { journal, ..self }
    }

    /// Attempts block after being counted until [`MockConnector::release`]
    pub fn gated(self) -> Self {
        Self {
            gate: Some(Arc::new(Semaphore::new(0))),
            ..self
        }
    }

    pub fn release(&self, attempts: usize) {
        if let Some(gate) = &self.gate {
            gate.add_permits(attempts);
        }
    }

    pub fn fail_next(&self, count: usize) {
        lock(&self.state).fail_next = count;
    }

    /// The next `count` sessions refuse to start a consumer
    pub fn fail_consume_next(&self, count: usize) {
        lock(&self.state).fail_consume_next = count;
    }

    pub fn attempts(&self) -> Vec<Instant> {
        lock(&self.state).attempts.clone()
    }

    pub fn attempt_count(&self) -> usize {
        lock(&self.state).attempts.len()
    }

    /// Gaps between consecutive connection attempts
    pub fn attempt_gaps(&self) -> Vec<Duration> {
        self.attempts()
            .windows(2)
            .map(|pair| pair[1].duration_since(pair[0]))
            .collect()
    }

    pub fn sessions(&self) -> Vec<MockSession> {
        lock(&self.state).sessions.clone()
    }

    pub fn latest_session(&self) -> Option<MockSession> {
        lock(&self.state).sessions.last().cloned()
    }

    /// Wait until `count` sessions have been created and return the last one
    pub async fn wait_for_session(&self, count: usize, timeout: Duration) -> Option<MockSession> {
        let state = Arc::clone(&self.state);
        if wait_until(|| lock(&state).sessions.len() >= count, timeout).await {
            self.sessions().get(count - 1).cloned()
        } else {
            None
        }
    }
}

#[async_trait]
impl BrokerConnector for MockConnector {
    type Session = MockSession;

    async fn connect(
        &self,
        _options: &ConnectionOptions,
        observer: ConnectionObserver,
    ) -> Result<MockSession, BrokerError> {
        lock(&self.state).attempts.push(Instant::now());

        if let Some(gate) = &self.gate {
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        }

        let mut state = lock(&self.state);
        if state.fail_always || state.fail_next > 0 {
            state.fail_next = state.fail_next.saturating_sub(1);
            self.journal.record("connect:failed");
            return Err(BrokerError::ConnectionFailed(
                "mock broker refused connection".to_string(),
            ));
        }

        let session = MockSession::new(observer, self.journal.clone());
        if state.fail_consume_next > 0 {
            state.fail_consume_next -= 1;
            session.set_fail_consume(true);
        }
        state.sessions.push(session.clone());
        self.journal.record("connect:ok");
        Ok(session)
    }
}

type DeliveryItem = Result<MockDelivery, BrokerError>;

#[derive(Debug)]
struct SessionState {
    observer: ConnectionObserver,
    journal: Journal,
    delivery_tx: Mutex<Option<mpsc::UnboundedSender<DeliveryItem>>>,
    delivery_rx: Mutex<Option<mpsc::UnboundedReceiver<DeliveryItem>>>,
    published: Mutex<Vec<(String, Vec<u8>)>>,
    declared: Mutex<Vec<String>>,
    prefetch: Mutex<Option<u16>>,
    consumer_tags: Mutex<Vec<String>>,
    closed: Arc<AtomicBool>,
    close_calls: AtomicUsize,
    fail_publish: AtomicBool,
    fail_consume: AtomicBool,
    fail_close: AtomicBool,
}

/// In-memory connection with a single consumer
#[derive(Debug, Clone)]
pub struct MockSession {
    state: Arc<SessionState>,
}

impl MockSession {
    fn new(observer: ConnectionObserver, journal: Journal) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            state: Arc::new(SessionState {
                observer,
                journal,
                delivery_tx: Mutex::new(Some(tx)),
                delivery_rx: Mutex::new(Some(rx)),
                published: Mutex::new(Vec::new()),
                declared: Mutex::new(Vec::new()),
                prefetch: Mutex::new(None),
                consumer_tags: Mutex::new(Vec::new()),
                closed: Arc::new(AtomicBool::new(false)),
                close_calls: AtomicUsize::new(0),
                fail_publish: AtomicBool::new(false),
                fail_consume: AtomicBool::new(false),
                fail_close: AtomicBool::new(false),
            }),
        }
    }

    /// Push a message to the consumer
    pub fn deliver(&self, payload: impl Into<Vec<u8>>) -> MockDelivery {
        self.deliver_with(payload, false)
    }

    pub fn redeliver(&self, payload: impl Into<Vec<u8>>) -> MockDelivery {
        self.deliver_with(payload, true)
    }

    fn deliver_with(&self, payload: impl Into<Vec<u8>>, redelivered: bool) -> MockDelivery {
        let delivery = MockDelivery::new(
            payload.into(),
            redelivered,
            Arc::clone(&self.state.closed),
            self.state.journal.clone(),
        );
        if let Some(tx) = lock(&self.state.delivery_tx).as_ref() {
            let _ = tx.send(Ok(delivery.clone()));
        }
        delivery
    }

    /// Broker-side close: notify the close observer and end the stream
    pub fn drop_connection(&self, reason: &str) {
        self.state.closed.store(true, Ordering::SeqCst);
        self.state.observer.on_close(reason);
        lock(&self.state.delivery_tx).take();
    }

    /// Connection-level error notification without closing
    pub fn simulate_error(&self, message: &str) {
        self.state.observer.on_error(message);
    }

    pub fn set_fail_publish(&self, fail: bool) {
        self.state.fail_publish.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_consume(&self, fail: bool) {
        self.state.fail_consume.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_close(&self, fail: bool) {
        self.state.fail_close.store(fail, Ordering::SeqCst);
    }

    pub fn published(&self) -> Vec<(String, Vec<u8>)> {
        lock(&self.state.published).clone()
    }

    pub fn declared_queues(&self) -> Vec<String> {
        lock(&self.state.declared).clone()
    }

    pub fn prefetch(&self) -> Option<u16> {
        *lock(&self.state.prefetch)
    }

    pub fn consumer_tags(&self) -> Vec<String> {
        lock(&self.state.consumer_tags).clone()
    }

    pub fn is_closed(&self) -> bool {
        self.state.closed.load(Ordering::SeqCst)
    }

    pub fn close_calls(&self) -> usize {
        self.state.close_calls.load(Ordering::SeqCst)
    }

    pub fn observer_attached(&self) -> bool {
        self.state.observer.is_attached()
    }

    pub fn is_consuming(&self) -> bool {
        !lock(&self.state.consumer_tags).is_empty()
    }
}

#[async_trait]
impl BrokerSession for MockSession {
    type Delivery = MockDelivery;

    async fn declare_durable_queue(&self, queue: &str) -> Result<(), BrokerError> {
        lock(&self.state.declared).push(queue.to_string());
        Ok(())
    }

    async fn set_prefetch(&self, count: u16) -> Result<(), BrokerError> {
        *lock(&self.state.prefetch) = Some(count);
        Ok(())
    }

    async fn consume(
        &self,
        _queue: &str,
        consumer_tag: &str,
    ) -> Result<DeliveryStream<MockDelivery>, BrokerError> {
        if self.state.fail_consume.load(Ordering::SeqCst) {
            return Err(BrokerError::ChannelFailed("mock consume refused".to_string()));
        }
        let rx = lock(&self.state.delivery_rx)
            .take()
            .ok_or_else(|| BrokerError::ChannelFailed("already consuming".to_string()))?;
        lock(&self.state.consumer_tags).push(consumer_tag.to_string());

        let stream = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        });
        Ok(stream.boxed())
    }

    async fn publish_persistent(&self, queue: &str, payload: &[u8]) -> Result<(), BrokerError> {
        if self.is_closed() {
            return Err(BrokerError::PublishFailed("channel closed".to_string()));
        }
        if self.state.fail_publish.load(Ordering::SeqCst) {
            return Err(BrokerError::PublishFailed("mock publish refused".to_string()));
        }
        lock(&self.state.published).push((queue.to_string(), payload.to_vec()));
        self.state.journal.record(format!("publish:{queue}"));
        Ok(())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.state.close_calls.fetch_add(1, Ordering::SeqCst);
        self.state.journal.record("close");
        self.state.closed.store(true, Ordering::SeqCst);
        lock(&self.state.delivery_tx).take();

        if self.state.fail_close.load(Ordering::SeqCst) {
            return Err(BrokerError::CloseFailed("mock close refused".to_string()));
        }
        Ok(())
    }
}

#[derive(Debug)]
struct DeliveryState {
    payload: Vec<u8>,
    redelivered: bool,
    channel_closed: Arc<AtomicBool>,
    journal: Journal,
    settled: watch::Sender<Vec<Disposition>>,
}

/// Delivery that records every disposition issued for it
#[derive(Debug, Clone)]
pub struct MockDelivery {
    state: Arc<DeliveryState>,
}

impl MockDelivery {
    fn new(
        payload: Vec<u8>,
        redelivered: bool,
        channel_closed: Arc<AtomicBool>,
        journal: Journal,
    ) -> Self {
        let (settled, _rx) = watch::channel(Vec::new());
        Self {
            state: Arc::new(DeliveryState {
                payload,
                redelivered,
                channel_closed,
                journal,
                settled,
            }),
        }
    }

    pub fn dispositions(&self) -> Vec<Disposition> {
        self.state.settled.borrow().clone()
    }

    /// Wait for the first disposition, `None` on timeout
    pub async fn wait_settled(&self, timeout: Duration) -> Option<Disposition> {
        let mut rx = self.state.settled.subscribe();
        let settled = tokio::time::timeout(timeout, async move {
            rx.wait_for(|d| !d.is_empty()).await.map(|d| d[0]).ok()
        })
        .await;
        settled.ok().flatten()
    }
}

#[async_trait]
impl BrokerDelivery for MockDelivery {
    fn payload(&self) -> &[u8] {
        &self.state.payload
    }

    fn redelivered(&self) -> bool {
        self.state.redelivered
    }

    async fn settle(&self, disposition: Disposition) -> Result<(), BrokerError> {
        if self.state.channel_closed.load(Ordering::SeqCst) {
            self.state.journal.record("settle:failed");
            return Err(BrokerError::SettleFailed("channel closed".to_string()));
        }
        self.state.settled.send_modify(|d| d.push(disposition));
        self.state.journal.record(format!("settle:{disposition:?}"));
        Ok(())
    }
}

/// What the mock scanner does for one call
#[derive(Debug, Clone, PartialEq)]
pub enum MockScanBehavior {
    Succeed,
    Validation(String),
    Transient(String),
}

/// Scanner with scripted outcomes and an optional gate holding scans open
#[derive(Debug)]
pub struct MockScanner {
    default_behavior: MockScanBehavior,
    script: Mutex<VecDeque<MockScanBehavior>>,
    gate: Option<Arc<Semaphore>>,
    calls: Mutex<Vec<AnalysisRequest>>,
    completed: AtomicUsize,
    journal: Journal,
}

impl MockScanner {
    pub fn new(default_behavior: MockScanBehavior) -> Self {
        Self {
            default_behavior,
            script: Mutex::new(VecDeque::new()),
            gate: None,
            calls: Mutex::new(Vec::new()),
            completed: AtomicUsize::new(0),
            journal: Journal::default(),
        }
    }

    pub fn succeeding() -> Self {
        Self::new(MockScanBehavior::Succeed)
    }

    /// Scans block until [`MockScanner::release`] hands out permits
    pub fn gated(self) -> Self {
        Self {
            gate: Some(Arc::new(Semaphore::new(0))),
            ..self
        }
    }

    pub fn with_journal(self, journal: Journal) -> Self {
        Self { journal, ..self }
    }

    /// Outcomes for the next calls, in order, before the default applies
    pub fn with_script(self, script: Vec<MockScanBehavior>) -> Self {
        *lock(&self.script) = script.into();
        self
    }

    pub fn release(&self, scans: usize) {
        if let Some(gate) = &self.gate {
            gate.add_permits(scans);
        }
    }

    pub fn calls(&self) -> Vec<AnalysisRequest> {
        lock(&self.calls).clone()
    }

    pub fn call_count(&self) -> usize {
        lock(&self.calls).len()
    }

    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }

    /// Result the scanner produces for `request` when it succeeds
    pub fn result_for(request: &AnalysisRequest) -> AnalysisResult {
        let now = Utc::now();
        let score = Score::new(90).unwrap_or(Score::MAX);
        AnalysisResult {
            request: request.clone(),
            raw_result: "{\"x-frame-options\":\"DENY\"}".to_string(),
            start_time: now,
            end_time: now,
            rating: Rating {
                version: "1.0".to_string(),
                score,
                grade: Grade::from_score(score),
            },
        }
    }
}

#[async_trait]
impl Scanner for MockScanner {
    async fn scan(&self, request: &AnalysisRequest) -> Result<AnalysisResult, ScanError> {
        lock(&self.calls).push(request.clone());
        self.journal.record(format!("scan:start:{}", request.url));
        let behavior = lock(&self.script)
            .pop_front()
            .unwrap_or_else(|| self.default_behavior.clone());

        if let Some(gate) = &self.gate {
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        }

        self.completed.fetch_add(1, Ordering::SeqCst);
        self.journal.record(format!("scan:end:{}", request.url));
        match behavior {
            MockScanBehavior::Succeed => Ok(Self::result_for(request)),
            MockScanBehavior::Validation(message) => Err(ScanError::Validation(message)),
            MockScanBehavior::Transient(message) => Err(ScanError::Transient(message)),
        }
    }
}

/// In-memory log sink usable as a `tracing_subscriber` writer
#[derive(Debug, Clone, Default)]
pub struct LogCapture {
    buffer: Arc<Mutex<Vec<u8>>>,
}

impl LogCapture {
    pub fn new() -> Self {
        Self::default()
    }

    /// Plain-text subscriber writing into this capture
    pub fn subscriber(&self) -> impl tracing::Subscriber + Send + Sync {
        tracing_subscriber::fmt()
            .with_writer(self.clone())
            .with_ansi(false)
            .with_target(false)
            .with_max_level(tracing::Level::DEBUG)
            .finish()
    }

    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&lock(&self.buffer)).into_owned()
    }

    pub fn lines(&self) -> Vec<String> {
        self.contents().lines().map(str::to_string).collect()
    }

    /// Index of the first line containing `needle`
    pub fn line_index(&self, needle: &str) -> Option<usize> {
        self.lines().iter().position(|line| line.contains(needle))
    }
}

pub struct LogWriter {
    buffer: Arc<Mutex<Vec<u8>>>,
}

impl io::Write for LogWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        lock(&self.buffer).extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for LogCapture {
    type Writer = LogWriter;

    fn make_writer(&'a self) -> Self::Writer {
        LogWriter {
            buffer: Arc::clone(&self.buffer),
        }
    }
}
