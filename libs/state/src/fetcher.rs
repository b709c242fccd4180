//! Polling Scheduler
//!
//! A [`Fetcher`] runs one recurring fetch -> validate -> handle cycle against a
//! remote endpoint. Each job owns a single task, so a tick never starts while
//! the previous one is still in flight; ticks that would have fired meanwhile
//! are skipped, not queued.
//!
//! Failure policy: a failed or timed-out fetch, or a failed handler, is logged
//! and counted. The loop keeps its cadence and never surfaces the error.

use crate::cache::CacheError;
use crate::http::{HttpError, HttpRequest, HttpRequester};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("Fetch failed: {0}")]
    Request(String),

    #[error("Fetch timed out after {0:?}")]
    Timeout(Duration),

    #[error("Payload failed validation: {0}")]
    Validation(String),

    #[error("Handler failed: {0}")]
    Handler(String),

    #[error("Invalid fetcher configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Http(#[from] HttpError),

    #[error(transparent)]
    Cache(#[from] CacheError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetcherConfig {
    /// Job name used in logs
    pub name: String,
    pub interval: Duration,
    /// Hard bound on one fetch; always shorter than `interval`
    pub timeout: Duration,
}

impl FetcherConfig {
    pub fn new(name: impl Into<String>, interval: Duration, timeout: Duration) -> Result<Self, FetchError> {
        let name = name.into();
        if interval.is_zero() {
            return Err(FetchError::InvalidConfig(format!("{}: interval must be non-zero", name)));
        }
        if timeout >= interval {
            return Err(FetchError::InvalidConfig(format!(
                "{}: timeout {:?} must be shorter than interval {:?}",
                name, timeout, interval
            )));
        }
        Ok(Self {
            name,
            interval,
            timeout,
        })
    }
}

/// Produces one validated value per tick
#[async_trait]
pub trait FetchSource<T>: Send + Sync {
    async fn fetch(&self) -> Result<T, FetchError>;
}

/// Consumes a validated value, typically writing it to the shared cache
#[async_trait]
pub trait FetchHandler<T>: Send + Sync {
    async fn handle(&self, value: T) -> Result<(), FetchError>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetcherStats {
    pub ticks: u64,
    pub successes: u64,
    pub failures: u64,
    /// Fetches that completed after `stop()`
    pub discarded: u64,
}

#[derive(Default)]
struct Counters {
    ticks: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    discarded: AtomicU64,
}

struct Job<T> {
    config: FetcherConfig,
    source: Arc<dyn FetchSource<T>>,
    handler: Arc<dyn FetchHandler<T>>,
    /// Serializes loop ticks with `run_once`
    tick_lock: tokio::sync::Mutex<()>,
    counters: Counters,
}

/// Cancellation for one `start()`; a restart gets a fresh one
#[derive(Default)]
struct RunControl {
    stopped: AtomicBool,
    notify: Notify,
}

struct Running {
    control: Arc<RunControl>,
    _task: JoinHandle<()>,
}

pub struct Fetcher<T> {
    job: Arc<Job<T>>,
    running: Mutex<Option<Running>>,
}

impl<T: Send + 'static> Job<T> {
    async fn tick(&self, control: Option<&RunControl>) -> Result<(), FetchError> {
        let _tick = self.tick_lock.lock().await;
        self.counters.ticks.fetch_add(1, Ordering::Relaxed);

        let result = match tokio::time::timeout(self.config.timeout, self.source.fetch()).await {
            Ok(result) => result,
            Err(_) => Err(FetchError::Timeout(self.config.timeout)),
        };
        let value = match result {
            Ok(value) => value,
            Err(e) => {
                self.counters.failures.fetch_add(1, Ordering::Relaxed);
                return Err(e);
            }
        };

        if control.is_some_and(|c| c.stopped.load(Ordering::SeqCst)) {
            self.counters.discarded.fetch_add(1, Ordering::Relaxed);
            debug!("{}: discarding result fetched after stop", self.config.name);
            return Ok(());
        }

        match self.handler.handle(value).await {
            Ok(()) => {
                self.counters.successes.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(e) => {
                self.counters.failures.fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
        }
    }

    async fn run(self: Arc<Self>, control: Arc<RunControl>) {
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = control.notify.notified() => break,
                _ = ticker.tick() => {}
            }
            if control.stopped.load(Ordering::SeqCst) {
                break;
            }

            if let Err(e) = self.tick(Some(&control)).await {
                warn!("{}: tick failed: {}", self.config.name, e);
            }
        }

        debug!("{}: polling loop exited", self.config.name);
    }
}

impl<T: Send + 'static> Fetcher<T> {
    pub fn new(
        config: FetcherConfig,
        source: Arc<dyn FetchSource<T>>,
        handler: Arc<dyn FetchHandler<T>>,
    ) -> Self {
        Self {
            job: Arc::new(Job {
                config,
                source,
                handler,
                tick_lock: tokio::sync::Mutex::new(()),
                counters: Counters::default(),
            }),
            running: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.job.config.name
    }

    pub fn config(&self) -> &FetcherConfig {
        &self.job.config
    }

    /// Start the polling loop; a no-op when already running
    pub fn start(&self) {
        let mut running = self.running.lock();
        if running.is_some() {
            debug!("{}: already running", self.job.config.name);
            return;
        }

        let control = Arc::new(RunControl::default());
        let task = tokio::spawn(Arc::clone(&self.job).run(Arc::clone(&control)));
        *running = Some(Running {
            control,
            _task: task,
        });

        info!(
            "🔄 Started {} every {:?}",
            self.job.config.name, self.job.config.interval
        );
    }

    /// Cancel future ticks; a no-op when not running.
    ///
    /// A fetch already in flight may finish, but its result is discarded.
    pub fn stop(&self) {
        let Some(running) = self.running.lock().take() else {
            return;
        };
        running.control.stopped.store(true, Ordering::SeqCst);
        running.control.notify.notify_one();
        info!("⏹️ Stopped {}", self.job.config.name);
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    /// One fetch and handle right now, waiting for any in-flight tick first
    pub async fn run_once(&self) -> Result<(), FetchError> {
        self.job.tick(None).await
    }

    pub fn stats(&self) -> FetcherStats {
        let counters = &self.job.counters;
        FetcherStats {
            ticks: counters.ticks.load(Ordering::Relaxed),
            successes: counters.successes.load(Ordering::Relaxed),
            failures: counters.failures.load(Ordering::Relaxed),
            discarded: counters.discarded.load(Ordering::Relaxed),
        }
    }
}

impl<T> Drop for Fetcher<T> {
    fn drop(&mut self) {
        if let Some(running) = self.running.get_mut().take() {
            running.control.stopped.store(true, Ordering::SeqCst);
            running.control.notify.notify_one();
        }
    }
}

type Validator<T> = Box<dyn Fn(&T) -> Result<(), String> + Send + Sync>;

/// HTTP request, JSON deserialization into `T`, then an optional check
pub struct HttpSource<T> {
    requester: Arc<dyn HttpRequester>,
    request: HttpRequest,
    validator: Option<Validator<T>>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: DeserializeOwned> HttpSource<T> {
    pub fn new(requester: Arc<dyn HttpRequester>, request: HttpRequest) -> Self {
        Self {
            requester,
            request,
            validator: None,
            _marker: PhantomData,
        }
    }

    pub fn with_validator<F>(mut self, validator: F) -> Self
    where
        F: Fn(&T) -> Result<(), String> + Send + Sync + 'static,
    {
        self.validator = Some(Box::new(validator));
        self
    }

    pub fn request(&self) -> &HttpRequest {
        &self.request
    }
}

#[async_trait]
impl<T: DeserializeOwned + Send + 'static> FetchSource<T> for HttpSource<T> {
    async fn fetch(&self) -> Result<T, FetchError> {
        let raw = self.requester.request(&self.request).await?;
        let value: T =
            serde_json::from_value(raw).map_err(|e| FetchError::Validation(e.to_string()))?;
        if let Some(validator) = &self.validator {
            validator(&value).map_err(FetchError::Validation)?;
        }
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::ScriptedHttp;
    use serde::Deserialize;
    use std::sync::atomic::AtomicUsize;

    /// Counts fetches; fails the first `fail_first` of them
    #[derive(Default)]
    struct CountingSource {
        calls: AtomicUsize,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        delay: Duration,
        fail_first: usize,
    }

    #[async_trait]
    impl FetchSource<usize> for CountingSource {
        async fn fetch(&self) -> Result<usize, FetchError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(running, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            if call < self.fail_first {
                return Err(FetchError::Request("upstream down".to_string()));
            }
            Ok(call)
        }
    }

    #[derive(Default)]
    struct RecordingHandler {
        handled: Mutex<Vec<usize>>,
        delay: Duration,
    }

    #[async_trait]
    impl FetchHandler<usize> for RecordingHandler {
        async fn handle(&self, value: usize) -> Result<(), FetchError> {
            tokio::time::sleep(self.delay).await;
            self.handled.lock().push(value);
            Ok(())
        }
    }

    fn config(interval_ms: u64, timeout_ms: u64) -> FetcherConfig {
        FetcherConfig::new(
            "test-job",
            Duration::from_millis(interval_ms),
            Duration::from_millis(timeout_ms),
        )
        .unwrap()
    }

    #[test]
    fn test_timeout_must_be_shorter_than_interval() {
        assert!(FetcherConfig::new("job", Duration::from_secs(2), Duration::from_secs(2)).is_err());
        assert!(FetcherConfig::new("job", Duration::ZERO, Duration::ZERO).is_err());
        assert!(FetcherConfig::new("job", Duration::from_secs(2), Duration::from_millis(1500)).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_tick_does_not_stop_loop() {
        let source = Arc::new(CountingSource {
            fail_first: 2,
            ..Default::default()
        });
        let handler = Arc::new(RecordingHandler::default());
        let fetcher = Fetcher::new(config(100, 50), source.clone(), handler.clone());

        fetcher.start();
        tokio::time::sleep(Duration::from_millis(450)).await;
        fetcher.stop();

        let stats = fetcher.stats();
        assert_eq!(stats.failures, 2);
        assert!(stats.successes >= 2);
        assert_eq!(handler.handled.lock()[0], 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_handler_never_overlaps_ticks() {
        let source = Arc::new(CountingSource::default());
        let handler = Arc::new(RecordingHandler {
            delay: Duration::from_millis(350),
            ..Default::default()
        });
        let fetcher = Fetcher::new(config(100, 50), source.clone(), handler.clone());

        fetcher.start();
        tokio::time::sleep(Duration::from_millis(1_000)).await;
        fetcher.stop();

        assert_eq!(source.max_in_flight.load(Ordering::SeqCst), 1);
        // One tick per handler duration, not one per interval
        let calls = source.calls.load(Ordering::SeqCst);
        assert!((2..=4).contains(&calls), "unexpected tick count {}", calls);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_timeout_counts_as_failure() {
        let source = Arc::new(CountingSource {
            delay: Duration::from_millis(200),
            ..Default::default()
        });
        let handler = Arc::new(RecordingHandler::default());
        let fetcher = Fetcher::new(config(300, 80), source, handler.clone());

        assert!(matches!(fetcher.run_once().await, Err(FetchError::Timeout(_))));
        assert!(handler.handled.lock().is_empty());
        assert_eq!(fetcher.stats().failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_and_stop_are_idempotent() {
        let source = Arc::new(CountingSource::default());
        let handler = Arc::new(RecordingHandler::default());
        let fetcher = Fetcher::new(config(100, 50), source.clone(), handler);

        fetcher.stop();
        fetcher.start();
        fetcher.start();
        assert!(fetcher.is_running());

        tokio::time::sleep(Duration::from_millis(250)).await;
        fetcher.stop();
        fetcher.stop();
        assert!(!fetcher.is_running());

        // A second loop would have doubled the ticks
        let calls = source.calls.load(Ordering::SeqCst);
        assert!((2..=3).contains(&calls), "unexpected tick count {}", calls);

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(source.calls.load(Ordering::SeqCst), calls);
    }

    #[tokio::test(start_paused = true)]
    async fn test_result_fetched_after_stop_is_discarded() {
        let source = Arc::new(CountingSource {
            delay: Duration::from_millis(40),
            ..Default::default()
        });
        let handler = Arc::new(RecordingHandler::default());
        let fetcher = Fetcher::new(config(100, 80), source.clone(), handler.clone());

        fetcher.start();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
        fetcher.stop();

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(handler.handled.lock().is_empty());
        assert_eq!(fetcher.stats().discarded, 1);
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
    }

    #[derive(Debug, Deserialize)]
    struct Levels {
        success: bool,
    }

    #[tokio::test]
    async fn test_http_source_validates_payload() {
        let http = Arc::new(ScriptedHttp::new());
        http.push_response(Ok(serde_json::json!({ "success": false })));
        http.push_response(Ok(serde_json::json!({ "unexpected": 1 })));
        http.push_response(Ok(serde_json::json!({ "success": true })));

        let request = HttpRequest::get("https://api.example.org/levels", Duration::from_millis(500));
        let source = HttpSource::<Levels>::new(http.clone(), request).with_validator(|levels| {
            levels
                .success
                .then_some(())
                .ok_or_else(|| "unsuccessful response".to_string())
        });

        assert!(matches!(source.fetch().await, Err(FetchError::Validation(_))));
        assert!(matches!(source.fetch().await, Err(FetchError::Validation(_))));
        assert!(source.fetch().await.unwrap().success);
        assert_eq!(http.requests().len(), 3);
    }
}
