use async_trait::async_trait;
use chrono::NaiveDate;
use kline_analytics::aggregator::Period;
use kline_analytics::config::AppConfig;
use kline_analytics::error::{FetchError, QueryError, StreamError};
use kline_analytics::indicators::IndicatorSpec;
use kline_analytics::models::RawBarRecord;
use kline_analytics::processor::{BarQuery, BarSource, QueryRequest, QueryResult, QueryService, QuerySession, UpdateCallback};
use kline_analytics::stream::{FeedConnection, FeedTransport};
use kline_analytics::utils::system_clock;
use parking_lot::Mutex;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

const WEEKDAYS: [&str; 10] = [
    "2024-01-01", "2024-01-02", "2024-01-03", "2024-01-04", "2024-01-05",
    "2024-01-08", "2024-01-09", "2024-01-10", "2024-01-11", "2024-01-12",
];

fn record(time: &str, open: f64, close: f64, volume: f64) -> RawBarRecord {
    serde_json::from_value(json!({
        "time": time,
        "open": open,
        "high": open.max(close) + 0.5,
        "low": open.min(close) - 0.5,
        "close": close,
        "volume": volume,
    }))
    .unwrap()
}

fn history(days: &[&str]) -> Vec<RawBarRecord> {
    days.iter()
        .enumerate()
        .map(|(i, d)| record(d, 10.0 + i as f64, 10.5 + i as f64, 100.0))
        .collect()
}

fn date(s: &str) -> NaiveDate {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
}

/// Serves a fixed history, optionally slowly, counting every call.
struct StaticSource {
    records: Vec<RawBarRecord>,
    first_delay: Duration,
    delay: Duration,
    calls: AtomicUsize,
}

impl StaticSource {
    fn new(records: Vec<RawBarRecord>) -> Arc<Self> {
        Self::slow(records, Duration::ZERO)
    }

    fn slow(records: Vec<RawBarRecord>, delay: Duration) -> Arc<Self> {
        Self::with_delays(records, delay, delay)
    }

    /// Only the first call is slow.
    fn slow_first(records: Vec<RawBarRecord>, delay: Duration) -> Arc<Self> {
        Self::with_delays(records, delay, Duration::ZERO)
    }

    fn with_delays(records: Vec<RawBarRecord>, first_delay: Duration, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            records,
            first_delay,
            delay,
            calls: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BarSource for StaticSource {
    async fn fetch_bars(&self, _query: &BarQuery) -> Result<Vec<RawBarRecord>, FetchError> {
        let delay = match self.calls.fetch_add(1, Ordering::SeqCst) {
            0 => self.first_delay,
            _ => self.delay,
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        Ok(self.records.clone())
    }
}

struct FailingSource {
    calls: AtomicUsize,
}

#[async_trait]
impl BarSource for FailingSource {
    async fn fetch_bars(&self, _query: &BarQuery) -> Result<Vec<RawBarRecord>, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(FetchError::Upstream("503 Service Unavailable".to_string()))
    }
}

/// Hands out a single connection whose inbound frames come from a channel.
struct ChannelTransport {
    frames: Mutex<Option<mpsc::UnboundedReceiver<String>>>,
}

struct ChannelConnection {
    frames: mpsc::UnboundedReceiver<String>,
}

#[async_trait]
impl FeedTransport for ChannelTransport {
    async fn connect(&self, _instrument: &str) -> Result<Box<dyn FeedConnection>, StreamError> {
        match self.frames.lock().take() {
            Some(frames) => Ok(Box::new(ChannelConnection { frames })),
            None => Err(StreamError::Transport("connection refused".to_string())),
        }
    }
}

#[async_trait]
impl FeedConnection for ChannelConnection {
    async fn send_text(&mut self, _text: String) -> Result<(), StreamError> {
        Ok(())
    }

    async fn next_text(&mut self) -> Option<Result<String, StreamError>> {
        self.frames.recv().await.map(Ok)
    }
}

struct RefusingTransport;

#[async_trait]
impl FeedTransport for RefusingTransport {
    async fn connect(&self, _instrument: &str) -> Result<Box<dyn FeedConnection>, StreamError> {
        Err(StreamError::Transport("connection refused".to_string()))
    }
}

fn feed() -> (mpsc::UnboundedSender<String>, Arc<dyn FeedTransport>) {
    let (frames_tx, frames_rx) = mpsc::unbounded_channel();
    let transport: Arc<dyn FeedTransport> = Arc::new(ChannelTransport {
        frames: Mutex::new(Some(frames_rx)),
    });
    (frames_tx, transport)
}

fn delta(time: &str, close: f64) -> String {
    json!({"data": {"time": time, "open": close, "high": close + 0.5, "low": close - 0.5, "close": close, "volume": 200}}).to_string()
}

fn fast_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.stream.base_delay_ms = 1;
    config.stream.cap_delay_ms = 4;
    config.stream.connect_timeout_ms = 200;
    config
}

type Updates = mpsc::UnboundedReceiver<Result<Arc<QueryResult>, QueryError>>;

fn update_channel() -> (UpdateCallback, Updates) {
    let (tx, rx) = mpsc::unbounded_channel();
    let callback: UpdateCallback = Arc::new(move |update: Result<Arc<QueryResult>, QueryError>| {
        let _ = tx.send(update);
    });
    (callback, rx)
}

async fn next_update(updates: &mut Updates) -> Result<Arc<QueryResult>, QueryError> {
    tokio::time::timeout(Duration::from_secs(5), updates.recv())
        .await
        .expect("no update within 5s")
        .expect("update channel closed")
}

#[tokio::test]
async fn test_unknown_indicator_rejected_before_fetch() {
    let source = StaticSource::new(history(&WEEKDAYS));
    let service = QueryService::new(source.clone(), None, &AppConfig::default(), system_clock());

    let request = QueryRequest::new("AAPL", Period::Day).with_indicator(IndicatorSpec::new("unknown_xyz"));
    let err = service.query(request).await.unwrap_err();

    assert!(matches!(err, QueryError::Configuration(_)));
    assert_eq!(source.calls(), 0);
}

#[tokio::test]
async fn test_inverted_range_rejected() {
    let source = StaticSource::new(history(&WEEKDAYS));
    let service = QueryService::new(source.clone(), None, &AppConfig::default(), system_clock());

    let request = QueryRequest::new("AAPL", Period::Day).with_range(Some(date("2024-02-01")), Some(date("2024-01-01")));
    assert!(matches!(service.query(request).await, Err(QueryError::Configuration(_))));
    assert_eq!(source.calls(), 0);
}

#[tokio::test]
async fn test_cache_hit_skips_fetch() {
    let source = StaticSource::new(history(&WEEKDAYS));
    let service = QueryService::new(source.clone(), None, &AppConfig::default(), system_clock());
    let request = QueryRequest::new("AAPL", Period::Day).with_indicator(IndicatorSpec::new("sma5"));

    let first = service.query(request.clone()).await.unwrap();
    let second = service.query(request).await.unwrap();

    assert_eq!(source.calls(), 1);
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(first.bars.len(), 10);
    assert_eq!(first.series("sma5").map(|s| s.len()), Some(6));

    assert_eq!(service.invalidate("aapl"), 1);
    service.query(QueryRequest::new("AAPL", Period::Day).with_indicator(IndicatorSpec::new("sma5"))).await.unwrap();
    assert_eq!(source.calls(), 2);
}

#[tokio::test]
async fn test_fetch_failure_is_typed_after_retry() {
    let source = Arc::new(FailingSource {
        calls: AtomicUsize::new(0),
    });
    let service = QueryService::new(source.clone(), None, &AppConfig::default(), system_clock());

    let err = service.query(QueryRequest::new("AAPL", Period::Day)).await.unwrap_err();

    assert!(err.is_fetch_failure());
    assert!(matches!(err, QueryError::Fetch(FetchError::Upstream(_))));
    // one attempt plus one retry
    assert_eq!(source.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_weekly_query_aggregates_daily_bars() {
    let source = StaticSource::new(history(&WEEKDAYS));
    let service = QueryService::new(source, None, &AppConfig::default(), system_clock());

    let result = service.query(QueryRequest::new("AAPL", Period::Week)).await.unwrap();

    assert_eq!(result.period, Period::Week);
    assert_eq!(result.bars.len(), 2);
    let first_week = &result.bars[0];
    assert_eq!(first_week.time, date("2024-01-05"));
    assert_eq!(first_week.open, 10.0);
    assert_eq!(first_week.close, 14.5);
    assert_eq!(first_week.high, 15.0);
    assert_eq!(first_week.low, 9.5);
    assert_eq!(first_week.volume, 500.0);
    assert_eq!(result.bars[1].time, date("2024-01-12"));
}

#[tokio::test]
async fn test_concurrent_misses_share_one_fetch() {
    let source = StaticSource::slow(history(&WEEKDAYS), Duration::from_millis(50));
    let service = QueryService::new(source.clone(), None, &AppConfig::default(), system_clock());
    let request = QueryRequest::new("AAPL", Period::Day);

    let (a, b) = tokio::join!(service.query(request.clone()), service.query(request));

    assert_eq!(source.calls(), 1);
    assert!(Arc::ptr_eq(&a.unwrap(), &b.unwrap()));
}

#[tokio::test]
async fn test_session_supersedes_older_query() {
    let source = StaticSource::slow(history(&WEEKDAYS), Duration::from_millis(200));
    let service = Arc::new(QueryService::new(source, None, &AppConfig::default(), system_clock()));
    let session = QuerySession::new(service);

    let older = QueryRequest::new("AAPL", Period::Day);
    let newer = QueryRequest::new("AAPL", Period::Week);

    let (first, second) = tokio::join!(session.query(older), async {
        tokio::time::sleep(Duration::from_millis(20)).await;
        session.query(newer).await
    });

    assert!(matches!(first, Err(QueryError::Superseded)));
    assert_eq!(second.unwrap().period, Period::Week);
}

#[tokio::test]
async fn test_subscribe_without_feed_is_not_configured() {
    let source = StaticSource::new(history(&WEEKDAYS));
    let service = QueryService::new(source, None, &AppConfig::default(), system_clock());
    let (callback, _updates) = update_channel();

    let outcome = service.subscribe(QueryRequest::new("AAPL", Period::Day), callback).await;
    assert!(matches!(outcome, Err(QueryError::Stream(StreamError::NotConfigured))));
}

#[tokio::test]
async fn test_live_delta_updates_callback_and_cache() {
    let source = StaticSource::new(history(&WEEKDAYS[..5]));
    let (frames_tx, frames_rx) = mpsc::unbounded_channel();
    let transport: Arc<dyn FeedTransport> = Arc::new(ChannelTransport {
        frames: Mutex::new(Some(frames_rx)),
    });
    let service = QueryService::new(source.clone(), Some(transport), &fast_config(), system_clock());
    let request = QueryRequest::new("AAPL", Period::Day).with_indicator(IndicatorSpec::new("sma5"));
    let (callback, mut updates) = update_channel();

    let subscription = service.subscribe(request.clone(), callback).await.unwrap();
    assert_eq!(subscription.initial().bars.len(), 5);
    assert_eq!(subscription.initial().series("sma5").map(|s| s.len()), Some(1));

    // a non-bar frame is ignored
    frames_tx.send(json!({"type": "status", "message": "subscribed"}).to_string()).unwrap();
    frames_tx
        .send(
            json!({
                "type": "kline",
                "data": {"time": "2024-01-08", "open": 15.0, "high": 16.0, "low": 14.5, "close": 15.5, "volume": 300}
            })
            .to_string(),
        )
        .unwrap();

    let updated = next_update(&mut updates).await.unwrap();
    assert_eq!(updated.bars.len(), 6);
    assert_eq!(updated.last_bar().map(|b| b.close), Some(15.5));
    assert_eq!(updated.series("sma5").map(|s| s.len()), Some(2));

    // same day again replaces rather than appends
    frames_tx
        .send(json!({"time": "2024-01-08", "open": 15.0, "high": 17.0, "low": 14.5, "close": 16.5, "volume": 400}).to_string())
        .unwrap();
    let replaced = next_update(&mut updates).await.unwrap();
    assert_eq!(replaced.bars.len(), 6);
    assert_eq!(replaced.last_bar().map(|b| b.close), Some(16.5));

    let cached = service.query(request).await.unwrap();
    assert!(Arc::ptr_eq(&cached, &replaced));
    assert_eq!(source.calls(), 1);

    subscription.unsubscribe();
    assert!(service.streams().get("AAPL").is_none());
    service.dispose();
}

#[tokio::test]
async fn test_exhausted_feed_reaches_watcher_as_stream_error() {
    let source = StaticSource::new(history(&WEEKDAYS));
    let transport: Arc<dyn FeedTransport> = Arc::new(RefusingTransport);
    let service = QueryService::new(source, Some(transport), &fast_config(), system_clock());
    let (callback, mut updates) = update_channel();

    let _subscription = service.subscribe(QueryRequest::new("AAPL", Period::Day), callback).await.unwrap();

    let err = next_update(&mut updates).await.unwrap_err();
    assert!(err.is_stream_failure());
    assert_eq!(err, QueryError::Stream(StreamError::ReconnectExhausted { attempts: 5 }));
    service.dispose();
}

#[tokio::test]
async fn test_abandoned_query_does_not_poison_next_query() {
    let mut config = AppConfig::default();
    config.query.fetch_timeout_ms = 300;
    config.query.fetch_retries = 0;
    let source = StaticSource::slow_first(history(&WEEKDAYS), Duration::from_millis(500));
    let service = Arc::new(QueryService::new(source.clone(), None, &config, system_clock()));

    let pending = {
        let service = service.clone();
        tokio::spawn(async move { service.query(QueryRequest::new("AAPL", Period::Day)).await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    pending.abort();
    assert!(pending.await.unwrap_err().is_cancelled());
    tokio::time::sleep(Duration::from_millis(400)).await;

    let result = service.query(QueryRequest::new("AAPL", Period::Day)).await.unwrap();
    assert_eq!(result.bars.len(), 10);
    assert_eq!(source.calls(), 2);
}

#[tokio::test]
async fn test_query_under_live_subscription_uses_live_bars() {
    let source = StaticSource::slow(history(&WEEKDAYS[..3]), Duration::from_millis(200));
    let (frames_tx, transport) = feed();
    let service = QueryService::new(source.clone(), Some(transport), &fast_config(), system_clock());
    let request = QueryRequest::new("AAPL", Period::Day);
    let (callback, mut updates) = update_channel();

    let subscription = service.subscribe(request.clone(), callback).await.unwrap();
    assert_eq!(service.invalidate("AAPL"), 1);

    let during = service.query(request.clone()).await.unwrap();
    assert_eq!(during.bars.len(), 3);
    assert_eq!(source.calls(), 1);

    frames_tx.send(delta("2024-01-04", 13.0)).unwrap();
    assert_eq!(next_update(&mut updates).await.unwrap().bars.len(), 4);

    let later = service.query(request).await.unwrap();
    assert_eq!(later.bars.len(), 4);
    assert_eq!(source.calls(), 1);

    subscription.unsubscribe();
    service.dispose();
}

#[tokio::test]
async fn test_late_fetch_never_replaces_newer_live_result() {
    let source = StaticSource::slow_first(history(&WEEKDAYS[..3]), Duration::from_millis(200));
    let (frames_tx, transport) = feed();
    let service = Arc::new(QueryService::new(source.clone(), Some(transport), &fast_config(), system_clock()));
    let request = QueryRequest::new("AAPL", Period::Day);

    let slow_query = {
        let service = service.clone();
        let request = request.clone();
        tokio::spawn(async move { service.query(request).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    let (callback, mut updates) = update_channel();
    let subscription = service.subscribe(request.clone(), callback).await.unwrap();
    frames_tx.send(delta("2024-01-04", 13.0)).unwrap();
    assert_eq!(next_update(&mut updates).await.unwrap().bars.len(), 4);

    let late = slow_query.await.unwrap().unwrap();
    assert_eq!(late.bars.len(), 4);
    let later = service.query(request).await.unwrap();
    assert_eq!(later.bars.len(), 4);
    assert_eq!(source.calls(), 2);

    subscription.unsubscribe();
    service.dispose();
}
