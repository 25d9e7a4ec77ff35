use crate::aggregator::{Aggregator, Period};
use crate::cache::{CacheKeys, ResultCache};
use crate::config::{AppConfig, QueryConfig};
use crate::error::{FetchError, QueryError, StreamError};
use crate::indicators::{IndicatorCalculator, IndicatorRegistry, IndicatorSpec};
use crate::models::{normalize_records, Bar, RawBarRecord};
use crate::processor::job::{DateRange, QueryRequest, QueryResult};
use crate::processor::source::{BarQuery, BarSource};
use crate::stream::{FeedMessage, FeedTransport, StreamEvent, StreamHub, StreamSettings, Subscription};
use crate::utils::{measure_sync, measure_time, SharedClock};
use futures::future::{BoxFuture, FutureExt, Shared, WeakShared};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Receives a fresh result after every live delta, or the terminal stream error.
pub type UpdateCallback = Arc<dyn Fn(Result<Arc<QueryResult>, QueryError>) + Send + Sync>;

type LoadFuture = BoxFuture<'static, Result<Arc<QueryResult>, QueryError>>;
type SharedLoad = Shared<LoadFuture>;
type LiveMap = Arc<RwLock<HashMap<String, LiveState>>>;

struct Watcher {
    request: QueryRequest,
    callback: UpdateCallback,
}

/// Daily bars kept for one instrument and date range while anyone watches it.
struct LiveState {
    instrument: String,
    range: DateRange,
    daily: Vec<Bar>,
    watchers: HashMap<Uuid, Watcher>,
    stream_sub: Option<Subscription>,
}

impl LiveState {
    fn live_key(instrument: &str, range: &DateRange) -> String {
        format!("{}{:?}:{:?}", CacheKeys::instrument_prefix(instrument), range.start, range.end)
    }
}

/// Merge one live bar into an ascending daily series.
///
/// A bar for an existing day replaces it; any other bar is inserted at its place
/// in time, which for the usual newest-day delta means an append. Returns false
/// if the series did not change.
pub fn merge_delta(daily: &mut Vec<Bar>, bar: Bar) -> bool {
    match daily.binary_search_by_key(&bar.time, |b| b.time) {
        Ok(idx) => {
            if daily[idx] == bar {
                return false;
            }
            daily[idx] = bar;
        }
        Err(idx) => daily.insert(idx, bar),
    }
    true
}

/// Aggregate daily bars to the requested period and run every indicator.
pub fn build_result(instrument: &str, period: Period, daily: &[Bar], specs: &[IndicatorSpec]) -> QueryResult {
    measure_sync("build_result", || {
        let bars = Aggregator::aggregate(daily, period);
        let indicators = IndicatorCalculator::calculate_all(&bars, specs);
        QueryResult {
            instrument: instrument.to_string(),
            period,
            bars,
            indicators,
        }
    })
}

/// Handle for a live subscription created by `QueryService::subscribe`.
pub struct LiveSubscription {
    id: Uuid,
    instrument: String,
    live_key: String,
    initial: Arc<QueryResult>,
    live: Weak<RwLock<HashMap<String, LiveState>>>,
    streams: Weak<StreamHub>,
}

impl LiveSubscription {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// The result computed when the subscription was opened.
    pub fn initial(&self) -> &Arc<QueryResult> {
        &self.initial
    }

    /// Stop receiving updates. The feed connection closes once nobody watches the instrument.
    pub fn unsubscribe(self) {
        let live = match self.live.upgrade() {
            Some(live) => live,
            None => return,
        };

        let (emptied, still_watched) = {
            let mut map = live.write();
            let now_empty = match map.get_mut(&self.live_key) {
                Some(state) => {
                    state.watchers.remove(&self.id);
                    state.watchers.is_empty()
                }
                None => false,
            };
            let emptied = if now_empty { map.remove(&self.live_key) } else { None };
            let still_watched = map.values().any(|s| s.instrument == self.instrument);
            (emptied, still_watched)
        };

        if let Some(sub) = emptied.and_then(|state| state.stream_sub) {
            sub.unsubscribe();
        }
        if !still_watched {
            if let Some(hub) = self.streams.upgrade() {
                hub.disconnect(&self.instrument);
            }
        }
        debug!(instrument = %self.instrument, "Live subscription closed");
    }
}

/// Single entry point for bar queries and live updates.
pub struct QueryService {
    source: Arc<dyn BarSource>,
    registry: IndicatorRegistry,
    cache: Arc<ResultCache<QueryResult>>,
    streams: Arc<StreamHub>,
    config: QueryConfig,
    /// Weak so that a load is dropped, and its fetch cancelled, once every caller waiting on it is gone.
    in_flight: Mutex<HashMap<String, WeakShared<LoadFuture>>>,
    live: LiveMap,
}

impl QueryService {
    pub fn new(
        source: Arc<dyn BarSource>,
        transport: Option<Arc<dyn FeedTransport>>,
        config: &AppConfig,
        clock: SharedClock,
    ) -> Self {
        Self {
            source,
            registry: IndicatorRegistry::builtin(),
            cache: Arc::new(ResultCache::new(config.cache.clone(), clock)),
            streams: Arc::new(StreamHub::new(transport, StreamSettings::from(&config.stream))),
            config: config.query.clone(),
            in_flight: Mutex::new(HashMap::new()),
            live: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Start background maintenance (the cache sweeper). Needs a tokio runtime.
    pub fn start(&self) {
        self.cache.spawn_sweeper();
        info!("Query service started");
    }

    pub fn registry(&self) -> &IndicatorRegistry {
        &self.registry
    }

    pub fn cache(&self) -> &Arc<ResultCache<QueryResult>> {
        &self.cache
    }

    pub fn streams(&self) -> &Arc<StreamHub> {
        &self.streams
    }

    fn prepare(&self, request: QueryRequest) -> Result<QueryRequest, QueryError> {
        if request.instrument.trim().is_empty() {
            return Err(QueryError::Configuration("instrument code is empty".to_string()));
        }
        if request.date_range.is_empty_range() {
            return Err(QueryError::Configuration(format!(
                "date range starts after it ends: {:?}",
                request.date_range
            )));
        }
        let indicators = self.registry.resolve_all(&request.indicators)?;
        Ok(QueryRequest {
            instrument: request.instrument.trim().to_string(),
            indicators,
            ..request
        })
    }

    /// Cached or freshly computed bars and indicators for `request`.
    ///
    /// Indicator specs are validated before anything is fetched. A request covered
    /// by a live subscription is built from its bars. Concurrent misses on the same
    /// key share one fetch, which is dropped once no caller waits on it.
    #[instrument(skip(self, request), fields(instrument = %request.instrument, period = %request.period))]
    pub async fn query(&self, request: QueryRequest) -> Result<Arc<QueryResult>, QueryError> {
        let request = self.prepare(request)?;
        let key = request.cache_key();

        if let Some(hit) = self.cache.get(&key) {
            debug!(key = %key, "Cache hit");
            return Ok(hit);
        }

        if let Some(result) = live_result(&self.live, &request) {
            debug!(key = %key, "Built from live bars");
            self.cache.insert(key, result.clone());
            return Ok(result);
        }

        let load: SharedLoad = {
            let mut in_flight = self.in_flight.lock();
            match in_flight.get(&key).and_then(WeakShared::upgrade) {
                Some(load) => {
                    debug!(key = %key, "Joining in-flight load");
                    load
                }
                None => {
                    in_flight.retain(|_, weak| weak.upgrade().is_some());
                    let load = Self::load(
                        self.source.clone(),
                        self.cache.clone(),
                        self.live.clone(),
                        self.config.clone(),
                        request,
                        key.clone(),
                    )
                    .boxed()
                    .shared();
                    if let Some(weak) = load.downgrade() {
                        in_flight.insert(key.clone(), weak);
                    }
                    load
                }
            }
        };

        let outcome = load.clone().await;

        let mut in_flight = self.in_flight.lock();
        let finished = in_flight
            .get(&key)
            .map_or(false, |weak| weak.upgrade().map_or(true, |current| current.ptr_eq(&load)));
        if finished {
            in_flight.remove(&key);
        }
        outcome
    }

    async fn load(
        source: Arc<dyn BarSource>,
        cache: Arc<ResultCache<QueryResult>>,
        live: LiveMap,
        config: QueryConfig,
        request: QueryRequest,
        key: String,
    ) -> Result<Arc<QueryResult>, QueryError> {
        let started = cache.now();
        let daily = Self::fetch_daily(source.as_ref(), &config, &request.instrument, &request.date_range).await?;
        // A subscription opened during the fetch holds bars at least as new.
        let result = match live_result(&live, &request) {
            Some(result) => result,
            None => Arc::new(build_result(&request.instrument, request.period, &daily, &request.indicators)),
        };

        info!(
            bars = result.bars.len(),
            indicators = result.indicators.len(),
            "Computed query result"
        );
        // A live update may have replaced the entry while the fetch ran.
        Ok(cache.insert_unless_newer(key, result, started))
    }

    /// Fetch and normalize daily bars, retrying a failed attempt as configured.
    async fn fetch_daily(
        source: &dyn BarSource,
        config: &QueryConfig,
        instrument: &str,
        range: &DateRange,
    ) -> Result<Vec<Bar>, QueryError> {
        let query = BarQuery::new(instrument, range, config);
        let records = measure_time("fetch_bars", Self::fetch_with_retry(source, config, &query)).await?;

        let (daily, rejected) = normalize_records(&records);
        if !rejected.is_empty() {
            warn!(
                rejected = rejected.len(),
                kept = daily.len(),
                "Some bar records were malformed and excluded"
            );
        }
        Ok(daily)
    }

    async fn fetch_with_retry(
        source: &dyn BarSource,
        config: &QueryConfig,
        query: &BarQuery,
    ) -> Result<Vec<RawBarRecord>, FetchError> {
        let attempts = config.fetch_retries + 1;
        let mut last_error = FetchError::Upstream("no fetch attempted".to_string());

        for attempt in 1..=attempts {
            match tokio::time::timeout(config.fetch_timeout(), source.fetch_bars(query)).await {
                Ok(Ok(records)) => {
                    debug!(attempt, records = records.len(), "Fetched bar records");
                    return Ok(records);
                }
                Ok(Err(e)) => last_error = e,
                Err(_) => last_error = FetchError::Timeout(config.fetch_timeout_ms),
            }
            if attempt < attempts {
                warn!(attempt, max = attempts, error = %last_error, "Bar fetch failed, retrying");
            }
        }
        Err(last_error)
    }

    /// Open a live subscription for `request`.
    ///
    /// Daily bars for the request's range are loaded once and kept; every delta
    /// from the feed is merged into them, the result is recomputed in full,
    /// replaces the cache entry, and goes to `on_update`. A terminal feed
    /// failure reaches `on_update` as a stream error.
    #[instrument(skip(self, request, on_update), fields(instrument = %request.instrument))]
    pub async fn subscribe(&self, request: QueryRequest, on_update: UpdateCallback) -> Result<LiveSubscription, QueryError> {
        let request = self.prepare(request)?;
        if !self.streams.is_configured() {
            return Err(QueryError::Stream(StreamError::NotConfigured));
        }

        let instrument = request.instrument.clone();
        let live_key = LiveState::live_key(&instrument, &request.date_range);

        let known = self.live.read().contains_key(&live_key);
        let fetched = if known {
            None
        } else {
            Some(Self::fetch_daily(self.source.as_ref(), &self.config, &instrument, &request.date_range).await?)
        };

        let id = Uuid::new_v4();
        let (initial, needs_stream) = {
            let mut live = self.live.write();
            let state = live.entry(live_key.clone()).or_insert_with(|| LiveState {
                instrument: instrument.clone(),
                range: request.date_range,
                daily: fetched.unwrap_or_default(),
                watchers: HashMap::new(),
                stream_sub: None,
            });
            let initial = Arc::new(build_result(&instrument, request.period, &state.daily, &request.indicators));
            self.cache.insert(request.cache_key(), initial.clone());
            state.watchers.insert(
                id,
                Watcher {
                    request,
                    callback: on_update,
                },
            );
            (initial, state.stream_sub.is_none())
        };

        if needs_stream {
            if let Err(e) = self.attach_stream(&instrument, &live_key) {
                if let Some(state) = self.live.write().get_mut(&live_key) {
                    state.watchers.remove(&id);
                }
                return Err(e);
            }
        }

        info!(watcher = %id, "Live subscription opened");
        Ok(LiveSubscription {
            id,
            instrument,
            live_key,
            initial,
            live: Arc::downgrade(&self.live),
            streams: Arc::downgrade(&self.streams),
        })
    }

    fn attach_stream(&self, instrument: &str, live_key: &str) -> Result<(), QueryError> {
        let client = self.streams.client(instrument)?;

        let live = Arc::downgrade(&self.live);
        let cache = Arc::downgrade(&self.cache);
        let key = live_key.to_string();
        let sub = client.subscribe(move |event| on_stream_event(&live, &cache, &key, event));

        // Another subscriber may have attached first, or the state is already gone.
        let leftover = {
            let mut map = self.live.write();
            match map.get_mut(live_key) {
                Some(state) if state.stream_sub.is_none() => {
                    state.stream_sub = Some(sub);
                    None
                }
                _ => Some(sub),
            }
        };
        if let Some(sub) = leftover {
            sub.unsubscribe();
        }
        Ok(())
    }

    /// Drop every cached result for one instrument.
    pub fn invalidate(&self, instrument: &str) -> usize {
        self.cache.invalidate_prefix(&CacheKeys::instrument_prefix(instrument))
    }

    /// Stop the sweeper, close every feed, and drop all cached and live state.
    pub fn dispose(&self) {
        self.streams.disconnect_all();
        self.live.write().clear();
        self.in_flight.lock().clear();
        self.cache.dispose();
        info!("Query service disposed");
    }
}

/// Result for `request` computed from bars a live subscription already holds.
fn live_result(live: &LiveMap, request: &QueryRequest) -> Option<Arc<QueryResult>> {
    let live = live.read();
    let state = live.get(&LiveState::live_key(&request.instrument, &request.date_range))?;
    Some(Arc::new(build_result(
        &request.instrument,
        request.period,
        &state.daily,
        &request.indicators,
    )))
}

fn on_stream_event(
    live: &Weak<RwLock<HashMap<String, LiveState>>>,
    cache: &Weak<ResultCache<QueryResult>>,
    live_key: &str,
    event: &StreamEvent,
) {
    let live = match live.upgrade() {
        Some(live) => live,
        None => return,
    };

    match event {
        StreamEvent::Message(FeedMessage::Bar(record)) => {
            let bar = match record.to_bar(0) {
                Ok(bar) => bar,
                Err(e) => {
                    warn!(error = %e, "Dropping malformed live bar");
                    return;
                }
            };

            let (instrument, updates): (String, Vec<(UpdateCallback, String, Arc<QueryResult>)>) = {
                let mut map = live.write();
                let state = match map.get_mut(live_key) {
                    Some(state) => state,
                    None => return,
                };
                if !state.range.contains(bar.time) {
                    debug!(time = %bar.time, "Live bar outside the watched range");
                    return;
                }
                if !merge_delta(&mut state.daily, bar) {
                    return;
                }
                let updates: Vec<_> = state
                    .watchers
                    .values()
                    .map(|w| {
                        let result = build_result(&state.instrument, w.request.period, &state.daily, &w.request.indicators);
                        (w.callback.clone(), w.request.cache_key(), Arc::new(result))
                    })
                    .collect();
                (state.instrument.clone(), updates)
            };

            if let Some(cache) = cache.upgrade() {
                // Results for other shapes of this instrument predate the delta.
                cache.invalidate_prefix(&CacheKeys::instrument_prefix(&instrument));
                for (_, key, result) in &updates {
                    cache.insert(key.clone(), result.clone());
                }
            }
            for (callback, _, result) in updates {
                callback(Ok(result));
            }
        }
        StreamEvent::Message(FeedMessage::Metadata(value)) => {
            debug!(metadata = %value, "Feed metadata");
        }
        StreamEvent::Connected => info!(key = live_key, "Live feed connected"),
        StreamEvent::Disconnected(reason) => warn!(key = live_key, reason = %reason, "Live feed interrupted"),
        StreamEvent::Closed(err) => {
            let state = live.write().remove(live_key);
            if let Some(state) = state {
                for watcher in state.watchers.values() {
                    (watcher.callback)(Err(QueryError::Stream(err.clone())));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn bar(day: u32, close: f64) -> Bar {
        let time = NaiveDate::from_ymd_opt(2024, 1, day).unwrap();
        Bar::new(time, close, close + 1.0, close - 1.0, close, 10.0)
    }

    #[test]
    fn test_merge_delta_replaces_same_day() {
        let mut daily = vec![bar(1, 10.0), bar(2, 11.0)];
        assert!(merge_delta(&mut daily, bar(2, 12.0)));
        assert_eq!(daily.len(), 2);
        assert_eq!(daily[1].close, 12.0);
        assert!(!merge_delta(&mut daily, bar(2, 12.0)));
    }

    #[test]
    fn test_merge_delta_appends_and_keeps_order() {
        let mut daily = vec![bar(1, 10.0), bar(3, 11.0)];
        assert!(merge_delta(&mut daily, bar(4, 12.0)));
        assert!(merge_delta(&mut daily, bar(2, 10.5)));
        let days: Vec<u32> = daily.iter().map(|b| chrono::Datelike::day(&b.time)).collect();
        assert_eq!(days, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_build_result_aggregates_then_computes() {
        // 2024-01-01 is a Monday
        let daily: Vec<Bar> = (1..=14).map(|d| bar(d, 10.0 + d as f64)).collect();
        let specs = vec![IndicatorSpec::new("sma").with_param("period", 2.0)];
        let result = build_result("AAPL", Period::Week, &daily, &specs);
        assert_eq!(result.bars.len(), 2);
        assert_eq!(result.indicators["sma"].len(), 1);
    }
}
