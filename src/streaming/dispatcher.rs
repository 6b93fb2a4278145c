use crate::core::config::StreamingConfig;
use crate::core::kernel::codec::{split_frames, TradierCodec, WsCodec};
use crate::core::types::{EventKind, StreamEvent};
use crate::streaming::error_sink::ErrorSink;
use crate::streaming::stats::StatisticsCollector;
use crate::streaming::subscription::SubscriptionRegistry;
use parking_lot::{Mutex, RwLock};
use rust_decimal::Decimal;
use std::collections::{HashMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Identity of an event for duplicate suppression
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DedupKey {
    pub kind: EventKind,
    pub bucket: String,
    pub timestamp: String,
    pub value: String,
    pub size: String,
}

fn dec(value: Decimal) -> String {
    value.normalize().to_string()
}

impl DedupKey {
    /// Build the key for a routable event. Market events bucket by symbol,
    /// account events by account, so the bucket set stays as small as the
    /// set of symbols and accounts on the stream.
    pub fn for_event(event: &StreamEvent) -> Option<Self> {
        let kind = event.kind()?;
        let (bucket, timestamp, value, size) = match event {
            StreamEvent::Trade(e) => (
                e.symbol.clone(),
                e.date.clone(),
                dec(e.price),
                e.size.to_string(),
            ),
            StreamEvent::Quote(e) => (
                e.symbol.clone(),
                format!("{}|{}", e.bid_date, e.ask_date),
                format!("{}/{}", dec(e.bid), dec(e.ask)),
                format!("{}/{}", e.bid_size, e.ask_size),
            ),
            StreamEvent::Summary(e) => (
                e.symbol.clone(),
                String::new(),
                format!(
                    "{}/{}/{}/{}/{}",
                    dec(e.open),
                    dec(e.high),
                    dec(e.low),
                    dec(e.close),
                    dec(e.prev_close)
                ),
                String::new(),
            ),
            StreamEvent::Timesale(e) => (
                e.symbol.clone(),
                e.date.clone(),
                dec(e.last),
                e.size.to_string(),
            ),
            StreamEvent::AccountOrder(e) => (
                format!("order:{}", e.account),
                e.date.clone(),
                format!("{}:{}:{}:{}", e.order_id, e.event, e.status, dec(e.price)),
                dec(e.quantity),
            ),
            StreamEvent::AccountPosition(e) => (
                format!("position:{}", e.account),
                e.date.clone(),
                format!("{}:{}", e.symbol, dec(e.quantity)),
                dec(e.cost_basis),
            ),
            StreamEvent::Heartbeat | StreamEvent::Unknown => return None,
        };
        Some(Self {
            kind,
            bucket,
            timestamp,
            value,
            size,
        })
    }
}

/// Upper bound on distinct buckets; the oldest bucket is dropped past this
pub const MAX_DEDUP_BUCKETS: usize = 4096;

/// Per-bucket recency window of recently delivered keys
#[derive(Debug, Default)]
pub struct DedupCache {
    capacity: usize,
    recent: HashMap<String, VecDeque<DedupKey>>,
    // bucket creation order, oldest first
    buckets: VecDeque<String>,
}

impl DedupCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            recent: HashMap::new(),
            buckets: VecDeque::new(),
        }
    }

    pub fn bucket_count(&self) -> usize {
        self.recent.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn set_capacity(&mut self, capacity: usize) {
        self.capacity = capacity;
        for window in self.recent.values_mut() {
            while window.len() > capacity {
                window.pop_front();
            }
        }
        self.recent.retain(|_, window| !window.is_empty());
        let recent = &self.recent;
        self.buckets.retain(|bucket| recent.contains_key(bucket));
    }

    /// Returns `true` if the key was not seen within the window, recording it.
    pub fn insert(&mut self, key: DedupKey) -> bool {
        if self.capacity == 0 {
            return true;
        }
        if !self.recent.contains_key(&key.bucket) {
            while self.recent.len() >= MAX_DEDUP_BUCKETS {
                let Some(oldest) = self.buckets.pop_front() else {
                    break;
                };
                self.recent.remove(&oldest);
            }
            self.buckets.push_back(key.bucket.clone());
        }
        let window = self.recent.entry(key.bucket.clone()).or_default();
        if window.contains(&key) {
            return false;
        }
        if window.len() >= self.capacity {
            window.pop_front();
        }
        window.push_back(key);
        true
    }

    pub fn clear(&mut self) {
        self.recent.clear();
        self.buckets.clear();
    }
}

/// Decodes inbound frames and fans them out to registered callbacks.
///
/// Runs on the connection's read-loop task. Nothing here returns an error:
/// bad frames and failing callbacks are counted and reported, then skipped.
pub struct EventDispatcher {
    codec: TradierCodec,
    registry: Arc<SubscriptionRegistry>,
    stats: Arc<StatisticsCollector>,
    errors: Arc<ErrorSink>,
    config: Arc<RwLock<StreamingConfig>>,
    dedup: Mutex<DedupCache>,
}

impl std::fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventDispatcher")
            .field("config", &*self.config.read())
            .finish_non_exhaustive()
    }
}

impl EventDispatcher {
    pub fn new(
        registry: Arc<SubscriptionRegistry>,
        stats: Arc<StatisticsCollector>,
        errors: Arc<ErrorSink>,
        config: Arc<RwLock<StreamingConfig>>,
    ) -> Self {
        let capacity = config.read().dedup_capacity;
        Self {
            codec: TradierCodec,
            registry,
            stats,
            errors,
            config,
            dedup: Mutex::new(DedupCache::new(capacity)),
        }
    }

    /// Handle one transport payload, which may hold several frames
    pub fn dispatch_payload(&self, payload: &str) {
        for frame in split_frames(payload) {
            self.dispatch_frame(frame);
        }
    }

    pub fn dispatch_frame(&self, frame: &str) {
        self.stats.record_received();
        self.stats.mark_message();

        let event = match self.codec.decode_message(frame) {
            Ok(event) => event,
            Err(e) => {
                self.stats.record_error();
                warn!(error = %e, "dropping malformed frame");
                return;
            }
        };

        let Some(kind) = event.kind() else {
            if event == StreamEvent::Heartbeat {
                trace!("heartbeat");
            } else {
                self.stats.record_error();
                warn!(frame = %frame, "dropping frame with unrecognized type");
            }
            return;
        };

        if !self.registry.passes_filters(&event) {
            trace!(kind = %kind, symbol = ?event.symbol(), "filtered");
            return;
        }

        let config = *self.config.read();
        if config.filter_duplicates {
            if let Some(key) = DedupKey::for_event(&event) {
                let mut cache = self.dedup.lock();
                if cache.capacity() != config.dedup_capacity {
                    cache.set_capacity(config.dedup_capacity);
                }
                if !cache.insert(key) {
                    debug!(kind = %kind, symbol = ?event.symbol(), "suppressed duplicate");
                    return;
                }
            }
        }

        // account events count as processed once routed, callbacks or not;
        // market events only when some callback wants the symbol
        let callbacks = self.registry.callbacks_for(kind, event.symbol());
        if callbacks.is_empty() {
            if !kind.is_market() {
                self.stats.record_processed();
            }
            return;
        }

        for callback in &callbacks {
            match catch_unwind(AssertUnwindSafe(|| callback(&event))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    self.stats.record_error();
                    self.errors
                        .report(&format!("{} callback failed: {:#}", kind, e));
                }
                Err(_) => {
                    self.stats.record_error();
                    self.errors.report(&format!("{} callback panicked", kind));
                }
            }
        }
        self.stats.record_processed();
    }

    pub fn clear_dedup(&self) {
        self.dedup.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{SessionKind, StreamSession};
    use crate::streaming::subscription::EventCallback;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const TRADE: &str = r#"{"type":"trade","symbol":"SPY","exch":"Q","price":"281.1","size":"100","cvol":"3017413","date":"1557757189194","last":"281.1"}"#;

    struct Fixture {
        dispatcher: EventDispatcher,
        registry: Arc<SubscriptionRegistry>,
        stats: Arc<StatisticsCollector>,
        errors: Arc<ErrorSink>,
        config: Arc<RwLock<StreamingConfig>>,
    }

    fn fixture() -> Fixture {
        let registry = Arc::new(SubscriptionRegistry::new());
        let stats = Arc::new(StatisticsCollector::new());
        let errors = Arc::new(ErrorSink::new());
        let config = Arc::new(RwLock::new(StreamingConfig::default()));
        let dispatcher = EventDispatcher::new(
            Arc::clone(&registry),
            Arc::clone(&stats),
            Arc::clone(&errors),
            Arc::clone(&config),
        );
        Fixture {
            dispatcher,
            registry,
            stats,
            errors,
            config,
        }
    }

    fn counting(counter: &Arc<AtomicUsize>) -> EventCallback {
        let counter = Arc::clone(counter);
        Arc::new(move |_: &StreamEvent| -> anyhow::Result<()> {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    fn market_session() -> StreamSession {
        StreamSession::new("s", "wss://ws.tradier.com/v1/markets/events", SessionKind::Market)
    }

    #[test]
    fn test_duplicate_trade_delivered_once() {
        let f = fixture();
        let hits = Arc::new(AtomicUsize::new(0));
        f.registry
            .subscribe(&market_session(), EventKind::Trade, &["SPY"], counting(&hits))
            .unwrap();

        f.dispatcher.dispatch_frame(TRADE);
        f.dispatcher.dispatch_frame(TRADE);

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        let stats = f.stats.snapshot();
        assert_eq!(stats.messages_received, 2);
        assert_eq!(stats.messages_processed, 1);
        assert_eq!(stats.errors, 0);
    }

    #[test]
    fn test_duplicates_pass_when_filtering_disabled() {
        let f = fixture();
        *f.config.write() = StreamingConfig::default().with_filter_duplicates(false);
        let hits = Arc::new(AtomicUsize::new(0));
        f.registry
            .subscribe(&market_session(), EventKind::Trade, &["SPY"], counting(&hits))
            .unwrap();

        f.dispatcher.dispatch_payload(&format!("{}\n{}\n", TRADE, TRADE));
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert_eq!(f.stats.snapshot().messages_processed, 2);
    }

    #[test]
    fn test_malformed_and_unknown_frames_count_errors() {
        let f = fixture();
        let hits = Arc::new(AtomicUsize::new(0));
        f.registry
            .subscribe(&market_session(), EventKind::Trade, &["SPY"], counting(&hits))
            .unwrap();

        f.dispatcher.dispatch_frame("{not json");
        f.dispatcher.dispatch_frame(r#"{"symbol":"SPY"}"#);
        f.dispatcher.dispatch_frame(r#"{"type":"bogus"}"#);
        f.dispatcher.dispatch_frame(TRADE);

        let stats = f.stats.snapshot();
        assert_eq!(stats.errors, 3);
        assert_eq!(stats.messages_received, 4);
        assert_eq!(stats.messages_processed, 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_heartbeat_is_silent() {
        let f = fixture();
        f.dispatcher.dispatch_frame(r#"{"type":"heartbeat"}"#);
        let stats = f.stats.snapshot();
        assert_eq!(stats.messages_received, 1);
        assert_eq!(stats.messages_processed, 0);
        assert_eq!(stats.errors, 0);
    }

    #[test]
    fn test_failing_callbacks_are_isolated() {
        let f = fixture();
        let reports = Arc::new(Mutex::new(Vec::new()));
        let captured = Arc::clone(&reports);
        f.errors
            .set_handler(Arc::new(move |msg: &str| captured.lock().push(msg.to_string())));

        let hits = Arc::new(AtomicUsize::new(0));
        let session = market_session();
        f.registry
            .subscribe(
                &session,
                EventKind::Trade,
                &["SPY"],
                Arc::new(|_: &StreamEvent| -> anyhow::Result<()> {
                    anyhow::bail!("bad handler")
                }),
            )
            .unwrap();
        f.registry
            .subscribe(
                &session,
                EventKind::Trade,
                &["SPY"],
                Arc::new(|_: &StreamEvent| -> anyhow::Result<()> {
                    panic!("worse handler")
                }),
            )
            .unwrap();
        f.registry
            .subscribe(&session, EventKind::Trade, &["SPY"], counting(&hits))
            .unwrap();

        f.dispatcher.dispatch_frame(TRADE);

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        let stats = f.stats.snapshot();
        assert_eq!(stats.errors, 2);
        assert_eq!(stats.messages_processed, 1);
        assert_eq!(reports.lock().len(), 2);
        assert!(reports.lock()[0].contains("bad handler"));
    }

    #[test]
    fn test_filtered_and_unsubscribed_events_are_dropped() {
        let f = fixture();
        let hits = Arc::new(AtomicUsize::new(0));
        f.registry
            .subscribe(&market_session(), EventKind::Trade, &["SPY"], counting(&hits))
            .unwrap();

        f.registry.set_exchange_filter(&["N"]);
        f.dispatcher.dispatch_frame(TRADE);
        f.registry.clear_filters();
        f.dispatcher
            .dispatch_frame(r#"{"type":"trade","symbol":"MSFT","price":"1","date":"1"}"#);

        assert_eq!(hits.load(Ordering::SeqCst), 0);
        let stats = f.stats.snapshot();
        assert_eq!(stats.errors, 0);
        assert_eq!(stats.messages_processed, 0);
    }

    #[test]
    fn test_dedup_cache_window() {
        let key = |n: u32| DedupKey {
            kind: EventKind::Trade,
            bucket: "SPY".to_string(),
            timestamp: n.to_string(),
            value: "1".to_string(),
            size: "1".to_string(),
        };
        let mut cache = DedupCache::new(2);
        assert!(cache.insert(key(1)));
        assert!(!cache.insert(key(1)));
        assert!(cache.insert(key(2)));
        assert!(cache.insert(key(3)));
        // evicted by the window
        assert!(cache.insert(key(1)));

        cache.set_capacity(0);
        assert!(cache.insert(key(3)));
        assert!(cache.insert(key(3)));
    }

    #[test]
    fn test_order_stream_keeps_dedup_buckets_bounded() {
        let f = fixture();
        for id in 0..10_000u64 {
            f.dispatcher.dispatch_frame(&format!(
                r#"{{"type":"order","id":{},"event":"open","status":"open","account":"6YA00005","symbol":"SPY","quantity":"1","price":"1","transaction_date":"2024-01-01T00:00:00Z"}}"#,
                id
            ));
        }
        assert_eq!(f.dispatcher.dedup.lock().bucket_count(), 1);

        // a resent order inside the window is still suppressed
        f.dispatcher.dispatch_frame(
            r#"{"type":"order","id":9999,"event":"open","status":"open","account":"6YA00005","symbol":"SPY","quantity":"1","price":"1","transaction_date":"2024-01-01T00:00:00Z"}"#,
        );
        assert_eq!(f.stats.snapshot().messages_processed, 10_000);
    }

    #[test]
    fn test_dedup_cache_evicts_oldest_bucket() {
        let key = |bucket: usize| DedupKey {
            kind: EventKind::Trade,
            bucket: format!("SYM{}", bucket),
            timestamp: "1".to_string(),
            value: "1".to_string(),
            size: "1".to_string(),
        };
        let mut cache = DedupCache::new(8);
        for bucket in 0..MAX_DEDUP_BUCKETS + 10 {
            assert!(cache.insert(key(bucket)));
        }
        assert_eq!(cache.bucket_count(), MAX_DEDUP_BUCKETS);
        // the first buckets were dropped, the newest are remembered
        assert!(cache.insert(key(0)));
        assert!(!cache.insert(key(MAX_DEDUP_BUCKETS + 9)));
        assert_eq!(cache.bucket_count(), MAX_DEDUP_BUCKETS);
    }

    #[test]
    fn test_account_events_count_without_callbacks() {
        let f = fixture();
        f.dispatcher.dispatch_frame(
            r#"{"type":"order","id":1,"event":"fill","status":"filled","account":"6YA00005","symbol":"SPY","quantity":"1","price":"1","transaction_date":"2024-01-01T00:00:00Z"}"#,
        );
        f.dispatcher.dispatch_frame(TRADE);

        let stats = f.stats.snapshot();
        assert_eq!(stats.messages_received, 2);
        assert_eq!(stats.messages_processed, 1);
        assert_eq!(stats.errors, 0);
    }

    #[test]
    fn test_dedup_key_normalizes_decimals() {
        let a: StreamEvent = serde_json::from_str(
            r#"{"type":"trade","symbol":"SPY","price":"281.10","size":"100","date":"1"}"#,
        )
        .unwrap();
        let b: StreamEvent = serde_json::from_str(
            r#"{"type":"trade","symbol":"SPY","price":281.1,"size":100,"date":"1"}"#,
        )
        .unwrap();
        assert_eq!(DedupKey::for_event(&a), DedupKey::for_event(&b));
        assert!(DedupKey::for_event(&StreamEvent::Heartbeat).is_none());
    }
}
