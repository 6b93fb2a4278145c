//! Session lifecycle, subscriptions, the connection task and event fan-out.
pub mod connection;
pub mod dispatcher;
pub mod error_sink;
pub mod service;
pub mod session;
pub mod stats;
pub mod subscription;

pub use connection::ConnectionController;
pub use dispatcher::{DedupCache, DedupKey, EventDispatcher, MAX_DEDUP_BUCKETS};
pub use error_sink::{ErrorHandler, ErrorSink};
pub use service::StreamingService;
pub use session::{parse_handshake, SessionManager, SessionSource};
pub use stats::{StatisticsCollector, StreamStatistics};
pub use subscription::{normalize_symbols, EventCallback, SubscriptionRegistry};
