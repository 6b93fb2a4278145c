use crate::core::config::{ClientConfig, StreamingConfig};
use crate::core::errors::StreamError;
use crate::core::kernel::codec::ControlAction;
use crate::core::kernel::rest::{RestClientBuilder, RestClientConfig};
use crate::core::kernel::signer::BearerSigner;
use crate::core::kernel::ws::{StreamTransport, TungsteniteTransport};
use crate::core::types::{
    AccountOrderEvent, AccountPositionEvent, EventKind, QuoteEvent, SessionKind, StreamEvent,
    StreamSession, SummaryEvent, TimesaleEvent, TradeEvent,
};
use crate::streaming::connection::ConnectionController;
use crate::streaming::dispatcher::EventDispatcher;
use crate::streaming::error_sink::ErrorSink;
use crate::streaming::session::{SessionManager, SessionSource};
use crate::streaming::stats::{StatisticsCollector, StreamStatistics};
use crate::streaming::subscription::{EventCallback, SubscriptionRegistry};
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Wrap a typed callback so it only sees events of its own variant
macro_rules! typed_callback {
    ($variant:ident, $callback:expr) => {{
        let callback = $callback;
        let wrapped: EventCallback = Arc::new(move |event: &StreamEvent| match event {
            StreamEvent::$variant(inner) => callback(inner),
            _ => Ok(()),
        });
        wrapped
    }};
}

/// Application-facing streaming client.
///
/// Binds the session source, subscription registry, connection controller,
/// statistics and error sink of one stream together. Subscription calls
/// return `bool` and never raise; connection calls return `Result`.
pub struct StreamingService {
    sessions: Arc<dyn SessionSource>,
    registry: Arc<SubscriptionRegistry>,
    stats: Arc<StatisticsCollector>,
    errors: Arc<ErrorSink>,
    config: Arc<RwLock<StreamingConfig>>,
    dispatcher: Arc<EventDispatcher>,
    controller: ConnectionController,
}

impl std::fmt::Debug for StreamingService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamingService")
            .field("registry", &self.registry)
            .field("controller", &self.controller)
            .field("config", &*self.config.read())
            .finish_non_exhaustive()
    }
}

impl StreamingService {
    pub fn new(sessions: Arc<dyn SessionSource>, transport: Box<dyn StreamTransport>) -> Self {
        let registry = Arc::new(SubscriptionRegistry::new());
        let stats = Arc::new(StatisticsCollector::new());
        let errors = Arc::new(ErrorSink::new());
        let config = Arc::new(RwLock::new(StreamingConfig::default()));
        let dispatcher = Arc::new(EventDispatcher::new(
            Arc::clone(&registry),
            Arc::clone(&stats),
            Arc::clone(&errors),
            Arc::clone(&config),
        ));
        let controller = ConnectionController::new(
            transport,
            Arc::clone(&sessions),
            Arc::clone(&registry),
            Arc::clone(&dispatcher),
            Arc::clone(&stats),
            Arc::clone(&errors),
            Arc::clone(&config),
        );

        Self {
            sessions,
            registry,
            stats,
            errors,
            config,
            dispatcher,
            controller,
        }
    }

    /// Production wiring: reqwest handshakes signed with the configured
    /// token and a tungstenite WebSocket transport.
    pub fn from_config(config: &ClientConfig) -> Result<Self, StreamError> {
        let signer = Arc::new(BearerSigner::new(Arc::new(config.clone())));
        let rest = RestClientBuilder::new(
            RestClientConfig::new(config.api_base_url().to_string())
                .with_timeout(config.timeout_seconds),
        )
        .with_signer(signer)
        .build()?;

        Ok(Self::new(
            Arc::new(SessionManager::new(rest)),
            Box::new(TungsteniteTransport::new()),
        ))
    }

    // Sessions

    pub async fn create_market_session(&self) -> Result<StreamSession, StreamError> {
        self.sessions.create_session(SessionKind::Market).await
    }

    pub async fn create_account_session(&self) -> Result<StreamSession, StreamError> {
        self.sessions.create_session(SessionKind::Account).await
    }

    /// Session the stream is currently bound to. After an automatic
    /// reconnect this carries the replacement id, while the session the
    /// application created keeps working as an alias for it.
    pub fn current_session(&self) -> Option<StreamSession> {
        self.registry.session()
    }

    /// Re-handshake `session` in place. If it is the session the stream is
    /// bound to, or one that session replaced, subscriptions move over to
    /// the new id.
    pub async fn renew_session(&self, session: &mut StreamSession) -> Result<(), StreamError> {
        let fresh = self.sessions.create_session(session.kind).await?;
        let bound = self.registry.session().is_some() && self.registry.is_bound_lineage(session);
        *session = fresh;

        if bound {
            self.registry.rebind_session(session.clone());
            if self.controller.is_connected() {
                if let Some(frame) = self.registry.replay_frame() {
                    self.send_or_report(&frame);
                }
            }
        }
        info!(session_id = %session.id, "session renewed");
        Ok(())
    }

    // Subscriptions

    pub fn subscribe_to_trades<S, F>(&self, session: &StreamSession, symbols: &[S], callback: F) -> bool
    where
        S: AsRef<str>,
        F: Fn(&TradeEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let callback = typed_callback!(Trade, callback);
        self.register(session, EventKind::Trade, symbols, callback)
    }

    pub fn subscribe_to_quotes<S, F>(&self, session: &StreamSession, symbols: &[S], callback: F) -> bool
    where
        S: AsRef<str>,
        F: Fn(&QuoteEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let callback = typed_callback!(Quote, callback);
        self.register(session, EventKind::Quote, symbols, callback)
    }

    pub fn subscribe_to_summary<S, F>(&self, session: &StreamSession, symbols: &[S], callback: F) -> bool
    where
        S: AsRef<str>,
        F: Fn(&SummaryEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let callback = typed_callback!(Summary, callback);
        self.register(session, EventKind::Summary, symbols, callback)
    }

    pub fn subscribe_to_timesales<S, F>(
        &self,
        session: &StreamSession,
        symbols: &[S],
        callback: F,
    ) -> bool
    where
        S: AsRef<str>,
        F: Fn(&TimesaleEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let callback = typed_callback!(Timesale, callback);
        self.register(session, EventKind::Timesale, symbols, callback)
    }

    pub fn subscribe_to_order_events<F>(&self, session: &StreamSession, callback: F) -> bool
    where
        F: Fn(&AccountOrderEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let callback = typed_callback!(AccountOrder, callback);
        self.register::<&str>(session, EventKind::Order, &[], callback)
    }

    pub fn subscribe_to_position_events<F>(&self, session: &StreamSession, callback: F) -> bool
    where
        F: Fn(&AccountPositionEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let callback = typed_callback!(AccountPosition, callback);
        self.register::<&str>(session, EventKind::Position, &[], callback)
    }

    fn register<S: AsRef<str>>(
        &self,
        session: &StreamSession,
        kind: EventKind,
        symbols: &[S],
        callback: EventCallback,
    ) -> bool {
        let connected = self.controller.is_connected();
        if connected && !self.registry.is_bound_lineage(session) {
            warn!(
                bound = ?self.registry.session().map(|bound| bound.id),
                requested = %session.id,
                "stream is connected to another session"
            );
            return false;
        }

        match self.registry.subscribe(session, kind, symbols, callback) {
            Ok(frame) => {
                debug!(kind = %kind, symbols = frame.symbols.len(), "subscribed");
                if connected {
                    self.send_or_report(&frame);
                }
                true
            }
            Err(e) => {
                debug!(kind = %kind, error = %e, "subscription rejected");
                false
            }
        }
    }

    pub fn add_symbols<S: AsRef<str>>(&self, symbols: &[S]) -> bool {
        self.change_symbols(symbols, ControlAction::Subscribe)
    }

    pub fn remove_symbols<S: AsRef<str>>(&self, symbols: &[S]) -> bool {
        self.change_symbols(symbols, ControlAction::Unsubscribe)
    }

    fn change_symbols<S: AsRef<str>>(&self, symbols: &[S], action: ControlAction) -> bool {
        let changed = match action {
            ControlAction::Subscribe => self.registry.add_symbols(symbols),
            ControlAction::Unsubscribe => self.registry.remove_symbols(symbols),
        };
        let delta = match changed {
            Ok(delta) if delta.is_empty() => return false,
            Ok(delta) => delta,
            Err(e) => {
                debug!(error = %e, "symbol change rejected");
                return false;
            }
        };

        if self.controller.is_connected() {
            if let Some(frame) = self.registry.delta_frame(delta, action) {
                self.send_or_report(&frame);
            }
        }
        true
    }

    pub fn get_subscribed_symbols(&self) -> Vec<String> {
        self.registry.subscribed_symbols()
    }

    pub fn set_symbol_filter<S: AsRef<str>>(&self, symbols: &[S]) {
        self.registry.set_symbol_filter(symbols);
    }

    pub fn set_exchange_filter<S: AsRef<str>>(&self, exchanges: &[S]) {
        self.registry.set_exchange_filter(exchanges);
    }

    pub fn clear_filters(&self) {
        self.registry.clear_filters();
    }

    fn send_or_report(&self, frame: &crate::core::kernel::codec::ControlFrame) {
        if let Err(e) = self.controller.send_control(frame) {
            self.stats.record_error();
            self.errors
                .report(&format!("failed to send control frame: {}", e));
        }
    }

    // Configuration

    pub fn set_config(&self, config: StreamingConfig) {
        *self.config.write() = config;
    }

    pub fn get_config(&self) -> StreamingConfig {
        *self.config.read()
    }

    pub fn set_error_handler<F>(&self, handler: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.errors.set_handler(Arc::new(handler));
    }

    // Connection

    pub async fn connect(&self, session: &StreamSession) -> Result<(), StreamError> {
        self.controller.connect(session).await
    }

    /// Drop the connection and come back on a freshly allocated session
    pub async fn reconnect(&self) -> Result<StreamSession, StreamError> {
        self.controller.reconnect().await
    }

    pub fn is_connected(&self) -> bool {
        self.controller.is_connected()
    }

    pub fn get_connection_status(&self) -> &'static str {
        self.controller.connection_status()
    }

    pub async fn disconnect(&self) {
        self.controller.disconnect().await;
    }

    // Statistics

    pub fn get_statistics(&self) -> StreamStatistics {
        self.stats.snapshot()
    }

    pub fn reset_statistics(&self) {
        self.stats.reset();
        self.dispatcher.clear_dedup();
    }
}
