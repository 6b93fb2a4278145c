use crate::core::config::StreamingConfig;
use crate::core::errors::StreamError;
use crate::core::kernel::codec::{ControlFrame, TradierCodec, WsCodec};
use crate::core::kernel::ws::StreamTransport;
use crate::core::types::{ConnectionState, StreamSession};
use crate::streaming::dispatcher::EventDispatcher;
use crate::streaming::error_sink::ErrorSink;
use crate::streaming::session::SessionSource;
use crate::streaming::stats::StatisticsCollector;
use crate::streaming::subscription::SubscriptionRegistry;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// How long `disconnect` waits for the background task before giving up on it
const JOIN_TIMEOUT: Duration = Duration::from_secs(5);
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

type Transport = Box<dyn StreamTransport>;

struct Worker {
    cancel: CancellationToken,
    outbound: mpsc::UnboundedSender<String>,
    handle: JoinHandle<Transport>,
}

enum Exit {
    Cancelled,
    Lost(String),
}

/// Shared handles the background task works with
#[derive(Clone)]
struct LoopContext {
    state: Arc<AtomicU8>,
    sessions: Arc<dyn SessionSource>,
    registry: Arc<SubscriptionRegistry>,
    dispatcher: Arc<EventDispatcher>,
    stats: Arc<StatisticsCollector>,
    errors: Arc<ErrorSink>,
    config: Arc<RwLock<StreamingConfig>>,
}

impl LoopContext {
    fn set_state(&self, state: ConnectionState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    async fn run(
        self,
        mut transport: Transport,
        mut session: StreamSession,
        cancel: CancellationToken,
        mut outbound: mpsc::UnboundedReceiver<String>,
    ) -> Transport {
        loop {
            match self.pump(&mut *transport, &cancel, &mut outbound).await {
                Exit::Cancelled => break,
                Exit::Lost(reason) => {
                    self.stats.record_error();
                    self.errors.report(&format!(
                        "stream connection lost for session {}: {}",
                        session.id, reason
                    ));
                    if !self.reconnect(&mut *transport, &mut session, &cancel).await {
                        break;
                    }
                }
            }
        }

        if tokio::time::timeout(CLOSE_TIMEOUT, transport.close())
            .await
            .is_err()
        {
            warn!(session_id = %session.id, "transport close timed out");
        }
        debug!(session_id = %session.id, "connection task stopped");
        transport
    }

    /// Connected phase: read, forward outbound frames and keep the link alive
    /// until the token fires or the transport fails.
    async fn pump(
        &self,
        transport: &mut dyn StreamTransport,
        cancel: &CancellationToken,
        outbound: &mut mpsc::UnboundedReceiver<String>,
    ) -> Exit {
        let period = self.config.read().heartbeat_interval();
        let mut heartbeat = tokio::time::interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                () = cancel.cancelled() => return Exit::Cancelled,

                _ = heartbeat.tick() => {
                    if let Err(e) = transport.ping().await {
                        return Exit::Lost(format!("heartbeat failed: {}", e));
                    }
                }

                Some(text) = outbound.recv() => {
                    if let Err(e) = transport.send(text).await {
                        return Exit::Lost(format!("send failed: {}", e));
                    }
                }

                message = transport.receive() => match message {
                    Some(Ok(payload)) => self.dispatcher.dispatch_payload(&payload),
                    Some(Err(StreamError::ParseError(reason))) => {
                        self.stats.record_received();
                        self.stats.record_error();
                        warn!(%reason, "dropping undecodable payload");
                    }
                    Some(Err(e)) => return Exit::Lost(e.to_string()),
                    None => return Exit::Lost("closed by peer".to_string()),
                },
            }
        }
    }

    /// Reconnect state machine. Returns `false` once the task should stop,
    /// either because it was cancelled or because retries are exhausted.
    async fn reconnect(
        &self,
        transport: &mut dyn StreamTransport,
        session: &mut StreamSession,
        cancel: &CancellationToken,
    ) -> bool {
        let mut attempts: u32 = 0;
        loop {
            let config = *self.config.read();
            if !config.auto_reconnect || attempts >= config.max_reconnect_attempts {
                self.set_state(ConnectionState::Disconnected);
                self.registry.deactivate_session();
                let reason = if config.auto_reconnect {
                    format!("giving up after {} reconnect attempts", attempts)
                } else {
                    "auto-reconnect disabled".to_string()
                };
                error!(session_id = %session.id, %reason, "stream disconnected");
                self.errors
                    .report(&format!("stream disconnected permanently: {}", reason));
                return false;
            }

            attempts += 1;
            self.set_state(ConnectionState::Reconnecting);
            info!(
                attempt = attempts,
                max = config.max_reconnect_attempts,
                delay_ms = config.reconnect_delay_ms,
                "reconnecting"
            );

            tokio::select! {
                () = cancel.cancelled() => return false,
                () = tokio::time::sleep(config.reconnect_delay()) => {}
            }

            let outcome = tokio::select! {
                () = cancel.cancelled() => return false,
                outcome = self.try_reconnect(transport, session) => outcome,
            };

            match outcome {
                Ok(replayed) => {
                    self.stats.mark_connected();
                    self.set_state(ConnectionState::Connected);
                    info!(session_id = %session.id, attempt = attempts, "reconnected");
                    // subscriptions made while reconnecting missed the replay
                    if self.registry.version() != replayed {
                        if let Err(e) = send_replay(transport, &self.registry).await {
                            self.stats.record_error();
                            self.errors.report(&format!(
                                "failed to resend subscriptions after reconnect: {}",
                                e
                            ));
                        }
                    }
                    return true;
                }
                Err(e) => {
                    self.stats.record_error();
                    self.errors.report(&format!(
                        "reconnect attempt {}/{} failed: {}",
                        attempts, config.max_reconnect_attempts, e
                    ));
                }
            }
        }
    }

    async fn try_reconnect(
        &self,
        transport: &mut dyn StreamTransport,
        session: &mut StreamSession,
    ) -> Result<u64, StreamError> {
        if transport.is_connected() {
            let _ = transport.close().await;
        }

        let fresh = self.sessions.create_session(session.kind).await?;
        self.stats.record_reconnect();
        self.registry.rebind_session(fresh.clone());
        *session = fresh;

        transport.connect(&session.url).await?;
        send_replay(transport, &self.registry).await
    }
}

/// Send the full subscription set. Returns the registry version it reflects.
async fn send_replay(
    transport: &mut dyn StreamTransport,
    registry: &SubscriptionRegistry,
) -> Result<u64, StreamError> {
    let (frame, version) = registry.replay_snapshot();
    if let Some(frame) = frame {
        let text = TradierCodec.encode_control(&frame)?;
        debug!(symbols = frame.symbols.len(), filter = ?frame.filter, "replaying subscriptions");
        transport.send(text).await?;
    }
    Ok(version)
}

/// Owns the duplex transport for one session at a time.
///
/// While connected, the transport lives inside a background tokio task that
/// reads, sends heartbeats and drives reconnection. It comes back to the
/// controller when that task stops.
pub struct ConnectionController {
    ctx: LoopContext,
    idle: Mutex<Option<Transport>>,
    worker: Mutex<Option<Worker>>,
    /// Bumped by `disconnect`; a connect started under an older value must
    /// not go live.
    epoch: AtomicU64,
}

impl std::fmt::Debug for ConnectionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionController")
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl ConnectionController {
    pub fn new(
        transport: Transport,
        sessions: Arc<dyn SessionSource>,
        registry: Arc<SubscriptionRegistry>,
        dispatcher: Arc<EventDispatcher>,
        stats: Arc<StatisticsCollector>,
        errors: Arc<ErrorSink>,
        config: Arc<RwLock<StreamingConfig>>,
    ) -> Self {
        Self {
            ctx: LoopContext {
                state: Arc::new(AtomicU8::new(ConnectionState::Disconnected as u8)),
                sessions,
                registry,
                dispatcher,
                stats,
                errors,
                config,
            },
            idle: Mutex::new(Some(transport)),
            worker: Mutex::new(None),
            epoch: AtomicU64::new(0),
        }
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.ctx.state.load(Ordering::SeqCst))
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn connection_status(&self) -> &'static str {
        self.state().as_str()
    }

    /// Open the transport for `session`, replay the registry's subscriptions
    /// and start the background task. A no-op when already connected.
    ///
    /// A `disconnect` that lands while this is in flight wins: the transport
    /// is closed again and the call fails.
    pub async fn connect(&self, session: &StreamSession) -> Result<(), StreamError> {
        let epoch = self.epoch.load(Ordering::SeqCst);
        self.open(session, epoch).await
    }

    #[instrument(skip(self, session), fields(session_id = %session.id, url = %session.url))]
    async fn open(&self, session: &StreamSession, epoch: u64) -> Result<(), StreamError> {
        if !session.is_active {
            return Err(StreamError::ValidationError(format!(
                "session {} is not active",
                session.id
            )));
        }
        if self.is_connected() {
            debug!("already connected");
            return Ok(());
        }

        // reclaim the transport from a task that stopped on its own
        self.stop_worker().await;

        let Some(mut transport) = self.idle.lock().take() else {
            return Err(StreamError::ConnectionError(
                "connection attempt already in progress".to_string(),
            ));
        };

        self.ctx.set_state(ConnectionState::Connecting);
        self.ctx.registry.rebind_session(session.clone());

        let opened = match transport.connect(&session.url).await {
            Ok(()) => send_replay(&mut *transport, &self.ctx.registry).await,
            Err(e) => Err(e),
        };
        let replayed = match opened {
            Ok(version) => version,
            Err(e) => {
                let _ = transport.close().await;
                *self.idle.lock() = Some(transport);
                self.ctx.set_state(ConnectionState::Disconnected);
                warn!(error = %e, "connect failed");
                return Err(match e {
                    StreamError::ConnectionError(_) => e,
                    other => StreamError::ConnectionError(other.to_string()),
                });
            }
        };

        // the worker lock orders this commit against disconnect's epoch bump
        let aborted = {
            let mut worker = self.worker.lock();
            if self.epoch.load(Ordering::SeqCst) == epoch {
                self.ctx.stats.mark_connected();
                let cancel = CancellationToken::new();
                let (outbound, outbound_rx) = mpsc::unbounded_channel();
                let handle = tokio::spawn(self.ctx.clone().run(
                    transport,
                    session.clone(),
                    cancel.clone(),
                    outbound_rx,
                ));
                let started = worker.insert(Worker {
                    cancel,
                    outbound,
                    handle,
                });
                self.ctx.set_state(ConnectionState::Connected);

                // subscriptions made while connecting missed the replay
                if self.ctx.registry.version() != replayed {
                    if let Some(frame) = self.ctx.registry.replay_frame() {
                        debug!(symbols = frame.symbols.len(), "resending subscriptions changed while connecting");
                        match TradierCodec.encode_control(&frame) {
                            Ok(text) => {
                                let _ = started.outbound.send(text);
                            }
                            Err(e) => self
                                .ctx
                                .errors
                                .report(&format!("failed to resend subscriptions: {}", e)),
                        }
                    }
                }
                None
            } else {
                Some(transport)
            }
        };

        if let Some(mut transport) = aborted {
            let _ = transport.close().await;
            *self.idle.lock() = Some(transport);
            self.ctx.set_state(ConnectionState::Disconnected);
            self.ctx.registry.deactivate_session();
            warn!("disconnected while connecting");
            return Err(StreamError::ConnectionError(
                "disconnected while connecting".to_string(),
            ));
        }

        info!("stream connected");
        Ok(())
    }

    /// Queue a control frame for the background task to send
    pub fn send_control(&self, frame: &ControlFrame) -> Result<(), StreamError> {
        if !self.is_connected() {
            return Err(StreamError::ConnectionError("not connected".to_string()));
        }
        let text = TradierCodec.encode_control(frame)?;
        let worker = self.worker.lock();
        let Some(worker) = worker.as_ref() else {
            return Err(StreamError::ConnectionError("not connected".to_string()));
        };
        worker
            .outbound
            .send(text)
            .map_err(|_| StreamError::ConnectionError("connection task has stopped".to_string()))
    }

    /// Drop the current connection, allocate a fresh session of the same kind
    /// and connect again.
    pub async fn reconnect(&self) -> Result<StreamSession, StreamError> {
        let epoch = self.epoch.load(Ordering::SeqCst);
        let Some(current) = self.ctx.registry.session() else {
            return Err(StreamError::ConnectionError(
                "no session to reconnect".to_string(),
            ));
        };
        let was_connected = self.is_connected();

        self.stop_worker().await;
        self.ctx.set_state(ConnectionState::Reconnecting);

        let fresh = match self.ctx.sessions.create_session(current.kind).await {
            Ok(fresh) => fresh,
            Err(e) => {
                self.ctx.set_state(ConnectionState::Disconnected);
                self.ctx.registry.deactivate_session();
                return Err(e);
            }
        };
        if was_connected {
            self.ctx.stats.record_reconnect();
        }
        self.ctx.set_state(ConnectionState::Disconnected);
        self.open(&fresh, epoch).await?;
        Ok(fresh)
    }

    /// Stop the background task and close the transport. Safe to call in any
    /// state and any number of times.
    pub async fn disconnect(&self) {
        {
            let _commit = self.worker.lock();
            self.epoch.fetch_add(1, Ordering::SeqCst);
        }
        self.stop_worker().await;
        self.ctx.set_state(ConnectionState::Disconnected);
        self.ctx.registry.deactivate_session();
    }

    async fn stop_worker(&self) {
        let Some(worker) = self.worker.lock().take() else {
            return;
        };
        worker.cancel.cancel();
        drop(worker.outbound);

        let mut handle = worker.handle;
        match tokio::time::timeout(JOIN_TIMEOUT, &mut handle).await {
            Ok(Ok(transport)) => {
                *self.idle.lock() = Some(transport);
            }
            Ok(Err(e)) => {
                error!(error = %e, "connection task failed");
                self.ctx
                    .errors
                    .report(&format!("connection task failed: {}", e));
            }
            Err(_) => {
                handle.abort();
                error!("connection task did not stop in time; aborted");
                self.ctx
                    .errors
                    .report("connection task did not stop in time; transport dropped");
            }
        }
    }
}

impl Drop for ConnectionController {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.get_mut().take() {
            worker.cancel.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::SessionKind;
    use async_trait::async_trait;

    /// Transport whose connect always fails
    struct Unreachable;

    #[async_trait]
    impl StreamTransport for Unreachable {
        async fn connect(&mut self, url: &str) -> Result<(), StreamError> {
            Err(StreamError::ConnectionError(format!("refused: {}", url)))
        }

        async fn send(&mut self, _text: String) -> Result<(), StreamError> {
            Err(StreamError::ConnectionError("not connected".to_string()))
        }

        async fn receive(&mut self) -> Option<Result<String, StreamError>> {
            None
        }

        async fn close(&mut self) -> Result<(), StreamError> {
            Ok(())
        }

        fn is_connected(&self) -> bool {
            false
        }
    }

    struct NoSessions;

    #[async_trait]
    impl SessionSource for NoSessions {
        async fn create_session(&self, _kind: SessionKind) -> Result<StreamSession, StreamError> {
            Err(StreamError::ConnectionError("offline".to_string()))
        }
    }

    fn controller() -> ConnectionController {
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
        ConnectionController::new(
            Box::new(Unreachable),
            Arc::new(NoSessions),
            registry,
            dispatcher,
            stats,
            errors,
            config,
        )
    }

    #[tokio::test]
    async fn test_initial_connect_failure_stays_disconnected() {
        let controller = controller();
        let session = StreamSession::new("s", "wss://nowhere", SessionKind::Market);

        let result = controller.connect(&session).await;
        assert!(matches!(result, Err(StreamError::ConnectionError(_))));
        assert_eq!(controller.state(), ConnectionState::Disconnected);
        assert_eq!(controller.connection_status(), "Disconnected");

        // transport is handed back, so a second attempt reaches connect again
        assert!(matches!(
            controller.connect(&session).await,
            Err(StreamError::ConnectionError(msg)) if msg.contains("refused")
        ));
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let controller = controller();
        controller.disconnect().await;
        controller.disconnect().await;
        assert!(!controller.is_connected());
    }

    #[tokio::test]
    async fn test_inactive_session_rejected() {
        let controller = controller();
        let session = StreamSession::new("", "wss://nowhere", SessionKind::Market);
        assert!(matches!(
            controller.connect(&session).await,
            Err(StreamError::ValidationError(_))
        ));
    }

    #[tokio::test]
    async fn test_send_control_requires_connection() {
        let controller = controller();
        let frame = ControlFrame {
            session_id: "s".to_string(),
            symbols: vec!["SPY".to_string()],
            filter: vec!["trade".to_string()],
            linebreak: true,
            action: crate::core::kernel::codec::ControlAction::Subscribe,
        };
        assert!(controller.send_control(&frame).is_err());
        assert!(controller.reconnect().await.is_err());
    }
}
