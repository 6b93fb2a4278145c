use crate::core::errors::StreamError;
use crate::core::kernel::codec::{ControlAction, ControlFrame};
use crate::core::types::{EventKind, SessionKind, StreamEvent, StreamSession};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;

/// Callback invoked for every delivered event of the kind it was registered for
pub type EventCallback = Arc<dyn Fn(&StreamEvent) -> anyhow::Result<()> + Send + Sync>;

#[derive(Default)]
struct Subscription {
    symbols: BTreeSet<String>,
    callbacks: Vec<EventCallback>,
}

#[derive(Default)]
struct RegistryState {
    session: Option<StreamSession>,
    /// Ids the bound session replaced on reconnect or renewal. Callers still
    /// holding one of them are talking about the bound stream.
    superseded: HashSet<String>,
    /// Bumped on every change to what the server should be sent
    version: u64,
    subscriptions: BTreeMap<EventKind, Subscription>,
    /// Symbols added through `add_symbols`; seeds every market kind subscribed later
    watchlist: BTreeSet<String>,
    symbol_filter: Option<HashSet<String>>,
    exchange_filter: Option<HashSet<String>>,
}

impl RegistryState {
    fn union(&self) -> BTreeSet<String> {
        let mut all = self.watchlist.clone();
        for subscription in self.subscriptions.values() {
            all.extend(subscription.symbols.iter().cloned());
        }
        all
    }

    fn filter_list(&self) -> Vec<String> {
        self.subscriptions
            .keys()
            .map(|kind| kind.as_str().to_string())
            .collect()
    }

    fn frame(&self, symbols: Vec<String>, action: ControlAction) -> Option<ControlFrame> {
        let session = self.session.as_ref()?;
        Some(ControlFrame {
            session_id: session.id.clone(),
            symbols,
            filter: self.filter_list(),
            linebreak: true,
            action,
        })
    }

    fn full_frame(&self) -> Option<ControlFrame> {
        let session = self.session.as_ref()?;
        let symbols: Vec<String> = match session.kind {
            SessionKind::Market => self.union().into_iter().collect(),
            SessionKind::Account => Vec::new(),
        };
        if self.subscriptions.is_empty() && symbols.is_empty() {
            return None;
        }
        self.frame(symbols, ControlAction::Subscribe)
    }

    fn is_lineage_of_bound(&self, session: &StreamSession) -> bool {
        match &self.session {
            None => true,
            Some(bound) if bound.id == session.id => true,
            Some(bound) => bound.kind == session.kind && self.superseded.contains(&session.id),
        }
    }

    fn ensure_active(&self) -> Result<(), StreamError> {
        match &self.session {
            Some(session) if !session.is_active => Err(StreamError::ValidationError(format!(
                "session {} is not active",
                session.id
            ))),
            _ => Ok(()),
        }
    }
}

/// Normalize user-supplied symbols: trimmed, upper-cased, blanks dropped, de-duplicated.
pub fn normalize_symbols<S: AsRef<str>>(symbols: &[S]) -> BTreeSet<String> {
    symbols
        .iter()
        .map(|s| s.as_ref().trim().to_uppercase())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Per-session subscription table.
///
/// All state sits behind one mutex. Methods only mutate or copy under the
/// lock and hand control frames back to the caller, which does the sending.
#[derive(Default)]
pub struct SubscriptionRegistry {
    state: Mutex<RegistryState>,
}

impl std::fmt::Debug for SubscriptionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("SubscriptionRegistry")
            .field("session", &state.session.as_ref().map(|s| s.id.clone()))
            .field("kinds", &state.subscriptions.keys().collect::<Vec<_>>())
            .field("symbols", &state.union())
            .finish()
    }
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `callback` for `kind` on `session` and merge `symbols` into
    /// the kind's set. Returns the full subscription frame for the session.
    pub fn subscribe<S: AsRef<str>>(
        &self,
        session: &StreamSession,
        kind: EventKind,
        symbols: &[S],
        callback: EventCallback,
    ) -> Result<ControlFrame, StreamError> {
        if !session.is_active {
            return Err(StreamError::ValidationError(format!(
                "session {} is not active",
                session.id
            )));
        }
        if kind.session_kind() != session.kind {
            return Err(StreamError::ValidationError(format!(
                "{} events require a {} session, got {}",
                kind,
                kind.session_kind(),
                session.kind
            )));
        }

        let symbols = if kind.is_market() {
            let normalized = normalize_symbols(symbols);
            if normalized.is_empty() {
                return Err(StreamError::ValidationError(
                    "symbol list is empty".to_string(),
                ));
            }
            normalized
        } else {
            BTreeSet::new()
        };

        let mut state = self.state.lock();
        if let Some(bound) = &state.session {
            if bound.kind != session.kind && !state.subscriptions.is_empty() {
                return Err(StreamError::SubscriptionError(format!(
                    "registry already holds {} subscriptions",
                    bound.kind
                )));
            }
        }
        // a superseded id subscribes onto its replacement
        let keep_bound = matches!(
            &state.session,
            Some(bound) if bound.is_active
                && bound.id != session.id
                && state.is_lineage_of_bound(session)
        );
        if !keep_bound {
            state.session = Some(session.clone());
        }
        state.version += 1;

        let watchlist = if kind.is_market() {
            state.watchlist.clone()
        } else {
            BTreeSet::new()
        };
        let entry = state.subscriptions.entry(kind).or_default();
        entry.symbols.extend(symbols);
        entry.symbols.extend(watchlist);
        entry.callbacks.push(callback);

        state.full_frame().ok_or_else(|| {
            StreamError::SubscriptionError("no session bound to registry".to_string())
        })
    }

    /// Add symbols to every market kind. Returns the symbols that were not
    /// subscribed before; empty means the call changed nothing.
    pub fn add_symbols<S: AsRef<str>>(&self, symbols: &[S]) -> Result<Vec<String>, StreamError> {
        let symbols = normalize_symbols(symbols);
        if symbols.is_empty() {
            return Err(StreamError::ValidationError(
                "symbol list is empty".to_string(),
            ));
        }

        let mut state = self.state.lock();
        state.ensure_active()?;
        if matches!(&state.session, Some(s) if s.kind == SessionKind::Account) {
            return Err(StreamError::SubscriptionError(
                "account sessions have no symbol set".to_string(),
            ));
        }

        let before = state.union();
        state.watchlist.extend(symbols.iter().cloned());
        for (kind, subscription) in &mut state.subscriptions {
            if kind.is_market() {
                subscription.symbols.extend(symbols.iter().cloned());
            }
        }

        let delta: Vec<String> = symbols.into_iter().filter(|s| !before.contains(s)).collect();
        if !delta.is_empty() {
            state.version += 1;
        }
        Ok(delta)
    }

    /// Remove symbols from every kind. Returns the symbols that were actually
    /// subscribed; empty means the call changed nothing.
    pub fn remove_symbols<S: AsRef<str>>(&self, symbols: &[S]) -> Result<Vec<String>, StreamError> {
        let symbols = normalize_symbols(symbols);
        if symbols.is_empty() {
            return Err(StreamError::ValidationError(
                "symbol list is empty".to_string(),
            ));
        }

        let mut state = self.state.lock();
        state.ensure_active()?;

        let before = state.union();
        state.watchlist.retain(|s| !symbols.contains(s));
        for subscription in state.subscriptions.values_mut() {
            subscription.symbols.retain(|s| !symbols.contains(s));
        }

        let delta: Vec<String> = symbols.into_iter().filter(|s| before.contains(s)).collect();
        if !delta.is_empty() {
            state.version += 1;
        }
        Ok(delta)
    }

    /// Incremental frame for a symbol delta on the bound session
    pub fn delta_frame(&self, symbols: Vec<String>, action: ControlAction) -> Option<ControlFrame> {
        if symbols.is_empty() {
            return None;
        }
        self.state.lock().frame(symbols, action)
    }

    /// Full subscription frame to replay after a (re)connect
    pub fn replay_frame(&self) -> Option<ControlFrame> {
        self.state.lock().full_frame()
    }

    /// Replay frame together with the version it reflects
    pub fn replay_snapshot(&self) -> (Option<ControlFrame>, u64) {
        let state = self.state.lock();
        (state.full_frame(), state.version)
    }

    pub fn version(&self) -> u64 {
        self.state.lock().version
    }

    pub fn subscribed_symbols(&self) -> Vec<String> {
        self.state.lock().union().into_iter().collect()
    }

    pub fn subscribed_kinds(&self) -> Vec<EventKind> {
        self.state.lock().subscriptions.keys().copied().collect()
    }

    pub fn session(&self) -> Option<StreamSession> {
        self.state.lock().session.clone()
    }

    /// Whether `session` is the bound session or one it replaced
    pub fn is_bound_lineage(&self, session: &StreamSession) -> bool {
        self.state.lock().is_lineage_of_bound(session)
    }

    /// Swap in a freshly allocated session, keeping every subscription.
    /// The replaced id stays recognised as an alias of the new one.
    pub fn rebind_session(&self, session: StreamSession) {
        let mut state = self.state.lock();
        if let Some(previous) = state.session.take() {
            if previous.kind != session.kind {
                state.superseded.clear();
            } else if previous.id != session.id {
                state.superseded.insert(previous.id);
            }
        }
        state.superseded.remove(&session.id);
        state.session = Some(session);
    }

    pub fn deactivate_session(&self) {
        if let Some(session) = self.state.lock().session.as_mut() {
            session.is_active = false;
        }
    }

    /// Callbacks that should see an event of `kind` for `symbol`.
    /// Account kinds are not gated by symbol.
    pub fn callbacks_for(&self, kind: EventKind, symbol: Option<&str>) -> Vec<EventCallback> {
        let state = self.state.lock();
        let Some(subscription) = state.subscriptions.get(&kind) else {
            return Vec::new();
        };
        if kind.is_market() {
            match symbol {
                Some(symbol) if subscription.symbols.contains(symbol) => {}
                _ => return Vec::new(),
            }
        }
        subscription.callbacks.clone()
    }

    pub fn set_symbol_filter<S: AsRef<str>>(&self, symbols: &[S]) {
        let filter: HashSet<String> = normalize_symbols(symbols).into_iter().collect();
        self.state.lock().symbol_filter = Some(filter);
    }

    pub fn set_exchange_filter<S: AsRef<str>>(&self, exchanges: &[S]) {
        let filter: HashSet<String> = normalize_symbols(exchanges).into_iter().collect();
        self.state.lock().exchange_filter = Some(filter);
    }

    pub fn clear_filters(&self) {
        let mut state = self.state.lock();
        state.symbol_filter = None;
        state.exchange_filter = None;
    }

    /// Pre-dispatch allow-list check. Events that carry no symbol or no
    /// exchange code are not subject to the corresponding filter.
    pub fn passes_filters(&self, event: &StreamEvent) -> bool {
        let state = self.state.lock();
        if let (Some(filter), Some(symbol)) = (&state.symbol_filter, event.symbol()) {
            if !filter.contains(symbol) {
                return false;
            }
        }
        if let Some(filter) = &state.exchange_filter {
            let exchanges = event.exchanges();
            if !exchanges.is_empty()
                && !exchanges
                    .iter()
                    .any(|code| filter.contains(&code.to_uppercase()))
            {
                return false;
            }
        }
        true
    }
}
