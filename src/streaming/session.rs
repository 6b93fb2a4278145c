use crate::core::errors::StreamError;
use crate::core::kernel::rest::RestClient;
use crate::core::types::{SessionKind, StreamSession};
use async_trait::async_trait;
use serde_json::Value;
use tracing::{info, instrument, warn};

/// Anything that can allocate a fresh streaming session.
///
/// The connection controller holds one of these to re-handshake while
/// reconnecting; `SessionManager` is the production implementation.
#[async_trait]
pub trait SessionSource: Send + Sync {
    async fn create_session(&self, kind: SessionKind) -> Result<StreamSession, StreamError>;
}

/// Performs the session handshakes against the REST API
#[derive(Debug)]
pub struct SessionManager<R: RestClient> {
    rest: R,
}

impl<R: RestClient> SessionManager<R> {
    pub const fn new(rest: R) -> Self {
        Self { rest }
    }

    pub async fn create_market_session(&self) -> Result<StreamSession, StreamError> {
        self.handshake(SessionKind::Market).await
    }

    pub async fn create_account_session(&self) -> Result<StreamSession, StreamError> {
        self.handshake(SessionKind::Account).await
    }

    /// Replace `session`'s id and url with a freshly allocated pair of the same kind
    pub async fn renew_session(&self, session: &mut StreamSession) -> Result<(), StreamError> {
        let fresh = self.handshake(session.kind).await?;
        info!(old = %session.id, new = %fresh.id, "renewed stream session");
        *session = fresh;
        Ok(())
    }

    #[instrument(skip(self), fields(endpoint = kind.handshake_endpoint()))]
    async fn handshake(&self, kind: SessionKind) -> Result<StreamSession, StreamError> {
        let response = self
            .rest
            .post(kind.handshake_endpoint(), &[], true)
            .await
            .map_err(|e| {
                warn!(error = %e, "session handshake failed");
                match e {
                    StreamError::ConnectionError(_) => e,
                    other => StreamError::ConnectionError(format!(
                        "{} session handshake failed: {}",
                        kind, other
                    )),
                }
            })?;

        let session = parse_handshake(&response, kind)?;
        info!(session_id = %session.id, url = %session.url, "allocated stream session");
        Ok(session)
    }
}

#[async_trait]
impl<R: RestClient> SessionSource for SessionManager<R> {
    async fn create_session(&self, kind: SessionKind) -> Result<StreamSession, StreamError> {
        self.handshake(kind).await
    }
}

/// Read `{url, sessionid}` from a handshake body, either nested under
/// `stream` or at the top level.
pub fn parse_handshake(body: &Value, kind: SessionKind) -> Result<StreamSession, StreamError> {
    let info = body.get("stream").unwrap_or(body);
    let field = |name: &str| {
        info.get(name)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| {
                StreamError::ConnectionError(format!(
                    "{} session handshake response missing {}",
                    kind, name
                ))
            })
    };

    let url = field("url")?;
    let session_id = field("sessionid")?;
    Ok(StreamSession::new(session_id, url, kind))
}
