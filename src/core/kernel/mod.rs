/// Kernel - transport layer for the event streams
///
/// Exchange-agnostic plumbing the streaming engine is built on:
///
/// ## Transport Layer
/// - `RestClient`: authenticated request issuer used for session handshakes
/// - `StreamTransport`: message-oriented duplex connection
///
/// ## Authentication
/// - `TokenProvider`: source of bearer tokens, implemented by the application
/// - `BearerSigner`: attaches the token to outgoing requests
///
/// ## Message Handling
/// - `WsCodec`: wire encoding of control frames and decoding of events
///
/// # Example
/// ```rust,no_run
/// use tradier_stream::core::kernel::*;
/// use std::sync::Arc;
///
/// # fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let signer = Arc::new(BearerSigner::new(Arc::new(StaticTokenProvider::new("token"))));
/// let rest = RestClientBuilder::new(RestClientConfig::new(
///     "https://sandbox.tradier.com/v1".to_string(),
/// ))
/// .with_signer(signer)
/// .build()?;
/// # let _ = rest;
/// # Ok(())
/// # }
/// ```
pub mod codec;
pub mod rest;
pub mod signer;
pub mod ws;

pub use codec::{split_frames, ControlAction, ControlFrame, TradierCodec, WsCodec};
pub use rest::{ReqwestRest, RestClient, RestClientBuilder, RestClientConfig};
pub use signer::{BearerSigner, SignatureResult, Signer, StaticTokenProvider, TokenProvider};
pub use ws::{StreamTransport, TungsteniteTransport, WsConfig};
