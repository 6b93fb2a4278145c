use crate::core::errors::StreamError;
use crate::core::types::StreamEvent;
use serde::Serialize;

/// Whether a control frame adds or removes symbols
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlAction {
    Subscribe,
    Unsubscribe,
}

/// Outbound subscription control frame
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ControlFrame {
    #[serde(rename = "sessionid")]
    pub session_id: String,
    pub symbols: Vec<String>,
    pub filter: Vec<String>,
    pub linebreak: bool,
    #[serde(skip_serializing_if = "ControlAction::is_subscribe")]
    pub action: ControlAction,
}

impl ControlAction {
    fn is_subscribe(&self) -> bool {
        matches!(self, Self::Subscribe)
    }
}

/// Codec trait for the stream wire format
///
/// Converts between raw text frames and typed messages. Control frames
/// (ping, pong, close) never reach the codec; the transport handles them.
pub trait WsCodec: Send + Sync + 'static {
    /// The type representing parsed inbound frames
    type Message: Send + Sync;

    /// Encode a subscribe or unsubscribe request
    fn encode_control(&self, frame: &ControlFrame) -> Result<String, StreamError>;

    /// Decode one inbound frame
    ///
    /// # Returns
    /// - `Ok(message)` - Successfully decoded frame (possibly an unknown kind)
    /// - `Err(error)` - The frame was not valid JSON or had no `type` tag
    fn decode_message(&self, frame: &str) -> Result<Self::Message, StreamError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TradierCodec;

impl WsCodec for TradierCodec {
    type Message = StreamEvent;

    fn encode_control(&self, frame: &ControlFrame) -> Result<String, StreamError> {
        Ok(serde_json::to_string(frame)?)
    }

    fn decode_message(&self, frame: &str) -> Result<StreamEvent, StreamError> {
        serde_json::from_str(frame)
            .map_err(|e| StreamError::ParseError(format!("Failed to decode frame: {}", e)))
    }
}

/// Split a transport payload into individual frames. With `linebreak` set the
/// server may pack several newline-terminated objects into one message.
pub fn split_frames(payload: &str) -> impl Iterator<Item = &str> {
    payload
        .split('\n')
        .map(str::trim)
        .filter(|line| !line.is_empty())
}
