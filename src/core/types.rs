use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Which event feed a session authorizes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionKind {
    Market,
    Account,
}

impl SessionKind {
    /// REST path of the handshake that allocates a session of this kind
    pub const fn handshake_endpoint(self) -> &'static str {
        match self {
            Self::Market => "/markets/events/session",
            Self::Account => "/accounts/events/session",
        }
    }
}

impl fmt::Display for SessionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Market => write!(f, "market"),
            Self::Account => write!(f, "account"),
        }
    }
}

/// Server-allocated handle authorizing one duplex event stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamSession {
    pub id: String,
    pub url: String,
    pub kind: SessionKind,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl StreamSession {
    /// Lifetime assumed for a freshly allocated session
    pub const LIFETIME_HOURS: i64 = 8;

    pub fn new(id: impl Into<String>, url: impl Into<String>, kind: SessionKind) -> Self {
        let id = id.into();
        let url = url.into();
        let created_at = Utc::now();
        Self {
            is_active: !id.is_empty() && !url.is_empty(),
            id,
            url,
            kind,
            created_at,
            expires_at: created_at + ChronoDuration::hours(Self::LIFETIME_HOURS),
        }
    }

    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }
}

/// Event kinds a callback can be registered for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Trade,
    Quote,
    Summary,
    Timesale,
    Order,
    Position,
}

impl EventKind {
    pub const MARKET: [Self; 4] = [Self::Trade, Self::Quote, Self::Summary, Self::Timesale];

    /// Name used in the `filter` list of control frames and in the inbound `type` field
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Trade => "trade",
            Self::Quote => "quote",
            Self::Summary => "summary",
            Self::Timesale => "timesale",
            Self::Order => "order",
            Self::Position => "position",
        }
    }

    pub const fn session_kind(self) -> SessionKind {
        match self {
            Self::Order | Self::Position => SessionKind::Account,
            _ => SessionKind::Market,
        }
    }

    pub const fn is_market(self) -> bool {
        matches!(self.session_kind(), SessionKind::Market)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ConnectionState {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
    Reconnecting = 3,
}

impl ConnectionState {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "Disconnected",
            Self::Connecting => "Connecting",
            Self::Connected => "Connected",
            Self::Reconnecting => "Reconnecting",
        }
    }

    pub const fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Connecting,
            2 => Self::Connected,
            3 => Self::Reconnecting,
            _ => Self::Disconnected,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TradeEvent {
    pub symbol: String,
    #[serde(default, rename = "exch", deserialize_with = "conversion::lenient_string")]
    pub exchange: String,
    #[serde(default, deserialize_with = "conversion::lenient_decimal")]
    pub price: Decimal,
    #[serde(default, deserialize_with = "conversion::lenient_u64")]
    pub size: u64,
    #[serde(default, deserialize_with = "conversion::lenient_u64")]
    pub cvol: u64,
    #[serde(default, deserialize_with = "conversion::lenient_string")]
    pub date: String,
    #[serde(default, deserialize_with = "conversion::lenient_decimal")]
    pub last: Decimal,
}

impl TradeEvent {
    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        conversion::epoch_millis_to_datetime(&self.date)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QuoteEvent {
    pub symbol: String,
    #[serde(default, deserialize_with = "conversion::lenient_decimal")]
    pub bid: Decimal,
    #[serde(default, rename = "bidsz", deserialize_with = "conversion::lenient_u64")]
    pub bid_size: u64,
    #[serde(default, rename = "bidexch", deserialize_with = "conversion::lenient_string")]
    pub bid_exchange: String,
    #[serde(default, rename = "biddate", deserialize_with = "conversion::lenient_string")]
    pub bid_date: String,
    #[serde(default, deserialize_with = "conversion::lenient_decimal")]
    pub ask: Decimal,
    #[serde(default, rename = "asksz", deserialize_with = "conversion::lenient_u64")]
    pub ask_size: u64,
    #[serde(default, rename = "askexch", deserialize_with = "conversion::lenient_string")]
    pub ask_exchange: String,
    #[serde(default, rename = "askdate", deserialize_with = "conversion::lenient_string")]
    pub ask_date: String,
}

impl QuoteEvent {
    pub fn spread(&self) -> Decimal {
        self.ask - self.bid
    }

    /// The later of the bid and ask timestamps
    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        let bid = conversion::epoch_millis_to_datetime(&self.bid_date);
        let ask = conversion::epoch_millis_to_datetime(&self.ask_date);
        bid.max(ask)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SummaryEvent {
    pub symbol: String,
    #[serde(default, deserialize_with = "conversion::lenient_decimal")]
    pub open: Decimal,
    #[serde(default, deserialize_with = "conversion::lenient_decimal")]
    pub high: Decimal,
    #[serde(default, deserialize_with = "conversion::lenient_decimal")]
    pub low: Decimal,
    #[serde(default, rename = "prevClose", deserialize_with = "conversion::lenient_decimal")]
    pub prev_close: Decimal,
    #[serde(default, deserialize_with = "conversion::lenient_decimal")]
    pub close: Decimal,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TimesaleEvent {
    pub symbol: String,
    #[serde(default, rename = "exch", deserialize_with = "conversion::lenient_string")]
    pub exchange: String,
    #[serde(default, deserialize_with = "conversion::lenient_decimal")]
    pub bid: Decimal,
    #[serde(default, deserialize_with = "conversion::lenient_decimal")]
    pub ask: Decimal,
    #[serde(default, deserialize_with = "conversion::lenient_decimal")]
    pub last: Decimal,
    #[serde(default, deserialize_with = "conversion::lenient_u64")]
    pub size: u64,
    #[serde(default, deserialize_with = "conversion::lenient_string")]
    pub date: String,
    #[serde(default, deserialize_with = "conversion::lenient_u64")]
    pub seq: u64,
    #[serde(default, deserialize_with = "conversion::lenient_string")]
    pub flag: String,
    #[serde(default, deserialize_with = "conversion::lenient_bool")]
    pub cancel: bool,
    #[serde(default, deserialize_with = "conversion::lenient_bool")]
    pub correction: bool,
    #[serde(default, deserialize_with = "conversion::lenient_string")]
    pub session: String,
}

impl TimesaleEvent {
    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        conversion::epoch_millis_to_datetime(&self.date)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AccountOrderEvent {
    #[serde(default, rename = "id", deserialize_with = "conversion::lenient_u64")]
    pub order_id: u64,
    #[serde(default, deserialize_with = "conversion::lenient_string")]
    pub event: String,
    #[serde(default, deserialize_with = "conversion::lenient_string")]
    pub status: String,
    #[serde(default, deserialize_with = "conversion::lenient_string")]
    pub account: String,
    #[serde(default, deserialize_with = "conversion::lenient_string")]
    pub symbol: String,
    #[serde(default, deserialize_with = "conversion::lenient_decimal")]
    pub quantity: Decimal,
    #[serde(default, deserialize_with = "conversion::lenient_decimal")]
    pub price: Decimal,
    #[serde(default, deserialize_with = "conversion::lenient_string")]
    pub side: String,
    #[serde(default, deserialize_with = "conversion::lenient_string")]
    pub order_type: String,
    #[serde(
        default,
        alias = "transaction_date",
        deserialize_with = "conversion::lenient_string"
    )]
    pub date: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AccountPositionEvent {
    #[serde(default, deserialize_with = "conversion::lenient_string")]
    pub account: String,
    #[serde(default, deserialize_with = "conversion::lenient_string")]
    pub symbol: String,
    #[serde(default, deserialize_with = "conversion::lenient_decimal")]
    pub quantity: Decimal,
    #[serde(default, deserialize_with = "conversion::lenient_decimal")]
    pub cost_basis: Decimal,
    #[serde(default, deserialize_with = "conversion::lenient_string")]
    pub date: String,
}

/// One decoded inbound frame, discriminated by the wire `type` field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StreamEvent {
    Trade(TradeEvent),
    Quote(QuoteEvent),
    Summary(SummaryEvent),
    Timesale(TimesaleEvent),
    #[serde(rename = "order")]
    AccountOrder(AccountOrderEvent),
    #[serde(rename = "position")]
    AccountPosition(AccountPositionEvent),
    Heartbeat,
    #[serde(other)]
    Unknown,
}

impl StreamEvent {
    pub const fn kind(&self) -> Option<EventKind> {
        match self {
            Self::Trade(_) => Some(EventKind::Trade),
            Self::Quote(_) => Some(EventKind::Quote),
            Self::Summary(_) => Some(EventKind::Summary),
            Self::Timesale(_) => Some(EventKind::Timesale),
            Self::AccountOrder(_) => Some(EventKind::Order),
            Self::AccountPosition(_) => Some(EventKind::Position),
            Self::Heartbeat | Self::Unknown => None,
        }
    }

    pub fn symbol(&self) -> Option<&str> {
        let symbol = match self {
            Self::Trade(e) => &e.symbol,
            Self::Quote(e) => &e.symbol,
            Self::Summary(e) => &e.symbol,
            Self::Timesale(e) => &e.symbol,
            Self::AccountOrder(e) => &e.symbol,
            Self::AccountPosition(e) => &e.symbol,
            Self::Heartbeat | Self::Unknown => return None,
        };
        (!symbol.is_empty()).then_some(symbol.as_str())
    }

    /// Exchange codes carried by the event; empty for kinds without one
    pub fn exchanges(&self) -> Vec<&str> {
        let codes: Vec<&str> = match self {
            Self::Trade(e) => vec![e.exchange.as_str()],
            Self::Timesale(e) => vec![e.exchange.as_str()],
            Self::Quote(e) => vec![e.bid_exchange.as_str(), e.ask_exchange.as_str()],
            _ => Vec::new(),
        };
        codes.into_iter().filter(|c| !c.is_empty()).collect()
    }
}

/// Lenient field decoders: the feed sends numbers both as JSON numbers and
/// as numeric strings, and blanks for missing values.
pub mod conversion {
    use super::{DateTime, Decimal, Utc};
    use serde::de::{self, Deserialize, Deserializer};
    use serde_json::Value;
    use std::str::FromStr;

    fn parse_decimal(raw: &str) -> Option<Decimal> {
        Decimal::from_str(raw)
            .or_else(|_| Decimal::from_scientific(raw))
            .ok()
    }

    pub fn lenient_decimal<'de, D>(deserializer: D) -> Result<Decimal, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Value::deserialize(deserializer)? {
            Value::Null => Ok(Decimal::ZERO),
            Value::Number(n) => parse_decimal(&n.to_string())
                .ok_or_else(|| de::Error::custom(format!("invalid decimal: {}", n))),
            Value::String(s) if s.trim().is_empty() => Ok(Decimal::ZERO),
            Value::String(s) => parse_decimal(s.trim())
                .ok_or_else(|| de::Error::custom(format!("invalid decimal: {}", s))),
            other => Err(de::Error::custom(format!("expected decimal, got {}", other))),
        }
    }

    pub fn lenient_u64<'de, D>(deserializer: D) -> Result<u64, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Value::deserialize(deserializer)? {
            Value::Null => Ok(0),
            Value::Number(n) => n
                .as_u64()
                .or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64))
                .ok_or_else(|| de::Error::custom(format!("invalid unsigned integer: {}", n))),
            Value::String(s) if s.trim().is_empty() => Ok(0),
            Value::String(s) => s
                .trim()
                .parse::<u64>()
                .map_err(|e| de::Error::custom(format!("invalid unsigned integer {}: {}", s, e))),
            other => Err(de::Error::custom(format!(
                "expected unsigned integer, got {}",
                other
            ))),
        }
    }

    pub fn lenient_string<'de, D>(deserializer: D) -> Result<String, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Value::deserialize(deserializer)? {
            Value::Null => Ok(String::new()),
            Value::String(s) => Ok(s),
            Value::Number(n) => Ok(n.to_string()),
            Value::Bool(b) => Ok(b.to_string()),
            other => Err(de::Error::custom(format!("expected string, got {}", other))),
        }
    }

    pub fn lenient_bool<'de, D>(deserializer: D) -> Result<bool, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Value::deserialize(deserializer)? {
            Value::Null => Ok(false),
            Value::Bool(b) => Ok(b),
            Value::String(s) => match s.trim() {
                "true" | "1" => Ok(true),
                "false" | "0" | "" => Ok(false),
                other => Err(de::Error::custom(format!("invalid boolean: {}", other))),
            },
            Value::Number(n) => Ok(n.as_u64().is_some_and(|v| v != 0)),
            other => Err(de::Error::custom(format!("expected boolean, got {}", other))),
        }
    }

    /// Parse an epoch-milliseconds string; `None` for blanks or garbage
    #[inline]
    pub fn epoch_millis_to_datetime(raw: &str) -> Option<DateTime<Utc>> {
        raw.trim()
            .parse::<i64>()
            .ok()
            .and_then(DateTime::from_timestamp_millis)
    }
}
