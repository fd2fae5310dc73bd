#![forbid(unsafe_code)]

pub mod catalog;
pub mod longzhu;

use std::fmt;

use danmu_domain::{CurrencyKind, RoomAlias, SenderPlatform};
use danmu_util::proxy::ProxyConfig;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

pub use catalog::{CatalogCache, GiftCatalog, GiftInfo};

/// Per-room client configuration. Immutable once the client is built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomConfig {
	pub alias: RoomAlias,
	pub proxy: Option<ProxyConfig>,
}

impl RoomConfig {
	pub fn new(alias: RoomAlias) -> Self {
		Self { alias, proxy: None }
	}

	pub fn with_proxy(mut self, proxy: Option<ProxyConfig>) -> Self {
		self.proxy = proxy;
		self
	}
}

/// Which of the two room sockets a signal refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelPurpose {
	Chat,
	Other,
}

impl ChannelPurpose {
	pub const ALL: [ChannelPurpose; 2] = [ChannelPurpose::Chat, ChannelPurpose::Other];

	/// Upstream `connType` query value.
	pub const fn conn_type(self) -> u8 {
		match self {
			ChannelPurpose::Chat => 1,
			ChannelPurpose::Other => 2,
		}
	}

	pub const fn as_str(self) -> &'static str {
		match self {
			ChannelPurpose::Chat => "chat",
			ChannelPurpose::Other => "other",
		}
	}
}

impl fmt::Display for ChannelPurpose {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Room client lifecycle: `Idle -> Resolving -> Connected -> Stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientState {
	#[default]
	Idle,
	Resolving,
	Connected,
	Stopped,
}

impl ClientState {
	/// Resolving or connected.
	pub const fn is_active(self) -> bool {
		matches!(self, ClientState::Resolving | ClientState::Connected)
	}

	pub const fn as_str(self) -> &'static str {
		match self {
			ClientState::Idle => "idle",
			ClientState::Resolving => "resolving",
			ClientState::Connected => "connected",
			ClientState::Stopped => "stopped",
		}
	}
}

impl fmt::Display for ClientState {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Room id or gift catalog lookup failure.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ResolutionError {
	#[error("room page request for {alias} failed: {detail}")]
	RoomIdRequest { alias: String, detail: String },

	#[error("room page for {alias} has no embedded room id")]
	RoomIdMissing { alias: String },

	#[error("gift catalog request failed: {0}")]
	GiftCatalogRequest(String),

	#[error("gift catalog response is malformed: {0}")]
	GiftCatalogMalformed(String),

	#[error("invalid proxy configuration: {0}")]
	Proxy(String),
}

/// Upstream payload that could not be decoded.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ParseError {
	#[error("payload is not valid JSON: {0}")]
	Json(String),

	#[error("payload is not valid UTF-8")]
	Utf8,

	#[error("payload element is not an object")]
	NotAnObject,

	#[error("{kind} payload is missing `{field}`")]
	MissingField { kind: &'static str, field: &'static str },
}

/// Everything a room client reports through its `Error` signal.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RoomError {
	#[error(transparent)]
	Resolution(#[from] ResolutionError),

	#[error("{purpose} channel error: {detail}")]
	Channel { purpose: ChannelPurpose, detail: String },

	#[error(transparent)]
	Parse(#[from] ParseError),
}

impl RoomError {
	pub const fn kind(&self) -> &'static str {
		match self {
			RoomError::Resolution(_) => "resolution",
			RoomError::Channel { .. } => "channel",
			RoomError::Parse(_) => "parse",
		}
	}
}

/// Normalized chat message.
#[derive(Debug, Clone, Serialize)]
pub struct ChatEvent {
	pub id: String,
	pub timestamp_ms: i64,
	pub sender_id: String,
	pub sender_name: String,
	pub sender_level: i64,
	pub sender_platform: SenderPlatform,
	pub content: String,
	/// Unparsed upstream payload.
	pub raw: serde_json::Value,
}

impl ChatEvent {
	/// Room id carried inside the upstream payload (`msg.RoomId`), if any.
	pub fn upstream_room_id(&self) -> Option<String> {
		let v = self.raw.get("msg")?.get("RoomId")?;
		match v {
			serde_json::Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
			serde_json::Value::Number(n) => Some(n.to_string()),
			_ => None,
		}
	}
}

/// Normalized gift event, priced against the room's gift catalog.
#[derive(Debug, Clone, Serialize)]
pub struct GiftEvent {
	pub id: String,
	pub timestamp_ms: i64,
	/// Upstream catalog key (`msg.itemType`).
	pub gift_key: Option<String>,
	pub gift_name: String,
	pub gift_kind: CurrencyKind,
	pub sender_id: String,
	pub sender_name: String,
	pub sender_level: i64,
	pub count: u64,
	pub total_price: u64,
	pub platform_earn_estimate: f64,
	pub raw: serde_json::Value,
}

/// Any payload type without a dedicated schema.
#[derive(Debug, Clone, Serialize)]
pub struct OtherEvent {
	pub id: String,
	pub timestamp_ms: i64,
	pub raw: serde_json::Value,
}

/// Normalized upstream event.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NormalizedEvent {
	Chat(ChatEvent),
	Gift(GiftEvent),
	Other(OtherEvent),
}

impl NormalizedEvent {
	pub fn id(&self) -> &str {
		match self {
			Self::Chat(e) => &e.id,
			Self::Gift(e) => &e.id,
			Self::Other(e) => &e.id,
		}
	}

	pub fn timestamp_ms(&self) -> i64 {
		match self {
			Self::Chat(e) => e.timestamp_ms,
			Self::Gift(e) => e.timestamp_ms,
			Self::Other(e) => e.timestamp_ms,
		}
	}

	pub const fn kind(&self) -> &'static str {
		match self {
			Self::Chat(_) => "chat",
			Self::Gift(_) => "gift",
			Self::Other(_) => "other",
		}
	}
}

/// Room client → observer signal.
#[derive(Debug, Clone)]
pub enum RoomSignal {
	/// One of the two channels finished its handshake.
	Connect(ChannelPurpose),

	/// One normalized event per upstream payload element.
	Message(Box<NormalizedEvent>),

	Error(RoomError),

	/// The session ended; both channels and the refresh timer are gone.
	Close,
}

impl RoomSignal {
	pub const fn name(&self) -> &'static str {
		match self {
			Self::Connect(_) => "connect",
			Self::Message(_) => "message",
			Self::Error(_) => "error",
			Self::Close => "close",
		}
	}
}

/// Subscriber channel halves. Unbounded so no signal is ever dropped.
pub type RoomSignalTx = mpsc::UnboundedSender<RoomSignal>;
pub type RoomSignalRx = mpsc::UnboundedReceiver<RoomSignal>;

/// Generate an opaque session id.
pub fn new_session_id() -> String {
	Uuid::new_v4().to_string()
}
