#![forbid(unsafe_code)]

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors for parsing identifiers from strings.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseIdError {
	#[error("empty value")]
	Empty,
	#[error("invalid format: {0}")]
	InvalidFormat(String),
}

/// Human-readable room name as it appears in the room URL.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomAlias(String);

impl RoomAlias {
	/// Create a non-empty alias (surrounding whitespace is dropped).
	pub fn new(alias: impl Into<String>) -> Result<Self, ParseIdError> {
		let alias = alias.into();
		let alias = alias.trim();
		if alias.is_empty() {
			return Err(ParseIdError::Empty);
		}
		if alias.contains('/') || alias.contains('?') || alias.contains('#') {
			return Err(ParseIdError::InvalidFormat(format!(
				"room alias must not contain path/query characters: {alias}"
			)));
		}
		Ok(Self(alias.to_string()))
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl fmt::Display for RoomAlias {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for RoomAlias {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		RoomAlias::new(s.to_string())
	}
}

/// Upstream internal room identifier.
///
/// Kept as an opaque string: upstream ids are numeric but may exceed the
/// precision of a double.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(String);

impl RoomId {
	/// Create a non-empty `RoomId`.
	pub fn new(id: impl Into<String>) -> Result<Self, ParseIdError> {
		let id = id.into();
		if id.trim().is_empty() {
			return Err(ParseIdError::Empty);
		}
		Ok(Self(id))
	}
	pub fn as_str(&self) -> &str {
		&self.0
	}
	pub fn into_string(self) -> String {
		self.0
	}
}

impl fmt::Display for RoomId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for RoomId {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		RoomId::new(s.to_string())
	}
}

/// Client platform a chat message was sent from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SenderPlatform {
	#[default]
	Web,
	Android,
	Ios,
}

impl SenderPlatform {
	/// Map the upstream `via` code. Absent or unknown codes mean web.
	pub fn from_via(via: Option<i64>) -> Self {
		match via {
			Some(2) => SenderPlatform::Android,
			Some(3) => SenderPlatform::Ios,
			_ => SenderPlatform::Web,
		}
	}

	/// Stable string identifier.
	pub const fn as_str(self) -> &'static str {
		match self {
			SenderPlatform::Web => "pc_web",
			SenderPlatform::Android => "android",
			SenderPlatform::Ios => "ios",
		}
	}
}

impl fmt::Display for SenderPlatform {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Currency a gift is paid with.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CurrencyKind {
	/// Paid credit; upstream prices are scaled by 100 into the smallest unit.
	PrimaryCredit,
	/// Free/earned credit.
	SecondaryCredit,
	/// Unrecognized cost code, preserved verbatim.
	Other(String),
}

impl CurrencyKind {
	/// Label used for gifts missing from the catalog.
	pub const UNKNOWN_LABEL: &'static str = "unknown";

	/// Map an upstream `costType` code.
	pub fn from_cost_type(code: i64) -> Self {
		match code {
			1 => CurrencyKind::PrimaryCredit,
			2 => CurrencyKind::SecondaryCredit,
			other => CurrencyKind::Other(other.to_string()),
		}
	}

	pub fn unknown() -> Self {
		CurrencyKind::Other(Self::UNKNOWN_LABEL.to_string())
	}

	pub fn as_str(&self) -> &str {
		match self {
			CurrencyKind::PrimaryCredit => "primary_credit",
			CurrencyKind::SecondaryCredit => "secondary_credit",
			CurrencyKind::Other(label) => label,
		}
	}
}

impl fmt::Display for CurrencyKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Persistence-ready chat tuple `(room_id, sender_id, sender_name, content, timestamp_ms)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DanmuRecord {
	pub room_id: String,
	pub sender_id: String,
	pub sender_name: String,
	pub content: String,
	pub timestamp_ms: i64,
}

impl DanmuRecord {
	pub fn new(
		room_id: impl Into<String>,
		sender_id: impl Into<String>,
		sender_name: impl Into<String>,
		content: impl Into<String>,
		timestamp_ms: i64,
	) -> Self {
		Self {
			room_id: room_id.into(),
			sender_id: sender_id.into(),
			sender_name: sender_name.into(),
			content: content.into(),
			timestamp_ms,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn sender_platform_from_via() {
		assert_eq!(SenderPlatform::from_via(None), SenderPlatform::Web);
		assert_eq!(SenderPlatform::from_via(Some(1)), SenderPlatform::Web);
		assert_eq!(SenderPlatform::from_via(Some(2)), SenderPlatform::Android);
		assert_eq!(SenderPlatform::from_via(Some(3)), SenderPlatform::Ios);
		assert_eq!(SenderPlatform::from_via(Some(42)), SenderPlatform::Web);
	}

	#[test]
	fn sender_platform_display() {
		assert_eq!(SenderPlatform::Web.to_string(), "pc_web");
		assert_eq!(SenderPlatform::Ios.to_string(), "ios");
	}

	#[test]
	fn currency_kind_preserves_unknown_codes() {
		assert_eq!(CurrencyKind::from_cost_type(1), CurrencyKind::PrimaryCredit);
		assert_eq!(CurrencyKind::from_cost_type(2), CurrencyKind::SecondaryCredit);
		assert_eq!(CurrencyKind::from_cost_type(7), CurrencyKind::Other("7".to_string()));
		assert_eq!(CurrencyKind::unknown().as_str(), "unknown");
	}

	#[test]
	fn rejects_empty_ids() {
		assert!(RoomId::new("").is_err());
		assert!(RoomAlias::new("   ").is_err());
		assert!("".parse::<RoomAlias>().is_err());
	}

	#[test]
	fn alias_is_trimmed_and_rejects_path_chars() {
		assert_eq!(RoomAlias::new("  roomA ").unwrap().as_str(), "roomA");
		assert!(RoomAlias::new("room/a").is_err());
		assert!(RoomAlias::new("room?a=1").is_err());
	}
}
