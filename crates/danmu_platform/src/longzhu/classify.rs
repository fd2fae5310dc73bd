#![forbid(unsafe_code)]

use danmu_domain::{CurrencyKind, SenderPlatform};
use serde_json::{Map, Value};

use super::decode::{i64_field, string_field, u64_field, upstream_time_ms};
use crate::{ChatEvent, GiftCatalog, GiftEvent, NormalizedEvent, OtherEvent, ParseError};

/// Display name used for gifts missing from the catalog.
pub const UNKNOWN_GIFT_NAME: &str = "unknown gift";

/// Share of a gift's total price attributed to the platform.
pub const PLATFORM_EARN_RATE: f64 = 0.01;

/// Classify one payload element against the current gift catalog.
///
/// `now_ms` stands in for the event time when the payload carries none.
pub fn classify(payload: Value, catalog: &GiftCatalog, now_ms: i64) -> Result<NormalizedEvent, ParseError> {
	let Value::Object(obj) = &payload else {
		return Err(ParseError::NotAnObject);
	};

	let id = string_field(obj.get("id")).unwrap_or_default();
	let msg = obj.get("msg");
	let timestamp_ms = msg.and_then(|m| upstream_time_ms(m.get("time"))).unwrap_or(now_ms);

	match obj.get("type").and_then(Value::as_str) {
		Some("chat") => {
			let msg = require_msg(msg, "chat")?;
			let sender = Sender::from_msg(msg);
			let sender_platform = SenderPlatform::from_via(i64_field(msg.get("via")));
			let content = string_field(msg.get("content")).unwrap_or_default();

			Ok(NormalizedEvent::Chat(ChatEvent {
				id,
				timestamp_ms,
				sender_id: sender.id,
				sender_name: sender.name,
				sender_level: sender.level,
				sender_platform,
				content,
				raw: payload,
			}))
		}
		Some("gift") => {
			let msg = require_msg(msg, "gift")?;
			let sender = Sender::from_msg(msg);
			let count = u64_field(msg.get("number")).unwrap_or(0);
			let gift_key = string_field(msg.get("itemType"));

			let (gift_name, gift_kind, unit_price) = match gift_key.as_deref().and_then(|k| catalog.get(k)) {
				Some(info) => (info.display_name.clone(), info.currency.clone(), info.unit_price),
				None => (UNKNOWN_GIFT_NAME.to_string(), CurrencyKind::unknown(), 0),
			};
			let total_price = count.saturating_mul(unit_price);

			Ok(NormalizedEvent::Gift(GiftEvent {
				id,
				timestamp_ms,
				gift_key,
				gift_name,
				gift_kind,
				sender_id: sender.id,
				sender_name: sender.name,
				sender_level: sender.level,
				count,
				total_price,
				platform_earn_estimate: total_price as f64 * PLATFORM_EARN_RATE,
				raw: payload,
			}))
		}
		_ => Ok(NormalizedEvent::Other(OtherEvent {
			id,
			timestamp_ms,
			raw: payload,
		})),
	}
}

fn require_msg<'a>(msg: Option<&'a Value>, kind: &'static str) -> Result<&'a Map<String, Value>, ParseError> {
	msg.and_then(Value::as_object)
		.ok_or(ParseError::MissingField { kind, field: "msg" })
}

struct Sender {
	id: String,
	name: String,
	level: i64,
}

impl Sender {
	fn from_msg(msg: &Map<String, Value>) -> Self {
		let user = msg.get("user");
		let field = |name: &str| user.and_then(|u| u.get(name));
		Self {
			id: string_field(field("uid")).unwrap_or_default(),
			name: string_field(field("username")).unwrap_or_default(),
			level: i64_field(field("newGrade")).unwrap_or(0),
		}
	}
}
