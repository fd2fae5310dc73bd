#![forbid(unsafe_code)]

//! Tolerant accessors for upstream JSON.
//!
//! Upstream fields drift between numbers and numeric strings, so every reader
//! here accepts both and treats `null` like an absent field.

use serde_json::Value;

use crate::ParseError;

/// Split one websocket payload into its event elements.
///
/// A top-level array yields its elements in order; anything else is a single event.
pub fn split_payload(text: &str) -> Result<Vec<Value>, ParseError> {
	let value: Value = serde_json::from_str(text).map_err(|e| ParseError::Json(e.to_string()))?;
	Ok(match value {
		Value::Array(items) => items,
		other => vec![other],
	})
}

/// Opaque string form of an id-like field. Numbers keep their textual digits.
pub fn string_field(v: Option<&Value>) -> Option<String> {
	match v? {
		Value::String(s) => Some(s.clone()),
		Value::Number(n) => Some(n.to_string()),
		Value::Bool(b) => Some(b.to_string()),
		_ => None,
	}
}

pub fn i64_field(v: Option<&Value>) -> Option<i64> {
	match v? {
		Value::Number(n) => n.as_i64().or_else(|| n.as_f64().filter(|f| f.is_finite()).map(|f| f.trunc() as i64)),
		Value::String(s) => s.trim().parse().ok(),
		_ => None,
	}
}

pub fn u64_field(v: Option<&Value>) -> Option<u64> {
	match v? {
		Value::Number(n) => n.as_u64(),
		Value::String(s) => s.trim().parse().ok(),
		_ => None,
	}
}

pub fn f64_field(v: Option<&Value>) -> Option<f64> {
	let f = match v? {
		Value::Number(n) => n.as_f64()?,
		Value::String(s) => s.trim().parse().ok()?,
		_ => return None,
	};
	f.is_finite().then_some(f)
}

/// Extract epoch millis from the upstream `"/Date(1700000000000+0800)/"` form.
pub fn upstream_time_ms(v: Option<&Value>) -> Option<i64> {
	let s = v?.as_str()?;
	let start = s.find("Date(")? + "Date(".len();
	let digits: &str = {
		let tail = &s[start..];
		let end = tail.find(|c: char| !c.is_ascii_digit()).unwrap_or(tail.len());
		&tail[..end]
	};
	if digits.is_empty() {
		return None;
	}
	digits.parse().ok()
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;

	#[test]
	fn splits_arrays_in_order() {
		let items = split_payload(r#"[{"id":1},{"id":2}]"#).unwrap();
		assert_eq!(items.len(), 2);
		assert_eq!(items[1]["id"], 2);

		let items = split_payload(r#"{"id":1}"#).unwrap();
		assert_eq!(items.len(), 1);

		assert!(matches!(split_payload("not json"), Err(ParseError::Json(_))));
	}

	#[test]
	fn large_ids_keep_their_digits() {
		let items = split_payload(r#"{"id":123456789012345678901234567890}"#).unwrap();
		assert_eq!(
			string_field(items[0].get("id")).as_deref(),
			Some("123456789012345678901234567890")
		);
	}

	#[test]
	fn numeric_fields_accept_strings() {
		assert_eq!(i64_field(Some(&json!("42"))), Some(42));
		assert_eq!(i64_field(Some(&json!(7))), Some(7));
		assert_eq!(i64_field(Some(&json!(null))), None);
		assert_eq!(u64_field(Some(&json!("3"))), Some(3));
		assert_eq!(u64_field(Some(&json!(-3))), None);
		assert_eq!(f64_field(Some(&json!("0.5"))), Some(0.5));
		assert_eq!(f64_field(None), None);
	}

	#[test]
	fn parses_embedded_epoch() {
		assert_eq!(
			upstream_time_ms(Some(&json!("/Date(1700000000000+0800)/"))),
			Some(1_700_000_000_000)
		);
		assert_eq!(upstream_time_ms(Some(&json!("/Date()/"))), None);
		assert_eq!(upstream_time_ms(Some(&json!("yesterday"))), None);
		assert_eq!(upstream_time_ms(Some(&json!(1700000000000_i64))), None);
	}
}
