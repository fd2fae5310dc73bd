#![forbid(unsafe_code)]

use std::time::Duration;

use anyhow::{Context, anyhow};
use async_trait::async_trait;
use danmu_domain::{CurrencyKind, RoomAlias, RoomId};
use danmu_util::proxy::ProxyConfig;
use serde_json::Value;
use tracing::debug;

use super::decode::{f64_field, i64_field, string_field};
use crate::{GiftCatalog, GiftInfo, ResolutionError};

pub const DEFAULT_ROOM_PAGE_BASE_URL: &str = "http://m.longzhu.com";
pub const DEFAULT_GIFT_CATALOG_URL: &str = "http://configapi.plu.cn/item/getallitems";
pub const DEFAULT_WS_URL: &str = "ws://mbgows.plu.cn:8805/";
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

const ROOM_ID_MARKER: &str = "var roomId";

/// Upstream endpoints. Overridable so tests and mirrors can point elsewhere.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LongzhuEndpoints {
	pub room_page_base_url: String,
	pub gift_catalog_url: String,
	pub ws_url: String,
}

impl Default for LongzhuEndpoints {
	fn default() -> Self {
		Self {
			room_page_base_url: DEFAULT_ROOM_PAGE_BASE_URL.to_string(),
			gift_catalog_url: DEFAULT_GIFT_CATALOG_URL.to_string(),
			ws_url: DEFAULT_WS_URL.to_string(),
		}
	}
}

/// Resolves room metadata ahead of a websocket session.
#[async_trait]
pub trait MetadataResolver: Send + Sync + 'static {
	/// Map a room alias to the upstream room id.
	async fn resolve_room_id(&self, alias: &RoomAlias) -> Result<RoomId, ResolutionError>;

	/// Fetch the full gift catalog.
	async fn fetch_gift_catalog(&self) -> Result<GiftCatalog, ResolutionError>;
}

/// HTTP resolver against the public room page and item config API.
#[derive(Debug, Clone)]
pub struct LongzhuResolver {
	endpoints: LongzhuEndpoints,
	client: reqwest::Client,
}

impl LongzhuResolver {
	pub fn new(
		endpoints: LongzhuEndpoints,
		proxy: Option<&ProxyConfig>,
		timeout: Duration,
	) -> Result<Self, ResolutionError> {
		let mut builder = reqwest::Client::builder().timeout(timeout).gzip(true);
		if let Some(proxy) = proxy {
			let proxy = reqwest::Proxy::all(proxy.socks_url()).map_err(|e| ResolutionError::Proxy(e.to_string()))?;
			builder = builder.proxy(proxy);
		}
		let client = builder.build().map_err(|e| ResolutionError::Proxy(e.to_string()))?;
		Ok(Self { endpoints, client })
	}

	fn room_page_url(&self, alias: &RoomAlias) -> String {
		format!(
			"{}/{}",
			self.endpoints.room_page_base_url.trim_end_matches('/'),
			urlencoding::encode(alias.as_str())
		)
	}

	async fn get(&self, url: &str, what: &str) -> anyhow::Result<reqwest::Response> {
		let resp = self.client.get(url).send().await.with_context(|| format!("{what} request"))?;
		if !resp.status().is_success() {
			return Err(anyhow!("{what} failed: status={}", resp.status()));
		}
		Ok(resp)
	}
}

#[async_trait]
impl MetadataResolver for LongzhuResolver {
	async fn resolve_room_id(&self, alias: &RoomAlias) -> Result<RoomId, ResolutionError> {
		let url = self.room_page_url(alias);
		let request_err = |e: anyhow::Error| ResolutionError::RoomIdRequest {
			alias: alias.to_string(),
			detail: format!("{e:#}"),
		};

		let body = self
			.get(&url, "room page")
			.await
			.map_err(request_err)?
			.text()
			.await
			.context("room page body")
			.map_err(request_err)?;

		let id = parse_room_id(&body).ok_or_else(|| ResolutionError::RoomIdMissing {
			alias: alias.to_string(),
		})?;
		debug!(room = %alias, room_id = %id, "resolved room id");
		RoomId::new(id).map_err(|_| ResolutionError::RoomIdMissing {
			alias: alias.to_string(),
		})
	}

	async fn fetch_gift_catalog(&self) -> Result<GiftCatalog, ResolutionError> {
		let resp = self
			.get(&self.endpoints.gift_catalog_url, "gift catalog")
			.await
			.map_err(|e| ResolutionError::GiftCatalogRequest(format!("{e:#}")))?;
		let body: Value = resp
			.json()
			.await
			.map_err(|e| ResolutionError::GiftCatalogMalformed(e.to_string()))?;

		let items = body
			.as_array()
			.ok_or_else(|| ResolutionError::GiftCatalogMalformed("expected a JSON array".to_string()))?;
		let catalog = catalog_from_items(items);
		debug!(gifts = catalog.len(), "fetched gift catalog");
		Ok(catalog)
	}
}

/// Find `var roomId = <digits>;` in a room page.
pub fn parse_room_id(body: &str) -> Option<String> {
	let mut rest = body;
	while let Some(pos) = rest.find(ROOM_ID_MARKER) {
		rest = &rest[pos + ROOM_ID_MARKER.len()..];
		if let Some(id) = room_id_assignment(rest) {
			return Some(id.to_string());
		}
	}
	None
}

fn room_id_assignment(s: &str) -> Option<&str> {
	let s = s.trim_start().strip_prefix('=')?.trim_start();
	let end = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
	let (digits, tail) = s.split_at(end);
	if digits.is_empty() || !tail.trim_start().starts_with(';') {
		return None;
	}
	Some(digits)
}

/// Build a catalog from the upstream item list. Entries without a `name` are skipped.
pub fn catalog_from_items(items: &[Value]) -> GiftCatalog {
	items
		.iter()
		.filter_map(|item| {
			let key = string_field(item.get("name")).filter(|k| !k.is_empty())?;
			let title = string_field(item.get("title"))
				.filter(|t| !t.is_empty())
				.unwrap_or_else(|| key.clone());
			let currency = CurrencyKind::from_cost_type(i64_field(item.get("costType")).unwrap_or(0));
			let cost = f64_field(item.get("costValue")).unwrap_or(0.0);
			let unit_price = match currency {
				CurrencyKind::PrimaryCredit => to_price(cost * 100.0),
				_ => to_price(cost),
			};
			Some((key, GiftInfo::new(title, unit_price, currency)))
		})
		.collect()
}

fn to_price(v: f64) -> u64 {
	if v.is_finite() && v > 0.0 { v.round() as u64 } else { 0 }
}
