#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use danmu_domain::CurrencyKind;
use parking_lot::Mutex;
use serde::Serialize;

/// One gift catalog entry.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GiftInfo {
	pub display_name: String,
	/// Price per unit in the currency's smallest unit.
	pub unit_price: u64,
	pub currency: CurrencyKind,
}

impl GiftInfo {
	pub fn new(display_name: impl Into<String>, unit_price: u64, currency: CurrencyKind) -> Self {
		Self {
			display_name: display_name.into(),
			unit_price,
			currency,
		}
	}
}

/// Gift key → gift info.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GiftCatalog {
	entries: HashMap<String, GiftInfo>,
}

impl GiftCatalog {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn insert(&mut self, key: impl Into<String>, info: GiftInfo) {
		self.entries.insert(key.into(), info);
	}

	pub fn get(&self, key: &str) -> Option<&GiftInfo> {
		self.entries.get(key)
	}

	pub fn len(&self) -> usize {
		self.entries.len()
	}

	pub fn is_empty(&self) -> bool {
		self.entries.is_empty()
	}
}

impl<K: Into<String>> FromIterator<(K, GiftInfo)> for GiftCatalog {
	fn from_iter<T: IntoIterator<Item = (K, GiftInfo)>>(iter: T) -> Self {
		Self {
			entries: iter.into_iter().map(|(k, v)| (k.into(), v)).collect(),
		}
	}
}

struct CachedCatalog {
	fetched_at: Instant,
	catalog: Arc<GiftCatalog>,
}

/// Last successfully fetched catalog for one room client.
///
/// Readers get an `Arc` snapshot so a refresh never blocks classification and
/// a failed refresh leaves the previous catalog in place.
#[derive(Default)]
pub struct CatalogCache {
	current: Mutex<Option<CachedCatalog>>,
}

impl CatalogCache {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn snapshot(&self) -> Option<Arc<GiftCatalog>> {
		self.current.lock().as_ref().map(|c| Arc::clone(&c.catalog))
	}

	pub fn is_loaded(&self) -> bool {
		self.current.lock().is_some()
	}

	pub fn replace(&self, catalog: GiftCatalog) {
		*self.current.lock() = Some(CachedCatalog {
			fetched_at: Instant::now(),
			catalog: Arc::new(catalog),
		});
	}

	/// Time since the last successful fetch.
	pub fn age(&self) -> Option<Duration> {
		self.current.lock().as_ref().map(|c| c.fetched_at.elapsed())
	}
}
