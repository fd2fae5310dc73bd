#![forbid(unsafe_code)]

use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use danmu_domain::{RoomAlias, RoomId};
use danmu_util::time::unix_ms_now;
use futures_util::StreamExt;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::Error as WsError;
use tracing::{debug, info, warn};

use super::classify::classify;
use super::decode::split_payload;
use super::resolver::{DEFAULT_REQUEST_TIMEOUT, LongzhuEndpoints, LongzhuResolver, MetadataResolver};
use super::ws::{RoomWs, channel_url, connect_room_ws};
use crate::{
	CatalogCache, ChannelPurpose, ClientState, GiftCatalog, ParseError, ResolutionError, RoomConfig, RoomError,
	RoomSignal, RoomSignalRx, RoomSignalTx, new_session_id,
};

pub const DEFAULT_GIFT_REFRESH_INTERVAL: Duration = Duration::from_secs(30 * 60);

#[derive(Debug, Clone)]
pub struct RoomClientSettings {
	pub endpoints: LongzhuEndpoints,
	pub gift_refresh_interval: Duration,
	/// Bounds each metadata request and each websocket handshake.
	pub request_timeout: Duration,
}

impl Default for RoomClientSettings {
	fn default() -> Self {
		Self {
			endpoints: LongzhuEndpoints::default(),
			gift_refresh_interval: DEFAULT_GIFT_REFRESH_INTERVAL,
			request_timeout: DEFAULT_REQUEST_TIMEOUT,
		}
	}
}

struct Lifecycle {
	state: ClientState,
	/// Bumped on every start and stop; a session only mutates state while its
	/// generation is current.
	generation: u64,
	session: Option<JoinHandle<()>>,
}

struct ClientInner {
	cfg: RoomConfig,
	settings: RoomClientSettings,
	resolver: Arc<dyn MetadataResolver>,
	lifecycle: Mutex<Lifecycle>,
	room_id: Mutex<Option<RoomId>>,
	catalog: CatalogCache,
	subscribers: Mutex<Vec<RoomSignalTx>>,
}

/// Live connection to one room: resolves metadata, holds the chat and
/// auxiliary websockets, and fans normalized events out to subscribers.
///
/// Cloning yields another handle to the same client.
#[derive(Clone)]
pub struct RoomClient {
	inner: Arc<ClientInner>,
}

impl RoomClient {
	/// Client backed by the HTTP resolver, sharing the room's proxy.
	pub fn new(cfg: RoomConfig, settings: RoomClientSettings) -> Result<Self, ResolutionError> {
		let resolver = LongzhuResolver::new(settings.endpoints.clone(), cfg.proxy.as_ref(), settings.request_timeout)?;
		Ok(Self::with_resolver(cfg, settings, Arc::new(resolver)))
	}

	pub fn with_resolver(cfg: RoomConfig, settings: RoomClientSettings, resolver: Arc<dyn MetadataResolver>) -> Self {
		Self {
			inner: Arc::new(ClientInner {
				cfg,
				settings,
				resolver,
				lifecycle: Mutex::new(Lifecycle {
					state: ClientState::Idle,
					generation: 0,
					session: None,
				}),
				room_id: Mutex::new(None),
				catalog: CatalogCache::new(),
				subscribers: Mutex::new(Vec::new()),
			}),
		}
	}

	pub fn alias(&self) -> &RoomAlias {
		&self.inner.cfg.alias
	}

	pub fn config(&self) -> &RoomConfig {
		&self.inner.cfg
	}

	pub fn state(&self) -> ClientState {
		self.inner.lifecycle.lock().state
	}

	/// Resolved room id, cached for the client's lifetime.
	pub fn room_id(&self) -> Option<RoomId> {
		self.inner.room_id.lock().clone()
	}

	pub fn catalog(&self) -> Option<Arc<GiftCatalog>> {
		self.inner.catalog.snapshot()
	}

	/// Register an observer. Signals are delivered in emission order.
	pub fn subscribe(&self) -> RoomSignalRx {
		let (tx, rx) = mpsc::unbounded_channel();
		self.inner.subscribers.lock().push(tx);
		rx
	}

	/// Begin a session. No-op while resolving or connected.
	pub fn start(&self) {
		let mut lc = self.inner.lifecycle.lock();
		if lc.state.is_active() {
			debug!(room = %self.inner.cfg.alias, state = %lc.state, "start ignored; session already active");
			return;
		}

		lc.generation = lc.generation.wrapping_add(1);
		lc.state = ClientState::Resolving;
		let generation = lc.generation;
		let inner = Arc::clone(&self.inner);
		lc.session = Some(tokio::spawn(async move { inner.run_session(generation).await }));
	}

	/// Detach every subscriber and tear down the active session, if any.
	/// Safe to call repeatedly.
	pub fn stop(&self) {
		self.inner.subscribers.lock().clear();

		let session = {
			let mut lc = self.inner.lifecycle.lock();
			if !lc.state.is_active() {
				lc.session.take();
				return;
			}
			lc.generation = lc.generation.wrapping_add(1);
			lc.state = ClientState::Stopped;
			lc.session.take()
		};

		if let Some(session) = session {
			session.abort();
		}
		info!(room = %self.inner.cfg.alias, "room client stopped");
	}
}

impl ClientInner {
	async fn run_session(self: Arc<Self>, generation: u64) {
		let session_id = new_session_id();
		debug!(room = %self.cfg.alias, session_id = %session_id, "room session starting");

		let room_id = match self.ensure_room_id().await {
			Ok(id) => id,
			Err(e) => return self.fail(generation, e.into()),
		};
		if !self.catalog.is_loaded() {
			match self.resolver.fetch_gift_catalog().await {
				Ok(catalog) => self.catalog.replace(catalog),
				Err(e) => return self.fail(generation, e.into()),
			}
		}

		if !self.advance(generation, ClientState::Connected) {
			return;
		}
		info!(room = %self.cfg.alias, room_id = %room_id, session_id = %session_id, "room metadata resolved; opening channels");

		let (chat, other) = tokio::join!(
			self.open_channel(&room_id, ChannelPurpose::Chat),
			self.open_channel(&room_id, ChannelPurpose::Other)
		);
		let (mut chat, mut other) = match (chat, other) {
			(Ok(chat), Ok(other)) => (chat, other),
			(chat, other) => {
				for err in [chat.err(), other.err()].into_iter().flatten() {
					self.emit(RoomSignal::Error(err));
				}
				return self.close(generation, "channel open failed");
			}
		};

		let period = self.settings.gift_refresh_interval.max(Duration::from_millis(1));
		let mut refresh = tokio::time::interval_at(Instant::now() + period, period);
		refresh.set_missed_tick_behavior(MissedTickBehavior::Delay);

		let reason = loop {
			tokio::select! {
				msg = chat.next() => {
					if let ControlFlow::Break(reason) = self.on_frame(ChannelPurpose::Chat, msg) {
						break reason;
					}
				}
				msg = other.next() => {
					if let ControlFlow::Break(reason) = self.on_frame(ChannelPurpose::Other, msg) {
						break reason;
					}
				}
				_ = refresh.tick() => self.refresh_catalog().await,
			}
		};

		drop(chat);
		drop(other);
		self.close(generation, &reason);
	}

	async fn ensure_room_id(&self) -> Result<RoomId, ResolutionError> {
		if let Some(id) = self.room_id.lock().clone() {
			return Ok(id);
		}
		let id = self.resolver.resolve_room_id(&self.cfg.alias).await?;
		*self.room_id.lock() = Some(id.clone());
		Ok(id)
	}

	async fn open_channel(&self, room_id: &RoomId, purpose: ChannelPurpose) -> Result<RoomWs, RoomError> {
		let channel_err = |e: anyhow::Error| RoomError::Channel {
			purpose,
			detail: format!("{e:#}"),
		};
		let url = channel_url(&self.settings.endpoints.ws_url, room_id, purpose).map_err(channel_err)?;
		let ws = connect_room_ws(&url, self.cfg.proxy.as_ref(), self.settings.request_timeout)
			.await
			.map_err(channel_err)?;

		debug!(room = %self.cfg.alias, channel = %purpose, "channel connected");
		self.emit(RoomSignal::Connect(purpose));
		Ok(ws)
	}

	/// Pings are answered by tungstenite itself on the next read.
	fn on_frame(&self, purpose: ChannelPurpose, msg: Option<Result<Message, WsError>>) -> ControlFlow<String> {
		let msg = match msg {
			Some(Ok(msg)) => msg,
			Some(Err(e)) => {
				self.emit(RoomSignal::Error(RoomError::Channel {
					purpose,
					detail: e.to_string(),
				}));
				return ControlFlow::Break(format!("{purpose} channel read error"));
			}
			None => return ControlFlow::Break(format!("{purpose} channel ended")),
		};

		match msg {
			Message::Text(text) => self.on_payload(text.as_str()),
			Message::Binary(bytes) => match std::str::from_utf8(&bytes) {
				Ok(text) => self.on_payload(text),
				Err(_) => self.emit(RoomSignal::Error(ParseError::Utf8.into())),
			},
			Message::Close(frame) => {
				let reason = match frame {
					Some(f) if !f.reason.as_str().is_empty() => format!("{purpose} channel closed by peer: {}", f.reason.as_str()),
					_ => format!("{purpose} channel closed by peer"),
				};
				return ControlFlow::Break(reason);
			}
			_ => {}
		}
		ControlFlow::Continue(())
	}

	fn on_payload(&self, text: &str) {
		let items = match split_payload(text) {
			Ok(items) => items,
			Err(e) => {
				debug!(room = %self.cfg.alias, error = %e, "dropping undecodable payload");
				return self.emit(RoomSignal::Error(e.into()));
			}
		};

		let catalog = self.catalog.snapshot().unwrap_or_default();
		let now = unix_ms_now();
		for item in items {
			match classify(item, &catalog, now) {
				Ok(event) => {
					metrics::counter!("danmu_room_messages_total", "kind" => event.kind()).increment(1);
					self.emit(RoomSignal::Message(Box::new(event)));
				}
				Err(e) => self.emit(RoomSignal::Error(e.into())),
			}
		}
	}

	async fn refresh_catalog(&self) {
		match self.resolver.fetch_gift_catalog().await {
			Ok(catalog) => {
				debug!(room = %self.cfg.alias, gifts = catalog.len(), "gift catalog refreshed");
				self.catalog.replace(catalog);
			}
			Err(e) => {
				metrics::counter!("danmu_gift_catalog_refresh_errors_total").increment(1);
				let age_secs = self.catalog.age().map(|age| age.as_secs()).unwrap_or_default();
				warn!(room = %self.cfg.alias, error = %e, age_secs, "gift catalog refresh failed; keeping previous catalog");
				self.emit(RoomSignal::Error(e.into()));
			}
		}
	}

	/// Move to `next` if this session is still current.
	fn advance(&self, generation: u64, next: ClientState) -> bool {
		let mut lc = self.lifecycle.lock();
		if lc.generation != generation {
			return false;
		}
		lc.state = next;
		true
	}

	fn fail(&self, generation: u64, err: RoomError) {
		warn!(room = %self.cfg.alias, error = %err, "room session failed");
		if self.advance(generation, ClientState::Stopped) {
			self.emit(RoomSignal::Error(err));
			self.emit(RoomSignal::Close);
		}
	}

	fn close(&self, generation: u64, reason: &str) {
		if self.advance(generation, ClientState::Stopped) {
			info!(room = %self.cfg.alias, reason, "room session closed");
			self.emit(RoomSignal::Close);
		}
	}

	fn emit(&self, signal: RoomSignal) {
		metrics::counter!("danmu_room_signals_total", "signal" => signal.name()).increment(1);
		let mut subscribers = self.subscribers.lock();
		subscribers.retain(|tx| tx.send(signal.clone()).is_ok());
	}
}
