#![forbid(unsafe_code)]

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use danmu_domain::DanmuRecord;
use danmu_platform::longzhu::{RoomClient, RoomClientSettings};
use danmu_platform::{ChannelPurpose, ChatEvent, ClientState, NormalizedEvent, RoomConfig, RoomSignal, RoomSignalRx};
use danmu_util::time::backoff_delay;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::flush::{FlushBuffer, FlushReport, flush_once, spawn_flush_task};
use super::sink::PersistenceSink;
use crate::config::{DEFAULT_FLUSH_INTERVAL, DEFAULT_RESTART_MAX_DELAY, DEFAULT_RESTART_MIN_DELAY};

/// Builds the client for one room.
pub type ClientFactory = Arc<dyn Fn(RoomConfig) -> anyhow::Result<RoomClient> + Send + Sync>;

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
	pub flush_interval: Duration,
	pub restart_min_delay: Duration,
	pub restart_max_delay: Duration,
	pub client_settings: RoomClientSettings,
}

impl Default for SupervisorConfig {
	fn default() -> Self {
		Self {
			flush_interval: DEFAULT_FLUSH_INTERVAL,
			restart_min_delay: DEFAULT_RESTART_MIN_DELAY,
			restart_max_delay: DEFAULT_RESTART_MAX_DELAY,
			client_settings: RoomClientSettings::default(),
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RoomStatus {
	pub alias: String,
	pub room_id: Option<String>,
	pub state: ClientState,
}

#[derive(Debug, Clone, Copy)]
struct RestartPolicy {
	min: Duration,
	max: Duration,
}

struct ManagedRoom {
	client: RoomClient,
	watcher: JoinHandle<()>,
}

#[derive(Default)]
struct SupervisorInner {
	rooms: Vec<ManagedRoom>,
	flush: Option<(oneshot::Sender<()>, JoinHandle<()>)>,
}

/// Owns the room client fleet, restarts failed clients and batches chat
/// records into the shared flush buffer.
pub struct RoomSupervisor {
	cfg: SupervisorConfig,
	factory: ClientFactory,
	sink: Arc<dyn PersistenceSink>,
	buffer: Arc<FlushBuffer>,
	stopping: Arc<AtomicBool>,
	inner: Mutex<SupervisorInner>,
}

impl RoomSupervisor {
	pub fn new(cfg: SupervisorConfig, sink: Arc<dyn PersistenceSink>) -> Self {
		let settings = cfg.client_settings.clone();
		let factory: ClientFactory =
			Arc::new(move |room: RoomConfig| Ok(RoomClient::new(room, settings.clone())?));
		Self::with_client_factory(cfg, sink, factory)
	}

	pub fn with_client_factory(cfg: SupervisorConfig, sink: Arc<dyn PersistenceSink>, factory: ClientFactory) -> Self {
		Self {
			cfg,
			factory,
			sink,
			buffer: Arc::new(FlushBuffer::new()),
			stopping: Arc::new(AtomicBool::new(false)),
			inner: Mutex::new(SupervisorInner::default()),
		}
	}

	pub fn buffer(&self) -> &Arc<FlushBuffer> {
		&self.buffer
	}

	/// Start monitoring `rooms`. Aliases already monitored are skipped.
	///
	/// Every client is built before any is started, so a bad room config
	/// leaves the supervisor untouched.
	pub fn start(&self, rooms: Vec<RoomConfig>) -> anyhow::Result<()> {
		let mut inner = self.inner.lock();

		let mut seen: HashSet<String> = inner.rooms.iter().map(|r| r.client.alias().to_string()).collect();
		let mut clients = Vec::with_capacity(rooms.len());
		for room in rooms {
			if !seen.insert(room.alias.to_string()) {
				debug!(room = %room.alias, "room already monitored; skipping");
				continue;
			}
			clients.push((self.factory)(room)?);
		}

		if inner.flush.is_none() {
			let (shutdown_tx, shutdown_rx) = oneshot::channel();
			let handle = spawn_flush_task(
				Arc::clone(&self.buffer),
				Arc::clone(&self.sink),
				self.cfg.flush_interval,
				shutdown_rx,
			);
			inner.flush = Some((shutdown_tx, handle));
			info!(interval_secs = self.cfg.flush_interval.as_secs_f64(), "flush task started");
		}

		let policy = RestartPolicy {
			min: self.cfg.restart_min_delay,
			max: self.cfg.restart_max_delay,
		};
		for client in clients {
			let rx = client.subscribe();
			let watcher = spawn_room_watcher(
				client.clone(),
				rx,
				Arc::clone(&self.buffer),
				policy,
				Arc::clone(&self.stopping),
			);
			client.start();
			info!(room = %client.alias(), proxied = client.config().proxy.is_some(), "room client started");
			inner.rooms.push(ManagedRoom { client, watcher });
		}
		Ok(())
	}

	/// Run one flush cycle now.
	pub async fn flush_now(&self) -> FlushReport {
		flush_once(&self.buffer, self.sink.as_ref()).await
	}

	pub fn room_statuses(&self) -> Vec<RoomStatus> {
		self.inner
			.lock()
			.rooms
			.iter()
			.map(|r| RoomStatus {
				alias: r.client.alias().to_string(),
				room_id: r.client.room_id().map(|id| id.into_string()),
				state: r.client.state(),
			})
			.collect()
	}

	/// Stop every client, drain pending signals, stop the flush task and
	/// persist whatever is still buffered.
	pub async fn shutdown(&self) {
		self.stopping.store(true, Ordering::SeqCst);
		let (rooms, flush) = {
			let mut inner = self.inner.lock();
			(std::mem::take(&mut inner.rooms), inner.flush.take())
		};

		for room in &rooms {
			room.client.stop();
		}
		for room in rooms {
			let _ = room.watcher.await;
		}

		if let Some((shutdown_tx, handle)) = flush {
			let _ = shutdown_tx.send(());
			let _ = handle.await;
		}

		let report = self.flush_now().await;
		info!(flushed = report.attempted, failed = report.failed, "room supervisor stopped");
	}
}

/// Persistence tuple for a chat event. The payload's own room id wins over
/// the resolved one.
fn record_from_chat(client: &RoomClient, chat: ChatEvent) -> DanmuRecord {
	let room_id = chat
		.upstream_room_id()
		.or_else(|| client.room_id().map(|id| id.into_string()))
		.unwrap_or_default();
	DanmuRecord::new(room_id, chat.sender_id, chat.sender_name, chat.content, chat.timestamp_ms)
}

fn spawn_room_watcher(
	client: RoomClient,
	mut rx: RoomSignalRx,
	buffer: Arc<FlushBuffer>,
	policy: RestartPolicy,
	stopping: Arc<AtomicBool>,
) -> JoinHandle<()> {
	tokio::spawn(async move {
		let alias = client.alias().clone();
		let mut health = SessionHealth::default();
		let mut restart_at: Option<Instant> = None;

		loop {
			tokio::select! {
				signal = rx.recv() => {
					let Some(signal) = signal else {
						debug!(room = %alias, "room signal channel closed; watcher exiting");
						break;
					};

					match signal {
						RoomSignal::Connect(purpose) => {
							info!(room = %alias, channel = %purpose, "room channel connected");
							health.on_connect(purpose);
						}
						RoomSignal::Message(event) => {
							if let NormalizedEvent::Chat(chat) = *event {
								buffer.push(record_from_chat(&client, chat));
							}
						}
						RoomSignal::Error(err) => {
							warn!(room = %alias, kind = err.kind(), error = %err, "room client error");
							if restart_at.is_none() {
								restart_at = Some(Instant::now() + health.next_delay(policy));
							}
						}
						RoomSignal::Close => {
							info!(room = %alias, "room client closed");
							if restart_at.is_none() && !client.state().is_active() {
								restart_at = Some(Instant::now() + health.next_delay(policy));
							}
						}
					}
				}

				_ = tokio::time::sleep_until(restart_at.unwrap_or_else(Instant::now)), if restart_at.is_some() => {
					restart_at = None;
					if stopping.load(Ordering::SeqCst) {
						continue;
					}
					if client.state().is_active() {
						debug!(room = %alias, "restart skipped; client still active");
						continue;
					}
					let attempt = health.on_restart();
					metrics::counter!("danmu_room_restarts_total").increment(1);
					info!(room = %alias, attempt, "restarting room client");
					client.start();
					// shutdown may have stopped the client between the check above and start()
					if stopping.load(Ordering::SeqCst) {
						client.stop();
					}
				}
			}
		}
	})
}

/// Restart bookkeeping for one room.
///
/// The attempt counter only resets once a session had both channels up for at
/// least `restart_min_delay`, so a room whose second channel keeps failing still
/// backs off.
#[derive(Debug, Default)]
struct SessionHealth {
	failures: u32,
	connected: HashSet<ChannelPurpose>,
	healthy_since: Option<Instant>,
}

impl SessionHealth {
	fn on_connect(&mut self, purpose: ChannelPurpose) {
		self.connected.insert(purpose);
		if self.healthy_since.is_none() && ChannelPurpose::ALL.iter().all(|p| self.connected.contains(p)) {
			self.healthy_since = Some(Instant::now());
		}
	}

	fn next_delay(&mut self, policy: RestartPolicy) -> Duration {
		if self.healthy_since.is_some_and(|since| since.elapsed() >= policy.min) {
			self.failures = 0;
		}
		backoff_delay(self.failures, policy.min, policy.max)
	}

	fn on_restart(&mut self) -> u32 {
		self.connected.clear();
		self.healthy_since = None;
		self.failures = self.failures.saturating_add(1);
		self.failures
	}
}
