#![forbid(unsafe_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use danmu_domain::{DanmuRecord, RoomAlias, RoomId};
use danmu_platform::longzhu::{LongzhuEndpoints, MetadataResolver, RoomClient, RoomClientSettings};
use danmu_platform::{ClientState, GiftCatalog, ResolutionError, RoomConfig};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{Instant, sleep, timeout};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;

use crate::server::sink::{PersistenceSink, SinkError};
use crate::server::supervisor::{ClientFactory, RoomSupervisor, SupervisorConfig};

const WAIT: Duration = Duration::from_secs(3);

#[derive(Default)]
struct RecordingSink {
	records: Mutex<Vec<DanmuRecord>>,
	calls: AtomicUsize,
}

#[async_trait]
impl PersistenceSink for RecordingSink {
	async fn append(&self, record: &DanmuRecord) -> Result<(), SinkError> {
		self.calls.fetch_add(1, Ordering::SeqCst);
		self.records.lock().push(record.clone());
		Ok(())
	}
}

struct FakeResolver {
	room_id: &'static str,
	failures_left: AtomicUsize,
	resolve_calls: AtomicUsize,
}

impl FakeResolver {
	fn new(room_id: &'static str, failures: usize) -> Arc<Self> {
		Arc::new(Self {
			room_id,
			failures_left: AtomicUsize::new(failures),
			resolve_calls: AtomicUsize::new(0),
		})
	}
}

#[async_trait]
impl MetadataResolver for FakeResolver {
	async fn resolve_room_id(&self, alias: &RoomAlias) -> Result<RoomId, ResolutionError> {
		self.resolve_calls.fetch_add(1, Ordering::SeqCst);
		let failing = self
			.failures_left
			.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
			.is_ok();
		if failing {
			return Err(ResolutionError::RoomIdRequest {
				alias: alias.to_string(),
				detail: "connection refused".to_string(),
			});
		}
		Ok(RoomId::new(self.room_id).unwrap())
	}

	async fn fetch_gift_catalog(&self) -> Result<GiftCatalog, ResolutionError> {
		Ok(GiftCatalog::new())
	}
}

type ServerWs = WebSocketStream<TcpStream>;

async fn spawn_room_server() -> (String, mpsc::UnboundedReceiver<ServerWs>) {
	let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
	let addr = listener.local_addr().unwrap();
	let (tx, rx) = mpsc::unbounded_channel();
	tokio::spawn(async move {
		while let Ok((tcp, _)) = listener.accept().await {
			if let Ok(ws) = tokio_tungstenite::accept_async(tcp).await
				&& tx.send(ws).is_err()
			{
				break;
			}
		}
	});
	(format!("ws://{addr}/"), rx)
}

type CreatedClients = Arc<Mutex<Vec<RoomClient>>>;

fn supervisor(ws_url: String, resolver: Arc<FakeResolver>, sink: Arc<RecordingSink>, flush: Duration) -> RoomSupervisor {
	let restart = (Duration::from_millis(10), Duration::from_millis(40));
	supervisor_with(ws_url, resolver, sink, flush, restart).0
}

fn supervisor_with(
	ws_url: String,
	resolver: Arc<FakeResolver>,
	sink: Arc<RecordingSink>,
	flush: Duration,
	(restart_min_delay, restart_max_delay): (Duration, Duration),
) -> (RoomSupervisor, CreatedClients) {
	let settings = RoomClientSettings {
		endpoints: LongzhuEndpoints {
			ws_url,
			..LongzhuEndpoints::default()
		},
		request_timeout: WAIT,
		..RoomClientSettings::default()
	};
	let cfg = SupervisorConfig {
		flush_interval: flush,
		restart_min_delay,
		restart_max_delay,
		client_settings: settings.clone(),
	};
	let created = CreatedClients::default();
	let factory: ClientFactory = {
		let created = Arc::clone(&created);
		Arc::new(move |room: RoomConfig| {
			let client = RoomClient::with_resolver(
				room,
				settings.clone(),
				Arc::clone(&resolver) as Arc<dyn MetadataResolver>,
			);
			created.lock().push(client.clone());
			Ok(client)
		})
	};
	(RoomSupervisor::with_client_factory(cfg, sink, factory), created)
}

/// Accepts the chat channel and refuses the auxiliary one. Returns the number
/// of TCP connections seen so far.
async fn spawn_chat_only_server() -> (String, Arc<AtomicUsize>) {
	let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
	let addr = listener.local_addr().unwrap();
	let accepted = Arc::new(AtomicUsize::new(0));
	let counter = Arc::clone(&accepted);
	tokio::spawn(async move {
		while let Ok((tcp, _)) = listener.accept().await {
			counter.fetch_add(1, Ordering::SeqCst);
			tokio::spawn(async move {
				let callback = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
					if req.uri().query().unwrap_or_default().contains("connType=2") {
						let mut denied = ErrorResponse::new(Some("auxiliary channel disabled".to_string()));
						*denied.status_mut() = StatusCode::FORBIDDEN;
						return Err(denied);
					}
					Ok(resp)
				};
				if let Ok(mut ws) = tokio_tungstenite::accept_hdr_async(tcp, callback).await {
					while let Some(Ok(_)) = ws.next().await {}
				}
			});
		}
	});
	(format!("ws://{addr}/"), accepted)
}

fn room(alias: &str) -> RoomConfig {
	RoomConfig::new(RoomAlias::new(alias).unwrap())
}

async fn wait_until(what: &str, cond: impl Fn() -> bool) {
	let deadline = Instant::now() + WAIT;
	while !cond() {
		assert!(Instant::now() < deadline, "timed out waiting for {what}");
		sleep(Duration::from_millis(10)).await;
	}
}

async fn accept_pair(conns: &mut mpsc::UnboundedReceiver<ServerWs>) -> Vec<ServerWs> {
	let mut pair = Vec::new();
	while pair.len() < 2 {
		let ws = timeout(WAIT, conns.recv())
			.await
			.expect("timed out waiting for room connection")
			.expect("server stopped");
		pair.push(ws);
	}
	pair
}

#[tokio::test]
async fn chat_events_are_flushed_exactly_once() {
	let (url, mut conns) = spawn_room_server().await;
	let sink = Arc::new(RecordingSink::default());
	let sup = supervisor(url, FakeResolver::new("1001", 0), Arc::clone(&sink), Duration::from_secs(3600));

	sup.start(vec![room("roomA")]).unwrap();
	let mut pair = accept_pair(&mut conns).await;
	wait_until("connected", || {
		sup.room_statuses().first().map(|s| s.state) == Some(ClientState::Connected)
	})
	.await;

	let chat = r#"{"id":1,"type":"chat","msg":{"user":{"uid":9,"username":"bob"},"content":"hello","time":"/Date(1700000000000)/","RoomId":1001}}"#;
	let gift = r#"{"id":2,"type":"gift","msg":{"itemType":"g1","number":1}}"#;
	pair[0].send(Message::Text(gift.into())).await.unwrap();
	pair[0].send(Message::Text(chat.into())).await.unwrap();

	let buffer = Arc::clone(sup.buffer());
	wait_until("buffered chat", || buffer.len() == 1).await;

	let report = sup.flush_now().await;
	assert_eq!(report.attempted, 1);
	assert_eq!(report.failed, 0);
	assert!(buffer.is_empty());
	assert_eq!(
		sink.records.lock().clone(),
		vec![DanmuRecord::new("1001", "9", "bob", "hello", 1_700_000_000_000)]
	);

	let report = sup.flush_now().await;
	assert_eq!(report.attempted, 0);
	assert_eq!(sink.calls.load(Ordering::SeqCst), 1);

	sup.shutdown().await;
}

#[tokio::test]
async fn room_id_falls_back_to_resolved_id() {
	let (url, mut conns) = spawn_room_server().await;
	let sink = Arc::new(RecordingSink::default());
	let sup = supervisor(url, FakeResolver::new("555", 0), Arc::clone(&sink), Duration::from_secs(3600));

	sup.start(vec![room("roomB")]).unwrap();
	let mut pair = accept_pair(&mut conns).await;
	wait_until("connected", || {
		sup.room_statuses().first().map(|s| s.state) == Some(ClientState::Connected)
	})
	.await;

	let chat = r#"[{"id":1,"type":"chat","msg":{"user":{"uid":"7","username":"amy"},"content":"a"}},{"id":2,"type":"chat","msg":{"user":{"uid":"8","username":"ben"},"content":"b"}}]"#;
	pair[1].send(Message::Text(chat.into())).await.unwrap();

	let buffer = Arc::clone(sup.buffer());
	wait_until("buffered chats", || buffer.len() == 2).await;
	sup.flush_now().await;

	let records = sink.records.lock().clone();
	assert_eq!(records.len(), 2);
	assert!(records.iter().all(|r| r.room_id == "555"));
	assert_eq!(records[0].content, "a");
	assert_eq!(records[1].content, "b");

	let statuses = sup.room_statuses();
	assert_eq!(statuses[0].alias, "roomB");
	assert_eq!(statuses[0].room_id.as_deref(), Some("555"));

	sup.shutdown().await;
}

#[tokio::test]
async fn failed_clients_are_restarted_until_they_connect() {
	let (url, mut conns) = spawn_room_server().await;
	let resolver = FakeResolver::new("1001", 3);
	let sup = supervisor(
		url,
		Arc::clone(&resolver),
		Arc::new(RecordingSink::default()),
		Duration::from_secs(3600),
	);

	sup.start(vec![room("roomA")]).unwrap();
	let _pair = accept_pair(&mut conns).await;
	wait_until("connected", || {
		sup.room_statuses().first().map(|s| s.state) == Some(ClientState::Connected)
	})
	.await;
	assert_eq!(resolver.resolve_calls.load(Ordering::SeqCst), 4);

	sup.shutdown().await;
}

#[tokio::test]
async fn closed_channel_triggers_reconnect() {
	let (url, mut conns) = spawn_room_server().await;
	let resolver = FakeResolver::new("1001", 0);
	let sup = supervisor(
		url,
		Arc::clone(&resolver),
		Arc::new(RecordingSink::default()),
		Duration::from_secs(3600),
	);

	sup.start(vec![room("roomA")]).unwrap();
	let mut pair = accept_pair(&mut conns).await;
	pair[0].close(None).await.unwrap();

	let _second = accept_pair(&mut conns).await;
	wait_until("reconnected", || {
		sup.room_statuses().first().map(|s| s.state) == Some(ClientState::Connected)
	})
	.await;
	assert_eq!(resolver.resolve_calls.load(Ordering::SeqCst), 1);

	sup.shutdown().await;
}

#[tokio::test]
async fn duplicate_rooms_are_ignored() {
	let (url, _conns) = spawn_room_server().await;
	let sup = supervisor(
		url,
		FakeResolver::new("1001", 0),
		Arc::new(RecordingSink::default()),
		Duration::from_secs(3600),
	);

	sup.start(vec![room("roomA"), room("roomA")]).unwrap();
	sup.start(vec![room("roomA"), room("roomC")]).unwrap();
	let aliases: Vec<String> = sup.room_statuses().into_iter().map(|s| s.alias).collect();
	assert_eq!(aliases, vec!["roomA", "roomC"]);

	sup.shutdown().await;
}

#[tokio::test]
async fn periodic_flush_runs_without_manual_trigger() {
	let sink = Arc::new(RecordingSink::default());
	let sup = supervisor(
		"ws://127.0.0.1:9/".to_string(),
		FakeResolver::new("1", 0),
		Arc::clone(&sink),
		Duration::from_millis(50),
	);
	sup.start(Vec::new()).unwrap();

	sup.buffer().push(DanmuRecord::new("1", "2", "c", "d", 5));
	wait_until("periodic flush", || sink.calls.load(Ordering::SeqCst) == 1).await;
	assert!(sup.buffer().is_empty());

	sleep(Duration::from_millis(150)).await;
	assert_eq!(sink.calls.load(Ordering::SeqCst), 1);

	sup.shutdown().await;
}

#[tokio::test]
async fn shutdown_flushes_leftovers_and_stops_clients() {
	let (url, mut conns) = spawn_room_server().await;
	let sink = Arc::new(RecordingSink::default());
	let sup = supervisor(url, FakeResolver::new("1001", 0), Arc::clone(&sink), Duration::from_secs(3600));

	sup.start(vec![room("roomA")]).unwrap();
	let _pair = accept_pair(&mut conns).await;
	sup.buffer().push(DanmuRecord::new("1001", "1", "x", "bye", 9));

	timeout(WAIT, sup.shutdown()).await.expect("shutdown hung");
	assert_eq!(sink.records.lock().len(), 1);
	assert!(sup.room_statuses().is_empty());
}

#[tokio::test]
async fn half_open_room_backs_off_between_restarts() {
	let (url, accepted) = spawn_chat_only_server().await;
	let (sup, _) = supervisor_with(
		url,
		FakeResolver::new("1001", 0),
		Arc::new(RecordingSink::default()),
		Duration::from_secs(3600),
		(Duration::from_millis(200), Duration::from_millis(400)),
	);

	sup.start(vec![room("roomA")]).unwrap();
	sleep(Duration::from_secs(1)).await;

	// two connections per session: t=0, immediate retry, then +200ms, +400ms, +400ms
	let connections = accepted.load(Ordering::SeqCst);
	assert!(connections >= 4, "room was never restarted ({connections} connections)");
	assert!(connections <= 16, "{connections} connections in 1s with a 200ms minimum delay");

	sup.shutdown().await;
}

#[tokio::test]
async fn shutdown_during_restart_loop_leaves_no_running_client() {
	let resolver = FakeResolver::new("1001", usize::MAX);
	let (sup, created) = supervisor_with(
		"ws://127.0.0.1:9/".to_string(),
		Arc::clone(&resolver),
		Arc::new(RecordingSink::default()),
		Duration::from_secs(3600),
		(Duration::ZERO, Duration::ZERO),
	);

	sup.start(vec![room("roomA"), room("roomB"), room("roomC")]).unwrap();
	wait_until("restart loop", || resolver.resolve_calls.load(Ordering::SeqCst) > 30).await;

	timeout(WAIT, sup.shutdown()).await.expect("shutdown hung");
	let clients = created.lock().clone();
	assert_eq!(clients.len(), 3);
	assert!(clients.iter().all(|c| !c.state().is_active()));

	let calls = resolver.resolve_calls.load(Ordering::SeqCst);
	sleep(Duration::from_millis(100)).await;
	assert!(clients.iter().all(|c| !c.state().is_active()));
	assert_eq!(resolver.resolve_calls.load(Ordering::SeqCst), calls);
}
