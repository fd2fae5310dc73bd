#![forbid(unsafe_code)]

use std::time::Duration;

use anyhow::{Context, anyhow};
use danmu_domain::RoomId;
use danmu_util::proxy::ProxyConfig;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_socks::tcp::Socks5Stream;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use url::Url;

use crate::ChannelPurpose;

/// Byte stream under a room websocket: plain TCP or a SOCKS5 tunnel.
pub trait WsIo: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> WsIo for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

pub type RoomWs = WebSocketStream<MaybeTlsStream<Box<dyn WsIo>>>;

/// Channel URL: `<base>?room_id=<id>&batch=1&group=0&connType=<1|2>`.
pub fn channel_url(base: &str, room_id: &RoomId, purpose: ChannelPurpose) -> anyhow::Result<Url> {
	let mut url = Url::parse(base).with_context(|| format!("invalid websocket base url {base:?}"))?;
	url.query_pairs_mut()
		.clear()
		.append_pair("room_id", room_id.as_str())
		.append_pair("batch", "1")
		.append_pair("group", "0")
		.append_pair("connType", &purpose.conn_type().to_string());
	Ok(url)
}

/// Open a websocket, tunnelling through `proxy` when set. The whole
/// TCP/SOCKS/handshake sequence is bounded by `timeout`.
pub async fn connect_room_ws(url: &Url, proxy: Option<&ProxyConfig>, timeout: Duration) -> anyhow::Result<RoomWs> {
	tokio::time::timeout(timeout, connect_inner(url, proxy))
		.await
		.map_err(|_| anyhow!("websocket handshake timed out after {}ms", timeout.as_millis()))?
}

async fn connect_inner(url: &Url, proxy: Option<&ProxyConfig>) -> anyhow::Result<RoomWs> {
	let host = url
		.host_str()
		.map(|h| h.trim_start_matches('[').trim_end_matches(']').to_string())
		.ok_or_else(|| anyhow!("websocket url has no host: {url}"))?;
	let port = url
		.port_or_known_default()
		.ok_or_else(|| anyhow!("websocket url has no port: {url}"))?;

	let io: Box<dyn WsIo> = match proxy {
		Some(proxy) => {
			let proxy_addr = proxy.hostport();
			let target = (host.as_str(), port);
			let stream = match proxy.credentials() {
				Some((user, pass)) => Socks5Stream::connect_with_password(proxy_addr.as_str(), target, user, pass).await,
				None => Socks5Stream::connect(proxy_addr.as_str(), target).await,
			}
			.with_context(|| format!("socks5 connect via {proxy_addr}"))?;
			Box::new(stream)
		}
		None => Box::new(
			TcpStream::connect((host.as_str(), port))
				.await
				.with_context(|| format!("tcp connect to {host}:{port}"))?,
		),
	};

	let (ws, _resp) = tokio_tungstenite::client_async_tls(url.as_str(), io)
		.await
		.context("websocket handshake")?;
	Ok(ws)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn builds_channel_urls() {
		let id = RoomId::new("1001").unwrap();
		let url = channel_url("ws://mbgows.plu.cn:8805/", &id, ChannelPurpose::Chat).unwrap();
		assert_eq!(
			url.as_str(),
			"ws://mbgows.plu.cn:8805/?room_id=1001&batch=1&group=0&connType=1"
		);

		let url = channel_url("ws://127.0.0.1:9/?stale=1", &id, ChannelPurpose::Other).unwrap();
		assert_eq!(url.query(), Some("room_id=1001&batch=1&group=0&connType=2"));
	}

	#[test]
	fn rejects_bad_base() {
		let id = RoomId::new("1").unwrap();
		assert!(channel_url("not a url", &id, ChannelPurpose::Chat).is_err());
	}
}
