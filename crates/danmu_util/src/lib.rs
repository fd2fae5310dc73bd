#![forbid(unsafe_code)]

pub mod proxy {
	use std::fmt;

	/// Port used when a proxy is configured without one.
	pub const DEFAULT_PROXY_PORT: u16 = 8080;

	const SCHEMES: [&str; 3] = ["socks5h://", "socks5://", "socks://"];

	/// Outbound SOCKS5 proxy settings.
	#[derive(Clone, PartialEq, Eq, Hash)]
	pub struct ProxyConfig {
		pub host: String,
		pub port: Option<u16>,
		pub username: Option<String>,
		pub password: Option<String>,
	}

	impl ProxyConfig {
		pub fn new(host: impl Into<String>, port: Option<u16>) -> Self {
			Self {
				host: host.into(),
				port,
				username: None,
				password: None,
			}
		}

		pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
			self.username = Some(username.into());
			self.password = Some(password.into());
			self
		}

		pub fn port_or_default(&self) -> u16 {
			self.port.unwrap_or(DEFAULT_PROXY_PORT)
		}

		/// Returns `host:port` (IPv6 stays bracketed).
		pub fn hostport(&self) -> String {
			format!("{}:{}", self.host, self.port_or_default())
		}

		/// Credentials are only used when both halves are present.
		pub fn credentials(&self) -> Option<(&str, &str)> {
			match (self.username.as_deref(), self.password.as_deref()) {
				(Some(user), Some(pass)) if !user.is_empty() && !pass.is_empty() => Some((user, pass)),
				_ => None,
			}
		}

		/// Render as `socks5h://[user:pass@]host:port` (DNS resolved by the proxy).
		pub fn socks_url(&self) -> String {
			match self.credentials() {
				Some((user, pass)) => format!("socks5h://{user}:{pass}@{}", self.hostport()),
				None => format!("socks5h://{}", self.hostport()),
			}
		}

		/// Parse `socks5://[user:pass@]host[:port]`; `socks://` and `socks5h://` are accepted too.
		pub fn parse(s: &str) -> Result<Self, String> {
			let s = s.trim();
			if s.is_empty() {
				return Err("proxy must be non-empty (expected socks5://host:port)".to_string());
			}

			let rest = SCHEMES
				.iter()
				.find_map(|scheme| s.strip_prefix(scheme))
				.ok_or_else(|| format!("invalid proxy (expected socks5://host:port): {s}"))?;

			let rest = rest.trim_end_matches('/');
			if rest.contains('/') || rest.contains('?') || rest.contains('#') {
				return Err(format!("invalid proxy (expected socks5://host:port without path/query): {s}"));
			}

			let (auth, hostport) = match rest.rsplit_once('@') {
				Some((auth, hostport)) => (Some(auth), hostport),
				None => (None, rest),
			};

			let (host, port) = split_host_port(hostport).map_err(|e| format!("{e}: {s}"))?;

			let mut cfg = ProxyConfig::new(host, port);
			if let Some(auth) = auth {
				let (user, pass) = auth
					.split_once(':')
					.ok_or_else(|| format!("invalid proxy credentials (expected user:pass@): {s}"))?;
				cfg = cfg.with_credentials(user, pass);
			}
			Ok(cfg)
		}
	}

	fn split_host_port(hostport: &str) -> Result<(String, Option<u16>), String> {
		let hostport = hostport.trim();
		if hostport.is_empty() {
			return Err("invalid proxy host".to_string());
		}

		if hostport.starts_with('[') {
			let end = hostport.find(']').ok_or_else(|| "unterminated IPv6 proxy host".to_string())?;
			let host = &hostport[..=end];
			let tail = &hostport[end + 1..];
			if tail.is_empty() {
				return Ok((host.to_string(), None));
			}
			let port = tail.strip_prefix(':').ok_or_else(|| "invalid proxy port".to_string())?;
			return Ok((host.to_string(), Some(parse_port(port)?)));
		}

		if hostport.matches(':').count() > 1 {
			return Err("IPv6 proxy host must be bracketed like [::1]:1080".to_string());
		}

		match hostport.split_once(':') {
			Some((host, port)) if !host.is_empty() => Ok((host.to_string(), Some(parse_port(port)?))),
			Some(_) => Err("invalid proxy host".to_string()),
			None => Ok((hostport.to_string(), None)),
		}
	}

	fn parse_port(port: &str) -> Result<u16, String> {
		match port.trim().parse::<u16>() {
			Ok(0) | Err(_) => Err("invalid proxy port (expected 1..=65535)".to_string()),
			Ok(p) => Ok(p),
		}
	}

	impl fmt::Debug for ProxyConfig {
		fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
			f.debug_struct("ProxyConfig")
				.field("host", &self.host)
				.field("port", &self.port)
				.field("username", &self.username)
				.field("password", &self.password.as_ref().map(|_| "<redacted>"))
				.finish()
		}
	}

}

pub mod time {
	use std::time::{Duration, SystemTime, UNIX_EPOCH};

	/// Current Unix time in milliseconds.
	#[inline]
	pub fn unix_ms_now() -> i64 {
		SystemTime::now()
			.duration_since(UNIX_EPOCH)
			.unwrap_or(Duration::from_secs(0))
			.as_millis() as i64
	}

	/// Exponential backoff: `min * 2^attempt`, clamped to `[min, max]`. Attempt 0 is immediate.
	pub fn backoff_delay(attempt: u32, min: Duration, max: Duration) -> Duration {
		if attempt == 0 {
			return Duration::ZERO;
		}
		let pow = (attempt - 1).min(16);
		let ms = min.as_millis().saturating_mul(1u128 << pow);
		let d = Duration::from_millis(ms.min(u64::MAX as u128) as u64);
		d.min(max).max(min)
	}

}
