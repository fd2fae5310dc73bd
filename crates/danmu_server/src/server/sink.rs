#![forbid(unsafe_code)]

use std::str::FromStr;

use anyhow::{Context, anyhow};
use async_trait::async_trait;
use danmu_domain::DanmuRecord;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum SinkError {
	#[error("database error: {0}")]
	Database(#[from] sqlx::Error),
}

/// Destination for flushed chat records. Called once per record.
#[async_trait]
pub trait PersistenceSink: Send + Sync + 'static {
	async fn append(&self, record: &DanmuRecord) -> Result<(), SinkError>;
}

/// SQL-backed sink. Appends are idempotent on the full record tuple.
#[derive(Clone)]
pub struct SqlDanmuSink {
	backend: SqlBackend,
}

#[derive(Clone)]
enum SqlBackend {
	Sqlite(sqlx::SqlitePool),
	Postgres(sqlx::PgPool),
}

impl SqlDanmuSink {
	pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
		if database_url.starts_with("sqlite:") {
			let options = SqliteConnectOptions::from_str(database_url)
				.context("parse sqlite url")?
				.create_if_missing(true);
			// In-memory databases are per connection.
			let pool = SqlitePoolOptions::new()
				.max_connections(1)
				.connect_with(options)
				.await
				.context("connect sqlite")?;
			sqlx::migrate!("migrations/sqlite")
				.run(&pool)
				.await
				.context("run sqlite migrations")?;

			Ok(Self {
				backend: SqlBackend::Sqlite(pool),
			})
		} else if database_url.starts_with("postgres:") || database_url.starts_with("postgresql:") {
			let pool = sqlx::PgPool::connect(database_url).await.context("connect postgres")?;
			sqlx::migrate!("migrations/postgres")
				.run(&pool)
				.await
				.context("run postgres migrations")?;

			Ok(Self {
				backend: SqlBackend::Postgres(pool),
			})
		} else {
			Err(anyhow!("unsupported database_url (use sqlite: or postgres:)"))
		}
	}

	#[cfg(test)]
	async fn count(&self) -> Result<i64, SinkError> {
		let (n,): (i64,) = match &self.backend {
			SqlBackend::Sqlite(pool) => sqlx::query_as("SELECT COUNT(*) FROM danmu").fetch_one(pool).await?,
			SqlBackend::Postgres(pool) => sqlx::query_as("SELECT COUNT(*) FROM danmu").fetch_one(pool).await?,
		};
		Ok(n)
	}
}

#[async_trait]
impl PersistenceSink for SqlDanmuSink {
	async fn append(&self, record: &DanmuRecord) -> Result<(), SinkError> {
		match &self.backend {
			SqlBackend::Sqlite(pool) => {
				sqlx::query(
					"INSERT INTO danmu (room_id, sender_id, sender_name, content, timestamp_ms) VALUES (?, ?, ?, ?, ?) ON CONFLICT DO NOTHING",
				)
				.bind(&record.room_id)
				.bind(&record.sender_id)
				.bind(&record.sender_name)
				.bind(&record.content)
				.bind(record.timestamp_ms)
				.execute(pool)
				.await?;
			}
			SqlBackend::Postgres(pool) => {
				sqlx::query(
					"INSERT INTO danmu (room_id, sender_id, sender_name, content, timestamp_ms) VALUES ($1, $2, $3, $4, $5) ON CONFLICT DO NOTHING",
				)
				.bind(&record.room_id)
				.bind(&record.sender_id)
				.bind(&record.sender_name)
				.bind(&record.content)
				.bind(record.timestamp_ms)
				.execute(pool)
				.await?;
			}
		}
		Ok(())
	}
}

/// Sink used when persistence is disabled.
#[derive(Debug, Clone, Default)]
pub struct LogSink;

#[async_trait]
impl PersistenceSink for LogSink {
	async fn append(&self, record: &DanmuRecord) -> Result<(), SinkError> {
		debug!(
			room_id = %record.room_id,
			sender_id = %record.sender_id,
			sender_name = %record.sender_name,
			timestamp_ms = record.timestamp_ms,
			content = %record.content,
			"danmu record"
		);
		Ok(())
	}
}
