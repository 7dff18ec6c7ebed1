#![forbid(unsafe_code)]

use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;
use std::time::SystemTime;

use anyhow::{Context, anyhow};
use livehub_domain::{BroadcastId, ProfileId};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::pipeline::stats::StatsSnapshot;
use crate::util::time::ms_to_system_time;

/// The single record a profile store keeps.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PersistedStats {
	pub snapshot: StatsSnapshot,
	pub identity: Option<BroadcastId>,
	pub started_at_ms: Option<i64>,
	/// When the record was taken; a quiet stream still advances it.
	pub last_seen_ms: i64,
}

impl PersistedStats {
	pub fn started_at(&self) -> Option<SystemTime> {
		self.started_at_ms.map(ms_to_system_time)
	}

	pub fn last_seen(&self) -> SystemTime {
		ms_to_system_time(self.last_seen_ms.max(self.snapshot.updated_at_ms))
	}
}

#[async_trait::async_trait]
pub trait StatsStore: Send + Sync {
	async fn load(&self) -> anyhow::Result<Option<PersistedStats>>;

	async fn save(&self, record: &PersistedStats) -> anyhow::Result<()>;
}

#[derive(Default)]
pub struct InMemoryStatsStore {
	inner: Mutex<Option<PersistedStats>>,
}

impl InMemoryStatsStore {
	pub fn with_record(record: PersistedStats) -> Self {
		Self {
			inner: Mutex::new(Some(record)),
		}
	}
}

#[async_trait::async_trait]
impl StatsStore for InMemoryStatsStore {
	async fn load(&self) -> anyhow::Result<Option<PersistedStats>> {
		Ok(self.inner.lock().await.clone())
	}

	async fn save(&self, record: &PersistedStats) -> anyhow::Result<()> {
		*self.inner.lock().await = Some(record.clone());
		Ok(())
	}
}

#[derive(Clone)]
pub struct SqlStatsStore {
	backend: SqlBackend,
}

#[derive(Clone)]
enum SqlBackend {
	Sqlite(sqlx::SqlitePool),
	Postgres(sqlx::PgPool),
	Mysql(sqlx::MySqlPool),
}

type Row = (i64, i64, i64, i64, i64, i64, i64, Option<String>, Option<i64>, i64);

const SELECT_ROW: &str = "SELECT viewers, likes, total_value, followers, shares, gifts, updated_at_ms, identity, started_at_ms, \
	last_seen_ms FROM stats_snapshot WHERE id = 1";

impl SqlStatsStore {
	pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
		if database_url.starts_with("sqlite:") {
			ensure_sqlite_parent_dir(database_url).await?;
			let pool = sqlx::SqlitePool::connect(database_url).await.context("connect sqlite")?;
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
		} else if database_url.starts_with("mysql:") || database_url.starts_with("mariadb:") {
			let pool = sqlx::MySqlPool::connect(database_url).await.context("connect mysql")?;
			sqlx::migrate!("migrations/mysql")
				.run(&pool)
				.await
				.context("run mysql migrations")?;
			Ok(Self {
				backend: SqlBackend::Mysql(pool),
			})
		} else {
			Err(anyhow!("unsupported database_url (use sqlite:, postgres:, mysql:)"))
		}
	}
}

#[async_trait::async_trait]
impl StatsStore for SqlStatsStore {
	async fn load(&self) -> anyhow::Result<Option<PersistedStats>> {
		let row: Option<Row> = match &self.backend {
			SqlBackend::Sqlite(pool) => sqlx::query_as(SELECT_ROW)
				.fetch_optional(pool)
				.await
				.context("select stats (sqlite)")?,
			SqlBackend::Postgres(pool) => sqlx::query_as(SELECT_ROW)
				.fetch_optional(pool)
				.await
				.context("select stats (postgres)")?,
			SqlBackend::Mysql(pool) => sqlx::query_as(SELECT_ROW)
				.fetch_optional(pool)
				.await
				.context("select stats (mysql)")?,
		};

		let Some((viewers, likes, total_value, followers, shares, gifts, updated_at_ms, identity, started_at_ms, last_seen_ms)) =
			row
		else {
			return Ok(None);
		};

		let identity = match identity.as_deref().map(BroadcastId::new).transpose() {
			Ok(id) => id,
			Err(e) => {
				warn!(error = %e, "ignoring invalid persisted identity");
				None
			}
		};

		Ok(Some(PersistedStats {
			snapshot: StatsSnapshot {
				viewers: from_db(viewers),
				likes: from_db(likes),
				total_value: from_db(total_value),
				followers: from_db(followers),
				shares: from_db(shares),
				gifts: from_db(gifts),
				updated_at_ms,
			},
			identity,
			started_at_ms,
			last_seen_ms,
		}))
	}

	async fn save(&self, record: &PersistedStats) -> anyhow::Result<()> {
		let s = &record.snapshot;
		let identity = record.identity.as_ref().map(|i| i.as_str().to_string());

		match &self.backend {
			SqlBackend::Sqlite(pool) => {
				sqlx::query(
					"INSERT INTO stats_snapshot \
					(id, viewers, likes, total_value, followers, shares, gifts, updated_at_ms, identity, started_at_ms, last_seen_ms) \
					VALUES (1, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
					ON CONFLICT(id) DO UPDATE SET viewers = excluded.viewers, likes = excluded.likes, \
					total_value = excluded.total_value, followers = excluded.followers, shares = excluded.shares, \
					gifts = excluded.gifts, updated_at_ms = excluded.updated_at_ms, identity = excluded.identity, \
					started_at_ms = excluded.started_at_ms, last_seen_ms = excluded.last_seen_ms",
				)
				.bind(to_db(s.viewers))
				.bind(to_db(s.likes))
				.bind(to_db(s.total_value))
				.bind(to_db(s.followers))
				.bind(to_db(s.shares))
				.bind(to_db(s.gifts))
				.bind(s.updated_at_ms)
				.bind(identity)
				.bind(record.started_at_ms)
				.bind(record.last_seen_ms)
				.execute(pool)
				.await
				.context("upsert stats (sqlite)")?;
			}
			SqlBackend::Postgres(pool) => {
				sqlx::query(
					"INSERT INTO stats_snapshot \
					(id, viewers, likes, total_value, followers, shares, gifts, updated_at_ms, identity, started_at_ms, last_seen_ms) \
					VALUES (1, $1, $2, $3, $4, $5, $6, $7, $8, $9, $10) \
					ON CONFLICT (id) DO UPDATE SET viewers = EXCLUDED.viewers, likes = EXCLUDED.likes, \
					total_value = EXCLUDED.total_value, followers = EXCLUDED.followers, shares = EXCLUDED.shares, \
					gifts = EXCLUDED.gifts, updated_at_ms = EXCLUDED.updated_at_ms, identity = EXCLUDED.identity, \
					started_at_ms = EXCLUDED.started_at_ms, last_seen_ms = EXCLUDED.last_seen_ms",
				)
				.bind(to_db(s.viewers))
				.bind(to_db(s.likes))
				.bind(to_db(s.total_value))
				.bind(to_db(s.followers))
				.bind(to_db(s.shares))
				.bind(to_db(s.gifts))
				.bind(s.updated_at_ms)
				.bind(identity)
				.bind(record.started_at_ms)
				.bind(record.last_seen_ms)
				.execute(pool)
				.await
				.context("upsert stats (postgres)")?;
			}
			SqlBackend::Mysql(pool) => {
				sqlx::query(
					"INSERT INTO stats_snapshot \
					(id, viewers, likes, total_value, followers, shares, gifts, updated_at_ms, identity, started_at_ms, last_seen_ms) \
					VALUES (1, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
					ON DUPLICATE KEY UPDATE viewers = VALUES(viewers), likes = VALUES(likes), \
					total_value = VALUES(total_value), followers = VALUES(followers), shares = VALUES(shares), \
					gifts = VALUES(gifts), updated_at_ms = VALUES(updated_at_ms), identity = VALUES(identity), \
					started_at_ms = VALUES(started_at_ms), last_seen_ms = VALUES(last_seen_ms)",
				)
				.bind(to_db(s.viewers))
				.bind(to_db(s.likes))
				.bind(to_db(s.total_value))
				.bind(to_db(s.followers))
				.bind(to_db(s.shares))
				.bind(to_db(s.gifts))
				.bind(s.updated_at_ms)
				.bind(identity)
				.bind(record.started_at_ms)
				.bind(record.last_seen_ms)
				.execute(pool)
				.await
				.context("upsert stats (mysql)")?;
			}
		}
		Ok(())
	}
}

fn to_db(v: u64) -> i64 {
	i64::try_from(v).unwrap_or(i64::MAX)
}

fn from_db(v: i64) -> u64 {
	u64::try_from(v).unwrap_or(0)
}

async fn ensure_sqlite_parent_dir(database_url: &str) -> anyhow::Result<()> {
	let path = database_url
		.trim_start_matches("sqlite://")
		.trim_start_matches("sqlite:");
	let path = path.split('?').next().unwrap_or_default();
	if path.is_empty() || path == ":memory:" {
		return Ok(());
	}
	if let Some(parent) = Path::new(path).parent()
		&& !parent.as_os_str().is_empty()
	{
		tokio::fs::create_dir_all(parent)
			.await
			.with_context(|| format!("create sqlite directory {}", parent.display()))?;
	}
	Ok(())
}

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Opens the isolated store that belongs to a profile.
pub type StoreOpener = Arc<dyn Fn(ProfileId) -> BoxFuture<'static, anyhow::Result<Arc<dyn StatsStore>>> + Send + Sync>;

/// Opener that connects `SqlStatsStore` at `url_template` with `{profile}` substituted.
pub fn sql_store_opener(url_template: String) -> StoreOpener {
	Arc::new(move |profile: ProfileId| {
		let url = url_template.replace("{profile}", profile.as_str());
		Box::pin(async move {
			debug!(profile = %profile, "opening profile store");
			let store = SqlStatsStore::connect(&url)
				.await
				.with_context(|| format!("open stats store for profile {profile}"))?;
			Ok(Arc::new(store) as Arc<dyn StatsStore>)
		}) as BoxFuture<'static, anyhow::Result<Arc<dyn StatsStore>>>
	})
}

/// Opener that gives each profile its own in-memory store for the process lifetime.
pub fn in_memory_store_opener() -> StoreOpener {
	let stores: Arc<std::sync::Mutex<std::collections::HashMap<ProfileId, Arc<InMemoryStatsStore>>>> =
		Arc::new(std::sync::Mutex::new(std::collections::HashMap::new()));
	Arc::new(move |profile: ProfileId| {
		let stores = Arc::clone(&stores);
		Box::pin(async move {
			let mut guard = stores.lock().map_err(|_| anyhow!("in-memory store registry poisoned"))?;
			let store = guard.entry(profile).or_default().clone();
			Ok(store as Arc<dyn StatsStore>)
		}) as BoxFuture<'static, anyhow::Result<Arc<dyn StatsStore>>>
	})
}

/// Serializes writes to one store and discards ones older than what was written.
#[derive(Clone)]
pub struct Persister {
	store: Arc<dyn StatsStore>,
	last_generation: Arc<Mutex<u64>>,
}

impl Persister {
	pub fn new(store: Arc<dyn StatsStore>) -> Self {
		Self {
			store,
			last_generation: Arc::new(Mutex::new(0)),
		}
	}

	pub fn store(&self) -> &Arc<dyn StatsStore> {
		&self.store
	}

	pub async fn write(&self, generation: u64, record: PersistedStats) -> anyhow::Result<()> {
		let mut last = self.last_generation.lock().await;
		if generation <= *last {
			return Ok(());
		}
		self.store.save(&record).await?;
		*last = generation;
		Ok(())
	}
}
