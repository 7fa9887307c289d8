mod groups;
mod mates;
mod messages;
mod users;

use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};
use time::OffsetDateTime;

pub use groups::GroupRecord;
pub use mates::MateRecord;
pub use users::UserRecord;

#[cfg(test)]
pub(crate) use groups::sample_group;

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS messages (
        id TEXT PRIMARY KEY,
        group_id INTEGER NOT NULL,
        user_id INTEGER NOT NULL,
        body TEXT NOT NULL,
        sent_at INTEGER NOT NULL,
        kind TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS messages_by_group_time ON messages (group_id, sent_at, id)",
    "CREATE TABLE IF NOT EXISTS groups (
        id INTEGER PRIMARY KEY,
        leader_user_id INTEGER NOT NULL,
        name TEXT NOT NULL,
        category INTEGER NOT NULL,
        cycle INTEGER NOT NULL,
        frequency INTEGER NOT NULL,
        member_count_hint INTEGER NOT NULL,
        max_members INTEGER NOT NULL,
        retired INTEGER NOT NULL,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS mates (
        id INTEGER PRIMARY KEY,
        user_id INTEGER NOT NULL,
        group_id INTEGER NOT NULL,
        active INTEGER NOT NULL,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS mates_by_group ON mates (group_id)",
    "CREATE INDEX IF NOT EXISTS mates_by_user ON mates (user_id)",
    "CREATE TABLE IF NOT EXISTS users (
        id INTEGER PRIMARY KEY,
        nickname TEXT NOT NULL,
        state INTEGER NOT NULL,
        image_url TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS events (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        topic TEXT NOT NULL,
        payload BLOB NOT NULL,
        attempts INTEGER NOT NULL DEFAULT 0,
        leased_until INTEGER NOT NULL DEFAULT 0
    )",
];

/// Durable storage for messages and the local group/mate/user replica.
#[derive(Debug, Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self, sqlx::Error> {
        let mut options = SqlitePoolOptions::new().max_connections(max_connections);
        if url.contains(":memory:") {
            // every connection to :memory: is its own database
            options = options
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None);
        }

        let store = Self::new(options.connect(url).await?);
        store.migrate().await?;
        Ok(store)
    }

    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn migrate(&self) -> Result<(), sqlx::Error> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }
}

/// Nanoseconds since the epoch, clamped to what an `INTEGER` column holds
/// (roughly 1677 to 2262).
pub(crate) fn to_db_time(ts: OffsetDateTime) -> i64 {
    ts.unix_timestamp_nanos()
        .clamp(i128::from(i64::MIN), i128::from(i64::MAX)) as i64
}

pub(crate) fn from_db_time(nanos: i64) -> Result<OffsetDateTime, sqlx::Error> {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(nanos))
        .map_err(|err| sqlx::Error::Decode(Box::new(err)))
}

#[cfg(test)]
pub(crate) async fn memory_store() -> Store {
    Store::connect("sqlite::memory:", 1).await.unwrap()
}
