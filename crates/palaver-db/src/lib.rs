pub mod blocks;
pub mod channels;
pub mod groups;
pub mod messages;
pub mod users;

use sqlx::any::AnyPoolOptions;
use std::sync::OnceLock;
use thiserror::Error;

pub type DbPool = sqlx::AnyPool;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatabaseEngine {
    Sqlite,
    Postgres,
}

impl DatabaseEngine {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sqlite => "sqlite",
            Self::Postgres => "postgres",
        }
    }
}

static ACTIVE_DB_ENGINE: OnceLock<DatabaseEngine> = OnceLock::new();

#[derive(Debug, Error)]
pub enum DbError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("not found")]
    NotFound,
    #[error("{0}")]
    Invalid(String),
}

pub async fn create_pool(database_url: &str, max_connections: u32) -> Result<DbPool, sqlx::Error> {
    let engine = detect_database_engine(database_url)?;
    let _ = ACTIVE_DB_ENGINE.set(engine);

    // Required once before using sqlx::Any.
    sqlx::any::install_default_drivers();

    let connect_url = if matches!(engine, DatabaseEngine::Sqlite) {
        normalize_sqlite_url_for_any(database_url)
    } else {
        database_url.to_string()
    };

    AnyPoolOptions::new()
        .max_connections(max_connections)
        .after_connect(move |conn, _meta| {
            Box::pin(async move {
                if matches!(engine, DatabaseEngine::Sqlite) {
                    // Tune SQLite for concurrent access.
                    sqlx::query("PRAGMA journal_mode = WAL;")
                        .execute(&mut *conn)
                        .await?;
                    sqlx::query("PRAGMA foreign_keys = ON;")
                        .execute(&mut *conn)
                        .await?;
                    sqlx::query("PRAGMA busy_timeout = 5000;")
                        .execute(&mut *conn)
                        .await?;
                    sqlx::query("PRAGMA synchronous = NORMAL;")
                        .execute(&mut *conn)
                        .await?;
                } else {
                    sqlx::query("SET lock_timeout = '10s'")
                        .execute(&mut *conn)
                        .await?;
                    sqlx::query("SET timezone = 'UTC'")
                        .execute(&mut *conn)
                        .await?;
                }
                Ok(())
            })
        })
        .connect(&connect_url)
        .await
}

pub async fn run_migrations(pool: &DbPool) -> Result<(), sqlx::Error> {
    run_migrations_for_engine(pool, active_database_engine()).await
}

pub async fn run_migrations_for_engine(
    pool: &DbPool,
    engine: DatabaseEngine,
) -> Result<(), sqlx::Error> {
    match engine {
        DatabaseEngine::Sqlite => sqlx::migrate!("./migrations").run(pool).await?,
        DatabaseEngine::Postgres => sqlx::migrate!("./migrations_pg").run(pool).await?,
    }
    tracing::info!("migrations: applied successfully");
    Ok(())
}

pub fn detect_database_engine(database_url: &str) -> Result<DatabaseEngine, sqlx::Error> {
    let normalized = database_url.trim().to_ascii_lowercase();
    if normalized.starts_with("sqlite:") {
        Ok(DatabaseEngine::Sqlite)
    } else if normalized.starts_with("postgres://") || normalized.starts_with("postgresql://") {
        Ok(DatabaseEngine::Postgres)
    } else {
        Err(sqlx::Error::Configuration(
            format!("unsupported database URL scheme in '{}'", database_url).into(),
        ))
    }
}

pub fn active_database_engine() -> DatabaseEngine {
    *ACTIVE_DB_ENGINE.get().unwrap_or(&DatabaseEngine::Sqlite)
}

fn normalize_sqlite_url_for_any(url: &str) -> String {
    // sqlx::Any expects absolute Windows paths in the sqlite:///C:/... form
    // (three slashes), while configs often carry sqlite://C:/... (two).
    if !url.starts_with("sqlite://") {
        return url.to_string();
    }
    let rest = &url["sqlite://".len()..];
    if rest.starts_with('/') {
        return url.to_string();
    }
    let bytes = rest.as_bytes();
    if bytes.len() >= 2 && bytes[1] == b':' && bytes[0].is_ascii_alphabetic() {
        format!("sqlite:///{rest}")
    } else {
        url.to_string()
    }
}

pub(crate) fn datetime_to_db_text(value: chrono::DateTime<chrono::Utc>) -> String {
    value.format("%Y-%m-%d %H:%M:%S").to_string()
}

pub(crate) fn datetime_from_db_text(
    value: &str,
) -> Result<chrono::DateTime<chrono::Utc>, sqlx::Error> {
    use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};

    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Ok(dt.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S") {
        return Ok(Utc.from_utc_datetime(&naive));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S%.f") {
        return Ok(Utc.from_utc_datetime(&naive));
    }

    Err(sqlx::Error::Protocol(format!(
        "invalid datetime text '{}'",
        value
    )))
}

/// `deleted_for` and other id lists are stored as JSON arrays in text columns.
pub(crate) fn ids_to_db_text(ids: &[i64]) -> String {
    serde_json::to_string(ids).unwrap_or_else(|_| "[]".to_string())
}

pub(crate) fn ids_from_db_text(value: &str) -> Result<Vec<i64>, sqlx::Error> {
    serde_json::from_str(value)
        .map_err(|e| sqlx::Error::Protocol(format!("invalid id list text: {e}")))
}

pub(crate) fn bool_from_any_row(
    row: &sqlx::any::AnyRow,
    column: &str,
) -> Result<bool, sqlx::Error> {
    use sqlx::Row;
    let first_err = match row.try_get::<bool, _>(column) {
        Ok(value) => return Ok(value),
        Err(err) => err,
    };

    if let Ok(raw) = row.try_get::<i64, _>(column) {
        return Ok(raw != 0);
    }
    if let Ok(raw) = row.try_get::<i32, _>(column) {
        return Ok(raw != 0);
    }
    if let Ok(raw) = row.try_get::<i16, _>(column) {
        return Ok(raw != 0);
    }

    Err(first_err)
}

#[cfg(test)]
mod tests {
    use super::{create_pool, run_migrations, run_migrations_for_engine, DatabaseEngine};
    use palaver_models::{ChatTarget, MessageKind};

    #[tokio::test]
    async fn create_pool_supports_default_sqlite_mode() {
        let pool = create_pool("sqlite::memory:", 1).await.expect("pool");
        let value: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&pool)
            .await
            .expect("query");
        assert_eq!(value, 1);
    }

    #[tokio::test]
    async fn rejects_unknown_url_scheme() {
        let err = create_pool("mysql://nope", 1).await.expect_err("must fail");
        assert!(matches!(err, sqlx::Error::Configuration(_)));
    }

    #[tokio::test]
    async fn datetime_text_roundtrip() {
        let now = chrono::Utc::now();
        let text = super::datetime_to_db_text(now);
        let parsed = super::datetime_from_db_text(&text).expect("parse");
        assert_eq!(parsed.timestamp(), now.timestamp());
    }

    #[tokio::test]
    async fn postgres_pool_and_migrations_smoke_when_configured() {
        let Some(url) = std::env::var("PALAVER_TEST_POSTGRES_URL")
            .ok()
            .filter(|value| !value.trim().is_empty())
        else {
            return;
        };

        let pool = create_pool(&url, 5).await.expect("postgres pool");
        run_migrations_for_engine(&pool, DatabaseEngine::Postgres)
            .await
            .expect("postgres migrations");

        let seed = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("clock drift")
            .as_millis() as i64;
        let alice = 9_000_000_000_000_i64 + seed;
        let bob = alice + 1;

        crate::users::create_user(&pool, alice, &format!("+1555{seed}"), "alice")
            .await
            .expect("create alice");
        crate::users::create_user(&pool, bob, &format!("+1556{seed}"), "bob")
            .await
            .expect("create bob");

        let msg = crate::messages::create_message(
            &pool,
            &crate::messages::NewMessage::text(
                alice + 2,
                alice,
                ChatTarget::Direct { receiver_id: bob },
                "postgres smoke",
            ),
        )
        .await
        .expect("create message");
        assert_eq!(msg.kind, MessageKind::Text);

        let fetched = crate::messages::get_message(&pool, msg.id)
            .await
            .expect("get message")
            .expect("message exists");
        assert_eq!(fetched.content, "postgres smoke");
    }

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let pool = create_pool("sqlite::memory:", 1).await.expect("pool");
        run_migrations(&pool).await.expect("first run");
        run_migrations(&pool).await.expect("second run");
    }
}
