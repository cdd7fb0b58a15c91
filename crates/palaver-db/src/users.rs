use crate::{bool_from_any_row, datetime_from_db_text, datetime_to_db_text, DbError, DbPool};
use chrono::{DateTime, Utc};
use sqlx::Row;

#[derive(Debug, Clone)]
pub struct UserRow {
    pub id: i64,
    pub phone: String,
    pub username: String,
    pub avatar: Option<String>,
    pub about: Option<String>,
    pub online: bool,
    pub last_seen: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, sqlx::any::AnyRow> for UserRow {
    fn from_row(row: &'r sqlx::any::AnyRow) -> Result<Self, sqlx::Error> {
        let last_seen_raw: Option<String> = row.try_get("last_seen")?;
        let created_at_raw: String = row.try_get("created_at")?;
        Ok(Self {
            id: row.try_get("id")?,
            phone: row.try_get("phone")?,
            username: row.try_get("username")?,
            avatar: row.try_get("avatar")?,
            about: row.try_get("about")?,
            online: bool_from_any_row(row, "online")?,
            last_seen: last_seen_raw
                .as_deref()
                .map(datetime_from_db_text)
                .transpose()?,
            created_at: datetime_from_db_text(&created_at_raw)?,
        })
    }
}

impl From<UserRow> for palaver_models::User {
    fn from(row: UserRow) -> Self {
        Self {
            id: row.id,
            phone: row.phone,
            username: row.username,
            avatar: row.avatar,
            about: row.about,
            online: row.online,
            last_seen: row.last_seen,
            created_at: row.created_at,
        }
    }
}

const USER_COLS: &str =
    "id, phone, username, avatar, about, online, last_seen, created_at";

pub async fn create_user(
    pool: &DbPool,
    id: i64,
    phone: &str,
    username: &str,
) -> Result<UserRow, DbError> {
    palaver_util::validation::validate_phone(phone)
        .map_err(|e| DbError::Invalid(format!("phone: {e}")))?;
    palaver_util::validation::validate_username(username)
        .map_err(|e| DbError::Invalid(format!("username: {e}")))?;
    let sql = format!(
        "INSERT INTO users (id, phone, username, created_at)
         VALUES ($1, $2, $3, $4)
         RETURNING {USER_COLS}"
    );
    let row = sqlx::query_as::<_, UserRow>(&sql)
        .bind(id)
        .bind(phone)
        .bind(username)
        .bind(datetime_to_db_text(Utc::now()))
        .fetch_one(pool)
        .await?;
    Ok(row)
}

pub async fn get_user(pool: &DbPool, id: i64) -> Result<Option<UserRow>, DbError> {
    let sql = format!("SELECT {USER_COLS} FROM users WHERE id = $1");
    let row = sqlx::query_as::<_, UserRow>(&sql)
        .bind(id)
        .fetch_optional(pool)
        .await?;
    Ok(row)
}

pub async fn get_user_by_phone(pool: &DbPool, phone: &str) -> Result<Option<UserRow>, DbError> {
    let sql = format!("SELECT {USER_COLS} FROM users WHERE phone = $1");
    let row = sqlx::query_as::<_, UserRow>(&sql)
        .bind(phone)
        .fetch_optional(pool)
        .await?;
    Ok(row)
}

/// Presence transition. Going offline stamps `last_seen`; coming online
/// leaves the previous stamp in place for "last seen" display while away.
pub async fn set_online(pool: &DbPool, id: i64, online: bool) -> Result<bool, DbError> {
    let result = if online {
        sqlx::query("UPDATE users SET online = $2 WHERE id = $1")
            .bind(id)
            .bind(online)
            .execute(pool)
            .await?
    } else {
        sqlx::query("UPDATE users SET online = $2, last_seen = $3 WHERE id = $1")
            .bind(id)
            .bind(online)
            .bind(datetime_to_db_text(Utc::now()))
            .execute(pool)
            .await?
    };
    Ok(result.rows_affected() > 0)
}
