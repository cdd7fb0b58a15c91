use crate::{datetime_from_db_text, datetime_to_db_text, DbError, DbPool};
use chrono::{DateTime, Utc};
use sqlx::Row;

#[derive(Debug, Clone)]
pub struct ChannelRow {
    pub id: i64,
    pub name: String,
    pub owner_id: i64,
    pub avatar: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, sqlx::any::AnyRow> for ChannelRow {
    fn from_row(row: &'r sqlx::any::AnyRow) -> Result<Self, sqlx::Error> {
        let created_at_raw: String = row.try_get("created_at")?;
        Ok(Self {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            owner_id: row.try_get("owner_id")?,
            avatar: row.try_get("avatar")?,
            created_at: datetime_from_db_text(&created_at_raw)?,
        })
    }
}

pub async fn create_channel(
    pool: &DbPool,
    id: i64,
    name: &str,
    owner_id: i64,
) -> Result<ChannelRow, DbError> {
    let now = datetime_to_db_text(Utc::now());
    let mut tx = pool.begin().await?;
    let row = sqlx::query_as::<_, ChannelRow>(
        "INSERT INTO channels (id, name, owner_id, created_at)
         VALUES ($1, $2, $3, $4)
         RETURNING id, name, owner_id, avatar, created_at",
    )
    .bind(id)
    .bind(name)
    .bind(owner_id)
    .bind(&now)
    .fetch_one(&mut *tx)
    .await?;
    sqlx::query("INSERT INTO channel_members (channel_id, user_id, joined_at) VALUES ($1, $2, $3)")
        .bind(id)
        .bind(owner_id)
        .bind(&now)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    Ok(row)
}

pub async fn get_channel(pool: &DbPool, id: i64) -> Result<Option<ChannelRow>, DbError> {
    let row = sqlx::query_as::<_, ChannelRow>(
        "SELECT id, name, owner_id, avatar, created_at FROM channels WHERE id = $1",
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

pub async fn add_member(pool: &DbPool, channel_id: i64, user_id: i64) -> Result<bool, DbError> {
    let result = sqlx::query(
        "INSERT INTO channel_members (channel_id, user_id, joined_at)
         VALUES ($1, $2, $3)
         ON CONFLICT (channel_id, user_id) DO NOTHING",
    )
    .bind(channel_id)
    .bind(user_id)
    .bind(datetime_to_db_text(Utc::now()))
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn remove_member(pool: &DbPool, channel_id: i64, user_id: i64) -> Result<bool, DbError> {
    let result = sqlx::query("DELETE FROM channel_members WHERE channel_id = $1 AND user_id = $2")
        .bind(channel_id)
        .bind(user_id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn is_member(pool: &DbPool, channel_id: i64, user_id: i64) -> Result<bool, DbError> {
    let row: Option<(i64,)> = sqlx::query_as(
        "SELECT 1 FROM channel_members WHERE channel_id = $1 AND user_id = $2 LIMIT 1",
    )
    .bind(channel_id)
    .bind(user_id)
    .fetch_optional(pool)
    .await?;
    Ok(row.is_some())
}

pub async fn member_ids(pool: &DbPool, channel_id: i64) -> Result<Vec<i64>, DbError> {
    let rows: Vec<(i64,)> = sqlx::query_as(
        "SELECT user_id FROM channel_members WHERE channel_id = $1 ORDER BY user_id",
    )
    .bind(channel_id)
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(|(id,)| id).collect())
}
