use crate::{datetime_from_db_text, datetime_to_db_text, DbError, DbPool};
use chrono::{DateTime, Utc};
use sqlx::Row;

#[derive(Debug, Clone)]
pub struct GroupRow {
    pub id: i64,
    pub name: String,
    pub owner_id: i64,
    pub avatar: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, sqlx::any::AnyRow> for GroupRow {
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

/// Creates the group with the owner as its first member.
pub async fn create_group(
    pool: &DbPool,
    id: i64,
    name: &str,
    owner_id: i64,
) -> Result<GroupRow, DbError> {
    let now = datetime_to_db_text(Utc::now());
    let mut tx = pool.begin().await?;
    let row = sqlx::query_as::<_, GroupRow>(
        "INSERT INTO chat_groups (id, name, owner_id, created_at)
         VALUES ($1, $2, $3, $4)
         RETURNING id, name, owner_id, avatar, created_at",
    )
    .bind(id)
    .bind(name)
    .bind(owner_id)
    .bind(&now)
    .fetch_one(&mut *tx)
    .await?;
    sqlx::query("INSERT INTO chat_group_members (group_id, user_id, joined_at) VALUES ($1, $2, $3)")
        .bind(id)
        .bind(owner_id)
        .bind(&now)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    Ok(row)
}

pub async fn get_group(pool: &DbPool, id: i64) -> Result<Option<GroupRow>, DbError> {
    let row = sqlx::query_as::<_, GroupRow>(
        "SELECT id, name, owner_id, avatar, created_at FROM chat_groups WHERE id = $1",
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

pub async fn add_member(pool: &DbPool, group_id: i64, user_id: i64) -> Result<bool, DbError> {
    let result = sqlx::query(
        "INSERT INTO chat_group_members (group_id, user_id, joined_at)
         VALUES ($1, $2, $3)
         ON CONFLICT (group_id, user_id) DO NOTHING",
    )
    .bind(group_id)
    .bind(user_id)
    .bind(datetime_to_db_text(Utc::now()))
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn remove_member(pool: &DbPool, group_id: i64, user_id: i64) -> Result<bool, DbError> {
    let result =
        sqlx::query("DELETE FROM chat_group_members WHERE group_id = $1 AND user_id = $2")
            .bind(group_id)
            .bind(user_id)
            .execute(pool)
            .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn is_member(pool: &DbPool, group_id: i64, user_id: i64) -> Result<bool, DbError> {
    let row: Option<(i64,)> = sqlx::query_as(
        "SELECT 1 FROM chat_group_members WHERE group_id = $1 AND user_id = $2 LIMIT 1",
    )
    .bind(group_id)
    .bind(user_id)
    .fetch_optional(pool)
    .await?;
    Ok(row.is_some())
}

pub async fn member_ids(pool: &DbPool, group_id: i64) -> Result<Vec<i64>, DbError> {
    let rows: Vec<(i64,)> =
        sqlx::query_as("SELECT user_id FROM chat_group_members WHERE group_id = $1 ORDER BY user_id")
            .bind(group_id)
            .fetch_all(pool)
            .await?;
    Ok(rows.into_iter().map(|(id,)| id).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_pool() -> DbPool {
        let pool = crate::create_pool("sqlite::memory:", 1).await.unwrap();
        crate::run_migrations(&pool).await.unwrap();
        for (id, phone, name) in [
            (1, "+15550001", "alice"),
            (2, "+15550002", "bob"),
            (3, "+15550003", "carol"),
        ] {
            crate::users::create_user(&pool, id, phone, name).await.unwrap();
        }
        pool
    }

    #[tokio::test]
    async fn test_create_group_adds_owner() {
        let pool = test_pool().await;
        let group = create_group(&pool, 100, "holiday plans", 1).await.unwrap();
        assert_eq!(group.owner_id, 1);
        assert!(is_member(&pool, 100, 1).await.unwrap());
        assert_eq!(member_ids(&pool, 100).await.unwrap(), vec![1]);
    }

    #[tokio::test]
    async fn test_membership_roundtrip() {
        let pool = test_pool().await;
        create_group(&pool, 100, "g", 1).await.unwrap();
        assert!(add_member(&pool, 100, 2).await.unwrap());
        assert!(!add_member(&pool, 100, 2).await.unwrap());
        assert_eq!(member_ids(&pool, 100).await.unwrap(), vec![1, 2]);

        assert!(remove_member(&pool, 100, 2).await.unwrap());
        assert!(!is_member(&pool, 100, 2).await.unwrap());
        assert!(!remove_member(&pool, 100, 2).await.unwrap());
    }

    #[tokio::test]
    async fn test_non_member_is_not_member() {
        let pool = test_pool().await;
        create_group(&pool, 100, "g", 1).await.unwrap();
        assert!(!is_member(&pool, 100, 3).await.unwrap());
    }
}
