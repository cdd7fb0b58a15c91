use crate::{datetime_to_db_text, DbError, DbPool};
use chrono::Utc;

/// Record `blocker -> blocked`. Returns false when the pair already existed.
pub async fn block_user(pool: &DbPool, blocker_id: i64, blocked_id: i64) -> Result<bool, DbError> {
    let result = sqlx::query(
        "INSERT INTO blocks (blocker_id, blocked_id, created_at)
         VALUES ($1, $2, $3)
         ON CONFLICT (blocker_id, blocked_id) DO NOTHING",
    )
    .bind(blocker_id)
    .bind(blocked_id)
    .bind(datetime_to_db_text(Utc::now()))
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// Returns false when there was nothing to remove.
pub async fn unblock_user(
    pool: &DbPool,
    blocker_id: i64,
    blocked_id: i64,
) -> Result<bool, DbError> {
    let result = sqlx::query("DELETE FROM blocks WHERE blocker_id = $1 AND blocked_id = $2")
        .bind(blocker_id)
        .bind(blocked_id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}

/// True when either party blocks the other. Direct traffic between the two
/// is refused in both directions while this holds.
pub async fn is_blocked_either(pool: &DbPool, a: i64, b: i64) -> Result<bool, DbError> {
    let row: Option<(i64,)> = sqlx::query_as(
        "SELECT 1 FROM blocks
         WHERE (blocker_id = $1 AND blocked_id = $2)
            OR (blocker_id = $2 AND blocked_id = $1)
         LIMIT 1",
    )
    .bind(a)
    .bind(b)
    .fetch_optional(pool)
    .await?;
    Ok(row.is_some())
}

/// True when `blocker` has an active block against `blocked` (one direction).
pub async fn has_blocked(pool: &DbPool, blocker_id: i64, blocked_id: i64) -> Result<bool, DbError> {
    let row: Option<(i64,)> =
        sqlx::query_as("SELECT 1 FROM blocks WHERE blocker_id = $1 AND blocked_id = $2 LIMIT 1")
            .bind(blocker_id)
            .bind(blocked_id)
            .fetch_optional(pool)
            .await?;
    Ok(row.is_some())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_pool() -> DbPool {
        let pool = crate::create_pool("sqlite::memory:", 1).await.unwrap();
        crate::run_migrations(&pool).await.unwrap();
        crate::users::create_user(&pool, 1, "+15550001", "alice").await.unwrap();
        crate::users::create_user(&pool, 2, "+15550002", "bob").await.unwrap();
        pool
    }

    #[tokio::test]
    async fn test_block_is_idempotent() {
        let pool = test_pool().await;
        assert!(block_user(&pool, 1, 2).await.unwrap());
        assert!(!block_user(&pool, 1, 2).await.unwrap());
        assert!(is_blocked_either(&pool, 1, 2).await.unwrap());
    }

    #[tokio::test]
    async fn test_block_cuts_both_directions() {
        let pool = test_pool().await;
        block_user(&pool, 1, 2).await.unwrap();
        assert!(is_blocked_either(&pool, 1, 2).await.unwrap());
        assert!(is_blocked_either(&pool, 2, 1).await.unwrap());
        assert!(has_blocked(&pool, 1, 2).await.unwrap());
        assert!(!has_blocked(&pool, 2, 1).await.unwrap());
    }

    #[tokio::test]
    async fn test_unblock() {
        let pool = test_pool().await;
        block_user(&pool, 1, 2).await.unwrap();
        assert!(unblock_user(&pool, 1, 2).await.unwrap());
        assert!(!is_blocked_either(&pool, 1, 2).await.unwrap());
        // Unblocking again is a harmless no-op.
        assert!(!unblock_user(&pool, 1, 2).await.unwrap());
    }

    #[tokio::test]
    async fn test_unrelated_pair_is_clear() {
        let pool = test_pool().await;
        assert!(!is_blocked_either(&pool, 1, 2).await.unwrap());
    }
}
