//! Block gate.
//!
//! A block in either direction silences the direct lane between two users:
//! messages, pulses, and calls are all refused while the pair is blocked.
//! Group and channel traffic is not gated.

use palaver_db::DbPool;
use palaver_models::ServerEvent;

use crate::error::HubError;
use crate::presence::PresenceRegistry;

/// Fails with [`HubError::Forbidden`] when either user blocks the other.
pub async fn ensure_unblocked(db: &DbPool, a: i64, b: i64) -> Result<(), HubError> {
    if palaver_db::blocks::is_blocked_either(db, a, b).await? {
        return Err(HubError::forbidden("blocked"));
    }
    Ok(())
}

/// Records `blocker -> target`. Returns false when the block already existed.
/// A newly created block is announced to the other party if they are online.
pub async fn block(
    db: &DbPool,
    chat: &PresenceRegistry,
    blocker_id: i64,
    target_id: i64,
) -> Result<bool, HubError> {
    if blocker_id == target_id {
        return Err(HubError::validation("cannot block yourself"));
    }
    if palaver_db::users::get_user(db, target_id).await?.is_none() {
        return Err(HubError::not_found("user not found"));
    }

    let changed = palaver_db::blocks::block_user(db, blocker_id, target_id).await?;
    if changed {
        chat.send(
            target_id,
            ServerEvent::BlockedUpdate { user_id: blocker_id, blocked: true },
        );
    }
    Ok(changed)
}

/// Removes `blocker -> target`. Unblocking a user who was never blocked is a
/// no-op success.
pub async fn unblock(
    db: &DbPool,
    chat: &PresenceRegistry,
    blocker_id: i64,
    target_id: i64,
) -> Result<bool, HubError> {
    if blocker_id == target_id {
        return Err(HubError::validation("cannot unblock yourself"));
    }

    let changed = palaver_db::blocks::unblock_user(db, blocker_id, target_id).await?;
    if changed {
        chat.send(
            target_id,
            ServerEvent::BlockedUpdate { user_id: blocker_id, blocked: false },
        );
    }
    Ok(changed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::presence::EVENT_QUEUE_DEPTH;
    use tokio::sync::mpsc;

    async fn test_pool() -> DbPool {
        let pool = palaver_db::create_pool("sqlite::memory:", 1).await.unwrap();
        palaver_db::run_migrations(&pool).await.unwrap();
        palaver_db::users::create_user(&pool, 1, "+15550001", "alice").await.unwrap();
        palaver_db::users::create_user(&pool, 2, "+15550002", "bob").await.unwrap();
        pool
    }

    #[tokio::test]
    async fn block_gates_both_directions() {
        let pool = test_pool().await;
        let chat = PresenceRegistry::new("test");

        assert!(ensure_unblocked(&pool, 1, 2).await.is_ok());
        block(&pool, &chat, 1, 2).await.unwrap();

        assert!(matches!(
            ensure_unblocked(&pool, 1, 2).await,
            Err(HubError::Forbidden(_))
        ));
        assert!(matches!(
            ensure_unblocked(&pool, 2, 1).await,
            Err(HubError::Forbidden(_))
        ));
    }

    #[tokio::test]
    async fn self_block_is_rejected() {
        let pool = test_pool().await;
        let chat = PresenceRegistry::new("test");
        assert!(matches!(
            block(&pool, &chat, 1, 1).await,
            Err(HubError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn blocking_unknown_user_is_not_found() {
        let pool = test_pool().await;
        let chat = PresenceRegistry::new("test");
        assert!(matches!(
            block(&pool, &chat, 1, 404).await,
            Err(HubError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn other_party_is_notified_when_online() {
        let pool = test_pool().await;
        let chat = PresenceRegistry::new("test");
        let (tx, mut rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
        chat.register(2, tx);

        assert!(block(&pool, &chat, 1, 2).await.unwrap());
        match rx.recv().await.unwrap() {
            ServerEvent::BlockedUpdate { user_id, blocked } => {
                assert_eq!(user_id, 1);
                assert!(blocked);
            }
            other => panic!("unexpected event {other:?}"),
        }

        assert!(unblock(&pool, &chat, 1, 2).await.unwrap());
        match rx.recv().await.unwrap() {
            ServerEvent::BlockedUpdate { user_id, blocked } => {
                assert_eq!(user_id, 1);
                assert!(!blocked);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn repeat_block_and_idle_unblock_are_quiet() {
        let pool = test_pool().await;
        let chat = PresenceRegistry::new("test");
        let (tx, mut rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
        chat.register(2, tx);

        assert!(block(&pool, &chat, 1, 2).await.unwrap());
        let _ = rx.recv().await.unwrap();

        // Repeat block: no state change, no second notification.
        assert!(!block(&pool, &chat, 1, 2).await.unwrap());
        assert!(rx.try_recv().is_err());

        assert!(unblock(&pool, &chat, 1, 2).await.unwrap());
        let _ = rx.recv().await.unwrap();
        assert!(!unblock(&pool, &chat, 1, 2).await.unwrap());
        assert!(rx.try_recv().is_err());
    }
}
