use thiserror::Error;

/// Failure taxonomy for hub operations. The dispatcher maps each variant to
/// the operation's `*_error` event (or `user_busy`); none of them ever
/// terminate the connection.
#[derive(Debug, Error)]
pub enum HubError {
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    Forbidden(String),
    #[error("{0}")]
    NotFound(String),
    /// Call conflict; surfaces as `user_busy` rather than a reason string.
    #[error("user is busy")]
    Busy { peer_id: i64 },
    /// Target connection vanished mid-operation, after partial state was
    /// rolled back.
    #[error("{0}")]
    Unavailable(String),
    #[error("database error: {0}")]
    Database(#[from] palaver_db::DbError),
    #[error("internal error: {0}")]
    Internal(String),
}

impl HubError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn forbidden(msg: impl Into<String>) -> Self {
        Self::Forbidden(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::Unavailable(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Wire-facing reason. Internal causes are collapsed to a generic string;
    /// the real error goes to the log, not the client.
    pub fn reason(&self) -> String {
        match self {
            HubError::Validation(msg)
            | HubError::Forbidden(msg)
            | HubError::NotFound(msg)
            | HubError::Unavailable(msg) => msg.clone(),
            HubError::Busy { .. } => "user is busy".to_string(),
            HubError::Database(_) | HubError::Internal(_) => "internal error".to_string(),
        }
    }

    pub fn is_internal(&self) -> bool {
        matches!(self, HubError::Database(_) | HubError::Internal(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn internal_causes_are_not_leaked() {
        let err = HubError::Internal("pool exhausted at shard 3".to_string());
        assert_eq!(err.reason(), "internal error");
        assert!(err.is_internal());

        let err = HubError::validation("latitude out of range");
        assert_eq!(err.reason(), "latitude out of range");
        assert!(!err.is_internal());
    }
}
