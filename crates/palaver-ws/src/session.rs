use palaver_core::presence::ConnId;

/// Per-connection identity, fixed at join time. The `conn_id` ties this
/// socket task to its registry slot so a superseded task cannot tear down
/// its successor's state.
pub struct Session {
    pub user_id: i64,
    pub conn_id: ConnId,
    pub session_id: String,
}

impl Session {
    pub fn new(user_id: i64, conn_id: ConnId) -> Self {
        Self {
            user_id,
            conn_id,
            session_id: uuid::Uuid::new_v4().to_string(),
        }
    }
}
