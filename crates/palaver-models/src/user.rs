use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::id_str;

/// Public view of an account. The phone number doubles as the login handle;
/// profile CRUD lives outside the hub, so this is read-only here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    #[serde(with = "id_str")]
    pub id: i64,
    pub phone: String,
    pub username: String,
    pub avatar: Option<String>,
    pub about: Option<String>,
    pub online: bool,
    pub last_seen: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}
