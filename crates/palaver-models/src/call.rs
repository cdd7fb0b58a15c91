use serde::{Deserialize, Serialize};

use crate::ids::id_str;

/// Which signaling hub a call belongs to. Audio and video run as two
/// independent engine instances with identical semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallChannel {
    Audio,
    Video,
}

impl CallChannel {
    pub fn as_str(self) -> &'static str {
        match self {
            CallChannel::Audio => "audio",
            CallChannel::Video => "video",
        }
    }
}

/// Caller identity shown to a ringing callee. SDP blobs are relayed opaque;
/// this is the only call payload the hub actually assembles itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallPeer {
    #[serde(with = "id_str")]
    pub id: i64,
    pub username: String,
    pub avatar: Option<String>,
}
