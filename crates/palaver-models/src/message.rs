use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{id_str, id_str_opt};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Text,
    Voice,
    Image,
    Video,
    File,
    Location,
}

impl MessageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageKind::Text => "text",
            MessageKind::Voice => "voice",
            MessageKind::Image => "image",
            MessageKind::Video => "video",
            MessageKind::File => "file",
            MessageKind::Location => "location",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "text" => MessageKind::Text,
            "voice" => MessageKind::Voice,
            "image" => MessageKind::Image,
            "video" => MessageKind::Video,
            "file" => MessageKind::File,
            "location" => MessageKind::Location,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Sent,
    Delivered,
    Read,
}

impl MessageStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageStatus::Sent => "sent",
            MessageStatus::Delivered => "delivered",
            MessageStatus::Read => "read",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "sent" => MessageStatus::Sent,
            "delivered" => MessageStatus::Delivered,
            "read" => MessageStatus::Read,
            _ => return None,
        })
    }

    /// sent < delivered < read; status never moves down this ladder.
    pub fn rank(self) -> u8 {
        match self {
            MessageStatus::Sent => 0,
            MessageStatus::Delivered => 1,
            MessageStatus::Read => 2,
        }
    }
}

/// Where a message is headed. Payloads carry the three columns as optional
/// fields; `from_parts` normalizes them exactly once at the gateway boundary
/// so the engines only ever see a resolved target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatTarget {
    Direct { receiver_id: i64 },
    Group { group_id: i64 },
    Channel { channel_id: i64 },
}

impl ChatTarget {
    /// `None` unless exactly one of the three ids is set.
    pub fn from_parts(
        receiver_id: Option<i64>,
        group_id: Option<i64>,
        channel_id: Option<i64>,
    ) -> Option<Self> {
        match (receiver_id, group_id, channel_id) {
            (Some(id), None, None) => Some(ChatTarget::Direct { receiver_id: id }),
            (None, Some(id), None) => Some(ChatTarget::Group { group_id: id }),
            (None, None, Some(id)) => Some(ChatTarget::Channel { channel_id: id }),
            _ => None,
        }
    }
}

/// Declared kind of one entry in a media batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Image,
    Video,
    File,
}

impl MediaKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MediaKind::Image => "image",
            MediaKind::Video => "video",
            MediaKind::File => "file",
        }
    }

    pub fn message_kind(self) -> MessageKind {
        match self {
            MediaKind::Image => MessageKind::Image,
            MediaKind::Video => MessageKind::Video,
            MediaKind::File => MessageKind::File,
        }
    }
}

/// One already-uploaded blob in a `send_media` batch. The hub never touches
/// bytes; it stores and relays the upload's URL plus metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileMeta {
    pub url: String,
    pub kind: MediaKind,
    pub mime: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub size: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    #[serde(with = "id_str")]
    pub id: i64,
    #[serde(with = "id_str")]
    pub sender_id: i64,
    #[serde(default, with = "id_str_opt", skip_serializing_if = "Option::is_none")]
    pub receiver_id: Option<i64>,
    #[serde(default, with = "id_str_opt", skip_serializing_if = "Option::is_none")]
    pub group_id: Option<i64>,
    #[serde(default, with = "id_str_opt", skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<i64>,
    pub kind: MessageKind,
    /// Text body for text messages, payload URL for voice/media, label for
    /// location shares. Cleared by delete-for-everyone.
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_mime: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_size: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_secs: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latitude: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub longitude: Option<f64>,
    pub status: MessageStatus,
    #[serde(default, with = "id_str_opt", skip_serializing_if = "Option::is_none")]
    pub forwarded_from: Option<i64>,
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub fn target(&self) -> Option<ChatTarget> {
        ChatTarget::from_parts(self.receiver_id, self.group_id, self.channel_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_normalization_requires_exactly_one() {
        assert_eq!(
            ChatTarget::from_parts(Some(1), None, None),
            Some(ChatTarget::Direct { receiver_id: 1 })
        );
        assert_eq!(
            ChatTarget::from_parts(None, Some(2), None),
            Some(ChatTarget::Group { group_id: 2 })
        );
        assert_eq!(
            ChatTarget::from_parts(None, None, Some(3)),
            Some(ChatTarget::Channel { channel_id: 3 })
        );
        assert_eq!(ChatTarget::from_parts(None, None, None), None);
        assert_eq!(ChatTarget::from_parts(Some(1), Some(2), None), None);
        assert_eq!(ChatTarget::from_parts(Some(1), Some(2), Some(3)), None);
    }

    #[test]
    fn status_ladder_orders_upward() {
        assert!(MessageStatus::Sent.rank() < MessageStatus::Delivered.rank());
        assert!(MessageStatus::Delivered.rank() < MessageStatus::Read.rank());
    }
}
