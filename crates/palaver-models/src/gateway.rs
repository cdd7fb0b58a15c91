//! Wire protocol for the hub gateways.
//!
//! Every frame is a JSON object `{"type": <event name>, "data": {...}}`.
//! Event names and payload fields are snake_case; ids travel as strings.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::call::{CallChannel, CallPeer};
use crate::ids::{id_str, id_str_opt, id_str_vec};
use crate::message::{ChatTarget, FileMeta, Message};

// ── Client -> Server ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ClientEvent {
    // Session
    Join(JoinPayload),
    RequestOnlineUsers,

    // Chat hub
    SendMessage(SendMessagePayload),
    SendVoice(SendVoicePayload),
    SendMedia(SendMediaPayload),
    SendLocation(SendLocationPayload),
    ForwardMessage(ForwardPayload),
    ReadMessage(ReadPayload),
    DeleteMessage(DeletePayload),
    Typing(PulsePayload),
    RecordingAudio(PulsePayload),
    UploadingMedia(PulsePayload),
    BlockUser(BlockPayload),
    UnblockUser(BlockPayload),

    // Call hubs
    CallUser(CallOfferPayload),
    AcceptCall(CallAnswerPayload),
    RejectCall(CallRejectPayload),
    IceCandidate(IcePayload),
    EndCall,
}

impl ClientEvent {
    /// Event name as it appears in the frame's `type` field, for logging.
    pub fn name(&self) -> &'static str {
        match self {
            ClientEvent::Join(_) => "join",
            ClientEvent::RequestOnlineUsers => "request_online_users",
            ClientEvent::SendMessage(_) => "send_message",
            ClientEvent::SendVoice(_) => "send_voice",
            ClientEvent::SendMedia(_) => "send_media",
            ClientEvent::SendLocation(_) => "send_location",
            ClientEvent::ForwardMessage(_) => "forward_message",
            ClientEvent::ReadMessage(_) => "read_message",
            ClientEvent::DeleteMessage(_) => "delete_message",
            ClientEvent::Typing(_) => "typing",
            ClientEvent::RecordingAudio(_) => "recording_audio",
            ClientEvent::UploadingMedia(_) => "uploading_media",
            ClientEvent::BlockUser(_) => "block_user",
            ClientEvent::UnblockUser(_) => "unblock_user",
            ClientEvent::CallUser(_) => "call_user",
            ClientEvent::AcceptCall(_) => "accept_call",
            ClientEvent::RejectCall(_) => "reject_call",
            ClientEvent::IceCandidate(_) => "ice_candidate",
            ClientEvent::EndCall => "end_call",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JoinPayload {
    /// JWT; may instead arrive as the `token` query parameter on upgrade.
    #[serde(default)]
    pub token: Option<String>,
}

/// The three optional target columns as they appear on the wire. Exactly one
/// must be set; `resolve` is called once by the dispatcher and the engines
/// only ever see the resulting [`ChatTarget`].
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TargetParts {
    #[serde(default, with = "id_str_opt", skip_serializing_if = "Option::is_none")]
    pub receiver_id: Option<i64>,
    #[serde(default, with = "id_str_opt", skip_serializing_if = "Option::is_none")]
    pub group_id: Option<i64>,
    #[serde(default, with = "id_str_opt", skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<i64>,
}

impl TargetParts {
    pub fn resolve(self) -> Option<ChatTarget> {
        ChatTarget::from_parts(self.receiver_id, self.group_id, self.channel_id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendMessagePayload {
    #[serde(flatten)]
    pub target: TargetParts,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendVoicePayload {
    #[serde(flatten)]
    pub target: TargetParts,
    /// Upload URL of the recorded clip.
    pub url: String,
    pub duration_secs: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendMediaPayload {
    #[serde(flatten)]
    pub target: TargetParts,
    pub files: Vec<FileMeta>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendLocationPayload {
    #[serde(flatten)]
    pub target: TargetParts,
    pub latitude: f64,
    pub longitude: f64,
    /// Optional place label shown with the pin.
    #[serde(default)]
    pub label: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForwardPayload {
    #[serde(with = "id_str")]
    pub message_id: i64,
    #[serde(flatten)]
    pub target: TargetParts,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadPayload {
    #[serde(with = "id_str")]
    pub message_id: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeletePayload {
    #[serde(with = "id_str")]
    pub message_id: i64,
    #[serde(default)]
    pub for_everyone: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PulsePayload {
    #[serde(flatten)]
    pub target: TargetParts,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockPayload {
    #[serde(with = "id_str")]
    pub user_id: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallOfferPayload {
    #[serde(with = "id_str")]
    pub callee_id: i64,
    /// RTCSessionDescription, relayed as-is once its `sdp` field checks out.
    pub offer: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallAnswerPayload {
    #[serde(with = "id_str")]
    pub caller_id: i64,
    pub answer: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallRejectPayload {
    #[serde(with = "id_str")]
    pub caller_id: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IcePayload {
    #[serde(with = "id_str")]
    pub peer_id: i64,
    pub candidate: Value,
}

// ── Server -> Client ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    // Presence
    OnlineUsers {
        #[serde(with = "id_str_vec")]
        user_ids: Vec<i64>,
    },
    PresenceUpdate {
        #[serde(with = "id_str")]
        user_id: i64,
        online: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        last_seen: Option<chrono::DateTime<chrono::Utc>>,
    },

    // Message delivery
    ReceiveMessage { message: Message },
    ReceiveVoice { message: Message },
    ReceiveMedia { messages: Vec<Message> },
    ReceiveLocation { message: Message },
    MessageSent { message: Message },
    VoiceSent { message: Message },
    MediaSent { messages: Vec<Message> },
    LocationSent { message: Message },
    MessageForwarded { message: Message },
    MessageRead {
        #[serde(with = "id_str")]
        message_id: i64,
        #[serde(with = "id_str")]
        reader_id: i64,
    },
    MessageDeleted {
        #[serde(with = "id_str")]
        message_id: i64,
        for_everyone: bool,
    },

    // Presence pulses, relayed to the target conversation
    Typing(PulseEcho),
    RecordingAudio(PulseEcho),
    UploadingMedia(PulseEcho),

    // Blocking
    BlockedUpdate {
        #[serde(with = "id_str")]
        user_id: i64,
        blocked: bool,
    },

    // Call signaling
    IncomingCall {
        from: CallPeer,
        offer: Value,
        channel: CallChannel,
    },
    Calling {
        #[serde(with = "id_str")]
        callee_id: i64,
    },
    CallAccepted {
        #[serde(with = "id_str")]
        peer_id: i64,
        answer: Value,
    },
    CallRejected {
        #[serde(with = "id_str")]
        peer_id: i64,
    },
    UserBusy {
        #[serde(with = "id_str")]
        peer_id: i64,
    },
    IceCandidate {
        #[serde(with = "id_str")]
        from_id: i64,
        candidate: Value,
    },
    CallEnded {
        #[serde(with = "id_str")]
        peer_id: i64,
        reason: String,
    },

    // Per-operation failures; the connection always survives these
    JoinError { reason: String },
    MessageError { reason: String },
    VoiceError { reason: String },
    MediaError { reason: String },
    LocationError { reason: String },
    ForwardError { reason: String },
    ReadError { reason: String },
    DeleteError { reason: String },
    BlockError { reason: String },
    CallError { reason: String },
    Error { reason: String },
}

/// Who is typing/recording/uploading, and in which conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PulseEcho {
    #[serde(with = "id_str")]
    pub from_id: i64,
    #[serde(default, with = "id_str_opt", skip_serializing_if = "Option::is_none")]
    pub group_id: Option<i64>,
    #[serde(default, with = "id_str_opt", skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<i64>,
}

impl ServerEvent {
    /// Event name as it appears in the frame's `type` field, for logging.
    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::OnlineUsers { .. } => "online_users",
            ServerEvent::PresenceUpdate { .. } => "presence_update",
            ServerEvent::ReceiveMessage { .. } => "receive_message",
            ServerEvent::ReceiveVoice { .. } => "receive_voice",
            ServerEvent::ReceiveMedia { .. } => "receive_media",
            ServerEvent::ReceiveLocation { .. } => "receive_location",
            ServerEvent::MessageSent { .. } => "message_sent",
            ServerEvent::VoiceSent { .. } => "voice_sent",
            ServerEvent::MediaSent { .. } => "media_sent",
            ServerEvent::LocationSent { .. } => "location_sent",
            ServerEvent::MessageForwarded { .. } => "message_forwarded",
            ServerEvent::MessageRead { .. } => "message_read",
            ServerEvent::MessageDeleted { .. } => "message_deleted",
            ServerEvent::Typing(_) => "typing",
            ServerEvent::RecordingAudio(_) => "recording_audio",
            ServerEvent::UploadingMedia(_) => "uploading_media",
            ServerEvent::BlockedUpdate { .. } => "blocked_update",
            ServerEvent::IncomingCall { .. } => "incoming_call",
            ServerEvent::Calling { .. } => "calling",
            ServerEvent::CallAccepted { .. } => "call_accepted",
            ServerEvent::CallRejected { .. } => "call_rejected",
            ServerEvent::UserBusy { .. } => "user_busy",
            ServerEvent::IceCandidate { .. } => "ice_candidate",
            ServerEvent::CallEnded { .. } => "call_ended",
            ServerEvent::JoinError { .. } => "join_error",
            ServerEvent::MessageError { .. } => "message_error",
            ServerEvent::VoiceError { .. } => "voice_error",
            ServerEvent::MediaError { .. } => "media_error",
            ServerEvent::LocationError { .. } => "location_error",
            ServerEvent::ForwardError { .. } => "forward_error",
            ServerEvent::ReadError { .. } => "read_error",
            ServerEvent::DeleteError { .. } => "delete_error",
            ServerEvent::BlockError { .. } => "block_error",
            ServerEvent::CallError { .. } => "call_error",
            ServerEvent::Error { .. } => "error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_event_frames_decode() {
        let ev: ClientEvent = serde_json::from_str(
            r#"{"type":"send_message","data":{"receiver_id":"42","content":"hey"}}"#,
        )
        .unwrap();
        match ev {
            ClientEvent::SendMessage(p) => {
                assert_eq!(p.target.receiver_id, Some(42));
                assert_eq!(p.content, "hey");
            }
            other => panic!("wrong variant: {other:?}"),
        }

        // Unit events need no data object.
        let ev: ClientEvent = serde_json::from_str(r#"{"type":"request_online_users"}"#).unwrap();
        assert!(matches!(ev, ClientEvent::RequestOnlineUsers));
        let ev: ClientEvent = serde_json::from_str(r#"{"type":"end_call"}"#).unwrap();
        assert!(matches!(ev, ClientEvent::EndCall));
    }

    #[test]
    fn unknown_event_type_is_an_error() {
        assert!(serde_json::from_str::<ClientEvent>(r#"{"type":"self_destruct"}"#).is_err());
    }

    #[test]
    fn server_event_frames_are_tagged() {
        let frame = serde_json::to_value(ServerEvent::UserBusy { peer_id: 7 }).unwrap();
        assert_eq!(frame["type"], "user_busy");
        assert_eq!(frame["data"]["peer_id"], "7");
    }

    #[test]
    fn event_name_matches_wire_tag() {
        let ev = ServerEvent::CallEnded { peer_id: 1, reason: "timeout".into() };
        let frame = serde_json::to_value(&ev).unwrap();
        assert_eq!(frame["type"], ev.name());

        let ev = ClientEvent::ReadMessage(ReadPayload { message_id: 5 });
        let frame = serde_json::to_value(&ev).unwrap();
        assert_eq!(frame["type"], ev.name());
    }

    #[test]
    fn call_offer_keeps_sdp_opaque() {
        let ev: ClientEvent = serde_json::from_str(
            r#"{"type":"call_user","data":{"callee_id":"9","offer":{"type":"offer","sdp":"v=0..."}}}"#,
        )
        .unwrap();
        match ev {
            ClientEvent::CallUser(p) => {
                assert_eq!(p.callee_id, 9);
                assert_eq!(p.offer["sdp"], "v=0...");
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }
}
