//! Message delivery engine.
//!
//! Stateless pipeline over the store and the chat presence registry: resolve
//! the target to a recipient set, validate the payload, persist with
//! `status='sent'`, fan out to whoever is online, and promote to `delivered`
//! when at least one push landed. The acknowledgement returned to the caller
//! always carries the post-fan-out status.
//!
//! The `sender_id` threaded through every operation is the session's
//! authenticated user id; nothing client-supplied can override it.

use chrono::Utc;

use palaver_db::messages::{MessageRow, NewMessage};
use palaver_models::{
    ChatTarget, FileMeta, Message, MessageStatus, PulseEcho, ServerEvent,
};

use crate::error::HubError;
use crate::AppState;

/// Delete-for-everyone is only honored this long after the message was sent.
const DELETE_FOR_EVERYONE_WINDOW_SECS: i64 = 3600;

const MAX_VOICE_SECS: i64 = 180;
const MAX_MEDIA_BATCH: usize = 10;

pub async fn send_text(
    state: &AppState,
    sender_id: i64,
    target: ChatTarget,
    content: &str,
) -> Result<Message, HubError> {
    let content = content.trim();
    palaver_util::validation::validate_message_content(content)
        .map_err(|e| HubError::validation(format!("message content: {e}")))?;

    let recipients = resolve_recipients(state, sender_id, target).await?;
    let new = NewMessage::text(next_id(state), sender_id, target, content);
    let row = palaver_db::messages::create_message(&state.db, &new).await?;
    Ok(fan_out(state, row, &recipients).await?.into_message())
}

pub async fn send_voice(
    state: &AppState,
    sender_id: i64,
    target: ChatTarget,
    url: &str,
    duration_secs: i64,
) -> Result<Message, HubError> {
    if url.trim().is_empty() {
        return Err(HubError::validation("voice payload URL is required"));
    }
    if !(1..=MAX_VOICE_SECS).contains(&duration_secs) {
        return Err(HubError::validation(format!(
            "voice duration must be between 1 and {MAX_VOICE_SECS} seconds"
        )));
    }

    let recipients = resolve_recipients(state, sender_id, target).await?;
    let new = NewMessage {
        kind: palaver_models::MessageKind::Voice,
        content: url,
        duration_secs: Some(duration_secs),
        ..NewMessage::text(next_id(state), sender_id, target, "")
    };
    let row = palaver_db::messages::create_message(&state.db, &new).await?;
    Ok(fan_out(state, row, &recipients).await?.into_message())
}

/// Stores the whole batch atomically, then fans it out as one
/// `receive_media` event per recipient.
pub async fn send_media(
    state: &AppState,
    sender_id: i64,
    target: ChatTarget,
    files: &[FileMeta],
) -> Result<Vec<Message>, HubError> {
    validate_media_batch(files)?;
    let recipients = resolve_recipients(state, sender_id, target).await?;

    let batch: Vec<NewMessage<'_>> = files
        .iter()
        .map(|file| NewMessage {
            kind: file.kind.message_kind(),
            content: &file.url,
            file_name: file.name.as_deref(),
            file_mime: Some(file.mime.as_str()),
            file_size: file.size,
            ..NewMessage::text(next_id(state), sender_id, target, "")
        })
        .collect();
    let rows = palaver_db::messages::create_message_batch(&state.db, &batch).await?;

    let mut messages: Vec<Message> = rows.into_iter().map(MessageRow::into_message).collect();
    let mut reached = false;
    for recipient in &recipients {
        if state
            .chat
            .send(*recipient, ServerEvent::ReceiveMedia { messages: messages.clone() })
        {
            reached = true;
        }
    }
    if reached {
        for message in &mut messages {
            if palaver_db::messages::mark_delivered(&state.db, message.id).await? {
                message.status = MessageStatus::Delivered;
            }
        }
    }
    Ok(messages)
}

pub async fn send_location(
    state: &AppState,
    sender_id: i64,
    target: ChatTarget,
    latitude: f64,
    longitude: f64,
    label: Option<&str>,
) -> Result<Message, HubError> {
    if !(-90.0..=90.0).contains(&latitude) {
        return Err(HubError::validation("latitude must be between -90 and 90"));
    }
    if !(-180.0..=180.0).contains(&longitude) {
        return Err(HubError::validation("longitude must be between -180 and 180"));
    }

    let recipients = resolve_recipients(state, sender_id, target).await?;
    let new = NewMessage {
        kind: palaver_models::MessageKind::Location,
        latitude: Some(latitude),
        longitude: Some(longitude),
        ..NewMessage::text(next_id(state), sender_id, target, label.unwrap_or(""))
    };
    let row = palaver_db::messages::create_message(&state.db, &new).await?;
    Ok(fan_out(state, row, &recipients).await?.into_message())
}

/// Copies an existing message to a new target as a fresh send. The copy keeps
/// the root author in `forwarded_from`, so re-forwarding a forward still
/// credits whoever wrote the original.
pub async fn forward_message(
    state: &AppState,
    sender_id: i64,
    message_id: i64,
    target: ChatTarget,
) -> Result<Message, HubError> {
    let original = visible_message(state, sender_id, message_id).await?;
    if is_tombstone(&original) {
        return Err(HubError::not_found("message not found"));
    }

    let recipients = resolve_recipients(state, sender_id, target).await?;
    let new = NewMessage {
        kind: original.kind,
        content: &original.content,
        file_name: original.file_name.as_deref(),
        file_mime: original.file_mime.as_deref(),
        file_size: original.file_size,
        duration_secs: original.duration_secs,
        latitude: original.latitude,
        longitude: original.longitude,
        forwarded_from: Some(original.forwarded_from.unwrap_or(original.sender_id)),
        ..NewMessage::text(next_id(state), sender_id, target, "")
    };
    let row = palaver_db::messages::create_message(&state.db, &new).await?;
    Ok(fan_out(state, row, &recipients).await?.into_message())
}

/// Promotes the message to `read` and tells the sender who read it. Only a
/// recipient may do this; re-reading is a quiet success.
pub async fn mark_read(
    state: &AppState,
    reader_id: i64,
    message_id: i64,
) -> Result<(), HubError> {
    let row = visible_message(state, reader_id, message_id).await?;
    if row.sender_id == reader_id {
        return Err(HubError::forbidden("cannot mark your own message as read"));
    }

    if palaver_db::messages::mark_read(&state.db, message_id).await? {
        state.chat.send(
            row.sender_id,
            ServerEvent::MessageRead { message_id, reader_id },
        );
    }
    Ok(())
}

/// Delete for me hides the row from the caller only. Delete for everyone
/// tombstones it and notifies every online participant; only the sender may
/// do that, and only within the post-send window.
pub async fn delete_message(
    state: &AppState,
    caller_id: i64,
    message_id: i64,
    for_everyone: bool,
) -> Result<(), HubError> {
    let row = visible_message(state, caller_id, message_id).await?;

    if !for_everyone {
        palaver_db::messages::add_deleted_for(&state.db, message_id, caller_id).await?;
        return Ok(());
    }

    if row.sender_id != caller_id {
        return Err(HubError::forbidden("only the sender can delete for everyone"));
    }
    let age_secs = Utc::now().signed_duration_since(row.created_at).num_seconds();
    if age_secs > DELETE_FOR_EVERYONE_WINDOW_SECS {
        return Err(HubError::forbidden("delete for everyone window has expired"));
    }
    if is_tombstone(&row) {
        return Ok(());
    }

    palaver_db::messages::tombstone_message(&state.db, message_id)
        .await?
        .ok_or_else(|| HubError::not_found("message not found"))?;

    let target = row
        .target()
        .ok_or_else(|| HubError::internal("message row without target"))?;
    for recipient in participants(state, caller_id, target).await? {
        state.chat.send(
            recipient,
            ServerEvent::MessageDeleted { message_id, for_everyone: true },
        );
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PulseKind {
    Typing,
    Recording,
    Uploading,
}

impl PulseKind {
    fn event(self, echo: PulseEcho) -> ServerEvent {
        match self {
            PulseKind::Typing => ServerEvent::Typing(echo),
            PulseKind::Recording => ServerEvent::RecordingAudio(echo),
            PulseKind::Uploading => ServerEvent::UploadingMedia(echo),
        }
    }
}

/// Relays a typing/recording/uploading pulse to the conversation. Pulses are
/// best-effort: blocked pairs, non-membership, and offline peers all drop the
/// pulse without a word back to the sender.
pub async fn pulse(
    state: &AppState,
    from_id: i64,
    target: ChatTarget,
    kind: PulseKind,
) -> Result<(), HubError> {
    match target {
        ChatTarget::Direct { receiver_id } => {
            if palaver_db::blocks::is_blocked_either(&state.db, from_id, receiver_id).await? {
                return Ok(());
            }
            let echo = PulseEcho { from_id, group_id: None, channel_id: None };
            state.chat.send(receiver_id, kind.event(echo));
        }
        ChatTarget::Group { group_id } => {
            if !palaver_db::groups::is_member(&state.db, group_id, from_id).await? {
                return Ok(());
            }
            let echo = PulseEcho { from_id, group_id: Some(group_id), channel_id: None };
            for member in palaver_db::groups::member_ids(&state.db, group_id).await? {
                if member != from_id {
                    state.chat.send(member, kind.event(echo.clone()));
                }
            }
        }
        ChatTarget::Channel { channel_id } => {
            if !palaver_db::channels::is_member(&state.db, channel_id, from_id).await? {
                return Ok(());
            }
            let echo = PulseEcho { from_id, group_id: None, channel_id: Some(channel_id) };
            for member in palaver_db::channels::member_ids(&state.db, channel_id).await? {
                if member != from_id {
                    state.chat.send(member, kind.event(echo.clone()));
                }
            }
        }
    }
    Ok(())
}

/// The `receive_*` event a stored message raises on the recipient side.
pub fn receive_event(message: &Message) -> ServerEvent {
    use palaver_models::MessageKind::*;
    match message.kind {
        Text => ServerEvent::ReceiveMessage { message: message.clone() },
        Voice => ServerEvent::ReceiveVoice { message: message.clone() },
        Location => ServerEvent::ReceiveLocation { message: message.clone() },
        Image | Video | File => ServerEvent::ReceiveMedia { messages: vec![message.clone()] },
    }
}

fn next_id(state: &AppState) -> i64 {
    palaver_util::snowflake::generate(state.config.worker_id)
}

/// Expands the target into the set of user ids that should receive the
/// message, enforcing existence, membership, and the block gate.
async fn resolve_recipients(
    state: &AppState,
    sender_id: i64,
    target: ChatTarget,
) -> Result<Vec<i64>, HubError> {
    match target {
        ChatTarget::Direct { receiver_id } => {
            if palaver_db::users::get_user(&state.db, receiver_id).await?.is_none() {
                return Err(HubError::not_found("user not found"));
            }
            crate::blocks::ensure_unblocked(&state.db, sender_id, receiver_id).await?;
            Ok(vec![receiver_id])
        }
        ChatTarget::Group { group_id } => {
            if !palaver_db::groups::is_member(&state.db, group_id, sender_id).await? {
                return Err(HubError::forbidden("not a member of this group"));
            }
            Ok(palaver_db::groups::member_ids(&state.db, group_id)
                .await?
                .into_iter()
                .filter(|id| *id != sender_id)
                .collect())
        }
        ChatTarget::Channel { channel_id } => {
            if !palaver_db::channels::is_member(&state.db, channel_id, sender_id).await? {
                return Err(HubError::forbidden("not a member of this channel"));
            }
            Ok(palaver_db::channels::member_ids(&state.db, channel_id)
                .await?
                .into_iter()
                .filter(|id| *id != sender_id)
                .collect())
        }
    }
}

/// All users who can see a stored message, minus `except`.
async fn participants(
    state: &AppState,
    except: i64,
    target: ChatTarget,
) -> Result<Vec<i64>, HubError> {
    let everyone = match target {
        ChatTarget::Direct { receiver_id } => vec![receiver_id],
        ChatTarget::Group { group_id } => {
            palaver_db::groups::member_ids(&state.db, group_id).await?
        }
        ChatTarget::Channel { channel_id } => {
            palaver_db::channels::member_ids(&state.db, channel_id).await?
        }
    };
    Ok(everyone.into_iter().filter(|id| *id != except).collect())
}

/// Pushes the stored message to every online recipient and promotes it to
/// `delivered` when anyone got it. Returns the row with its final status.
async fn fan_out(
    state: &AppState,
    mut row: MessageRow,
    recipients: &[i64],
) -> Result<MessageRow, HubError> {
    let message = row.clone().into_message();
    let mut reached = false;
    for recipient in recipients {
        if state.chat.send(*recipient, receive_event(&message)) {
            reached = true;
        }
    }
    if reached && palaver_db::messages::mark_delivered(&state.db, row.id).await? {
        row.status = MessageStatus::Delivered;
    }
    Ok(row)
}

/// Fetches the message and checks the caller may see it: a participant who
/// has not deleted it for themselves. Everything else answers "not found" so
/// probing ids reveals nothing.
async fn visible_message(
    state: &AppState,
    user_id: i64,
    message_id: i64,
) -> Result<MessageRow, HubError> {
    let Some(row) = palaver_db::messages::get_message(&state.db, message_id).await? else {
        return Err(HubError::not_found("message not found"));
    };
    if row.is_deleted_for(user_id) {
        return Err(HubError::not_found("message not found"));
    }
    let is_participant = if row.sender_id == user_id {
        true
    } else {
        match row.target() {
            Some(ChatTarget::Direct { receiver_id }) => receiver_id == user_id,
            Some(ChatTarget::Group { group_id }) => {
                palaver_db::groups::is_member(&state.db, group_id, user_id).await?
            }
            Some(ChatTarget::Channel { channel_id }) => {
                palaver_db::channels::is_member(&state.db, channel_id, user_id).await?
            }
            None => false,
        }
    };
    if !is_participant {
        return Err(HubError::not_found("message not found"));
    }
    Ok(row)
}

fn is_tombstone(row: &MessageRow) -> bool {
    match row.kind {
        palaver_models::MessageKind::Location => row.latitude.is_none(),
        _ => row.content.is_empty(),
    }
}

fn validate_media_batch(files: &[FileMeta]) -> Result<(), HubError> {
    if files.is_empty() || files.len() > MAX_MEDIA_BATCH {
        return Err(HubError::validation(format!(
            "media batch must contain between 1 and {MAX_MEDIA_BATCH} files"
        )));
    }
    for file in files {
        if file.url.trim().is_empty() {
            return Err(HubError::validation(format!(
                "{} entry is missing its upload URL",
                file.kind.as_str()
            )));
        }
        let mime_ok = match file.kind {
            palaver_models::MediaKind::Image => file.mime.starts_with("image/"),
            palaver_models::MediaKind::Video => file.mime.starts_with("video/"),
            palaver_models::MediaKind::File => !file.mime.trim().is_empty(),
        };
        if !mime_ok {
            return Err(HubError::validation(format!(
                "{} entry has mismatched MIME type '{}'",
                file.kind.as_str(),
                file.mime
            )));
        }
        if file.kind == palaver_models::MediaKind::File
            && file.name.as_deref().map_or(true, |n| n.trim().is_empty())
        {
            return Err(HubError::validation("file entries require a filename"));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use palaver_models::MediaKind;

    fn image(url: &str) -> FileMeta {
        FileMeta {
            url: url.to_string(),
            kind: MediaKind::Image,
            mime: "image/jpeg".to_string(),
            name: None,
            size: Some(1024),
        }
    }

    #[test]
    fn media_batch_size_limits() {
        assert!(validate_media_batch(&[]).is_err());
        let eleven: Vec<FileMeta> = (0..11).map(|i| image(&format!("u{i}"))).collect();
        assert!(validate_media_batch(&eleven).is_err());
        assert!(validate_media_batch(&[image("u")]).is_ok());
    }

    #[test]
    fn media_batch_mime_must_match_kind() {
        let mut bad = image("u");
        bad.mime = "application/pdf".to_string();
        let err = validate_media_batch(&[image("ok"), bad]).unwrap_err();
        match err {
            HubError::Validation(reason) => {
                assert!(reason.contains("image"), "reason names the kind: {reason}")
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn file_entries_need_a_filename() {
        let unnamed = FileMeta {
            url: "u".to_string(),
            kind: MediaKind::File,
            mime: "application/pdf".to_string(),
            name: None,
            size: None,
        };
        assert!(validate_media_batch(&[unnamed.clone()]).is_err());

        let named = FileMeta { name: Some("report.pdf".to_string()), ..unnamed };
        assert!(validate_media_batch(&[named]).is_ok());
    }

    #[test]
    fn receive_event_tracks_message_kind() {
        let mut message = Message {
            id: 1,
            sender_id: 1,
            receiver_id: Some(2),
            group_id: None,
            channel_id: None,
            kind: palaver_models::MessageKind::Text,
            content: "hi".into(),
            file_name: None,
            file_mime: None,
            file_size: None,
            duration_secs: None,
            latitude: None,
            longitude: None,
            status: MessageStatus::Sent,
            forwarded_from: None,
            created_at: Utc::now(),
        };
        assert!(matches!(receive_event(&message), ServerEvent::ReceiveMessage { .. }));
        message.kind = palaver_models::MessageKind::Voice;
        assert!(matches!(receive_event(&message), ServerEvent::ReceiveVoice { .. }));
        message.kind = palaver_models::MessageKind::Image;
        assert!(matches!(receive_event(&message), ServerEvent::ReceiveMedia { .. }));
        message.kind = palaver_models::MessageKind::Location;
        assert!(matches!(receive_event(&message), ServerEvent::ReceiveLocation { .. }));
    }
}
