use crate::{
    datetime_from_db_text, datetime_to_db_text, ids_from_db_text, ids_to_db_text, DbError, DbPool,
};
use chrono::{DateTime, Utc};
use palaver_models::{ChatTarget, Message, MessageKind, MessageStatus};
use sqlx::Row;

#[derive(Debug, Clone)]
pub struct MessageRow {
    pub id: i64,
    pub sender_id: i64,
    pub receiver_id: Option<i64>,
    pub group_id: Option<i64>,
    pub channel_id: Option<i64>,
    pub kind: MessageKind,
    pub content: String,
    pub file_name: Option<String>,
    pub file_mime: Option<String>,
    pub file_size: Option<i64>,
    pub duration_secs: Option<i64>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub status: MessageStatus,
    pub deleted_for: Vec<i64>,
    pub forwarded_from: Option<i64>,
    pub created_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, sqlx::any::AnyRow> for MessageRow {
    fn from_row(row: &'r sqlx::any::AnyRow) -> Result<Self, sqlx::Error> {
        let kind_raw: String = row.try_get("kind")?;
        let status_raw: String = row.try_get("status")?;
        let deleted_for_raw: String = row.try_get("deleted_for")?;
        let created_at_raw: String = row.try_get("created_at")?;
        Ok(Self {
            id: row.try_get("id")?,
            sender_id: row.try_get("sender_id")?,
            receiver_id: row.try_get("receiver_id")?,
            group_id: row.try_get("group_id")?,
            channel_id: row.try_get("channel_id")?,
            kind: MessageKind::parse(&kind_raw).ok_or_else(|| {
                sqlx::Error::Protocol(format!("unknown message kind '{kind_raw}'"))
            })?,
            content: row.try_get("content")?,
            file_name: row.try_get("file_name")?,
            file_mime: row.try_get("file_mime")?,
            file_size: row.try_get("file_size")?,
            duration_secs: row.try_get("duration_secs")?,
            latitude: row.try_get("latitude")?,
            longitude: row.try_get("longitude")?,
            status: MessageStatus::parse(&status_raw).ok_or_else(|| {
                sqlx::Error::Protocol(format!("unknown message status '{status_raw}'"))
            })?,
            deleted_for: ids_from_db_text(&deleted_for_raw)?,
            forwarded_from: row.try_get("forwarded_from")?,
            created_at: datetime_from_db_text(&created_at_raw)?,
        })
    }
}

impl MessageRow {
    pub fn target(&self) -> Option<ChatTarget> {
        ChatTarget::from_parts(self.receiver_id, self.group_id, self.channel_id)
    }

    pub fn is_deleted_for(&self, user_id: i64) -> bool {
        self.deleted_for.contains(&user_id)
    }

    pub fn into_message(self) -> Message {
        Message {
            id: self.id,
            sender_id: self.sender_id,
            receiver_id: self.receiver_id,
            group_id: self.group_id,
            channel_id: self.channel_id,
            kind: self.kind,
            content: self.content,
            file_name: self.file_name,
            file_mime: self.file_mime,
            file_size: self.file_size,
            duration_secs: self.duration_secs,
            latitude: self.latitude,
            longitude: self.longitude,
            status: self.status,
            forwarded_from: self.forwarded_from,
            created_at: self.created_at,
        }
    }
}

/// Everything needed to insert one message row. Built by the delivery engine
/// after validation; the target is already normalized.
#[derive(Debug, Clone)]
pub struct NewMessage<'a> {
    pub id: i64,
    pub sender_id: i64,
    pub target: ChatTarget,
    pub kind: MessageKind,
    pub content: &'a str,
    pub file_name: Option<&'a str>,
    pub file_mime: Option<&'a str>,
    pub file_size: Option<i64>,
    pub duration_secs: Option<i64>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub forwarded_from: Option<i64>,
}

impl<'a> NewMessage<'a> {
    pub fn text(id: i64, sender_id: i64, target: ChatTarget, content: &'a str) -> Self {
        Self {
            id,
            sender_id,
            target,
            kind: MessageKind::Text,
            content,
            file_name: None,
            file_mime: None,
            file_size: None,
            duration_secs: None,
            latitude: None,
            longitude: None,
            forwarded_from: None,
        }
    }

    fn target_columns(&self) -> (Option<i64>, Option<i64>, Option<i64>) {
        match self.target {
            ChatTarget::Direct { receiver_id } => (Some(receiver_id), None, None),
            ChatTarget::Group { group_id } => (None, Some(group_id), None),
            ChatTarget::Channel { channel_id } => (None, None, Some(channel_id)),
        }
    }
}

const MESSAGE_COLS: &str = "id, sender_id, receiver_id, group_id, channel_id, kind, content, \
     file_name, file_mime, file_size, duration_secs, latitude, longitude, status, deleted_for, \
     forwarded_from, created_at";

pub async fn create_message(pool: &DbPool, new: &NewMessage<'_>) -> Result<MessageRow, DbError> {
    let mut tx = pool.begin().await?;
    let row = insert_message(&mut tx, new).await?;
    tx.commit().await?;
    Ok(row)
}

/// Inserts a whole media batch in one transaction: either every file becomes
/// a row or none do.
pub async fn create_message_batch(
    pool: &DbPool,
    batch: &[NewMessage<'_>],
) -> Result<Vec<MessageRow>, DbError> {
    let mut tx = pool.begin().await?;
    let mut rows = Vec::with_capacity(batch.len());
    for new in batch {
        rows.push(insert_message(&mut tx, new).await?);
    }
    tx.commit().await?;
    Ok(rows)
}

async fn insert_message(
    tx: &mut sqlx::Transaction<'_, sqlx::Any>,
    new: &NewMessage<'_>,
) -> Result<MessageRow, DbError> {
    let (receiver_id, group_id, channel_id) = new.target_columns();
    let sql = format!(
        "INSERT INTO messages (id, sender_id, receiver_id, group_id, channel_id, kind, content, \
         file_name, file_mime, file_size, duration_secs, latitude, longitude, status, \
         forwarded_from, created_at)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
         RETURNING {MESSAGE_COLS}"
    );
    let row = sqlx::query_as::<_, MessageRow>(&sql)
        .bind(new.id)
        .bind(new.sender_id)
        .bind(receiver_id)
        .bind(group_id)
        .bind(channel_id)
        .bind(new.kind.as_str())
        .bind(new.content)
        .bind(new.file_name)
        .bind(new.file_mime)
        .bind(new.file_size)
        .bind(new.duration_secs)
        .bind(new.latitude)
        .bind(new.longitude)
        .bind(MessageStatus::Sent.as_str())
        .bind(new.forwarded_from)
        .bind(datetime_to_db_text(Utc::now()))
        .fetch_one(&mut **tx)
        .await?;
    Ok(row)
}

pub async fn get_message(pool: &DbPool, id: i64) -> Result<Option<MessageRow>, DbError> {
    let sql = format!("SELECT {MESSAGE_COLS} FROM messages WHERE id = $1");
    let row = sqlx::query_as::<_, MessageRow>(&sql)
        .bind(id)
        .fetch_optional(pool)
        .await?;
    Ok(row)
}

/// sent -> delivered. False when the message was already past `sent`, which
/// keeps the ladder monotonic under racing deliveries and reads.
pub async fn mark_delivered(pool: &DbPool, id: i64) -> Result<bool, DbError> {
    let result = sqlx::query("UPDATE messages SET status = 'delivered' WHERE id = $1 AND status = 'sent'")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}

/// sent/delivered -> read. False when it was already read.
pub async fn mark_read(pool: &DbPool, id: i64) -> Result<bool, DbError> {
    let result = sqlx::query(
        "UPDATE messages SET status = 'read' WHERE id = $1 AND status IN ('sent', 'delivered')",
    )
    .bind(id)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// Hide the message from one user (delete for me). The row itself survives
/// for the other participants.
pub async fn add_deleted_for(pool: &DbPool, id: i64, user_id: i64) -> Result<bool, DbError> {
    let mut tx = pool.begin().await?;
    let raw: Option<(String,)> = sqlx::query_as("SELECT deleted_for FROM messages WHERE id = $1")
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?;
    let Some((raw,)) = raw else {
        return Err(DbError::NotFound);
    };
    let mut ids = ids_from_db_text(&raw)?;
    if ids.contains(&user_id) {
        return Ok(false);
    }
    ids.push(user_id);
    sqlx::query("UPDATE messages SET deleted_for = $2 WHERE id = $1")
        .bind(id)
        .bind(ids_to_db_text(&ids))
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    Ok(true)
}

/// Delete for everyone: blank the content and strip the payload columns while
/// keeping the row as a tombstone in every participant's history.
pub async fn tombstone_message(pool: &DbPool, id: i64) -> Result<Option<MessageRow>, DbError> {
    let sql = format!(
        "UPDATE messages
         SET content = '', file_name = NULL, file_mime = NULL, file_size = NULL,
             duration_secs = NULL, latitude = NULL, longitude = NULL
         WHERE id = $1
         RETURNING {MESSAGE_COLS}"
    );
    let row = sqlx::query_as::<_, MessageRow>(&sql)
        .bind(id)
        .fetch_optional(pool)
        .await?;
    Ok(row)
}

/// Direct conversation history between two users, newest first, with rows the
/// viewer deleted for themselves filtered out.
pub async fn conversation_messages(
    pool: &DbPool,
    viewer_id: i64,
    peer_id: i64,
    before: Option<i64>,
    limit: i64,
) -> Result<Vec<MessageRow>, DbError> {
    let rows = match before {
        Some(before_id) => {
            let sql = format!(
                "SELECT {MESSAGE_COLS} FROM messages
                 WHERE ((sender_id = $1 AND receiver_id = $2)
                     OR (sender_id = $2 AND receiver_id = $1))
                   AND id < $3
                 ORDER BY id DESC LIMIT $4"
            );
            sqlx::query_as::<_, MessageRow>(&sql)
                .bind(viewer_id)
                .bind(peer_id)
                .bind(before_id)
                .bind(limit)
                .fetch_all(pool)
                .await?
        }
        None => {
            let sql = format!(
                "SELECT {MESSAGE_COLS} FROM messages
                 WHERE ((sender_id = $1 AND receiver_id = $2)
                     OR (sender_id = $2 AND receiver_id = $1))
                 ORDER BY id DESC LIMIT $3"
            );
            sqlx::query_as::<_, MessageRow>(&sql)
                .bind(viewer_id)
                .bind(peer_id)
                .bind(limit)
                .fetch_all(pool)
                .await?
        }
    };
    Ok(rows
        .into_iter()
        .filter(|row| !row.is_deleted_for(viewer_id))
        .collect())
}

pub async fn count_messages(pool: &DbPool) -> Result<i64, DbError> {
    let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM messages")
        .fetch_one(pool)
        .await?;
    Ok(row.0)
}
