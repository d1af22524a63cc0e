use crate::db;
use crate::error::{ChatError, Result};
use chat_protocol::Message;
use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

pub const MAX_PAGE: usize = 200;

/// Append a message to a conversation.
pub fn create_message(
    conn: &Connection,
    conversation_id: &Uuid,
    sender_id: &Uuid,
    content: &str,
) -> Result<Message> {
    if content.trim().is_empty() {
        return Err(ChatError::invalid("message content is empty"));
    }
    let msg = Message {
        id: Uuid::new_v4(),
        conversation_id: *conversation_id,
        sender_id: *sender_id,
        content: content.into(),
        created_at: db::now_millis(),
    };
    conn.execute(
        "INSERT INTO messages (id, conversation_id, sender_id, content, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            msg.id.to_string(),
            conversation_id.to_string(),
            sender_id.to_string(),
            msg.content,
            msg.created_at
        ],
    )?;
    Ok(msg)
}

fn row_to_msg(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    Ok(Message {
        id: db::uuid_column(row, 0)?,
        conversation_id: db::uuid_column(row, 1)?,
        sender_id: db::uuid_column(row, 2)?,
        content: row.get(3)?,
        created_at: row.get(4)?,
    })
}

pub fn get_message(conn: &Connection, id: &Uuid) -> Result<Option<Message>> {
    let msg = conn
        .query_row(
            "SELECT id, conversation_id, sender_id, content, created_at FROM messages WHERE id = ?1",
            [id.to_string()],
            row_to_msg,
        )
        .optional()?;
    Ok(msg)
}

/// List the messages of a conversation in the order they were persisted.
///
/// Returns the newest `limit` messages older than `before` (a message id),
/// oldest first.
pub fn list_messages(
    conn: &Connection,
    conversation_id: &Uuid,
    before: Option<&Uuid>,
    limit: usize,
) -> Result<Vec<Message>> {
    let limit = limit.clamp(1, MAX_PAGE);
    let upper = match before {
        Some(id) => conn
            .query_row(
                "SELECT seq FROM messages WHERE id = ?1 AND conversation_id = ?2",
                params![id.to_string(), conversation_id.to_string()],
                |row| row.get::<_, i64>(0),
            )
            .optional()?
            .ok_or(ChatError::NotFound("message"))?,
        None => i64::MAX,
    };
    let mut stmt = conn.prepare(
        "SELECT id, conversation_id, sender_id, content, created_at FROM messages WHERE conversation_id = ?1 AND seq < ?2 ORDER BY seq DESC LIMIT ?3",
    )?;
    let mut msgs = stmt
        .query_map(
            params![conversation_id.to_string(), upper, limit as i64],
            row_to_msg,
        )?
        .collect::<Result<Vec<_>, _>>()?;
    msgs.reverse();
    Ok(msgs)
}
