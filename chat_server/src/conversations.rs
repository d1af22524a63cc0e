use crate::db;
use crate::error::{ChatError, Result};
use crate::messages;
use chat_protocol::{Conversation, User};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use uuid::Uuid;

/// Deterministic id for the direct conversation between two users.
pub fn direct_conversation_id(a: &Uuid, b: &Uuid) -> Uuid {
    let (min, max) = if a < b { (a, b) } else { (b, a) };
    let name = format!("direct:{}:{}", min, max);
    Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes())
}

/// Fetch the direct conversation for a pair, creating it if needed.
///
/// The pair id is the primary key, so concurrent callers racing on the same
/// pair all end up with the single row that won the insert. Returns whether
/// this call created it.
pub fn get_or_create_direct(conn: &mut Connection, a: &Uuid, b: &Uuid) -> Result<(Conversation, bool)> {
    if a == b {
        return Err(ChatError::invalid("cannot open a direct conversation with yourself"));
    }
    let id = direct_conversation_id(a, b);
    let now = db::now_millis();
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let created = tx.execute(
        "INSERT OR IGNORE INTO conversations (id, name, is_group, created_at, updated_at) VALUES (?1, NULL, 0, ?2, ?2)",
        params![id.to_string(), now],
    )? == 1;
    if created {
        for (position, user) in [a, b].into_iter().enumerate() {
            tx.execute(
                "INSERT INTO conversation_members (conversation_id, user_id, position, is_admin) VALUES (?1, ?2, ?3, 0)",
                params![id.to_string(), user.to_string(), position as i64],
            )?;
        }
    }
    tx.commit()?;
    let conv = get_conversation(conn, &id)?.ok_or(ChatError::NotFound("conversation"))?;
    Ok((conv, created))
}

/// Create a group with `creator` as first member and only admin.
pub fn create_group(
    conn: &mut Connection,
    name: Option<&str>,
    creator: &Uuid,
    users: &[Uuid],
) -> Result<Conversation> {
    let id = Uuid::new_v4();
    let now = db::now_millis();
    let tx = conn.transaction()?;
    tx.execute(
        "INSERT INTO conversations (id, name, is_group, created_at, updated_at) VALUES (?1, ?2, 1, ?3, ?3)",
        params![id.to_string(), name, now],
    )?;
    tx.execute(
        "INSERT INTO conversation_members (conversation_id, user_id, position, is_admin) VALUES (?1, ?2, 0, 1)",
        params![id.to_string(), creator.to_string()],
    )?;
    let mut position = 1i64;
    for user in users.iter().filter(|u| *u != creator) {
        let added = tx.execute(
            "INSERT OR IGNORE INTO conversation_members (conversation_id, user_id, position, is_admin) VALUES (?1, ?2, ?3, 0)",
            params![id.to_string(), user.to_string(), position],
        )?;
        position += added as i64;
    }
    tx.commit()?;
    get_conversation(conn, &id)?.ok_or(ChatError::NotFound("conversation"))
}

fn load_members(conn: &Connection, id: &Uuid) -> Result<(Vec<User>, Vec<Uuid>)> {
    let mut stmt = conn.prepare(
        "SELECT u.id, u.user_name, u.email, u.pic, u.is_admin, m.is_admin FROM conversation_members m \
         JOIN users u ON u.id = m.user_id WHERE m.conversation_id = ?1 ORDER BY m.position",
    )?;
    let rows = stmt
        .query_map([id.to_string()], |row| {
            let user = User {
                id: db::uuid_column(row, 0)?,
                user_name: row.get(1)?,
                email: row.get(2)?,
                pic: row.get(3)?,
                is_admin: row.get::<_, i64>(4)? != 0,
            };
            Ok((user, row.get::<_, i64>(5)? != 0))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    let admins = rows
        .iter()
        .filter(|(_, admin)| *admin)
        .map(|(u, _)| u.id)
        .collect();
    let members = rows.into_iter().map(|(u, _)| u).collect();
    Ok((members, admins))
}

pub fn get_conversation(conn: &Connection, id: &Uuid) -> Result<Option<Conversation>> {
    let row = conn
        .query_row(
            "SELECT name, is_group, latest_message_id, updated_at FROM conversations WHERE id = ?1",
            [id.to_string()],
            |row| {
                Ok((
                    row.get::<_, Option<String>>(0)?,
                    row.get::<_, i64>(1)? != 0,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, i64>(3)?,
                ))
            },
        )
        .optional()?;
    let Some((name, is_group, latest, updated_at)) = row else {
        return Ok(None);
    };
    let (members, admins) = load_members(conn, id)?;
    let latest_message = match latest {
        Some(raw) => {
            let msg_id = Uuid::parse_str(&raw).map_err(|e| ChatError::Internal(e.to_string()))?;
            messages::get_message(conn, &msg_id)?
        }
        None => None,
    };
    Ok(Some(Conversation {
        id: *id,
        name,
        is_group,
        members,
        admins,
        latest_message,
        updated_at,
    }))
}

/// Conversations the user belongs to, most recently updated first.
pub fn list_for_user(conn: &Connection, user_id: &Uuid) -> Result<Vec<Conversation>> {
    let mut stmt = conn.prepare(
        "SELECT c.id FROM conversations c JOIN conversation_members m ON m.conversation_id = c.id \
         WHERE m.user_id = ?1 ORDER BY c.updated_at DESC, c.created_at DESC",
    )?;
    let ids = stmt
        .query_map([user_id.to_string()], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    let mut out = Vec::with_capacity(ids.len());
    for id in ids {
        let id = Uuid::parse_str(&id).map_err(|e| ChatError::Internal(e.to_string()))?;
        if let Some(conv) = get_conversation(conn, &id)? {
            out.push(conv);
        }
    }
    Ok(out)
}

fn touch(conn: &Connection, id: &Uuid) -> Result<()> {
    conn.execute(
        "UPDATE conversations SET updated_at = ?2 WHERE id = ?1",
        params![id.to_string(), db::now_millis()],
    )?;
    Ok(())
}

pub fn rename(conn: &Connection, id: &Uuid, name: &str) -> Result<()> {
    conn.execute(
        "UPDATE conversations SET name = ?2, updated_at = ?3 WHERE id = ?1",
        params![id.to_string(), name, db::now_millis()],
    )?;
    Ok(())
}

/// Append a member. Returns false if the user already belonged.
pub fn add_member(conn: &Connection, id: &Uuid, user_id: &Uuid) -> Result<bool> {
    let added = conn.execute(
        "INSERT OR IGNORE INTO conversation_members (conversation_id, user_id, position, is_admin) \
         SELECT ?1, ?2, COALESCE(MAX(position), -1) + 1, 0 FROM conversation_members WHERE conversation_id = ?1",
        params![id.to_string(), user_id.to_string()],
    )?;
    if added == 1 {
        touch(conn, id)?;
    }
    Ok(added == 1)
}

/// Remove a member along with any admin right it held.
pub fn remove_member(conn: &Connection, id: &Uuid, user_id: &Uuid) -> Result<bool> {
    let removed = conn.execute(
        "DELETE FROM conversation_members WHERE conversation_id = ?1 AND user_id = ?2",
        params![id.to_string(), user_id.to_string()],
    )?;
    if removed == 1 {
        touch(conn, id)?;
    }
    Ok(removed == 1)
}

/// Mark an existing member as admin. Returns false if the user is not a member.
pub fn grant_admin(conn: &Connection, id: &Uuid, user_id: &Uuid) -> Result<bool> {
    let updated = conn.execute(
        "UPDATE conversation_members SET is_admin = 1 WHERE conversation_id = ?1 AND user_id = ?2",
        params![id.to_string(), user_id.to_string()],
    )?;
    if updated == 1 {
        touch(conn, id)?;
    }
    Ok(updated == 1)
}

/// Delete a conversation; members and messages go with it.
pub fn delete(conn: &Connection, id: &Uuid) -> Result<bool> {
    let deleted = conn.execute("DELETE FROM conversations WHERE id = ?1", [id.to_string()])?;
    Ok(deleted == 1)
}

/// Point the conversation at its newest message.
pub fn set_latest_message(conn: &Connection, id: &Uuid, message_id: &Uuid, at: i64) -> Result<()> {
    let updated = conn.execute(
        "UPDATE conversations SET latest_message_id = ?2, updated_at = ?3 WHERE id = ?1",
        params![id.to_string(), message_id.to_string(), at],
    )?;
    if updated == 0 {
        return Err(ChatError::NotFound("conversation"));
    }
    Ok(())
}
