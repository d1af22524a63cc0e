use crate::error::{ChatError, Result};
use chat_protocol::Conversation;
use uuid::Uuid;

/// Right an acting user needs on a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Member,
    Admin,
}

/// Check `actor` holds `role` on `conv`.
pub fn authorize(conv: &Conversation, actor: &Uuid, role: Role) -> Result<()> {
    let allowed = match role {
        Role::Member => conv.has_member(actor),
        Role::Admin => conv.has_member(actor) && conv.has_admin(actor),
    };
    if allowed {
        return Ok(());
    }
    tracing::debug!(conversation = %conv.id, actor = %actor, ?role, "access denied");
    Err(match role {
        Role::Member => ChatError::forbidden("not a member of this conversation"),
        Role::Admin => ChatError::forbidden("only group admins can do that"),
    })
}

/// Group-only operations reject direct conversations.
pub fn require_group(conv: &Conversation) -> Result<()> {
    if conv.is_group {
        Ok(())
    } else {
        Err(ChatError::invalid("not a group conversation"))
    }
}
