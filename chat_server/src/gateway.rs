//! Request/response operations over the stores, plus the subscribe entry
//! point into the broadcaster.
//!
//! Every operation except `signup`/`login` takes the caller resolved by
//! [`ChatService::authenticate`]. Store work runs on the blocking pool.

use crate::access::{self, Role};
use crate::auth::LoginRateLimiter;
use crate::broadcast::{Broadcaster, Subscription};
use crate::conversations;
use crate::db::Pool;
use crate::error::{ChatError, Result};
use crate::identity::{IdentityDirectory, NewUser};
use crate::locks::KeyedLocks;
use crate::messages;
use chat_protocol::{AuthResponse, Conversation, DeleteResponse, Message, User};
use once_cell::sync::Lazy;
use regex::Regex;
use rusqlite::{Connection, TransactionBehavior};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

static EMAIL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").expect("valid email regex"));

pub const MIN_PASSWORD_LEN: usize = 8;
pub const DEFAULT_PAGE: usize = 50;

#[derive(Clone)]
pub struct ChatService {
    pool: Pool,
    identity: Arc<dyn IdentityDirectory>,
    broadcaster: Broadcaster,
    send_locks: Arc<KeyedLocks<Uuid>>,
    login_limiter: LoginRateLimiter,
}

impl ChatService {
    pub fn new(pool: Pool, identity: Arc<dyn IdentityDirectory>, broadcaster: Broadcaster) -> Self {
        Self {
            pool,
            identity,
            broadcaster,
            send_locks: Arc::new(KeyedLocks::new()),
            login_limiter: LoginRateLimiter::new(5, Duration::from_secs(60)),
        }
    }

    pub fn broadcaster(&self) -> &Broadcaster {
        &self.broadcaster
    }

    async fn db<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool.get()?;
            f(&mut *conn)
        })
        .await?
    }

    async fn directory<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&dyn IdentityDirectory) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let identity = self.identity.clone();
        tokio::task::spawn_blocking(move || f(identity.as_ref())).await?
    }

    async fn require_user(&self, id: Uuid) -> Result<User> {
        self.directory(move |d| d.find_by_id(&id))
            .await?
            .ok_or(ChatError::NotFound("user"))
    }

    async fn load(&self, conv_id: Uuid) -> Result<Conversation> {
        self.db(move |conn| conversations::get_conversation(conn, &conv_id))
            .await?
            .ok_or(ChatError::NotFound("conversation"))
    }

    /// Load a group, check the caller administers it, apply `f` and return the
    /// updated group, all in one write transaction.
    async fn mutate_group<F>(&self, caller: &User, conv_id: Uuid, f: F) -> Result<Conversation>
    where
        F: FnOnce(&Connection, &Conversation) -> Result<()> + Send + 'static,
    {
        let actor = caller.id;
        self.db(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let conv = conversations::get_conversation(&tx, &conv_id)?
                .ok_or(ChatError::NotFound("conversation"))?;
            access::require_group(&conv)?;
            access::authorize(&conv, &actor, Role::Admin)?;
            f(&*tx, &conv)?;
            let updated = conversations::get_conversation(&tx, &conv_id)?
                .ok_or(ChatError::NotFound("conversation"))?;
            tx.commit()?;
            Ok(updated)
        })
        .await
    }

    pub async fn signup(&self, user_name: &str, email: &str, password: &str) -> Result<AuthResponse> {
        if user_name.trim().is_empty() {
            return Err(ChatError::invalid("user name is required"));
        }
        if !EMAIL_RE.is_match(email.trim()) {
            return Err(ChatError::invalid("email address is malformed"));
        }
        if password.len() < MIN_PASSWORD_LEN {
            return Err(ChatError::invalid(format!(
                "password must be at least {MIN_PASSWORD_LEN} characters"
            )));
        }
        let new = NewUser {
            user_name: user_name.into(),
            email: email.into(),
            password: password.into(),
            pic: None,
        };
        let (user, token) = self
            .directory(move |d| {
                let user = d.register(new)?;
                let token = d.issue_token(&user)?;
                Ok((user, token))
            })
            .await?;
        info!(user = %user.id, "user signed up");
        Ok(AuthResponse { user, token })
    }

    pub async fn login(&self, email: &str, password: &str) -> Result<AuthResponse> {
        if !self.login_limiter.check(email.trim()).await {
            warn!("login rate limited");
            return Err(ChatError::RateLimited);
        }
        let (email, password) = (email.to_string(), password.to_string());
        let found = self
            .directory(move |d| match d.authenticate(&email, &password)? {
                Some(user) => {
                    let token = d.issue_token(&user)?;
                    Ok(Some((user, token)))
                }
                None => Ok(None),
            })
            .await?;
        let Some((user, token)) = found else {
            return Err(ChatError::Unauthenticated);
        };
        info!(user = %user.id, "user logged in");
        Ok(AuthResponse { user, token })
    }

    /// Resolve a bearer token into the calling user.
    pub async fn authenticate(&self, token: Option<&str>) -> Result<User> {
        let Some(token) = token.map(str::to_string) else {
            return Err(ChatError::Unauthenticated);
        };
        self.directory(move |d| d.verify_credential(&token))
            .await?
            .ok_or(ChatError::Unauthenticated)
    }

    /// Everyone but the caller whose name or email contains `search`.
    pub async fn search_users(&self, caller: &User, search: Option<&str>) -> Result<Vec<User>> {
        let needle = search.unwrap_or_default().to_string();
        let me = caller.id;
        let mut users = self.directory(move |d| d.find_matching(&needle)).await?;
        users.retain(|u| u.id != me);
        Ok(users)
    }

    pub async fn get_or_create_direct_conversation(
        &self,
        caller: &User,
        other: Uuid,
    ) -> Result<Conversation> {
        if other == caller.id {
            return Err(ChatError::invalid("cannot open a direct conversation with yourself"));
        }
        self.require_user(other).await?;
        let me = caller.id;
        let (conv, created) = self
            .db(move |conn| conversations::get_or_create_direct(conn, &me, &other))
            .await?;
        if created {
            info!(conversation = %conv.id, "direct conversation created");
        }
        Ok(conv)
    }

    pub async fn list_my_conversations(&self, caller: &User) -> Result<Vec<Conversation>> {
        let me = caller.id;
        self.db(move |conn| conversations::list_for_user(conn, &me)).await
    }

    pub async fn list_messages(
        &self,
        caller: &User,
        conv_id: Uuid,
        before: Option<Uuid>,
        limit: Option<usize>,
    ) -> Result<Vec<Message>> {
        let me = caller.id;
        let limit = limit.unwrap_or(DEFAULT_PAGE);
        self.db(move |conn| {
            let conv = conversations::get_conversation(conn, &conv_id)?
                .ok_or(ChatError::NotFound("conversation"))?;
            access::authorize(&conv, &me, Role::Member)?;
            messages::list_messages(conn, &conv_id, before.as_ref(), limit)
        })
        .await
    }

    pub async fn create_group(
        &self,
        caller: &User,
        name: Option<String>,
        users: Vec<Uuid>,
    ) -> Result<Conversation> {
        let mut others: Vec<Uuid> = Vec::with_capacity(users.len());
        for id in users {
            if id != caller.id && !others.contains(&id) {
                others.push(id);
            }
        }
        if others.len() < 2 {
            return Err(ChatError::invalid("a group needs at least 2 other users"));
        }
        for id in &others {
            self.require_user(*id).await?;
        }
        let name = name
            .map(|n| n.trim().to_string())
            .filter(|n| !n.is_empty());
        let creator = caller.id;
        let group = self
            .db(move |conn| conversations::create_group(conn, name.as_deref(), &creator, &others))
            .await?;
        info!(conversation = %group.id, members = group.members.len(), "group created");
        Ok(group)
    }

    pub async fn rename_group(&self, caller: &User, conv_id: Uuid, name: &str) -> Result<Conversation> {
        let name = name.trim().to_string();
        if name.is_empty() {
            return Err(ChatError::invalid("group name is required"));
        }
        self.mutate_group(caller, conv_id, move |conn, _| {
            conversations::rename(conn, &conv_id, &name)
        })
        .await
    }

    pub async fn add_member(&self, caller: &User, conv_id: Uuid, user_id: Uuid) -> Result<Conversation> {
        self.require_user(user_id).await?;
        let group = self
            .mutate_group(caller, conv_id, move |conn, _| {
                if conversations::add_member(conn, &conv_id, &user_id)? {
                    Ok(())
                } else {
                    Err(ChatError::conflict("user is already a member"))
                }
            })
            .await?;
        info!(conversation = %conv_id, user = %user_id, "member added");
        Ok(group)
    }

    /// Remove a member and end their live subscriptions to the group.
    pub async fn remove_member(&self, caller: &User, conv_id: Uuid, user_id: Uuid) -> Result<Conversation> {
        let _send_guard = self.send_locks.lock(conv_id).await;
        let group = self
            .mutate_group(caller, conv_id, move |conn, _| {
                if conversations::remove_member(conn, &conv_id, &user_id)? {
                    Ok(())
                } else {
                    Err(ChatError::NotFound("member"))
                }
            })
            .await?;
        let revoked = self.broadcaster.revoke(&conv_id, &user_id);
        info!(conversation = %conv_id, user = %user_id, revoked, "member removed");
        Ok(group)
    }

    pub async fn grant_admin(&self, caller: &User, conv_id: Uuid, user_id: Uuid) -> Result<Conversation> {
        let group = self
            .mutate_group(caller, conv_id, move |conn, conv| {
                if !conv.has_member(&user_id) {
                    return Err(ChatError::invalid("only members can become admins"));
                }
                conversations::grant_admin(conn, &conv_id, &user_id).map(|_| ())
            })
            .await?;
        info!(conversation = %conv_id, user = %user_id, "admin granted");
        Ok(group)
    }

    /// Delete a group with its history and end live subscriptions to it.
    pub async fn delete_group(&self, caller: &User, conv_id: Uuid) -> Result<DeleteResponse> {
        let _send_guard = self.send_locks.lock(conv_id).await;
        let actor = caller.id;
        let deleted = self
            .db(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let conv = conversations::get_conversation(&tx, &conv_id)?
                    .ok_or(ChatError::NotFound("conversation"))?;
                access::require_group(&conv)?;
                access::authorize(&conv, &actor, Role::Admin)?;
                conversations::delete(&tx, &conv_id)?;
                tx.commit()?;
                Ok(conv)
            })
            .await?;
        self.broadcaster.close(conv_id);
        info!(conversation = %conv_id, name = ?deleted.name, "group deleted");
        Ok(DeleteResponse {
            message: "Chat deleted successfully".into(),
            deleted,
        })
    }

    /// Persist a message, move the latest pointer and fan it out.
    ///
    /// Sends to one conversation are serialised so the broadcast order matches
    /// the persisted order.
    pub async fn send_message(&self, caller: &User, conv_id: Uuid, content: &str) -> Result<Message> {
        let sender = caller.id;
        let content = content.to_string();
        let _send_guard = self.send_locks.lock(conv_id).await;
        let msg = self
            .db(move |conn| {
                // membership is checked against the state the insert commits on
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let conv = conversations::get_conversation(&tx, &conv_id)?
                    .ok_or(ChatError::NotFound("conversation"))?;
                if !conv.has_member(&sender) {
                    return Err(ChatError::NotAMember);
                }
                if content.trim().is_empty() {
                    return Err(ChatError::invalid("message content is empty"));
                }
                let msg = messages::create_message(&tx, &conv_id, &sender, &content)?;
                tx.commit()?;
                Ok(msg)
            })
            .await?;

        let (msg_id, at) = (msg.id, msg.created_at);
        let pointer = retry_once(move || {
            self.db(move |conn| conversations::set_latest_message(conn, &conv_id, &msg_id, at))
        })
        .await;
        if let Err(e) = pointer {
            error!(conversation = %conv_id, message_id = %msg_id, error = %e, "latest message pointer is stale");
        }

        let delivered = self.broadcaster.publish(conv_id, msg.clone());
        debug!(conversation = %conv_id, message_id = %msg.id, delivered, "message sent");
        Ok(msg)
    }

    /// Open a live feed of new messages in a conversation the caller belongs to.
    ///
    /// Runs under the conversation lock so a concurrent delete or removal
    /// either sees this handle or makes the check fail.
    pub async fn subscribe_to_conversation(&self, caller: &User, conv_id: Uuid) -> Result<Subscription> {
        let _guard = self.send_locks.lock(conv_id).await;
        let conv = self.load(conv_id).await?;
        access::authorize(&conv, &caller.id, Role::Member)?;
        Ok(self.broadcaster.subscribe(conv_id, caller.id))
    }
}

/// Run `op`, and once more if the first attempt fails.
async fn retry_once<T, F, Fut>(mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    match op().await {
        Ok(v) => Ok(v),
        Err(e) => {
            warn!(error = %e, "store update failed, retrying");
            op().await
        }
    }
}
