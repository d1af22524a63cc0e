use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Kind of envelope exchanged over the realtime socket.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Kind {
    Request,
    Response,
    Event,
}

/// Structured failure returned by every surface of the server.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct RpcError {
    #[serde(rename = "error")]
    pub kind: String,
    pub message: String,
}

/// Top level envelope exchanged between a client and the realtime endpoint.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
pub struct Envelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default)]
    pub kind: Kind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

impl Default for Kind {
    fn default() -> Self {
        Kind::Request
    }
}

impl Envelope {
    /// Successful reply to the request carrying `id`.
    pub fn response(id: Option<String>, result: Value) -> Self {
        Self {
            id,
            kind: Kind::Response,
            result: Some(result),
            ..Default::default()
        }
    }

    /// Failed reply to the request carrying `id`.
    pub fn failure(id: Option<String>, error: RpcError) -> Self {
        Self {
            id,
            kind: Kind::Response,
            error: Some(error),
            ..Default::default()
        }
    }

    /// Server push for a conversation topic.
    pub fn event(topic: Uuid, payload: Value) -> Self {
        Self {
            kind: Kind::Event,
            topic: Some(topic.to_string()),
            payload: Some(payload),
            ..Default::default()
        }
    }
}

/// Methods a client may invoke over the socket.
pub mod methods {
    pub const SUBSCRIBE: &str = "subscribe";
    pub const UNSUBSCRIBE: &str = "unsubscribe";
    /// Event method sent by the server when it ends a subscription.
    pub const SUBSCRIPTION_ENDED: &str = "subscription_ended";
}

/// Parameters of `subscribe` and `unsubscribe`.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct TopicParams {
    pub conversation_id: Uuid,
}

/// Public profile of a user. Never carries the credential secret.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct User {
    pub id: Uuid,
    pub user_name: String,
    pub email: String,
    pub pic: String,
    #[serde(default)]
    pub is_admin: bool,
}

/// A message as stored and as broadcast to subscribers.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub sender_id: Uuid,
    pub content: String,
    /// Unix milliseconds.
    pub created_at: i64,
}

/// A direct or group conversation with its members resolved.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Conversation {
    pub id: Uuid,
    pub name: Option<String>,
    pub is_group: bool,
    pub members: Vec<User>,
    pub admins: Vec<Uuid>,
    pub latest_message: Option<Message>,
    /// Unix milliseconds.
    pub updated_at: i64,
}

impl Conversation {
    pub fn has_member(&self, user: &Uuid) -> bool {
        self.members.iter().any(|m| &m.id == user)
    }

    pub fn has_admin(&self, user: &Uuid) -> bool {
        self.admins.contains(user)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct AuthResponse {
    pub user: User,
    pub token: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct DeleteResponse {
    pub message: String,
    pub deleted: Conversation,
}
