//! Multi-user chat backend: accounts, direct and group conversations, and a
//! live per-conversation message feed over WebSocket.

pub mod access;
pub mod api;
pub mod auth;
pub mod broadcast;
pub mod config;
pub mod conversations;
pub mod db;
pub mod error;
pub mod gateway;
pub mod identity;
pub mod locks;
pub mod messages;
pub mod ws;

pub use broadcast::{Broadcaster, Subscription};
pub use error::ChatError;
pub use gateway::ChatService;
