//! Realtime socket: one connection multiplexes any number of conversation
//! subscriptions and receives their messages as `event` envelopes.
//! When the server ends a subscription (group deleted, member removed) the
//! client gets a final `subscription_ended` event for that topic.

use crate::broadcast::Subscription;
use crate::error::{ChatError, Result};
use crate::gateway::ChatService;
use axum::extract::ws::{Message as WsMessage, WebSocket};
use chat_protocol::{methods, Envelope, Kind, Message, TopicParams, User};
use futures::stream::{self, BoxStream};
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio_stream::StreamMap;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Each stream yields `Some(msg)` per message and a single `None` once the server ends it.
type Subscriptions = StreamMap<Uuid, BoxStream<'static, Option<Message>>>;

fn track(sub: Subscription) -> BoxStream<'static, Option<Message>> {
    sub.map(Some)
        .chain(stream::once(async { None }))
        .boxed()
}

fn ended(topic: Uuid) -> Envelope {
    Envelope {
        method: Some(methods::SUBSCRIPTION_ENDED.into()),
        ..Envelope::event(topic, json!({ "conversation_id": topic, "subscribed": false }))
    }
}

pub async fn handle_socket(socket: WebSocket, service: ChatService, user: User) {
    let (mut sender, mut receiver) = socket.split();
    let mut subs = Subscriptions::new();
    info!(user = %user.id, "socket connected");
    loop {
        tokio::select! {
            Some((topic, item)) = subs.next(), if !subs.is_empty() => {
                let Some(msg) = item else {
                    debug!(user = %user.id, %topic, "subscription ended by server");
                    if send(&mut sender, &ended(topic)).await.is_err() {
                        break;
                    }
                    continue;
                };
                let payload = match serde_json::to_value(&msg) {
                    Ok(v) => v,
                    Err(e) => {
                        warn!(%topic, error = %e, "failed to encode message");
                        continue;
                    }
                };
                if send(&mut sender, &Envelope::event(topic, payload)).await.is_err() {
                    break;
                }
            }
            incoming = receiver.next() => match incoming {
                Some(Ok(WsMessage::Text(text))) => {
                    let reply = handle_request(&service, &user, &mut subs, &text).await;
                    if send(&mut sender, &reply).await.is_err() {
                        break;
                    }
                }
                Some(Ok(WsMessage::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }
    info!(user = %user.id, subscriptions = subs.len(), "socket closed");
}

async fn send<S>(sender: &mut S, env: &Envelope) -> std::result::Result<(), ()>
where
    S: futures::Sink<WsMessage> + Unpin,
{
    let text = serde_json::to_string(env).map_err(|e| warn!(error = %e, "failed to encode envelope"))?;
    sender.send(WsMessage::Text(text)).await.map_err(|_| ())
}

async fn handle_request(
    service: &ChatService,
    user: &User,
    subs: &mut Subscriptions,
    text: &str,
) -> Envelope {
    let req: Envelope = match serde_json::from_str(text) {
        Ok(req) => req,
        Err(e) => {
            let err = ChatError::invalid(format!("malformed envelope: {e}"));
            return Envelope::failure(None, err.to_rpc());
        }
    };
    let id = req.id.clone();
    match dispatch(service, user, subs, req).await {
        Ok(result) => Envelope::response(id, result),
        Err(e) => {
            debug!(user = %user.id, error = %e, "socket request rejected");
            Envelope::failure(id, e.to_rpc())
        }
    }
}

async fn dispatch(
    service: &ChatService,
    user: &User,
    subs: &mut Subscriptions,
    req: Envelope,
) -> Result<Value> {
    if req.kind != Kind::Request {
        return Err(ChatError::invalid("expected a request"));
    }
    let params: TopicParams = serde_json::from_value(req.params.unwrap_or(Value::Null))
        .map_err(|e| ChatError::invalid(format!("invalid params: {e}")))?;
    let conv = params.conversation_id;
    match req.method.as_deref() {
        Some(methods::SUBSCRIBE) => {
            if !subs.contains_key(&conv) {
                let sub = service.subscribe_to_conversation(user, conv).await?;
                subs.insert(conv, track(sub));
            }
            Ok(json!({ "conversation_id": conv, "subscribed": true }))
        }
        Some(methods::UNSUBSCRIBE) => {
            // dropping the handle deregisters it
            let was_subscribed = subs.remove(&conv).is_some();
            Ok(json!({ "conversation_id": conv, "subscribed": false, "was_subscribed": was_subscribed }))
        }
        other => Err(ChatError::invalid(format!(
            "unknown method {}",
            other.unwrap_or("<none>")
        ))),
    }
}
