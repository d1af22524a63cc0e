use chat_server::api::{build_router, AppState};
use chat_server::config::Config;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::net::{SocketAddr, TcpListener};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};

type Socket =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

async fn spawn_server() -> (SocketAddr, JoinHandle<()>, AppState, tempfile::TempDir) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    listener.set_nonblocking(true).unwrap();
    let tmp = tempfile::tempdir().unwrap();
    let mut config = Config::with_data_dir(tmp.path());
    config.bind = addr.to_string();
    let state = AppState::new(config).await.unwrap();
    let app = build_router(state.clone());
    let server = tokio::spawn(async move {
        axum::Server::from_tcp(listener)
            .unwrap()
            .serve(app.into_make_service())
            .await
            .unwrap();
    });
    (addr, server, state, tmp)
}

async fn signup(client: &reqwest::Client, addr: SocketAddr, name: &str) -> (String, String) {
    let v: Value = client
        .post(format!("http://{}/api/signup", addr))
        .json(&json!({
            "user_name": name,
            "email": format!("{}@example.com", name),
            "password": "correct horse",
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    (
        v["user"]["id"].as_str().unwrap().to_string(),
        v["token"].as_str().unwrap().to_string(),
    )
}

async fn connect(addr: SocketAddr, token: &str) -> Socket {
    let mut req = format!("ws://{}/ws", addr).into_client_request().unwrap();
    req.headers_mut()
        .append("Authorization", format!("Bearer {}", token).parse().unwrap());
    let (ws, _) = connect_async(req).await.unwrap();
    ws
}

async fn next_json(ws: &mut Socket) -> Value {
    loop {
        let frame = timeout(Duration::from_secs(2), ws.next())
            .await
            .expect("timed out waiting for frame")
            .unwrap()
            .unwrap();
        if let WsMessage::Text(text) = frame {
            return serde_json::from_str(&text).unwrap();
        }
    }
}

async fn request(ws: &mut Socket, id: &str, method: &str, conversation_id: &str) -> Value {
    let env = json!({
        "id": id,
        "kind": "request",
        "method": method,
        "params": { "conversation_id": conversation_id },
    });
    ws.send(WsMessage::Text(env.to_string())).await.unwrap();
    next_json(ws).await
}

async fn send_message(client: &reqwest::Client, addr: SocketAddr, token: &str, conv: &str, content: &str) {
    let resp = client
        .post(format!("http://{}/api/conversations/{}/messages", addr, conv))
        .bearer_auth(token)
        .json(&json!({ "content": content }))
        .send()
        .await
        .unwrap();
    assert!(resp.status().is_success());
    let _ = resp.text().await;
}

#[tokio::test]
async fn socket_requires_token() {
    let (addr, server, _state, _tmp) = spawn_server().await;
    let req = format!("ws://{}/ws", addr).into_client_request().unwrap();
    assert!(connect_async(req).await.is_err());
    server.abort();
}

#[tokio::test]
async fn subscriber_receives_messages_in_order() {
    let (addr, server, state, _tmp) = spawn_server().await;
    let client = reqwest::Client::new();
    let (u1, t1) = signup(&client, addr, "u1").await;
    let (u2, t2) = signup(&client, addr, "u2").await;
    let (_u3, t3) = signup(&client, addr, "u3").await;

    let conv: Value = client
        .post(format!("http://{}/api/conversations/direct", addr))
        .bearer_auth(&t1)
        .json(&json!({ "user_id": u2 }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let conv_id = conv["id"].as_str().unwrap().to_string();

    let mut ws2 = connect(addr, &t2).await;
    let resp = request(&mut ws2, "1", "subscribe", &conv_id).await;
    assert_eq!(resp["kind"], "response");
    assert_eq!(resp["id"], "1");
    assert_eq!(resp["result"]["conversation_id"], conv_id.as_str());

    let mut ws3 = connect(addr, &t3).await;
    let resp = request(&mut ws3, "7", "subscribe", &conv_id).await;
    assert_eq!(resp["id"], "7");
    assert_eq!(resp["error"]["error"], "forbidden");

    let conv_uuid = conv_id.parse().unwrap();
    assert_eq!(state.service.broadcaster().subscriber_count(&conv_uuid), 1);

    send_message(&client, addr, &t1, &conv_id, "hi").await;
    send_message(&client, addr, &t1, &conv_id, "there").await;

    let ev = next_json(&mut ws2).await;
    assert_eq!(ev["kind"], "event");
    assert_eq!(ev["topic"], conv_id.as_str());
    assert_eq!(ev["payload"]["content"], "hi");
    assert_eq!(ev["payload"]["sender_id"], u1.as_str());
    assert_eq!(ev["payload"]["conversation_id"], conv_id.as_str());
    let ev = next_json(&mut ws2).await;
    assert_eq!(ev["payload"]["content"], "there");

    let resp = request(&mut ws2, "2", "unsubscribe", &conv_id).await;
    assert_eq!(resp["result"]["subscribed"], false);
    assert_eq!(state.service.broadcaster().subscriber_count(&conv_uuid), 0);
    send_message(&client, addr, &t1, &conv_id, "unheard").await;
    assert!(timeout(Duration::from_millis(200), ws2.next()).await.is_err());

    server.abort();
}

#[tokio::test]
async fn closing_socket_releases_subscriptions() {
    let (addr, server, state, _tmp) = spawn_server().await;
    let client = reqwest::Client::new();
    let (_a, ta) = signup(&client, addr, "a").await;
    let (b, _tb) = signup(&client, addr, "b").await;
    let conv: Value = client
        .post(format!("http://{}/api/conversations/direct", addr))
        .bearer_auth(&ta)
        .json(&json!({ "user_id": b }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let conv_id = conv["id"].as_str().unwrap().to_string();

    let mut ws = connect(addr, &ta).await;
    request(&mut ws, "1", "subscribe", &conv_id).await;
    let resp = request(&mut ws, "2", "subscribe", &conv_id).await;
    assert_eq!(resp["result"]["subscribed"], true);
    let conv_uuid = conv_id.parse().unwrap();
    assert_eq!(state.service.broadcaster().subscriber_count(&conv_uuid), 1);

    ws.close(None).await.unwrap();
    let mut released = false;
    for _ in 0..50 {
        if state.service.broadcaster().topic_count() == 0 {
            released = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(released);
    server.abort();
}

#[tokio::test]
async fn malformed_requests_get_errors() {
    let (addr, server, _state, _tmp) = spawn_server().await;
    let client = reqwest::Client::new();
    let (_a, ta) = signup(&client, addr, "a").await;
    let mut ws = connect(addr, &ta).await;

    ws.send(WsMessage::Text("not json".into())).await.unwrap();
    let resp = next_json(&mut ws).await;
    assert_eq!(resp["error"]["error"], "invalid_input");

    let resp = request(&mut ws, "3", "shout", &uuid::Uuid::new_v4().to_string()).await;
    assert_eq!(resp["id"], "3");
    assert_eq!(resp["error"]["error"], "invalid_input");

    let resp = request(&mut ws, "4", "subscribe", &uuid::Uuid::new_v4().to_string()).await;
    assert_eq!(resp["error"]["error"], "not_found");
    server.abort();
}

#[tokio::test]
async fn server_ended_subscriptions_are_announced() {
    let (addr, server, state, _tmp) = spawn_server().await;
    let client = reqwest::Client::new();
    let (_admin, ta) = signup(&client, addr, "admin").await;
    let (m, tm) = signup(&client, addr, "m").await;
    let (n, tn) = signup(&client, addr, "n").await;
    let group: Value = client
        .post(format!("http://{}/api/groups", addr))
        .bearer_auth(&ta)
        .json(&json!({ "name": "team", "users": [m, n] }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let gid = group["id"].as_str().unwrap().to_string();

    let mut wm = connect(addr, &tm).await;
    let mut wn = connect(addr, &tn).await;
    request(&mut wm, "1", "subscribe", &gid).await;
    request(&mut wn, "1", "subscribe", &gid).await;

    let resp = client
        .delete(format!("http://{}/api/groups/{}/members/{}", addr, gid, m))
        .bearer_auth(&ta)
        .send()
        .await
        .unwrap();
    assert!(resp.status().is_success());
    let ev = next_json(&mut wm).await;
    assert_eq!(ev["kind"], "event");
    assert_eq!(ev["method"], "subscription_ended");
    assert_eq!(ev["topic"], gid.as_str());
    assert_eq!(ev["payload"]["subscribed"], false);
    let resp = request(&mut wm, "2", "subscribe", &gid).await;
    assert_eq!(resp["error"]["error"], "forbidden");

    send_message(&client, addr, &ta, &gid, "members only").await;
    let ev = next_json(&mut wn).await;
    assert_eq!(ev["payload"]["content"], "members only");
    assert!(timeout(Duration::from_millis(200), wm.next()).await.is_err());

    let resp = client
        .delete(format!("http://{}/api/groups/{}", addr, gid))
        .bearer_auth(&ta)
        .send()
        .await
        .unwrap();
    assert!(resp.status().is_success());
    let ev = next_json(&mut wn).await;
    assert_eq!(ev["method"], "subscription_ended");
    assert_eq!(ev["payload"]["conversation_id"], gid.as_str());
    assert_eq!(state.service.broadcaster().topic_count(), 0);
    server.abort();
}
