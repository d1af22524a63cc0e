use axum::http::StatusCode;
use chat_server::api::{build_router, AppState};
use chat_server::config::Config;
use serde_json::{json, Value};
use std::net::{SocketAddr, TcpListener};
use tokio::task::JoinHandle;

async fn spawn_server() -> (SocketAddr, JoinHandle<()>, tempfile::TempDir) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    listener.set_nonblocking(true).unwrap();

    let tmp = tempfile::tempdir().unwrap();
    let mut config = Config::with_data_dir(tmp.path());
    config.bind = addr.to_string();
    let state = AppState::new(config).await.unwrap();
    let app = build_router(state);
    let server = tokio::spawn(async move {
        axum::Server::from_tcp(listener)
            .unwrap()
            .serve(app.into_make_service())
            .await
            .unwrap();
    });
    (addr, server, tmp)
}

struct Account {
    id: String,
    token: String,
}

async fn signup(client: &reqwest::Client, addr: SocketAddr, name: &str) -> Account {
    let resp = client
        .post(format!("http://{}/api/signup", addr))
        .json(&json!({
            "user_name": name,
            "email": format!("{}@example.com", name),
            "password": "correct horse",
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::CREATED);
    let v: Value = resp.json().await.unwrap();
    Account {
        id: v["user"]["id"].as_str().unwrap().to_string(),
        token: v["token"].as_str().unwrap().to_string(),
    }
}

#[tokio::test]
async fn signup_login_and_me() {
    let (addr, server, _tmp) = spawn_server().await;
    let client = reqwest::Client::new();

    let alice = signup(&client, addr, "alice").await;

    let resp = client
        .post(format!("http://{}/api/signup", addr))
        .json(&json!({"user_name": "again", "email": "ALICE@example.com", "password": "correct horse"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::CONFLICT);
    let v: Value = resp.json().await.unwrap();
    assert_eq!(v["error"], "conflict");

    let resp = client
        .post(format!("http://{}/api/signup", addr))
        .json(&json!({"user_name": "weak", "email": "weak@example.com", "password": "short"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let _ = resp.text().await;

    let resp = client
        .post(format!("http://{}/api/login", addr))
        .json(&json!({"email": "alice@example.com", "password": "correct horse"}))
        .send()
        .await
        .unwrap();
    assert!(resp.status().is_success());
    let v: Value = resp.json().await.unwrap();
    assert_eq!(v["user"]["id"], alice.id.as_str());
    assert!(v["user"].get("password").is_none());

    let resp = client
        .post(format!("http://{}/api/login", addr))
        .json(&json!({"email": "alice@example.com", "password": "wrong"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    let _ = resp.text().await;

    let resp = client
        .get(format!("http://{}/api/me", addr))
        .bearer_auth(&alice.token)
        .send()
        .await
        .unwrap();
    assert!(resp.status().is_success());
    let me: Value = resp.json().await.unwrap();
    assert_eq!(me["user_name"], "alice");
    assert!(me["pic"].as_str().unwrap().starts_with("https://"));

    let resp = client
        .get(format!("http://{}/api/me", addr))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    let _ = resp.text().await;

    server.abort();
}

#[tokio::test]
async fn login_is_rate_limited() {
    let (addr, server, _tmp) = spawn_server().await;
    let client = reqwest::Client::new();
    signup(&client, addr, "dave").await;
    for _ in 0..5 {
        let resp = client
            .post(format!("http://{}/api/login", addr))
            .json(&json!({"email": "dave@example.com", "password": "nope"}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        let _ = resp.text().await;
    }
    let resp = client
        .post(format!("http://{}/api/login", addr))
        .json(&json!({"email": "DAVE@example.com", "password": "correct horse"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
    let v: Value = resp.json().await.unwrap();
    assert_eq!(v["error"], "rate_limited");
    server.abort();
}

#[tokio::test]
async fn direct_conversation_and_messages() {
    let (addr, server, _tmp) = spawn_server().await;
    let client = reqwest::Client::new();
    let alice = signup(&client, addr, "alice").await;
    let bob = signup(&client, addr, "bob").await;
    let carol = signup(&client, addr, "carol").await;

    let resp = client
        .get(format!("http://{}/api/users?search=BO", addr))
        .bearer_auth(&alice.token)
        .send()
        .await
        .unwrap();
    let found: Value = resp.json().await.unwrap();
    assert_eq!(found.as_array().unwrap().len(), 1);
    assert_eq!(found[0]["id"], bob.id.as_str());

    let resp = client
        .get(format!("http://{}/api/users", addr))
        .bearer_auth(&alice.token)
        .send()
        .await
        .unwrap();
    let everyone: Value = resp.json().await.unwrap();
    assert_eq!(everyone.as_array().unwrap().len(), 2);

    let open = |token: String, other: String| {
        let client = client.clone();
        async move {
            let resp = client
                .post(format!("http://{}/api/conversations/direct", addr))
                .bearer_auth(token)
                .json(&json!({ "user_id": other }))
                .send()
                .await
                .unwrap();
            assert!(resp.status().is_success());
            resp.json::<Value>().await.unwrap()
        }
    };
    let first = open(alice.token.clone(), bob.id.clone()).await;
    let second = open(bob.token.clone(), alice.id.clone()).await;
    assert_eq!(first["id"], second["id"]);
    assert_eq!(first["is_group"], false);
    let conv_id = first["id"].as_str().unwrap().to_string();

    for i in 0..5 {
        let resp = client
            .post(format!("http://{}/api/conversations/{}/messages", addr, conv_id))
            .bearer_auth(&alice.token)
            .json(&json!({ "content": format!("m{}", i) }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);
        let _ = resp.text().await;
    }

    let resp = client
        .post(format!("http://{}/api/conversations/{}/messages", addr, conv_id))
        .bearer_auth(&carol.token)
        .json(&json!({ "content": "intruder" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    let v: Value = resp.json().await.unwrap();
    assert_eq!(v["error"], "not_a_member");

    let resp = client
        .get(format!("http://{}/api/conversations/{}/messages?limit=2", addr, conv_id))
        .bearer_auth(&bob.token)
        .send()
        .await
        .unwrap();
    let page: Value = resp.json().await.unwrap();
    let page = page.as_array().unwrap();
    assert_eq!(page.len(), 2);
    assert_eq!(page[0]["content"], "m3");
    assert_eq!(page[1]["content"], "m4");

    let cursor = page[0]["id"].as_str().unwrap();
    let resp = client
        .get(format!(
            "http://{}/api/conversations/{}/messages?before={}",
            addr, conv_id, cursor
        ))
        .bearer_auth(&bob.token)
        .send()
        .await
        .unwrap();
    let older: Value = resp.json().await.unwrap();
    let contents: Vec<&str> = older
        .as_array()
        .unwrap()
        .iter()
        .map(|m| m["content"].as_str().unwrap())
        .collect();
    assert_eq!(contents, vec!["m0", "m1", "m2"]);

    let resp = client
        .get(format!("http://{}/api/conversations/{}/messages", addr, conv_id))
        .bearer_auth(&carol.token)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    let _ = resp.text().await;

    let resp = client
        .get(format!("http://{}/api/conversations", addr))
        .bearer_auth(&bob.token)
        .send()
        .await
        .unwrap();
    let convs: Value = resp.json().await.unwrap();
    assert_eq!(convs[0]["latest_message"]["content"], "m4");

    server.abort();
}

#[tokio::test]
async fn group_lifecycle() {
    let (addr, server, _tmp) = spawn_server().await;
    let client = reqwest::Client::new();
    let admin = signup(&client, addr, "admin").await;
    let m = signup(&client, addr, "member").await;
    let n = signup(&client, addr, "other").await;
    let late = signup(&client, addr, "late").await;

    let resp = client
        .post(format!("http://{}/api/groups", addr))
        .bearer_auth(&admin.token)
        .json(&json!({ "name": "team", "users": [m.id] }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let _ = resp.text().await;

    let resp = client
        .post(format!("http://{}/api/groups", addr))
        .bearer_auth(&admin.token)
        .json(&json!({ "name": "team", "users": [m.id, n.id] }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::CREATED);
    let group: Value = resp.json().await.unwrap();
    let gid = group["id"].as_str().unwrap().to_string();
    assert_eq!(group["admins"][0], admin.id.as_str());
    assert_eq!(group["members"].as_array().unwrap().len(), 3);

    let resp = client
        .patch(format!("http://{}/api/groups/{}", addr, gid))
        .bearer_auth(&m.token)
        .json(&json!({ "name": "hijacked" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    let _ = resp.text().await;

    let resp = client
        .post(format!("http://{}/api/groups/{}/members", addr, gid))
        .bearer_auth(&admin.token)
        .json(&json!({ "user_id": late.id }))
        .send()
        .await
        .unwrap();
    assert!(resp.status().is_success());
    let _ = resp.text().await;

    let resp = client
        .post(format!("http://{}/api/groups/{}/admins", addr, gid))
        .bearer_auth(&admin.token)
        .json(&json!({ "user_id": late.id }))
        .send()
        .await
        .unwrap();
    let updated: Value = resp.json().await.unwrap();
    assert_eq!(updated["admins"].as_array().unwrap().len(), 2);

    let resp = client
        .patch(format!("http://{}/api/groups/{}", addr, gid))
        .bearer_auth(&late.token)
        .json(&json!({ "name": "renamed" }))
        .send()
        .await
        .unwrap();
    let renamed: Value = resp.json().await.unwrap();
    assert_eq!(renamed["name"], "renamed");

    let resp = client
        .delete(format!("http://{}/api/groups/{}/members/{}", addr, gid, m.id))
        .bearer_auth(&late.token)
        .send()
        .await
        .unwrap();
    assert!(resp.status().is_success());
    let _ = resp.text().await;

    let resp = client
        .post(format!("http://{}/api/conversations/{}/messages", addr, gid))
        .bearer_auth(&m.token)
        .json(&json!({ "content": "still here?" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    let _ = resp.text().await;

    let resp = client
        .delete(format!("http://{}/api/groups/{}", addr, gid))
        .bearer_auth(&n.token)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    let _ = resp.text().await;

    let resp = client
        .delete(format!("http://{}/api/groups/{}", addr, gid))
        .bearer_auth(&admin.token)
        .send()
        .await
        .unwrap();
    assert!(resp.status().is_success());
    let deleted: Value = resp.json().await.unwrap();
    assert_eq!(deleted["deleted"]["id"], gid.as_str());

    let resp = client
        .get(format!("http://{}/api/conversations/{}/messages", addr, gid))
        .bearer_auth(&admin.token)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    let _ = resp.text().await;

    server.abort();
}
