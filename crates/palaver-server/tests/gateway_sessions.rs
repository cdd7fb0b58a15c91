use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{bail, Context};
use futures_util::{SinkExt, StreamExt};
use palaver_core::{auth, AppConfig, AppState};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

struct TestContext {
    addr: SocketAddr,
    db: palaver_db::DbPool,
    jwt_secret: String,
}

impl TestContext {
    async fn new() -> anyhow::Result<Self> {
        let db = palaver_db::create_pool("sqlite::memory:", 1).await?;
        palaver_db::run_migrations(&db).await?;

        let jwt_secret = "gateway-integration-secret-0123456789abcdef".to_string();
        let state = AppState::new(
            db.clone(),
            AppConfig {
                jwt_secret: jwt_secret.clone(),
                jwt_expiry_seconds: 3600,
                worker_id: 1,
                ring_timeout_secs: 60,
            },
        );

        let app = palaver_ws::gateway_router().with_state(state);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        tokio::spawn(async move {
            let _ = axum::serve(listener, app.into_make_service()).await;
        });

        Ok(Self { addr, db, jwt_secret })
    }

    async fn seed_user(&self, id: i64, phone: &str, username: &str) -> anyhow::Result<String> {
        palaver_db::users::create_user(&self.db, id, phone, username).await?;
        Ok(auth::create_token(id, &self.jwt_secret, 3600)?)
    }

    async fn connect(&self, path: &str, token: &str) -> anyhow::Result<Socket> {
        let url = format!("ws://{}{}?token={}", self.addr, path, token);
        let (socket, _) = tokio_tungstenite::connect_async(url).await?;
        Ok(socket)
    }

    async fn connect_and_join(&self, path: &str, token: &str) -> anyhow::Result<Socket> {
        let mut socket = self.connect(path, token).await?;
        send_frame(&mut socket, json!({"type": "join", "data": {}})).await?;
        Ok(socket)
    }
}

async fn send_frame(socket: &mut Socket, frame: Value) -> anyhow::Result<()> {
    socket.send(Message::text(frame.to_string())).await?;
    Ok(())
}

/// Reads frames until one of the wanted event type arrives, skipping over
/// interleaved broadcasts and keepalive pings.
async fn recv_event(socket: &mut Socket, wanted: &str) -> anyhow::Result<Value> {
    loop {
        let frame = tokio::time::timeout(RECV_TIMEOUT, socket.next())
            .await
            .with_context(|| format!("timed out waiting for '{wanted}'"))?
            .with_context(|| format!("socket ended while waiting for '{wanted}'"))??;
        match frame {
            Message::Text(text) => {
                let event: Value = serde_json::from_str(&text)?;
                if event["type"] == wanted {
                    return Ok(event["data"].clone());
                }
            }
            Message::Ping(_) | Message::Pong(_) => {}
            Message::Close(frame) => {
                bail!("connection closed while waiting for '{wanted}': {frame:?}")
            }
            other => bail!("unexpected frame while waiting for '{wanted}': {other:?}"),
        }
    }
}

async fn recv_close(socket: &mut Socket) -> anyhow::Result<(CloseCode, String)> {
    loop {
        let frame = tokio::time::timeout(RECV_TIMEOUT, socket.next())
            .await
            .context("timed out waiting for a close frame")?
            .context("socket ended without a close frame")??;
        if let Message::Close(close) = frame {
            let close = close.context("close frame carried no code")?;
            return Ok((close.code, close.reason.to_string()));
        }
    }
}

#[tokio::test]
async fn fresh_chat_join_broadcasts_presence_and_roster() -> anyhow::Result<()> {
    let ctx = TestContext::new().await?;
    let token = ctx.seed_user(1, "+15550001", "alice").await?;

    let mut socket = ctx.connect_and_join("/gateway/chat", &token).await?;

    let presence = recv_event(&mut socket, "presence_update").await?;
    assert_eq!(presence["user_id"], "1");
    assert_eq!(presence["online"], true);

    let roster = recv_event(&mut socket, "online_users").await?;
    assert_eq!(roster["user_ids"], json!(["1"]));
    Ok(())
}

#[tokio::test]
async fn rejected_token_gets_join_error_then_policy_close() -> anyhow::Result<()> {
    let ctx = TestContext::new().await?;

    let mut socket = ctx.connect_and_join("/gateway/chat", "not-a-jwt").await?;

    let error = recv_event(&mut socket, "join_error").await?;
    assert_eq!(error["reason"], "invalid token");

    let (code, reason) = recv_close(&mut socket).await?;
    assert_eq!(code, CloseCode::Policy);
    assert_eq!(reason, "invalid token");
    Ok(())
}

#[tokio::test]
async fn direct_message_reaches_online_recipient_with_delivered_ack() -> anyhow::Result<()> {
    let ctx = TestContext::new().await?;
    let alice = ctx.seed_user(1, "+15550001", "alice").await?;
    let bob = ctx.seed_user(2, "+15550002", "bob").await?;

    let mut alice_socket = ctx.connect_and_join("/gateway/chat", &alice).await?;
    recv_event(&mut alice_socket, "online_users").await?;
    let mut bob_socket = ctx.connect_and_join("/gateway/chat", &bob).await?;
    recv_event(&mut bob_socket, "online_users").await?;

    send_frame(
        &mut alice_socket,
        json!({"type": "send_message", "data": {"receiver_id": "2", "content": "hello bob"}}),
    )
    .await?;

    let received = recv_event(&mut bob_socket, "receive_message").await?;
    assert_eq!(received["message"]["content"], "hello bob");
    assert_eq!(received["message"]["sender_id"], "1");

    let ack = recv_event(&mut alice_socket, "message_sent").await?;
    assert_eq!(ack["message"]["status"], "delivered");
    Ok(())
}

#[tokio::test]
async fn second_join_supersedes_the_first_socket() -> anyhow::Result<()> {
    let ctx = TestContext::new().await?;
    let token = ctx.seed_user(1, "+15550001", "alice").await?;

    let mut first = ctx.connect_and_join("/gateway/chat", &token).await?;
    recv_event(&mut first, "online_users").await?;

    let mut second = ctx.connect_and_join("/gateway/chat", &token).await?;
    recv_event(&mut second, "online_users").await?;

    let (code, reason) = recv_close(&mut first).await?;
    assert_eq!(code, CloseCode::Normal);
    assert_eq!(reason, "superseded by a newer session");
    Ok(())
}

#[tokio::test]
async fn audio_call_offer_rings_the_callee() -> anyhow::Result<()> {
    let ctx = TestContext::new().await?;
    let alice = ctx.seed_user(1, "+15550001", "alice").await?;
    let bob = ctx.seed_user(2, "+15550002", "bob").await?;

    let mut alice_socket = ctx.connect_and_join("/gateway/call/audio", &alice).await?;
    recv_event(&mut alice_socket, "online_users").await?;
    let mut bob_socket = ctx.connect_and_join("/gateway/call/audio", &bob).await?;
    recv_event(&mut bob_socket, "online_users").await?;

    send_frame(
        &mut alice_socket,
        json!({
            "type": "call_user",
            "data": {"callee_id": "2", "offer": {"type": "offer", "sdp": "v=0..."}}
        }),
    )
    .await?;

    recv_event(&mut alice_socket, "calling").await?;
    let incoming = recv_event(&mut bob_socket, "incoming_call").await?;
    assert_eq!(incoming["from"]["id"], "1");
    assert_eq!(incoming["from"]["username"], "alice");
    assert_eq!(incoming["channel"], "audio");
    Ok(())
}

#[tokio::test]
async fn unknown_event_keeps_the_session_alive() -> anyhow::Result<()> {
    let ctx = TestContext::new().await?;
    let token = ctx.seed_user(1, "+15550001", "alice").await?;

    let mut socket = ctx.connect_and_join("/gateway/chat", &token).await?;
    recv_event(&mut socket, "online_users").await?;

    send_frame(&mut socket, json!({"type": "frobnicate", "data": {}})).await?;
    let error = recv_event(&mut socket, "error").await?;
    assert_eq!(error["reason"], "malformed event");

    // The connection survives and still answers requests.
    send_frame(&mut socket, json!({"type": "request_online_users"})).await?;
    let roster = recv_event(&mut socket, "online_users").await?;
    assert_eq!(roster["user_ids"], json!(["1"]));
    Ok(())
}
