use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use governor::clock::{Clock, DefaultClock};
use governor::{DefaultKeyedRateLimiter, Quota, RateLimiter};
use palaver_core::delivery::{self, PulseKind};
use palaver_core::presence::{EVENT_QUEUE_DEPTH, PresenceRegistry};
use palaver_core::{auth, blocks, AppState, HubError};
use palaver_models::gateway::*;
use palaver_models::CallChannel;
use std::num::NonZeroU32;
use std::sync::OnceLock;
use tokio::sync::mpsc;
use tokio::time::{Duration, Instant, MissedTickBehavior};

use crate::session::Session;

const JOIN_TIMEOUT: Duration = Duration::from_secs(10);
const PING_INTERVAL: Duration = Duration::from_secs(20);
/// Closed when no frame (a pong counts) arrives for this long.
const IDLE_TIMEOUT: Duration = Duration::from_secs(75);

const MAX_EVENTS_PER_MINUTE: u32 = 240;
const MAX_PULSES_PER_MINUTE: u32 = 120;
const MAX_ICE_PER_MINUTE: u32 = 180;

const TARGET_RULE: &str = "exactly one of receiver_id, group_id or channel_id is required";

/// Which engine(s) a connection dispatches into. Chat traffic and call
/// signaling never share a socket; a client holds one connection per hub.
#[derive(Clone, Copy)]
pub(crate) enum Hub {
    Chat,
    Call(CallChannel),
}

impl Hub {
    pub(crate) fn label(self) -> &'static str {
        match self {
            Hub::Chat => "chat",
            Hub::Call(channel) => channel.as_str(),
        }
    }

    fn registry(self, state: &AppState) -> &PresenceRegistry {
        match self {
            Hub::Chat => &state.chat,
            Hub::Call(channel) => state.call_engine(channel).presence(),
        }
    }

    /// Call hubs hold call state for a vanished handle; the chat hub has
    /// nothing registered beyond its presence slot.
    fn cascade_teardown(self, state: &AppState, user_id: i64) {
        if let Hub::Call(channel) = self {
            state.call_engine(channel).handle_disconnect(user_id);
        }
    }
}

/// User-level rate limiters, shared across hubs so reconnecting or spreading
/// traffic over the three sockets does not reset anyone's quota.
struct UserRateLimits {
    /// Everything a session may send: 240/min per user.
    events: DefaultKeyedRateLimiter<i64>,
    /// Typing/recording/uploading pulses: 120/min per user.
    pulses: DefaultKeyedRateLimiter<i64>,
    /// Trickle ICE: 180/min per user.
    ice: DefaultKeyedRateLimiter<i64>,
}

static USER_RATE_LIMITS: OnceLock<UserRateLimits> = OnceLock::new();

fn user_rate_limits() -> &'static UserRateLimits {
    USER_RATE_LIMITS.get_or_init(|| {
        let limits = UserRateLimits {
            events: RateLimiter::keyed(Quota::per_minute(
                NonZeroU32::new(MAX_EVENTS_PER_MINUTE).unwrap(),
            )),
            pulses: RateLimiter::keyed(Quota::per_minute(
                NonZeroU32::new(MAX_PULSES_PER_MINUTE).unwrap(),
            )),
            ice: RateLimiter::keyed(Quota::per_minute(
                NonZeroU32::new(MAX_ICE_PER_MINUTE).unwrap(),
            )),
        };

        // Periodic cleanup of stale per-user entries to prevent unbounded
        // memory growth.
        tokio::spawn(async {
            let mut interval = tokio::time::interval(Duration::from_secs(300));
            interval.tick().await; // skip immediate first tick
            loop {
                interval.tick().await;
                let rl = user_rate_limits();
                rl.events.retain_recent();
                rl.pulses.retain_recent();
                rl.ice.retain_recent();
                rl.events.shrink_to_fit();
                rl.pulses.shrink_to_fit();
                rl.ice.shrink_to_fit();
            }
        });

        limits
    })
}

impl UserRateLimits {
    /// `Ok` to proceed, `Err(retry_after_ms)` when over quota.
    fn check(&self, user_id: i64, event: &ClientEvent) -> Result<(), u64> {
        let clock = DefaultClock::default();
        let now = clock.now();

        if let Err(not_until) = self.events.check_key(&user_id) {
            return Err(not_until.wait_time_from(now).as_millis().max(1) as u64);
        }

        let not_until = match event {
            ClientEvent::Typing(_)
            | ClientEvent::RecordingAudio(_)
            | ClientEvent::UploadingMedia(_) => self.pulses.check_key(&user_id).err(),
            ClientEvent::IceCandidate(_) => self.ice.check_key(&user_id).err(),
            _ => None,
        };

        match not_until {
            Some(not_until) => Err(not_until.wait_time_from(now).as_millis().max(1) as u64),
            None => Ok(()),
        }
    }
}

async fn send_event(
    sender: &mut (impl SinkExt<Message> + Unpin),
    user_id: Option<i64>,
    event: &ServerEvent,
) -> Result<(), ()> {
    let payload = match serde_json::to_string(event) {
        Ok(payload) => payload,
        Err(err) => {
            tracing::error!(?user_id, event = event.name(), %err, "event serialization failed");
            return Ok(());
        }
    };
    tracing::trace!(?user_id, event = event.name(), bytes = payload.len(), "frame out");
    sender
        .send(Message::Text(payload.into()))
        .await
        .map_err(|_| ())
}

async fn send_close(
    sender: &mut (impl SinkExt<Message> + Unpin),
    code: u16,
    reason: &str,
) -> Result<(), ()> {
    sender
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.to_string().into(),
        })))
        .await
        .map_err(|_| ())
}

async fn reject_join(sender: &mut (impl SinkExt<Message> + Unpin), reason: &str) {
    let _ = send_event(
        sender,
        None,
        &ServerEvent::JoinError { reason: reason.to_string() },
    )
    .await;
    // Auth failure is the one condition that closes a connection server-side.
    let _ = send_close(sender, 1008, reason).await;
}

/// Store writes at the presence boundary never gate the session; a failed
/// write is logged and the registry stays authoritative.
fn persist_presence(state: &AppState, user_id: i64, online: bool) {
    let db = state.db.clone();
    tokio::spawn(async move {
        if let Err(err) = palaver_db::users::set_online(&db, user_id, online).await {
            tracing::warn!(user_id, online, %err, "presence write failed");
        }
    });
}

pub(crate) async fn handle_connection(
    socket: WebSocket,
    state: AppState,
    hub: Hub,
    query_token: Option<String>,
) {
    let (mut sender, mut receiver) = socket.split();

    // The first frame must be a join; the JWT rides in it or in the upgrade
    // query. Identity comes from token claims only.
    let user_id = match tokio::time::timeout(
        JOIN_TIMEOUT,
        wait_for_join(&mut receiver, &state, query_token),
    )
    .await
    {
        Ok(Ok(user_id)) => user_id,
        Ok(Err(reason)) => {
            tracing::debug!(hub = hub.label(), %reason, "join refused");
            reject_join(&mut sender, &reason).await;
            return;
        }
        Err(_) => {
            reject_join(&mut sender, "no join within 10 seconds").await;
            return;
        }
    };

    let registry = hub.registry(&state);
    let (tx, event_rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
    let (conn_id, superseded) = registry.register(user_id, tx);
    let session = Session::new(user_id, conn_id);

    if let Some(old) = superseded {
        // Tear down the old handle's call state first, then drop its sender:
        // the old task sees its event stream close and unwinds through the
        // stale-remove path without touching this registration.
        hub.cascade_teardown(&state, user_id);
        drop(old);
        tracing::info!(hub = hub.label(), user_id, "previous connection superseded");
        // Roster is unchanged, but every join answers with the snapshot.
        registry.broadcast(&ServerEvent::OnlineUsers { user_ids: registry.snapshot() });
    } else {
        if let Hub::Chat = hub {
            persist_presence(&state, user_id, true);
            registry.broadcast(&ServerEvent::PresenceUpdate {
                user_id,
                online: true,
                last_seen: None,
            });
        }
        // The joiner bootstraps from this broadcast too.
        registry.broadcast(&ServerEvent::OnlineUsers { user_ids: registry.snapshot() });
    }

    tracing::info!(
        hub = hub.label(),
        user_id,
        session_id = %session.session_id,
        "session joined"
    );

    let reason = run_session(sender, receiver, event_rx, &session, &state, hub).await;
    tracing::info!(
        hub = hub.label(),
        user_id,
        session_id = %session.session_id,
        reason,
        "session closed"
    );

    // Cleanup runs only for the current handle; a superseded task's removal
    // misses and skips everything, so teardown happens exactly once. Call
    // state is torn down before the roster goes out.
    if registry.remove(user_id, conn_id) {
        hub.cascade_teardown(&state, user_id);
        if let Hub::Chat = hub {
            persist_presence(&state, user_id, false);
            registry.broadcast(&ServerEvent::PresenceUpdate {
                user_id,
                online: false,
                last_seen: Some(chrono::Utc::now()),
            });
        }
        registry.broadcast(&ServerEvent::OnlineUsers { user_ids: registry.snapshot() });
    }
}

async fn wait_for_join(
    receiver: &mut (impl StreamExt<Item = Result<Message, axum::Error>> + Unpin),
    state: &AppState,
    mut query_token: Option<String>,
) -> Result<i64, String> {
    while let Some(Ok(frame)) = receiver.next().await {
        let Message::Text(text) = frame else {
            continue;
        };
        let Ok(ClientEvent::Join(payload)) = serde_json::from_str::<ClientEvent>(&text) else {
            return Err("first frame must be a join event".to_string());
        };
        let Some(token) = payload.token.or_else(|| query_token.take()) else {
            return Err("missing auth token".to_string());
        };
        let claims =
            auth::validate_token(&token, &state.config.jwt_secret).map_err(|err| match err {
                auth::AuthError::TokenExpired => "token expired".to_string(),
                _ => "invalid token".to_string(),
            })?;
        let user = palaver_db::users::get_user(&state.db, claims.sub)
            .await
            .map_err(|err| {
                tracing::error!(%err, "user lookup failed during join");
                "internal error".to_string()
            })?;
        if user.is_none() {
            return Err("unknown user".to_string());
        }
        return Ok(claims.sub);
    }
    Err("connection closed before join".to_string())
}

async fn run_session(
    mut sender: impl SinkExt<Message> + Unpin,
    mut receiver: impl StreamExt<Item = Result<Message, axum::Error>> + Unpin,
    mut event_rx: mpsc::Receiver<ServerEvent>,
    session: &Session,
    state: &AppState,
    hub: Hub,
) -> &'static str {
    let mut ping = tokio::time::interval(PING_INTERVAL);
    ping.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let idle_sleep = tokio::time::sleep(IDLE_TIMEOUT);
    tokio::pin!(idle_sleep);

    loop {
        tokio::select! {
            frame = receiver.next() => match frame {
                Some(Ok(frame)) => {
                    idle_sleep.as_mut().reset(Instant::now() + IDLE_TIMEOUT);
                    match frame {
                        Message::Text(text) => {
                            if handle_frame(&mut sender, state, hub, session, &text).await.is_err() {
                                break "websocket send error";
                            }
                        }
                        Message::Close(_) => break "client closed the connection",
                        // Pongs and binary frames only matter for liveness.
                        _ => {}
                    }
                }
                Some(Err(err)) => {
                    tracing::debug!(user_id = session.user_id, %err, "gateway receive error");
                    break "websocket receive error";
                }
                None => break "websocket stream ended",
            },
            event = event_rx.recv() => match event {
                Some(event) => {
                    if send_event(&mut sender, Some(session.user_id), &event).await.is_err() {
                        break "websocket send error";
                    }
                }
                // The registry handed this user's slot to a newer connection.
                None => {
                    let _ = send_close(&mut sender, 1000, "superseded by a newer session").await;
                    break "superseded by a newer session";
                }
            },
            () = &mut idle_sleep => {
                break "no traffic inside the idle window";
            }
            _ = ping.tick() => {
                if sender.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break "websocket ping send error";
                }
            }
        }
    }
}

async fn handle_frame(
    sender: &mut (impl SinkExt<Message> + Unpin),
    state: &AppState,
    hub: Hub,
    session: &Session,
    text: &str,
) -> Result<(), ()> {
    let event = match serde_json::from_str::<ClientEvent>(text) {
        Ok(event) => event,
        Err(err) => {
            tracing::debug!(user_id = session.user_id, %err, "unparseable frame");
            return send_event(
                sender,
                Some(session.user_id),
                &ServerEvent::Error { reason: "malformed event".to_string() },
            )
            .await;
        }
    };
    tracing::debug!(
        user_id = session.user_id,
        hub = hub.label(),
        event = event.name(),
        "frame in"
    );

    if let Err(retry_after_ms) = user_rate_limits().check(session.user_id, &event) {
        return match event {
            // The chatty kinds drop without a reply.
            ClientEvent::Typing(_)
            | ClientEvent::RecordingAudio(_)
            | ClientEvent::UploadingMedia(_)
            | ClientEvent::IceCandidate(_) => Ok(()),
            _ => {
                send_event(
                    sender,
                    Some(session.user_id),
                    &ServerEvent::Error {
                        reason: format!("rate limited; retry in {retry_after_ms}ms"),
                    },
                )
                .await
            }
        };
    }

    match hub {
        Hub::Chat => dispatch_chat(sender, state, session, event).await,
        Hub::Call(channel) => dispatch_call(sender, state, session, channel, event).await,
    }
}

/// Wraps an engine failure in the operation's error event. Internal causes
/// are logged here and reach the wire only as a generic reason.
fn error_event(err: HubError, user_id: i64, wrap: fn(String) -> ServerEvent) -> ServerEvent {
    if err.is_internal() {
        tracing::error!(user_id, %err, "hub operation failed");
    }
    wrap(err.reason())
}

fn call_error_event(err: HubError, user_id: i64) -> ServerEvent {
    match err {
        // Distinct event so clients can render the busy UI.
        HubError::Busy { peer_id } => ServerEvent::UserBusy { peer_id },
        other => error_event(other, user_id, |reason| ServerEvent::CallError { reason }),
    }
}

async fn dispatch_chat(
    sender: &mut (impl SinkExt<Message> + Unpin),
    state: &AppState,
    session: &Session,
    event: ClientEvent,
) -> Result<(), ()> {
    let user_id = session.user_id;
    match event {
        ClientEvent::Join(_) => {
            send_event(
                sender,
                Some(user_id),
                &ServerEvent::Error { reason: "already joined".to_string() },
            )
            .await
        }
        ClientEvent::RequestOnlineUsers => {
            send_event(
                sender,
                Some(user_id),
                &ServerEvent::OnlineUsers { user_ids: state.chat.snapshot() },
            )
            .await
        }
        ClientEvent::SendMessage(p) => {
            let Some(target) = p.target.resolve() else {
                return send_event(
                    sender,
                    Some(user_id),
                    &ServerEvent::MessageError { reason: TARGET_RULE.to_string() },
                )
                .await;
            };
            let event = match delivery::send_text(state, user_id, target, &p.content).await {
                Ok(message) => ServerEvent::MessageSent { message },
                Err(err) => error_event(err, user_id, |reason| ServerEvent::MessageError { reason }),
            };
            send_event(sender, Some(user_id), &event).await
        }
        ClientEvent::SendVoice(p) => {
            let Some(target) = p.target.resolve() else {
                return send_event(
                    sender,
                    Some(user_id),
                    &ServerEvent::VoiceError { reason: TARGET_RULE.to_string() },
                )
                .await;
            };
            let event =
                match delivery::send_voice(state, user_id, target, &p.url, p.duration_secs).await {
                    Ok(message) => ServerEvent::VoiceSent { message },
                    Err(err) => {
                        error_event(err, user_id, |reason| ServerEvent::VoiceError { reason })
                    }
                };
            send_event(sender, Some(user_id), &event).await
        }
        ClientEvent::SendMedia(p) => {
            let Some(target) = p.target.resolve() else {
                return send_event(
                    sender,
                    Some(user_id),
                    &ServerEvent::MediaError { reason: TARGET_RULE.to_string() },
                )
                .await;
            };
            let event = match delivery::send_media(state, user_id, target, &p.files).await {
                Ok(messages) => ServerEvent::MediaSent { messages },
                Err(err) => error_event(err, user_id, |reason| ServerEvent::MediaError { reason }),
            };
            send_event(sender, Some(user_id), &event).await
        }
        ClientEvent::SendLocation(p) => {
            let Some(target) = p.target.resolve() else {
                return send_event(
                    sender,
                    Some(user_id),
                    &ServerEvent::LocationError { reason: TARGET_RULE.to_string() },
                )
                .await;
            };
            let event = match delivery::send_location(
                state,
                user_id,
                target,
                p.latitude,
                p.longitude,
                p.label.as_deref(),
            )
            .await
            {
                Ok(message) => ServerEvent::LocationSent { message },
                Err(err) => {
                    error_event(err, user_id, |reason| ServerEvent::LocationError { reason })
                }
            };
            send_event(sender, Some(user_id), &event).await
        }
        ClientEvent::ForwardMessage(p) => {
            let Some(target) = p.target.resolve() else {
                return send_event(
                    sender,
                    Some(user_id),
                    &ServerEvent::ForwardError { reason: TARGET_RULE.to_string() },
                )
                .await;
            };
            let event = match delivery::forward_message(state, user_id, p.message_id, target).await
            {
                Ok(message) => ServerEvent::MessageForwarded { message },
                Err(err) => error_event(err, user_id, |reason| ServerEvent::ForwardError { reason }),
            };
            send_event(sender, Some(user_id), &event).await
        }
        ClientEvent::ReadMessage(p) => {
            // The sender is notified by the engine; success is silent here.
            match delivery::mark_read(state, user_id, p.message_id).await {
                Ok(()) => Ok(()),
                Err(err) => {
                    let event = error_event(err, user_id, |reason| ServerEvent::ReadError { reason });
                    send_event(sender, Some(user_id), &event).await
                }
            }
        }
        ClientEvent::DeleteMessage(p) => {
            let event =
                match delivery::delete_message(state, user_id, p.message_id, p.for_everyone).await {
                    Ok(()) => ServerEvent::MessageDeleted {
                        message_id: p.message_id,
                        for_everyone: p.for_everyone,
                    },
                    Err(err) => {
                        error_event(err, user_id, |reason| ServerEvent::DeleteError { reason })
                    }
                };
            send_event(sender, Some(user_id), &event).await
        }
        ClientEvent::Typing(p) => {
            relay_pulse(state, user_id, p, PulseKind::Typing).await;
            Ok(())
        }
        ClientEvent::RecordingAudio(p) => {
            relay_pulse(state, user_id, p, PulseKind::Recording).await;
            Ok(())
        }
        ClientEvent::UploadingMedia(p) => {
            relay_pulse(state, user_id, p, PulseKind::Uploading).await;
            Ok(())
        }
        ClientEvent::BlockUser(p) => {
            // The blocked party is notified by the engine; the actor only
            // hears about failures.
            match blocks::block(&state.db, &state.chat, user_id, p.user_id).await {
                Ok(_) => Ok(()),
                Err(err) => {
                    let event =
                        error_event(err, user_id, |reason| ServerEvent::BlockError { reason });
                    send_event(sender, Some(user_id), &event).await
                }
            }
        }
        ClientEvent::UnblockUser(p) => {
            match blocks::unblock(&state.db, &state.chat, user_id, p.user_id).await {
                Ok(_) => Ok(()),
                Err(err) => {
                    let event =
                        error_event(err, user_id, |reason| ServerEvent::BlockError { reason });
                    send_event(sender, Some(user_id), &event).await
                }
            }
        }
        other => {
            send_event(
                sender,
                Some(user_id),
                &ServerEvent::Error {
                    reason: format!("{} is not handled by the chat hub", other.name()),
                },
            )
            .await
        }
    }
}

async fn dispatch_call(
    sender: &mut (impl SinkExt<Message> + Unpin),
    state: &AppState,
    session: &Session,
    channel: CallChannel,
    event: ClientEvent,
) -> Result<(), ()> {
    let user_id = session.user_id;
    let engine = state.call_engine(channel);
    match event {
        ClientEvent::Join(_) => {
            send_event(
                sender,
                Some(user_id),
                &ServerEvent::Error { reason: "already joined".to_string() },
            )
            .await
        }
        ClientEvent::RequestOnlineUsers => {
            send_event(
                sender,
                Some(user_id),
                &ServerEvent::OnlineUsers { user_ids: engine.presence().snapshot() },
            )
            .await
        }
        ClientEvent::CallUser(p) => {
            let event = match engine.place_call(&state.db, user_id, p.callee_id, p.offer).await {
                Ok(()) => ServerEvent::Calling { callee_id: p.callee_id },
                Err(err) => call_error_event(err, user_id),
            };
            send_event(sender, Some(user_id), &event).await
        }
        ClientEvent::AcceptCall(p) => {
            // The caller gets `call_accepted` from the engine; the callee
            // already has the answer it just sent.
            match engine.accept_call(user_id, p.caller_id, p.answer) {
                Ok(()) => Ok(()),
                Err(err) => {
                    let event = call_error_event(err, user_id);
                    send_event(sender, Some(user_id), &event).await
                }
            }
        }
        ClientEvent::RejectCall(p) => {
            engine.reject_call(user_id, p.caller_id);
            Ok(())
        }
        ClientEvent::IceCandidate(p) => {
            match engine.ice_candidate(user_id, p.peer_id, p.candidate) {
                Ok(()) => Ok(()),
                Err(err) => {
                    let event = call_error_event(err, user_id);
                    send_event(sender, Some(user_id), &event).await
                }
            }
        }
        ClientEvent::EndCall => {
            engine.end_call(user_id);
            Ok(())
        }
        other => {
            send_event(
                sender,
                Some(user_id),
                &ServerEvent::Error {
                    reason: format!("{} is not handled by a call hub", other.name()),
                },
            )
            .await
        }
    }
}

/// Pulses are fire-and-forget on both ends: a bad target, a blocked pair or
/// a store hiccup drops the pulse without a word back.
async fn relay_pulse(state: &AppState, from_id: i64, payload: PulsePayload, kind: PulseKind) {
    let Some(target) = payload.target.resolve() else {
        return;
    };
    if let Err(err) = delivery::pulse(state, from_id, target, kind).await {
        tracing::debug!(from_id, %err, "pulse dropped");
    }
}
