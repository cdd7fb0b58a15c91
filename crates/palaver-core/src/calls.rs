//! WebRTC call signaling.
//!
//! The hub never touches media; it relays SDP blobs and ICE candidates and
//! arbitrates who may ring whom. Two engine instances run side by side, one
//! per [`CallChannel`], each with its own presence registry and call table.
//!
//! All three tables live behind a single mutex. Transitions that touch more
//! than one of them (accepting a call moves a pending entry into busy + room)
//! happen inside one critical section, and state is always updated before the
//! peer is notified.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde_json::Value;

use palaver_db::DbPool;
use palaver_models::{CallChannel, CallPeer, ServerEvent};

use crate::error::HubError;
use crate::presence::PresenceRegistry;

/// A ring in flight: the callee (table key) has been offered a call and has
/// not answered yet. At most one per callee.
#[derive(Debug, Clone)]
pub struct PendingCall {
    pub caller_id: i64,
    pub placed_at: Instant,
}

/// An established call between two peers.
#[derive(Debug, Clone)]
pub struct CallRoom {
    pub a: i64,
    pub b: i64,
    pub started_at: Instant,
}

#[derive(Default)]
struct CallTable {
    /// callee id -> who is ringing them.
    pending: HashMap<i64, PendingCall>,
    /// Symmetric peer map; both parties present or neither.
    busy: HashMap<i64, i64>,
    rooms: HashMap<String, CallRoom>,
}

impl CallTable {
    /// Anyone ringing, being rung, or mid-call counts as engaged.
    fn engaged(&self, user_id: i64) -> bool {
        self.busy.contains_key(&user_id)
            || self.pending.contains_key(&user_id)
            || self.pending.values().any(|p| p.caller_id == user_id)
    }

    /// The callee this user is currently ringing, if any.
    fn ringing_callee(&self, caller_id: i64) -> Option<i64> {
        self.pending
            .iter()
            .find(|(_, p)| p.caller_id == caller_id)
            .map(|(callee, _)| *callee)
    }
}

fn room_key(a: i64, b: i64) -> String {
    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
    format!("{lo}:{hi}")
}

/// Offers and answers must look like an RTCSessionDescription: an object with
/// a non-empty `sdp` string. The content itself stays opaque.
fn has_session_description(value: &Value) -> bool {
    value
        .get("sdp")
        .and_then(Value::as_str)
        .is_some_and(|sdp| !sdp.trim().is_empty())
}

fn has_transport_descriptor(value: &Value) -> bool {
    value
        .get("candidate")
        .and_then(Value::as_str)
        .is_some_and(|c| !c.trim().is_empty())
}

pub struct CallEngine {
    channel: CallChannel,
    presence: PresenceRegistry,
    table: Mutex<CallTable>,
}

impl CallEngine {
    pub fn new(channel: CallChannel) -> Self {
        Self {
            channel,
            presence: PresenceRegistry::new(channel.as_str()),
            table: Mutex::new(CallTable::default()),
        }
    }

    pub fn channel(&self) -> CallChannel {
        self.channel
    }

    /// The registry this hub's sockets register into. Call events always
    /// travel over the call-hub connection, never the chat one.
    pub fn presence(&self) -> &PresenceRegistry {
        &self.presence
    }

    /// Rings `callee_id` on behalf of `caller_id`. On success the callee has
    /// received `incoming_call` and a pending entry is ticking; the caller's
    /// `calling` ack is the dispatcher's job.
    pub async fn place_call(
        &self,
        db: &DbPool,
        caller_id: i64,
        callee_id: i64,
        offer: Value,
    ) -> Result<(), HubError> {
        if caller_id == callee_id {
            return Err(HubError::validation("cannot call yourself"));
        }
        if !has_session_description(&offer) {
            return Err(HubError::validation("offer is not a session description"));
        }
        if palaver_db::users::get_user(db, callee_id).await?.is_none() {
            return Err(HubError::not_found("user not found"));
        }
        crate::blocks::ensure_unblocked(db, caller_id, callee_id).await?;
        let caller = palaver_db::users::get_user(db, caller_id)
            .await?
            .ok_or_else(|| HubError::internal("session user missing from store"))?;

        let mut table = self.table.lock().unwrap();
        if table.engaged(caller_id) || table.engaged(callee_id) {
            return Err(HubError::Busy { peer_id: callee_id });
        }

        table.pending.insert(
            callee_id,
            PendingCall { caller_id, placed_at: Instant::now() },
        );
        let delivered = self.presence.send(
            callee_id,
            ServerEvent::IncomingCall {
                from: CallPeer {
                    id: caller.id,
                    username: caller.username,
                    avatar: caller.avatar,
                },
                offer,
                channel: self.channel,
            },
        );
        if !delivered {
            table.pending.remove(&callee_id);
            return Err(HubError::unavailable("user unavailable"));
        }

        tracing::debug!(channel = self.channel.as_str(), caller_id, callee_id, "call placed");
        Ok(())
    }

    /// Connects a ringing call. The pending entry must still name this exact
    /// caller; an expired or superseded ring answers with a mismatch error.
    pub fn accept_call(
        &self,
        callee_id: i64,
        caller_id: i64,
        answer: Value,
    ) -> Result<(), HubError> {
        if !has_session_description(&answer) {
            return Err(HubError::validation("answer is not a session description"));
        }
        let mut table = self.table.lock().unwrap();
        match table.pending.get(&callee_id) {
            Some(p) if p.caller_id == caller_id => {}
            _ => return Err(HubError::not_found("no pending call from this user")),
        }

        table.pending.remove(&callee_id);
        table.busy.insert(caller_id, callee_id);
        table.busy.insert(callee_id, caller_id);
        table.rooms.insert(
            room_key(caller_id, callee_id),
            CallRoom {
                a: caller_id.min(callee_id),
                b: caller_id.max(callee_id),
                started_at: Instant::now(),
            },
        );

        let delivered = self.presence.send(
            caller_id,
            ServerEvent::CallAccepted { peer_id: callee_id, answer },
        );
        if !delivered {
            table.busy.remove(&caller_id);
            table.busy.remove(&callee_id);
            table.rooms.remove(&room_key(caller_id, callee_id));
            return Err(HubError::unavailable("caller is no longer available"));
        }

        tracing::debug!(channel = self.channel.as_str(), caller_id, callee_id, "call connected");
        Ok(())
    }

    /// Declines a ring. Stale rejects (already timed out, canceled, or
    /// re-placed by someone else) are quietly ignored.
    pub fn reject_call(&self, callee_id: i64, caller_id: i64) {
        let mut table = self.table.lock().unwrap();
        match table.pending.get(&callee_id) {
            Some(p) if p.caller_id == caller_id => {}
            _ => return,
        }
        table.pending.remove(&callee_id);
        self.presence
            .send(caller_id, ServerEvent::CallRejected { peer_id: callee_id });
    }

    /// Relays an ICE candidate. The candidate must name a transport; it is
    /// forwarded only while the pair is plausibly negotiating (a ring between
    /// them or an established call). A vanished or idle target is not an
    /// error: trickle candidates arriving after teardown are expected, so
    /// they drop without a reply.
    pub fn ice_candidate(&self, from_id: i64, to_id: i64, candidate: Value) -> Result<(), HubError> {
        if !has_transport_descriptor(&candidate) {
            return Err(HubError::validation("candidate carries no transport descriptor"));
        }
        let table = self.table.lock().unwrap();
        let negotiating = table.busy.get(&from_id) == Some(&to_id)
            || table.pending.get(&to_id).is_some_and(|p| p.caller_id == from_id)
            || table.pending.get(&from_id).is_some_and(|p| p.caller_id == to_id);
        if negotiating {
            self.presence
                .send(to_id, ServerEvent::IceCandidate { from_id, candidate });
        }
        Ok(())
    }

    /// Hangs up whatever `user_id` is doing: tears down an established call
    /// or cancels their outgoing ring. Idle users are a no-op.
    pub fn end_call(&self, user_id: i64) {
        let mut table = self.table.lock().unwrap();
        if let Some(peer_id) = table.busy.remove(&user_id) {
            table.busy.remove(&peer_id);
            table.rooms.remove(&room_key(user_id, peer_id));
            self.presence.send(
                peer_id,
                ServerEvent::CallEnded { peer_id: user_id, reason: "ended".to_string() },
            );
            tracing::debug!(channel = self.channel.as_str(), user_id, peer_id, "call ended");
        } else if let Some(callee_id) = table.ringing_callee(user_id) {
            table.pending.remove(&callee_id);
            self.presence.send(
                callee_id,
                ServerEvent::CallEnded { peer_id: user_id, reason: "canceled".to_string() },
            );
        }
    }

    /// Socket-gone cleanup: cancels any ring involving the user and tears
    /// down any call they were in, notifying the surviving party. Runs on
    /// disconnect and on supersession; safe to run more than once.
    pub fn handle_disconnect(&self, user_id: i64) {
        let mut table = self.table.lock().unwrap();

        if let Some(p) = table.pending.remove(&user_id) {
            self.presence.send(
                p.caller_id,
                ServerEvent::CallEnded {
                    peer_id: user_id,
                    reason: "peer_disconnected".to_string(),
                },
            );
        }
        if let Some(callee_id) = table.ringing_callee(user_id) {
            table.pending.remove(&callee_id);
            self.presence.send(
                callee_id,
                ServerEvent::CallEnded { peer_id: user_id, reason: "canceled".to_string() },
            );
        }
        if let Some(peer_id) = table.busy.remove(&user_id) {
            table.busy.remove(&peer_id);
            table.rooms.remove(&room_key(user_id, peer_id));
            self.presence.send(
                peer_id,
                ServerEvent::CallEnded {
                    peer_id: user_id,
                    reason: "peer_disconnected".to_string(),
                },
            );
        }
    }

    /// Expires rings older than `ttl`, notifying both parties. Returns how
    /// many were swept.
    pub fn ring_sweep(&self, ttl: Duration) -> usize {
        let mut table = self.table.lock().unwrap();
        let expired: Vec<(i64, i64)> = table
            .pending
            .iter()
            .filter(|(_, p)| p.placed_at.elapsed() >= ttl)
            .map(|(callee, p)| (*callee, p.caller_id))
            .collect();
        for (callee_id, caller_id) in &expired {
            table.pending.remove(callee_id);
            self.presence.send(
                *caller_id,
                ServerEvent::CallEnded { peer_id: *callee_id, reason: "timeout".to_string() },
            );
            self.presence.send(
                *callee_id,
                ServerEvent::CallEnded { peer_id: *caller_id, reason: "timeout".to_string() },
            );
        }
        if !expired.is_empty() {
            tracing::debug!(
                channel = self.channel.as_str(),
                swept = expired.len(),
                "unanswered rings timed out"
            );
        }
        expired.len()
    }

    // Table introspection, mostly for tests and the health surface.

    pub fn is_busy(&self, user_id: i64) -> bool {
        self.table.lock().unwrap().busy.contains_key(&user_id)
    }

    pub fn active_peer(&self, user_id: i64) -> Option<i64> {
        self.table.lock().unwrap().busy.get(&user_id).copied()
    }

    pub fn pending_caller(&self, callee_id: i64) -> Option<i64> {
        self.table
            .lock()
            .unwrap()
            .pending
            .get(&callee_id)
            .map(|p| p.caller_id)
    }

    pub fn room_count(&self) -> usize {
        self.table.lock().unwrap().rooms.len()
    }
}

/// Periodically expires unanswered rings until shutdown is signaled.
pub async fn run_ring_sweeper(
    engine: std::sync::Arc<CallEngine>,
    ttl: Duration,
    shutdown: std::sync::Arc<tokio::sync::Notify>,
) {
    let mut tick = tokio::time::interval(Duration::from_secs(5));
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = tick.tick() => {
                engine.ring_sweep(ttl);
            }
            _ = shutdown.notified() => break,
        }
    }
}
