pub mod auth;
pub mod blocks;
pub mod calls;
pub mod delivery;
pub mod error;
pub mod presence;

use std::sync::Arc;

use palaver_db::DbPool;
use palaver_models::CallChannel;
use tokio::sync::Notify;

use calls::CallEngine;
use presence::PresenceRegistry;

pub use error::HubError;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub jwt_secret: String,
    pub jwt_expiry_seconds: u64,
    /// Worker bits baked into generated snowflake ids.
    pub worker_id: u16,
    /// How long an unanswered call rings before both sides get a timeout.
    pub ring_timeout_secs: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            jwt_secret: "insecure-dev-secret".to_string(),
            jwt_expiry_seconds: 86_400,
            worker_id: 1,
            ring_timeout_secs: 60,
        }
    }
}

/// Shared handle to everything the gateways dispatch into: the store, the
/// chat presence registry, and one call engine per signaling channel. Cheap
/// to clone; all registries sit behind Arcs and are created here, never as
/// globals.
#[derive(Clone)]
pub struct AppState {
    pub db: DbPool,
    pub config: AppConfig,
    pub chat: Arc<PresenceRegistry>,
    pub audio_calls: Arc<CallEngine>,
    pub video_calls: Arc<CallEngine>,
    pub shutdown: Arc<Notify>,
}

impl AppState {
    pub fn new(db: DbPool, config: AppConfig) -> Self {
        Self {
            db,
            config,
            chat: Arc::new(PresenceRegistry::new("chat")),
            audio_calls: Arc::new(CallEngine::new(CallChannel::Audio)),
            video_calls: Arc::new(CallEngine::new(CallChannel::Video)),
            shutdown: Arc::new(Notify::new()),
        }
    }

    pub fn call_engine(&self, channel: CallChannel) -> &Arc<CallEngine> {
        match channel {
            CallChannel::Audio => &self.audio_calls,
            CallChannel::Video => &self.video_calls,
        }
    }
}
