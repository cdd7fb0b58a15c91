use std::time::Duration;

use anyhow::Result;
use axum::http::Method;
use clap::Parser;
use palaver_core::{calls, AppConfig, AppState};
use tracing_subscriber::EnvFilter;

mod cli;
mod config;

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::Args::parse();

    let filter = match &args.log {
        Some(directives) => EnvFilter::new(directives),
        None => EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("palaver=info,tower_http=debug")),
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut config = config::Config::load(&args.config)?;
    if let Some(bind) = args.bind {
        config.server.bind_address = bind;
    }
    if let Some(db_url) = args.db {
        config.database.url = db_url;
    }

    ensure_data_dirs(&config);

    let db = palaver_db::create_pool(&config.database.url, config.database.max_connections).await?;
    palaver_db::run_migrations(&db).await?;

    let state = AppState::new(
        db,
        AppConfig {
            jwt_secret: config.auth.jwt_secret.clone(),
            jwt_expiry_seconds: config.auth.jwt_expiry_seconds,
            worker_id: config.server.worker_id,
            ring_timeout_secs: config.call.ring_timeout_secs,
        },
    );

    // One ring sweeper per signaling channel; both stop on shutdown.
    let ring_ttl = Duration::from_secs(config.call.ring_timeout_secs);
    tokio::spawn(calls::run_ring_sweeper(
        state.audio_calls.clone(),
        ring_ttl,
        state.shutdown.clone(),
    ));
    tokio::spawn(calls::run_ring_sweeper(
        state.video_calls.clone(),
        ring_ttl,
        state.shutdown.clone(),
    ));

    let shutdown = state.shutdown.clone();
    let app = palaver_ws::gateway_router()
        .layer(build_cors_layer())
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(&config.server.bind_address).await?;

    print_startup_banner(&config.server.bind_address, &config.database.url);

    let shutdown_signal = async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                println!();
                tracing::info!("Shutting down (ctrl-c)...");
            }
            _ = shutdown.notified() => {
                tracing::info!("Shutting down...");
            }
        }
        shutdown.notify_waiters();
    };

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal)
        .await?;

    Ok(())
}

/// Create the sqlite database's parent directory before the pool opens it.
fn ensure_data_dirs(config: &config::Config) {
    if let Some(db_path) = config
        .database
        .url
        .strip_prefix("sqlite://")
        .and_then(|s| s.split('?').next())
    {
        if let Some(parent) = std::path::Path::new(db_path).parent() {
            if !parent.as_os_str().is_empty() {
                let _ = std::fs::create_dir_all(parent);
            }
        }
    }
}

fn build_cors_layer() -> tower_http::cors::CorsLayer {
    // Self-hosted deployments serve mobile and desktop clients from
    // arbitrary origins; the gateways authenticate with JWTs, not cookies.
    tower_http::cors::CorsLayer::new()
        .allow_origin(tower_http::cors::Any)
        .allow_methods([Method::GET])
        .allow_headers(tower_http::cors::Any)
}

fn print_startup_banner(bind_address: &str, db_url: &str) {
    let host = client_facing_host(bind_address);
    println!();
    println!("  ____       _");
    println!(" |  _ \\ __ _| | __ ___   _____ _ __");
    println!(" | |_) / _` | |/ _` \\ \\ / / _ \\ '__|");
    println!(" |  __/ (_| | | (_| |\\ V /  __/ |");
    println!(" |_|   \\__,_|_|\\__,_| \\_/ \\___|_|");
    println!();
    println!("  Listening:   http://{}", bind_address);
    println!("  Database:    {}", db_url);
    println!("  Gateways:    ws://{}/gateway/chat", host);
    println!("               ws://{}/gateway/call/audio", host);
    println!("               ws://{}/gateway/call/video", host);
    println!();
}

fn client_facing_host(bind_address: &str) -> String {
    if bind_address.starts_with("0.0.0.0:") {
        bind_address.replacen("0.0.0.0", "localhost", 1)
    } else if bind_address.starts_with("[::]:") {
        bind_address.replacen("[::]", "localhost", 1)
    } else {
        bind_address.to_string()
    }
}
