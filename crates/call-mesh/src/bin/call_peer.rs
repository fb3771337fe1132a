//! Command-line call participant
//!
//! Joins a call room over WebSocket signaling with synthetic capture devices
//! and real webrtc-rs peer connections.
//!
//! # Usage
//!
//! ```bash
//! CALL_SIGNALING_URL="ws://localhost:3000" CALL_AUTH_TOKEN="..." \
//! cargo run --bin call-peer -- --room r1 --user a1
//! ```
//!
//! Commands on stdin: `m` toggle mic, `c` toggle camera, `r` health check,
//! `e` end the call for everyone, `q` leave.
//!
//! # Environment Variables
//!
//! - `CALL_SIGNALING_URL`: signaling WebSocket URL
//! - `CALL_AUTH_TOKEN`: bearer token for the signaling server
//! - `CALL_TURN_URLS`, `CALL_TURN_USERNAME`, `CALL_TURN_CREDENTIAL`: relay servers
//! - `RUST_LOG`: logging level (default: `info`)

use std::sync::Arc;

use call_mesh::signaling::websocket;
use call_mesh::{
    CallConfig, CallHandle, CallParams, CallSession, CallStatus, CaptureRequest, ControlState,
    RtcLinkFactory, SyntheticDevices,
};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "call-peer", about = "Join a mesh video call room")]
struct Args {
    /// Room to join
    #[arg(long, env = "CALL_ROOM_ID")]
    room: String,

    /// Local participant id
    #[arg(long, env = "CALL_USER_ID")]
    user: String,

    /// Signaling WebSocket URL (overrides CALL_SIGNALING_URL)
    #[arg(long)]
    signaling_url: Option<String>,

    /// Bearer token (overrides CALL_AUTH_TOKEN)
    #[arg(long)]
    auth_token: Option<String>,

    /// Capture audio only
    #[arg(long)]
    no_video: bool,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    ctrlc::set_handler(move || {
        eprintln!("\nCtrl+C received, leaving call...");
        if shutdown_tx.send_replace(true) {
            std::process::exit(0);
        }
    })?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(num_cpus::get())
        .thread_name("call-worker")
        .enable_all()
        .build()?;

    runtime.block_on(async_main(args, shutdown_rx))
}

async fn async_main(
    args: Args,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let mut config = CallConfig::from_env();
    if let Some(url) = args.signaling_url {
        config.signaling_url = url;
    }
    if let Some(token) = args.auth_token {
        config = config.with_auth_token(token);
    }
    config.capture = CaptureRequest {
        audio: true,
        video: !args.no_video,
    };
    config.validate()?;

    info!("Configuration:");
    info!("  Signaling URL: {}", config.signaling_url);
    info!("  STUN servers: {:?}", config.stun_servers);
    info!(
        "  TURN servers: {:?}",
        config.turn.as_ref().map(|t| &t.urls)
    );

    let (channel, events) =
        websocket::connect(&config.signaling_url, config.auth_token.as_deref()).await?;
    let links = Arc::new(RtcLinkFactory::new(&config)?);

    let params = CallParams {
        room_id: args.room,
        user_id: args.user,
        capture: config.capture,
    };
    let (call, task) = CallSession::spawn(
        params,
        channel,
        events,
        Arc::new(SyntheticDevices::new()),
        links,
    );
    spawn_watchers(&call);

    let mut status = call.status();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            changed = status.wait_for(|s| *s == CallStatus::Ended) => {
                if changed.is_ok() {
                    info!("Call ended");
                }
                break;
            }
            line = lines.next_line() => match line? {
                None => break,
                Some(line) => {
                    if !run_command(&call, line.trim()).await {
                        break;
                    }
                }
            },
        }
    }

    call.leave().await;
    if let Err(e) = task.await {
        warn!("Call session task failed: {}", e);
    }
    info!("Left call");
    Ok(())
}

/// Returns `false` when the loop should stop
async fn run_command(call: &CallHandle, command: &str) -> bool {
    match command {
        "m" => call.toggle_mic(),
        "c" => call.toggle_camera(),
        "r" => call.visibility_resumed(),
        "e" => {
            call.end_call();
            return false;
        }
        "q" => return false,
        "p" => {
            for peer in call.list_peers().await {
                info!(
                    "  {} state={:?} negotiation={:?} media={}",
                    peer.remote_id, peer.state, peer.negotiation, peer.has_remote_stream
                );
            }
        }
        "" => {}
        other => warn!("Unknown command {:?} (m, c, r, p, e, q)", other),
    }
    true
}

fn spawn_watchers(call: &CallHandle) {
    let mut participants = call.participants();
    tokio::spawn(async move {
        while participants.changed().await.is_ok() {
            info!("Participants: {:?}", *participants.borrow_and_update());
        }
    });

    let mut remotes = call.remote_streams();
    tokio::spawn(async move {
        while remotes.changed().await.is_ok() {
            let ids: Vec<String> = remotes.borrow_and_update().keys().cloned().collect();
            info!("Remote streams from: {:?}", ids);
        }
    });

    let mut local = call.local_media();
    tokio::spawn(async move {
        while local.changed().await.is_ok() {
            let snapshot = local.borrow_and_update().clone();
            let controls = ControlState::from(&snapshot);
            if let Some(err) = &snapshot.capture_error {
                warn!("Capture failed: {}", err);
            }
            info!(
                "Local media: stream={} [{}] [{}]",
                snapshot.stream.is_some(),
                controls.mic_label(),
                controls.camera_label()
            );
        }
    });
}

fn init_tracing() {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}
