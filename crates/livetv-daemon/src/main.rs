mod core;
mod http;
mod mpv;
mod player;
mod socket;

use livetv_proto::config::Config;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Debug, Clone)]
pub enum BroadcastMessage {
    StateUpdated,
    Log(String),
    /// A failure the host UI should show, e.g. a schedule that cannot be
    /// loaded or a player that refused a file.
    Error(String),
}

/// A custom tracing layer that forwards log messages to the broadcast channel
struct BroadcastLayer {
    sender: broadcast::Sender<BroadcastMessage>,
}

impl BroadcastLayer {
    fn new(sender: broadcast::Sender<BroadcastMessage>) -> Self {
        Self { sender }
    }
}

impl<S> tracing_subscriber::Layer<S> for BroadcastLayer
where
    S: tracing::Subscriber,
{
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: tracing_subscriber::layer::Context<'_, S>) {
        // Only WARN and ERROR reach host UIs
        let level = event.metadata().level();
        if !matches!(*level, tracing::Level::WARN | tracing::Level::ERROR) {
            return;
        }

        let mut message = format!("{} [{}] ", chrono::Local::now().format("%H:%M:%S"), level);
        let mut visitor = MessageVisitor(&mut message);
        event.record(&mut visitor);

        // No receivers is fine
        let _ = self.sender.send(BroadcastMessage::Log(message));
    }
}

struct MessageVisitor<'a>(&'a mut String);

impl<'a> tracing::field::Visit for MessageVisitor<'a> {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.0.push_str(&format!("{:?}", value));
        } else {
            self.0.push_str(&format!(" {}={:?}", field.name(), value));
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Broadcast channel first so logging can use it
    let (broadcast_tx, _) = broadcast::channel::<BroadcastMessage>(100);

    let data_dir = livetv_proto::platform::data_dir();
    std::fs::create_dir_all(&data_dir)?;
    let log_path = data_dir.join("daemon.log");

    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)?;

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(log_file)
        .with_ansi(false);

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(BroadcastLayer::new(broadcast_tx.clone()))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                tracing_subscriber::EnvFilter::new("info,livetv_daemon=debug,livetv_proto=debug")
            }),
        )
        .init();

    info!("Log file: {:?}", log_path);

    let config = Config::load()?;
    info!("Config loaded from: {:?}", Config::config_path());

    // Event channel: every input funnels into ChannelCore
    let (event_tx, event_rx) = mpsc::channel::<core::ChannelEvent>(256);

    let player = Arc::new(mpv::MpvPlayer::new(&config.mpv, event_tx.clone()));
    let sources = core::ScheduleSources::from_config(&config)?;
    let channel_core = core::ChannelCore::new(
        &config,
        player,
        sources,
        broadcast_tx.clone(),
        event_tx.clone(),
    )?;

    let state_manager = channel_core.state_manager();

    let _socket_handle = socket::start_server(
        config.socket.bind_address.clone(),
        config.socket.port,
        state_manager.clone(),
        event_tx.clone(),
        broadcast_tx.clone(),
    );

    if config.http.enabled {
        let _http_handle = http::start_server(
            config.http.bind_address.clone(),
            config.http.port,
            state_manager.clone(),
            event_tx.clone(),
        );
    }

    let shutdown_tx = event_tx.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl-C: {}", e);
            return;
        }
        info!("Ctrl-C received");
        let _ = shutdown_tx.send(core::ChannelEvent::Shutdown).await;
    });

    info!("Daemon initialised, running event loop");
    channel_core.run(event_rx).await?;

    Ok(())
}
