use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use soundboard_server::audio::local::LocalAudioEngine;
use soundboard_server::config::BotConfig;
use soundboard_server::engine::playback::PlaybackRegistry;
use soundboard_server::engine::service::BotService;
use soundboard_server::engine::session::{Session, SessionConfig};
use soundboard_server::engine::sounds::SoundLibrary;
use soundboard_server::gateway::local::LocalGateway;
use soundboard_server::web::app_state::AppState;
use soundboard_server::web::router::build_router;

#[derive(Parser)]
#[command(name = "soundboard-server", about = "Voice soundboard bot")]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, default_value = "soundboard.toml")]
    config: String,

    /// Address for the web server, overriding the config file.
    #[arg(long)]
    web_address: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let mut config = BotConfig::load(&cli.config)?;
    if let Some(address) = cli.web_address {
        config.server.web_address = address;
    }

    let shutdown = CancellationToken::new();

    // Sound library, polled in the background
    let library = Arc::new(SoundLibrary::from_config(&config.sounds));
    tokio::spawn(library.clone().run(shutdown.child_token()));

    let playback = Arc::new(PlaybackRegistry::new(
        Arc::new(LocalAudioEngine::new()),
        library.clone(),
    ));

    let gateway = LocalGateway::from_config(&config.gateway);
    let session = Session::new(Arc::new(gateway), SessionConfig::from(&config.session));
    let service = Arc::new(BotService::new(session, playback, library));

    let app = build_router(Arc::new(AppState {
        service: service.clone(),
        shutdown: shutdown.clone(),
    }));

    let web_addr = &config.server.web_address;
    let listener = tokio::net::TcpListener::bind(web_addr)
        .await
        .with_context(|| format!("failed to bind web listener on {web_addr}"))?;

    info!("Soundboard server starting on {}", web_addr);

    let signal = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown requested");
            signal.cancel();
        })
        .await
        .context("server error")?;

    shutdown.cancel();
    service.shutdown().await;
    Ok(())
}
