use anyhow::Result;
use tracing::info;
use tracing_subscriber::EnvFilter;

use ocpbus::MessageBus;
use ocpplayer::MediaService;
use ocpplayer::backends::BackendPluginRegistry;
use ocpplayer::extractor::StreamExtractorSet;

#[tokio::main]
async fn main() -> Result<()> {
    // ========== Phase 1: infrastructure ==========
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = ocpconfig::load_config("")?;
    let liked_songs = ocpconfig::data_dir().join("liked_songs.json");

    let bus = MessageBus::new();

    // ========== Phase 2: plugins ==========
    // Backend plugins and stream extractors are host extensions; embedding
    // applications register theirs here before the service starts.
    let plugins = BackendPluginRegistry::new();
    let extractors = StreamExtractorSet::new();

    // ========== Phase 3: run ==========
    info!("starting OCPMedia");
    let service = MediaService::start(bus.clone(), config, extractors, &plugins, liked_songs);

    wait_for_exit_signal().await;

    service.shutdown();
    bus.shutdown();
    info!("OCPMedia stopped");
    Ok(())
}

async fn wait_for_exit_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM hook");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
