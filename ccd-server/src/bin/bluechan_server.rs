use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use ccd_server::{build_camera, CommandServer, ServerConfig};
use clap::Parser;
use shared::config_storage::ConfigStorage;
use tokio::net::TcpListener;
use tracing::info;

#[derive(Parser, Debug)]
#[command(author, version, about = "Command server for the Blue Channel CCD")]
struct Args {
    /// Configuration file (defaults to the config store)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Command port, overriding the configuration
    #[arg(long)]
    port: Option<u16>,

    /// Run with a simulated controller and synthetic images
    #[arg(long)]
    demo: bool,

    /// camserver address as host:port
    #[arg(long)]
    camserver: Option<String>,

    /// Folder for image files
    #[arg(long)]
    image_folder: Option<PathBuf>,

    /// Save the effective configuration to the config store and exit
    #[arg(long)]
    save_config: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let args = Args::parse();

    let storage = ConfigStorage::new().context("Failed to locate config store")?;
    let mut config = ServerConfig::load(&storage, args.config.as_deref())
        .context("Failed to load server configuration")?;
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(camserver) = args.camserver {
        config.camserver = camserver;
    }
    if let Some(folder) = args.image_folder {
        config.image_folder = folder;
    }

    if args.save_config {
        let path = config.save(&storage).context("Failed to save configuration")?;
        info!("Configuration saved to {}", path.display());
        return Ok(());
    }

    std::fs::create_dir_all(&config.image_folder).with_context(|| {
        format!(
            "Failed to create image folder {}",
            config.image_folder.display()
        )
    })?;

    info!(
        "Starting {} for detector {} ({})",
        config.server_name,
        config.detector.name,
        config.detector.geometry.image_size()
    );
    let camera = build_camera(&config, args.demo).context("Failed to set up camera")?;

    let listener = TcpListener::bind(("0.0.0.0", config.port))
        .await
        .with_context(|| format!("Failed to bind command port {}", config.port))?;
    Arc::new(CommandServer::new(camera)).serve(listener).await?;
    Ok(())
}
