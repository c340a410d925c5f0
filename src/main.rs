use anyhow::Result;
use lorans::config::Config;
use lorans::gateway::UdpPacketForwarder;
use lorans::processor::Pipeline;
use lorans::server::{InMemoryMetrics, LogOutput, OutputManager, ServerContext};
use lorans::storage::{Provisioning, Storage};
use std::sync::Arc;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::from_env()?;

    // Initialize tracing
    let filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive("lorans=info".parse()?);
    if config.log.plain {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    }

    info!("Starting LoRaNS v{}", lorans::VERSION);
    config.validate()?;
    info!("Configuration loaded successfully");

    // Storage, seeded from the provisioning file if there is one
    let storage = Storage::in_memory();
    let provisioning = match config.server.provision_file {
        Some(ref path) => {
            info!("Loading provisioning file {}", path.display());
            let provisioning = Provisioning::load(path)?;
            provisioning.apply(&storage)?;
            provisioning
        }
        None => {
            info!("No provisioning file configured, starting with empty storage");
            Provisioning::default()
        }
    };

    let metrics = Arc::new(InMemoryMetrics::new());
    let context = ServerContext::new(config.clone(), storage, metrics.clone());

    // Log every application's payloads
    let outputs = OutputManager::new(context.app_router.clone());
    for app in &provisioning.applications {
        if let Err(e) = outputs.add(app.app_eui, Box::new(LogOutput::new())) {
            error!("Unable to attach log output for {}: {}", app.app_eui, e);
        }
    }

    // Gateway transport
    info!("Starting packet forwarder on {}", config.gateway.bind_addr);
    let forwarder = UdpPacketForwarder::bind(config.gateway.bind_addr, context.clone()).await?;
    let (channels, forwarder_handle) = forwarder.start();

    // Packet pipeline between the transport's two channels
    let pipeline = Pipeline::new(context.clone()).start(channels.from_gateway, channels.to_gateway);

    info!("LoRaNS started successfully");

    // Wait for shutdown signal (SIGTERM or SIGINT)
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("SIGINT received, shutting down gracefully...");
        }
        _ = async {
            #[cfg(unix)]
            {
                let mut sigterm = tokio::signal::unix::signal(
                    tokio::signal::unix::SignalKind::terminate()
                ).expect("Failed to register SIGTERM handler");
                sigterm.recv().await;
            }
            #[cfg(not(unix))]
            {
                std::future::pending::<()>().await;
            }
        } => {
            info!("SIGTERM received, shutting down gracefully...");
        }
    }

    // Closing the transport input cascades through the pipeline
    forwarder_handle.stop();
    pipeline.join().await;
    forwarder_handle.join().await;

    // Outputs last so in-flight payloads are delivered
    outputs.shutdown().await;

    for (name, value) in metrics.snapshot() {
        info!(counter = name, value, "Final counter");
    }
    info!("LoRaNS shutdown complete");

    Ok(())
}
