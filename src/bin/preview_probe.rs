//! Preview Probe
//!
//! Starts previews for the given sources against the local relay and logs
//! every status change until Ctrl+C.
//!
//! Usage: preview-probe [--config preview.toml] <source-id>...

use std::process::ExitCode;

use rtc_preview::{ConnectionStatus, PreviewConfig, PreviewManager, TrackKind};
use tokio::sync::{broadcast, mpsc};

struct Args {
    config: Option<String>,
    sources: Vec<String>,
}

fn parse_args() -> Result<Args, String> {
    let mut config = None;
    let mut sources = Vec::new();
    let mut args = std::env::args().skip(1);

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" | "-c" => {
                config = Some(args.next().ok_or("--config needs a path")?);
            }
            "--help" | "-h" => return Err(String::new()),
            _ => sources.push(arg),
        }
    }

    if sources.is_empty() {
        return Err("no source ids given".into());
    }
    Ok(Args { config, sources })
}

#[tokio::main]
async fn main() -> ExitCode {
    // Initialize logging
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = match parse_args() {
        Ok(args) => args,
        Err(e) => {
            if !e.is_empty() {
                eprintln!("Error: {}", e);
            }
            eprintln!("Usage: preview-probe [--config preview.toml] <source-id>...");
            return ExitCode::FAILURE;
        }
    };

    let config = match &args.config {
        Some(path) => PreviewConfig::load(path),
        None => Ok(PreviewConfig::default()),
    };
    let manager = match config.and_then(PreviewManager::from_config) {
        Ok(manager) => manager,
        Err(e) => {
            eprintln!("Error: {}", e);
            return ExitCode::FAILURE;
        }
    };

    // Setup Ctrl+C handler
    let (stop_tx, mut stop_rx) = mpsc::unbounded_channel();
    if let Err(e) = ctrlc::set_handler(move || {
        let _ = stop_tx.send(());
    }) {
        eprintln!("Error setting Ctrl+C handler: {}", e);
        return ExitCode::FAILURE;
    }

    log::info!("Relay: {}", manager.config().relay_url);
    if !manager.pre_warm().await {
        log::warn!("Relay did not answer the availability probe");
    }

    let mut events = manager.subscribe();
    for source_id in &args.sources {
        let manager = manager.clone();
        let source_id = source_id.clone();
        tokio::spawn(async move { manager.start_connection(&source_id).await });
    }

    loop {
        tokio::select! {
            _ = stop_rx.recv() => break,
            event = events.recv() => match event {
                Ok(event) => {
                    match event.status {
                        ConnectionStatus::Playing => {
                            let stream = manager.get_stream(&event.source_id);
                            let video = stream.as_ref().is_some_and(|s| s.has_kind(TrackKind::Video));
                            let audio = stream.as_ref().is_some_and(|s| s.has_kind(TrackKind::Audio));
                            log::info!("[{}] playing (video: {}, audio: {})", event.source_id, video, audio);
                        }
                        ConnectionStatus::Error | ConnectionStatus::Unavailable => {
                            log::warn!(
                                "[{}] {}: {}",
                                event.source_id,
                                event.status,
                                manager.get_error(&event.source_id).unwrap_or_default()
                            );
                        }
                        status => log::info!("[{}] {}", event.source_id, status),
                    }
                    log::debug!("Pool: {:?}", manager.pool_stats());
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    log::warn!("Missed {} status events", missed);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }

    log::info!("Stopping...");
    manager.shutdown().await;
    ExitCode::SUCCESS
}
