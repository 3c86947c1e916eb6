//! YantraIO daemon entry point

use std::env;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use yantra_io::{ConfigStore, System};

fn main() -> yantra_io::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    log::info!("YantraIO v{} starting...", env!("CARGO_PKG_VERSION"));

    let config_dir = env::args().nth(1).unwrap_or_else(|| "configs".to_string());
    log::info!("Using config directory: {}", config_dir);

    let config = ConfigStore::load(&config_dir)?;
    let bind_address = config.hardware.network.bind_address.clone();

    let system = System::new(config)?;
    let dispatcher = system.dispatcher();
    let events = system.events.clone();

    let running = Arc::new(AtomicBool::new(true));
    let handler_running = Arc::clone(&running);
    ctrlc::set_handler(move || {
        log::info!("Received shutdown signal");
        handler_running.store(false, Ordering::Relaxed);
    })
    .map_err(|e| yantra_io::Error::Other(format!("failed to set signal handler: {}", e)))?;

    log::info!("YantraIO running. Press Ctrl-C to stop.");
    let serve_result = yantra_io::server::serve(&bind_address, dispatcher, events, running);

    system.shutdown();
    serve_result?;
    log::info!("YantraIO stopped");
    Ok(())
}
