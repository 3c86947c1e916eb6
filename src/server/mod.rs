//! TCP command server
//!
//! Accepts client connections and runs two threads per client: a receiver
//! that reads framed command envelopes and writes replies, and a publisher
//! that forwards broadcast events (telemetry, scene lifecycle, alerts,
//! state changes) from the event bus. Both share the socket's write side
//! through a mutex so reply and broadcast frames never interleave.

pub mod wire;

use crate::bus::EventBus;
use crate::dispatch::Dispatcher;
use crate::error::{Error, Result};
use parking_lot::Mutex;
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// How often the publisher thread drains its subscription
const PUBLISH_POLL: Duration = Duration::from_millis(20);

/// Run the accept loop until `running` clears
///
/// Blocks the calling thread; client handlers run on their own threads.
pub fn serve(
    bind_address: &str,
    dispatcher: Dispatcher,
    events: EventBus,
    running: Arc<AtomicBool>,
) -> Result<()> {
    let listener = TcpListener::bind(bind_address)
        .map_err(|e| Error::Other(format!("failed to bind {}: {}", bind_address, e)))?;
    listener.set_nonblocking(true)?;
    log::info!("TCP server listening on {}", bind_address);

    while running.load(Ordering::Relaxed) {
        match listener.accept() {
            Ok((stream, addr)) => {
                log::info!("Client connected: {}", addr);
                if let Err(e) = spawn_client(stream, dispatcher.clone(), &events, &running) {
                    log::error!("Failed to start client threads: {}", e);
                }
                events.prune();
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(100));
            }
            Err(e) => {
                log::error!("Accept error: {}", e);
            }
        }
    }

    log::info!("TCP server stopped");
    Ok(())
}

fn spawn_client(
    stream: TcpStream,
    dispatcher: Dispatcher,
    events: &EventBus,
    running: &Arc<AtomicBool>,
) -> Result<()> {
    stream.set_read_timeout(Some(Duration::from_millis(500)))?;
    let _ = stream.set_nodelay(true);

    // Reads stay on the receiver; all writes (replies and broadcasts) go
    // through one shared handle so frames never interleave.
    let write_half = Arc::new(Mutex::new(stream.try_clone()?));

    let subscription = events.subscribe();
    let pub_running = Arc::clone(running);
    let pub_write = Arc::clone(&write_half);
    thread::Builder::new()
        .name("tcp-publisher".to_string())
        .spawn(move || {
            while pub_running.load(Ordering::Relaxed) {
                let mut disconnected = false;
                while let Some(event) = subscription.try_recv() {
                    let payload = match serde_json::to_vec(&event) {
                        Ok(payload) => payload,
                        Err(e) => {
                            log::error!("Failed to serialize event: {}", e);
                            continue;
                        }
                    };
                    if wire::write_frame(&mut pub_write.lock(), &payload).is_err() {
                        disconnected = true;
                        break;
                    }
                }
                if disconnected {
                    break;
                }
                thread::sleep(PUBLISH_POLL);
            }
            log::debug!("Publisher thread exiting");
        })
        .map_err(|e| Error::Other(format!("failed to spawn publisher: {}", e)))?;

    let recv_running = Arc::clone(running);
    thread::Builder::new()
        .name("tcp-receiver".to_string())
        .spawn(move || {
            let mut stream = stream;
            while recv_running.load(Ordering::Relaxed) {
                match wire::read_frame(&mut stream) {
                    Ok(Some(payload)) => {
                        let reply = dispatcher.handle_raw(&payload);
                        let encoded = match serde_json::to_vec(&reply) {
                            Ok(encoded) => encoded,
                            Err(e) => {
                                log::error!("Failed to serialize reply: {}", e);
                                continue;
                            }
                        };
                        if wire::write_frame(&mut write_half.lock(), &encoded).is_err() {
                            break;
                        }
                    }
                    Ok(None) => continue,
                    Err(Error::Io(ref e))
                        if e.kind() == std::io::ErrorKind::UnexpectedEof
                            || e.kind() == std::io::ErrorKind::ConnectionReset =>
                    {
                        log::info!("Client disconnected");
                        break;
                    }
                    Err(e) => {
                        log::error!("Receive error: {}", e);
                        break;
                    }
                }
            }
            log::debug!("Receiver thread exiting");
        })
        .map_err(|e| Error::Other(format!("failed to spawn receiver: {}", e)))?;

    Ok(())
}
