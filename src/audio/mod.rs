//! Audio clip playback
//!
//! One clip plays at a time, no mixing. Clips are discovered by scanning the
//! configured directory; scenes refer to them by file stem. Playback goes
//! through an [`AudioSink`] so tests can swap in a recording double, and the
//! production sink shells out to the system player.

use crate::error::{Error, Result};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const CLIP_EXTENSIONS: [&str; 3] = ["wav", "mp3", "ogg"];

/// Playback backend
pub trait AudioSink: Send + Sync {
    fn start(&self, path: &Path) -> Result<()>;

    fn stop(&self);

    fn is_busy(&self) -> bool;

    /// Playback volume, 0.0..=1.0; backends without volume control ignore it
    fn set_volume(&self, _volume: f32) {}
}

/// Sink that spawns the system audio player per clip
pub struct ProcessSink {
    player: String,
    child: Mutex<Option<Child>>,
}

impl ProcessSink {
    /// `player` is the binary to spawn, e.g. "aplay" or "mpg123"
    pub fn new(player: &str) -> Self {
        Self {
            player: player.to_string(),
            child: Mutex::new(None),
        }
    }
}

impl AudioSink for ProcessSink {
    fn start(&self, path: &Path) -> Result<()> {
        self.stop();
        let child = Command::new(&self.player)
            .arg(path)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| Error::Other(format!("failed to start {}: {}", self.player, e)))?;
        log::info!("Playing {} via {}", path.display(), self.player);
        *self.child.lock() = Some(child);
        Ok(())
    }

    fn stop(&self) {
        if let Some(mut child) = self.child.lock().take() {
            let _ = child.kill();
            let _ = child.wait();
            log::debug!("Stopped active clip");
        }
    }

    fn is_busy(&self) -> bool {
        let mut guard = self.child.lock();
        match guard.as_mut() {
            Some(child) => match child.try_wait() {
                Ok(Some(_)) => {
                    *guard = None;
                    false
                }
                Ok(None) => true,
                Err(_) => false,
            },
            None => false,
        }
    }
}

#[derive(Default)]
struct MockSinkInner {
    started: Vec<PathBuf>,
    stops: u32,
    busy: bool,
    volume: f32,
}

/// Recording sink double for scene and player tests
#[derive(Clone, Default)]
pub struct MockSink {
    inner: Arc<Mutex<MockSinkInner>>,
}

impl MockSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn started(&self) -> Vec<PathBuf> {
        self.inner.lock().started.clone()
    }

    pub fn stop_count(&self) -> u32 {
        self.inner.lock().stops
    }

    pub fn volume(&self) -> f32 {
        self.inner.lock().volume
    }
}

impl AudioSink for MockSink {
    fn start(&self, path: &Path) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.started.push(path.to_path_buf());
        inner.busy = true;
        Ok(())
    }

    fn stop(&self) {
        let mut inner = self.inner.lock();
        inner.stops += 1;
        inner.busy = false;
    }

    fn is_busy(&self) -> bool {
        self.inner.lock().busy
    }

    fn set_volume(&self, volume: f32) {
        self.inner.lock().volume = volume;
    }
}

/// The single-clip audio player
pub struct AudioPlayer {
    library: RwLock<BTreeMap<String, PathBuf>>,
    directory: PathBuf,
    sink: Arc<dyn AudioSink>,
    /// Bumped on every play/stop; cancels any delayed start still pending
    generation: Arc<AtomicU64>,
}

impl AudioPlayer {
    pub fn new(directory: impl Into<PathBuf>, sink: Arc<dyn AudioSink>) -> Arc<Self> {
        let player = Arc::new(Self {
            library: RwLock::new(BTreeMap::new()),
            directory: directory.into(),
            sink,
            generation: Arc::new(AtomicU64::new(0)),
        });
        let found = player.rescan();
        log::info!(
            "Audio library: {} clips in {}",
            found,
            player.directory.display()
        );
        player
    }

    /// Re-scan the clip directory; returns the number of clips found
    pub fn rescan(&self) -> usize {
        let mut library = BTreeMap::new();
        if let Ok(entries) = std::fs::read_dir(&self.directory) {
            for entry in entries.flatten() {
                let path = entry.path();
                let is_clip = path
                    .extension()
                    .and_then(|e| e.to_str())
                    .map(|e| CLIP_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
                    .unwrap_or(false);
                if !is_clip {
                    continue;
                }
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    library.insert(stem.to_ascii_lowercase(), path);
                }
            }
        }
        let count = library.len();
        *self.library.write() = library;
        count
    }

    /// Whether a clip name resolves in the library
    pub fn has_clip(&self, name: &str) -> bool {
        self.library.read().contains_key(&name.to_ascii_lowercase())
    }

    pub fn clip_names(&self) -> Vec<String> {
        self.library.read().keys().cloned().collect()
    }

    /// Schedule a clip after `delay`; zero starts it immediately
    ///
    /// A new play displaces whatever is active or pending. A missing clip is
    /// an error to the direct caller, but scene execution treats it as
    /// non-fatal and only logs it.
    pub fn play(&self, name: &str, delay: Duration) -> Result<()> {
        let path = self
            .library
            .read()
            .get(&name.to_ascii_lowercase())
            .cloned()
            .ok_or_else(|| Error::AudioMissing(name.to_string()))?;

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.sink.stop();

        if delay.is_zero() {
            return self.sink.start(&path);
        }

        let sink = Arc::clone(&self.sink);
        let gen_cell = Arc::clone(&self.generation);
        thread::Builder::new()
            .name("audio-delay".to_string())
            .spawn(move || {
                thread::sleep(delay);
                if gen_cell.load(Ordering::SeqCst) == generation {
                    if let Err(e) = sink.start(&path) {
                        log::warn!("Delayed audio start failed: {}", e);
                    }
                } else {
                    log::debug!("Delayed clip superseded before start");
                }
            })
            .map_err(|e| Error::Other(format!("failed to spawn audio delay: {}", e)))?;
        Ok(())
    }

    /// Stop the active clip and cancel any pending delayed start
    pub fn stop(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.sink.stop();
    }

    pub fn is_busy(&self) -> bool {
        self.sink.is_busy()
    }

    pub fn set_volume(&self, volume: f32) {
        self.sink.set_volume(volume.clamp(0.0, 1.0));
    }
}
