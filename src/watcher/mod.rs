//! Real-time mail store watcher.
//!
//! ```text
//! notify callback ──try_send──▶ bounded channel ──▶ debounce thread ──▶ on_flush
//!        │ (full)                                    (Coalescer)
//!        └──────── overflow flag ───────────────────────▲
//! ```
//!
//! The flush callback is the only thing that writes; the caller routes it
//! through the same lock as every other sync.

pub mod coalesce;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, TrySendError};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use tracing::{debug, info, warn};

use crate::error::{IndexError, Result};

pub use coalesce::{validate_path, Coalescer, Pending};

/// Watcher tuning.
#[derive(Debug, Clone)]
pub struct WatchOptions {
    /// Quiet period after the last event before a flush.
    pub debounce: Duration,
    /// Upper bound on how long the oldest pending change waits, even
    /// while events keep arriving.
    pub max_delay: Duration,
    /// Bound on queued raw events and on distinct pending identities.
    pub max_pending: usize,
    pub excluded: Vec<String>,
}

impl Default for WatchOptions {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(500),
            max_delay: Duration::from_millis(2000),
            max_pending: 10_000,
            excluded: vec!["Drafts".to_string()],
        }
    }
}

/// A running watcher. Stops when dropped.
pub struct IndexWatcher {
    root: PathBuf,
    watcher: Option<RecommendedWatcher>,
    stop: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl IndexWatcher {
    /// Watch `root` recursively and call `on_flush` with each coalesced batch.
    pub fn start<F>(root: &Path, options: WatchOptions, mut on_flush: F) -> Result<Self>
    where
        F: FnMut(Pending) + Send + 'static,
    {
        if !root.is_dir() {
            return Err(IndexError::MailStoreNotFound(root.to_path_buf()));
        }

        let (tx, rx) = mpsc::sync_channel::<Event>(options.max_pending.max(1));
        let overflow = Arc::new(AtomicBool::new(false));
        let stop = Arc::new(AtomicBool::new(false));

        let callback_overflow = Arc::clone(&overflow);
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
            Ok(event) => match tx.try_send(event) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => callback_overflow.store(true, Ordering::Relaxed),
                Err(TrySendError::Disconnected(_)) => {}
            },
            Err(e) => warn!(error = %e, "Watcher error"),
        })?;
        watcher.watch(root, RecursiveMode::Recursive)?;

        let mut coalescer = Coalescer::new(root, options.excluded.clone(), options.max_pending);
        let worker_stop = Arc::clone(&stop);
        let debounce = options.debounce;
        let max_delay = options.max_delay.max(debounce);
        let worker = std::thread::Builder::new()
            .name("mailindex-watcher".into())
            .spawn(move || {
                // When the oldest change still waiting was first seen.
                let mut oldest: Option<Instant> = None;
                loop {
                    let wait = oldest.map_or(debounce, |first| {
                        debounce.min(max_delay.saturating_sub(first.elapsed()))
                    });
                    let quiet = match rx.recv_timeout(wait) {
                        Ok(event) => {
                            coalescer.record(&event);
                            false
                        }
                        Err(RecvTimeoutError::Timeout) => true,
                        Err(RecvTimeoutError::Disconnected) => break,
                    };
                    if worker_stop.load(Ordering::Relaxed) {
                        break;
                    }
                    if overflow.swap(false, Ordering::Relaxed) {
                        coalescer.mark_overflow();
                    }
                    if coalescer.is_empty() {
                        oldest = None;
                        continue;
                    }

                    let first = *oldest.get_or_insert_with(Instant::now);
                    if quiet || first.elapsed() >= max_delay {
                        on_flush(coalescer.take());
                        oldest = None;
                    }
                }
            })
            .map_err(|e| IndexError::io(root, e))?;

        info!(
            root = %root.display(),
            debounce_ms = debounce.as_millis() as u64,
            max_delay_ms = max_delay.as_millis() as u64,
            "Watching mail store"
        );
        Ok(Self {
            root: root.to_path_buf(),
            watcher: Some(watcher),
            stop,
            worker: Some(worker),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn is_running(&self) -> bool {
        self.worker.as_ref().is_some_and(|w| !w.is_finished())
    }

    /// Stop watching and wait for the debounce thread. Pending changes are
    /// dropped; the next sync picks them up from disk.
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        // Dropping the notify watcher disconnects the channel.
        self.watcher.take();
        if let Some(worker) = self.worker.take() {
            // Stopped from inside a flush callback: the loop exits on its own.
            if worker.thread().id() == std::thread::current().id() {
                return;
            }
            if worker.join().is_err() {
                warn!("Watcher thread panicked");
            }
            debug!(root = %self.root.display(), "Watcher stopped");
        }
    }
}

impl Drop for IndexWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}
