//! Index manager: owns the single writer and serves every operation.
//!
//! All writes (builds, syncs, watcher batches) go through one
//! `Mutex`-guarded connection. Reads open their own short-lived read-only
//! connection, so searches never wait for a sync.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::config::{self, Config};
use crate::error::{IndexError, Result};
use crate::index::{MailboxCount, Storage};
use crate::model::attachment::AttachmentContent;
use crate::model::identity::Identity;
use crate::parser::{self, mime::MAX_ATTACHMENT_SIZE};
use crate::search::{self, MessageSummary, SearchRequest};
use crate::store::{self, find_mail_directory};
use crate::sync::{self, ApplyOptions, ChangeCount};
use crate::watcher::{IndexWatcher, Pending, WatchOptions};

/// Progress callback usable from a background thread.
pub type ProgressFn = Box<dyn Fn(usize, usize) -> bool + Send>;

/// Called after each watcher batch is applied.
pub type UpdateFn = Box<dyn Fn(ChangeCount) + Send>;

/// Live link to the mail client, implemented outside this crate.
pub trait MailClientBridge: Send + Sync {
    /// Translate a display name ("Work") to the account id used in the index.
    fn account_id_for_name(&self, name: &str) -> Option<String>;

    /// Current file of a message the index cannot resolve.
    fn locate_message(&self, identity: &Identity) -> Option<PathBuf>;
}

/// Everything the manager needs to know.
#[derive(Debug, Clone)]
pub struct IndexSettings {
    pub db_path: PathBuf,
    pub mail_root: PathBuf,
    pub max_per_mailbox: usize,
    pub staleness_hours: f64,
    pub exclude_mailboxes: Vec<String>,
    pub debounce: Duration,
    pub max_delay: Duration,
    pub max_pending: usize,
}

impl IndexSettings {
    /// Settings with default limits.
    pub fn new(db_path: impl Into<PathBuf>, mail_root: impl Into<PathBuf>) -> Self {
        let defaults = Config::default();
        Self {
            db_path: db_path.into(),
            mail_root: mail_root.into(),
            max_per_mailbox: defaults.index.max_per_mailbox,
            staleness_hours: defaults.index.staleness_hours,
            exclude_mailboxes: defaults.store.exclude_mailboxes,
            debounce: Duration::from_millis(defaults.watcher.debounce_ms),
            max_delay: Duration::from_millis(defaults.watcher.max_delay_ms),
            max_pending: defaults.watcher.max_pending,
        }
    }

    /// Resolve settings from the config file, locating the mail store if unset.
    pub fn from_config(config: &Config) -> Result<Self> {
        let mail_root = match &config.store.mail_root {
            Some(root) => root.clone(),
            None => find_mail_directory()?,
        };
        Ok(Self {
            db_path: config::db_path(config),
            mail_root,
            max_per_mailbox: config.index.max_per_mailbox,
            staleness_hours: config.index.staleness_hours,
            exclude_mailboxes: config.store.exclude_mailboxes.clone(),
            debounce: Duration::from_millis(config.watcher.debounce_ms),
            max_delay: Duration::from_millis(config.watcher.max_delay_ms),
            max_pending: config.watcher.max_pending,
        })
    }

    fn apply_options(&self) -> ApplyOptions {
        ApplyOptions {
            max_per_mailbox: self.max_per_mailbox,
            ..Default::default()
        }
    }
}

/// Result of a full build.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BuildReport {
    pub indexed: usize,
    /// Files that could not be parsed.
    pub skipped: usize,
    pub excluded_by_cap: usize,
    /// Index rows removed because their files are gone.
    pub removed: usize,
    pub cancelled: bool,
}

/// Index summary.
#[derive(Debug, Clone, Serialize)]
pub struct IndexStats {
    pub email_count: usize,
    pub per_mailbox: Vec<MailboxCount>,
    pub db_size_bytes: u64,
    pub last_sync_at: Option<DateTime<Utc>>,
    /// Hours since the last sync, if there was one.
    pub staleness_hours: Option<f64>,
}

pub struct IndexManager {
    settings: IndexSettings,
    writer: Mutex<Option<Storage>>,
    bridge: Option<Box<dyn MailClientBridge>>,
    watcher: Mutex<Option<IndexWatcher>>,
    cancel: AtomicBool,
}

impl IndexManager {
    /// Open (creating or migrating) the index.
    pub fn open(settings: IndexSettings) -> Result<Self> {
        let storage = Storage::open(&settings.db_path)?;
        info!(
            db = %settings.db_path.display(),
            root = %settings.mail_root.display(),
            "Index manager ready"
        );
        Ok(Self {
            settings,
            writer: Mutex::new(Some(storage)),
            bridge: None,
            watcher: Mutex::new(None),
            cancel: AtomicBool::new(false),
        })
    }

    pub fn with_bridge(mut self, bridge: Box<dyn MailClientBridge>) -> Self {
        self.bridge = Some(bridge);
        self
    }

    pub fn settings(&self) -> &IndexSettings {
        &self.settings
    }

    fn lock_writer(&self) -> Result<MutexGuard<'_, Option<Storage>>> {
        self.writer.lock().map_err(|_| IndexError::StorageUnavailable {
            path: self.settings.db_path.clone(),
            reason: "writer lock poisoned".into(),
        })
    }

    /// Run `f` with the writer held.
    fn with_writer<T>(&self, f: impl FnOnce(&Storage) -> Result<T>) -> Result<T> {
        let guard = self.lock_writer()?;
        let storage = guard.as_ref().ok_or_else(|| IndexError::StorageUnavailable {
            path: self.settings.db_path.clone(),
            reason: "index is being rebuilt".into(),
        })?;
        f(storage)
    }

    fn reader(&self) -> Result<Storage> {
        Storage::open_read_only(&self.settings.db_path)
    }

    /// Wrap a caller's progress callback with the cancel flag.
    ///
    /// The flag is read after the callback so a cancel raised from inside
    /// it stops the run at the current file.
    fn progress<'a>(
        &'a self,
        user: Option<&'a (dyn Fn(usize, usize) -> bool + 'a)>,
    ) -> impl Fn(usize, usize) -> bool + 'a {
        move |done, total| {
            let keep_going = user.is_none_or(|f| f(done, total));
            keep_going && !self.cancel.load(Ordering::Relaxed)
        }
    }

    /// Full reconciliation of the whole store.
    ///
    /// On an empty index the FTS triggers are suspended and the full-text
    /// table rebuilt once at the end.
    pub fn build_index(&self, progress: Option<&dyn Fn(usize, usize) -> bool>) -> Result<BuildReport> {
        let wrapped = self.progress(progress);
        let report_progress: sync::Progress<'_> = &wrapped;
        let options = self.settings.apply_options();

        let counts = self.with_writer(|storage| {
            self.cancel.store(false, Ordering::Relaxed);
            let scan = store::scan(&self.settings.mail_root, &self.settings.exclude_mailboxes)?;
            let stored = storage.query_inventory()?;
            let plan = sync::diff(&scan.inventory, &stored);
            info!(
                on_disk = scan.inventory.len(),
                indexed = stored.len(),
                to_add = plan.added.len(),
                "Building index"
            );
            if stored.is_empty() {
                storage.with_bulk_load(|s| sync::apply(s, &plan, &[], &options, Some(report_progress)))
            } else {
                sync::apply(storage, &plan, &[], &options, Some(report_progress))
            }
        })?;

        Ok(BuildReport {
            indexed: counts.added,
            skipped: counts.errors,
            excluded_by_cap: counts.excluded_by_cap,
            removed: counts.deleted,
            cancelled: counts.cancelled,
        })
    }

    /// Bring the index in line with the disk.
    ///
    /// The store is scanned with the writer held.
    pub fn sync_updates(&self, progress: Option<&dyn Fn(usize, usize) -> bool>) -> Result<ChangeCount> {
        let wrapped = self.progress(progress);
        let report_progress: sync::Progress<'_> = &wrapped;
        let options = self.settings.apply_options();

        self.with_writer(|storage| {
            self.cancel.store(false, Ordering::Relaxed);
            let scan = store::scan(&self.settings.mail_root, &self.settings.exclude_mailboxes)?;
            let stored = storage.query_inventory()?;
            let plan = sync::diff(&scan.inventory, &stored);
            debug!(
                added = plan.added.len(),
                deleted = plan.deleted.len(),
                moved = plan.moved.len(),
                unchanged = plan.unchanged,
                "Sync plan"
            );
            sync::apply(storage, &plan, &[], &options, Some(report_progress))
        })
    }

    /// Reconcile only the given identities (watcher batches).
    pub fn apply_changes(&self, touched: &HashMap<Identity, Vec<PathBuf>>) -> Result<ChangeCount> {
        let options = self.settings.apply_options();
        self.with_writer(|storage| {
            let incremental = sync::plan_incremental(
                &self.settings.mail_root,
                storage,
                touched,
                &self.settings.exclude_mailboxes,
            )?;
            sync::apply(storage, &incremental.plan, &incremental.refresh, &options, None)
        })
    }

    /// Drop the index file and build again.
    pub fn rebuild_from_scratch(&self, progress: Option<&dyn Fn(usize, usize) -> bool>) -> Result<BuildReport> {
        {
            let mut guard = self.lock_writer()?;
            guard.take();
            Storage::destroy(&self.settings.db_path)?;
            *guard = Some(Storage::open(&self.settings.db_path)?);
            info!(db = %self.settings.db_path.display(), "Index recreated");
        }
        self.build_index(progress)
    }

    pub fn search(&self, request: &SearchRequest) -> Result<Vec<MessageSummary>> {
        let reader = self.reader()?;
        search::search(reader.conn(), request)
    }

    pub fn count_matches(&self, request: &SearchRequest) -> Result<usize> {
        let reader = self.reader()?;
        search::count_matches(reader.conn(), request)
    }

    /// Decode one attachment of an indexed message.
    ///
    /// The path comes from the index; the bridge is asked only when the
    /// index has no usable path.
    pub fn get_attachment(&self, identity: &Identity, filename: &str) -> Result<AttachmentContent> {
        let indexed = self.reader()?.message_path(identity)?.filter(|p| p.is_file());
        let path = match indexed {
            Some(path) => path,
            None => self
                .bridge
                .as_ref()
                .and_then(|b| b.locate_message(identity))
                .ok_or_else(|| IndexError::NotFound(format!("message {identity}")))?,
        };
        parser::extract_attachment(&path, filename, MAX_ATTACHMENT_SIZE)
    }

    pub fn get_stats(&self) -> Result<IndexStats> {
        let reader = self.reader()?;
        let last_sync_at = reader.last_sync()?;
        Ok(IndexStats {
            email_count: reader.message_count()?,
            per_mailbox: reader.mailbox_counts()?,
            db_size_bytes: reader.file_size(),
            last_sync_at,
            staleness_hours: last_sync_at
                .map(|at| (Utc::now() - at).num_seconds().max(0) as f64 / 3600.0),
        })
    }

    /// `true` when the last sync is older than `max_age_hours`, or never happened.
    pub fn is_stale(&self, max_age_hours: f64) -> Result<bool> {
        Ok(match self.get_stats()?.staleness_hours {
            Some(age) => age > max_age_hours,
            None => true,
        })
    }

    /// Whether searches can be served from the index at all.
    pub fn is_index_available(&self) -> bool {
        self.reader()
            .and_then(|r| r.message_count())
            .is_ok_and(|n| n > 0)
    }

    /// Account id for a display name, via the bridge. Search never does
    /// this implicitly.
    pub fn resolve_account(&self, name: &str) -> Option<String> {
        self.bridge.as_ref()?.account_id_for_name(name)
    }

    /// Ask the running build or sync to stop after the current file.
    ///
    /// Each build or sync clears the request when it starts, so a cancel
    /// issued while nothing runs does not carry over.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::Relaxed);
    }

    /// Start watching the mail store. A no-op when already running.
    pub fn start_watcher(self: &Arc<Self>, on_update: Option<UpdateFn>) -> Result<()> {
        let mut slot = self
            .watcher
            .lock()
            .map_err(|_| IndexError::Watch(notify::Error::generic("watcher lock poisoned")))?;
        if slot.as_ref().is_some_and(IndexWatcher::is_running) {
            return Ok(());
        }

        let manager: Weak<Self> = Arc::downgrade(self);
        let options = WatchOptions {
            debounce: self.settings.debounce,
            max_delay: self.settings.max_delay,
            max_pending: self.settings.max_pending,
            excluded: self.settings.exclude_mailboxes.clone(),
        };
        let watcher = IndexWatcher::start(&self.settings.mail_root, options, move |pending| {
            let Some(manager) = manager.upgrade() else {
                return;
            };
            let result = match &pending {
                Pending::Changes(touched) => manager.apply_changes(touched),
                Pending::FullSync => manager.sync_updates(None),
            };
            match result {
                Ok(counts) => {
                    if let Some(callback) = &on_update {
                        callback(counts);
                    }
                }
                Err(e) => error!(error = %e, "Failed to apply watcher changes"),
            }
        })?;
        *slot = Some(watcher);
        Ok(())
    }

    pub fn stop_watcher(&self) {
        match self.watcher.lock() {
            Ok(mut slot) => {
                if let Some(mut watcher) = slot.take() {
                    watcher.stop();
                }
            }
            Err(_) => warn!("Watcher lock poisoned"),
        }
    }

    pub fn watcher_running(&self) -> bool {
        self.watcher
            .lock()
            .map(|slot| slot.as_ref().is_some_and(IndexWatcher::is_running))
            .unwrap_or(false)
    }

    /// Run [`build_index`](Self::build_index) on a background thread.
    pub fn spawn_build(self: &Arc<Self>, progress: Option<ProgressFn>) -> Result<JoinHandle<Result<BuildReport>>> {
        let manager = Arc::clone(self);
        std::thread::Builder::new()
            .name("mailindex-build".into())
            .spawn(move || manager.build_index(progress.as_deref().map(|f| f as &dyn Fn(usize, usize) -> bool)))
            .map_err(|e| IndexError::io(&self.settings.db_path, e))
    }

    /// Run [`sync_updates`](Self::sync_updates) on a background thread.
    pub fn spawn_sync(self: &Arc<Self>, progress: Option<ProgressFn>) -> Result<JoinHandle<Result<ChangeCount>>> {
        let manager = Arc::clone(self);
        std::thread::Builder::new()
            .name("mailindex-sync".into())
            .spawn(move || manager.sync_updates(progress.as_deref().map(|f| f as &dyn Fn(usize, usize) -> bool)))
            .map_err(|e| IndexError::io(&self.settings.db_path, e))
    }
}

impl Drop for IndexManager {
    fn drop(&mut self) {
        self.stop_watcher();
    }
}
