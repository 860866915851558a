use crate::{
    backup::{self, BackupEntry, BackupService},
    framework::ModFramework,
    inventory::{self, AssetInventory},
};
use anyhow::{Context, Result};
use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, PoisonError, RwLock,
    },
    thread,
    time::{Duration, Instant},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DetectionSettings {
    /// How long a completed scan counts as fresh.
    pub fresh_for: Duration,
    /// Display-only window during which an empty result reads as "scanning".
    pub forced_scan_window: Duration,
}

impl Default for DetectionSettings {
    fn default() -> Self {
        Self {
            fresh_for: Duration::from_secs(5),
            forced_scan_window: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectionStatus {
    Scanning,
    Ready { count: usize },
    NoneFound,
}

impl DetectionStatus {
    pub fn label(self) -> String {
        match self {
            DetectionStatus::Scanning => "Scanning for backups...".to_string(),
            DetectionStatus::Ready { count } => format!("{count} backup(s) available"),
            DetectionStatus::NoneFound => "No backups found".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DetectionSnapshot {
    pub file_level: HashMap<String, BackupEntry>,
    pub mod_level: HashMap<String, BackupEntry>,
    pub last_refreshed_at: Option<Instant>,
    pub forced_scan_started_at: Option<Instant>,
    pub scan_in_flight: bool,
    pub status: DetectionStatus,
}

impl DetectionSnapshot {
    pub fn total_count(&self) -> usize {
        self.file_level.len() + self.mod_level.len()
    }

    /// File-level entries plus one `[ModBackup: <folder>]` entry per mod.
    pub fn merged(&self) -> HashMap<String, BackupEntry> {
        let mut merged = self.file_level.clone();
        for entry in self.mod_level.values() {
            merged.insert(entry.original_file_name.clone(), entry.clone());
        }
        merged
    }

    pub fn has_backup_for(&self, file_name: &str) -> bool {
        self.file_level
            .keys()
            .any(|key| key.eq_ignore_ascii_case(file_name))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScanSource {
    FileLevel,
    ModLevel,
}

impl ScanSource {
    fn label(self) -> &'static str {
        match self {
            ScanSource::FileLevel => "file-level",
            ScanSource::ModLevel => "mod-level",
        }
    }
}

#[derive(Debug, Default)]
struct CacheState {
    file_level: HashMap<String, BackupEntry>,
    mod_level: HashMap<String, BackupEntry>,
    last_refreshed_at: Option<Instant>,
    forced_scan_started_at: Option<Instant>,
}

struct Shared {
    state: RwLock<CacheState>,
    generation: AtomicU64,
    file_scan_running: AtomicBool,
    mod_scan_running: AtomicBool,
    inventory: Arc<dyn AssetInventory>,
    backups: Arc<dyn BackupService>,
    framework: Arc<dyn ModFramework>,
    settings: DetectionSettings,
}

/// Background-refreshed index of which loaded textures have backups.
///
/// Reads never block on a scan: `snapshot` returns the last published state
/// and schedules a refresh when it has gone stale.
#[derive(Clone)]
pub struct DetectionCache {
    shared: Arc<Shared>,
}

impl DetectionCache {
    pub fn new(
        inventory: Arc<dyn AssetInventory>,
        backups: Arc<dyn BackupService>,
        framework: Arc<dyn ModFramework>,
        settings: DetectionSettings,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: RwLock::new(CacheState::default()),
                generation: AtomicU64::new(0),
                file_scan_running: AtomicBool::new(false),
                mod_scan_running: AtomicBool::new(false),
                inventory,
                backups,
                framework,
                settings,
            }),
        }
    }

    pub fn settings(&self) -> DetectionSettings {
        self.shared.settings
    }

    pub fn is_scanning(&self) -> bool {
        self.shared.file_scan_running.load(Ordering::SeqCst)
            || self.shared.mod_scan_running.load(Ordering::SeqCst)
    }

    /// Starts whichever of the two scans is not already running.
    pub fn trigger_scan(&self, reason: &str) {
        for source in [ScanSource::FileLevel, ScanSource::ModLevel] {
            let running = self.shared.running_flag(source);
            if running
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                log::debug!("{} scan already running, ignoring trigger ({reason})", source.label());
                continue;
            }
            log::debug!("{} scan started ({reason})", source.label());
            let shared = Arc::clone(&self.shared);
            thread::spawn(move || run_scan(&shared, source));
        }
    }

    /// Drops every cached result and re-arms both scans.
    pub fn invalidate(&self, reason: &str) {
        {
            let mut state = self
                .shared
                .state
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            self.shared.generation.fetch_add(1, Ordering::SeqCst);
            *state = CacheState::default();
        }
        log::info!("Backup detection invalidated: {reason}");
        self.trigger_scan(reason);
    }

    pub fn snapshot(&self) -> DetectionSnapshot {
        self.snapshot_at(Instant::now())
    }

    /// Published result for a caller that waited for its own scan to finish.
    /// An empty result reads as `NoneFound`; the forced-scanning window is
    /// neither opened nor consulted and no refresh is scheduled.
    pub fn settled_snapshot(&self) -> DetectionSnapshot {
        let mut snapshot = self.read_state();
        let count = snapshot.total_count();
        snapshot.status = if count > 0 {
            DetectionStatus::Ready { count }
        } else if snapshot.scan_in_flight || snapshot.last_refreshed_at.is_none() {
            DetectionStatus::Scanning
        } else {
            DetectionStatus::NoneFound
        };
        snapshot
    }

    pub fn snapshot_at(&self, now: Instant) -> DetectionSnapshot {
        let mut snapshot = self.read_state();
        let scan_in_flight = snapshot.scan_in_flight;

        let count = snapshot.total_count();
        if count == 0 && snapshot.forced_scan_started_at.is_none() {
            snapshot.forced_scan_started_at = Some(self.shared.open_forced_window(now));
        } else if count > 0 && snapshot.forced_scan_started_at.is_some() {
            self.shared.clear_forced_window();
            snapshot.forced_scan_started_at = None;
        }
        snapshot.status = detection_status(
            count,
            snapshot.last_refreshed_at,
            snapshot.forced_scan_started_at,
            now,
            self.shared.settings.forced_scan_window,
        );

        let stale = match snapshot.last_refreshed_at {
            Some(at) => now.saturating_duration_since(at) >= self.shared.settings.fresh_for,
            None => true,
        };
        if stale && !scan_in_flight {
            self.trigger_scan("stale snapshot");
        }
        snapshot
    }
}

impl DetectionCache {
    fn read_state(&self) -> DetectionSnapshot {
        let scan_in_flight = self.is_scanning();
        let state = self
            .shared
            .state
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        DetectionSnapshot {
            file_level: state.file_level.clone(),
            mod_level: state.mod_level.clone(),
            last_refreshed_at: state.last_refreshed_at,
            forced_scan_started_at: state.forced_scan_started_at,
            scan_in_flight,
            status: DetectionStatus::Scanning,
        }
    }
}

impl Shared {
    fn running_flag(&self, source: ScanSource) -> &AtomicBool {
        match source {
            ScanSource::FileLevel => &self.file_scan_running,
            ScanSource::ModLevel => &self.mod_scan_running,
        }
    }

    fn publish(&self, source: ScanSource, generation: u64, found: HashMap<String, BackupEntry>) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        if self.generation.load(Ordering::SeqCst) != generation {
            log::debug!("Dropping {} results from before invalidation", source.label());
            return;
        }
        let found_count = found.len();
        match source {
            ScanSource::FileLevel => state.file_level.extend(found),
            ScanSource::ModLevel => state.mod_level.extend(found),
        }
        state.last_refreshed_at = Some(Instant::now());
        log::debug!("{} scan published {found_count} entries", source.label());
    }

    fn open_forced_window(&self, now: Instant) -> Instant {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        *state.forced_scan_started_at.get_or_insert(now)
    }

    fn clear_forced_window(&self) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        state.forced_scan_started_at = None;
    }

    fn scan(&self, source: ScanSource) -> Result<HashMap<String, BackupEntry>> {
        let assets = self
            .inventory
            .current_assets()
            .context("read current assets")?;
        if assets.is_empty() {
            return Ok(HashMap::new());
        }

        match source {
            ScanSource::FileLevel => {
                let names = inventory::file_name_set(&assets);
                let index = self
                    .backups
                    .file_backup_index()
                    .context("read file backup index")?;
                Ok(filter_index_to_inventory(index, &names))
            }
            ScanSource::ModLevel => {
                let Some(mod_root) = self.framework.mod_root_directory() else {
                    log::debug!("Mod root not resolved, skipping mod-level scan");
                    return Ok(HashMap::new());
                };
                let mut found = HashMap::new();
                for folder in inventory::owning_mods(&mod_root, &assets) {
                    match self.backups.has_mod_backup(&folder) {
                        Ok(true) => {
                            found.insert(folder.clone(), BackupEntry::for_mod(&folder));
                        }
                        Ok(false) => {}
                        Err(err) => log::warn!("Mod backup lookup failed for {folder}: {err:#}"),
                    }
                }
                Ok(found)
            }
        }
    }
}

fn run_scan(shared: &Shared, source: ScanSource) {
    let running = shared.running_flag(source);
    loop {
        let generation = shared.generation.load(Ordering::SeqCst);
        let found = match shared.scan(source) {
            Ok(found) => found,
            Err(err) => {
                log::warn!("{} backup scan failed: {err:#}", source.label());
                HashMap::new()
            }
        };
        shared.publish(source, generation, found);
        running.store(false, Ordering::SeqCst);

        // Invalidated while scanning: the published results were dropped, so
        // go again unless another trigger already did.
        if shared.generation.load(Ordering::SeqCst) == generation {
            break;
        }
        if running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            break;
        }
    }
}

/// Entries of the backup index whose file name is loaded right now,
/// compared case-insensitively.
pub fn filter_index_to_inventory(
    index: HashMap<String, BackupEntry>,
    file_names: &HashSet<String>,
) -> HashMap<String, BackupEntry> {
    index
        .into_iter()
        .filter(|(key, _)| backup::parse_mod_backup_key(key).is_none())
        .filter(|(key, _)| file_names.contains(&key.to_lowercase()))
        .collect()
}

fn detection_status(
    count: usize,
    last_refreshed_at: Option<Instant>,
    forced_scan_started_at: Option<Instant>,
    now: Instant,
    forced_window: Duration,
) -> DetectionStatus {
    if count > 0 {
        return DetectionStatus::Ready { count };
    }
    if last_refreshed_at.is_none() {
        return DetectionStatus::Scanning;
    }
    match forced_scan_started_at {
        Some(started) if now.saturating_duration_since(started) < forced_window => {
            DetectionStatus::Scanning
        }
        _ => DetectionStatus::NoneFound,
    }
}
