use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, HashMap},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

const MOD_BACKUP_KEY_PREFIX: &str = "[ModBackup: ";
const MOD_BACKUP_KEY_SUFFIX: &str = "]";

/// One discovered backup artifact for an original texture file name.
///
/// File-level entries are keyed by texture file name and carry the backup
/// paths, most recent first. Mod-level entries use the synthetic
/// `[ModBackup: <folder>]` key and carry no paths.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupEntry {
    pub original_file_name: String,
    #[serde(default)]
    pub backup_paths: Vec<PathBuf>,
}

impl BackupEntry {
    pub fn for_mod(mod_folder: &str) -> Self {
        Self {
            original_file_name: mod_backup_key(mod_folder),
            backup_paths: Vec::new(),
        }
    }

    pub fn is_mod_level(&self) -> bool {
        parse_mod_backup_key(&self.original_file_name).is_some()
    }

    pub fn latest_path(&self) -> Option<&Path> {
        self.backup_paths.first().map(PathBuf::as_path)
    }
}

pub fn mod_backup_key(mod_folder: &str) -> String {
    format!("{MOD_BACKUP_KEY_PREFIX}{mod_folder}{MOD_BACKUP_KEY_SUFFIX}")
}

pub fn parse_mod_backup_key(key: &str) -> Option<&str> {
    key.strip_prefix(MOD_BACKUP_KEY_PREFIX)?
        .strip_suffix(MOD_BACKUP_KEY_SUFFIX)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionEntry {
    pub original_file_name: String,
    #[serde(default)]
    pub mod_folder_name: String,
    #[serde(default)]
    pub mod_relative_path: String,
}

/// A historical snapshot produced by a single backup operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupSession {
    pub source_path: PathBuf,
    pub is_archive: bool,
    pub display_name: String,
    pub created_at: i64,
    pub entries: Vec<SessionEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreProgress {
    pub mod_name: Option<String>,
    pub current: usize,
    pub total: usize,
    pub detail: Option<String>,
}

pub type ProgressSink = Arc<dyn Fn(RestoreProgress) + Send + Sync>;

pub fn silent_progress() -> ProgressSink {
    Arc::new(|_| {})
}

/// Cooperative cancellation flag shared between a restore worker, the
/// backup service it calls into and the presentation layer.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Call shapes of the external backup/optimization service.
///
/// Every call is fallible on its own and safe to retry.
pub trait BackupService: Send + Sync {
    fn file_backup_index(&self) -> Result<HashMap<String, BackupEntry>>;

    fn has_mod_backup(&self, mod_folder: &str) -> Result<bool>;

    /// Most recent full mod-package archive for the folder, if any.
    fn latest_mod_archive(&self, mod_folder: &str) -> Result<Option<PathBuf>>;

    fn list_sessions(&self) -> Result<Vec<BackupSession>>;

    fn restore_session(
        &self,
        source_path: &Path,
        is_archive: bool,
        progress: &ProgressSink,
        cancel: &CancelToken,
    ) -> Result<bool>;

    fn restore_latest_for_mod(
        &self,
        mod_folder: &str,
        progress: &ProgressSink,
        cancel: &CancelToken,
    ) -> Result<bool>;

    fn restore_pmp_for_mod(
        &self,
        mod_folder: &str,
        archive_path: &Path,
        progress: &ProgressSink,
        cancel: &CancelToken,
    ) -> Result<bool>;

    /// Restores each `backup -> target` pair, reporting success per backup path.
    fn restore_files(
        &self,
        files: &BTreeMap<PathBuf, PathBuf>,
        delete_after_restore: bool,
        progress: &ProgressSink,
        cancel: &CancelToken,
    ) -> Result<HashMap<PathBuf, bool>>;
}
