use crate::{
    backup::{BackupEntry, BackupService, BackupSession, CancelToken, ProgressSink, RestoreProgress},
    framework::ModFramework,
    inventory::AssetFingerprint,
};
use anyhow::{anyhow, Result};
use std::{
    collections::{BTreeMap, HashMap, HashSet},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Condvar, Mutex,
    },
    thread,
    time::{Duration, Instant},
};

/// Blocks callers of `wait` while closed.
#[derive(Default)]
pub struct Gate {
    closed: Mutex<bool>,
    changed: Condvar,
}

impl Gate {
    pub fn close(&self) {
        *self.closed.lock().unwrap() = true;
    }

    pub fn open(&self) {
        *self.closed.lock().unwrap() = false;
        self.changed.notify_all();
    }

    pub fn wait(&self) {
        let mut closed = self.closed.lock().unwrap();
        while *closed {
            closed = self.changed.wait(closed).unwrap();
        }
    }
}

pub fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        thread::sleep(Duration::from_millis(5));
    }
}

pub fn asset(name: &str, path: &str) -> AssetFingerprint {
    AssetFingerprint::new(name, &[path])
}

pub fn file_entry(name: &str, backup: &str) -> BackupEntry {
    BackupEntry {
        original_file_name: name.to_string(),
        backup_paths: vec![PathBuf::from(backup)],
    }
}

/// Scriptable backup service recording every call it receives.
#[derive(Default)]
pub struct MockBackups {
    pub index: Mutex<HashMap<String, BackupEntry>>,
    pub fail_index: AtomicBool,
    pub mod_backups: Mutex<HashSet<String>>,
    pub mod_archives: Mutex<HashMap<String, PathBuf>>,
    pub pmp_results: Mutex<HashMap<String, bool>>,
    pub latest_results: Mutex<HashMap<String, bool>>,
    pub sessions: Mutex<Vec<BackupSession>>,
    pub fail_sessions: AtomicBool,
    pub session_result: Mutex<Option<bool>>,
    pub failing_files: Mutex<HashSet<PathBuf>>,
    pub cancel_during_mod: Mutex<Option<String>>,
    pub cancel_during_session: AtomicBool,
    pub cancel_during_file: Mutex<Option<PathBuf>>,
    pub index_calls: AtomicUsize,
    pub index_gate: Gate,
    pub restore_gate: Gate,
    pub calls: Mutex<Vec<String>>,
}

impl MockBackups {
    pub fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_starting_with(&self, prefix: &str) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|call| call.starts_with(prefix))
            .collect()
    }

    pub fn add_mod_backup(&self, folder: &str, latest_ok: bool) {
        self.mod_backups.lock().unwrap().insert(folder.to_string());
        self.latest_results
            .lock()
            .unwrap()
            .insert(folder.to_string(), latest_ok);
    }
}

fn report(progress: &ProgressSink, mod_name: Option<&str>) {
    progress(RestoreProgress {
        mod_name: mod_name.map(|name| name.to_string()),
        current: 1,
        total: 1,
        detail: None,
    });
}

impl BackupService for MockBackups {
    fn file_backup_index(&self) -> Result<HashMap<String, BackupEntry>> {
        self.index_calls.fetch_add(1, Ordering::SeqCst);
        self.index_gate.wait();
        if self.fail_index.load(Ordering::SeqCst) {
            return Err(anyhow!("index unavailable"));
        }
        Ok(self.index.lock().unwrap().clone())
    }

    fn has_mod_backup(&self, mod_folder: &str) -> Result<bool> {
        Ok(self.mod_backups.lock().unwrap().contains(mod_folder))
    }

    fn latest_mod_archive(&self, mod_folder: &str) -> Result<Option<PathBuf>> {
        Ok(self.mod_archives.lock().unwrap().get(mod_folder).cloned())
    }

    fn list_sessions(&self) -> Result<Vec<BackupSession>> {
        if self.fail_sessions.load(Ordering::SeqCst) {
            return Err(anyhow!("session store unavailable"));
        }
        Ok(self.sessions.lock().unwrap().clone())
    }

    fn restore_session(
        &self,
        source_path: &Path,
        _is_archive: bool,
        progress: &ProgressSink,
        cancel: &CancelToken,
    ) -> Result<bool> {
        self.record(format!("session:{}", source_path.display()));
        report(progress, None);
        if self.cancel_during_session.load(Ordering::SeqCst) {
            cancel.cancel();
        }
        (*self.session_result.lock().unwrap()).ok_or_else(|| anyhow!("session restore threw"))
    }

    fn restore_latest_for_mod(
        &self,
        mod_folder: &str,
        progress: &ProgressSink,
        cancel: &CancelToken,
    ) -> Result<bool> {
        self.restore_gate.wait();
        self.record(format!("latest:{mod_folder}"));
        report(progress, Some(mod_folder));
        if self.cancel_during_mod.lock().unwrap().as_deref() == Some(mod_folder) {
            cancel.cancel();
        }
        self.latest_results
            .lock()
            .unwrap()
            .get(mod_folder)
            .copied()
            .ok_or_else(|| anyhow!("no latest backup for {mod_folder}"))
    }

    fn restore_pmp_for_mod(
        &self,
        mod_folder: &str,
        archive_path: &Path,
        progress: &ProgressSink,
        cancel: &CancelToken,
    ) -> Result<bool> {
        self.record(format!("pmp:{mod_folder}:{}", archive_path.display()));
        report(progress, Some(mod_folder));
        if self.cancel_during_mod.lock().unwrap().as_deref() == Some(mod_folder) {
            cancel.cancel();
        }
        self.pmp_results
            .lock()
            .unwrap()
            .get(mod_folder)
            .copied()
            .ok_or_else(|| anyhow!("package unreadable"))
    }

    fn restore_files(
        &self,
        files: &BTreeMap<PathBuf, PathBuf>,
        _delete_after_restore: bool,
        progress: &ProgressSink,
        cancel: &CancelToken,
    ) -> Result<HashMap<PathBuf, bool>> {
        let failing = self.failing_files.lock().unwrap().clone();
        let cancel_at = self.cancel_during_file.lock().unwrap().clone();
        let mut results = HashMap::new();
        for (backup, target) in files {
            self.record(format!("file:{}->{}", backup.display(), target.display()));
            results.insert(backup.clone(), !failing.contains(backup));
            if cancel_at.as_ref() == Some(backup) {
                cancel.cancel();
            }
        }
        report(progress, None);
        Ok(results)
    }
}

pub struct MockFramework {
    pub mod_root: Option<PathBuf>,
    pub redraws: AtomicUsize,
}

impl MockFramework {
    pub fn new(mod_root: &str) -> Self {
        Self {
            mod_root: Some(PathBuf::from(mod_root)),
            redraws: AtomicUsize::new(0),
        }
    }

    pub fn unresolved() -> Self {
        Self {
            mod_root: None,
            redraws: AtomicUsize::new(0),
        }
    }
}

impl ModFramework for MockFramework {
    fn mod_root_directory(&self) -> Option<PathBuf> {
        self.mod_root.clone()
    }

    fn redraw_current_character(&self) {
        self.redraws.fetch_add(1, Ordering::SeqCst);
    }
}
