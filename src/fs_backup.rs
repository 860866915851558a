use crate::backup::{
    BackupEntry, BackupService, BackupSession, CancelToken, ProgressSink, RestoreProgress,
    SessionEntry,
};
use anyhow::{Context, Result};
use filetime::{set_file_mtime, FileTime};
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, HashMap},
    fs, io,
    path::{Component, Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};
use time::{Date, Month, PrimitiveDateTime, Time as TimeOfDay};
use walkdir::WalkDir;

pub const SESSION_MANIFEST: &str = "session.json";
const MOD_PACKAGE_EXTENSION: &str = "pmp";

/// Backup store laid out on disk:
///
/// - `files/<stamp>/<file name>`: single converted-file backups
/// - `sessions/<name>/` or `sessions/<name>.zip`: session snapshots with a
///   `session.json` manifest and `<mod folder>/<relative path>` payload
/// - `mods/<mod folder>/<stamp>/` snapshots and `mods/<mod folder>/*.pmp` packages
#[derive(Debug, Clone)]
pub struct FsBackupService {
    backup_root: PathBuf,
    mod_root: PathBuf,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct SessionManifest {
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub created_at: Option<i64>,
    #[serde(default)]
    pub entries: Vec<SessionEntry>,
}

struct ProgressReporter<'a> {
    sink: &'a ProgressSink,
    mod_name: Option<String>,
    total: usize,
    current: usize,
}

impl<'a> ProgressReporter<'a> {
    fn new(sink: &'a ProgressSink, mod_name: Option<&str>, total: usize) -> Self {
        Self {
            sink,
            mod_name: mod_name.map(|name| name.to_string()),
            total,
            current: 0,
        }
    }

    fn bump(&mut self, detail: Option<String>) {
        self.current = self.current.saturating_add(1).min(self.total.max(1));
        (self.sink)(RestoreProgress {
            mod_name: self.mod_name.clone(),
            current: self.current,
            total: self.total,
            detail,
        });
    }
}

impl FsBackupService {
    pub fn new(backup_root: PathBuf, mod_root: PathBuf) -> Self {
        Self {
            backup_root,
            mod_root,
        }
    }

    pub fn files_dir(&self) -> PathBuf {
        self.backup_root.join("files")
    }

    pub fn sessions_dir(&self) -> PathBuf {
        self.backup_root.join("sessions")
    }

    pub fn mods_dir(&self) -> PathBuf {
        self.backup_root.join("mods")
    }

    fn mod_backup_dir(&self, mod_folder: &str) -> Option<PathBuf> {
        let entries = fs::read_dir(self.mods_dir()).ok()?;
        entries
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().map(|kind| kind.is_dir()).unwrap_or(false))
            .find(|entry| {
                entry
                    .file_name()
                    .to_string_lossy()
                    .eq_ignore_ascii_case(mod_folder)
            })
            .map(|entry| entry.path())
    }

    fn latest_mod_snapshot(&self, mod_folder: &str) -> Option<PathBuf> {
        let dir = self.mod_backup_dir(mod_folder)?;
        let mut snapshots: Vec<(i64, PathBuf)> = fs::read_dir(dir)
            .ok()?
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().map(|kind| kind.is_dir()).unwrap_or(false))
            .map(|entry| {
                let path = entry.path();
                (stamp_of(&path), path)
            })
            .collect();
        snapshots.sort_by(|a, b| b.cmp(a));
        snapshots.into_iter().next().map(|(_, path)| path)
    }

    fn mod_target_dir(&self, mod_folder: &str) -> Result<PathBuf> {
        let relative = safe_relative(mod_folder).context("invalid mod folder name")?;
        Ok(self.mod_root.join(relative))
    }

    fn read_session(&self, path: &Path) -> Result<Option<BackupSession>> {
        let is_archive = is_zip(path);
        let manifest = if is_archive {
            read_zip_manifest(path)?
        } else if path.join(SESSION_MANIFEST).is_file() {
            let raw = fs::read_to_string(path.join(SESSION_MANIFEST))
                .context("read session manifest")?;
            serde_json::from_str(&raw).context("parse session manifest")?
        } else {
            return Ok(None);
        };

        let display_name = manifest.display_name.unwrap_or_else(|| {
            path.file_stem()
                .map(|stem| stem.to_string_lossy().to_string())
                .unwrap_or_default()
        });
        let created_at = manifest
            .created_at
            .unwrap_or_else(|| modified_at(path).unwrap_or_default());
        Ok(Some(BackupSession {
            source_path: path.to_path_buf(),
            is_archive,
            display_name,
            created_at,
            entries: manifest.entries,
        }))
    }
}

impl BackupService for FsBackupService {
    fn file_backup_index(&self) -> Result<HashMap<String, BackupEntry>> {
        let files_dir = self.files_dir();
        if !files_dir.exists() {
            return Ok(HashMap::new());
        }

        let mut grouped: HashMap<String, Vec<(i64, PathBuf)>> = HashMap::new();
        for entry in WalkDir::new(&files_dir).min_depth(2).max_depth(2) {
            let entry = entry.context("walk file backups")?;
            if !entry.file_type().is_file() {
                continue;
            }
            let stamp = entry
                .path()
                .parent()
                .map(stamp_of)
                .unwrap_or_default();
            let name = entry.file_name().to_string_lossy().to_string();
            grouped
                .entry(name)
                .or_default()
                .push((stamp, entry.path().to_path_buf()));
        }

        Ok(grouped
            .into_iter()
            .map(|(name, mut paths)| {
                paths.sort_by(|a, b| b.cmp(a));
                let entry = BackupEntry {
                    original_file_name: name.clone(),
                    backup_paths: paths.into_iter().map(|(_, path)| path).collect(),
                };
                (name, entry)
            })
            .collect())
    }

    fn has_mod_backup(&self, mod_folder: &str) -> Result<bool> {
        let Some(dir) = self.mod_backup_dir(mod_folder) else {
            return Ok(false);
        };
        let mut entries = fs::read_dir(&dir).context("read mod backup dir")?;
        Ok(entries.any(|entry| entry.is_ok()))
    }

    fn latest_mod_archive(&self, mod_folder: &str) -> Result<Option<PathBuf>> {
        let Some(dir) = self.mod_backup_dir(mod_folder) else {
            return Ok(None);
        };
        let mut archives = Vec::new();
        for entry in fs::read_dir(&dir).context("read mod backup dir")? {
            let path = entry.context("mod backup entry")?.path();
            let is_package = path
                .extension()
                .map(|ext| ext.eq_ignore_ascii_case(MOD_PACKAGE_EXTENSION))
                .unwrap_or(false);
            if is_package && path.is_file() {
                archives.push((modified_at(&path).unwrap_or_default(), path));
            }
        }
        archives.sort_by(|a, b| b.cmp(a));
        Ok(archives.into_iter().next().map(|(_, path)| path))
    }

    fn list_sessions(&self) -> Result<Vec<BackupSession>> {
        let sessions_dir = self.sessions_dir();
        if !sessions_dir.exists() {
            return Ok(Vec::new());
        }
        let mut sessions = Vec::new();
        for entry in fs::read_dir(&sessions_dir).context("read sessions dir")? {
            let path = entry.context("session entry")?.path();
            if !path.is_dir() && !is_zip(&path) {
                continue;
            }
            match self.read_session(&path) {
                Ok(Some(session)) => sessions.push(session),
                Ok(None) => {}
                Err(err) => log::warn!("Skipping unreadable session {}: {err:#}", path.display()),
            }
        }
        sessions.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| a.source_path.cmp(&b.source_path))
        });
        Ok(sessions)
    }

    fn restore_session(
        &self,
        source_path: &Path,
        is_archive: bool,
        progress: &ProgressSink,
        cancel: &CancelToken,
    ) -> Result<bool> {
        let session = self
            .read_session(source_path)?
            .with_context(|| format!("no session manifest in {}", source_path.display()))?;
        let mut archive = if is_archive {
            let file = fs::File::open(source_path).context("open session archive")?;
            Some(zip::ZipArchive::new(file).context("read session archive")?)
        } else {
            None
        };

        let mut reporter = ProgressReporter::new(progress, None, session.entries.len());
        let mut restored = 0usize;
        for entry in &session.entries {
            if cancel.is_cancelled() {
                break;
            }
            let relative_path = if entry.mod_relative_path.is_empty() {
                entry.original_file_name.as_str()
            } else {
                entry.mod_relative_path.as_str()
            };
            let joined = if entry.mod_folder_name.is_empty() {
                relative_path.to_string()
            } else {
                format!("{}/{}", entry.mod_folder_name, relative_path)
            };
            let Some(relative) = safe_relative(&joined) else {
                log::warn!("Skipping unsafe session path {relative_path:?}");
                continue;
            };
            let target = self.mod_root.join(&relative);
            let result = match archive.as_mut() {
                Some(archive) => extract_zip_entry(archive, &relative, &target),
                None => restore_file(&source_path.join(&relative), &target),
            };
            match result {
                Ok(()) => restored += 1,
                Err(err) => log::warn!("Session entry {} failed: {err:#}", relative.display()),
            }
            reporter.bump(Some(entry.original_file_name.clone()));
        }
        Ok(restored > 0)
    }

    fn restore_latest_for_mod(
        &self,
        mod_folder: &str,
        progress: &ProgressSink,
        cancel: &CancelToken,
    ) -> Result<bool> {
        let Some(snapshot) = self.latest_mod_snapshot(mod_folder) else {
            return Ok(false);
        };
        let target_root = self.mod_target_dir(mod_folder)?;
        let files: Vec<PathBuf> = WalkDir::new(&snapshot)
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_file())
            .map(|entry| entry.path().to_path_buf())
            .collect();

        let mut reporter = ProgressReporter::new(progress, Some(mod_folder), files.len());
        let mut restored = 0usize;
        for source in files {
            if cancel.is_cancelled() {
                break;
            }
            let rel = source.strip_prefix(&snapshot).context("snapshot relative path")?;
            restore_file(&source, &target_root.join(rel))
                .with_context(|| format!("restore {}", rel.display()))?;
            restored += 1;
            reporter.bump(Some(rel.to_string_lossy().to_string()));
        }
        Ok(restored > 0)
    }

    fn restore_pmp_for_mod(
        &self,
        mod_folder: &str,
        archive_path: &Path,
        progress: &ProgressSink,
        cancel: &CancelToken,
    ) -> Result<bool> {
        let target_root = self.mod_target_dir(mod_folder)?;
        let file = fs::File::open(archive_path).context("open mod package")?;
        let mut archive = zip::ZipArchive::new(file).context("read mod package")?;

        let total = archive.len();
        let mut reporter = ProgressReporter::new(progress, Some(mod_folder), total);
        let mut restored = 0usize;
        for i in 0..total {
            if cancel.is_cancelled() {
                break;
            }
            let mut file = archive.by_index(i).context("mod package entry")?;
            let Some(out_path) = file.enclosed_name() else {
                continue;
            };
            let out_path = target_root.join(out_path);
            if file.is_dir() {
                fs::create_dir_all(&out_path).context("create package dir")?;
                continue;
            }
            if let Some(parent) = out_path.parent() {
                fs::create_dir_all(parent).context("create package dir")?;
            }
            let mut out_file = fs::File::create(&out_path).context("write package entry")?;
            io::copy(&mut file, &mut out_file).context("extract package entry")?;
            apply_zip_mtime(file.last_modified(), &out_path);
            restored += 1;
            reporter.bump(Some(file.name().to_string()));
        }
        Ok(restored > 0)
    }

    fn restore_files(
        &self,
        files: &BTreeMap<PathBuf, PathBuf>,
        delete_after_restore: bool,
        progress: &ProgressSink,
        cancel: &CancelToken,
    ) -> Result<HashMap<PathBuf, bool>> {
        let mut reporter = ProgressReporter::new(progress, None, files.len());
        let mut results = HashMap::new();
        for (backup, target) in files {
            if cancel.is_cancelled() {
                results.insert(backup.clone(), false);
                continue;
            }
            let ok = match restore_file(backup, target) {
                Ok(()) => {
                    if delete_after_restore {
                        if let Err(err) = fs::remove_file(backup) {
                            log::warn!("Could not remove consumed backup {}: {err}", backup.display());
                        }
                    }
                    true
                }
                Err(err) => {
                    log::warn!("Restore of {} failed: {err:#}", backup.display());
                    false
                }
            };
            results.insert(backup.clone(), ok);
            reporter.bump(
                target
                    .file_name()
                    .map(|name| name.to_string_lossy().to_string()),
            );
        }
        Ok(results)
    }
}

fn restore_file(source: &Path, target: &Path) -> Result<()> {
    if !source.is_file() {
        anyhow::bail!("backup missing: {}", source.display());
    }
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent).context("create restore dir")?;
    }
    fs::copy(source, target).context("copy backup")?;
    preserve_mtime(source, target);
    Ok(())
}

fn extract_zip_entry(
    archive: &mut zip::ZipArchive<fs::File>,
    relative: &Path,
    target: &Path,
) -> Result<()> {
    let name = relative
        .components()
        .map(|part| part.as_os_str().to_string_lossy().to_string())
        .collect::<Vec<_>>()
        .join("/");
    let mut file = archive
        .by_name(&name)
        .with_context(|| format!("archive entry {name}"))?;
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent).context("create restore dir")?;
    }
    let mut out_file = fs::File::create(target).context("write archive entry")?;
    io::copy(&mut file, &mut out_file).context("extract archive entry")?;
    apply_zip_mtime(file.last_modified(), target);
    Ok(())
}

fn read_zip_manifest(path: &Path) -> Result<SessionManifest> {
    let file = fs::File::open(path).context("open session archive")?;
    let mut archive = zip::ZipArchive::new(file).context("read session archive")?;
    let manifest = archive
        .by_name(SESSION_MANIFEST)
        .context("session archive manifest")?;
    serde_json::from_reader(manifest).context("parse session manifest")
}

fn apply_zip_mtime(last_modified: Option<zip::DateTime>, out_path: &Path) {
    if let Some(dt) = last_modified {
        if let Some(mtime) = zip_time_to_unix(dt) {
            let _ = set_file_mtime(out_path, FileTime::from_unix_time(mtime, 0));
        }
    }
}

fn zip_time_to_unix(dt: zip::DateTime) -> Option<i64> {
    let month = Month::try_from(dt.month()).ok()?;
    let date = Date::from_calendar_date(dt.year() as i32, month, dt.day()).ok()?;
    let time = TimeOfDay::from_hms(dt.hour(), dt.minute(), dt.second()).ok()?;
    Some(PrimitiveDateTime::new(date, time).assume_utc().unix_timestamp())
}

fn preserve_mtime(source: &Path, dest: &Path) {
    let Some(mtime) = modified_at(source) else {
        return;
    };
    let _ = set_file_mtime(dest, FileTime::from_unix_time(mtime, 0));
}

fn modified_at(path: &Path) -> Option<i64> {
    let modified = fs::metadata(path).ok()?.modified().ok()?;
    system_time_to_epoch(modified)
}

fn system_time_to_epoch(value: SystemTime) -> Option<i64> {
    value
        .duration_since(UNIX_EPOCH)
        .ok()
        .map(|duration| duration.as_secs() as i64)
}

/// Numeric stamp from a `<stamp>` directory name, falling back to its mtime.
fn stamp_of(path: &Path) -> i64 {
    path.file_name()
        .and_then(|name| name.to_string_lossy().parse::<i64>().ok())
        .or_else(|| modified_at(path))
        .unwrap_or_default()
}

fn is_zip(path: &Path) -> bool {
    path.is_file()
        && path
            .extension()
            .map(|ext| ext.eq_ignore_ascii_case("zip"))
            .unwrap_or(false)
}

/// Relative path made only of normal components; `None` if it would escape.
fn safe_relative(raw: &str) -> Option<PathBuf> {
    let normalized = raw.replace('\\', "/");
    let mut out = PathBuf::new();
    for component in Path::new(&normalized).components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            _ => return None,
        }
    }
    if out.as_os_str().is_empty() {
        None
    } else {
        Some(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::silent_progress;
    use std::io::Write;
    use tempfile::TempDir;

    fn write(path: &Path, contents: &str) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, contents).unwrap();
    }

    fn service(tmp: &TempDir) -> FsBackupService {
        FsBackupService::new(tmp.path().join("backups"), tmp.path().join("Mods"))
    }

    #[test]
    fn file_index_groups_by_name_newest_first() {
        let tmp = TempDir::new().unwrap();
        let svc = service(&tmp);
        write(&svc.files_dir().join("100").join("sword.tex"), "old");
        write(&svc.files_dir().join("200").join("sword.tex"), "new");
        write(&svc.files_dir().join("150").join("cape.tex"), "cape");

        let index = svc.file_backup_index().unwrap();
        assert_eq!(index.len(), 2);
        let sword = &index["sword.tex"];
        assert_eq!(
            sword.backup_paths,
            vec![
                svc.files_dir().join("200").join("sword.tex"),
                svc.files_dir().join("100").join("sword.tex"),
            ]
        );
    }

    #[test]
    fn missing_backup_root_is_empty_not_an_error() {
        let tmp = TempDir::new().unwrap();
        let svc = service(&tmp);
        assert!(svc.file_backup_index().unwrap().is_empty());
        assert!(svc.list_sessions().unwrap().is_empty());
        assert!(!svc.has_mod_backup("CoolSword").unwrap());
        assert!(svc.latest_mod_archive("CoolSword").unwrap().is_none());
    }

    #[test]
    fn directory_session_restores_into_mod_root() {
        let tmp = TempDir::new().unwrap();
        let svc = service(&tmp);
        let session_dir = svc.sessions_dir().join("2024-session");
        let manifest = SessionManifest {
            display_name: Some("Before optimize".to_string()),
            created_at: Some(42),
            entries: vec![SessionEntry {
                original_file_name: "sword.tex".to_string(),
                mod_folder_name: "CoolSword".to_string(),
                mod_relative_path: "tex/sword.tex".to_string(),
            }],
        };
        write(
            &session_dir.join(SESSION_MANIFEST),
            &serde_json::to_string(&manifest).unwrap(),
        );
        write(&session_dir.join("CoolSword/tex/sword.tex"), "original");

        let sessions = svc.list_sessions().unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].display_name, "Before optimize");
        assert_eq!(sessions[0].created_at, 42);
        assert!(!sessions[0].is_archive);

        let ok = svc
            .restore_session(&session_dir, false, &silent_progress(), &CancelToken::new())
            .unwrap();
        assert!(ok);
        let restored = fs::read_to_string(tmp.path().join("Mods/CoolSword/tex/sword.tex")).unwrap();
        assert_eq!(restored, "original");
    }

    #[test]
    fn archive_session_restores_listed_entries() {
        let tmp = TempDir::new().unwrap();
        let svc = service(&tmp);
        fs::create_dir_all(svc.sessions_dir()).unwrap();
        let archive_path = svc.sessions_dir().join("packed.zip");
        let mut writer = zip::ZipWriter::new(fs::File::create(&archive_path).unwrap());
        let options = zip::write::SimpleFileOptions::default();
        writer.start_file(SESSION_MANIFEST, options).unwrap();
        writer
            .write_all(
                br#"{"entries":[{"original_file_name":"cape.tex","mod_folder_name":"Capes","mod_relative_path":"cape.tex"}]}"#,
            )
            .unwrap();
        writer.start_file("Capes/cape.tex", options).unwrap();
        writer.write_all(b"cape bytes").unwrap();
        writer.finish().unwrap();

        let sessions = svc.list_sessions().unwrap();
        assert_eq!(sessions.len(), 1);
        assert!(sessions[0].is_archive);
        assert_eq!(sessions[0].display_name, "packed");

        let ok = svc
            .restore_session(&archive_path, true, &silent_progress(), &CancelToken::new())
            .unwrap();
        assert!(ok);
        assert_eq!(
            fs::read_to_string(tmp.path().join("Mods/Capes/cape.tex")).unwrap(),
            "cape bytes"
        );
    }

    #[test]
    fn latest_mod_snapshot_wins() {
        let tmp = TempDir::new().unwrap();
        let svc = service(&tmp);
        write(&svc.mods_dir().join("CoolSword/100/tex/sword.tex"), "first");
        write(&svc.mods_dir().join("CoolSword/300/tex/sword.tex"), "latest");

        assert!(svc.has_mod_backup("coolsword").unwrap());
        let ok = svc
            .restore_latest_for_mod("CoolSword", &silent_progress(), &CancelToken::new())
            .unwrap();
        assert!(ok);
        assert_eq!(
            fs::read_to_string(tmp.path().join("Mods/CoolSword/tex/sword.tex")).unwrap(),
            "latest"
        );
    }

    #[test]
    fn restore_files_deletes_consumed_backups() {
        let tmp = TempDir::new().unwrap();
        let svc = service(&tmp);
        let backup = svc.files_dir().join("1").join("sword.tex");
        let missing = svc.files_dir().join("1").join("gone.tex");
        write(&backup, "original");
        let target = tmp.path().join("Mods/CoolSword/sword.tex");

        let mut files = BTreeMap::new();
        files.insert(backup.clone(), target.clone());
        files.insert(missing.clone(), tmp.path().join("Mods/CoolSword/gone.tex"));
        let results = svc
            .restore_files(&files, true, &silent_progress(), &CancelToken::new())
            .unwrap();

        assert!(results[&backup]);
        assert!(!results[&missing]);
        assert!(!backup.exists());
        assert_eq!(fs::read_to_string(target).unwrap(), "original");
    }

    #[test]
    fn cancelled_token_restores_nothing() {
        let tmp = TempDir::new().unwrap();
        let svc = service(&tmp);
        write(&svc.mods_dir().join("CoolSword/1/a.tex"), "a");
        let cancel = CancelToken::new();
        cancel.cancel();
        let ok = svc
            .restore_latest_for_mod("CoolSword", &silent_progress(), &cancel)
            .unwrap();
        assert!(!ok);
        assert!(!tmp.path().join("Mods/CoolSword/a.tex").exists());
    }

    #[test]
    fn unsafe_relative_paths_are_rejected() {
        assert_eq!(safe_relative("CoolSword/tex/a.tex"), Some(PathBuf::from("CoolSword/tex/a.tex")));
        assert_eq!(safe_relative("..\\outside.tex"), None);
        assert_eq!(safe_relative("/abs/a.tex"), None);
        assert_eq!(safe_relative(""), None);
    }
}
