use std::{fs, path::Path, sync::Arc, thread, time::Duration};
use texrestore::{
    backup::{mod_backup_key, BackupService},
    detection::{DetectionCache, DetectionSettings, DetectionStatus},
    framework::LocalModFramework,
    fs_backup::{FsBackupService, SESSION_MANIFEST},
    inventory::{AssetFingerprint, StaticInventory},
    restore::{RestoreOptions, RestoreOrchestrator, RestoreRequest, RestoreStage},
};

struct Tree {
    _dir: tempfile::TempDir,
    mod_root: std::path::PathBuf,
    backup_root: std::path::PathBuf,
}

impl Tree {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mod_root = dir.path().join("mods");
        let backup_root = dir.path().join("backups");
        fs::create_dir_all(&mod_root).unwrap();
        fs::create_dir_all(&backup_root).unwrap();
        Self {
            _dir: dir,
            mod_root,
            backup_root,
        }
    }

    fn write(&self, path: &Path, contents: &str) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, contents).unwrap();
    }

    fn loaded(&self, relative: &str) -> AssetFingerprint {
        let path = self.mod_root.join(relative);
        self.write(&path, "optimized");
        let name = path.file_name().unwrap().to_string_lossy().to_string();
        AssetFingerprint::new(&name, &[path.to_str().unwrap()])
    }

    fn orchestrator(&self, assets: Vec<AssetFingerprint>) -> (RestoreOrchestrator, DetectionCache) {
        let inventory = Arc::new(StaticInventory::new(assets));
        let backups = Arc::new(FsBackupService::new(
            self.backup_root.clone(),
            self.mod_root.clone(),
        ));
        let framework = Arc::new(LocalModFramework::new(self.mod_root.clone()));
        let cache = DetectionCache::new(
            inventory.clone(),
            backups.clone(),
            framework.clone(),
            DetectionSettings::default(),
        );
        let orchestrator = RestoreOrchestrator::new(
            inventory,
            backups,
            framework,
            cache.clone(),
            RestoreOptions::default(),
        );
        (orchestrator, cache)
    }
}

fn settle(cache: &DetectionCache) {
    for _ in 0..500 {
        if !cache.is_scanning() {
            return;
        }
        thread::sleep(Duration::from_millis(10));
    }
    panic!("detection scan did not finish");
}

#[test]
fn mod_snapshot_restores_owning_mod() {
    let tree = Tree::new();
    let asset = tree.loaded("CoolSword/tex/sword.tex");
    tree.write(
        &tree.backup_root.join("mods/CoolSword/1700000000/tex/sword.tex"),
        "original",
    );
    let (orchestrator, cache) = tree.orchestrator(vec![asset]);

    cache.trigger_scan("test");
    settle(&cache);
    let snapshot = cache.snapshot();
    assert!(snapshot.mod_level.contains_key(&mod_backup_key("CoolSword")));
    assert_eq!(snapshot.status, DetectionStatus::Ready { count: 1 });

    let run = orchestrator
        .start_restore(RestoreRequest::Auto)
        .unwrap()
        .wait();

    assert_eq!(run.stage, RestoreStage::Completed);
    assert_eq!(run.mods_done, 1);
    assert_eq!(
        fs::read_to_string(tree.mod_root.join("CoolSword/tex/sword.tex")).unwrap(),
        "original"
    );
}

#[test]
fn session_directory_restores_matching_files() {
    let tree = Tree::new();
    let asset = tree.loaded("CoolSword/tex/sword.tex");
    let session = tree.backup_root.join("sessions/before-optimize");
    tree.write(
        &session.join(SESSION_MANIFEST),
        r#"{
            "display_name": "Before optimize",
            "created_at": 1700000000,
            "entries": [
                {
                    "original_file_name": "sword.tex",
                    "mod_folder_name": "CoolSword",
                    "mod_relative_path": "tex/sword.tex"
                }
            ]
        }"#,
    );
    tree.write(&session.join("CoolSword/tex/sword.tex"), "from session");
    let (orchestrator, _cache) = tree.orchestrator(vec![asset]);

    let run = orchestrator
        .start_restore(RestoreRequest::Auto)
        .unwrap()
        .wait();

    assert_eq!(run.stage, RestoreStage::Completed);
    assert_eq!(
        fs::read_to_string(tree.mod_root.join("CoolSword/tex/sword.tex")).unwrap(),
        "from session"
    );
}

#[test]
fn file_backups_restore_optimized_names_and_are_consumed() {
    let tree = Tree::new();
    let asset = tree.loaded("Capes/cape_bc7.tex");
    let backup = tree.backup_root.join("files/1700000000/cape.tex");
    tree.write(&backup, "original cape");
    let (orchestrator, cache) = tree.orchestrator(vec![asset]);

    let explicit = FsBackupService::new(tree.backup_root.clone(), tree.mod_root.clone())
        .file_backup_index()
        .unwrap();
    let run = orchestrator
        .start_restore(RestoreRequest::Explicit(explicit))
        .unwrap()
        .wait();

    assert_eq!(run.stage, RestoreStage::Completed);
    assert_eq!(run.files_done, 1);
    assert_eq!(
        fs::read_to_string(tree.mod_root.join("Capes/cape_bc7.tex")).unwrap(),
        "original cape"
    );
    assert!(!backup.exists());

    settle(&cache);
    assert_eq!(cache.snapshot().total_count(), 0);
}

#[test]
fn nothing_to_restore_fails() {
    let tree = Tree::new();
    let asset = tree.loaded("Capes/cape.tex");
    let (orchestrator, _cache) = tree.orchestrator(vec![asset]);

    let run = orchestrator
        .start_restore(RestoreRequest::Auto)
        .unwrap()
        .wait();

    assert_eq!(run.stage, RestoreStage::Failed);
    assert!(run.failure.is_some());
}
