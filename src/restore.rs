use crate::{
    backup::{BackupEntry, BackupService, CancelToken, ProgressSink, RestoreProgress},
    detection::DetectionCache,
    error::RestoreError,
    framework::ModFramework,
    inventory::{self, AssetFingerprint, AssetInventory},
    matcher::{self, MatchContext, MatchWeights},
};
use anyhow::{anyhow, bail, Context, Result};
use std::{
    collections::{BTreeMap, HashMap},
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        mpsc::{self, Receiver, Sender, TryRecvError},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    thread::{self, JoinHandle},
    time::Instant,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreStage {
    Preparing,
    TargetedModRestore,
    SessionRestore,
    PerFileRestore,
    Completed,
    Failed,
    Cancelled,
}

impl RestoreStage {
    pub fn label(self) -> &'static str {
        match self {
            RestoreStage::Preparing => "Preparing",
            RestoreStage::TargetedModRestore => "Restoring mods",
            RestoreStage::SessionRestore => "Restoring session",
            RestoreStage::PerFileRestore => "Restoring files",
            RestoreStage::Completed => "Completed",
            RestoreStage::Failed => "Failed",
            RestoreStage::Cancelled => "Cancelled",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RestoreStage::Completed | RestoreStage::Failed | RestoreStage::Cancelled
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Info,
    Success,
    Failure,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepEntry {
    pub stage: RestoreStage,
    pub outcome: StepOutcome,
    pub message: String,
}

/// Observable state of one restore run. Written only by its worker.
#[derive(Debug, Clone)]
pub struct RestoreRun {
    pub id: u64,
    pub stage: RestoreStage,
    pub mods_total: usize,
    pub mods_done: usize,
    pub files_total: usize,
    pub files_done: usize,
    pub current_mod_name: Option<String>,
    pub started_at: Instant,
    pub finished_at: Option<Instant>,
    pub cancel_requested: bool,
    pub failure: Option<String>,
    pub step_log: Vec<StepEntry>,
}

impl RestoreRun {
    fn new(id: u64) -> Self {
        Self {
            id,
            stage: RestoreStage::Preparing,
            mods_total: 0,
            mods_done: 0,
            files_total: 0,
            files_done: 0,
            current_mod_name: None,
            started_at: Instant::now(),
            finished_at: None,
            cancel_requested: false,
            failure: None,
            step_log: Vec::new(),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.stage.is_terminal()
    }

    pub fn steps_in(&self, stage: RestoreStage) -> impl Iterator<Item = &StepEntry> {
        self.step_log.iter().filter(move |step| step.stage == stage)
    }

    /// Success and failure records of a stage, skipping informational lines.
    pub fn outcomes_in(&self, stage: RestoreStage) -> Vec<&StepEntry> {
        self.steps_in(stage)
            .filter(|step| step.outcome != StepOutcome::Info)
            .collect()
    }
}

#[derive(Debug, Clone)]
pub enum RestoreEvent {
    Stage(RestoreStage),
    Progress(RestoreProgress),
    Step(StepEntry),
    Finished(RestoreStage),
}

#[derive(Debug, Clone, Default)]
pub enum RestoreRequest {
    /// Walk the full fallback chain for whatever is loaded.
    #[default]
    Auto,
    /// Restore exactly these file-level backups through the per-file path.
    Explicit(HashMap<String, BackupEntry>),
}

#[derive(Debug, Clone, Copy)]
pub struct RestoreOptions {
    pub delete_consumed_backups: bool,
    pub match_weights: MatchWeights,
}

impl Default for RestoreOptions {
    fn default() -> Self {
        Self {
            delete_consumed_backups: true,
            match_weights: MatchWeights::default(),
        }
    }
}

/// Process-wide "is a restore running" flag, shared with the invalidator.
#[derive(Debug, Default)]
pub struct RestoreActivity {
    active: AtomicBool,
    active_id: AtomicU64,
}

impl RestoreActivity {
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub(crate) fn try_begin(&self, id: u64) -> Result<(), u64> {
        if self
            .active
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(self.active_id.load(Ordering::SeqCst));
        }
        self.active_id.store(id, Ordering::SeqCst);
        Ok(())
    }

    pub(crate) fn finish(&self) {
        self.active.store(false, Ordering::SeqCst);
    }
}

struct ActivityGuard {
    activity: Arc<RestoreActivity>,
}

impl Drop for ActivityGuard {
    fn drop(&mut self) {
        self.activity.finish();
    }
}

pub struct RestoreHandle {
    id: u64,
    cancel: CancelToken,
    run: Arc<Mutex<RestoreRun>>,
    events: Receiver<RestoreEvent>,
    worker: Option<JoinHandle<()>>,
}

impl RestoreHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Requests a cooperative stop at the worker's next checkpoint.
    pub fn cancel(&self) {
        self.cancel.cancel();
        lock_run(&self.run).cancel_requested = true;
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn progress(&self) -> RestoreRun {
        lock_run(&self.run).clone()
    }

    pub fn try_events(&self) -> Vec<RestoreEvent> {
        let mut events = Vec::new();
        loop {
            match self.events.try_recv() {
                Ok(event) => events.push(event),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
        events
    }

    /// Blocks until the worker exits and returns the final run state.
    pub fn wait(mut self) -> RestoreRun {
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                log::error!("Restore worker {} panicked", self.id);
            }
        }
        self.progress()
    }
}

pub struct RestoreOrchestrator {
    inventory: Arc<dyn AssetInventory>,
    backups: Arc<dyn BackupService>,
    framework: Arc<dyn ModFramework>,
    cache: DetectionCache,
    options: RestoreOptions,
    activity: Arc<RestoreActivity>,
    next_id: AtomicU64,
}

impl RestoreOrchestrator {
    pub fn new(
        inventory: Arc<dyn AssetInventory>,
        backups: Arc<dyn BackupService>,
        framework: Arc<dyn ModFramework>,
        cache: DetectionCache,
        options: RestoreOptions,
    ) -> Self {
        Self {
            inventory,
            backups,
            framework,
            cache,
            options: RestoreOptions {
                match_weights: options.match_weights.normalized(),
                ..options
            },
            activity: Arc::new(RestoreActivity::default()),
            next_id: AtomicU64::new(0),
        }
    }

    pub fn activity(&self) -> Arc<RestoreActivity> {
        Arc::clone(&self.activity)
    }

    pub fn is_restore_active(&self) -> bool {
        self.activity.is_active()
    }

    /// Starts a restore on a worker thread. A second start while one is
    /// running is rejected, never queued.
    pub fn start_restore(&self, request: RestoreRequest) -> Result<RestoreHandle, RestoreError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        if let Err(active_id) = self.activity.try_begin(id) {
            log::warn!("Restore {id} rejected: restore {active_id} still running");
            return Err(RestoreError::AlreadyRunning { id: active_id });
        }

        let cancel = CancelToken::new();
        let run = Arc::new(Mutex::new(RestoreRun::new(id)));
        let (events_tx, events_rx) = mpsc::channel();
        let worker = RestoreWorker {
            inventory: Arc::clone(&self.inventory),
            backups: Arc::clone(&self.backups),
            framework: Arc::clone(&self.framework),
            cache: self.cache.clone(),
            options: self.options,
            request,
            cancel: cancel.clone(),
            run: Arc::clone(&run),
            events: events_tx,
        };
        let guard = ActivityGuard {
            activity: Arc::clone(&self.activity),
        };
        log::info!("Restore {id} started");
        let join = thread::spawn(move || {
            let _guard = guard;
            let terminal = worker.execute();
            worker.finish(terminal);
        });

        Ok(RestoreHandle {
            id,
            cancel,
            run,
            events: events_rx,
            worker: Some(join),
        })
    }

    pub fn progress(&self, handle: &RestoreHandle) -> RestoreRun {
        handle.progress()
    }

    pub fn cancel(&self, handle: &RestoreHandle) {
        handle.cancel();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StageOutcome {
    Restored,
    NothingRestored,
    Cancelled,
}

struct Prepared {
    assets: Vec<AssetFingerprint>,
    owning_mods: Vec<String>,
    mods_with_backup: Vec<String>,
}

struct RestoreWorker {
    inventory: Arc<dyn AssetInventory>,
    backups: Arc<dyn BackupService>,
    framework: Arc<dyn ModFramework>,
    cache: DetectionCache,
    options: RestoreOptions,
    request: RestoreRequest,
    cancel: CancelToken,
    run: Arc<Mutex<RestoreRun>>,
    events: Sender<RestoreEvent>,
}

impl RestoreWorker {
    fn execute(&self) -> RestoreStage {
        let prepared = match self.prepare() {
            Ok(prepared) => prepared,
            Err(err) => {
                self.update(|run| run.failure = Some(err.to_string()));
                self.step(StepOutcome::Failure, err.to_string());
                return RestoreStage::Failed;
            }
        };
        if self.cancel.is_cancelled() {
            return RestoreStage::Cancelled;
        }

        if let RestoreRequest::Explicit(entries) = &self.request {
            self.set_stage(RestoreStage::PerFileRestore);
            return self.per_file_stage(&prepared, entries.clone());
        }

        if !prepared.mods_with_backup.is_empty() {
            self.set_stage(RestoreStage::TargetedModRestore);
            match self.restore_owning_mods(&prepared.mods_with_backup) {
                StageOutcome::Restored => return RestoreStage::Completed,
                StageOutcome::Cancelled => return RestoreStage::Cancelled,
                StageOutcome::NothingRestored => {}
            }
        }
        if self.cancel.is_cancelled() {
            return RestoreStage::Cancelled;
        }

        self.set_stage(RestoreStage::SessionRestore);
        match self.restore_session(&prepared) {
            Ok(()) => return RestoreStage::Completed,
            Err(err) => self.step(StepOutcome::Failure, format!("{err:#}")),
        }
        if self.cancel.is_cancelled() {
            return RestoreStage::Cancelled;
        }

        self.set_stage(RestoreStage::PerFileRestore);
        let candidates = match self.backups.file_backup_index() {
            Ok(index) => index
                .into_iter()
                .filter(|(name, entry)| {
                    !entry.is_mod_level()
                        && matcher::resolve_current_location(name, &prepared.assets).is_some()
                })
                .collect(),
            Err(err) => {
                let err = RestoreError::Candidates(format!("{err:#}"));
                self.update(|run| run.failure = Some(err.to_string()));
                self.step(StepOutcome::Failure, err.to_string());
                return RestoreStage::Failed;
            }
        };
        self.per_file_stage(&prepared, candidates)
    }

    fn prepare(&self) -> Result<Prepared, RestoreError> {
        self.set_stage(RestoreStage::Preparing);
        let assets = self
            .inventory
            .current_assets()
            .map_err(|err| RestoreError::Inventory(format!("{err:#}")))?;
        if assets.is_empty() {
            return Err(RestoreError::Candidates(
                "no texture assets are loaded".to_string(),
            ));
        }
        let mod_root = self
            .framework
            .mod_root_directory()
            .ok_or(RestoreError::ModRootUnresolved)?;

        let owning_mods = inventory::owning_mods(&mod_root, &assets);
        let mut mods_with_backup = Vec::new();
        if matches!(self.request, RestoreRequest::Auto) {
            for folder in &owning_mods {
                match self.backups.has_mod_backup(folder) {
                    Ok(true) => mods_with_backup.push(folder.clone()),
                    Ok(false) => {}
                    Err(err) => self.step(
                        StepOutcome::Failure,
                        format!("Backup lookup for {folder} failed: {err:#}"),
                    ),
                }
            }
        }

        let mods_total = mods_with_backup.len();
        self.update(|run| run.mods_total = mods_total);
        self.step(
            StepOutcome::Info,
            format!(
                "{} asset(s), {} owning mod(s), {} with backups",
                assets.len(),
                owning_mods.len(),
                mods_total
            ),
        );
        Ok(Prepared {
            assets,
            owning_mods,
            mods_with_backup,
        })
    }

    fn restore_owning_mods(&self, mods: &[String]) -> StageOutcome {
        for folder in mods {
            if self.cancel.is_cancelled() {
                self.step(StepOutcome::Info, format!("Cancelled before {folder}"));
                return StageOutcome::Cancelled;
            }
            self.update(|run| {
                run.current_mod_name = Some(folder.clone());
                run.files_done = 0;
                run.files_total = 0;
            });
            match self.restore_one_mod(folder) {
                Ok(method) => {
                    self.update(|run| run.mods_done += 1);
                    self.step(
                        StepOutcome::Success,
                        format!("Restored {folder} from {method}"),
                    );
                }
                Err(err) => self.step(StepOutcome::Failure, format!("{folder}: {err:#}")),
            }
        }
        self.update(|run| run.current_mod_name = None);

        if self.cancel.is_cancelled() {
            return StageOutcome::Cancelled;
        }
        if lock_run(&self.run).mods_done > 0 {
            StageOutcome::Restored
        } else {
            StageOutcome::NothingRestored
        }
    }

    fn restore_one_mod(&self, folder: &str) -> Result<&'static str> {
        let sink = self.progress_sink(true);
        let package_error = match self.backups.latest_mod_archive(folder) {
            Ok(Some(archive)) => {
                match self
                    .backups
                    .restore_pmp_for_mod(folder, &archive, &sink, &self.cancel)
                {
                    Ok(true) => return Ok("mod package"),
                    Ok(false) => Some("mod package restored no files".to_string()),
                    Err(err) => Some(format!("{err:#}")),
                }
            }
            Ok(None) => None,
            Err(err) => Some(format!("{err:#}")),
        };
        if self.cancel.is_cancelled() {
            bail!("cancelled before latest backup");
        }
        if let Some(err) = &package_error {
            log::warn!("Mod package restore for {folder} failed, trying latest backup: {err}");
        }

        let restored = self
            .backups
            .restore_latest_for_mod(folder, &sink, &self.cancel)
            .context("restore latest backup")?;
        if restored {
            return Ok("latest backup");
        }
        match package_error {
            Some(err) => Err(anyhow!("no restorable backup (package: {err})")),
            None => Err(anyhow!("no restorable backup")),
        }
    }

    fn restore_session(&self, prepared: &Prepared) -> Result<()> {
        let sessions = self
            .backups
            .list_sessions()
            .context("list backup sessions")?;
        if sessions.is_empty() {
            bail!("no backup sessions available");
        }

        let ctx = MatchContext::from_assets(&prepared.assets, &prepared.owning_mods);
        let (session, reason) =
            match matcher::select_best_session(&sessions, &ctx, self.options.match_weights) {
                Some((session, score)) => (session, format!("best match, score {score}")),
                None => (
                    matcher::latest_session(&sessions).context("pick latest session")?,
                    "latest, nothing matched".to_string(),
                ),
            };
        self.step(
            StepOutcome::Info,
            format!("Selected session {} ({reason})", session.display_name),
        );

        let sink = self.progress_sink(true);
        let restored = self
            .backups
            .restore_session(&session.source_path, session.is_archive, &sink, &self.cancel)
            .with_context(|| format!("restore session {}", session.display_name))?;
        if !restored {
            bail!("session {} restored no files", session.display_name);
        }
        self.step(
            StepOutcome::Success,
            format!("Restored session {}", session.display_name),
        );
        Ok(())
    }

    fn per_file_stage(
        &self,
        prepared: &Prepared,
        candidates: HashMap<String, BackupEntry>,
    ) -> RestoreStage {
        let mut names: Vec<&String> = candidates.keys().collect();
        names.sort();

        let mut plan: Vec<(String, PathBuf, PathBuf)> = Vec::new();
        for name in names {
            let entry = &candidates[name];
            if entry.is_mod_level() {
                continue;
            }
            let Some(backup) = entry.latest_path() else {
                continue;
            };
            match matcher::resolve_current_location(name, &prepared.assets) {
                Some((target, _)) => plan.push((name.clone(), backup.to_path_buf(), target)),
                None => self.step(
                    StepOutcome::Info,
                    format!("No current location for {name}"),
                ),
            }
        }

        let files_total = plan.len();
        self.update(|run| {
            run.files_total = files_total;
            run.files_done = 0;
        });
        if plan.is_empty() {
            let err = RestoreError::Candidates(
                "no file backups resolve to a loaded texture".to_string(),
            );
            self.update(|run| run.failure = Some(err.to_string()));
            self.step(StepOutcome::Failure, err.to_string());
            return RestoreStage::Failed;
        }

        let sink = self.progress_sink(false);
        for (name, backup, target) in plan {
            if self.cancel.is_cancelled() {
                self.step(StepOutcome::Info, format!("Cancelled before {name}"));
                return RestoreStage::Cancelled;
            }
            let mut files = BTreeMap::new();
            files.insert(backup.clone(), target.clone());
            match self.backups.restore_files(
                &files,
                self.options.delete_consumed_backups,
                &sink,
                &self.cancel,
            ) {
                Ok(results) if results.get(&backup).copied().unwrap_or(false) => {
                    self.update(|run| run.files_done += 1);
                    self.step(
                        StepOutcome::Success,
                        format!("Restored {name} to {}", target.display()),
                    );
                }
                Ok(_) => self.step(
                    StepOutcome::Failure,
                    format!("{name}: backup service reported failure"),
                ),
                Err(err) => self.step(StepOutcome::Failure, format!("{name}: {err:#}")),
            }
        }

        if self.cancel.is_cancelled() {
            return RestoreStage::Cancelled;
        }
        if lock_run(&self.run).files_done > 0 {
            RestoreStage::Completed
        } else {
            let message = "no file backups could be restored".to_string();
            self.update(|run| run.failure = Some(message.clone()));
            RestoreStage::Failed
        }
    }

    fn finish(&self, terminal: RestoreStage) {
        let (id, restored_anything) = {
            let run = lock_run(&self.run);
            let restored = run
                .step_log
                .iter()
                .any(|step| step.outcome == StepOutcome::Success);
            (run.id, restored)
        };
        self.set_stage(terminal);
        self.update(|run| {
            run.finished_at = Some(Instant::now());
            run.current_mod_name = None;
        });

        if restored_anything {
            self.cache.invalidate("restore finished");
        }
        if terminal == RestoreStage::Completed {
            self.framework.redraw_current_character();
        }
        match terminal {
            RestoreStage::Completed => log::info!("Restore {id} completed"),
            RestoreStage::Cancelled => log::info!("Restore {id} cancelled"),
            _ => log::warn!("Restore {id} failed"),
        }
        let _ = self.events.send(RestoreEvent::Finished(terminal));
    }

    fn set_stage(&self, stage: RestoreStage) {
        self.update(|run| run.stage = stage);
        log::debug!("Restore stage: {}", stage.label());
        let _ = self.events.send(RestoreEvent::Stage(stage));
    }

    fn step(&self, outcome: StepOutcome, message: String) {
        match outcome {
            StepOutcome::Info => log::debug!("{message}"),
            StepOutcome::Success => log::info!("{message}"),
            StepOutcome::Failure => log::warn!("{message}"),
        }
        let entry = {
            let mut run = lock_run(&self.run);
            let entry = StepEntry {
                stage: run.stage,
                outcome,
                message,
            };
            run.step_log.push(entry.clone());
            entry
        };
        let _ = self.events.send(RestoreEvent::Step(entry));
    }

    fn update(&self, apply: impl FnOnce(&mut RestoreRun)) {
        apply(&mut lock_run(&self.run));
    }

    fn progress_sink(&self, track_files: bool) -> ProgressSink {
        let run = Arc::clone(&self.run);
        let events = self.events.clone();
        Arc::new(move |progress: RestoreProgress| {
            if track_files {
                let mut run = lock_run(&run);
                run.files_done = progress.current;
                run.files_total = progress.total;
            }
            let _ = events.send(RestoreEvent::Progress(progress));
        })
    }
}

fn lock_run(run: &Mutex<RestoreRun>) -> MutexGuard<'_, RestoreRun> {
    run.lock().unwrap_or_else(PoisonError::into_inner)
}
