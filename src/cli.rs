use anyhow::{anyhow, bail, Context, Result};
use serde::Serialize;
use std::{
    collections::HashMap,
    path::PathBuf,
    sync::Arc,
    thread,
    time::Duration,
};
use texrestore::{
    backup::{BackupEntry, BackupService},
    config::AppConfig,
    detection::DetectionCache,
    framework::{LocalModFramework, ModFramework},
    fs_backup::FsBackupService,
    inventory::{self, AssetInventory, JsonFileInventory},
    matcher::{self, MatchContext},
    restore::{RestoreEvent, RestoreOrchestrator, RestoreRequest, RestoreStage, StepOutcome},
};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutputFormat {
    Text,
    Json,
}

impl OutputFormat {
    fn parse(value: &str) -> Option<Self> {
        match value {
            "json" => Some(OutputFormat::Json),
            "text" => Some(OutputFormat::Text),
            _ => None,
        }
    }
}

#[derive(Debug, Default)]
struct GlobalOptions {
    format: Option<OutputFormat>,
    verbosity: u8,
    config: Option<PathBuf>,
    inventory: Option<PathBuf>,
    mod_root: Option<PathBuf>,
    backup_root: Option<PathBuf>,
}

#[derive(Debug, PartialEq, Eq)]
enum CliCommand {
    Scan,
    Sessions,
    Restore { files: Vec<String> },
    Help,
    Version,
}

pub fn run() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let (global, command) = parse_args(&args)?;
    init_logging(global.verbosity);

    match command {
        CliCommand::Help => {
            print_help();
            Ok(())
        }
        CliCommand::Version => {
            println!("texrestore v{}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        command => {
            let context = CliContext::load(&global)?;
            let format = global.format.unwrap_or(OutputFormat::Text);
            match command {
                CliCommand::Scan => scan(&context, format),
                CliCommand::Sessions => list_sessions(&context, format),
                CliCommand::Restore { files } => restore(&context, files),
                CliCommand::Help | CliCommand::Version => Ok(()),
            }
        }
    }
}

fn init_logging(verbosity: u8) {
    let level = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();
}

fn parse_args(args: &[String]) -> Result<(GlobalOptions, CliCommand)> {
    if matches!(args.first().map(|s| s.as_str()), Some("--version" | "-V" | "version")) {
        return Ok((GlobalOptions::default(), CliCommand::Version));
    }

    let (global, tokens) = parse_global_options(args)?;
    let Some(head) = tokens.first() else {
        return Ok((global, CliCommand::Help));
    };
    let command = match head.as_str() {
        "scan" => CliCommand::Scan,
        "sessions" => CliCommand::Sessions,
        "restore" => CliCommand::Restore {
            files: parse_restore_files(tokens.get(1..).unwrap_or(&[]))?,
        },
        "help" | "--help" | "-h" => CliCommand::Help,
        other => bail!("Unknown command: {other} (use 'scan', 'sessions' or 'restore')"),
    };
    Ok((global, command))
}

fn parse_global_options(args: &[String]) -> Result<(GlobalOptions, Vec<String>)> {
    let mut global = GlobalOptions::default();
    let mut tokens = Vec::new();
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "-v" | "-vv" | "-vvv" => {
                global.verbosity = global.verbosity.max((arg.len() - 1) as u8);
                continue;
            }
            "--format" => {
                let value = iter.next().ok_or_else(|| anyhow!("--format requires a value"))?;
                global.format = Some(parse_format(value)?);
                continue;
            }
            "--config" | "--inventory" | "--mod-root" | "--backup-root" => {
                let value = iter
                    .next()
                    .map(PathBuf::from)
                    .ok_or_else(|| anyhow!("{arg} requires a path"))?;
                match arg.as_str() {
                    "--config" => global.config = Some(value),
                    "--inventory" => global.inventory = Some(value),
                    "--mod-root" => global.mod_root = Some(value),
                    _ => global.backup_root = Some(value),
                }
                continue;
            }
            _ => {}
        }
        if let Some(value) = arg.strip_prefix("--format=") {
            global.format = Some(parse_format(value)?);
            continue;
        }
        tokens.push(arg.to_string());
    }
    Ok((global, tokens))
}

fn parse_format(value: &str) -> Result<OutputFormat> {
    OutputFormat::parse(value).ok_or_else(|| anyhow!("Unknown format: {value} (use 'text' or 'json')"))
}

fn parse_restore_files(args: &[String]) -> Result<Vec<String>> {
    let mut files = Vec::new();
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--file" | "-f" => {
                let name = iter.next().ok_or_else(|| anyhow!("--file requires a name"))?;
                files.push(name.to_string());
            }
            other => bail!("Unknown restore option: {other}"),
        }
    }
    Ok(files)
}

struct CliContext {
    inventory: Arc<dyn AssetInventory>,
    backups: Arc<dyn BackupService>,
    framework: Arc<dyn ModFramework>,
    config: AppConfig,
}

impl CliContext {
    fn load(global: &GlobalOptions) -> Result<Self> {
        let mut config = match &global.config {
            Some(path) => AppConfig::load_from(path)?,
            None => AppConfig::load_or_create()?,
        };
        if let Some(mod_root) = &global.mod_root {
            config.mod_root = mod_root.clone();
        }
        if let Some(backup_root) = &global.backup_root {
            config.backup_root = backup_root.clone();
        }
        if config.backup_root.as_os_str().is_empty() {
            bail!("No backup root configured (set backup_root or pass --backup-root)");
        }
        let inventory_path = global
            .inventory
            .clone()
            .unwrap_or_else(|| PathBuf::from("inventory.json"));
        log::info!(
            "Mod root {}, backups {}, inventory {}",
            config.mod_root.display(),
            config.backup_root.display(),
            inventory_path.display()
        );

        Ok(Self {
            inventory: Arc::new(JsonFileInventory::new(inventory_path)),
            backups: Arc::new(FsBackupService::new(
                config.backup_root.clone(),
                config.mod_root.clone(),
            )),
            framework: Arc::new(LocalModFramework::new(config.mod_root.clone())),
            config,
        })
    }

    fn detection_cache(&self) -> DetectionCache {
        DetectionCache::new(
            Arc::clone(&self.inventory),
            Arc::clone(&self.backups),
            Arc::clone(&self.framework),
            self.config.detection_settings(),
        )
    }
}

#[derive(Serialize)]
struct ScanReport<'a> {
    status: String,
    backups: Vec<(&'a String, &'a BackupEntry)>,
}

fn scan(context: &CliContext, format: OutputFormat) -> Result<()> {
    let cache = context.detection_cache();
    cache.trigger_scan("cli scan");
    while cache.is_scanning() {
        thread::sleep(POLL_INTERVAL);
    }
    let snapshot = cache.settled_snapshot();
    let merged = snapshot.merged();
    let mut backups: Vec<(&String, &BackupEntry)> = merged.iter().collect();
    backups.sort_by(|a, b| a.0.cmp(b.0));

    if format == OutputFormat::Json {
        let report = ScanReport {
            status: snapshot.status.label(),
            backups,
        };
        println!(
            "{}",
            serde_json::to_string_pretty(&report).context("serialize scan report")?
        );
        return Ok(());
    }

    println!("{}", snapshot.status.label());
    for (key, entry) in backups {
        match entry.latest_path() {
            Some(path) => println!("  {key}  ({} backup(s), latest {})", entry.backup_paths.len(), path.display()),
            None => println!("  {key}"),
        }
    }
    Ok(())
}

#[derive(Serialize)]
struct SessionRow {
    name: String,
    created: String,
    archive: bool,
    entries: usize,
    score: u32,
}

fn list_sessions(context: &CliContext, format: OutputFormat) -> Result<()> {
    let sessions = context.backups.list_sessions()?;
    let assets = context.inventory.current_assets()?;
    let owning = match context.framework.mod_root_directory() {
        Some(root) => inventory::owning_mods(&root, &assets),
        None => Vec::new(),
    };
    let ctx = MatchContext::from_assets(&assets, &owning);
    let weights = context.config.restore_options().match_weights;
    let best = matcher::select_best_session(&sessions, &ctx, weights)
        .map(|(session, _)| session.source_path.clone());

    let rows: Vec<SessionRow> = sessions
        .iter()
        .map(|session| SessionRow {
            name: session.display_name.clone(),
            created: format_date_cell(Some(session.created_at)),
            archive: session.is_archive,
            entries: session.entries.len(),
            score: matcher::score_session(session, &ctx, weights),
        })
        .collect();

    if format == OutputFormat::Json {
        println!(
            "{}",
            serde_json::to_string_pretty(&rows).context("serialize sessions")?
        );
        return Ok(());
    }
    if rows.is_empty() {
        println!("No backup sessions found");
        return Ok(());
    }
    for (session, row) in sessions.iter().zip(&rows) {
        let marker = if best.as_ref() == Some(&session.source_path) {
            "*"
        } else {
            " "
        };
        let kind = if row.archive { "zip" } else { "dir" };
        println!(
            "{marker} {}  {kind}  {:>3} file(s)  score {}  {}",
            row.created, row.entries, row.score, row.name
        );
    }
    Ok(())
}

fn restore(context: &CliContext, files: Vec<String>) -> Result<()> {
    let request = if files.is_empty() {
        RestoreRequest::Auto
    } else {
        let index = context.backups.file_backup_index()?;
        let mut explicit = HashMap::new();
        for name in files {
            let entry = index
                .get(&name)
                .or_else(|| {
                    index
                        .iter()
                        .find(|(key, _)| key.eq_ignore_ascii_case(&name))
                        .map(|(_, entry)| entry)
                })
                .ok_or_else(|| anyhow!("No file backup named {name}"))?;
            explicit.insert(name, entry.clone());
        }
        RestoreRequest::Explicit(explicit)
    };

    let orchestrator = RestoreOrchestrator::new(
        Arc::clone(&context.inventory),
        Arc::clone(&context.backups),
        Arc::clone(&context.framework),
        context.detection_cache(),
        context.config.restore_options(),
    );
    let handle = orchestrator.start_restore(request)?;
    let mut finished = false;
    while !finished {
        for event in handle.try_events() {
            match event {
                RestoreEvent::Stage(stage) if !stage.is_terminal() => {
                    println!("== {}", stage.label());
                }
                RestoreEvent::Step(step) => {
                    let mark = match step.outcome {
                        StepOutcome::Info => " ",
                        StepOutcome::Success => "+",
                        StepOutcome::Failure => "!",
                    };
                    println!("{mark} {}", step.message);
                }
                RestoreEvent::Finished(_) => finished = true,
                _ => {}
            }
        }
        if !finished {
            thread::sleep(POLL_INTERVAL);
        }
    }

    let run = handle.wait();
    let elapsed = run
        .finished_at
        .map(|at| at.duration_since(run.started_at))
        .unwrap_or_default();
    match run.stage {
        RestoreStage::Completed => {
            println!("Restore completed in {:.1}s", elapsed.as_secs_f32());
            Ok(())
        }
        RestoreStage::Cancelled => bail!("Restore cancelled"),
        _ => bail!(
            "Restore failed: {}",
            run.failure.as_deref().unwrap_or("nothing could be restored")
        ),
    }
}

fn print_help() {
    println!("texrestore v{}", env!("CARGO_PKG_VERSION"));
    println!("Usage:");
    println!("  texrestore scan                      Detect backups for loaded textures");
    println!("  texrestore sessions                  List backup sessions with match scores");
    println!("  texrestore restore                   Restore loaded textures from backups");
    println!("  texrestore restore --file <name>...  Restore specific file backups");
    println!();
    println!("Global options:");
    println!("  --config <path>                      Config file (default: per-user config)");
    println!("  --inventory <path>                   JSON list of loaded assets (default: inventory.json)");
    println!("  --mod-root <path>                    Override the configured mod root");
    println!("  --backup-root <path>                 Override the configured backup root");
    println!("  --format <json|text>                 Output format for scan and sessions");
    println!("  -v, -vv, -vvv                        Increase log verbosity");
    println!("  -h, --help                           Show help");
    println!("  -V, --version                        Show version");
}

fn format_date_cell(value: Option<i64>) -> String {
    if let Some(value) = value {
        if let Some(formatted) = format_short_date(value) {
            return formatted;
        }
    }
    "----------".to_string()
}

fn format_short_date(timestamp: i64) -> Option<String> {
    if timestamp <= 0 {
        return None;
    }
    let date = time::OffsetDateTime::from_unix_timestamp(timestamp).ok()?;
    Some(format!(
        "{:04}-{:02}-{:02}",
        date.year(),
        date.month() as u8,
        date.day()
    ))
}
