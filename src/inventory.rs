use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, HashSet},
    fs,
    path::{Path, PathBuf},
    sync::Mutex,
};

/// A texture as observed in the current character load.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetFingerprint {
    pub file_name: String,
    #[serde(default)]
    pub full_paths: Vec<String>,
    #[serde(default)]
    pub format: Option<String>,
    #[serde(default)]
    pub original_size_bytes: u64,
}

impl AssetFingerprint {
    pub fn new(file_name: &str, full_paths: &[&str]) -> Self {
        Self {
            file_name: file_name.to_string(),
            full_paths: full_paths.iter().map(|path| path.to_string()).collect(),
            format: None,
            original_size_bytes: 0,
        }
    }
}

/// Read-through to the character analysis service.
///
/// An empty list means analysis has not produced anything yet and is not an error.
pub trait AssetInventory: Send + Sync {
    fn current_assets(&self) -> Result<Vec<AssetFingerprint>>;
}

#[derive(Debug, Default)]
pub struct StaticInventory {
    assets: Mutex<Vec<AssetFingerprint>>,
}

impl StaticInventory {
    pub fn new(assets: Vec<AssetFingerprint>) -> Self {
        Self {
            assets: Mutex::new(assets),
        }
    }

    pub fn replace(&self, assets: Vec<AssetFingerprint>) {
        if let Ok(mut guard) = self.assets.lock() {
            *guard = assets;
        }
    }
}

impl AssetInventory for StaticInventory {
    fn current_assets(&self) -> Result<Vec<AssetFingerprint>> {
        let guard = self
            .assets
            .lock()
            .map_err(|_| anyhow::anyhow!("inventory lock poisoned"))?;
        Ok(guard.clone())
    }
}

/// Inventory re-read from a JSON array of fingerprints on every call.
#[derive(Debug, Clone)]
pub struct JsonFileInventory {
    path: PathBuf,
}

impl JsonFileInventory {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

impl AssetInventory for JsonFileInventory {
    fn current_assets(&self) -> Result<Vec<AssetFingerprint>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let raw = fs::read_to_string(&self.path).context("read inventory file")?;
        let assets = serde_json::from_str(&raw).context("parse inventory file")?;
        Ok(assets)
    }
}

pub fn normalize_path(path: &str) -> String {
    path.replace('\\', "/").trim_end_matches('/').to_string()
}

pub fn file_name_of(path: &str) -> &str {
    path.rsplit(|ch: char| ch == '/' || ch == '\\')
        .next()
        .unwrap_or(path)
}

pub fn file_name_set(assets: &[AssetFingerprint]) -> HashSet<String> {
    assets
        .iter()
        .map(|asset| asset.file_name.to_lowercase())
        .filter(|name| !name.is_empty())
        .collect()
}

/// Every directory segment of every full path, lowercased.
pub fn path_segments(assets: &[AssetFingerprint]) -> HashSet<String> {
    let mut segments = HashSet::new();
    for asset in assets {
        for path in &asset.full_paths {
            let normalized = normalize_path(path);
            let mut parts: Vec<&str> = normalized.split('/').collect();
            parts.pop();
            for part in parts {
                if !part.is_empty() && part != "." && !part.ends_with(':') {
                    segments.insert(part.to_lowercase());
                }
            }
        }
    }
    segments
}

/// First path segment below the mod root, when the path lives under it.
pub fn owning_mod_for_path(mod_root: &str, path: &str) -> Option<String> {
    let root = normalize_path(mod_root);
    let path = normalize_path(path);
    if root.is_empty() || path.len() <= root.len() {
        return None;
    }
    let head = path.get(..root.len())?;
    if !head.eq_ignore_ascii_case(&root) {
        return None;
    }
    let rest = path[root.len()..].strip_prefix('/')?;
    let (folder, remainder) = rest.split_once('/')?;
    if folder.is_empty() || remainder.is_empty() {
        return None;
    }
    Some(folder.to_string())
}

/// Distinct owning mod folders for the assets, deduplicated case-insensitively
/// and sorted by lowercase name.
pub fn owning_mods(mod_root: &Path, assets: &[AssetFingerprint]) -> Vec<String> {
    let root = mod_root.to_string_lossy();
    let mut mods: BTreeMap<String, String> = BTreeMap::new();
    for asset in assets {
        for path in &asset.full_paths {
            if let Some(folder) = owning_mod_for_path(&root, path) {
                mods.entry(folder.to_lowercase()).or_insert(folder);
            }
        }
    }
    mods.into_values().collect()
}
