use crate::{
    backup::BackupSession,
    inventory::{self, AssetFingerprint},
};
use serde::{Deserialize, Serialize};
use std::{collections::HashSet, path::PathBuf};

/// Tokens the optimizer appends to converted texture names.
const ENCODING_VARIANT_TOKENS: &[&str] = &[
    "bc1", "bc2", "bc3", "bc4", "bc5", "bc6h", "bc7", "dxt1", "dxt3", "dxt5", "a8r8g8b8",
    "x8r8g8b8", "r8g8b8a8", "b8g8r8a8", "bgra", "rgba", "compressed", "optimized", "converted",
];

const BACKUP_EXTENSIONS: &[&str] = &["bak", "backup", "orig"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchWeights {
    pub file_name: u32,
    pub folder_in_path: u32,
    pub owning_mod: u32,
    pub relative_name: u32,
}

impl Default for MatchWeights {
    fn default() -> Self {
        Self {
            file_name: 1,
            folder_in_path: 1,
            owning_mod: 2,
            relative_name: 1,
        }
    }
}

impl MatchWeights {
    /// Keeps an owning-mod hit worth more than any single name or folder hit.
    pub fn normalized(self) -> Self {
        let strongest_single = self
            .file_name
            .max(self.folder_in_path)
            .max(self.relative_name);
        Self {
            owning_mod: self.owning_mod.max(strongest_single + 1),
            ..self
        }
    }
}

/// Lowercased evidence about what is currently loaded.
#[derive(Debug, Clone, Default)]
pub struct MatchContext {
    pub file_names: HashSet<String>,
    pub path_segments: HashSet<String>,
    pub owned_mods: HashSet<String>,
}

impl MatchContext {
    pub fn from_assets(assets: &[AssetFingerprint], owned_mods: &[String]) -> Self {
        Self {
            file_names: inventory::file_name_set(assets),
            path_segments: inventory::path_segments(assets),
            owned_mods: owned_mods.iter().map(|name| name.to_lowercase()).collect(),
        }
    }
}

pub fn score_session(session: &BackupSession, ctx: &MatchContext, weights: MatchWeights) -> u32 {
    let mut score = 0u32;
    for entry in &session.entries {
        let file_name = inventory::file_name_of(&entry.original_file_name).to_lowercase();
        if !file_name.is_empty() && ctx.file_names.contains(&file_name) {
            score = score.saturating_add(weights.file_name);
        }

        let folder = entry.mod_folder_name.to_lowercase();
        if !folder.is_empty() {
            if ctx.path_segments.contains(&folder) {
                score = score.saturating_add(weights.folder_in_path);
            }
            if ctx.owned_mods.contains(&folder) {
                score = score.saturating_add(weights.owning_mod);
            }
        }

        let relative_name = inventory::file_name_of(&entry.mod_relative_path).to_lowercase();
        if !relative_name.is_empty() && ctx.file_names.contains(&relative_name) {
            score = score.saturating_add(weights.relative_name);
        }
    }
    score
}

/// Highest scoring session, newest first on ties. Sessions scoring zero are
/// never returned.
pub fn select_best_session<'a>(
    sessions: &'a [BackupSession],
    ctx: &MatchContext,
    weights: MatchWeights,
) -> Option<(&'a BackupSession, u32)> {
    let mut best: Option<(&BackupSession, u32)> = None;
    for session in sessions {
        let score = score_session(session, ctx, weights);
        if score == 0 {
            continue;
        }
        let better = match best {
            None => true,
            Some((current, current_score)) => {
                score > current_score
                    || (score == current_score && session.created_at > current.created_at)
            }
        };
        if better {
            best = Some((session, score));
        }
    }
    best
}

pub fn latest_session(sessions: &[BackupSession]) -> Option<&BackupSession> {
    sessions.iter().fold(None, |latest: Option<&BackupSession>, session| match latest {
        Some(current) if current.created_at >= session.created_at => Some(current),
        _ => Some(session),
    })
}

/// Lowercases a texture file name and drops backup extensions and
/// encoding-variant tokens, so `Sword_BC7.tex.bak` and `sword.tex` compare equal.
pub fn normalize_texture_name(name: &str) -> String {
    let lower = inventory::file_name_of(name).to_lowercase();
    let mut stem = lower.as_str();
    while let Some((rest, ext)) = stem.rsplit_once('.') {
        if rest.is_empty() || !BACKUP_EXTENSIONS.contains(&ext) {
            break;
        }
        stem = rest;
    }

    let (stem, ext) = match stem.rsplit_once('.') {
        Some((rest, ext)) if !rest.is_empty() => (rest, Some(ext)),
        _ => (stem, None),
    };

    let tokens: Vec<&str> = stem
        .split(|ch: char| ch == '_' || ch == '-' || ch == '.' || ch == ' ')
        .filter(|token| !token.is_empty() && !ENCODING_VARIANT_TOKENS.contains(token))
        .collect();
    let base = if tokens.is_empty() {
        stem.to_string()
    } else {
        tokens.join("_")
    };

    match ext {
        Some(ext) => format!("{base}.{ext}"),
        None => base,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocationMatch {
    FileName,
    Normalized,
    PathSuffix,
}

/// Current on-disk location of the asset a backup key refers to: exact
/// file name first, then the normalized name, then a path-suffix match
/// for keys that carry a relative path.
pub fn resolve_current_location(
    backup_key: &str,
    assets: &[AssetFingerprint],
) -> Option<(PathBuf, LocationMatch)> {
    let loaded = || assets.iter().filter(|asset| !asset.full_paths.is_empty());
    let key_name = inventory::file_name_of(backup_key);
    if key_name.is_empty() {
        return None;
    }

    if let Some(asset) = loaded().find(|asset| asset.file_name.eq_ignore_ascii_case(key_name)) {
        return Some((PathBuf::from(&asset.full_paths[0]), LocationMatch::FileName));
    }

    let normalized = normalize_texture_name(key_name);
    if let Some(asset) = loaded().find(|asset| normalize_texture_name(&asset.file_name) == normalized)
    {
        return Some((PathBuf::from(&asset.full_paths[0]), LocationMatch::Normalized));
    }

    let suffix = inventory::normalize_path(backup_key).to_lowercase();
    if !suffix.contains('/') {
        return None;
    }
    let needle = format!("/{}", suffix.trim_start_matches('/'));
    for asset in loaded() {
        for path in &asset.full_paths {
            let candidate = inventory::normalize_path(path).to_lowercase();
            if candidate.ends_with(&needle) || candidate == needle[1..] {
                return Some((PathBuf::from(path), LocationMatch::PathSuffix));
            }
        }
    }
    None
}
