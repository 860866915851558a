use std::path::PathBuf;

/// Read-only view of the mod framework hosting the textures.
pub trait ModFramework: Send + Sync {
    /// `None` when the framework has not resolved its mod directory yet.
    fn mod_root_directory(&self) -> Option<PathBuf>;

    fn redraw_current_character(&self);
}

#[derive(Debug, Clone)]
pub struct LocalModFramework {
    mod_root: PathBuf,
}

impl LocalModFramework {
    pub fn new(mod_root: PathBuf) -> Self {
        Self { mod_root }
    }
}

impl ModFramework for LocalModFramework {
    fn mod_root_directory(&self) -> Option<PathBuf> {
        if self.mod_root.as_os_str().is_empty() {
            return None;
        }
        Some(self.mod_root.clone())
    }

    fn redraw_current_character(&self) {
        log::info!("Redraw requested for {}", self.mod_root.display());
    }
}
