use crate::{detection::DetectionCache, restore::RestoreActivity};
use std::{
    sync::{mpsc::Receiver, Arc},
    thread::{self, JoinHandle},
};

/// Change notifications that can make cached backup detection wrong.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DomainEvent {
    AssetsReanalyzed,
    ModDirectoryInitialized,
    ModDirectoryChanged,
    ModSettingChanged { mod_folder: String },
    ExternalTextureChanged { reason: String },
}

impl DomainEvent {
    pub fn label(&self) -> &'static str {
        match self {
            DomainEvent::AssetsReanalyzed => "assets reanalyzed",
            DomainEvent::ModDirectoryInitialized => "mod directory initialized",
            DomainEvent::ModDirectoryChanged => "mod directory changed",
            DomainEvent::ModSettingChanged { .. } => "mod setting changed",
            DomainEvent::ExternalTextureChanged { .. } => "external texture change",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidationOutcome {
    Invalidated,
    SuppressedRestoreActive,
    SuppressedRestoreEcho,
}

pub struct Invalidator {
    cache: DetectionCache,
    activity: Arc<RestoreActivity>,
    echo_prefixes: Vec<String>,
}

impl Invalidator {
    pub fn new(cache: DetectionCache, activity: Arc<RestoreActivity>, echo_prefixes: &[String]) -> Self {
        let echo_prefixes = echo_prefixes
            .iter()
            .map(|prefix| prefix.trim().to_lowercase())
            .filter(|prefix| !prefix.is_empty())
            .collect();
        Self {
            cache,
            activity,
            echo_prefixes,
        }
    }

    pub fn is_restore_echo(&self, reason: &str) -> bool {
        let reason = reason.trim_start().to_lowercase();
        self.echo_prefixes
            .iter()
            .any(|prefix| reason.starts_with(prefix.as_str()))
    }

    pub fn handle(&self, event: &DomainEvent) -> InvalidationOutcome {
        let reason = match event {
            DomainEvent::ExternalTextureChanged { reason } => {
                if self.activity.is_active() {
                    log::debug!("Ignoring texture change during restore: {reason}");
                    return InvalidationOutcome::SuppressedRestoreActive;
                }
                if self.is_restore_echo(reason) {
                    log::debug!("Ignoring texture change caused by restore: {reason}");
                    return InvalidationOutcome::SuppressedRestoreEcho;
                }
                format!("{}: {reason}", event.label())
            }
            DomainEvent::ModSettingChanged { mod_folder } => {
                format!("{} ({mod_folder})", event.label())
            }
            _ => event.label().to_string(),
        };
        self.cache.invalidate(&reason);
        InvalidationOutcome::Invalidated
    }

    /// Handles events until every sender is dropped.
    pub fn spawn(self, events: Receiver<DomainEvent>) -> JoinHandle<()> {
        thread::spawn(move || {
            for event in events {
                self.handle(&event);
            }
            log::debug!("Invalidator stopped");
        })
    }
}
