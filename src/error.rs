use thiserror::Error;

#[derive(Debug, Error)]
pub enum RestoreError {
    #[error("restore {id} is already running")]
    AlreadyRunning { id: u64 },

    #[error("mod root directory is not resolved")]
    ModRootUnresolved,

    #[error("read current assets: {0}")]
    Inventory(String),

    #[error("enumerate restore candidates: {0}")]
    Candidates(String),
}
