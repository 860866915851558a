pub mod backup;
pub mod config;
pub mod detection;
pub mod error;
pub mod framework;
pub mod fs_backup;
pub mod inventory;
pub mod invalidator;
pub mod matcher;
pub mod restore;

#[cfg(test)]
mod test_support;
