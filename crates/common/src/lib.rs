//! wgmint Common Library
//!
//! Shared types, persistence, and address allocation for the wgmint daemon.

pub mod addr;
pub mod db;
pub mod error;
pub mod rng;
pub mod types;

// Re-export commonly used types
pub use db::Store;
pub use error::{Error, Result, ValidationError};
pub use rng::{OsRandom, RandomSource, SeededRandom};
pub use types::*;

/// wgmint version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default store path
pub fn default_store_path() -> std::path::PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| std::path::PathBuf::from("."))
        .join(".wgmint")
}

/// Default database path
pub fn default_db_path() -> std::path::PathBuf {
    default_store_path().join("state.db")
}

/// Home directory helper
mod dirs {
    pub fn home_dir() -> Option<std::path::PathBuf> {
        std::env::var_os("HOME").map(std::path::PathBuf::from)
    }
}
