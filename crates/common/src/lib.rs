//! CyberLab Common Library
//!
//! Shared types, errors and the lab registry for the CyberLab platform.

pub mod db;
pub mod error;
pub mod registry;
pub mod types;

// Re-export commonly used types
pub use db::Database;
pub use error::{Error, Result};
pub use registry::LabRegistry;
pub use types::*;

/// CyberLab version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default store path
pub fn default_store_path() -> std::path::PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| std::path::PathBuf::from("."))
        .join(".cyberlab")
}

/// Expand a leading `~` to the home directory
pub fn expand_home(path: &std::path::Path) -> std::path::PathBuf {
    match (path.strip_prefix("~"), dirs::home_dir()) {
        (Ok(rest), Some(home)) => home.join(rest),
        _ => path.to_path_buf(),
    }
}

/// Home directory helper
mod dirs {
    pub fn home_dir() -> Option<std::path::PathBuf> {
        std::env::var_os("HOME").map(std::path::PathBuf::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn test_expand_home() {
        assert_eq!(expand_home(Path::new("/etc/cyberlab.toml")), Path::new("/etc/cyberlab.toml"));
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expand_home(Path::new("~/.cyberlab/config.toml")), home.join(".cyberlab/config.toml"));
        }
    }
}
