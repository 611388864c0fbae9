//! Centralized path configuration for compote.
//!
//! All on-disk locations go through this module so that separate command
//! invocations agree on where project state, volumes, and images live.

use std::path::PathBuf;

/// Get the compote data directory.
///
/// Resolution order:
/// 1. `COMPOTE_DATA_DIR` environment variable
/// 2. `<user-app-support>/compote` (e.g. `~/.local/share/compote` on Linux,
///    `~/Library/Application Support/compote` on macOS)
/// 3. `~/.compote` if no app-support directory can be resolved
pub fn data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("COMPOTE_DATA_DIR") {
        return PathBuf::from(dir);
    }

    if let Some(dir) = dirs::data_dir() {
        return dir.join("compote");
    }

    dirs::home_dir().map(|h| h.join(".compote")).unwrap_or_else(|| PathBuf::from("/var/lib/compote"))
}

/// Get the per-project state directory.
pub fn state_dir() -> PathBuf {
    data_dir().join("state")
}

/// Get the state file path for a project.
pub fn state_file(project: &str) -> PathBuf {
    state_dir().join(format!("{}.json", project))
}

/// Get the named-volumes directory.
pub fn volumes_dir() -> PathBuf {
    data_dir().join("volumes")
}

/// Get the images directory.
pub fn images_dir() -> PathBuf {
    data_dir().join("images")
}
