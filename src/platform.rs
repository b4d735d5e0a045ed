//! Platform-specific paths for the secret store and intrusion log

use std::path::PathBuf;

/// Get the platform-specific data directory for storing application data
///
/// Returns:
/// - Windows: %APPDATA%\SyncGuard
/// - macOS: ~/Library/Application Support/SyncGuard
/// - Linux/Other: ~/.local/share/SyncGuard
pub fn get_data_dir() -> PathBuf {
    let base = dirs::data_local_dir()
        .or_else(dirs::data_dir)
        .or_else(|| dirs::home_dir().map(|h| h.join(".data")))
        .unwrap_or_else(|| PathBuf::from("."));

    base.join("SyncGuard")
}

/// Get the default secret store file path
pub fn default_store_path() -> PathBuf {
    get_data_dir().join("secrets.json")
}

/// Get the directory holding the intrusion event log
pub fn get_intrusion_log_dir() -> PathBuf {
    get_data_dir().join("audit")
}

/// Get the default intrusion event log file path
pub fn default_intrusion_log_path() -> PathBuf {
    get_intrusion_log_dir().join("intrusions.jsonl")
}

/// Ensure the data directory exists, creating it if necessary
pub fn ensure_data_dir() -> std::io::Result<PathBuf> {
    let dir = get_data_dir();
    std::fs::create_dir_all(&dir)?;
    Ok(dir)
}
