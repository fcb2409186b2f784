use anyhow::{anyhow, Result};
use std::fs;
use std::path::PathBuf;

pub fn get_to_cloud_dir() -> Result<PathBuf> {
    let home = dirs::home_dir().ok_or_else(|| anyhow!("Could not find home directory"))?;
    Ok(home.join(".to-cloud"))
}

pub fn get_config_path() -> Result<PathBuf> {
    let dir = get_to_cloud_dir()?;
    Ok(dir.join("config.toml"))
}

/// Persisted session of the hosted backend
pub fn get_session_path() -> Result<PathBuf> {
    let dir = get_to_cloud_dir()?;
    Ok(dir.join("session.json"))
}

pub fn get_logs_dir() -> Result<PathBuf> {
    let dir = get_to_cloud_dir()?;
    Ok(dir.join("logs"))
}

pub fn get_crash_log_path() -> Result<PathBuf> {
    let dir = get_to_cloud_dir()?;
    Ok(dir.join("crash.log"))
}

pub fn ensure_data_dir_exists() -> Result<PathBuf> {
    let dir = get_to_cloud_dir()?;

    if !dir.exists() {
        fs::create_dir_all(&dir)?;
    }

    Ok(dir)
}
