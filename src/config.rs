use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::env;
use std::fmt;
use std::fs;
use std::str::FromStr;

use crate::utils::paths::get_config_path;

pub const ENV_URL: &str = "TOCLOUD_URL";
pub const ENV_ANON_KEY: &str = "TOCLOUD_ANON_KEY";
pub const ENV_BACKEND: &str = "TOCLOUD_BACKEND";

/// Which collaborator set the binary talks to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// SQLite + directory storage under ~/.to-cloud, single local principal
    #[default]
    Local,
    /// Hosted backend-as-a-service over HTTP
    Remote,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Local => write!(f, "local"),
            BackendKind::Remote => write!(f, "remote"),
        }
    }
}

impl FromStr for BackendKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "local" => Ok(BackendKind::Local),
            "remote" => Ok(BackendKind::Remote),
            other => Err(anyhow!("Unknown backend '{other}'. Use 'local' or 'remote'")),
        }
    }
}

/// Connection settings for the hosted backend
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    #[serde(default)]
    pub url: String,

    #[serde(default)]
    pub anon_key: String,

    #[serde(default = "default_table")]
    pub table: String,

    #[serde(default = "default_bucket")]
    pub bucket: String,

    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_table() -> String {
    "todos".to_string()
}

fn default_bucket() -> String {
    "todo-images".to_string()
}

fn default_timeout_secs() -> u64 {
    15
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            anon_key: String::new(),
            table: default_table(),
            bucket: default_bucket(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImagesConfig {
    /// Uploads larger than this are rejected before any storage call
    #[serde(default = "default_max_image_bytes")]
    pub max_bytes: u64,
}

fn default_max_image_bytes() -> u64 {
    5 * 1024 * 1024
}

impl Default for ImagesConfig {
    fn default() -> Self {
        Self {
            max_bytes: default_max_image_bytes(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub backend: BackendKind,

    #[serde(default)]
    pub remote: RemoteConfig,

    #[serde(default)]
    pub images: ImagesConfig,
}

impl Config {
    pub fn load() -> Result<Self> {
        let config_path = get_config_path()?;

        let mut config = if config_path.exists() {
            let content = fs::read_to_string(&config_path)
                .with_context(|| format!("Failed to read config at {config_path:?}"))?;
            Self::from_toml(&content)?
        } else {
            Config::default()
        };

        config.apply_env_overrides()?;
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).context("Invalid config.toml")
    }

    pub fn save(&self) -> Result<()> {
        let config_path = get_config_path()?;

        // Ensure config directory exists
        if let Some(parent) = config_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        fs::write(&config_path, content)?;

        Ok(())
    }

    /// Environment variables win over the file
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(url) = env::var(ENV_URL)
            && !url.trim().is_empty()
        {
            self.remote.url = url.trim().to_string();
        }
        if let Ok(key) = env::var(ENV_ANON_KEY)
            && !key.trim().is_empty()
        {
            self.remote.anon_key = key.trim().to_string();
        }
        if let Ok(backend) = env::var(ENV_BACKEND)
            && !backend.trim().is_empty()
        {
            self.backend = backend.parse()?;
        }
        Ok(())
    }

    /// Both the project URL and the anonymous key are needed to reach the hosted backend
    pub fn has_remote_credentials(&self) -> bool {
        !self.remote.url.trim().is_empty() && !self.remote.anon_key.trim().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.backend, BackendKind::Local);
        assert_eq!(config.remote.table, "todos");
        assert_eq!(config.remote.bucket, "todo-images");
        assert_eq!(config.images.max_bytes, 5 * 1024 * 1024);
        assert!(!config.has_remote_credentials());
    }

    #[test]
    fn test_config_deserialization() {
        let toml_str = r#"
        backend = "remote"

        [remote]
        url = "https://demo.example.co"
        anon_key = "public-anon"
        "#;

        let config = Config::from_toml(toml_str).unwrap();
        assert_eq!(config.backend, BackendKind::Remote);
        assert_eq!(config.remote.url, "https://demo.example.co");
        assert_eq!(config.remote.timeout_secs, 15);
        assert!(config.has_remote_credentials());
    }

    #[test]
    fn test_config_rejects_unknown_backend() {
        let toml_str = r#"backend = "firebase""#;
        assert!(Config::from_toml(toml_str).is_err());
    }

    #[test]
    fn test_config_serialization_roundtrip() {
        let mut config = Config::default();
        config.images.max_bytes = 1024;

        let toml_str = toml::to_string(&config).unwrap();
        assert!(toml_str.contains("[images]"));

        let parsed = Config::from_toml(&toml_str).unwrap();
        assert_eq!(parsed.images.max_bytes, 1024);
    }

    #[test]
    fn test_backend_kind_from_str() {
        assert_eq!("Remote".parse::<BackendKind>().unwrap(), BackendKind::Remote);
        assert_eq!(" local ".parse::<BackendKind>().unwrap(), BackendKind::Local);
        assert!("cloud".parse::<BackendKind>().is_err());
    }

    #[test]
    #[serial]
    fn test_env_overrides() {
        // SAFETY: serialized with the other env-touching tests
        unsafe {
            env::set_var(ENV_URL, "https://env.example.co");
            env::set_var(ENV_ANON_KEY, "env-key");
            env::set_var(ENV_BACKEND, "remote");
        }

        let mut config = Config::default();
        config.apply_env_overrides().unwrap();

        unsafe {
            env::remove_var(ENV_URL);
            env::remove_var(ENV_ANON_KEY);
            env::remove_var(ENV_BACKEND);
        }

        assert_eq!(config.remote.url, "https://env.example.co");
        assert_eq!(config.remote.anon_key, "env-key");
        assert_eq!(config.backend, BackendKind::Remote);
    }

    #[test]
    #[serial]
    fn test_blank_env_is_ignored() {
        unsafe {
            env::set_var(ENV_URL, "   ");
        }

        let mut config = Config::default();
        config.remote.url = "https://file.example.co".to_string();
        config.apply_env_overrides().unwrap();

        unsafe {
            env::remove_var(ENV_URL);
        }

        assert_eq!(config.remote.url, "https://file.example.co");
    }
}
