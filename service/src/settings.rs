//! Settings the service reads from its working directory.
//!
//! The file is optional. A file that isn't valid JSON is replaced with the defaults,
//! a file with values we can't use is refused.

use std::path::{Path, PathBuf};
use std::{fs, io};

use anyhow::{Context as _, Result};
use atomicwrites::{AtomicFile, OverwriteBehavior};
use serde::{Deserialize, Serialize};

/// Replaced by the tunnel's ID in [`Settings::tunnel_args`].
pub const TUNNEL_ID_PLACEHOLDER: &str = "{id}";

const TUNNEL_CLIENT_STEM: &str = "tunnel-client";

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct Settings {
    /// Defaults to `tunnel-client` next to the service binary.
    pub tunnel_client: Option<PathBuf>,
    pub tunnel_args: Vec<String>,
    /// How many log lines the daemon keeps in memory for `LogGet`.
    pub log_capacity: usize,
    pub log_filter: String,
    pub max_log_dir_bytes: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            tunnel_client: None,
            tunnel_args: vec!["--tunnel".to_owned(), TUNNEL_ID_PLACEHOLDER.to_owned()],
            log_capacity: 4096,
            log_filter: if cfg!(debug_assertions) {
                "debug".to_owned()
            } else {
                "info".to_owned()
            },
            max_log_dir_bytes: 32 * 1024 * 1024,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("`log_capacity` must be at least 1")]
    ZeroLogCapacity,
    #[error("`log_filter` is not a valid filter")]
    LogFilter(#[source] logging::ParseError),
    #[error("`tunnel_args` must contain `{TUNNEL_ID_PLACEHOLDER}`")]
    NoTunnelIdPlaceholder,
}

impl Settings {
    /// Loads the settings at `path`, falling back to the defaults.
    ///
    /// Unparseable files are overwritten with the defaults so the next start is clean.
    pub fn load_or_repair(path: &Path) -> Result<Self> {
        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read `{}`", path.display()));
            }
        };

        match serde_json::from_str(&text) {
            Ok(settings) => Ok(settings),
            Err(error) => {
                tracing::warn!(
                    path = %path.display(),
                    "Settings file is corrupt, replacing it with the defaults: {error}"
                );

                let settings = Self::default();
                settings.save(path)?;

                Ok(settings)
            }
        }
    }

    /// Loads and validates, the way the bootstrap does before every command.
    pub fn load_validated(path: &Path) -> Result<Self> {
        let settings = Self::load_or_repair(path)?;
        settings
            .validate()
            .with_context(|| format!("Invalid settings in `{}`", path.display()))?;

        Ok(settings)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create `{}`", dir.display()))?;
        }
        let json = serde_json::to_string_pretty(self)?;

        AtomicFile::new(path, OverwriteBehavior::AllowOverwrite)
            .write(|f| io::Write::write_all(f, json.as_bytes()))
            .with_context(|| format!("Failed to write `{}`", path.display()))?;

        Ok(())
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.log_capacity == 0 {
            return Err(SettingsError::ZeroLogCapacity);
        }
        logging::validate_directives(&self.log_filter).map_err(SettingsError::LogFilter)?;
        if !self
            .tunnel_args
            .iter()
            .any(|arg| arg.contains(TUNNEL_ID_PLACEHOLDER))
        {
            return Err(SettingsError::NoTunnelIdPlaceholder);
        }

        Ok(())
    }

    pub fn tunnel_client_path(&self, install_dir: &Path) -> PathBuf {
        match &self.tunnel_client {
            Some(path) if path.is_absolute() => path.clone(),
            Some(path) => install_dir.join(path),
            None => install_dir.join(format!(
                "{TUNNEL_CLIENT_STEM}{}",
                std::env::consts::EXE_SUFFIX
            )),
        }
    }

    /// Arguments for the tunnel client with `id` substituted in.
    pub fn tunnel_args_for(&self, id: u32) -> Vec<String> {
        let id = id.to_string();

        self.tunnel_args
            .iter()
            .map(|arg| arg.replace(TUNNEL_ID_PLACEHOLDER, &id))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_means_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");

        assert_eq!(Settings::load_or_repair(&path).unwrap(), Settings::default());
        assert!(!path.exists(), "Defaults shouldn't be written for a missing file");
    }

    #[test]
    fn partial_files_keep_the_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, r#"{ "log_capacity": 10 }"#).unwrap();

        let settings = Settings::load_validated(&path).unwrap();

        assert_eq!(settings.log_capacity, 10);
        assert_eq!(settings.tunnel_args, Settings::default().tunnel_args);
    }

    #[test]
    fn corrupt_file_is_replaced() {
        let _guard = logging::test("debug");
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data").join("settings.json");
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, "{ not json").unwrap();

        let settings = Settings::load_or_repair(&path).unwrap();

        assert_eq!(settings, Settings::default());
        let repaired: Settings = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(repaired, Settings::default());
    }

    #[test]
    fn invalid_values_are_refused() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");

        fs::write(&path, r#"{ "log_capacity": 0 }"#).unwrap();
        assert!(Settings::load_validated(&path).is_err());

        fs::write(&path, r#"{ "log_filter": "info,tunnelkeeper=notalevel" }"#).unwrap();
        assert!(Settings::load_validated(&path).is_err());

        fs::write(&path, r#"{ "tunnel_args": ["--all"] }"#).unwrap();
        assert!(matches!(
            Settings::load_or_repair(&path).unwrap().validate(),
            Err(SettingsError::NoTunnelIdPlaceholder)
        ));
    }

    #[test]
    fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("settings.json");
        let settings = Settings {
            tunnel_client: Some(PathBuf::from("bin").join("client")),
            max_log_dir_bytes: 1024,
            ..Settings::default()
        };

        settings.save(&path).unwrap();

        assert_eq!(Settings::load_validated(&path).unwrap(), settings);
    }

    #[test]
    fn tunnel_client_resolves_against_the_install_dir() {
        let install = Path::new("install");
        let mut settings = Settings::default();

        assert_eq!(
            settings.tunnel_client_path(install),
            install.join(format!("tunnel-client{}", std::env::consts::EXE_SUFFIX))
        );

        settings.tunnel_client = Some(PathBuf::from("custom"));
        assert_eq!(settings.tunnel_client_path(install), install.join("custom"));
    }

    #[test]
    fn tunnel_id_is_substituted() {
        let settings = Settings {
            tunnel_args: vec!["-t".to_owned(), "{id}".to_owned(), "--name=t{id}".to_owned()],
            ..Settings::default()
        };

        assert_eq!(settings.tunnel_args_for(12), vec!["-t", "12", "--name=t12"]);
    }
}
