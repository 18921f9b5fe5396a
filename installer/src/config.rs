//! Installer settings persisted as JSON.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::logger;

/// Environment variable pointing at a 7-Zip executable
pub const SEVENZIP_ENV: &str = "ACINSTALLER_7Z";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogSettings {
    /// `tracing_subscriber::EnvFilter` directive
    pub level: String,
    pub to_file: bool,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            to_file: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InstallerSettings {
    /// Game root containing `content/` and `system/`
    pub content_root: PathBuf,
    /// Defaults to `<content_root>/mods`
    pub generic_mods_dir: Option<PathBuf>,
    pub sevenzip_executable: Option<PathBuf>,
    pub prefer_external_decoder: bool,
    /// Send removed files to the system trash instead of deleting them
    pub recycle_removed_files: bool,
    pub finished_job_retention_secs: u64,
    pub max_scan_depth: usize,
    pub logging: LogSettings,
}

impl Default for InstallerSettings {
    fn default() -> Self {
        Self {
            content_root: PathBuf::from("."),
            generic_mods_dir: None,
            sevenzip_executable: None,
            prefer_external_decoder: true,
            recycle_removed_files: true,
            finished_job_retention_secs: 5,
            max_scan_depth: 15,
            logging: LogSettings::default(),
        }
    }
}

impl InstallerSettings {
    pub fn with_content_root(content_root: impl Into<PathBuf>) -> Self {
        Self {
            content_root: content_root.into(),
            ..Self::default()
        }
    }

    /// Read settings from `path`, falling back to defaults when the file is absent
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if !path.exists() {
            logger::log_info(
                &format!("No settings at {:?}, using defaults", path),
                Some("config"),
            );
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read settings from {:?}", path))?;
        let settings = serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse settings in {:?}", path))?;
        Ok(settings)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {:?}", parent))?;
        }
        let text = serde_json::to_string_pretty(self)?;
        std::fs::write(path, text).with_context(|| format!("Failed to write {:?}", path))?;
        Ok(())
    }

    pub fn generic_mods_root(&self) -> PathBuf {
        self.generic_mods_dir
            .clone()
            .unwrap_or_else(|| self.content_root.join("mods"))
    }

    /// 7-Zip executable to use, if external decoding is enabled and one exists
    pub fn external_decoder(&self) -> Option<PathBuf> {
        if !self.prefer_external_decoder {
            return None;
        }
        std::env::var_os(SEVENZIP_ENV)
            .map(PathBuf::from)
            .or_else(|| self.sevenzip_executable.clone())
            .filter(|path| path.is_file())
    }

    pub fn finished_job_retention(&self) -> Duration {
        Duration::from_secs(self.finished_job_retention_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = InstallerSettings::default();
        assert!(settings.prefer_external_decoder);
        assert!(settings.recycle_removed_files);
        assert_eq!(settings.finished_job_retention(), Duration::from_secs(5));
        assert_eq!(settings.max_scan_depth, 15);
    }

    #[test]
    fn test_generic_mods_root_defaults_under_content_root() {
        let settings = InstallerSettings::with_content_root("/games/ac");
        assert_eq!(settings.generic_mods_root(), PathBuf::from("/games/ac/mods"));
    }

    #[test]
    fn test_save_and_load() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("nested").join("settings.json");

        let mut settings = InstallerSettings::with_content_root(temp.path());
        settings.recycle_removed_files = false;
        settings.logging.level = "debug".to_string();
        settings.save(&path).unwrap();

        let loaded = InstallerSettings::load_or_default(&path).unwrap();
        assert_eq!(loaded, settings);
    }

    #[test]
    fn test_partial_file_uses_defaults_for_missing_fields() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("settings.json");
        std::fs::write(&path, r#"{ "max_scan_depth": 4 }"#).unwrap();

        let loaded = InstallerSettings::load_or_default(&path).unwrap();
        assert_eq!(loaded.max_scan_depth, 4);
        assert!(loaded.prefer_external_decoder);
    }

    #[test]
    fn test_missing_file_is_default() {
        let loaded = InstallerSettings::load_or_default(Path::new("/definitely/not/here.json"))
            .unwrap();
        assert_eq!(loaded, InstallerSettings::default());
    }

    #[test]
    fn test_external_decoder_disabled() {
        let mut settings = InstallerSettings::default();
        settings.prefer_external_decoder = false;
        settings.sevenzip_executable = Some(PathBuf::from("/bin/sh"));
        assert!(settings.external_decoder().is_none());
    }
}
