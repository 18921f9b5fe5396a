//! Location of the installer's own persistent data (settings, logs, temp).

use std::path::PathBuf;

/// Directory name used under the platform data directory
const APP_IDENTIFIER: &str = "acinstaller";

/// File name prefix for the rolling log files
pub const LOG_FILE_NAME: &str = "acinstaller.log";

/// Platform data directory for the installer
///
/// - Windows: %LOCALAPPDATA%\acinstaller
/// - macOS: ~/Library/Application Support/acinstaller
/// - Linux: $XDG_DATA_HOME/acinstaller or ~/.local/share/acinstaller
pub fn get_app_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .or_else(dirs::data_dir)
        .map(|dir| dir.join(APP_IDENTIFIER))
        .unwrap_or_else(|| PathBuf::from(".").join(APP_IDENTIFIER))
}

pub fn get_logs_dir() -> PathBuf {
    get_app_data_dir().join("logs")
}

pub fn get_settings_path() -> PathBuf {
    get_app_data_dir().join("settings.json")
}

/// Scratch space for split-volume concatenation and external decoder output
pub fn get_temp_dir() -> PathBuf {
    std::env::temp_dir().join(APP_IDENTIFIER)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_app_data_dir_ends_with_identifier() {
        let dir = get_app_data_dir();
        assert!(
            dir.ends_with(APP_IDENTIFIER),
            "App data dir should end with identifier, got {:?}",
            dir
        );
    }

    #[test]
    fn test_derived_paths_are_inside_app_dir() {
        let base = get_app_data_dir();
        assert!(get_logs_dir().starts_with(&base));
        assert_eq!(get_settings_path().file_name().unwrap(), "settings.json");
    }
}
