//! Uniform read access to installable sources.
//!
//! Three backends sit behind [`ArchiveBackend`]:
//! - [`DirectoryBackend`] for folders and single loose files
//! - the built-in readers (zip, 7z, rar) opened by [`open_multi_format`]
//! - [`ExternalBackend`], which drives a 7-Zip executable
//!
//! Solid readers cannot serve random reads cheaply. They answer
//! [`ReadOutcome::Deferred`] and remember the key; one call to
//! [`ArchiveBackend::load_pending`] decodes every remembered entry in a
//! single linear pass, after which the same reads return data.

pub mod input;

mod directory;
mod external;
mod rar;
mod sevenz;
mod solid;
mod zip;

use std::fs;
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::InstallerSettings;
use crate::error::{InstallError, InstallResult};
use crate::logger;
use crate::task_control::TaskControl;

pub use directory::DirectoryBackend;
pub use external::ExternalBackend;
pub use input::{detect_archive_format, ArchiveFormat};
pub use rar::RarBackend;
pub use sevenz::SevenZBackend;
pub use solid::SolidCache;
pub use self::zip::ZipBackend;

const IO_BUFFER_SIZE: usize = 1024 * 1024;

/// Names that never belong to a content package
const IGNORED_COMPONENTS: &[&str] = &["__macosx", ".ds_store", "thumbs.db", "desktop.ini"];

/// One file inside a source. Keys use `/` separators and are compared case-insensitively.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub key: String,
    pub size: u64,
}

impl FileEntry {
    pub fn new(key: impl Into<String>, size: u64) -> Self {
        Self {
            key: key.into(),
            size,
        }
    }

    pub fn name(&self) -> &str {
        self.key.rsplit('/').next().unwrap_or(&self.key)
    }

    pub fn key_lower(&self) -> String {
        self.key.to_lowercase()
    }

    pub fn matches_key(&self, key: &str) -> bool {
        self.key.eq_ignore_ascii_case(key) || self.key.to_lowercase() == key.to_lowercase()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadOutcome {
    Ready(Vec<u8>),
    /// Queued for the next [`ArchiveBackend::load_pending`] pass
    Deferred,
}

impl ReadOutcome {
    pub fn into_ready(self) -> Option<Vec<u8>> {
        match self {
            ReadOutcome::Ready(data) => Some(data),
            ReadOutcome::Deferred => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PasswordState {
    NotRequired,
    Required,
    Accepted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Directory,
    MultiFormat(ArchiveFormat),
    External,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CopyProgress {
    pub current: String,
    pub processed_files: usize,
    pub total_files: usize,
    pub processed_bytes: u64,
    pub total_bytes: u64,
}

impl CopyProgress {
    pub fn fraction(&self) -> f64 {
        if self.total_bytes > 0 {
            self.processed_bytes as f64 / self.total_bytes as f64
        } else if self.total_files > 0 {
            self.processed_files as f64 / self.total_files as f64
        } else {
            1.0
        }
    }
}

/// Decides where an entry goes; `None` skips it
pub type CopyCallback<'a> = dyn FnMut(&FileEntry) -> InstallResult<Option<PathBuf>> + 'a;

pub type ProgressSink<'a> = dyn FnMut(&CopyProgress) + 'a;

/// Read access to one opened source. Resources are released on drop.
pub trait ArchiveBackend: Send {
    fn kind(&self) -> BackendKind;

    fn source(&self) -> &Path;

    fn password_state(&self) -> PasswordState;

    /// `Ok(false)` for a wrong password; the backend stays usable for another try
    fn try_set_password(&mut self, password: &str, control: &TaskControl) -> InstallResult<bool>;

    /// All file entries, in source order. Cached after the first call.
    fn list_entries(&mut self) -> InstallResult<Arc<Vec<FileEntry>>>;

    fn read_entry(&mut self, key: &str) -> InstallResult<ReadOutcome>;

    /// Decode every deferred entry in one pass. No-op when nothing is pending.
    fn load_pending(&mut self, control: &TaskControl) -> InstallResult<()>;

    /// Offer every entry to `callback` once, in source order, and write the
    /// accepted ones to the returned paths.
    fn copy_entries(
        &mut self,
        callback: &mut CopyCallback<'_>,
        progress: &mut ProgressSink<'_>,
        control: &TaskControl,
    ) -> InstallResult<CopyStats>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CopyStats {
    pub files: usize,
    pub bytes: u64,
}

/// Result of opening a source; password-protected sources still carry the backend
pub enum OpenOutcome {
    Ready(Box<dyn ArchiveBackend>),
    PasswordRequired(Box<dyn ArchiveBackend>),
}

impl OpenOutcome {
    fn from_backend(backend: Box<dyn ArchiveBackend>) -> Self {
        match backend.password_state() {
            PasswordState::Required => OpenOutcome::PasswordRequired(backend),
            _ => OpenOutcome::Ready(backend),
        }
    }

    pub fn into_backend(self) -> Box<dyn ArchiveBackend> {
        match self {
            OpenOutcome::Ready(backend) | OpenOutcome::PasswordRequired(backend) => backend,
        }
    }
}

/// Pick a backend for `path`: directories and loose files read directly,
/// archives go to the external decoder when configured, else the built-in readers.
pub fn open_source(
    path: &Path,
    password: Option<&str>,
    settings: &InstallerSettings,
    control: &TaskControl,
) -> InstallResult<OpenOutcome> {
    if !path.exists() {
        return Err(InstallError::fs(
            path,
            std::io::Error::new(std::io::ErrorKind::NotFound, "source does not exist"),
        ));
    }

    let mut backend: Box<dyn ArchiveBackend> = if path.is_dir() {
        Box::new(DirectoryBackend::open(path)?)
    } else {
        match detect_archive_format(path) {
            None => Box::new(DirectoryBackend::single_file(path)?),
            Some(format) => open_archive(path, format, settings, control)?,
        }
    };

    if backend.password_state() == PasswordState::Required {
        if let Some(password) = password {
            if !backend.try_set_password(password, control)? {
                logger::log_info("Supplied password was rejected", Some("archive"));
            }
        }
    }

    Ok(OpenOutcome::from_backend(backend))
}

fn open_archive(
    path: &Path,
    format: ArchiveFormat,
    settings: &InstallerSettings,
    control: &TaskControl,
) -> InstallResult<Box<dyn ArchiveBackend>> {
    if let Some(executable) = settings.external_decoder() {
        match ExternalBackend::open(path, &executable, control.child()) {
            Ok(backend) => return Ok(Box::new(backend)),
            Err(InstallError::Cancelled) => return Err(InstallError::Cancelled),
            Err(e) => logger::log_info(
                &format!("7-Zip could not open {:?}, using built-in reader: {}", path, e),
                Some("archive"),
            ),
        }
    }
    open_multi_format(path, format)
}

/// Built-in reader for `format`
pub fn open_multi_format(path: &Path, format: ArchiveFormat) -> InstallResult<Box<dyn ArchiveBackend>> {
    logger::log_info(
        &format!("Opening {} archive {:?}", format.as_str(), path),
        Some("archive"),
    );
    Ok(match format {
        ArchiveFormat::Zip => Box::new(ZipBackend::open(path)?),
        ArchiveFormat::SevenZ => Box::new(SevenZBackend::open(path)?),
        ArchiveFormat::Rar => Box::new(RarBackend::open(path)?),
    })
}

/// Normalises a raw member name into an entry key.
///
/// Returns `None` for directories, empty names, traversal attempts and
/// platform metadata such as `__MACOSX`.
pub fn normalize_key(raw: &str) -> Option<String> {
    let unified = raw.replace('\\', "/");
    if unified.ends_with('/') {
        return None;
    }
    let mut parts = Vec::new();
    for part in unified.split('/') {
        match part {
            "" | "." => continue,
            ".." => return None,
            _ if part.contains(':') => return None,
            _ => parts.push(part),
        }
    }
    if parts.is_empty() {
        return None;
    }
    let ignored = parts.iter().any(|part| {
        let lower = part.to_ascii_lowercase();
        IGNORED_COMPONENTS.contains(&lower.as_str()) || lower.starts_with("._")
    });
    if ignored {
        return None;
    }
    Some(parts.join("/"))
}

/// Stream `reader` into a new file at `destination`, creating parent directories
pub(crate) fn write_stream_to<R: Read + ?Sized>(reader: &mut R, destination: &Path) -> InstallResult<u64> {
    if let Some(parent) = destination.parent() {
        fs::create_dir_all(parent).map_err(|e| InstallError::fs(parent, e))?;
    }
    let file = fs::File::create(destination).map_err(|e| InstallError::fs(destination, e))?;
    let mut writer = BufWriter::with_capacity(IO_BUFFER_SIZE, file);
    let mut buffer = vec![0u8; 64 * 1024];
    let mut total = 0u64;
    loop {
        let read = reader
            .read(&mut buffer)
            .map_err(|e| InstallError::fs(destination, e))?;
        if read == 0 {
            break;
        }
        writer
            .write_all(&buffer[..read])
            .map_err(|e| InstallError::fs(destination, e))?;
        total += read as u64;
    }
    writer.flush().map_err(|e| InstallError::fs(destination, e))?;
    Ok(total)
}

pub(crate) fn write_bytes_to(data: &[u8], destination: &Path) -> InstallResult<u64> {
    let mut cursor = data;
    write_stream_to(&mut cursor, destination)
}

/// Looks up `key` case-insensitively among `entries`
pub(crate) fn find_entry<'a>(entries: &'a [FileEntry], key: &str) -> Option<&'a FileEntry> {
    entries
        .iter()
        .find(|entry| entry.key == key)
        .or_else(|| entries.iter().find(|entry| entry.matches_key(key)))
}

pub(crate) fn total_size(entries: &[FileEntry]) -> u64 {
    entries.iter().map(|entry| entry.size).sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_key() {
        assert_eq!(normalize_key("mycar\\ui\\ui_car.json").as_deref(), Some("mycar/ui/ui_car.json"));
        assert_eq!(normalize_key("./a//b.txt").as_deref(), Some("a/b.txt"));
        assert_eq!(normalize_key("folder/"), None);
        assert_eq!(normalize_key("../evil.dll"), None);
        assert_eq!(normalize_key("C:/windows/system.ini"), None);
        assert_eq!(normalize_key("__MACOSX/car/._data.acd"), None);
        assert_eq!(normalize_key("car/.DS_Store"), None);
    }

    #[test]
    fn test_entry_name_and_matching() {
        let entry = FileEntry::new("MyCar/UI/ui_car.json", 10);
        assert_eq!(entry.name(), "ui_car.json");
        assert!(entry.matches_key("mycar/ui/UI_CAR.json"));
        assert!(!entry.matches_key("mycar/ui"));
    }

    #[test]
    fn test_find_entry_prefers_exact_case() {
        let entries = vec![FileEntry::new("A/b.txt", 1), FileEntry::new("a/b.txt", 2)];
        assert_eq!(find_entry(&entries, "a/b.txt").unwrap().size, 2);
        assert_eq!(find_entry(&entries, "A/B.TXT").unwrap().size, 1);
    }

    #[test]
    fn test_progress_fraction() {
        let progress = CopyProgress {
            processed_bytes: 25,
            total_bytes: 100,
            ..Default::default()
        };
        assert!((progress.fraction() - 0.25).abs() < f64::EPSILON);
        assert_eq!(CopyProgress::default().fraction(), 1.0);
    }

    #[test]
    fn test_open_source_missing_path() {
        let settings = InstallerSettings::default();
        let result = open_source(
            Path::new("/no/such/source.zip"),
            None,
            &settings,
            &TaskControl::new(),
        );
        assert!(matches!(result, Err(InstallError::Filesystem { .. })));
    }
}
