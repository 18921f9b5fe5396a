use std::collections::BTreeSet;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use sevenz_rust2::{Archive, ArchiveReader, Password};

use crate::error::{InstallError, InstallResult};
use crate::logger;
use crate::task_control::TaskControl;

use super::input::{prepare_archive_for_read, ArchiveFormat, PreparedArchive};
use super::solid::SolidCache;
use super::{
    find_entry, normalize_key, total_size, write_stream_to, ArchiveBackend, BackendKind,
    CopyCallback, CopyProgress, CopyStats, FileEntry, PasswordState, ProgressSink, ReadOutcome,
};

fn looks_like_password_error(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("password") || lower.contains("encrypt")
}

/// 7z reader. Every read goes through the solid cache.
pub struct SevenZBackend {
    source: PathBuf,
    prepared: PreparedArchive,
    entries: Option<Arc<Vec<FileEntry>>>,
    password: Option<String>,
    state: PasswordState,
    cache: SolidCache,
}

impl SevenZBackend {
    pub fn open(path: &Path) -> InstallResult<Self> {
        let prepared = prepare_archive_for_read(path, ArchiveFormat::SevenZ)?;
        let mut backend = Self {
            source: path.to_path_buf(),
            prepared,
            entries: None,
            password: None,
            state: PasswordState::NotRequired,
            cache: SolidCache::new(),
        };

        match Archive::open(backend.prepared.read_path()) {
            Ok(archive) => {
                let entries: Vec<FileEntry> = archive
                    .files
                    .iter()
                    .filter(|file| !file.is_directory())
                    .filter_map(|file| normalize_key(file.name()).map(|key| FileEntry::new(key, file.size())))
                    .collect();
                if backend.data_needs_password() {
                    backend.state = PasswordState::Required;
                }
                backend.entries = Some(Arc::new(entries));
            }
            // Encrypted headers: nothing can be listed before a password is known
            Err(e) if looks_like_password_error(&e.to_string()) => {
                backend.state = PasswordState::Required;
            }
            Err(e) => {
                return Err(InstallError::UnsupportedContainer(format!(
                    "{}: {}",
                    path.display(),
                    e
                )))
            }
        }

        logger::log_info(
            &format!(
                "7z {:?}: {} entries, password {:?}",
                path,
                backend.entries.as_ref().map(|e| e.len()).unwrap_or(0),
                backend.state
            ),
            Some("archive"),
        );
        Ok(backend)
    }

    fn reader_password(&self) -> Password {
        match self.password {
            Some(ref pwd) => Password::from(pwd.as_str()),
            None => Password::empty(),
        }
    }

    fn open_reader(&self, password: Password) -> InstallResult<ArchiveReader<std::fs::File>> {
        ArchiveReader::open(self.prepared.read_path(), password).map_err(|e| {
            if looks_like_password_error(&e.to_string()) {
                InstallError::PasswordIncorrect
            } else {
                InstallError::UnsupportedContainer(e.to_string())
            }
        })
    }

    /// Decoding the first non-empty entry without a password fails for encrypted data
    fn data_needs_password(&self) -> bool {
        let Ok(mut reader) = ArchiveReader::open(self.prepared.read_path(), Password::empty()) else {
            return true;
        };
        let mut failed = false;
        let result = reader.for_each_entries(|entry, data| {
            if entry.is_directory() || entry.size() == 0 {
                return Ok(true);
            }
            let mut buf = [0u8; 1];
            failed = Read::read(data, &mut buf).is_err();
            Ok(false)
        });
        // The decoder may refuse encrypted folders before handing out any stream
        failed || matches!(result, Err(ref e) if looks_like_password_error(&e.to_string()))
    }

    /// Checks `password` by fully decoding the first non-empty entry
    fn password_decodes(&self, password: &str) -> InstallResult<bool> {
        let mut reader = match ArchiveReader::open(self.prepared.read_path(), Password::from(password)) {
            Ok(reader) => reader,
            Err(e) if looks_like_password_error(&e.to_string()) => return Ok(false),
            Err(e) => return Err(InstallError::UnsupportedContainer(e.to_string())),
        };
        let mut decoded = true;
        let result = reader.for_each_entries(|entry, data| {
            if entry.is_directory() || entry.size() == 0 {
                return Ok(true);
            }
            decoded = io::copy(data, &mut io::sink()).is_ok();
            Ok(false)
        });
        Ok(decoded && result.is_ok())
    }

    fn list_with_reader(&self) -> InstallResult<Vec<FileEntry>> {
        let mut reader = self.open_reader(self.reader_password())?;
        let mut entries = Vec::new();
        reader
            .for_each_entries(|entry, _| {
                if !entry.is_directory() {
                    if let Some(key) = normalize_key(entry.name()) {
                        entries.push(FileEntry::new(key, entry.size()));
                    }
                }
                Ok(true)
            })
            .map_err(|e| InstallError::UnsupportedContainer(e.to_string()))?;
        Ok(entries)
    }

    /// One linear decode over the archive, handing each accepted entry's stream to `visit`.
    ///
    /// `visit` returns `Ok(false)` to stop early. The first error it raises ends the pass.
    fn linear_pass<F>(&self, control: &TaskControl, mut visit: F) -> InstallResult<()>
    where
        F: FnMut(FileEntry, &mut dyn Read) -> InstallResult<bool>,
    {
        let mut reader = self.open_reader(self.reader_password())?;
        let mut failure: Option<InstallError> = None;
        let result = reader.for_each_entries(|entry, data| {
            if control.is_cancelled() {
                failure = Some(InstallError::Cancelled);
                return Ok(false);
            }
            if entry.is_directory() {
                return Ok(true);
            }
            let Some(key) = normalize_key(entry.name()) else {
                return Ok(true);
            };
            match visit(FileEntry::new(key, entry.size()), data) {
                Ok(more) => Ok(more),
                Err(e) => {
                    failure = Some(e);
                    Ok(false)
                }
            }
        });
        if let Some(e) = failure {
            return Err(e);
        }
        result.map_err(|e| {
            if self.password.is_some() && looks_like_password_error(&e.to_string()) {
                InstallError::PasswordIncorrect
            } else {
                InstallError::UnsupportedContainer(e.to_string())
            }
        })
    }
}

impl ArchiveBackend for SevenZBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::MultiFormat(ArchiveFormat::SevenZ)
    }

    fn source(&self) -> &Path {
        &self.source
    }

    fn password_state(&self) -> PasswordState {
        self.state
    }

    fn try_set_password(&mut self, password: &str, control: &TaskControl) -> InstallResult<bool> {
        control.ensure_not_cancelled("password check")?;
        if !self.password_decodes(password)? {
            logger::log_info(&format!("Wrong password for {:?}", self.source), Some("archive"));
            return Ok(false);
        }
        self.password = Some(password.to_string());
        self.state = PasswordState::Accepted;
        if self.entries.is_none() {
            self.entries = Some(Arc::new(self.list_with_reader()?));
        }
        Ok(true)
    }

    fn list_entries(&mut self) -> InstallResult<Arc<Vec<FileEntry>>> {
        match self.entries {
            Some(ref entries) => Ok(Arc::clone(entries)),
            None => Err(InstallError::PasswordRequired),
        }
    }

    fn read_entry(&mut self, key: &str) -> InstallResult<ReadOutcome> {
        if self.state == PasswordState::Required {
            return Err(InstallError::PasswordRequired);
        }
        let entries = self.list_entries()?;
        let entry = find_entry(&entries, key).ok_or_else(|| InstallError::MissingContent(key.to_string()))?;
        self.cache.read(&entry.key)
    }

    fn load_pending(&mut self, control: &TaskControl) -> InstallResult<()> {
        let mut cache = std::mem::take(&mut self.cache);
        let result = cache.load_with(|wanted: &BTreeSet<String>| {
            let mut decoded = Vec::new();
            self.linear_pass(control, |entry, data| {
                let lower = entry.key_lower();
                if wanted.contains(&lower) {
                    let mut bytes = Vec::with_capacity(entry.size as usize);
                    data.read_to_end(&mut bytes)?;
                    decoded.push((lower, bytes));
                }
                Ok(decoded.len() < wanted.len())
            })?;
            logger::log_info(
                &format!("Decoded {} deferred entries from {:?}", decoded.len(), self.source),
                Some("archive"),
            );
            Ok(decoded)
        });
        self.cache = cache;
        result
    }

    fn copy_entries(
        &mut self,
        callback: &mut CopyCallback<'_>,
        progress: &mut ProgressSink<'_>,
        control: &TaskControl,
    ) -> InstallResult<CopyStats> {
        let entries = self.list_entries()?;
        let mut state = CopyProgress {
            total_files: entries.len(),
            total_bytes: total_size(&entries),
            ..Default::default()
        };
        let mut stats = CopyStats::default();

        self.linear_pass(control, |entry, data| {
            if let Some(destination) = callback(&entry)? {
                stats.bytes += write_stream_to(data, &destination)?;
                stats.files += 1;
            }
            state.processed_files += 1;
            state.processed_bytes += entry.size;
            state.current = entry.key;
            progress(&state);
            Ok(true)
        })?;
        Ok(stats)
    }
}
