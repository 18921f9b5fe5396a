use std::cell::RefCell;
use std::collections::BTreeSet;
use std::fmt::Debug;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::{InstallError, InstallResult};
use crate::logger;
use crate::task_control::TaskControl;

use super::input::{first_volume, ArchiveFormat};
use super::solid::SolidCache;
use super::{
    find_entry, normalize_key, total_size, write_bytes_to, ArchiveBackend, BackendKind,
    CopyCallback, CopyProgress, CopyStats, FileEntry, PasswordState, ProgressSink, ReadOutcome,
};

fn rar_error<E: Debug>(err: E, password_set: bool) -> InstallError {
    let text = format!("{:?}", err);
    if text.to_lowercase().contains("password") {
        if password_set {
            InstallError::PasswordIncorrect
        } else {
            InstallError::PasswordRequired
        }
    } else {
        InstallError::UnsupportedContainer(format!("RAR: {}", text))
    }
}

/// What a processing pass does with the entry under the cursor
enum Visit {
    Skip,
    Read,
    Stop,
}

/// RAR reader. Multi-volume sets are followed by unrar from the first volume.
pub struct RarBackend {
    source: PathBuf,
    first_volume: PathBuf,
    entries: Option<Arc<Vec<FileEntry>>>,
    password: Option<String>,
    state: PasswordState,
    cache: SolidCache,
}

impl RarBackend {
    pub fn open(path: &Path) -> InstallResult<Self> {
        let first = first_volume(path);
        let mut backend = Self {
            source: path.to_path_buf(),
            first_volume: first,
            entries: None,
            password: None,
            state: PasswordState::NotRequired,
            cache: SolidCache::new(),
        };

        match backend.list(None) {
            Ok((entries, any_encrypted)) => {
                if any_encrypted {
                    backend.state = PasswordState::Required;
                }
                backend.entries = Some(Arc::new(entries));
            }
            Err(InstallError::PasswordRequired) => backend.state = PasswordState::Required,
            Err(e) => return Err(e),
        }

        logger::log_info(
            &format!(
                "RAR {:?}: {} entries, password {:?}",
                path,
                backend.entries.as_ref().map(|e| e.len()).unwrap_or(0),
                backend.state
            ),
            Some("archive"),
        );
        Ok(backend)
    }

    fn list(&self, password: Option<&str>) -> InstallResult<(Vec<FileEntry>, bool)> {
        let archive = match password {
            Some(pwd) => unrar::Archive::with_password(&self.first_volume, pwd),
            None => unrar::Archive::new(&self.first_volume),
        };
        let listing = archive
            .open_for_listing()
            .map_err(|e| rar_error(e, password.is_some()))?;

        let mut entries = Vec::new();
        let mut any_encrypted = false;
        for header in listing {
            let header = header.map_err(|e| rar_error(e, password.is_some()))?;
            if header.is_directory() {
                continue;
            }
            any_encrypted |= header.is_encrypted();
            if let Some(key) = normalize_key(&header.filename.to_string_lossy()) {
                entries.push(FileEntry::new(key, header.unpacked_size));
            }
        }
        Ok((entries, any_encrypted))
    }

    /// Walk the archive once in processing mode. `decide` picks what happens to each
    /// file entry; `consume` receives the bytes of entries marked [`Visit::Read`].
    fn process<D, C>(&self, control: &TaskControl, mut decide: D, mut consume: C) -> InstallResult<()>
    where
        D: FnMut(&FileEntry) -> InstallResult<Visit>,
        C: FnMut(FileEntry, Vec<u8>) -> InstallResult<()>,
    {
        let password = self.password.clone();
        let password_set = password.is_some();
        let archive = match password.as_deref() {
            Some(pwd) => unrar::Archive::with_password(&self.first_volume, pwd),
            None => unrar::Archive::new(&self.first_volume),
        };
        let mut cursor = archive
            .open_for_processing()
            .map_err(|e| rar_error(e, password_set))?;

        while let Some(header) = cursor.read_header().map_err(|e| rar_error(e, password_set))? {
            control.ensure_not_cancelled("reading rar")?;
            let info = header.entry();
            let entry = if info.is_file() {
                normalize_key(&info.filename.to_string_lossy())
                    .map(|key| FileEntry::new(key, info.unpacked_size))
            } else {
                None
            };

            let visit = match entry {
                Some(ref entry) => decide(entry)?,
                None => Visit::Skip,
            };
            cursor = match (visit, entry) {
                (Visit::Read, Some(entry)) => {
                    let (data, rest) = header.read().map_err(|e| rar_error(e, password_set))?;
                    consume(entry, data)?;
                    rest
                }
                (Visit::Stop, _) => break,
                _ => header.skip().map_err(|e| rar_error(e, password_set))?,
            };
        }
        Ok(())
    }
}

impl ArchiveBackend for RarBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::MultiFormat(ArchiveFormat::Rar)
    }

    fn source(&self) -> &Path {
        &self.source
    }

    fn password_state(&self) -> PasswordState {
        self.state
    }

    fn try_set_password(&mut self, password: &str, control: &TaskControl) -> InstallResult<bool> {
        let previous = self.password.replace(password.to_string());
        let mut checked = false;
        let outcome = self.process(
            control,
            |entry| {
                Ok(if checked {
                    Visit::Stop
                } else if entry.size == 0 {
                    Visit::Skip
                } else {
                    checked = true;
                    Visit::Read
                })
            },
            |_, _| Ok(()),
        );

        match outcome {
            Ok(()) => {
                if self.entries.is_none() {
                    self.entries = Some(Arc::new(self.list(Some(password))?.0));
                }
                self.state = PasswordState::Accepted;
                Ok(true)
            }
            Err(InstallError::PasswordIncorrect | InstallError::PasswordRequired) => {
                self.password = previous;
                Ok(false)
            }
            Err(InstallError::UnsupportedContainer(message)) => {
                // unrar reports a bad key on encrypted data as a CRC or data error
                logger::log_info(
                    &format!("RAR password check failed for {:?}: {}", self.source, message),
                    Some("archive"),
                );
                self.password = previous;
                Ok(false)
            }
            Err(e) => {
                self.password = previous;
                Err(e)
            }
        }
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
            let mut decoded: Vec<(String, Vec<u8>)> = Vec::new();
            let mut remaining = wanted.len();
            self.process(
                control,
                |entry| {
                    Ok(if remaining == 0 {
                        Visit::Stop
                    } else if wanted.contains(&entry.key_lower()) {
                        remaining -= 1;
                        Visit::Read
                    } else {
                        Visit::Skip
                    })
                },
                |entry, data| {
                    decoded.push((entry.key_lower(), data));
                    Ok(())
                },
            )?;
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
        let target: RefCell<Option<PathBuf>> = RefCell::new(None);

        self.process(
            control,
            |entry| {
                let destination = callback(entry)?;
                let accepted = destination.is_some();
                *target.borrow_mut() = destination;
                state.processed_files += 1;
                state.processed_bytes += entry.size;
                state.current = entry.key.clone();
                progress(&state);
                Ok(if accepted { Visit::Read } else { Visit::Skip })
            },
            |_, data| {
                if let Some(destination) = target.borrow_mut().take() {
                    stats.bytes += write_bytes_to(&data, &destination)?;
                    stats.files += 1;
                }
                Ok(())
            },
        )?;
        Ok(stats)
    }
}
