use std::collections::HashMap;
use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use ::zip::result::ZipError;
use ::zip::ZipArchive;

use crate::error::{InstallError, InstallResult};
use crate::logger;
use crate::task_control::TaskControl;

use super::input::{prepare_archive_for_read, ArchiveFormat, PreparedArchive};
use super::{
    find_entry, normalize_key, total_size, write_stream_to, ArchiveBackend, BackendKind, CopyCallback,
    CopyProgress, CopyStats, FileEntry, PasswordState, ProgressSink, ReadOutcome,
};

/// Where each listed entry lives in the central directory
#[derive(Debug, Clone, Copy)]
struct Member {
    index: usize,
    encrypted: bool,
}

/// Random-access zip reader, including ZipCrypto and AES encrypted members
pub struct ZipBackend {
    source: PathBuf,
    _prepared: PreparedArchive,
    archive: ZipArchive<fs::File>,
    entries: Arc<Vec<FileEntry>>,
    members: HashMap<String, Member>,
    password: Option<String>,
    state: PasswordState,
}

impl ZipBackend {
    pub fn open(path: &Path) -> InstallResult<Self> {
        let prepared = prepare_archive_for_read(path, ArchiveFormat::Zip)?;
        let file = fs::File::open(prepared.read_path())
            .map_err(|e| InstallError::fs(prepared.read_path(), e))?;
        let mut archive = ZipArchive::new(file)
            .map_err(|e| InstallError::UnsupportedContainer(format!("{}: {}", path.display(), e)))?;

        let mut entries = Vec::new();
        let mut members = HashMap::new();
        let mut any_encrypted = false;
        for index in 0..archive.len() {
            let file = archive
                .by_index_raw(index)
                .map_err(|e| InstallError::UnsupportedContainer(e.to_string()))?;
            if file.is_dir() {
                continue;
            }
            let Some(key) = normalize_key(file.name()) else {
                continue;
            };
            if members.contains_key(&key) {
                logger::log_warning(
                    &format!("Duplicate zip member {:?} in {:?}, keeping the first", key, path),
                    Some("archive"),
                );
                continue;
            }
            let encrypted = file.encrypted();
            any_encrypted |= encrypted;
            members.insert(key.clone(), Member { index, encrypted });
            entries.push(FileEntry::new(key, file.size()));
        }

        logger::log_info(
            &format!(
                "Zip {:?}: {} entries{}",
                path,
                entries.len(),
                if any_encrypted { ", encrypted" } else { "" }
            ),
            Some("archive"),
        );

        Ok(Self {
            source: path.to_path_buf(),
            _prepared: prepared,
            archive,
            entries: Arc::new(entries),
            members,
            password: None,
            state: if any_encrypted {
                PasswordState::Required
            } else {
                PasswordState::NotRequired
            },
        })
    }

    /// Exact key first, then the first case-insensitive match
    fn member(&self, key: &str) -> InstallResult<Member> {
        find_entry(&self.entries, key)
            .and_then(|entry| self.members.get(&entry.key))
            .copied()
            .ok_or_else(|| InstallError::MissingContent(key.to_string()))
    }

    /// Smallest encrypted member, used to validate a password cheaply
    fn probe_member(&self) -> Option<Member> {
        self.entries
            .iter()
            .filter_map(|entry| {
                let member = self.members.get(&entry.key)?;
                member.encrypted.then_some((entry.size, *member))
            })
            .min_by_key(|(size, _)| *size)
            .map(|(_, member)| member)
    }

    /// Run `f` over the decoded stream of one member
    fn with_member<T>(
        &mut self,
        member: Member,
        f: impl FnOnce(&mut dyn Read) -> InstallResult<T>,
    ) -> InstallResult<T> {
        let password = self.password.clone();
        let mut file = if member.encrypted {
            let password = password.ok_or(InstallError::PasswordRequired)?;
            self.archive
                .by_index_decrypt(member.index, password.as_bytes())
                .map_err(map_zip_error)?
        } else {
            self.archive.by_index(member.index).map_err(map_zip_error)?
        };
        f(&mut file)
    }
}

fn map_zip_error(err: ZipError) -> InstallError {
    match err {
        ZipError::InvalidPassword => InstallError::PasswordIncorrect,
        ZipError::Io(e) => InstallError::from(e),
        other => InstallError::UnsupportedContainer(other.to_string()),
    }
}

impl ArchiveBackend for ZipBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::MultiFormat(ArchiveFormat::Zip)
    }

    fn source(&self) -> &Path {
        &self.source
    }

    fn password_state(&self) -> PasswordState {
        self.state
    }

    fn try_set_password(&mut self, password: &str, control: &TaskControl) -> InstallResult<bool> {
        control.ensure_not_cancelled("password check")?;
        let Some(probe) = self.probe_member() else {
            self.state = PasswordState::Accepted;
            self.password = Some(password.to_string());
            return Ok(true);
        };

        let accepted = match self
            .archive
            .by_index_decrypt(probe.index, password.as_bytes())
        {
            // ZipCrypto may pass the header check with a wrong key; the CRC at EOF catches it
            Ok(mut file) => io::copy(&mut file, &mut io::sink()).is_ok(),
            Err(ZipError::InvalidPassword) => false,
            Err(e) => return Err(map_zip_error(e)),
        };

        if accepted {
            self.password = Some(password.to_string());
            self.state = PasswordState::Accepted;
        } else {
            logger::log_info(
                &format!("Wrong password for {:?}", self.source),
                Some("archive"),
            );
        }
        Ok(accepted)
    }

    fn list_entries(&mut self) -> InstallResult<Arc<Vec<FileEntry>>> {
        Ok(Arc::clone(&self.entries))
    }

    fn read_entry(&mut self, key: &str) -> InstallResult<ReadOutcome> {
        let member = self.member(key)?;
        let data = self.with_member(member, |reader| {
            let mut data = Vec::new();
            reader.read_to_end(&mut data)?;
            Ok(data)
        })?;
        Ok(ReadOutcome::Ready(data))
    }

    fn load_pending(&mut self, _control: &TaskControl) -> InstallResult<()> {
        Ok(())
    }

    fn copy_entries(
        &mut self,
        callback: &mut CopyCallback<'_>,
        progress: &mut ProgressSink<'_>,
        control: &TaskControl,
    ) -> InstallResult<CopyStats> {
        let entries = Arc::clone(&self.entries);
        let mut state = CopyProgress {
            total_files: entries.len(),
            total_bytes: total_size(&entries),
            ..Default::default()
        };
        let mut stats = CopyStats::default();

        for entry in entries.iter() {
            control.ensure_not_cancelled("extracting zip")?;
            if let Some(destination) = callback(entry)? {
                let member = self.member(&entry.key)?;
                stats.bytes += self.with_member(member, |reader| write_stream_to(reader, &destination))?;
                stats.files += 1;
            }
            state.current = entry.key.clone();
            state.processed_files += 1;
            state.processed_bytes += entry.size;
            progress(&state);
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ::zip::write::SimpleFileOptions;
    use ::zip::{AesMode, ZipWriter};
    use std::io::Write;

    fn build_zip(path: &Path, files: &[(&str, &[u8])], password: Option<&str>) {
        let mut writer = ZipWriter::new(fs::File::create(path).unwrap());
        for (name, data) in files {
            let options = match password {
                Some(pwd) => SimpleFileOptions::default().with_aes_encryption(AesMode::Aes256, pwd),
                None => SimpleFileOptions::default(),
            };
            writer.start_file(*name, options).unwrap();
            writer.write_all(data).unwrap();
        }
        writer.finish().unwrap();
    }

    #[test]
    fn test_lists_files_and_skips_metadata() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("car.zip");
        build_zip(
            &path,
            &[
                ("mycar/ui/ui_car.json", b"{}"),
                ("__MACOSX/mycar/._ui_car.json", b"x"),
                ("mycar/data.acd", b"acd"),
            ],
            None,
        );
        let mut backend = ZipBackend::open(&path).unwrap();
        assert_eq!(backend.password_state(), PasswordState::NotRequired);
        let keys: Vec<String> = backend.list_entries().unwrap().iter().map(|e| e.key.clone()).collect();
        assert_eq!(keys, vec!["mycar/ui/ui_car.json", "mycar/data.acd"]);
    }

    #[test]
    fn test_reads_are_immediate() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("car.zip");
        build_zip(&path, &[("mycar/ui/ui_car.json", b"{\"name\":\"x\"}")], None);
        let mut backend = ZipBackend::open(&path).unwrap();
        assert_eq!(
            backend.read_entry("MyCar/UI/ui_car.json").unwrap(),
            ReadOutcome::Ready(b"{\"name\":\"x\"}".to_vec())
        );
    }

    #[test]
    fn test_encrypted_archive_needs_password() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("secret.zip");
        build_zip(&path, &[("mycar/data.acd", b"secret bytes")], Some("right"));

        let mut backend = ZipBackend::open(&path).unwrap();
        assert_eq!(backend.password_state(), PasswordState::Required);
        assert!(matches!(
            backend.read_entry("mycar/data.acd"),
            Err(InstallError::PasswordRequired)
        ));

        assert!(!backend.try_set_password("wrong", &TaskControl::new()).unwrap());
        assert_eq!(backend.password_state(), PasswordState::Required);

        assert!(backend.try_set_password("right", &TaskControl::new()).unwrap());
        assert_eq!(backend.password_state(), PasswordState::Accepted);
        assert_eq!(
            backend.read_entry("mycar/data.acd").unwrap(),
            ReadOutcome::Ready(b"secret bytes".to_vec())
        );
    }

    #[test]
    fn test_members_differing_in_case_keep_their_own_bytes() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("cased.zip");
        build_zip(&path, &[("a/File.txt", b"upper"), ("a/file.txt", b"lower")], None);

        let mut backend = ZipBackend::open(&path).unwrap();
        assert_eq!(backend.list_entries().unwrap().len(), 2);
        assert_eq!(
            backend.read_entry("a/File.txt").unwrap(),
            ReadOutcome::Ready(b"upper".to_vec())
        );
        assert_eq!(
            backend.read_entry("a/file.txt").unwrap(),
            ReadOutcome::Ready(b"lower".to_vec())
        );
        // No exact match falls back to the first listed member
        assert_eq!(
            backend.read_entry("A/FILE.TXT").unwrap(),
            ReadOutcome::Ready(b"upper".to_vec())
        );
    }

    #[test]
    fn test_garbage_is_unsupported() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("broken.zip");
        fs::write(&path, b"definitely not a zip").unwrap();
        assert!(matches!(
            ZipBackend::open(&path),
            Err(InstallError::UnsupportedContainer(_))
        ));
    }
}
