use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use walkdir::WalkDir;

use crate::error::{InstallError, InstallResult};
use crate::logger;
use crate::task_control::TaskControl;

use super::{
    find_entry, normalize_key, total_size, ArchiveBackend, BackendKind, CopyCallback,
    CopyProgress, CopyStats, FileEntry, PasswordState, ProgressSink, ReadOutcome,
};

/// Reads a folder on disk, or a single loose file presented as a one-entry source
pub struct DirectoryBackend {
    source: PathBuf,
    root: PathBuf,
    entries: Option<Arc<Vec<FileEntry>>>,
}

impl DirectoryBackend {
    pub fn open(path: &Path) -> InstallResult<Self> {
        if !path.is_dir() {
            return Err(InstallError::UnsupportedContainer(format!(
                "{} is not a directory",
                path.display()
            )));
        }
        Ok(Self {
            source: path.to_path_buf(),
            root: path.to_path_buf(),
            entries: None,
        })
    }

    pub fn single_file(path: &Path) -> InstallResult<Self> {
        let metadata = fs::metadata(path).map_err(|e| InstallError::fs(path, e))?;
        let name = path
            .file_name()
            .and_then(|name| name.to_str())
            .and_then(normalize_key)
            .ok_or_else(|| {
                InstallError::UnsupportedContainer(format!("Unusable file name: {}", path.display()))
            })?;
        let root = path.parent().map(Path::to_path_buf).unwrap_or_default();
        Ok(Self {
            source: path.to_path_buf(),
            root,
            entries: Some(Arc::new(vec![FileEntry::new(name, metadata.len())])),
        })
    }

    fn scan(&self) -> InstallResult<Vec<FileEntry>> {
        let mut entries = Vec::new();
        for item in WalkDir::new(&self.root).follow_links(false).sort_by_file_name() {
            let item = item.map_err(|e| {
                let path = e.path().map(Path::to_path_buf).unwrap_or_else(|| self.root.clone());
                InstallError::fs(path, std::io::Error::other(e.to_string()))
            })?;
            if !item.file_type().is_file() {
                continue;
            }
            let Ok(relative) = item.path().strip_prefix(&self.root) else {
                continue;
            };
            let Some(key) = relative.to_str().and_then(normalize_key) else {
                continue;
            };
            let size = item.metadata().map(|m| m.len()).unwrap_or(0);
            entries.push(FileEntry::new(key, size));
        }
        logger::log_info(
            &format!("Listed {} files in {:?}", entries.len(), self.root),
            Some("archive"),
        );
        Ok(entries)
    }

    fn path_of(&mut self, key: &str) -> InstallResult<PathBuf> {
        let entries = self.list_entries()?;
        let entry = find_entry(&entries, key)
            .ok_or_else(|| InstallError::MissingContent(key.to_string()))?;
        Ok(self.root.join(&entry.key))
    }
}

impl ArchiveBackend for DirectoryBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Directory
    }

    fn source(&self) -> &Path {
        &self.source
    }

    fn password_state(&self) -> PasswordState {
        PasswordState::NotRequired
    }

    fn try_set_password(&mut self, _password: &str, _control: &TaskControl) -> InstallResult<bool> {
        Ok(true)
    }

    fn list_entries(&mut self) -> InstallResult<Arc<Vec<FileEntry>>> {
        if let Some(ref entries) = self.entries {
            return Ok(Arc::clone(entries));
        }
        let entries = Arc::new(self.scan()?);
        self.entries = Some(Arc::clone(&entries));
        Ok(entries)
    }

    fn read_entry(&mut self, key: &str) -> InstallResult<ReadOutcome> {
        let path = self.path_of(key)?;
        let data = fs::read(&path).map_err(|e| InstallError::fs(&path, e))?;
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
        let entries = self.list_entries()?;
        let mut state = CopyProgress {
            total_files: entries.len(),
            total_bytes: total_size(&entries),
            ..Default::default()
        };
        let mut stats = CopyStats::default();

        for entry in entries.iter() {
            control.ensure_not_cancelled("copying files")?;
            if let Some(destination) = callback(entry)? {
                let source = self.root.join(&entry.key);
                stats.bytes += copy_file(&source, &destination)?;
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

fn copy_file(source: &Path, destination: &Path) -> InstallResult<u64> {
    if source == destination {
        return Ok(0);
    }
    let mut input = fs::File::open(source).map_err(|e| InstallError::fs(source, e))?;
    super::write_stream_to(&mut input, destination)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_tree() -> tempfile::TempDir {
        let temp = tempfile::tempdir().unwrap();
        let ui = temp.path().join("mycar").join("ui");
        fs::create_dir_all(&ui).unwrap();
        fs::write(ui.join("ui_car.json"), br#"{"name":"My Car"}"#).unwrap();
        fs::write(temp.path().join("mycar").join("data.acd"), b"acd").unwrap();
        fs::write(temp.path().join("Thumbs.db"), b"junk").unwrap();
        temp
    }

    #[test]
    fn test_lists_files_with_relative_keys() {
        let temp = sample_tree();
        let mut backend = DirectoryBackend::open(temp.path()).unwrap();
        let keys: Vec<String> = backend
            .list_entries()
            .unwrap()
            .iter()
            .map(|e| e.key.clone())
            .collect();
        assert_eq!(keys, vec!["mycar/data.acd", "mycar/ui/ui_car.json"]);
    }

    #[test]
    fn test_listing_is_stable() {
        let temp = sample_tree();
        let mut backend = DirectoryBackend::open(temp.path()).unwrap();
        let first = backend.list_entries().unwrap();
        let second = backend.list_entries().unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_read_is_case_insensitive() {
        let temp = sample_tree();
        let mut backend = DirectoryBackend::open(temp.path()).unwrap();
        let data = backend.read_entry("MYCAR/UI/UI_CAR.JSON").unwrap();
        assert_eq!(data, ReadOutcome::Ready(br#"{"name":"My Car"}"#.to_vec()));
    }

    #[test]
    fn test_single_file_source() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("filter.ini");
        fs::write(&path, b"[ABOUT]").unwrap();
        let mut backend = DirectoryBackend::single_file(&path).unwrap();
        let entries = backend.list_entries().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].key, "filter.ini");
        assert!(matches!(backend.read_entry("filter.ini").unwrap(), ReadOutcome::Ready(_)));
    }

    #[test]
    fn test_copy_entries_honours_callback() {
        let temp = sample_tree();
        let target = tempfile::tempdir().unwrap();
        let mut backend = DirectoryBackend::open(temp.path()).unwrap();
        let mut seen = Vec::new();
        let stats = backend
            .copy_entries(
                &mut |entry: &FileEntry| {
                    seen.push(entry.key.clone());
                    Ok(entry
                        .key
                        .ends_with(".json")
                        .then(|| target.path().join(entry.name())))
                },
                &mut |_: &CopyProgress| {},
                &TaskControl::new(),
            )
            .unwrap();
        assert_eq!(stats.files, 1);
        assert_eq!(seen.len(), 2, "Every entry must be offered once");
        assert!(target.path().join("ui_car.json").exists());
        assert!(!target.path().join("data.acd").exists());
    }

    #[test]
    fn test_copy_stops_on_cancel() {
        let temp = sample_tree();
        let target = tempfile::tempdir().unwrap();
        let mut backend = DirectoryBackend::open(temp.path()).unwrap();
        let control = TaskControl::new();
        control.request_cancel();
        let result = backend.copy_entries(
            &mut |entry: &FileEntry| Ok(Some(target.path().join(entry.name()))),
            &mut |_: &CopyProgress| {},
            &control,
        );
        assert!(matches!(result, Err(InstallError::Cancelled)));
        assert_eq!(fs::read_dir(target.path()).unwrap().count(), 0);
    }
}
