use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::{Arc, LazyLock};
use std::thread;
use std::time::Duration;

use regex::Regex;
use tempfile::TempDir;

use crate::app_dirs;
use crate::error::{InstallError, InstallResult};
use crate::logger;
use crate::task_control::TaskControl;

use super::solid::SolidCache;
use super::{
    find_entry, normalize_key, write_stream_to, ArchiveBackend, BackendKind,
    CopyCallback, CopyProgress, CopyStats, FileEntry, PasswordState, ProgressSink, ReadOutcome,
};

/// 7-Zip prompts on stdin without `-p`, so an unused placeholder is always passed
const NO_PASSWORD: &str = "__acinstaller_no_password__";

const POLL_INTERVAL: Duration = Duration::from_millis(50);

static PASSWORD_ERROR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)wrong password|can ?not open encrypted archive|data error in encrypted file")
        .expect("static regex")
});

struct ProcessOutput {
    success: bool,
    stdout: Vec<u8>,
    stderr: String,
}

impl ProcessOutput {
    fn mentions_password(&self) -> bool {
        PASSWORD_ERROR.is_match(&self.stderr)
            || PASSWORD_ERROR.is_match(&String::from_utf8_lossy(&self.stdout))
    }
}

/// One member as reported by `7z l -slt`
#[derive(Debug, Clone, PartialEq, Eq)]
struct Listed {
    path: String,
    size: u64,
    folder: bool,
    encrypted: bool,
}

fn flush_member(current: &mut HashMap<&str, &str>, members: &mut Vec<Listed>) {
    if let Some(path) = current.get("Path") {
        let attributes = current.get("Attributes").copied().unwrap_or("");
        members.push(Listed {
            path: path.to_string(),
            size: current.get("Size").and_then(|s| s.parse().ok()).unwrap_or(0),
            folder: current.get("Folder").copied() == Some("+") || attributes.starts_with('D'),
            encrypted: current.get("Encrypted").copied() == Some("+"),
        });
    }
    current.clear();
}

/// Parses technical listing output. Members follow the `----------` separator;
/// each is a block of `Key = Value` lines ended by a blank line.
fn parse_listing(output: &str) -> (Vec<Listed>, bool) {
    let mut solid = false;
    let mut members = Vec::new();
    let mut in_members = false;
    let mut current: HashMap<&str, &str> = HashMap::new();

    for line in output.lines() {
        let line = line.trim_end_matches('\r');
        if !in_members {
            if line.starts_with("----------") {
                in_members = true;
            } else if line == "Solid = +" {
                solid = true;
            }
            continue;
        }
        if line.trim().is_empty() {
            flush_member(&mut current, &mut members);
            continue;
        }
        if let Some((key, value)) = line.split_once(" = ") {
            current.insert(key.trim(), value.trim());
        } else if let Some(key) = line.strip_suffix(" =") {
            current.insert(key.trim(), "");
        }
    }
    flush_member(&mut current, &mut members);
    (members, solid)
}

/// What one `7z l` run reported
struct Listing {
    entries: Vec<FileEntry>,
    /// Lower-cased entry key to the member name as 7-Zip prints it
    raw_names: HashMap<String, String>,
    solid: bool,
    any_encrypted: bool,
}

impl Listing {
    fn from_output(output: &str) -> Self {
        let (members, solid) = parse_listing(output);
        let mut listing = Listing {
            entries: Vec::new(),
            raw_names: HashMap::new(),
            solid,
            any_encrypted: members.iter().any(|m| m.encrypted),
        };
        for member in members.into_iter().filter(|m| !m.folder) {
            let Some(key) = normalize_key(&member.path) else {
                continue;
            };
            if key != member.path {
                listing.raw_names.insert(key.to_lowercase(), member.path);
            }
            listing.entries.push(FileEntry::new(key, member.size));
        }
        listing
    }
}

/// Archive access through an external 7-Zip executable.
///
/// Every child process is killed once `control` (or the control of the
/// calling operation) is cancelled.
pub struct ExternalBackend {
    source: PathBuf,
    executable: PathBuf,
    control: TaskControl,
    entries: Option<Arc<Vec<FileEntry>>>,
    raw_names: HashMap<String, String>,
    solid: bool,
    password: Option<String>,
    state: PasswordState,
    cache: SolidCache,
    scratch: Option<TempDir>,
}

impl ExternalBackend {
    pub fn open(path: &Path, executable: &Path, control: TaskControl) -> InstallResult<Self> {
        let mut backend = Self {
            source: path.to_path_buf(),
            executable: executable.to_path_buf(),
            control,
            entries: None,
            raw_names: HashMap::new(),
            solid: false,
            password: None,
            state: PasswordState::NotRequired,
            cache: SolidCache::new(),
            scratch: None,
        };

        let control = backend.control.clone();
        match backend.list(None, &control) {
            Ok(listing) => {
                if listing.any_encrypted {
                    backend.state = PasswordState::Required;
                }
                backend.apply_listing(listing);
            }
            Err(InstallError::PasswordRequired) => backend.state = PasswordState::Required,
            Err(e) => return Err(e),
        }

        logger::log_info(
            &format!(
                "7-Zip opened {:?}: {} entries, solid {}, password {:?}",
                path,
                backend.entries.as_ref().map(|e| e.len()).unwrap_or(0),
                backend.solid,
                backend.state
            ),
            Some("archive"),
        );
        Ok(backend)
    }

    fn password_arg(password: Option<&str>) -> String {
        format!("-p{}", password.unwrap_or(NO_PASSWORD))
    }

    fn apply_listing(&mut self, listing: Listing) {
        self.solid = listing.solid;
        self.raw_names = listing.raw_names;
        self.entries = Some(Arc::new(listing.entries));
    }

    /// Member name to pass back to 7-Zip for `key`
    fn raw_name<'k>(&'k self, key: &'k str) -> &'k str {
        self.raw_names
            .get(&key.to_lowercase())
            .map(String::as_str)
            .unwrap_or(key)
    }

    /// Where `key` ended up inside an extraction folder
    fn extracted_path(&self, batch: &Path, key: &str) -> PathBuf {
        let normalized = batch.join(key);
        if normalized.exists() {
            return normalized;
        }
        batch.join(self.raw_name(key))
    }

    /// Run 7-Zip to completion, killing it when `control` or the backend's own
    /// control is cancelled
    fn run(&self, args: &[String], control: &TaskControl) -> InstallResult<ProcessOutput> {
        crate::log_debug!(format!("7z {}", args.join(" ")), "archive");
        let mut child = Command::new(&self.executable)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                InstallError::UnsupportedContainer(format!(
                    "Failed to start {}: {}",
                    self.executable.display(),
                    e
                ))
            })?;

        let stdout = child.stdout.take().map(|mut pipe| {
            thread::spawn(move || {
                let mut buffer = Vec::new();
                let _ = pipe.read_to_end(&mut buffer);
                buffer
            })
        });
        let stderr = child.stderr.take().map(|mut pipe| {
            thread::spawn(move || {
                let mut buffer = String::new();
                let _ = pipe.read_to_string(&mut buffer);
                buffer
            })
        });

        let status = loop {
            if control.is_cancelled() || self.control.is_cancelled() {
                let _ = child.kill();
                let _ = child.wait();
                return Err(InstallError::Cancelled);
            }
            match child.try_wait()? {
                Some(status) => break status,
                None => thread::sleep(POLL_INTERVAL),
            }
        };

        Ok(ProcessOutput {
            success: status.success(),
            stdout: stdout.and_then(|h| h.join().ok()).unwrap_or_default(),
            stderr: stderr.and_then(|h| h.join().ok()).unwrap_or_default(),
        })
    }

    fn check(&self, output: &ProcessOutput, password: Option<&str>) -> InstallResult<()> {
        if output.success {
            return Ok(());
        }
        if output.mentions_password() {
            return Err(if password.is_some() {
                InstallError::PasswordIncorrect
            } else {
                InstallError::PasswordRequired
            });
        }
        let reason = output
            .stderr
            .lines()
            .find(|line| !line.trim().is_empty())
            .unwrap_or("7-Zip reported an error")
            .trim()
            .to_string();
        Err(InstallError::UnsupportedContainer(reason))
    }

    fn list(&self, password: Option<&str>, control: &TaskControl) -> InstallResult<Listing> {
        let args = vec![
            "l".to_string(),
            "-slt".to_string(),
            "-sccUTF-8".to_string(),
            Self::password_arg(password),
            "--".to_string(),
            self.source.to_string_lossy().to_string(),
        ];
        let output = self.run(&args, control)?;
        self.check(&output, password)?;

        Ok(Listing::from_output(&String::from_utf8_lossy(&output.stdout)))
    }

    fn scratch_dir(&mut self) -> InstallResult<PathBuf> {
        if let Some(ref dir) = self.scratch {
            return Ok(dir.path().to_path_buf());
        }
        let base = app_dirs::get_temp_dir();
        fs::create_dir_all(&base).map_err(|e| InstallError::fs(&base, e))?;
        let dir = tempfile::Builder::new()
            .prefix("7z_")
            .tempdir_in(&base)
            .map_err(|e| InstallError::fs(&base, e))?;
        let path = dir.path().to_path_buf();
        self.scratch = Some(dir);
        Ok(path)
    }

    /// Extract `keys` into a fresh folder in one invocation; returns that folder
    fn extract_batch(&mut self, keys: &[String], control: &TaskControl) -> InstallResult<PathBuf> {
        let scratch = self.scratch_dir()?;
        let batch = scratch.join(uuid::Uuid::new_v4().to_string());
        fs::create_dir_all(&batch).map_err(|e| InstallError::fs(&batch, e))?;
        let list_file = scratch.join(format!("{}.lst", uuid::Uuid::new_v4()));
        let names: Vec<&str> = keys.iter().map(|key| self.raw_name(key)).collect();
        fs::write(&list_file, names.join("\n")).map_err(|e| InstallError::fs(&list_file, e))?;

        let args = vec![
            "x".to_string(),
            "-y".to_string(),
            "-scsUTF-8".to_string(),
            "-sccUTF-8".to_string(),
            format!("-o{}", batch.display()),
            Self::password_arg(self.password.as_deref()),
            "--".to_string(),
            self.source.to_string_lossy().to_string(),
            format!("@{}", list_file.display()),
        ];
        let output = self.run(&args, control);
        let _ = fs::remove_file(&list_file);
        let output = output?;
        self.check(&output, self.password.as_deref())?;
        Ok(batch)
    }

    fn original_key(&mut self, key: &str) -> InstallResult<String> {
        let entries = self.list_entries()?;
        find_entry(&entries, key)
            .map(|entry| entry.key.clone())
            .ok_or_else(|| InstallError::MissingContent(key.to_string()))
    }

    fn read_direct(&self, key: &str) -> InstallResult<Vec<u8>> {
        let args = vec![
            "e".to_string(),
            "-so".to_string(),
            "-scsUTF-8".to_string(),
            Self::password_arg(self.password.as_deref()),
            "--".to_string(),
            self.source.to_string_lossy().to_string(),
            self.raw_name(key).to_string(),
        ];
        let output = self.run(&args, &self.control)?;
        self.check(&output, self.password.as_deref())?;
        Ok(output.stdout)
    }
}

impl ArchiveBackend for ExternalBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::External
    }

    fn source(&self) -> &Path {
        &self.source
    }

    fn password_state(&self) -> PasswordState {
        self.state
    }

    fn try_set_password(&mut self, password: &str, control: &TaskControl) -> InstallResult<bool> {
        if self.entries.is_none() {
            return match self.list(Some(password), control) {
                Ok(listing) => {
                    self.apply_listing(listing);
                    self.password = Some(password.to_string());
                    self.state = PasswordState::Accepted;
                    Ok(true)
                }
                Err(InstallError::PasswordIncorrect) => Ok(false),
                Err(e) => Err(e),
            };
        }

        let args = vec![
            "t".to_string(),
            Self::password_arg(Some(password)),
            "--".to_string(),
            self.source.to_string_lossy().to_string(),
        ];
        let output = self.run(&args, control)?;
        match self.check(&output, Some(password)) {
            Ok(()) => {
                self.password = Some(password.to_string());
                self.state = PasswordState::Accepted;
                Ok(true)
            }
            Err(InstallError::PasswordIncorrect) => Ok(false),
            Err(e) => Err(e),
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
        let key = self.original_key(key)?;
        if self.solid {
            return self.cache.read(&key);
        }
        Ok(ReadOutcome::Ready(self.read_direct(&key)?))
    }

    fn load_pending(&mut self, control: &TaskControl) -> InstallResult<()> {
        let entries = self.list_entries()?;
        let mut cache = std::mem::take(&mut self.cache);
        let result = cache.load_with(|wanted: &BTreeSet<String>| {
            let keys: Vec<String> = entries
                .iter()
                .filter(|entry| wanted.contains(&entry.key_lower()))
                .map(|entry| entry.key.clone())
                .collect();
            let batch = self.extract_batch(&keys, control)?;
            let mut decoded = Vec::with_capacity(keys.len());
            for key in keys {
                let path = self.extracted_path(&batch, &key);
                if let Ok(data) = fs::read(&path) {
                    decoded.push((key.to_lowercase(), data));
                }
            }
            let _ = fs::remove_dir_all(&batch);
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
        let mut accepted: Vec<(FileEntry, PathBuf)> = Vec::new();
        for entry in entries.iter() {
            if let Some(destination) = callback(entry)? {
                accepted.push((entry.clone(), destination));
            }
        }
        if accepted.is_empty() {
            return Ok(CopyStats::default());
        }

        let keys: Vec<String> = accepted.iter().map(|(entry, _)| entry.key.clone()).collect();
        let batch = self.extract_batch(&keys, control)?;

        let accepted: Vec<(FileEntry, PathBuf, PathBuf)> = accepted
            .into_iter()
            .map(|(entry, destination)| {
                let extracted = self.extracted_path(&batch, &entry.key);
                (entry, extracted, destination)
            })
            .collect();
        let result = place_batch(&accepted, progress, control);
        let _ = fs::remove_dir_all(&batch);
        result
    }
}

fn place_batch(
    accepted: &[(FileEntry, PathBuf, PathBuf)],
    progress: &mut ProgressSink<'_>,
    control: &TaskControl,
) -> InstallResult<CopyStats> {
    let mut stats = CopyStats::default();
    let mut state = CopyProgress {
        total_files: accepted.len(),
        total_bytes: accepted.iter().map(|(entry, _, _)| entry.size).sum(),
        ..Default::default()
    };
    for (entry, extracted, destination) in accepted {
        control.ensure_not_cancelled("moving extracted files")?;
        stats.bytes += move_into_place(extracted, destination)?;
        stats.files += 1;
        state.current = entry.key.clone();
        state.processed_files += 1;
        state.processed_bytes += entry.size;
        progress(&state);
    }
    Ok(stats)
}

/// Move an extracted file to its destination, copying across devices
fn move_into_place(extracted: &Path, destination: &Path) -> InstallResult<u64> {
    let size = fs::metadata(extracted)
        .map_err(|e| InstallError::fs(extracted, e))?
        .len();
    if let Some(parent) = destination.parent() {
        fs::create_dir_all(parent).map_err(|e| InstallError::fs(parent, e))?;
    }
    if fs::rename(extracted, destination).is_ok() {
        return Ok(size);
    }
    let mut input = fs::File::open(extracted).map_err(|e| InstallError::fs(extracted, e))?;
    write_stream_to(&mut input, destination)
}

impl Drop for ExternalBackend {
    fn drop(&mut self) {
        if let Some(dir) = self.scratch.take() {
            if let Err(e) = dir.close() {
                logger::log_error(
                    &format!("Failed to remove 7-Zip scratch folder: {}", e),
                    Some("archive"),
                );
            }
        }
    }
}
