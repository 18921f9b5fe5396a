//! Installation jobs.
//!
//! Each submitted source runs as one task through
//! `Loading -> PasswordRequired* -> WaitingForConfirmation -> Installing -> Finished`.
//! Blocking archive and filesystem work goes to `spawn_blocking`; the task
//! itself only waits on answers, workers and the cancellation token.

pub mod destination;
mod execute;
pub mod extra;
pub mod job;

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use anyhow::anyhow;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::archive::{open_source, ArchiveBackend, CopyProgress, PasswordState};
use crate::checksum;
use crate::config::InstallerSettings;
use crate::entry::{default_option, options_for, ContentEntry, CopyPlan};
use crate::error::{ErrorCode, FailureReport, InstallError, InstallResult};
use crate::generic_mods::GenericModsRegistry;
use crate::logger;
use crate::scanner::{self, is_valid_id};

pub use destination::{destination_for, inspect_existing, is_newer_version, ExistingContent};
pub use execute::{execute, remove_paths, ExecuteRequest, InstallReport};
pub use extra::{compute_extra_options, ExtraOption, REMOVE_OBSOLETE_VERSIONS};
pub use job::{
    Confirmation, EntryCandidate, EntrySelection, InstallJob, JobOutcome, JobSnapshot, JobState,
};

use job::JobInbox;

/// Runs after a successful install with the installed packages
pub type PostInstallHook = Arc<dyn Fn(&[ContentEntry]) -> anyhow::Result<()> + Send + Sync>;

#[derive(Clone, Default)]
pub struct InstallParams {
    /// Hex MD5 or SHA-256 of the source file
    pub checksum: Option<String>,
    pub password: Option<String>,
    pub as_generic_mod: bool,
    /// Car for skins found without a surrounding car folder
    pub car_id_hint: Option<String>,
    pub display_name: Option<String>,
    pub post_install: Option<PostInstallHook>,
}

impl fmt::Debug for InstallParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstallParams")
            .field("checksum", &self.checksum)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("as_generic_mod", &self.as_generic_mod)
            .field("car_id_hint", &self.car_id_hint)
            .field("display_name", &self.display_name)
            .field("post_install", &self.post_install.is_some())
            .finish()
    }
}

impl InstallParams {
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn with_checksum(mut self, checksum: impl Into<String>) -> Self {
        self.checksum = Some(checksum.into());
        self
    }

    pub fn with_car_id_hint(mut self, car_id: impl Into<String>) -> Self {
        self.car_id_hint = Some(car_id.into());
        self
    }

    pub fn as_generic_mod(mut self) -> Self {
        self.as_generic_mod = true;
        self
    }

    pub fn with_post_install(
        mut self,
        hook: impl Fn(&[ContentEntry]) -> anyhow::Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.post_install = Some(Arc::new(hook));
        self
    }
}

type SharedBackend = Arc<Mutex<Box<dyn ArchiveBackend>>>;

fn join_error(e: tokio::task::JoinError) -> InstallError {
    InstallError::Internal(anyhow!("Worker task failed: {}", e))
}

/// Runs `work` on the blocking pool with exclusive access to the backend
async fn with_backend<T, F>(backend: &SharedBackend, work: F) -> InstallResult<T>
where
    T: Send + 'static,
    F: FnOnce(&mut dyn ArchiveBackend) -> InstallResult<T> + Send + 'static,
{
    let backend = Arc::clone(backend);
    tokio::task::spawn_blocking(move || {
        let mut guard = backend.lock().unwrap_or_else(PoisonError::into_inner);
        work(&mut **guard)
    })
    .await
    .map_err(join_error)?
}

const ARCHIVE_SUFFIXES: &[&str] = &["zip", "7z", "rar"];

fn is_archive_suffix(ext: &str) -> bool {
    let ext = ext.to_lowercase();
    let digits = |s: &str| s.chars().all(|c| c.is_ascii_digit());
    ARCHIVE_SUFFIXES.contains(&ext.as_str())
        || digits(&ext)
        || ext.strip_prefix("part").map(digits).unwrap_or(false)
        || ext.strip_prefix('z').map(|rest| !rest.is_empty() && digits(rest)).unwrap_or(false)
}

/// Fallback id for a package at the source root: the source's name without
/// archive and volume extensions
pub fn base_id(path: &Path) -> Option<String> {
    let name = path.file_name()?.to_string_lossy().into_owned();
    if path.is_dir() {
        return Some(name).filter(|n| is_valid_id(n));
    }
    let mut name = match name.rsplit_once('.') {
        Some((stem, _)) if !stem.is_empty() => stem.to_string(),
        _ => name,
    };
    while let Some((stem, ext)) = name.rsplit_once('.') {
        if stem.is_empty() || !is_archive_suffix(ext) {
            break;
        }
        name = stem.to_string();
    }
    Some(name).filter(|n| is_valid_id(n))
}

fn annotate(
    entries: &[ContentEntry],
    content_root: &Path,
    car_id_hint: Option<&str>,
) -> Vec<EntryCandidate> {
    entries
        .iter()
        .enumerate()
        .map(|(index, entry)| {
            let (destination, destination_error) =
                match destination_for(entry, content_root, car_id_hint) {
                    Ok(destination) => (Some(destination), None),
                    Err(e) => (None, Some(e.to_string())),
                };
            let existing = destination
                .as_deref()
                .and_then(|destination| inspect_existing(&entry.kind, destination));
            let is_newer_version = existing.as_ref().and_then(|existing| {
                is_newer_version(entry.version.as_deref(), existing.version.as_deref())
            });
            let headline = if existing.is_some() {
                entry.existing_format()
            } else {
                entry.new_format()
            };
            EntryCandidate {
                index,
                entry: entry.clone(),
                destination,
                destination_error,
                is_newer_version,
                headline,
                options: options_for(&entry.kind),
                default_option: default_option(&entry.kind, existing.is_some()),
                existing,
            }
        })
        .collect()
}

/// Plans for the confirmed candidates, plus a message per selection that can't be installed
fn plan_selection(
    candidates: &[EntryCandidate],
    confirmation: &Confirmation,
) -> (Vec<CopyPlan>, Vec<String>) {
    let mut plans: Vec<CopyPlan> = Vec::new();
    let mut planned = Vec::new();
    let mut skipped = Vec::new();
    for selection in &confirmation.active {
        if planned.contains(&selection.index) {
            continue;
        }
        let Some(candidate) = candidates.get(selection.index) else {
            skipped.push(format!("There is no package #{}", selection.index));
            continue;
        };
        let Some(destination) = candidate.destination.clone() else {
            skipped.push(format!(
                "{}: {}",
                candidate.entry.name,
                candidate.destination_error.as_deref().unwrap_or("no destination")
            ));
            continue;
        };
        let option = selection
            .option
            .filter(|option| candidate.options.contains(option))
            .unwrap_or(candidate.default_option);
        planned.push(selection.index);
        plans.push(CopyPlan::new(candidate.entry.clone(), option, destination));
    }
    (plans, skipped)
}

async fn run(
    job: &Arc<InstallJob>,
    inbox: &mut JobInbox,
    path: &Path,
    params: &InstallParams,
    settings: &Arc<InstallerSettings>,
) -> InstallResult<JobOutcome> {
    let control = job.control().clone();

    if let Some(expected) = params.checksum.clone() {
        job.set_state(JobState::Loading, "Verifying checksum");
        let path = path.to_path_buf();
        let control = control.clone();
        tokio::task::spawn_blocking(move || checksum::verify(&path, &expected, &control))
            .await
            .map_err(join_error)??;
    }

    job.set_state(JobState::Loading, "Opening");
    let opened = {
        let path = path.to_path_buf();
        let password = params.password.clone();
        let settings = Arc::clone(settings);
        let control = control.clone();
        tokio::task::spawn_blocking(move || {
            open_source(&path, password.as_deref(), &settings, &control)
        })
            .await
            .map_err(join_error)??
    };
    let backend: SharedBackend = Arc::new(Mutex::new(opened.into_backend()));

    let mut incorrect = params.password.is_some();
    loop {
        let state = with_backend(&backend, |backend| Ok(backend.password_state())).await?;
        if state != PasswordState::Required {
            break;
        }
        let message = if incorrect { "Password is incorrect" } else { "Password required" };
        job.set_state(JobState::PasswordRequired { incorrect }, message);
        let password = tokio::select! {
            _ = control.cancelled() => return Err(InstallError::Cancelled),
            received = inbox.password.recv() => received.ok_or(InstallError::Cancelled)?,
        };
        control.ensure_not_cancelled("password check")?;
        job.set_state(JobState::Loading, "Checking password");
        let control = control.clone();
        incorrect = !with_backend(&backend, move |backend| {
            backend.try_set_password(&password, &control)
        })
        .await?;
    }

    job.set_state(JobState::Loading, "Looking for content");
    let entries = {
        let base = base_id(path);
        let depth = settings.max_scan_depth;
        let control = control.clone();
        with_backend(&backend, move |backend| {
            scanner::detect_entries(backend, base.as_deref(), depth, &control)
        })
        .await?
    };
    if entries.is_empty() {
        return Ok(JobOutcome::Empty);
    }

    let candidates = annotate(&entries, &settings.content_root, params.car_id_hint.as_deref());
    let extras = compute_extra_options(&entries, &settings.content_root);
    job.update(|snapshot| {
        snapshot.state = JobState::WaitingForConfirmation;
        snapshot.message = format!("Found {} packages", candidates.len());
        snapshot.progress = None;
        snapshot.candidates = candidates.clone();
        snapshot.extra_options = extras.clone();
    });

    let confirmation = tokio::select! {
        _ = control.cancelled() => return Err(InstallError::Cancelled),
        received = inbox.confirmation.recv() => received.ok_or(InstallError::Cancelled)?,
    };
    control.ensure_not_cancelled("confirmation")?;

    let (plans, skipped) = plan_selection(&candidates, &confirmation);
    if plans.is_empty() {
        if skipped.is_empty() {
            return Ok(JobOutcome::Succeeded {
                installed: Vec::new(),
                skipped,
            });
        }
        return Err(anyhow!(skipped.join("; ")).into());
    }
    let active_extras: Vec<ExtraOption> = extras
        .into_iter()
        .filter(|extra| confirmation.extra_options.contains(&extra.id))
        .collect();

    job.set_state(JobState::Installing, "Installing");
    let report = {
        let registry = params
            .as_generic_mod
            .then(|| GenericModsRegistry::from_settings(settings));
        let recycle = settings.recycle_removed_files;
        let job = Arc::clone(job);
        let control = control.clone();
        with_backend(&backend, move |backend| {
            let mut progress = |state: &CopyProgress| {
                job.update(|snapshot| {
                    snapshot.message = format!("Installing {}", state.current);
                    snapshot.progress = Some(state.fraction());
                })
            };
            execute(
                backend,
                ExecuteRequest {
                    plans,
                    extras: &active_extras,
                    generic_mods: registry.as_ref(),
                    recycle,
                },
                &mut progress,
                &control,
            )
        })
        .await?
    };

    if let Some(hook) = params.post_install.clone() {
        let installed = report.installed.clone();
        match tokio::task::spawn_blocking(move || hook(&installed)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => logger::log_error(&format!("Post-install hook failed: {:#}", e), Some("installer")),
            Err(e) => logger::log_error(&format!("Post-install hook panicked: {}", e), Some("installer")),
        }
    }

    for message in &skipped {
        logger::log_error(&format!("Skipped: {}", message), Some("installer"));
    }
    Ok(JobOutcome::Succeeded {
        installed: report.installed.into_iter().map(|entry| entry.id).collect(),
        skipped,
    })
}

async fn drive(
    job: Arc<InstallJob>,
    mut inbox: JobInbox,
    path: PathBuf,
    params: InstallParams,
    settings: Arc<InstallerSettings>,
    jobs: Arc<DashMap<String, Arc<InstallJob>>>,
) {
    let started = Instant::now();
    let outcome = match run(&job, &mut inbox, &path, &params, &settings).await {
        Ok(outcome) => outcome,
        Err(e) if e.is_cancelled() => JobOutcome::Cancelled,
        Err(e) => {
            let report = FailureReport::from_error(&e)
                .unwrap_or_else(|| FailureReport::new(ErrorCode::Internal, e.to_string()));
            logger::log_error(&format!("Installing {:?} failed: {}", path, report), Some("installer"));
            JobOutcome::Failed { report }
        }
    };

    let message = match &outcome {
        JobOutcome::Succeeded { installed, .. } => format!("Installed {} packages", installed.len()),
        JobOutcome::Empty => "Nothing to install".to_string(),
        JobOutcome::Failed { report } => report.message.clone(),
        JobOutcome::Cancelled => "Cancelled".to_string(),
    };
    logger::log_info(
        &format!(
            "Job {:?} finished in {:.2}s: {}",
            job.source(),
            started.elapsed().as_secs_f64(),
            message
        ),
        Some("installer"),
    );
    job.set_state(JobState::Finished(outcome), message);

    tokio::time::sleep(settings.finished_job_retention()).await;
    jobs.remove_if(job.source(), |_, current| Arc::ptr_eq(current, &job));
}

/// Owns every job of one game installation
#[derive(Debug, Clone)]
pub struct InstallationManager {
    settings: Arc<InstallerSettings>,
    jobs: Arc<DashMap<String, Arc<InstallJob>>>,
}

impl InstallationManager {
    pub fn new(settings: InstallerSettings) -> Self {
        Self {
            settings: Arc::new(settings),
            jobs: Arc::new(DashMap::new()),
        }
    }

    pub fn settings(&self) -> &InstallerSettings {
        &self.settings
    }

    /// Starts installing `source`, or returns the job already running for it.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn submit(&self, source: impl AsRef<Path>, params: InstallParams) -> Arc<InstallJob> {
        let path = source.as_ref().to_path_buf();
        let key = path.to_string_lossy().into_owned();

        let entry = self.jobs.entry(key.clone());
        if let Entry::Occupied(existing) = &entry {
            if !existing.get().state().is_finished() {
                logger::log_info(
                    &format!("{:?} is already being installed", key),
                    Some("installer"),
                );
                return Arc::clone(existing.get());
            }
        }

        let display_name = params
            .display_name
            .clone()
            .or_else(|| path.file_name().map(|name| name.to_string_lossy().into_owned()))
            .unwrap_or_else(|| key.clone());
        let (job, inbox) = InstallJob::new(key, display_name);
        let job = Arc::new(job);
        entry.insert(Arc::clone(&job));

        logger::log_info(&format!("Installing {:?}: {:?}", path, params), Some("installer"));
        tokio::spawn(drive(
            Arc::clone(&job),
            inbox,
            path,
            params,
            Arc::clone(&self.settings),
            Arc::clone(&self.jobs),
        ));
        job
    }

    pub fn job(&self, source: impl AsRef<Path>) -> Option<Arc<InstallJob>> {
        let key = source.as_ref().to_string_lossy().into_owned();
        self.jobs.get(&key).map(|job| Arc::clone(job.value()))
    }

    pub fn jobs(&self) -> Vec<Arc<InstallJob>> {
        self.jobs.iter().map(|job| Arc::clone(job.value())).collect()
    }
}
