//! The install phase: clean up, copy, then patch installed metadata.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Instant;

use crate::archive::{ArchiveBackend, CopyStats, FileEntry, ProgressSink};
use crate::entry::{AggregateCallback, ContentEntry, ContentKind, CopyPlan};
use crate::error::{InstallError, InstallResult};
use crate::generic_mods::{GenericModsRegistry, ModInstallSession};
use crate::logger;
use crate::task_control::TaskControl;

use super::destination::{sync_ui_version, ui_file_for};
use super::extra::ExtraOption;

const FONT_BITMAP_EXTENSIONS: &[&str] = &["bmp", "png"];

fn remove_path(path: &Path) -> io::Result<()> {
    let result = if path.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    };
    match result {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

/// Removes files and folders, through the system trash when `recycle` is set.
///
/// Falls back to plain deletion when the trash is unavailable.
pub fn remove_paths(paths: &[PathBuf], recycle: bool) -> InstallResult<usize> {
    let existing: Vec<&PathBuf> = paths.iter().filter(|path| path.exists()).collect();
    if existing.is_empty() {
        return Ok(0);
    }
    if recycle {
        match trash::delete_all(existing.iter().copied()) {
            Ok(()) => return Ok(existing.len()),
            Err(e) => logger::log_info(
                &format!("Recycle bin unavailable ({}), deleting instead", e),
                Some("installer"),
            ),
        }
    }
    for path in &existing {
        remove_path(path).map_err(|e| InstallError::fs(path.as_path(), e))?;
    }
    Ok(existing.len())
}

/// Installed files an option clears before copying
fn removal_targets(plan: &CopyPlan) -> Vec<PathBuf> {
    let mut targets = plan.option.files_to_remove(&plan.entry.kind, &plan.destination);
    if plan.option.removes_existing() {
        if let ContentKind::Font { .. } = plan.entry.kind {
            targets.extend(
                FONT_BITMAP_EXTENSIONS
                    .iter()
                    .map(|ext| plan.destination.with_extension(ext))
                    .filter(|path| path.is_file()),
            );
        }
    }
    targets
}

#[derive(Debug, Clone, Default)]
pub struct InstallReport {
    pub installed: Vec<ContentEntry>,
    pub stats: CopyStats,
}

/// Everything the install phase needs besides the backend
pub struct ExecuteRequest<'a> {
    pub plans: Vec<CopyPlan>,
    pub extras: &'a [ExtraOption],
    /// Set when writes are tracked as generic mods
    pub generic_mods: Option<&'a GenericModsRegistry>,
    pub recycle: bool,
}

/// Runs the install phase for the confirmed plans.
///
/// Mod sessions are finished even when copying fails, so backups taken so
/// far stay recorded.
pub fn execute(
    backend: &mut dyn ArchiveBackend,
    request: ExecuteRequest<'_>,
    progress: &mut ProgressSink<'_>,
    control: &TaskControl,
) -> InstallResult<InstallReport> {
    let started = Instant::now();
    let ExecuteRequest {
        plans,
        extras,
        generic_mods,
        recycle,
    } = request;

    let mut sessions: Vec<Option<ModInstallSession>> = Vec::with_capacity(plans.len());
    for plan in &plans {
        sessions.push(match generic_mods {
            Some(registry) => Some(registry.begin_session(&plan.entry.generic_mod_name())?),
            None => None,
        });
    }

    let result = run_steps(backend, &plans, extras, &mut sessions, recycle, progress, control);

    for session in sessions.into_iter().flatten() {
        let name = session.mod_name().to_string();
        if let Err(e) = session.finish() {
            logger::log_error(
                &format!("Failed to record mod {:?}: {}", name, e),
                Some("generic_mods"),
            );
        }
    }
    let stats = result?;

    for plan in &plans {
        sync_version(plan);
    }

    crate::log_debug!(
        format!(
            "[TIMING] Install phase completed in {:.2}ms: {} files, {} bytes",
            started.elapsed().as_secs_f64() * 1000.0,
            stats.files,
            stats.bytes
        ),
        "installer"
    );
    Ok(InstallReport {
        installed: plans.into_iter().map(|plan| plan.entry).collect(),
        stats,
    })
}

fn run_steps(
    backend: &mut dyn ArchiveBackend,
    plans: &[CopyPlan],
    extras: &[ExtraOption],
    sessions: &mut [Option<ModInstallSession>],
    recycle: bool,
    progress: &mut ProgressSink<'_>,
    control: &TaskControl,
) -> InstallResult<CopyStats> {
    control.ensure_not_cancelled("removing existing files")?;
    for (plan, session) in plans.iter().zip(sessions.iter_mut()) {
        let targets = removal_targets(plan);
        if targets.is_empty() {
            continue;
        }
        match session {
            // Generic mods keep the originals in the backup folder
            Some(session) => {
                for target in &targets {
                    session.remove_existing(target)?;
                }
            }
            None => {
                let removed = remove_paths(&targets, recycle)?;
                logger::log_info(
                    &format!("Removed {} existing files of {}", removed, plan.entry.id),
                    Some("installer"),
                );
            }
        }
    }

    control.ensure_not_cancelled("extra options")?;
    for extra in extras {
        extra.run_pre(recycle)?;
    }

    for plan in plans {
        let folder = if plan.entry.kind.is_file_package() {
            plan.destination.parent()
        } else {
            Some(plan.destination.as_path())
        };
        if let Some(folder) = folder {
            fs::create_dir_all(folder).map_err(|e| InstallError::fs(folder, e))?;
        }
    }

    control.ensure_not_cancelled("copying")?;
    let aggregate = AggregateCallback::new(plans.to_vec());
    let mut callback = |file: &FileEntry| -> InstallResult<Option<PathBuf>> {
        let Some((index, destination)) = aggregate.resolve(file) else {
            return Ok(None);
        };
        if let Some(session) = sessions.get_mut(index).and_then(Option::as_mut) {
            session.intercept(&destination)?;
        }
        Ok(Some(destination))
    };
    backend.copy_entries(&mut callback, progress, control)
}

/// Carries the package version into kept UI metadata
fn sync_version(plan: &CopyPlan) {
    if !plan.option.syncs_version() {
        return;
    }
    let Some(version) = plan.entry.version.as_deref() else {
        return;
    };
    let Some(ui_file) = ui_file_for(&plan.entry.kind, &plan.destination) else {
        return;
    };
    match sync_ui_version(&ui_file, version) {
        Ok(true) => logger::log_info(
            &format!("Updated version of {} to {}", plan.entry.id, version),
            Some("installer"),
        ),
        Ok(false) => {}
        Err(e) => logger::log_error(
            &format!("Could not update version in {:?}: {}", ui_file, e),
            Some("installer"),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::{CopyProgress, DirectoryBackend};
    use crate::entry::UpdateOption;

    fn write(path: &Path, data: &[u8]) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, data).unwrap();
    }

    fn car_plan(destination: &Path, option: UpdateOption) -> CopyPlan {
        CopyPlan::new(
            ContentEntry::new(ContentKind::Car, "mycar", "mycar").with_version(Some("2.0".into())),
            option,
            destination.to_path_buf(),
        )
    }

    fn run(source: &Path, plans: Vec<CopyPlan>, generic: Option<&GenericModsRegistry>) -> InstallReport {
        let mut backend = DirectoryBackend::open(source).unwrap();
        let mut progress = |_: &CopyProgress| {};
        execute(
            &mut backend,
            ExecuteRequest {
                plans,
                extras: &[],
                generic_mods: generic,
                recycle: false,
            },
            &mut progress,
            &TaskControl::new(),
        )
        .unwrap()
    }

    #[test]
    fn test_remove_existing_clears_stale_files() {
        let temp = tempfile::tempdir().unwrap();
        let source = temp.path().join("source");
        write(&source.join("mycar/ui/ui_car.json"), br#"{"name":"Car"}"#);
        write(&source.join("mycar/data.acd"), b"new");
        let destination = temp.path().join("cars").join("mycar");
        write(&destination.join("stale.kn5"), b"old");

        let report = run(&source, vec![car_plan(&destination, UpdateOption::RemoveExisting)], None);
        assert_eq!(report.installed.len(), 1);
        assert_eq!(report.stats.files, 2);
        assert!(!destination.join("stale.kn5").exists());
        assert_eq!(fs::read(destination.join("data.acd")).unwrap(), b"new");
    }

    #[test]
    fn test_keep_ui_syncs_version() {
        let temp = tempfile::tempdir().unwrap();
        let source = temp.path().join("source");
        write(&source.join("mycar/ui/ui_car.json"), br#"{"name":"New name","version":"2.0"}"#);
        write(&source.join("mycar/data.acd"), b"new");
        let destination = temp.path().join("cars").join("mycar");
        write(&destination.join("ui/ui_car.json"), br#"{"name":"Custom","version":"1.0"}"#);

        run(&source, vec![car_plan(&destination, UpdateOption::KeepUiInformation)], None);
        let ui: serde_json::Value =
            serde_json::from_slice(&fs::read(destination.join("ui/ui_car.json")).unwrap()).unwrap();
        assert_eq!(ui["name"], "Custom");
        assert_eq!(ui["version"], "2.0");
    }

    #[test]
    fn test_generic_mod_backs_up_overwritten_files() {
        let temp = tempfile::tempdir().unwrap();
        let game = temp.path().join("game");
        let destination = game.join("content").join("cars").join("mycar");
        write(&destination.join("data.acd"), b"original");
        let source = temp.path().join("source");
        write(&source.join("mycar/ui/ui_car.json"), b"{}");
        write(&source.join("mycar/data.acd"), b"modded");
        let registry = GenericModsRegistry::new(&game, game.join("mods"));

        run(
            &source,
            vec![car_plan(&destination, UpdateOption::UpdateEverything)],
            Some(&registry),
        );
        assert_eq!(fs::read(destination.join("data.acd")).unwrap(), b"modded");
        registry.disable("(Car) mycar").unwrap();
        assert_eq!(fs::read(destination.join("data.acd")).unwrap(), b"original");
        assert!(!destination.join("ui").join("ui_car.json").exists());
    }

    #[test]
    fn test_generic_mod_clean_reinstall_removes_dropped_files() {
        let temp = tempfile::tempdir().unwrap();
        let game = temp.path().join("game");
        let destination = game.join("content").join("cars").join("mycar");
        write(&destination.join("data.acd"), b"original");
        write(&destination.join("stock.kn5"), b"stock");
        let registry = GenericModsRegistry::new(&game, game.join("mods"));

        let first = temp.path().join("first");
        write(&first.join("mycar/ui/ui_car.json"), b"{}");
        write(&first.join("mycar/data.acd"), b"v1");
        write(&first.join("mycar/extra.kn5"), b"v1 only");
        run(
            &first,
            vec![car_plan(&destination, UpdateOption::UpdateEverything)],
            Some(&registry),
        );
        assert!(destination.join("extra.kn5").exists());

        let second = temp.path().join("second");
        write(&second.join("mycar/ui/ui_car.json"), b"{}");
        write(&second.join("mycar/data.acd"), b"v2");
        run(
            &second,
            vec![car_plan(&destination, UpdateOption::RemoveExisting)],
            Some(&registry),
        );
        assert_eq!(fs::read(destination.join("data.acd")).unwrap(), b"v2");
        assert!(!destination.join("extra.kn5").exists());
        assert!(!destination.join("stock.kn5").exists());
        assert!(!registry
            .manifest("(Car) mycar")
            .unwrap()
            .iter()
            .any(|key| key.ends_with("extra.kn5")));

        registry.disable("(Car) mycar").unwrap();
        assert_eq!(fs::read(destination.join("data.acd")).unwrap(), b"original");
        assert_eq!(fs::read(destination.join("stock.kn5")).unwrap(), b"stock");
        assert!(!destination.join("extra.kn5").exists());
    }

    #[test]
    fn test_remove_paths_without_recycle() {
        let temp = tempfile::tempdir().unwrap();
        let file = temp.path().join("a.txt");
        let dir = temp.path().join("folder");
        write(&file, b"x");
        write(&dir.join("b.txt"), b"y");
        let removed = remove_paths(&[file.clone(), dir.clone(), temp.path().join("missing")], false).unwrap();
        assert_eq!(removed, 2);
        assert!(!file.exists());
        assert!(!dir.exists());
    }
}
