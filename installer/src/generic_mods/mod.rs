//! Installs tracked as removable overlays.
//!
//! Layout under the mods root:
//! - `<mod>/files.txt`: every path the mod wrote, relative to the game root
//! - `.backups/<mod>/...`: originals the mod replaced
//! - `.backups/<mod>.txt`: relative paths already backed up
//! - `mods.ini`: one section per mod with `Installed`, `Order`, `Files`, `DependsOn`

use std::collections::{BTreeSet, HashSet};
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::{LazyLock, Mutex, PoisonError};

use anyhow::anyhow;
use ini::Ini;
use serde::Serialize;

use crate::config::InstallerSettings;
use crate::error::{InstallError, InstallResult};
use crate::logger;

pub const MANIFEST_FILE: &str = "files.txt";
pub const BACKUPS_DIR: &str = ".backups";
pub const REGISTRY_FILE: &str = "mods.ini";

/// Serialises every read-modify-write of `mods.ini` in this process
static REGISTRY_LOCK: LazyLock<Mutex<()>> = LazyLock::new(|| Mutex::new(()));

/// `/`-separated path of `path` below `root`, or `None` when it lies outside
fn relative_key(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let mut parts = Vec::new();
    for component in relative.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_string_lossy().into_owned()),
            Component::CurDir => {}
            _ => return None,
        }
    }
    (!parts.is_empty()).then(|| parts.join("/"))
}

fn join_key(root: &Path, key: &str) -> PathBuf {
    key.split('/')
        .filter(|part| !part.is_empty())
        .fold(root.to_path_buf(), |path, part| path.join(part))
}

fn read_list(path: &Path) -> InstallResult<Vec<String>> {
    match fs::read_to_string(path) {
        Ok(text) => Ok(text
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(InstallError::fs(path, e)),
    }
}

fn write_list<'a>(path: &Path, lines: impl IntoIterator<Item = &'a String>) -> InstallResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| InstallError::fs(parent, e))?;
    }
    let mut text = String::new();
    for line in lines {
        text.push_str(line);
        text.push('\n');
    }
    fs::write(path, text).map_err(|e| InstallError::fs(path, e))
}

/// Moves a file: rename first, then hard link plus unlink, then copy.
///
/// After the copy fallback the source may still exist if it could not be removed.
pub fn move_file(src: &Path, dst: &Path) -> io::Result<()> {
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent)?;
    }
    let rename_err = match fs::rename(src, dst) {
        Ok(()) => return Ok(()),
        Err(e) => e,
    };
    logger::log_info(
        &format!("Rename {:?} -> {:?} failed ({}), trying link", src, dst, rename_err),
        Some("generic_mods"),
    );

    if fs::hard_link(src, dst).is_ok() {
        match fs::remove_file(src) {
            Ok(()) => return Ok(()),
            Err(_) => {
                let _ = fs::remove_file(dst);
            }
        }
    }

    fs::copy(src, dst)?;
    if let Err(e) = fs::remove_file(src) {
        logger::log_error(
            &format!("Copied {:?} but could not remove the original: {}", src, e),
            Some("generic_mods"),
        );
    }
    Ok(())
}

/// One mod's entry in `mods.ini`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModRecord {
    pub name: String,
    pub installed: bool,
    pub order: u32,
    /// Manifest path relative to the mods root
    pub files: String,
    pub depends_on: Vec<String>,
}

impl ModRecord {
    fn from_section(name: &str, section: &ini::Properties) -> Self {
        Self {
            name: name.to_string(),
            installed: section
                .get("Installed")
                .map(|v| v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
            order: section.get("Order").and_then(|v| v.parse().ok()).unwrap_or(0),
            files: section.get("Files").unwrap_or_default().to_string(),
            depends_on: section
                .get("DependsOn")
                .unwrap_or_default()
                .split(',')
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
                .collect(),
        }
    }

    fn write_to(&self, ini: &mut Ini) {
        ini.with_section(Some(self.name.as_str()))
            .set("Installed", if self.installed { "true" } else { "false" })
            .set("Order", self.order.to_string())
            .set("Files", self.files.as_str())
            .set("DependsOn", self.depends_on.join(","));
    }
}

/// Access to the mods root of one game installation
#[derive(Debug, Clone)]
pub struct GenericModsRegistry {
    install_root: PathBuf,
    mods_root: PathBuf,
}

impl GenericModsRegistry {
    pub fn new(install_root: impl Into<PathBuf>, mods_root: impl Into<PathBuf>) -> Self {
        Self {
            install_root: install_root.into(),
            mods_root: mods_root.into(),
        }
    }

    pub fn from_settings(settings: &InstallerSettings) -> Self {
        Self::new(&settings.content_root, settings.generic_mods_root())
    }

    pub fn mods_root(&self) -> &Path {
        &self.mods_root
    }

    fn registry_path(&self) -> PathBuf {
        self.mods_root.join(REGISTRY_FILE)
    }

    fn manifest_path(&self, mod_name: &str) -> PathBuf {
        self.mods_root.join(mod_name).join(MANIFEST_FILE)
    }

    fn backup_dir(&self, mod_name: &str) -> PathBuf {
        self.mods_root.join(BACKUPS_DIR).join(mod_name)
    }

    fn backup_list_path(&self, mod_name: &str) -> PathBuf {
        self.mods_root.join(BACKUPS_DIR).join(format!("{}.txt", mod_name))
    }

    fn load_ini(&self) -> InstallResult<Ini> {
        let path = self.registry_path();
        if !path.exists() {
            return Ok(Ini::new());
        }
        Ini::load_from_file(&path)
            .map_err(|e| InstallError::Internal(anyhow!("Failed to read {:?}: {}", path, e)))
    }

    fn save_ini(&self, ini: &Ini) -> InstallResult<()> {
        let path = self.registry_path();
        fs::create_dir_all(&self.mods_root).map_err(|e| InstallError::fs(&self.mods_root, e))?;
        ini.write_to_file(&path).map_err(|e| InstallError::fs(&path, e))
    }

    fn records(ini: &Ini) -> Vec<ModRecord> {
        ini.iter()
            .filter_map(|(name, section)| name.map(|name| ModRecord::from_section(name, section)))
            .collect()
    }

    /// Every mod known to `mods.ini`
    pub fn mods(&self) -> InstallResult<Vec<ModRecord>> {
        let _guard = REGISTRY_LOCK.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(Self::records(&self.load_ini()?))
    }

    /// Installed mods in apply order
    pub fn enabled_mods(&self) -> InstallResult<Vec<ModRecord>> {
        let mut mods: Vec<ModRecord> = self.mods()?.into_iter().filter(|m| m.installed).collect();
        mods.sort_by(|a, b| a.order.cmp(&b.order).then_with(|| a.name.cmp(&b.name)));
        Ok(mods)
    }

    /// Relative paths written by `mod_name`
    pub fn manifest(&self, mod_name: &str) -> InstallResult<Vec<String>> {
        read_list(&self.manifest_path(mod_name))
    }

    /// Starts tracking writes for `mod_name`
    pub fn begin_session(&self, mod_name: &str) -> InstallResult<ModInstallSession> {
        let backed_up = read_list(&self.backup_list_path(mod_name))?.into_iter().collect();
        let written = self.manifest(mod_name)?.into_iter().collect();
        Ok(ModInstallSession {
            registry: self.clone(),
            mod_name: mod_name.to_string(),
            backed_up,
            written,
            touched: HashSet::new(),
        })
    }

    fn register(&self, mod_name: &str, files: &BTreeSet<String>) -> InstallResult<ModRecord> {
        let _guard = REGISTRY_LOCK.lock().unwrap_or_else(PoisonError::into_inner);
        let mut ini = self.load_ini()?;
        let others: Vec<ModRecord> = Self::records(&ini)
            .into_iter()
            .filter(|m| m.name != mod_name)
            .collect();

        let mut depends_on = Vec::new();
        for other in others.iter().filter(|m| m.installed) {
            let overlaps = self
                .manifest(&other.name)?
                .iter()
                .any(|file| files.contains(file));
            if overlaps {
                depends_on.push(other.name.clone());
            }
        }

        let existing_order = ini
            .section(Some(mod_name))
            .map(|section| ModRecord::from_section(mod_name, section))
            .filter(|record| record.installed)
            .map(|record| record.order);
        let order = existing_order
            .unwrap_or_else(|| others.iter().map(|m| m.order + 1).max().unwrap_or(0));

        let record = ModRecord {
            name: mod_name.to_string(),
            installed: true,
            order,
            files: format!("{}/{}", mod_name, MANIFEST_FILE),
            depends_on,
        };
        record.write_to(&mut ini);
        self.save_ini(&ini)?;
        Ok(record)
    }

    /// Removes the files `mod_name` wrote and puts the originals back.
    ///
    /// Refused while another installed mod overrides files of this one.
    pub fn disable(&self, mod_name: &str) -> InstallResult<()> {
        let _guard = REGISTRY_LOCK.lock().unwrap_or_else(PoisonError::into_inner);
        let mut ini = self.load_ini()?;
        let record = ini
            .section(Some(mod_name))
            .map(|section| ModRecord::from_section(mod_name, section))
            .filter(|record| record.installed)
            .ok_or_else(|| anyhow!("Mod {:?} is not installed", mod_name))?;

        let dependents: Vec<String> = Self::records(&ini)
            .into_iter()
            .filter(|m| m.installed && m.depends_on.iter().any(|d| d == mod_name))
            .map(|m| m.name)
            .collect();
        if !dependents.is_empty() {
            return Err(anyhow!(
                "Mod {:?} is required by {}; disable those first",
                mod_name,
                dependents.join(", ")
            )
            .into());
        }

        for key in self.manifest(mod_name)? {
            let path = join_key(&self.install_root, &key);
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(InstallError::fs(&path, e)),
            }
        }

        let backup_dir = self.backup_dir(mod_name);
        for key in read_list(&self.backup_list_path(mod_name))? {
            let backup = join_key(&backup_dir, &key);
            if !backup.is_file() {
                logger::log_error(
                    &format!("Backup of {} is missing for mod {:?}", key, mod_name),
                    Some("generic_mods"),
                );
                continue;
            }
            let target = join_key(&self.install_root, &key);
            move_file(&backup, &target).map_err(|e| InstallError::fs(&target, e))?;
        }

        let _ = fs::remove_dir_all(&backup_dir);
        let _ = fs::remove_file(self.backup_list_path(mod_name));
        let _ = fs::remove_file(self.manifest_path(mod_name));

        ModRecord {
            installed: false,
            depends_on: Vec::new(),
            ..record
        }
        .write_to(&mut ini);
        self.save_ini(&ini)?;
        logger::log_info(&format!("Disabled mod {:?}", mod_name), Some("generic_mods"));
        Ok(())
    }
}

/// Tracks destination writes of one mod during one install pass
#[derive(Debug)]
pub struct ModInstallSession {
    registry: GenericModsRegistry,
    mod_name: String,
    /// Relative paths with an original already in the backup folder
    backed_up: BTreeSet<String>,
    /// Relative paths this mod has written, including earlier runs
    written: BTreeSet<String>,
    touched: HashSet<PathBuf>,
}

impl ModInstallSession {
    pub fn mod_name(&self) -> &str {
        &self.mod_name
    }

    /// Call before writing `destination`. On the first touch an existing file
    /// is moved to the backup folder unless it was backed up by an earlier run.
    ///
    /// Backup failures are logged and do not stop the install.
    pub fn intercept(&mut self, destination: &Path) -> InstallResult<()> {
        if !self.touched.insert(destination.to_path_buf()) {
            return Ok(());
        }
        let Some(key) = relative_key(&self.registry.install_root, destination) else {
            crate::log_debug!(
                format!("{:?} is outside the game folder, not tracked", destination),
                "generic_mods"
            );
            return Ok(());
        };

        if destination.is_file() && !self.backed_up.contains(&key) && !self.written.contains(&key) {
            let backup = join_key(&self.registry.backup_dir(&self.mod_name), &key);
            match move_file(destination, &backup) {
                Ok(()) => {
                    crate::log_debug!(format!("Backed up {}", key), "generic_mods");
                    self.backed_up.insert(key.clone());
                }
                Err(e) => logger::log_error(
                    &format!("Failed to back up {:?}: {}", destination, e),
                    Some("generic_mods"),
                ),
            }
        }
        self.written.insert(key);
        Ok(())
    }

    /// Clears `target` ahead of a clean reinstall. Files an earlier run of this
    /// mod wrote are deleted and dropped from the manifest; anything else goes
    /// through [`Self::intercept`] so the original lands in the backup folder.
    pub fn remove_existing(&mut self, target: &Path) -> InstallResult<()> {
        let owned = relative_key(&self.registry.install_root, target)
            .filter(|key| self.written.contains(key) && !self.touched.contains(target));
        let Some(key) = owned else {
            return self.intercept(target);
        };
        match fs::remove_file(target) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(InstallError::fs(target, e)),
        }
        crate::log_debug!(format!("Removed {} left by an earlier install", key), "generic_mods");
        self.written.remove(&key);
        Ok(())
    }

    /// Writes the manifest and backup list, then marks the mod installed
    pub fn finish(self) -> InstallResult<ModRecord> {
        let registry = &self.registry;
        write_list(&registry.manifest_path(&self.mod_name), &self.written)?;
        write_list(&registry.backup_list_path(&self.mod_name), &self.backed_up)?;
        let record = registry.register(&self.mod_name, &self.written)?;
        logger::log_info(
            &format!(
                "Registered mod {:?}: {} files, {} backups",
                self.mod_name,
                self.written.len(),
                self.backed_up.len()
            ),
            Some("generic_mods"),
        );
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixture {
        temp: tempfile::TempDir,
        root: PathBuf,
        registry: GenericModsRegistry,
    }

    fn fixture() -> Fixture {
        let temp = tempfile::tempdir().unwrap();
        let root = temp.path().join("game");
        fs::create_dir_all(root.join("content")).unwrap();
        let registry = GenericModsRegistry::new(&root, root.join("mods"));
        Fixture {
            temp,
            root,
            registry,
        }
    }

    fn install(registry: &GenericModsRegistry, name: &str, files: &[(&Path, &[u8])]) {
        let mut session = registry.begin_session(name).unwrap();
        for (path, data) in files {
            session.intercept(path).unwrap();
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, data).unwrap();
        }
        session.finish().unwrap();
    }

    #[test]
    fn test_disable_restores_original_bytes() {
        let f = fixture();
        let file = f.root.join("content").join("file.txt");
        let added = f.root.join("content").join("new.txt");
        fs::write(&file, b"original").unwrap();

        install(&f.registry, "(Car) mycar", &[(&file, b"modded"), (&added, b"extra")]);
        assert_eq!(fs::read(&file).unwrap(), b"modded");
        assert_eq!(
            f.registry.manifest("(Car) mycar").unwrap(),
            vec!["content/file.txt".to_string(), "content/new.txt".to_string()]
        );

        f.registry.disable("(Car) mycar").unwrap();
        assert_eq!(fs::read(&file).unwrap(), b"original");
        assert!(!added.exists());
        assert!(f.registry.enabled_mods().unwrap().is_empty());
    }

    #[test]
    fn test_reinstall_keeps_first_backup() {
        let f = fixture();
        let file = f.root.join("content").join("file.txt");
        fs::write(&file, b"original").unwrap();

        install(&f.registry, "(Track) spa", &[(&file, b"v1")]);
        install(&f.registry, "(Track) spa", &[(&file, b"v2")]);

        let backup = f.registry.backup_dir("(Track) spa").join("content").join("file.txt");
        assert_eq!(fs::read(backup).unwrap(), b"original");
        f.registry.disable("(Track) spa").unwrap();
        assert_eq!(fs::read(&file).unwrap(), b"original");
    }

    #[test]
    fn test_clean_reinstall_drops_files_of_previous_version() {
        let f = fixture();
        let file = f.root.join("content").join("file.txt");
        let dropped = f.root.join("content").join("old.txt");
        fs::write(&file, b"original").unwrap();
        install(&f.registry, "(Car) mycar", &[(&file, b"v1"), (&dropped, b"v1 only")]);

        let mut session = f.registry.begin_session("(Car) mycar").unwrap();
        for target in [&file, &dropped] {
            session.remove_existing(target).unwrap();
        }
        assert!(!file.exists());
        assert!(!dropped.exists());
        session.intercept(&file).unwrap();
        fs::write(&file, b"v2").unwrap();
        session.finish().unwrap();

        assert_eq!(
            f.registry.manifest("(Car) mycar").unwrap(),
            vec!["content/file.txt".to_string()]
        );
        f.registry.disable("(Car) mycar").unwrap();
        assert_eq!(fs::read(&file).unwrap(), b"original");
        assert!(!dropped.exists());
    }

    #[test]
    fn test_overriding_mod_blocks_disable() {
        let f = fixture();
        let file = f.root.join("content").join("shared.ini");
        install(&f.registry, "(Car) a", &[(&file, b"a")]);
        install(&f.registry, "(Car) b", &[(&file, b"b")]);

        let enabled = f.registry.enabled_mods().unwrap();
        assert_eq!(enabled.len(), 2);
        assert_eq!(enabled[0].name, "(Car) a");
        assert_eq!(enabled[1].depends_on, vec!["(Car) a".to_string()]);

        assert!(f.registry.disable("(Car) a").is_err());
        f.registry.disable("(Car) b").unwrap();
        assert_eq!(fs::read(&file).unwrap(), b"a");
        f.registry.disable("(Car) a").unwrap();
        assert!(!file.exists());
    }

    #[test]
    fn test_paths_outside_root_are_not_tracked() {
        let f = fixture();
        let outside = f.temp.path().join("elsewhere.txt");
        let mut session = f.registry.begin_session("(Font) x").unwrap();
        session.intercept(&outside).unwrap();
        session.finish().unwrap();
        assert!(f.registry.manifest("(Font) x").unwrap().is_empty());
    }

    #[test]
    fn test_move_file_creates_parents() {
        let temp = tempfile::tempdir().unwrap();
        let src = temp.path().join("a.txt");
        let dst = temp.path().join("deep").join("b.txt");
        fs::write(&src, b"x").unwrap();
        move_file(&src, &dst).unwrap();
        assert!(!src.exists());
        assert_eq!(fs::read(dst).unwrap(), b"x");
    }
}
