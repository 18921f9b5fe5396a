//! Content detection over a source's directory tree.
//!
//! Folders are visited breadth-first. Each folder is tested against the
//! folder rules in priority order (car, track, showroom, weather, skin); a
//! folder claimed by a rule is a package root and its subtree is not visited.
//! Unclaimed folders have their files tested against the single-file rules
//! (font, PP filter, driver model) before their children are queued.
//!
//! Solid sources defer reads. A rule that needs unavailable bytes marks the
//! round as incomplete; [`detect_entries`] then loads the pending entries and
//! scans once more.

pub mod icon;
mod metadata;
pub mod tree;

use std::collections::VecDeque;
use std::time::Instant;

use crate::archive::{ArchiveBackend, ReadOutcome};
use crate::entry::{ContentEntry, ContentKind};
use crate::error::{InstallError, InstallResult};
use crate::logger;
use crate::task_control::TaskControl;

pub use metadata::{parse_ui_json, weather_name, UiInfo};
use tree::{DirectoryNode, FileNode};

const FONT_EXTENSION: &str = ".txt";
const FONT_BITMAP_EXTENSIONS: &[&str] = &["bmp", "png"];
const PP_FILTER_SECTIONS: &[&str] = &["ABOUT", "TONEMAPPING", "COLOR", "DOF", "VIGNETTING"];

/// Result of one breadth-first pass
#[derive(Debug, Default)]
pub struct ScanOutcome {
    pub entries: Vec<ContentEntry>,
    /// Some rule needed bytes that were deferred by a solid source
    pub missing_content: bool,
    /// Folders that looked like packages but had unusable metadata
    pub problems: Vec<String>,
}

enum Classify {
    /// Bytes are not available yet
    Missing(String),
    /// Metadata is unusable; the folder yields no package
    Failed(String),
    /// Reading cannot continue at all
    Fatal(InstallError),
}

impl From<InstallError> for Classify {
    fn from(err: InstallError) -> Self {
        match err {
            InstallError::MissingContent(key) => Classify::Missing(key),
            InstallError::Cancelled
            | InstallError::PasswordRequired
            | InstallError::PasswordIncorrect
            | InstallError::UnsupportedContainer(_) => Classify::Fatal(err),
            other => Classify::Failed(other.to_string()),
        }
    }
}

type RuleResult = Result<Option<ContentEntry>, Classify>;

/// Usable as a folder or file name under the content directories
pub fn is_valid_id(id: &str) -> bool {
    !id.is_empty()
        && id.trim() == id
        && id != "."
        && id != ".."
        && !id
            .chars()
            .any(|c| c.is_control() || matches!(c, '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*'))
}

struct Queued<'t> {
    node: &'t DirectoryNode,
    depth: usize,
    parent: Option<&'t str>,
    grandparent: Option<&'t str>,
}

struct Scanner<'a> {
    backend: &'a mut dyn ArchiveBackend,
    base_id: Option<&'a str>,
}

impl<'a> Scanner<'a> {
    fn read(&mut self, file: &FileNode) -> Result<Vec<u8>, Classify> {
        match self.backend.read_entry(&file.key)? {
            ReadOutcome::Ready(data) => Ok(data),
            ReadOutcome::Deferred => Err(Classify::Missing(file.key.clone())),
        }
    }

    /// Best-effort read for previews; deferred or failing reads give `None`
    fn read_optional(&mut self, file: Option<&FileNode>) -> Option<Vec<u8>> {
        self.backend.read_entry(&file?.key).ok()?.into_ready()
    }

    /// Folder name, or the source-derived fallback for the root
    fn folder_id(&self, dir: &DirectoryNode) -> Option<String> {
        dir.dir_name()
            .or(self.base_id)
            .map(str::to_string)
            .filter(|id| is_valid_id(id))
    }

    fn require_id(id: Option<String>, kind: &str) -> Result<String, Classify> {
        id.filter(|id| is_valid_id(id))
            .ok_or_else(|| Classify::Failed(format!("Can't determine {} id", kind)))
    }

    fn car(&mut self, dir: &DirectoryNode) -> RuleResult {
        let Some(ui_file) = dir.file_at("ui/ui_car.json") else {
            return Ok(None);
        };
        // Preview goes first: a deferred description read must not hide it from the same pass
        let icon = self.read_optional(dir.file_at("ui/badge.png"));
        let data = self.read(ui_file)?;
        let info = parse_ui_json(&data, "name").map_err(Classify::Failed)?;

        let id = match dir.dir_name() {
            Some(name) => Some(name.to_string()),
            None => sound_bank_id(dir).or_else(|| self.base_id.map(str::to_string)),
        };
        let id = Self::require_id(id, "car")?;

        Ok(Some(
            ContentEntry::new(ContentKind::Car, dir.key.clone(), id)
                .with_name(info.name)
                .with_version(info.version)
                .with_author(info.author)
                .with_icon(icon),
        ))
    }

    fn track(&mut self, dir: &DirectoryNode) -> RuleResult {
        let Some(ui) = dir.directory("ui") else {
            return Ok(None);
        };
        // Multi-layout tracks keep one description per layout folder
        let (ui_file, layout) = match ui.file("ui_track.json") {
            Some(file) => (file, ui),
            None => match ui
                .directories()
                .find_map(|layout| layout.file("ui_track.json").map(|file| (file, layout)))
            {
                Some(found) => found,
                None => return Ok(None),
            },
        };
        let icon = match layout.file("outline.png") {
            Some(file) => self.read_optional(Some(file)),
            None => self.read_optional(layout.file("preview.png")),
        };
        let data = self.read(ui_file)?;
        let info = parse_ui_json(&data, "name").map_err(Classify::Failed)?;

        let id = match dir.dir_name() {
            Some(name) => Some(name.to_string()),
            None => largest_kn5(dir)
                .map(|file| file.stem().to_string())
                .or_else(|| self.base_id.map(str::to_string)),
        };
        let id = Self::require_id(id, "track")?;

        Ok(Some(
            ContentEntry::new(ContentKind::Track, dir.key.clone(), id)
                .with_name(info.name)
                .with_version(info.version)
                .with_author(info.author)
                .with_icon(icon),
        ))
    }

    fn showroom(&mut self, dir: &DirectoryNode) -> RuleResult {
        let ui_file = dir.file_at("ui/ui_showroom.json");
        let own_name = dir.dir_name().or(self.base_id);
        let has_model = own_name
            .map(|name| {
                dir.files()
                    .any(|file| file.has_extension(".kn5") && file.stem().eq_ignore_ascii_case(name))
            })
            .unwrap_or(false);
        if ui_file.is_none() && !(dir.has_file("settings.ini") && has_model) {
            return Ok(None);
        }

        let icon = self.read_optional(dir.file("preview.jpg"));
        let info = match ui_file {
            Some(file) => {
                let data = self.read(file)?;
                parse_ui_json(&data, "name").map_err(Classify::Failed)?
            }
            None => UiInfo::default(),
        };
        let id = match dir.dir_name() {
            Some(name) => Some(name.to_string()),
            None => largest_kn5(dir)
                .map(|file| file.stem().to_string())
                .or_else(|| self.base_id.map(str::to_string)),
        };
        let id = Self::require_id(id, "showroom")?;

        Ok(Some(
            ContentEntry::new(ContentKind::Showroom, dir.key.clone(), id)
                .with_name(info.name)
                .with_version(info.version)
                .with_author(info.author)
                .with_icon(icon),
        ))
    }

    fn weather(&mut self, dir: &DirectoryNode) -> RuleResult {
        let Some(ini_file) = dir.file("weather.ini") else {
            return Ok(None);
        };
        let icon = self.read_optional(dir.file("preview.jpg"));
        let data = self.read(ini_file)?;
        let Some(name) = weather_name(&data).map_err(Classify::Failed)? else {
            return Ok(None);
        };
        let id = Self::require_id(self.folder_id(dir), "weather")?;

        Ok(Some(
            ContentEntry::new(ContentKind::Weather, dir.key.clone(), id)
                .with_name(Some(name))
                .with_icon(icon),
        ))
    }

    fn car_skin(&mut self, item: &Queued<'_>) -> RuleResult {
        let dir = item.node;
        let in_skins = item.parent.map(|p| p.eq_ignore_ascii_case("skins")).unwrap_or(false);
        let ui_file = dir.file("ui_skin.json");
        let looks_like_skin = in_skins && (dir.has_file("livery.png") || dir.has_file("preview.jpg"));
        if ui_file.is_none() && !looks_like_skin {
            return Ok(None);
        }

        let icon = self.read_optional(dir.file("livery.png"));
        let info = match ui_file {
            Some(file) => {
                let data = self.read(file)?;
                parse_ui_json(&data, "skinname").map_err(Classify::Failed)?
            }
            None => UiInfo::default(),
        };
        let car_id = if in_skins {
            item.grandparent.map(str::to_string).filter(|id| is_valid_id(id))
        } else {
            None
        };
        let id = Self::require_id(self.folder_id(dir), "skin")?;

        Ok(Some(
            ContentEntry::new(ContentKind::CarSkin { car_id }, dir.key.clone(), id)
                .with_name(info.name)
                .with_author(info.author)
                .with_icon(icon),
        ))
    }

    fn classify_directory(&mut self, item: &Queued<'_>) -> RuleResult {
        let dir = item.node;
        if let Some(found) = self.car(dir)? {
            return Ok(Some(found));
        }
        if let Some(found) = self.track(dir)? {
            return Ok(Some(found));
        }
        if let Some(found) = self.showroom(dir)? {
            return Ok(Some(found));
        }
        if let Some(found) = self.weather(dir)? {
            return Ok(Some(found));
        }
        self.car_skin(item)
    }

    fn font(&mut self, dir: &DirectoryNode, file: &FileNode) -> RuleResult {
        if !dir.name_is("fonts") || !file.has_extension(FONT_EXTENSION) {
            return Ok(None);
        }
        let Some(bitmap) = FONT_BITMAP_EXTENSIONS
            .iter()
            .find_map(|ext| dir.file(&format!("{}.{}", file.stem(), ext)))
        else {
            return Ok(None);
        };
        let id = Self::require_id(Some(file.stem().to_string()), "font")?;
        let data = self.read(bitmap)?;
        let icon = icon::render_font_icon(&data);

        Ok(Some(
            ContentEntry::new(
                ContentKind::Font {
                    bitmap_key: bitmap.key.clone(),
                },
                file.key.clone(),
                id,
            )
            .with_icon(icon),
        ))
    }

    fn pp_filter(&mut self, dir: &DirectoryNode, file: &FileNode) -> RuleResult {
        if !file.has_extension(".ini") {
            return Ok(None);
        }
        let in_filters = dir.name_is("ppfilters");
        let lone_file = dir.is_root() && dir.files().count() == 1 && dir.directories().next().is_none();
        if !in_filters && !lone_file {
            return Ok(None);
        }
        if !in_filters {
            let data = self.read(file)?;
            let Ok(ini) = ini::Ini::load_from_str(&String::from_utf8_lossy(&data)) else {
                return Ok(None);
            };
            let known = ini
                .sections()
                .flatten()
                .any(|section| PP_FILTER_SECTIONS.contains(&section.to_uppercase().as_str()));
            if !known {
                return Ok(None);
            }
        }
        let id = Self::require_id(Some(file.stem().to_string()), "filter")?;
        Ok(Some(ContentEntry::new(ContentKind::PpFilter, file.key.clone(), id)))
    }

    fn driver_model(&mut self, dir: &DirectoryNode, file: &FileNode) -> RuleResult {
        if !dir.name_is("driver") || !file.has_extension(".kn5") {
            return Ok(None);
        }
        let id = Self::require_id(Some(file.stem().to_string()), "driver model")?;
        Ok(Some(ContentEntry::new(ContentKind::DriverModel, file.key.clone(), id)))
    }

    fn classify_file(&mut self, dir: &DirectoryNode, file: &FileNode) -> RuleResult {
        if let Some(found) = self.font(dir, file)? {
            return Ok(Some(found));
        }
        if let Some(found) = self.pp_filter(dir, file)? {
            return Ok(Some(found));
        }
        self.driver_model(dir, file)
    }
}

/// Car id from `sfx/<id>.bank`, used when the car folder itself is the source root
fn sound_bank_id(dir: &DirectoryNode) -> Option<String> {
    dir.directory("sfx")?
        .files()
        .filter(|file| file.has_extension(".bank") && !file.name.eq_ignore_ascii_case("common.bank"))
        .map(|file| file.stem().to_string())
        .next()
}

/// Largest model file; on equal sizes the later one wins
fn largest_kn5(dir: &DirectoryNode) -> Option<&FileNode> {
    dir.files()
        .filter(|file| file.has_extension(".kn5"))
        .fold(None, |best: Option<&FileNode>, file| match best {
            Some(best) if best.size > file.size => Some(best),
            _ => Some(file),
        })
}

/// One breadth-first pass over the source
pub fn scan_round(
    backend: &mut dyn ArchiveBackend,
    base_id: Option<&str>,
    max_depth: usize,
    control: &TaskControl,
) -> InstallResult<ScanOutcome> {
    let started = Instant::now();
    let entries = backend.list_entries()?;
    let tree = DirectoryNode::build(&entries);
    let mut scanner = Scanner { backend, base_id };
    let mut outcome = ScanOutcome::default();

    let mut queue = VecDeque::new();
    queue.push_back(Queued {
        node: &tree,
        depth: 0,
        parent: None,
        grandparent: None,
    });

    while let Some(item) = queue.pop_front() {
        control.ensure_not_cancelled("scanning")?;
        let place = if item.node.is_root() { "<root>" } else { item.node.key.as_str() };

        match scanner.classify_directory(&item) {
            Ok(Some(found)) => {
                crate::log_debug!(
                    format!("{} \"{}\" at {}", found.kind.label(), found.id, place),
                    "scanner"
                );
                outcome.entries.push(found);
                continue;
            }
            Ok(None) => {}
            Err(Classify::Missing(key)) => {
                crate::log_debug!(format!("Waiting for {} ({})", key, place), "scanner");
                outcome.missing_content = true;
                continue;
            }
            Err(Classify::Failed(reason)) => {
                logger::log_info(&format!("Skipping {}: {}", place, reason), Some("scanner"));
                outcome.problems.push(format!("{}: {}", place, reason));
                continue;
            }
            Err(Classify::Fatal(e)) => return Err(e),
        }

        for file in item.node.files() {
            match scanner.classify_file(item.node, file) {
                Ok(Some(found)) => outcome.entries.push(found),
                Ok(None) => {}
                Err(Classify::Missing(_)) => outcome.missing_content = true,
                Err(Classify::Failed(reason)) => outcome.problems.push(format!("{}: {}", file.key, reason)),
                Err(Classify::Fatal(e)) => return Err(e),
            }
        }

        if item.depth < max_depth {
            let parent = item.node.dir_name();
            for child in item.node.directories() {
                queue.push_back(Queued {
                    node: child,
                    depth: item.depth + 1,
                    parent,
                    grandparent: item.parent,
                });
            }
        }
    }

    crate::log_debug!(
        format!(
            "[TIMING] Scan round completed in {:.2}ms: {} packages, missing content: {}",
            started.elapsed().as_secs_f64() * 1000.0,
            outcome.entries.len(),
            outcome.missing_content
        ),
        "scanner"
    );
    Ok(outcome)
}

/// Scan, and if some reads were deferred, load them in one pass and scan once more
pub fn detect_entries(
    backend: &mut dyn ArchiveBackend,
    base_id: Option<&str>,
    max_depth: usize,
    control: &TaskControl,
) -> InstallResult<Vec<ContentEntry>> {
    let first = scan_round(backend, base_id, max_depth, control)?;
    if !first.missing_content {
        return Ok(first.entries);
    }

    let started = Instant::now();
    backend.load_pending(control)?;
    crate::log_debug!(
        format!(
            "[TIMING] Deferred entries loaded in {:.2}ms",
            started.elapsed().as_secs_f64() * 1000.0
        ),
        "scanner"
    );

    let second = scan_round(backend, base_id, max_depth, control)?;
    if second.missing_content && second.entries.is_empty() {
        return Err(InstallError::MissingContent(
            "required files stayed unavailable after loading".to_string(),
        ));
    }
    Ok(second.entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::{
        BackendKind, CopyCallback, CopyStats, FileEntry, PasswordState, ProgressSink, SolidCache,
    };
    use std::collections::{BTreeSet, HashMap};
    use std::path::Path;
    use std::sync::Arc;

    /// In-memory source; `solid` routes reads through a [`SolidCache`]
    struct MemoryBackend {
        files: Vec<(String, Vec<u8>)>,
        solid: Option<SolidCache>,
    }

    impl MemoryBackend {
        fn new(files: &[(&str, &[u8])]) -> Self {
            Self {
                files: files.iter().map(|(k, v)| (k.to_string(), v.to_vec())).collect(),
                solid: None,
            }
        }

        fn solid(mut self) -> Self {
            self.solid = Some(SolidCache::new());
            self
        }

        fn passes(&self) -> usize {
            self.solid.as_ref().map(|c| c.passes()).unwrap_or(0)
        }
    }

    impl ArchiveBackend for MemoryBackend {
        fn kind(&self) -> BackendKind {
            BackendKind::Directory
        }
        fn source(&self) -> &Path {
            Path::new("memory")
        }
        fn password_state(&self) -> PasswordState {
            PasswordState::NotRequired
        }
        fn try_set_password(&mut self, _password: &str, _control: &TaskControl) -> InstallResult<bool> {
            Ok(true)
        }
        fn list_entries(&mut self) -> InstallResult<Arc<Vec<FileEntry>>> {
            Ok(Arc::new(
                self.files
                    .iter()
                    .map(|(k, v)| FileEntry::new(k.clone(), v.len() as u64))
                    .collect(),
            ))
        }
        fn read_entry(&mut self, key: &str) -> InstallResult<ReadOutcome> {
            if let Some(cache) = self.solid.as_mut() {
                return cache.read(key);
            }
            self.files
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(key))
                .map(|(_, v)| ReadOutcome::Ready(v.clone()))
                .ok_or_else(|| InstallError::MissingContent(key.to_string()))
        }
        fn load_pending(&mut self, _control: &TaskControl) -> InstallResult<()> {
            let files: HashMap<String, Vec<u8>> =
                self.files.iter().map(|(k, v)| (k.to_lowercase(), v.clone())).collect();
            if let Some(cache) = self.solid.as_mut() {
                cache.load_with(|wanted: &BTreeSet<String>| {
                    Ok(wanted
                        .iter()
                        .filter_map(|k| files.get(k).map(|v| (k.clone(), v.clone())))
                        .collect())
                })?;
            }
            Ok(())
        }
        fn copy_entries(
            &mut self,
            _callback: &mut CopyCallback<'_>,
            _progress: &mut ProgressSink<'_>,
            _control: &TaskControl,
        ) -> InstallResult<CopyStats> {
            Ok(CopyStats::default())
        }
    }

    fn detect(backend: &mut MemoryBackend, base_id: Option<&str>) -> Vec<ContentEntry> {
        detect_entries(backend, base_id, 15, &TaskControl::new()).unwrap()
    }

    #[test]
    fn test_single_car() {
        let mut backend = MemoryBackend::new(&[
            ("mycar/ui/ui_car.json", br#"{"name":"My Car","version":"1.0"}"#),
            ("mycar/data.acd", b"acd"),
        ]);
        let found = detect(&mut backend, None);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].kind, ContentKind::Car);
        assert_eq!(found[0].id, "mycar");
        assert_eq!(found[0].name, "My Car");
        assert_eq!(found[0].version.as_deref(), Some("1.0"));
        assert_eq!(found[0].entry_path, "mycar");
    }

    #[test]
    fn test_car_wins_over_track() {
        let mut backend = MemoryBackend::new(&[
            ("both/ui/ui_car.json", br#"{"name":"Car"}"#),
            ("both/ui/ui_track.json", br#"{"name":"Track"}"#),
        ]);
        let found = detect(&mut backend, None);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].kind, ContentKind::Car);
    }

    #[test]
    fn test_no_nested_packages_inside_claimed_root() {
        let mut backend = MemoryBackend::new(&[
            ("mycar/ui/ui_car.json", b"{}"),
            ("mycar/skins/red/ui_skin.json", br#"{"skinname":"Red"}"#),
            ("mycar/extra/ui/ui_track.json", b"{}"),
        ]);
        let found = detect(&mut backend, None);
        assert_eq!(found.len(), 1);
    }

    #[test]
    fn test_font_without_bitmap_is_ignored() {
        let mut backend = MemoryBackend::new(&[("fonts/aaa.fon", b"x"), ("fonts/bbb.txt", b"x")]);
        assert!(detect(&mut backend, None).is_empty());
    }

    #[test]
    fn test_font_with_bitmap() {
        let mut backend = MemoryBackend::new(&[("fonts/digits.txt", b"0 0 8 8"), ("fonts/digits.bmp", b"not really")]);
        let found = detect(&mut backend, None);
        assert_eq!(found.len(), 1);
        assert_eq!(
            found[0].kind,
            ContentKind::Font {
                bitmap_key: "fonts/digits.bmp".into()
            }
        );
        assert_eq!(found[0].entry_path, "fonts/digits.txt");
        assert!(found[0].icon.is_none(), "Undecodable bitmap must not fail detection");
    }

    #[test]
    fn test_root_car_uses_sound_bank_id() {
        let mut backend = MemoryBackend::new(&[
            ("ui/ui_car.json", b"{}"),
            ("sfx/common.bank", b"x"),
            ("sfx/ks_fast.bank", b"x"),
        ]);
        let found = detect(&mut backend, Some("download"));
        assert_eq!(found[0].id, "ks_fast");
    }

    #[test]
    fn test_root_track_uses_largest_model() {
        let mut backend = MemoryBackend::new(&[
            ("ui/ui_track.json", br#"{"name":"Nice Track"}"#),
            ("small.kn5", b"1"),
            ("main_track.kn5", b"12345"),
        ]);
        let found = detect(&mut backend, Some("archive"));
        assert_eq!(found[0].kind, ContentKind::Track);
        assert_eq!(found[0].id, "main_track");
    }

    #[test]
    fn test_track_with_layouts() {
        let mut backend = MemoryBackend::new(&[
            ("spa/ui/gp/ui_track.json", br#"{"name":"Spa GP"}"#),
            ("spa/ui/short/ui_track.json", br#"{"name":"Spa Short"}"#),
            ("spa/spa.kn5", b"x"),
        ]);
        let found = detect(&mut backend, None);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, "spa");
        assert_eq!(found[0].name, "Spa GP");
    }

    #[test]
    fn test_showroom_by_model_and_settings() {
        let mut backend = MemoryBackend::new(&[("studio/studio.kn5", b"x"), ("studio/settings.ini", b"[X]")]);
        let found = detect(&mut backend, None);
        assert_eq!(found[0].kind, ContentKind::Showroom);
        assert_eq!(found[0].id, "studio");
    }

    #[test]
    fn test_weather_requires_launcher_name() {
        let mut backend = MemoryBackend::new(&[
            ("fog/weather.ini", b"[LAUNCHER]\nNAME=Fog\n"),
            ("other/weather.ini", b"[CLOUDS]\nCOVER=1\n"),
        ]);
        let found = detect(&mut backend, None);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].name, "Fog");
    }

    #[test]
    fn test_skin_in_skins_folder_knows_its_car() {
        let mut backend = MemoryBackend::new(&[
            ("mycar/skins/red/livery.png", b"x"),
            ("mycar/skins/red/preview.jpg", b"x"),
        ]);
        let found = detect(&mut backend, None);
        assert_eq!(found.len(), 1);
        assert_eq!(
            found[0].kind,
            ContentKind::CarSkin {
                car_id: Some("mycar".into())
            }
        );
        assert_eq!(found[0].id, "red");
    }

    #[test]
    fn test_file_packages() {
        let mut backend = MemoryBackend::new(&[
            ("system/cfg/ppfilters/vivid.ini", b"[ABOUT]\nNAME=Vivid"),
            ("content/driver/helmet.kn5", b"x"),
        ]);
        let found = detect(&mut backend, None);
        let kinds: Vec<&ContentKind> = found.iter().map(|e| &e.kind).collect();
        assert!(kinds.contains(&&ContentKind::PpFilter));
        assert!(kinds.contains(&&ContentKind::DriverModel));
    }

    #[test]
    fn test_lone_filter_file() {
        let mut backend = MemoryBackend::new(&[("vivid.ini", b"[TONEMAPPING]\nFUNCTION=1")]);
        let found = detect(&mut backend, None);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, "vivid");
    }

    #[test]
    fn test_broken_metadata_is_recorded_and_siblings_continue() {
        let mut backend = MemoryBackend::new(&[
            ("broken/ui/ui_car.json", b"{ nope"),
            ("good/ui/ui_car.json", b"{}"),
        ]);
        let outcome = scan_round(&mut backend, None, 15, &TaskControl::new()).unwrap();
        assert_eq!(outcome.entries.len(), 1);
        assert_eq!(outcome.entries[0].id, "good");
        assert_eq!(outcome.problems.len(), 1);
    }

    #[test]
    fn test_solid_source_needs_exactly_one_pass() {
        let mut backend = MemoryBackend::new(&[
            ("a/ui/ui_car.json", br#"{"name":"A"}"#),
            ("b/ui/ui_car.json", br#"{"name":"B"}"#),
            ("c/weather.ini", b"[LAUNCHER]\nNAME=C\n"),
        ])
        .solid();

        let first = scan_round(&mut backend, None, 15, &TaskControl::new()).unwrap();
        assert!(first.missing_content);
        assert!(first.entries.is_empty());

        let found = detect(&mut backend, None);
        assert_eq!(found.len(), 3);
        assert_eq!(backend.passes(), 1);
    }

    #[test]
    fn test_depth_limit() {
        let mut backend = MemoryBackend::new(&[("a/b/c/mycar/ui/ui_car.json", b"{}")]);
        assert!(detect_entries(&mut backend, None, 2, &TaskControl::new())
            .unwrap()
            .is_empty());
        assert_eq!(detect(&mut backend, None).len(), 1);
    }

    #[test]
    fn test_cancelled_scan() {
        let mut backend = MemoryBackend::new(&[("mycar/ui/ui_car.json", b"{}")]);
        let control = TaskControl::new();
        control.request_cancel();
        assert!(matches!(
            detect_entries(&mut backend, None, 15, &control),
            Err(InstallError::Cancelled)
        ));
    }

    #[test]
    fn test_valid_ids() {
        assert!(is_valid_id("ks_ferrari"));
        assert!(!is_valid_id(""));
        assert!(!is_valid_id(" padded"));
        assert!(!is_valid_id("a/b"));
        assert!(!is_valid_id(".."));
    }
}
