//! Where each kind of content lives in a game installation, and what is
//! already there.

use std::cmp::Ordering;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::anyhow;
use serde::Serialize;
use serde_json::Value;

use crate::entry::{ContentEntry, ContentKind};
use crate::error::{InstallError, InstallResult};
use crate::scanner::{self, is_valid_id};

/// Install location of `entry` below `content_root`.
///
/// Skins need a car id: the one found next to the skin, else `car_id_hint`.
pub fn destination_for(
    entry: &ContentEntry,
    content_root: &Path,
    car_id_hint: Option<&str>,
) -> InstallResult<PathBuf> {
    if !is_valid_id(&entry.id) {
        return Err(anyhow!("{:?} is not a usable folder name", entry.id).into());
    }
    let content = content_root.join("content");
    let id = entry.id.as_str();
    Ok(match &entry.kind {
        ContentKind::Car => content.join("cars").join(id),
        ContentKind::Track => content.join("tracks").join(id),
        ContentKind::Showroom => content.join("showroom").join(id),
        ContentKind::Weather => content.join("weather").join(id),
        ContentKind::CarSkin { car_id } => {
            let car_id = car_id
                .as_deref()
                .or(car_id_hint)
                .filter(|car| is_valid_id(car))
                .ok_or_else(|| anyhow!("Can't find which car the skin \"{}\" is for", entry.name))?;
            content.join("cars").join(car_id).join("skins").join(id)
        }
        ContentKind::Font { .. } => content.join("fonts").join(format!("{}.txt", id)),
        ContentKind::PpFilter => content_root
            .join("system")
            .join("cfg")
            .join("ppfilters")
            .join(format!("{}.ini", id)),
        ContentKind::DriverModel => content.join("driver").join(format!("{}.kn5", id)),
    })
}

/// Metadata file of installed content that carries its name and version
pub fn ui_file_for(kind: &ContentKind, destination: &Path) -> Option<PathBuf> {
    let candidate = match kind {
        ContentKind::Car => destination.join("ui").join("ui_car.json"),
        ContentKind::Showroom => destination.join("ui").join("ui_showroom.json"),
        ContentKind::CarSkin { .. } => destination.join("ui_skin.json"),
        ContentKind::Weather => destination.join("weather.ini"),
        ContentKind::Track => {
            let ui = destination.join("ui");
            let direct = ui.join("ui_track.json");
            if direct.is_file() {
                direct
            } else {
                let mut layouts: Vec<PathBuf> = fs::read_dir(&ui)
                    .ok()?
                    .flatten()
                    .map(|item| item.path().join("ui_track.json"))
                    .filter(|path| path.is_file())
                    .collect();
                layouts.sort();
                layouts.into_iter().next()?
            }
        }
        ContentKind::Font { .. } | ContentKind::PpFilter | ContentKind::DriverModel => return None,
    };
    candidate.is_file().then_some(candidate)
}

/// What is installed at a descriptor's destination
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExistingContent {
    pub name: Option<String>,
    pub version: Option<String>,
}

/// `None` when nothing is installed at `destination`
pub fn inspect_existing(kind: &ContentKind, destination: &Path) -> Option<ExistingContent> {
    if !destination.exists() {
        return None;
    }
    let Some(ui_file) = ui_file_for(kind, destination) else {
        return Some(ExistingContent::default());
    };
    let Ok(data) = fs::read(&ui_file) else {
        return Some(ExistingContent::default());
    };
    let existing = match kind {
        ContentKind::Weather => ExistingContent {
            name: scanner::weather_name(&data).ok().flatten(),
            version: None,
        },
        ContentKind::CarSkin { .. } => scanner::parse_ui_json(&data, "skinname")
            .map(|info| ExistingContent {
                name: info.name,
                version: info.version,
            })
            .unwrap_or_default(),
        _ => scanner::parse_ui_json(&data, "name")
            .map(|info| ExistingContent {
                name: info.name,
                version: info.version,
            })
            .unwrap_or_default(),
    };
    Some(existing)
}

fn parse_version(raw: &str) -> Option<semver::Version> {
    let trimmed = raw.trim().trim_start_matches(['v', 'V']);
    if let Ok(version) = semver::Version::parse(trimmed) {
        return Some(version);
    }
    // "1.2" and "3" are common in content metadata
    let parts: Vec<&str> = trimmed.split('.').collect();
    if parts.is_empty() || parts.len() > 3 || parts.iter().any(|p| p.is_empty() || !p.chars().all(|c| c.is_ascii_digit())) {
        return None;
    }
    let mut padded = parts.clone();
    padded.resize(3, "0");
    semver::Version::parse(&padded.join(".")).ok()
}

/// Compares versions as semver when both parse, as plain strings otherwise.
///
/// `None` when either side is unknown.
pub fn is_newer_version(candidate: Option<&str>, installed: Option<&str>) -> Option<bool> {
    let (candidate, installed) = (candidate?, installed?);
    let ordering = match (parse_version(candidate), parse_version(installed)) {
        (Some(a), Some(b)) => a.cmp(&b),
        _ => candidate.trim().cmp(installed.trim()),
    };
    Some(ordering == Ordering::Greater)
}

/// Writes `version` into an installed UI JSON file, keeping every other field
pub fn sync_ui_version(ui_file: &Path, version: &str) -> InstallResult<bool> {
    let data = fs::read(ui_file).map_err(|e| InstallError::fs(ui_file, e))?;
    let text = String::from_utf8_lossy(data.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(&data)).into_owned();
    let mut value: Value = serde_json::from_str(&text)
        .map_err(|e| anyhow!("Can't update version in {:?}: {}", ui_file, e))?;
    let Some(object) = value.as_object_mut() else {
        return Ok(false);
    };
    if object.get("version").and_then(Value::as_str) == Some(version) {
        return Ok(false);
    }
    object.insert("version".to_string(), Value::String(version.to_string()));
    let text = serde_json::to_string_pretty(&value).map_err(|e| anyhow!(e))?;
    fs::write(ui_file, text).map_err(|e| InstallError::fs(ui_file, e))?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_destinations() {
        let root = Path::new("/game");
        let car = ContentEntry::new(ContentKind::Car, "mycar", "mycar");
        assert_eq!(
            destination_for(&car, root, None).unwrap(),
            root.join("content").join("cars").join("mycar")
        );
        let filter = ContentEntry::new(ContentKind::PpFilter, "ppfilters/vivid.ini", "vivid");
        assert_eq!(
            destination_for(&filter, root, None).unwrap(),
            root.join("system").join("cfg").join("ppfilters").join("vivid.ini")
        );
    }

    #[test]
    fn test_skin_destination_needs_car() {
        let root = Path::new("/game");
        let orphan = ContentEntry::new(ContentKind::CarSkin { car_id: None }, "red", "red");
        assert!(destination_for(&orphan, root, None).is_err());
        assert_eq!(
            destination_for(&orphan, root, Some("mycar")).unwrap(),
            root.join("content").join("cars").join("mycar").join("skins").join("red")
        );
        let known = ContentEntry::new(
            ContentKind::CarSkin {
                car_id: Some("other".into()),
            },
            "other/skins/red",
            "red",
        );
        assert!(destination_for(&known, root, Some("mycar"))
            .unwrap()
            .ends_with("other/skins/red"));
    }

    #[test]
    fn test_inspect_existing_car() {
        let temp = tempfile::tempdir().unwrap();
        let destination = temp.path().join("mycar");
        assert_eq!(inspect_existing(&ContentKind::Car, &destination), None);

        fs::create_dir_all(destination.join("ui")).unwrap();
        fs::write(
            destination.join("ui").join("ui_car.json"),
            br#"{"name":"Old Car","version":"0.9"}"#,
        )
        .unwrap();
        let existing = inspect_existing(&ContentKind::Car, &destination).unwrap();
        assert_eq!(existing.name.as_deref(), Some("Old Car"));
        assert_eq!(existing.version.as_deref(), Some("0.9"));
    }

    #[test]
    fn test_track_layout_ui_file() {
        let temp = tempfile::tempdir().unwrap();
        let layout = temp.path().join("ui").join("gp");
        fs::create_dir_all(&layout).unwrap();
        fs::write(layout.join("ui_track.json"), b"{}").unwrap();
        assert_eq!(
            ui_file_for(&ContentKind::Track, temp.path()),
            Some(layout.join("ui_track.json"))
        );
    }

    #[test]
    fn test_version_comparison() {
        assert_eq!(is_newer_version(Some("1.10"), Some("1.9")), Some(true));
        assert_eq!(is_newer_version(Some("v2.0.0"), Some("2.0")), Some(false));
        assert_eq!(is_newer_version(Some("beta"), Some("alpha")), Some(true));
        assert_eq!(is_newer_version(Some("1.0"), None), None);
    }

    #[test]
    fn test_sync_ui_version() {
        let temp = tempfile::tempdir().unwrap();
        let file = temp.path().join("ui_car.json");
        fs::write(&file, br#"{"name":"Car","version":"1.0","tags":["a"]}"#).unwrap();
        assert!(sync_ui_version(&file, "1.1").unwrap());
        assert!(!sync_ui_version(&file, "1.1").unwrap());
        let value: Value = serde_json::from_slice(&fs::read(&file).unwrap()).unwrap();
        assert_eq!(value["version"], "1.1");
        assert_eq!(value["tags"][0], "a");
    }
}
