//! Job-wide actions offered next to the per-package options.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

use crate::entry::{ContentEntry, ContentKind};
use crate::error::InstallResult;
use crate::logger;

use super::execute::remove_paths;

static VERSIONED_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(.*?)[_-](v?\d+)$").expect("static regex"));

pub const REMOVE_OBSOLETE_VERSIONS: &str = "remove_obsolete_versions";

/// `("mycar", Some("v2"))` for `mycar_v2`, `("mycar", None)` for `mycar`
fn split_version(id: &str) -> (String, Option<String>) {
    match VERSIONED_ID.captures(id) {
        Some(caps) => (caps[1].to_lowercase(), Some(caps[2].to_lowercase())),
        None => (id.to_lowercase(), None),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExtraOption {
    pub id: String,
    pub display_name: String,
    pub description: String,
    /// Installed folders the action removes
    pub targets: Vec<PathBuf>,
}

impl ExtraOption {
    /// Runs before any package is copied
    pub fn run_pre(&self, recycle: bool) -> InstallResult<()> {
        match self.id.as_str() {
            REMOVE_OBSOLETE_VERSIONS => {
                let removed = remove_paths(&self.targets, recycle)?;
                logger::log_info(
                    &format!("Removed {} obsolete versions", removed),
                    Some("installer"),
                );
                Ok(())
            }
            other => {
                crate::log_debug!(format!("No pre-install action for {}", other), "installer");
                Ok(())
            }
        }
    }
}

fn kind_folder(kind: &ContentKind) -> Option<&'static str> {
    match kind {
        ContentKind::Car => Some("cars"),
        ContentKind::Track => Some("tracks"),
        _ => None,
    }
}

/// Other installed versions of `entry`: folders sharing its base id with another suffix
fn obsolete_siblings(entry: &ContentEntry, content_root: &Path) -> Vec<PathBuf> {
    let Some(folder) = kind_folder(&entry.kind) else {
        return Vec::new();
    };
    let (base, Some(suffix)) = split_version(&entry.id) else {
        return Vec::new();
    };
    let Ok(items) = fs::read_dir(content_root.join("content").join(folder)) else {
        return Vec::new();
    };
    let mut found: Vec<PathBuf> = items
        .flatten()
        .filter(|item| item.path().is_dir())
        .filter(|item| {
            let name = item.file_name().to_string_lossy().into_owned();
            match split_version(&name) {
                (other_base, Some(other_suffix)) => other_base == base && other_suffix != suffix,
                (other_base, None) => other_base == base,
            }
        })
        .map(|item| item.path())
        .collect();
    found.sort();
    found
}

/// Extra options that apply to this set of packages
pub fn compute_extra_options(entries: &[ContentEntry], content_root: &Path) -> Vec<ExtraOption> {
    let installing: BTreeSet<String> = entries.iter().map(|e| e.id.to_lowercase()).collect();
    let mut targets: Vec<PathBuf> = entries
        .iter()
        .flat_map(|entry| obsolete_siblings(entry, content_root))
        .filter(|path| {
            path.file_name()
                .map(|name| !installing.contains(&name.to_string_lossy().to_lowercase()))
                .unwrap_or(false)
        })
        .collect();
    targets.sort();
    targets.dedup();
    if targets.is_empty() {
        return Vec::new();
    }

    let names: Vec<String> = targets
        .iter()
        .filter_map(|path| path.file_name().map(|n| n.to_string_lossy().into_owned()))
        .collect();
    vec![ExtraOption {
        id: REMOVE_OBSOLETE_VERSIONS.to_string(),
        display_name: "Remove obsolete versions".to_string(),
        description: format!("Removes {}", names.join(", ")),
        targets,
    }]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_version() {
        assert_eq!(split_version("mycar_v2"), ("mycar".into(), Some("v2".into())));
        assert_eq!(split_version("track-2019"), ("track".into(), Some("2019".into())));
        assert_eq!(split_version("plain"), ("plain".into(), None));
    }

    #[test]
    fn test_obsolete_versions_found() {
        let temp = tempfile::tempdir().unwrap();
        let cars = temp.path().join("content").join("cars");
        for name in ["mycar", "mycar_v1", "mycar_v2", "othercar_v1"] {
            fs::create_dir_all(cars.join(name)).unwrap();
        }
        let entries = vec![ContentEntry::new(ContentKind::Car, "mycar_v2", "mycar_v2")];
        let extras = compute_extra_options(&entries, temp.path());
        assert_eq!(extras.len(), 1);
        assert_eq!(extras[0].targets, vec![cars.join("mycar"), cars.join("mycar_v1")]);

        extras[0].run_pre(false).unwrap();
        assert!(!cars.join("mycar_v1").exists());
        assert!(cars.join("mycar_v2").exists());
        assert!(cars.join("othercar_v1").exists());
    }

    #[test]
    fn test_unversioned_id_offers_nothing() {
        let temp = tempfile::tempdir().unwrap();
        fs::create_dir_all(temp.path().join("content").join("cars").join("mycar_v1")).unwrap();
        let entries = vec![ContentEntry::new(ContentKind::Car, "mycar", "mycar")];
        assert!(compute_extra_options(&entries, temp.path()).is_empty());
    }
}
