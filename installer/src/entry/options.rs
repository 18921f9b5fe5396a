//! Update strategies offered per content kind.

use std::path::{Path, PathBuf};

use glob::{MatchOptions, Pattern};
use serde::{Deserialize, Serialize};
use walkdir::WalkDir;

use super::ContentKind;

const CAR_UI: &[&str] = &["ui/ui_car.json", "ui/brand.png", "logo.png", "skins/*/ui_skin.json"];
const CAR_SKIN_PREVIEWS: &[&str] = &["skins/*/preview.jpg"];
const CAR_UI_AND_SKIN_PREVIEWS: &[&str] = &[
    "ui/ui_car.json",
    "ui/brand.png",
    "logo.png",
    "skins/*/ui_skin.json",
    "skins/*/preview.jpg",
];
const TRACK_UI: &[&str] = &[
    "ui/ui_track.json",
    "ui/preview.png",
    "ui/outline.png",
    "ui/*/ui_track.json",
    "ui/*/preview.png",
    "ui/*/outline.png",
];
const SHOWROOM_UI: &[&str] = &["ui/ui_showroom.json"];
const SKIN_UI: &[&str] = &["ui_skin.json"];
const SKIN_PREVIEW: &[&str] = &["preview.jpg"];

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: false,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateOption {
    UpdateEverything,
    RemoveExisting,
    KeepUiInformation,
    KeepSkinsPreviews,
    KeepUiAndSkinsPreviews,
    RemoveExistingKeepUi,
    RemoveExistingKeepSkinsPreviews,
    KeepSkinPreview,
}

impl UpdateOption {
    pub fn display_name(self) -> &'static str {
        match self {
            UpdateOption::UpdateEverything => "Update everything",
            UpdateOption::RemoveExisting => "Remove existing first",
            UpdateOption::KeepUiInformation => "Keep UI information",
            UpdateOption::KeepSkinsPreviews => "Keep skins previews",
            UpdateOption::KeepUiAndSkinsPreviews => "Keep UI information and skins previews",
            UpdateOption::RemoveExistingKeepUi => "Remove existing first, keep UI information",
            UpdateOption::RemoveExistingKeepSkinsPreviews => {
                "Remove existing first, keep skins previews"
            }
            UpdateOption::KeepSkinPreview => "Keep skin preview",
        }
    }

    pub fn removes_existing(self) -> bool {
        matches!(
            self,
            UpdateOption::RemoveExisting
                | UpdateOption::RemoveExistingKeepUi
                | UpdateOption::RemoveExistingKeepSkinsPreviews
        )
    }

    /// Options that preserve installed UI metadata also carry the new version number into it
    pub fn syncs_version(self) -> bool {
        matches!(
            self,
            UpdateOption::KeepUiInformation
                | UpdateOption::KeepUiAndSkinsPreviews
                | UpdateOption::RemoveExistingKeepUi
        )
    }

    fn kept_patterns(self, kind: &ContentKind) -> &'static [&'static str] {
        match (self, kind) {
            (UpdateOption::UpdateEverything | UpdateOption::RemoveExisting, _) => &[],
            (UpdateOption::KeepUiInformation | UpdateOption::RemoveExistingKeepUi, kind) => {
                match kind {
                    ContentKind::Car => CAR_UI,
                    ContentKind::Track => TRACK_UI,
                    ContentKind::Showroom => SHOWROOM_UI,
                    ContentKind::CarSkin { .. } => SKIN_UI,
                    _ => &[],
                }
            }
            (
                UpdateOption::KeepSkinsPreviews | UpdateOption::RemoveExistingKeepSkinsPreviews,
                _,
            ) => CAR_SKIN_PREVIEWS,
            (UpdateOption::KeepUiAndSkinsPreviews, _) => CAR_UI_AND_SKIN_PREVIEWS,
            (UpdateOption::KeepSkinPreview, _) => SKIN_PREVIEW,
        }
    }

    /// Whether the installed copy of `relative` (package-relative, `/` separated) is preserved
    pub fn keeps(self, kind: &ContentKind, relative: &str) -> bool {
        let relative = relative.replace('\\', "/");
        self.kept_patterns(kind).iter().any(|pattern| {
            Pattern::new(pattern)
                .map(|p| p.matches_with(&relative, MATCH_OPTIONS))
                .unwrap_or(false)
        })
    }

    /// Installed files under `destination` to remove before copying
    pub fn files_to_remove(self, kind: &ContentKind, destination: &Path) -> Vec<PathBuf> {
        if !self.removes_existing() || !destination.exists() {
            return Vec::new();
        }
        if destination.is_file() {
            return vec![destination.to_path_buf()];
        }
        WalkDir::new(destination)
            .into_iter()
            .flatten()
            .filter(|item| item.file_type().is_file())
            .filter(|item| {
                item.path()
                    .strip_prefix(destination)
                    .ok()
                    .and_then(|rel| rel.to_str())
                    .map(|rel| !self.keeps(kind, rel))
                    .unwrap_or(true)
            })
            .map(|item| item.into_path())
            .collect()
    }
}

/// Options offered for `kind`, baseline first
pub fn options_for(kind: &ContentKind) -> Vec<UpdateOption> {
    let mut options = vec![UpdateOption::UpdateEverything, UpdateOption::RemoveExisting];
    match kind {
        ContentKind::Car => options.extend([
            UpdateOption::KeepUiInformation,
            UpdateOption::KeepSkinsPreviews,
            UpdateOption::KeepUiAndSkinsPreviews,
            UpdateOption::RemoveExistingKeepUi,
            UpdateOption::RemoveExistingKeepSkinsPreviews,
        ]),
        ContentKind::Track => options.extend([
            UpdateOption::KeepUiInformation,
            UpdateOption::RemoveExistingKeepUi,
        ]),
        ContentKind::Showroom => options.push(UpdateOption::KeepUiInformation),
        ContentKind::CarSkin { .. } => options.extend([
            UpdateOption::KeepUiInformation,
            UpdateOption::KeepSkinPreview,
        ]),
        ContentKind::Weather
        | ContentKind::Font { .. }
        | ContentKind::PpFilter
        | ContentKind::DriverModel => {}
    }
    options
}

/// Preselected option: the first kind-specific one when content already exists
pub fn default_option(kind: &ContentKind, existing: bool) -> UpdateOption {
    if !existing {
        return UpdateOption::UpdateEverything;
    }
    options_for(kind)
        .into_iter()
        .nth(2)
        .unwrap_or(UpdateOption::UpdateEverything)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_option_table() {
        assert_eq!(options_for(&ContentKind::Car).len(), 7);
        assert_eq!(options_for(&ContentKind::Track).len(), 4);
        assert_eq!(
            options_for(&ContentKind::PpFilter),
            vec![UpdateOption::UpdateEverything, UpdateOption::RemoveExisting]
        );
    }

    #[test]
    fn test_default_option() {
        assert_eq!(default_option(&ContentKind::Car, false), UpdateOption::UpdateEverything);
        assert_eq!(default_option(&ContentKind::Car, true), UpdateOption::KeepUiInformation);
        assert_eq!(default_option(&ContentKind::Weather, true), UpdateOption::UpdateEverything);
    }

    #[test]
    fn test_keep_patterns_are_case_insensitive() {
        let kind = ContentKind::Car;
        assert!(UpdateOption::KeepUiInformation.keeps(&kind, "UI/ui_car.json"));
        assert!(UpdateOption::KeepUiInformation.keeps(&kind, "skins/red/ui_skin.json"));
        assert!(!UpdateOption::KeepUiInformation.keeps(&kind, "skins/red/preview.jpg"));
        assert!(UpdateOption::KeepSkinsPreviews.keeps(&kind, "skins/red/preview.jpg"));
        assert!(!UpdateOption::KeepSkinsPreviews.keeps(&kind, "skins/red/deep/preview.jpg"));
        assert!(!UpdateOption::UpdateEverything.keeps(&kind, "ui/ui_car.json"));
    }

    #[test]
    fn test_track_layout_ui_is_kept() {
        let kind = ContentKind::Track;
        assert!(UpdateOption::KeepUiInformation.keeps(&kind, "ui/gp/ui_track.json"));
        assert!(UpdateOption::KeepUiInformation.keeps(&kind, "ui/outline.png"));
        assert!(!UpdateOption::KeepUiInformation.keeps(&kind, "data/surfaces.ini"));
    }

    #[test]
    fn test_files_to_remove_respects_keep() {
        let temp = tempfile::tempdir().unwrap();
        let car = temp.path().join("mycar");
        fs::create_dir_all(car.join("ui")).unwrap();
        fs::write(car.join("ui").join("ui_car.json"), b"{}").unwrap();
        fs::write(car.join("data.acd"), b"acd").unwrap();

        let removed = UpdateOption::RemoveExistingKeepUi.files_to_remove(&ContentKind::Car, &car);
        assert_eq!(removed, vec![car.join("data.acd")]);

        let removed = UpdateOption::RemoveExisting.files_to_remove(&ContentKind::Car, &car);
        assert_eq!(removed.len(), 2);

        assert!(UpdateOption::KeepUiInformation
            .files_to_remove(&ContentKind::Car, &car)
            .is_empty());
    }
}
