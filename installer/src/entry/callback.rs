//! Maps source entries to destination paths for one install pass.

use std::path::{Path, PathBuf};

use crate::archive::FileEntry;

use super::{ContentEntry, ContentKind, UpdateOption};

/// Resolved install of one descriptor: option and destination fixed
#[derive(Debug, Clone)]
pub struct CopyPlan {
    pub entry: ContentEntry,
    pub option: UpdateOption,
    pub destination: PathBuf,
}

/// Package-relative remainder of `key` under `root`, compared case-insensitively
fn strip_root<'a>(key: &'a str, root: &str) -> Option<&'a str> {
    if root.is_empty() {
        return Some(key);
    }
    let head = key.get(..root.len())?;
    if !head.eq_ignore_ascii_case(root) {
        return None;
    }
    key[root.len()..].strip_prefix('/').filter(|rest| !rest.is_empty())
}

fn extension_of(key: &str) -> Option<&str> {
    let name = key.rsplit('/').next()?;
    name.rsplit_once('.').map(|(_, ext)| ext)
}

impl CopyPlan {
    pub fn new(entry: ContentEntry, option: UpdateOption, destination: PathBuf) -> Self {
        Self {
            entry,
            option,
            destination,
        }
    }

    /// Destination for `file`, or `None` when it is not part of this package or
    /// an installed copy is kept.
    pub fn resolve(&self, file: &FileEntry) -> Option<PathBuf> {
        match self.entry.kind {
            ContentKind::Font { ref bitmap_key } => {
                if file.matches_key(&self.entry.entry_path) {
                    Some(self.destination.clone())
                } else if file.matches_key(bitmap_key) {
                    let ext = extension_of(bitmap_key).unwrap_or("bmp").to_lowercase();
                    Some(self.destination.with_extension(ext))
                } else {
                    None
                }
            }
            ContentKind::PpFilter | ContentKind::DriverModel => file
                .matches_key(&self.entry.entry_path)
                .then(|| self.destination.clone()),
            _ => {
                let relative = strip_root(&file.key, &self.entry.entry_path)?;
                let target = join_relative(&self.destination, relative);
                if self.option.keeps(&self.entry.kind, relative) && target.exists() {
                    return None;
                }
                Some(target)
            }
        }
    }
}

fn join_relative(base: &Path, relative: &str) -> PathBuf {
    relative
        .split('/')
        .filter(|part| !part.is_empty())
        .fold(base.to_path_buf(), |path, part| path.join(part))
}

/// Combines several plans; the first plan claiming an entry wins
#[derive(Debug, Clone, Default)]
pub struct AggregateCallback {
    plans: Vec<CopyPlan>,
}

impl AggregateCallback {
    pub fn new(plans: Vec<CopyPlan>) -> Self {
        Self { plans }
    }

    pub fn plans(&self) -> &[CopyPlan] {
        &self.plans
    }

    /// Index of the claiming plan together with the destination
    pub fn resolve(&self, file: &FileEntry) -> Option<(usize, PathBuf)> {
        self.plans
            .iter()
            .enumerate()
            .find_map(|(index, plan)| plan.resolve(file).map(|dest| (index, dest)))
    }
}
