//! Immutable directory tree built from a flat entry list.

use std::collections::BTreeMap;

use crate::archive::FileEntry;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileNode {
    pub name: String,
    /// Full entry key, used to read the file from the backend
    pub key: String,
    pub size: u64,
}

impl FileNode {
    pub fn stem(&self) -> &str {
        self.name.rsplit_once('.').map(|(stem, _)| stem).unwrap_or(&self.name)
    }

    /// Lower-cased extension including the dot, or empty
    pub fn extension(&self) -> String {
        self.name
            .rsplit_once('.')
            .map(|(_, ext)| format!(".{}", ext.to_lowercase()))
            .unwrap_or_default()
    }

    pub fn has_extension(&self, extension: &str) -> bool {
        self.extension() == extension
    }
}

/// Folder node. Children are keyed by lower-cased name, so lookups ignore case
/// and iteration order is stable.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DirectoryNode {
    /// Empty for the root
    pub name: String,
    /// Key prefix of this folder, empty for the root
    pub key: String,
    /// Total size of every file below
    pub size: u64,
    directories: BTreeMap<String, DirectoryNode>,
    files: BTreeMap<String, FileNode>,
}

impl DirectoryNode {
    pub fn build(entries: &[FileEntry]) -> Self {
        let mut root = DirectoryNode::default();
        for entry in entries {
            let parts: Vec<&str> = entry.key.split('/').filter(|p| !p.is_empty()).collect();
            if let Some((file_name, dirs)) = parts.split_last() {
                root.insert(dirs, file_name, entry);
            }
        }
        root
    }

    fn insert(&mut self, dirs: &[&str], file_name: &str, entry: &FileEntry) {
        self.size += entry.size;
        match dirs.split_first() {
            Some((head, rest)) => {
                let key = if self.key.is_empty() {
                    head.to_string()
                } else {
                    format!("{}/{}", self.key, head)
                };
                self.directories
                    .entry(head.to_lowercase())
                    .or_insert_with(|| DirectoryNode {
                        name: head.to_string(),
                        key,
                        ..Default::default()
                    })
                    .insert(rest, file_name, entry);
            }
            None => {
                self.files.insert(
                    file_name.to_lowercase(),
                    FileNode {
                        name: file_name.to_string(),
                        key: entry.key.clone(),
                        size: entry.size,
                    },
                );
            }
        }
    }

    pub fn is_root(&self) -> bool {
        self.key.is_empty()
    }

    /// Folder name, `None` for the root
    pub fn dir_name(&self) -> Option<&str> {
        (!self.is_root()).then_some(self.name.as_str())
    }

    pub fn name_is(&self, name: &str) -> bool {
        !self.is_root() && self.name.eq_ignore_ascii_case(name)
    }

    pub fn directory(&self, name: &str) -> Option<&DirectoryNode> {
        self.directories.get(&name.to_lowercase())
    }

    pub fn file(&self, name: &str) -> Option<&FileNode> {
        self.files.get(&name.to_lowercase())
    }

    pub fn has_file(&self, name: &str) -> bool {
        self.file(name).is_some()
    }

    /// Nested lookup such as `"ui/ui_car.json"`
    pub fn file_at(&self, path: &str) -> Option<&FileNode> {
        match path.rsplit_once('/') {
            Some((dirs, name)) => dirs
                .split('/')
                .try_fold(self, |node, part| node.directory(part))?
                .file(name),
            None => self.file(path),
        }
    }

    pub fn directories(&self) -> impl Iterator<Item = &DirectoryNode> {
        self.directories.values()
    }

    pub fn files(&self) -> impl Iterator<Item = &FileNode> {
        self.files.values()
    }

    pub fn is_empty(&self) -> bool {
        self.directories.is_empty() && self.files.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> DirectoryNode {
        DirectoryNode::build(&[
            FileEntry::new("MyCar/UI/ui_car.json", 10),
            FileEntry::new("MyCar/data.acd", 100),
            FileEntry::new("readme.txt", 5),
        ])
    }

    #[test]
    fn test_structure_and_sizes() {
        let root = sample();
        assert!(root.is_root());
        assert_eq!(root.size, 115);
        let car = root.directory("mycar").unwrap();
        assert_eq!(car.name, "MyCar");
        assert_eq!(car.key, "MyCar");
        assert_eq!(car.size, 110);
        assert_eq!(car.directory("ui").unwrap().key, "MyCar/UI");
    }

    #[test]
    fn test_case_insensitive_lookup() {
        let root = sample();
        let car = root.directory("MYCAR").unwrap();
        let ui = car.file_at("ui/UI_CAR.JSON").unwrap();
        assert_eq!(ui.key, "MyCar/UI/ui_car.json");
        assert!(root.has_file("README.TXT"));
        assert!(car.file_at("missing/file").is_none());
    }

    #[test]
    fn test_file_node_helpers() {
        let node = FileNode {
            name: "Track.KN5".into(),
            key: "x/Track.KN5".into(),
            size: 1,
        };
        assert_eq!(node.stem(), "Track");
        assert!(node.has_extension(".kn5"));
    }

    #[test]
    fn test_root_has_no_name() {
        let root = sample();
        assert_eq!(root.dir_name(), None);
        assert!(!root.name_is(""));
        assert!(root.directory("mycar").unwrap().name_is("MYCAR"));
    }
}
