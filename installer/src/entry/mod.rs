//! Installable content descriptors produced by the scanner.

pub mod callback;
pub mod options;

use serde::{Deserialize, Serialize};

pub use callback::{AggregateCallback, CopyPlan};
pub use options::{default_option, options_for, UpdateOption};

/// Closed set of recognised package kinds
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentKind {
    Car,
    Track,
    Showroom,
    Weather,
    /// `car_id` comes from the `<car>/skins/<skin>` layout when present
    CarSkin { car_id: Option<String> },
    /// Font description file plus its bitmap sibling
    Font { bitmap_key: String },
    PpFilter,
    DriverModel,
}

impl ContentKind {
    pub fn label(&self) -> &'static str {
        match self {
            ContentKind::Car => "Car",
            ContentKind::Track => "Track",
            ContentKind::Showroom => "Showroom",
            ContentKind::Weather => "Weather",
            ContentKind::CarSkin { .. } => "Car skin",
            ContentKind::Font { .. } => "Font",
            ContentKind::PpFilter => "PP filter",
            ContentKind::DriverModel => "Driver model",
        }
    }

    /// Packages that are a single file (plus siblings) rather than a folder
    pub fn is_file_package(&self) -> bool {
        matches!(
            self,
            ContentKind::Font { .. } | ContentKind::PpFilter | ContentKind::DriverModel
        )
    }

    fn noun(&self) -> &'static str {
        match self {
            ContentKind::Car => "car",
            ContentKind::Track => "track",
            ContentKind::Showroom => "showroom",
            ContentKind::Weather => "weather",
            ContentKind::CarSkin { .. } => "skin",
            ContentKind::Font { .. } => "font",
            ContentKind::PpFilter => "PP filter",
            ContentKind::DriverModel => "driver model",
        }
    }
}

/// One installable package found inside a source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentEntry {
    pub kind: ContentKind,
    /// Key of the package root folder, or of the main file for file packages.
    /// Empty when the whole source is the package.
    pub entry_path: String,
    pub id: String,
    pub name: String,
    pub version: Option<String>,
    pub author: Option<String>,
    /// PNG or JPEG bytes for a preview, when the package carries one
    #[serde(skip)]
    pub icon: Option<Vec<u8>>,
}

impl ContentEntry {
    pub fn new(kind: ContentKind, entry_path: impl Into<String>, id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            kind,
            entry_path: entry_path.into(),
            name: id.clone(),
            id,
            version: None,
            author: None,
            icon: None,
        }
    }

    pub fn with_name(mut self, name: Option<String>) -> Self {
        if let Some(name) = name.filter(|n| !n.trim().is_empty()) {
            self.name = name.trim().to_string();
        }
        self
    }

    pub fn with_version(mut self, version: Option<String>) -> Self {
        self.version = version.filter(|v| !v.trim().is_empty());
        self
    }

    pub fn with_author(mut self, author: Option<String>) -> Self {
        self.author = author.filter(|a| !a.trim().is_empty());
        self
    }

    pub fn with_icon(mut self, icon: Option<Vec<u8>>) -> Self {
        self.icon = icon;
        self
    }

    /// Headline when nothing with this id is installed yet
    pub fn new_format(&self) -> String {
        format!("New {} \"{}\"", self.kind.noun(), self.name)
    }

    /// Headline when content with this id already exists
    pub fn existing_format(&self) -> String {
        format!("Update for the {} \"{}\"", self.kind.noun(), self.name)
    }

    /// Registry name when installed as a generic mod
    pub fn generic_mod_name(&self) -> String {
        format!("({}) {}", self.kind.label(), self.id)
    }
}
