pub mod app_dirs;
pub mod archive;
pub mod checksum;
pub mod config;
pub mod entry;
pub mod error;
pub mod generic_mods;
pub mod install;
pub mod logger;
pub mod scanner;
pub mod task_control;

pub use archive::{open_source, ArchiveBackend, FileEntry, OpenOutcome, PasswordState, ReadOutcome};
pub use config::{InstallerSettings, LogSettings};
pub use entry::{ContentEntry, ContentKind, UpdateOption};
pub use error::{ErrorCode, FailureReport, InstallError, InstallResult};
pub use generic_mods::GenericModsRegistry;
pub use install::{
    Confirmation, EntryCandidate, EntrySelection, InstallJob, InstallParams, InstallationManager,
    JobOutcome, JobSnapshot, JobState,
};
pub use scanner::detect_entries;
pub use task_control::TaskControl;
