use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Stable error codes for surfaced failures
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Downloaded bytes do not match the expected hash
    ChecksumMismatch,
    /// Source could not be opened by any backend
    UnsupportedContainer,
    PasswordRequired,
    PasswordIncorrect,
    /// Required content stayed unavailable after the deferred load pass
    MissingContent,
    /// Scan completed but recognised nothing installable
    NoPackagesFound,
    Filesystem,
    Cancelled,
    Internal,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorCode::ChecksumMismatch => "checksum_mismatch",
            ErrorCode::UnsupportedContainer => "unsupported_container",
            ErrorCode::PasswordRequired => "password_required",
            ErrorCode::PasswordIncorrect => "password_incorrect",
            ErrorCode::MissingContent => "missing_content",
            ErrorCode::NoPackagesFound => "no_packages_found",
            ErrorCode::Filesystem => "filesystem",
            ErrorCode::Cancelled => "cancelled",
            ErrorCode::Internal => "internal",
        };
        f.write_str(name)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum InstallError {
    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("Unsupported or damaged container: {0}")]
    UnsupportedContainer(String),

    #[error("Password required")]
    PasswordRequired,

    #[error("Password is incorrect")]
    PasswordIncorrect,

    #[error("Content is not available yet: {0}")]
    MissingContent(String),

    #[error("File system error at {}: {source}", .path.display())]
    Filesystem {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Installation cancelled")]
    Cancelled,

    #[error(transparent)]
    Internal(anyhow::Error),
}

pub type InstallResult<T> = std::result::Result<T, InstallError>;

impl InstallError {
    pub fn fs(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        InstallError::Filesystem {
            path: path.into(),
            source,
        }
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            InstallError::ChecksumMismatch { .. } => ErrorCode::ChecksumMismatch,
            InstallError::UnsupportedContainer(_) => ErrorCode::UnsupportedContainer,
            InstallError::PasswordRequired => ErrorCode::PasswordRequired,
            InstallError::PasswordIncorrect => ErrorCode::PasswordIncorrect,
            InstallError::MissingContent(_) => ErrorCode::MissingContent,
            InstallError::Filesystem { .. } => ErrorCode::Filesystem,
            InstallError::Cancelled => ErrorCode::Cancelled,
            InstallError::Internal(_) => ErrorCode::Internal,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, InstallError::Cancelled)
    }

    fn remediation(&self) -> Option<&'static str> {
        match self {
            InstallError::ChecksumMismatch { .. } => {
                Some("The file is probably damaged, try downloading it again")
            }
            InstallError::UnsupportedContainer(_) => {
                Some("Make sure the archive is complete, or unpack it and install the folder")
            }
            InstallError::PasswordRequired | InstallError::PasswordIncorrect => {
                Some("Check the password with the author of the archive")
            }
            InstallError::MissingContent(_) => {
                Some("The archive is incomplete or uses an unsupported layout")
            }
            InstallError::Filesystem { .. } => {
                Some("Make sure the target folder is writable and not locked by the game")
            }
            InstallError::Cancelled | InstallError::Internal(_) => None,
        }
    }
}

impl From<std::io::Error> for InstallError {
    fn from(err: std::io::Error) -> Self {
        InstallError::Filesystem {
            path: PathBuf::new(),
            source: err,
        }
    }
}

/// Recovers typed errors that travelled through `anyhow`
impl From<anyhow::Error> for InstallError {
    fn from(err: anyhow::Error) -> Self {
        match err.downcast::<InstallError>() {
            Ok(typed) => typed,
            Err(err) => match err.downcast::<std::io::Error>() {
                Ok(io) => InstallError::from(io),
                Err(err) => InstallError::Internal(err),
            },
        }
    }
}

/// What a finished job shows for a failure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FailureReport {
    pub code: ErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remediation: Option<String>,
}

impl FailureReport {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            remediation: None,
        }
    }

    pub fn with_remediation(mut self, remediation: impl Into<String>) -> Self {
        self.remediation = Some(remediation.into());
        self
    }

    /// `None` for cancellation, which is never reported as a failure
    pub fn from_error(err: &InstallError) -> Option<Self> {
        if err.is_cancelled() {
            return None;
        }
        let report = FailureReport::new(err.code(), err.to_string());
        Some(match err.remediation() {
            Some(hint) => report.with_remediation(hint),
            None => report,
        })
    }
}

impl fmt::Display for FailureReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)?;
        if let Some(ref remediation) = self.remediation {
            write!(f, " ({})", remediation)?;
        }
        Ok(())
    }
}
