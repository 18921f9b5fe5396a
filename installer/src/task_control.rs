//! Cooperative cancellation shared between a job and its blocking workers.

use tokio_util::sync::CancellationToken;

use crate::error::{InstallError, InstallResult};

#[derive(Debug, Clone, Default)]
pub struct TaskControl {
    token: CancellationToken,
}

impl TaskControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Checkpoint: fails with [`InstallError::Cancelled`] once cancellation was requested
    pub fn ensure_not_cancelled(&self, stage: &str) -> InstallResult<()> {
        if self.is_cancelled() {
            crate::log_debug!(format!("Cancelled during {}", stage), "task_control");
            return Err(InstallError::Cancelled);
        }
        Ok(())
    }

    /// Resolves when cancellation is requested
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    /// Cancelled together with `self`, but can also be cancelled on its own
    pub fn child(&self) -> TaskControl {
        TaskControl {
            token: self.token.child_token(),
        }
    }
}
