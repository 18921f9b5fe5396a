//! Observable state of one installation job and the answers it waits for.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use crate::entry::{ContentEntry, UpdateOption};
use crate::error::FailureReport;
use crate::task_control::TaskControl;

use super::destination::ExistingContent;
use super::extra::ExtraOption;

/// Terminal result of a job
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum JobOutcome {
    Succeeded {
        /// Ids of the installed packages
        installed: Vec<String>,
        /// Selected packages that could not be installed, one message each
        skipped: Vec<String>,
    },
    /// Nothing installable was found in the source
    Empty,
    Failed { report: FailureReport },
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum JobState {
    Loading,
    /// `incorrect` is set after a rejected attempt
    PasswordRequired { incorrect: bool },
    WaitingForConfirmation,
    Installing,
    Finished(JobOutcome),
}

impl JobState {
    pub fn is_finished(&self) -> bool {
        matches!(self, JobState::Finished(_))
    }
}

/// A detected package as offered for confirmation
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntryCandidate {
    pub index: usize,
    pub entry: ContentEntry,
    pub destination: Option<PathBuf>,
    /// Why no destination could be resolved
    pub destination_error: Option<String>,
    /// Set when something is installed at the destination
    pub existing: Option<ExistingContent>,
    pub is_newer_version: Option<bool>,
    pub headline: String,
    pub options: Vec<UpdateOption>,
    pub default_option: UpdateOption,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntrySelection {
    pub index: usize,
    /// `None` picks the candidate's default option
    pub option: Option<UpdateOption>,
}

/// Answer to the confirmation request
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Confirmation {
    pub active: Vec<EntrySelection>,
    /// Ids of the extra options to run
    pub extra_options: Vec<String>,
}

impl Confirmation {
    /// Every candidate with a destination, each with its default option
    pub fn accept_defaults(candidates: &[EntryCandidate]) -> Self {
        Self {
            active: candidates
                .iter()
                .filter(|candidate| candidate.destination.is_some())
                .map(|candidate| EntrySelection {
                    index: candidate.index,
                    option: None,
                })
                .collect(),
            extra_options: Vec::new(),
        }
    }

    pub fn with_option(mut self, index: usize, option: UpdateOption) -> Self {
        match self.active.iter_mut().find(|selection| selection.index == index) {
            Some(selection) => selection.option = Some(option),
            None => self.active.push(EntrySelection {
                index,
                option: Some(option),
            }),
        }
        self
    }

    pub fn with_extra(mut self, id: impl Into<String>) -> Self {
        self.extra_options.push(id.into());
        self
    }
}

/// What subscribers see
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobSnapshot {
    pub id: String,
    pub source: String,
    pub display_name: String,
    pub started_at: DateTime<Utc>,
    pub state: JobState,
    pub message: String,
    /// Fraction in `0.0..=1.0` when known
    pub progress: Option<f64>,
    pub candidates: Vec<EntryCandidate>,
    pub extra_options: Vec<ExtraOption>,
}

/// Receiving ends of the answer channels, owned by the job's task
pub(crate) struct JobInbox {
    pub password: mpsc::UnboundedReceiver<String>,
    pub confirmation: mpsc::UnboundedReceiver<Confirmation>,
}

/// Handle to one running or finished installation
#[derive(Debug)]
pub struct InstallJob {
    source: String,
    control: TaskControl,
    snapshot: watch::Sender<JobSnapshot>,
    password: mpsc::UnboundedSender<String>,
    confirmation: mpsc::UnboundedSender<Confirmation>,
}

impl InstallJob {
    pub(crate) fn new(source: String, display_name: String) -> (Self, JobInbox) {
        let (snapshot, _) = watch::channel(JobSnapshot {
            id: Uuid::new_v4().to_string(),
            source: source.clone(),
            display_name,
            started_at: Utc::now(),
            state: JobState::Loading,
            message: "Preparing".to_string(),
            progress: None,
            candidates: Vec::new(),
            extra_options: Vec::new(),
        });
        let (password, password_rx) = mpsc::unbounded_channel();
        let (confirmation, confirmation_rx) = mpsc::unbounded_channel();
        let job = Self {
            source,
            control: TaskControl::new(),
            snapshot,
            password,
            confirmation,
        };
        let inbox = JobInbox {
            password: password_rx,
            confirmation: confirmation_rx,
        };
        (job, inbox)
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn id(&self) -> String {
        self.snapshot.borrow().id.clone()
    }

    pub fn state(&self) -> JobState {
        self.snapshot.borrow().state.clone()
    }

    pub fn snapshot(&self) -> JobSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<JobSnapshot> {
        self.snapshot.subscribe()
    }

    /// `false` once the job no longer listens
    pub fn provide_password(&self, password: impl Into<String>) -> bool {
        self.password.send(password.into()).is_ok()
    }

    pub fn confirm(&self, confirmation: Confirmation) -> bool {
        self.confirmation.send(confirmation).is_ok()
    }

    pub fn cancel(&self) {
        self.control.request_cancel();
    }

    pub(crate) fn control(&self) -> &TaskControl {
        &self.control
    }

    pub(crate) fn update(&self, change: impl FnOnce(&mut JobSnapshot)) {
        self.snapshot.send_modify(change);
    }

    pub(crate) fn set_state(&self, state: JobState, message: impl Into<String>) {
        let message = message.into();
        self.update(|snapshot| {
            snapshot.state = state;
            snapshot.message = message;
            snapshot.progress = None;
        });
    }

    /// Resolves once the job reaches [`JobState::Finished`]
    pub async fn wait(&self) -> JobOutcome {
        let mut receiver = self.subscribe();
        loop {
            {
                let snapshot = receiver.borrow_and_update();
                if let JobState::Finished(outcome) = &snapshot.state {
                    return outcome.clone();
                }
            }
            if receiver.changed().await.is_err() {
                return JobOutcome::Cancelled;
            }
        }
    }

    /// Resolves once the job is in a state matching `predicate`
    pub async fn wait_for(&self, predicate: impl Fn(&JobState) -> bool) -> JobSnapshot {
        let mut receiver = self.subscribe();
        loop {
            {
                let snapshot = receiver.borrow_and_update();
                if predicate(&snapshot.state) || snapshot.state.is_finished() {
                    return snapshot.clone();
                }
            }
            if receiver.changed().await.is_err() {
                return self.snapshot();
            }
        }
    }
}
