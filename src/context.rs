//! Job descriptor and the collaborators a backup job talks to
//!
//! A [`BackupContext`] is built once per job and shared by reference with
//! every stage. It carries the handles to the [`Host`] (the application whose
//! state is being archived) and to the [`Notifier`] that delivers user-facing
//! messages, so no component reaches for a global logger or host singleton.

use crate::error::{ArchiveError, Result};
use crate::types::ActionInitiator;
use chrono::{DateTime, Local};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use uuid::Uuid;

/// Work the core hands back to the host after a successful backup
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FollowupJob {
    /// Apply the retention policy to the archives under `backup_root`
    Cleanup {
        /// Directory holding the archives
        backup_root: PathBuf,
    },
}

/// The application whose persistent state is archived
///
/// Implementations decide where the state lives, how to quiesce it and how
/// follow-up work is scheduled. All calls are opaque to the core.
pub trait Host: Send + Sync {
    /// Directory tree to archive
    fn source_dir(&self) -> PathBuf;

    /// Directory that receives the archives
    fn backup_root(&self) -> PathBuf;

    /// Stop the host from writing its persistent state
    fn suspend_persistence(&self) -> Result<()>;

    /// Let the host write its persistent state again
    fn resume_persistence(&self);

    /// Stop the host's health watchdog from firing during a long job
    fn suspend_watchdog(&self) {}

    /// Re-arm the host's health watchdog
    fn resume_watchdog(&self) {}

    /// Queue follow-up work such as retention cleanup
    fn submit_followup(&self, _job: FollowupJob) -> Result<()> {
        Ok(())
    }
}

/// Delivers user-facing messages about a job
pub trait Notifier: Send + Sync {
    /// Informational message for the initiator
    fn info(&self, ctx: &BackupContext, message: &str);

    /// Failure message for the initiator
    fn error(&self, ctx: &BackupContext, message: &str);

    /// Message for everybody connected to the host
    fn broadcast(&self, message: &str);
}

/// Notifier that only writes to the tracing subscriber
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn info(&self, ctx: &BackupContext, message: &str) {
        info!(job = %ctx.id(), initiator = %ctx.initiator(), "{}", message);
    }

    fn error(&self, ctx: &BackupContext, message: &str) {
        error!(job = %ctx.id(), initiator = %ctx.initiator(), "{}", message);
    }

    fn broadcast(&self, message: &str) {
        info!(broadcast = true, "{}", message);
    }
}

/// Immutable descriptor of one backup job
#[derive(Clone)]
pub struct BackupContext {
    id: Uuid,
    started_at: DateTime<Local>,
    initiator: ActionInitiator,
    comment: Option<String>,
    host: Arc<dyn Host>,
    notifier: Arc<dyn Notifier>,
}

impl fmt::Debug for BackupContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackupContext")
            .field("id", &self.id)
            .field("started_at", &self.started_at)
            .field("initiator", &self.initiator)
            .field("comment", &self.comment)
            .finish_non_exhaustive()
    }
}

impl BackupContext {
    /// Start building a context
    pub fn builder() -> BackupContextBuilder {
        BackupContextBuilder::new()
    }

    /// Unique id of this job
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// When the job was created
    pub fn started_at(&self) -> DateTime<Local> {
        self.started_at
    }

    /// Who asked for the job
    pub fn initiator(&self) -> ActionInitiator {
        self.initiator
    }

    /// Free-text comment, if any
    pub fn comment(&self) -> Option<&str> {
        self.comment.as_deref()
    }

    /// Host whose state is archived
    pub fn host(&self) -> &Arc<dyn Host> {
        &self.host
    }

    /// Sink for user-facing messages
    pub fn notifier(&self) -> &Arc<dyn Notifier> {
        &self.notifier
    }

    /// Log and send an informational notice to the initiator
    pub fn notify_info(&self, message: &str) {
        self.notifier.info(self, message);
    }

    /// Send a failure notice, but only to interactive initiators
    pub fn notify_error_if_interactive(&self, message: &str) {
        if self.initiator.is_interactive() {
            self.notifier.error(self, message);
        }
    }
}

/// Builder for [`BackupContext`]
///
/// # Examples
///
/// ```rust,no_run
/// use treearchive::context::{BackupContext, Host};
/// use treearchive::types::ActionInitiator;
/// use std::sync::Arc;
///
/// # fn example(host: Arc<dyn Host>) -> treearchive::Result<()> {
/// let ctx = BackupContext::builder()
///     .initiator(ActionInitiator::InteractiveUser)
///     .comment(Some("before upgrade".to_string()))
///     .host(host)
///     .build()?;
/// # Ok(())
/// # }
/// ```
#[derive(Default)]
pub struct BackupContextBuilder {
    started_at: Option<DateTime<Local>>,
    initiator: Option<ActionInitiator>,
    comment: Option<String>,
    host: Option<Arc<dyn Host>>,
    notifier: Option<Arc<dyn Notifier>>,
}

impl BackupContextBuilder {
    /// Create an empty builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the start timestamp (defaults to now)
    pub fn started_at(mut self, at: DateTime<Local>) -> Self {
        self.started_at = Some(at);
        self
    }

    /// Set the initiator (defaults to [`ActionInitiator::Programmatic`])
    pub fn initiator(mut self, initiator: ActionInitiator) -> Self {
        self.initiator = Some(initiator);
        self
    }

    /// Attach a comment; blank comments are dropped
    pub fn comment(mut self, comment: Option<String>) -> Self {
        self.comment = comment.filter(|c| !c.trim().is_empty());
        self
    }

    /// Set the host (required)
    pub fn host(mut self, host: Arc<dyn Host>) -> Self {
        self.host = Some(host);
        self
    }

    /// Set the notifier (defaults to [`TracingNotifier`])
    pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Build the context
    ///
    /// # Errors
    ///
    /// Returns [`ArchiveError::InvalidConfiguration`] if no host was given.
    pub fn build(self) -> Result<BackupContext> {
        let host = self
            .host
            .ok_or_else(|| ArchiveError::InvalidConfiguration("backup context needs a host".to_string()))?;

        Ok(BackupContext {
            id: Uuid::new_v4(),
            started_at: self.started_at.unwrap_or_else(Local::now),
            initiator: self.initiator.unwrap_or(ActionInitiator::Programmatic),
            comment: self.comment,
            host,
            notifier: self.notifier.unwrap_or_else(|| Arc::new(TracingNotifier)),
        })
    }
}
