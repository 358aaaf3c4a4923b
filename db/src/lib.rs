//! Domain records and the storage abstraction for the Federated Node.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::bail;
use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;

pub mod connection;
mod dataset;
mod memory;
mod registry;

pub use dataset::Dataset;
pub use dataset::DatasetEngine;
pub use memory::MemoryDatabase;
pub use registry::Container;
pub use registry::ImageRef;
pub use registry::Registry;
pub use registry::RegistryApi;

/// Represents a database error.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The requested task does not exist.
    #[error("task {0} does not exist")]
    TaskNotFound(i64),
    /// The requested dataset does not exist.
    #[error("dataset {0} does not exist")]
    DatasetNotFound(i64),
    /// The task has already been through review.
    #[error("task has already been reviewed")]
    AlreadyReviewed,
    /// Another type of error occurred during the database operation.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// The result type for database operations.
pub type DatabaseResult<T> = Result<T, Error>;

/// The release review state of a task.
///
/// Review is write-once: the only legal transitions are from [`Pending`] to
/// [`Approved`] or [`Blocked`], enforced by [`ReviewStatus::decide`].
///
/// [`Pending`]: ReviewStatus::Pending
/// [`Approved`]: ReviewStatus::Approved
/// [`Blocked`]: ReviewStatus::Blocked
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReviewStatus {
    /// The task results have not been reviewed yet.
    #[default]
    Pending,
    /// The task results have been approved for release.
    Approved,
    /// The task results have been blocked from release.
    Blocked,
}

impl ReviewStatus {
    /// Applies a review decision.
    ///
    /// Returns [`Error::AlreadyReviewed`] unless the current state is
    /// [`ReviewStatus::Pending`].
    pub fn decide(self, approve: bool) -> DatabaseResult<Self> {
        match self {
            Self::Pending if approve => Ok(Self::Approved),
            Self::Pending => Ok(Self::Blocked),
            _ => Err(Error::AlreadyReviewed),
        }
    }

    /// Gets the user-facing label for the state.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Pending => "Pending Review",
            Self::Approved => "Approved Release",
            Self::Blocked => "Blocked Release",
        }
    }
}

/// A coarse marker for the last confirmed task phase.
///
/// Live states are always recomputed from the cluster; this marker only
/// remembers the last observation so a vanished pod can be told apart from a
/// task that was cancelled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskMarker {
    /// The task row exists but no pod has been observed yet.
    #[default]
    Scheduled,
    /// The pod was last seen waiting to start.
    Waiting,
    /// The pod was last seen running.
    Running,
    /// The pod was last seen terminated.
    Terminated,
    /// The task was explicitly cancelled.
    Cancelled,
}

impl fmt::Display for TaskMarker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Scheduled => write!(f, "scheduled"),
            Self::Waiting => write!(f, "waiting"),
            Self::Running => write!(f, "running"),
            Self::Terminated => write!(f, "terminated"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl FromStr for TaskMarker {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "scheduled" => Ok(Self::Scheduled),
            "waiting" => Ok(Self::Waiting),
            "running" => Ok(Self::Running),
            "terminated" => Ok(Self::Terminated),
            "cancelled" => Ok(Self::Cancelled),
            _ => bail!("invalid task marker value `{s}`"),
        }
    }
}

/// A task row as persisted.
#[derive(Debug, Clone, Serialize)]
pub struct TaskRecord {
    /// The task identifier.
    pub id: i64,
    /// The task name as provided on submission.
    pub name: String,
    /// The fully qualified, registry-resolved image reference.
    pub docker_image: String,
    /// The free-form task description.
    pub description: String,
    /// The identifier of the user that requested the task.
    pub requested_by: String,
    /// The release review state.
    pub review_status: ReviewStatus,
    /// The last confirmed coarse phase.
    pub marker: TaskMarker,
    /// The dataset the task runs against.
    pub dataset_id: i64,
    /// When the row was created.
    pub created_at: DateTime<Utc>,
    /// When the row was last updated.
    pub updated_at: DateTime<Utc>,
}

/// The fields required to insert a new task row.
#[derive(Debug, Clone)]
pub struct NewTask {
    /// The task name.
    pub name: String,
    /// The fully qualified image reference; must already be resolved against
    /// a known registry before insertion.
    pub docker_image: String,
    /// The free-form task description.
    pub description: String,
    /// The identifier of the user that requested the task.
    pub requested_by: String,
    /// The dataset the task runs against.
    pub dataset_id: i64,
}

/// An abstraction for the Federated Node database.
#[async_trait::async_trait]
pub trait Database: Send + Sync + 'static {
    /// Inserts a task into the database.
    ///
    /// The row is created with a pending review status and a `scheduled`
    /// marker.
    async fn insert_task(&self, task: NewTask) -> DatabaseResult<TaskRecord>;

    /// Gets a task from the database.
    async fn get_task(&self, id: i64) -> DatabaseResult<TaskRecord>;

    /// Gets all tasks from the database.
    async fn list_tasks(&self) -> DatabaseResult<Vec<TaskRecord>>;

    /// Deletes a task row.
    ///
    /// Used to roll back a submission whose pod never started, so the row
    /// does not linger in a `scheduled` state inconsistent with reality.
    async fn delete_task(&self, id: i64) -> DatabaseResult<()>;

    /// Updates the last confirmed phase marker of a task.
    async fn update_task_marker(&self, id: i64, marker: TaskMarker) -> DatabaseResult<()>;

    /// Updates the review status of a task.
    ///
    /// The caller is expected to have derived the new state via
    /// [`ReviewStatus::decide`].
    async fn update_review_status(&self, id: i64, status: ReviewStatus) -> DatabaseResult<()>;

    /// Gets a dataset by id.
    async fn get_dataset(&self, id: i64) -> DatabaseResult<Dataset>;

    /// Gets all known registries, in insertion order.
    ///
    /// The ordering matters: image resolution tries registries in the order
    /// returned here (see the task engine's registry splitting).
    async fn list_registries(&self) -> DatabaseResult<Vec<Registry>>;

    /// Finds a container matching the given name and reference in a registry.
    async fn find_container(
        &self,
        registry_id: i64,
        name: &str,
        image: &ImageRef,
    ) -> DatabaseResult<Option<Container>>;
}

/// A shared handle to a database implementation.
pub type SharedDatabase = Arc<dyn Database>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn review_is_write_once() {
        let approved = ReviewStatus::Pending.decide(true).unwrap();
        assert_eq!(approved, ReviewStatus::Approved);
        assert_eq!(approved.label(), "Approved Release");

        assert!(matches!(approved.decide(false), Err(Error::AlreadyReviewed)));
        assert!(matches!(
            ReviewStatus::Blocked.decide(true),
            Err(Error::AlreadyReviewed)
        ));
    }

    #[test]
    fn review_block_from_pending() {
        let blocked = ReviewStatus::Pending.decide(false).unwrap();
        assert_eq!(blocked, ReviewStatus::Blocked);
        assert_eq!(blocked.label(), "Blocked Release");
        assert_eq!(ReviewStatus::Pending.label(), "Pending Review");
    }

    #[test]
    fn marker_round_trips() {
        for marker in [
            TaskMarker::Scheduled,
            TaskMarker::Waiting,
            TaskMarker::Running,
            TaskMarker::Terminated,
            TaskMarker::Cancelled,
        ] {
            assert_eq!(marker.to_string().parse::<TaskMarker>().unwrap(), marker);
        }
    }
}
