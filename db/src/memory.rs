//! An in-memory database implementation.
//!
//! Backs tests and single-node development deployments; a SQL-backed
//! implementation plugs in behind the same [`Database`] trait.

use std::collections::BTreeMap;
use std::sync::atomic::AtomicI64;
use std::sync::atomic::Ordering;

use chrono::Utc;
use tokio::sync::RwLock;

use crate::Container;
use crate::Database;
use crate::DatabaseResult;
use crate::Dataset;
use crate::Error;
use crate::ImageRef;
use crate::NewTask;
use crate::Registry;
use crate::ReviewStatus;
use crate::TaskMarker;
use crate::TaskRecord;

/// An in-memory [`Database`].
#[derive(Default)]
pub struct MemoryDatabase {
    /// The next task identifier.
    next_task_id: AtomicI64,
    /// The next registry/container identifier.
    next_object_id: AtomicI64,
    /// All task rows, keyed by id.
    tasks: RwLock<BTreeMap<i64, TaskRecord>>,
    /// All datasets, keyed by id.
    datasets: RwLock<BTreeMap<i64, Dataset>>,
    /// All registries, in insertion order.
    registries: RwLock<Vec<Registry>>,
    /// All registered containers.
    containers: RwLock<Vec<Container>>,
}

impl MemoryDatabase {
    /// Constructs a new, empty in-memory database.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a dataset.
    pub async fn insert_dataset(&self, dataset: Dataset) {
        self.datasets.write().await.insert(dataset.id, dataset);
    }

    /// Adds a registry, returning it with an assigned id.
    pub async fn insert_registry(&self, mut registry: Registry) -> Registry {
        registry.id = self.next_object_id.fetch_add(1, Ordering::SeqCst) + 1;
        self.registries.write().await.push(registry.clone());
        registry
    }

    /// Adds a container, returning it with an assigned id.
    pub async fn insert_container(&self, mut container: Container) -> Container {
        container.id = self.next_object_id.fetch_add(1, Ordering::SeqCst) + 1;
        self.containers.write().await.push(container.clone());
        container
    }
}

#[async_trait::async_trait]
impl Database for MemoryDatabase {
    async fn insert_task(&self, task: NewTask) -> DatabaseResult<TaskRecord> {
        let now = Utc::now();
        let record = TaskRecord {
            id: self.next_task_id.fetch_add(1, Ordering::SeqCst) + 1,
            name: task.name,
            docker_image: task.docker_image,
            description: task.description,
            requested_by: task.requested_by,
            review_status: ReviewStatus::Pending,
            marker: TaskMarker::Scheduled,
            dataset_id: task.dataset_id,
            created_at: now,
            updated_at: now,
        };

        self.tasks.write().await.insert(record.id, record.clone());
        Ok(record)
    }

    async fn get_task(&self, id: i64) -> DatabaseResult<TaskRecord> {
        self.tasks
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(Error::TaskNotFound(id))
    }

    async fn list_tasks(&self) -> DatabaseResult<Vec<TaskRecord>> {
        Ok(self.tasks.read().await.values().cloned().collect())
    }

    async fn delete_task(&self, id: i64) -> DatabaseResult<()> {
        self.tasks
            .write()
            .await
            .remove(&id)
            .map(|_| ())
            .ok_or(Error::TaskNotFound(id))
    }

    async fn update_task_marker(&self, id: i64, marker: TaskMarker) -> DatabaseResult<()> {
        let mut tasks = self.tasks.write().await;
        let record = tasks.get_mut(&id).ok_or(Error::TaskNotFound(id))?;
        record.marker = marker;
        record.updated_at = Utc::now();
        Ok(())
    }

    async fn update_review_status(&self, id: i64, status: ReviewStatus) -> DatabaseResult<()> {
        let mut tasks = self.tasks.write().await;
        let record = tasks.get_mut(&id).ok_or(Error::TaskNotFound(id))?;
        record.review_status = status;
        record.updated_at = Utc::now();
        Ok(())
    }

    async fn get_dataset(&self, id: i64) -> DatabaseResult<Dataset> {
        self.datasets
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(Error::DatasetNotFound(id))
    }

    async fn list_registries(&self) -> DatabaseResult<Vec<Registry>> {
        Ok(self.registries.read().await.clone())
    }

    async fn find_container(
        &self,
        registry_id: i64,
        name: &str,
        image: &ImageRef,
    ) -> DatabaseResult<Option<Container>> {
        Ok(self
            .containers
            .read()
            .await
            .iter()
            .find(|c| c.registry_id == registry_id && c.name == name && c.matches(image))
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn task_rows_round_trip() {
        let db = MemoryDatabase::new();
        let record = db
            .insert_task(NewTask {
                name: "pheno-analysis".to_string(),
                docker_image: "acr.azurecr.io/org/analytics:1.0".to_string(),
                description: String::new(),
                requested_by: "user-1".to_string(),
                dataset_id: 1,
            })
            .await
            .unwrap();

        assert_eq!(record.review_status, ReviewStatus::Pending);
        assert_eq!(record.marker, TaskMarker::Scheduled);

        db.update_task_marker(record.id, TaskMarker::Running)
            .await
            .unwrap();
        let fetched = db.get_task(record.id).await.unwrap();
        assert_eq!(fetched.marker, TaskMarker::Running);

        db.delete_task(record.id).await.unwrap();
        assert!(matches!(
            db.get_task(record.id).await,
            Err(Error::TaskNotFound(_))
        ));
    }

    #[tokio::test]
    async fn container_lookup_matches_exact_reference() {
        let db = MemoryDatabase::new();
        let registry = db
            .insert_registry(Registry {
                id: 0,
                url: "acr.azurecr.io".to_string(),
                username: None,
                password: None,
                active: true,
            })
            .await;
        db.insert_container(Container {
            id: 0,
            name: "org/analytics".to_string(),
            tag: Some("1.0".to_string()),
            sha: None,
            registry_id: registry.id,
        })
        .await;

        let hit = db
            .find_container(
                registry.id,
                "org/analytics",
                &"org/analytics:1.0".parse().unwrap(),
            )
            .await
            .unwrap();
        assert!(hit.is_some());

        let miss = db
            .find_container(
                registry.id,
                "org/analytics",
                &"org/analytics:2.0".parse().unwrap(),
            )
            .await
            .unwrap();
        assert!(miss.is_none());
    }
}
