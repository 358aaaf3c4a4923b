//! The task lifecycle engine.
//!
//! Validates task submissions, resolves images against the registered
//! registries, launches and tracks pods or cron jobs, derives live status
//! from cluster state, extracts results through ephemeral jobs, and mirrors
//! lifecycle into the delivery custom resource when the external controller
//! is enabled.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::DateTime;
use chrono::Days;
use chrono::Utc;
use fednode_cluster::Analytics;
use fednode_cluster::AnalyticsSpec;
use fednode_cluster::Gateway;
use fednode_cluster::TaskStatus;
use fednode_db::Dataset;
use fednode_db::ImageRef;
use fednode_db::NewTask;
use fednode_db::Registry;
use fednode_db::RegistryApi;
use fednode_db::ReviewStatus;
use fednode_db::SharedDatabase;
use fednode_db::TaskMarker;
use fednode_db::TaskRecord;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::batch::v1::JobSpec;
use k8s_openapi::api::core::v1::Container;
use k8s_openapi::api::core::v1::PersistentVolumeClaimVolumeSource;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::api::core::v1::PodSpec;
use k8s_openapi::api::core::v1::PodTemplateSpec;
use k8s_openapi::api::core::v1::ResourceRequirements;
use k8s_openapi::api::core::v1::Volume;
use k8s_openapi::api::core::v1::VolumeMount;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::ResourceExt as _;
use kube::api::ObjectMeta;
use serde::Deserialize;
use serde::Serialize;
use serde::Serializer;
use tracing::error;
use tracing::info;

use crate::config::Config;
use crate::keycloak::UserLookup;
use crate::name;
use crate::name::Generator as _;
use crate::quantity;

pub mod cron;
pub mod pod;

use pod::DatasetCredentials;
use pod::PodQuery;
use pod::TaskPod;

/// The label carrying the owning task id on every task resource.
const TASK_ID_LABEL: &str = "task_id";

/// The label carrying the requesting user on every task resource.
const REQUESTED_BY_LABEL: &str = "requested_by";

/// The secret keys dataset credentials are stored under.
///
/// The key names are engine-agnostic and reused regardless of the actual
/// database engine.
const SECRET_USER_KEY: &str = "PGUSER";
const SECRET_PASSWORD_KEY: &str = "PGPASSWORD";

/// Represents a task engine error.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The submission was rejected before any cluster call.
    #[error("{0}")]
    InvalidRequest(String),
    /// A resource quantity failed validation.
    #[error(transparent)]
    Quantity(#[from] quantity::Error),
    /// No registered container matches the image reference.
    #[error("Image {0} could not be found")]
    ImageNotFound(String),
    /// A container row exists but the registry no longer serves the image.
    #[error("Image {0} not found on our repository")]
    ImageNotOnRegistry(String),
    /// The remote registry could not be queried.
    #[error("could not verify the image against its registry: {0}")]
    RegistryCheck(String),
    /// A pod for the task is already running.
    #[error("Pod is already running")]
    AlreadyRunning,
    /// The task pod is already gone.
    #[error("Task already cancelled")]
    AlreadyCancelled,
    /// The task is past its retention window.
    #[error("Task results are no longer available")]
    ResultsExpired,
    /// The results fetcher did not become ready within the configured
    /// timeout; the copy can be retried.
    #[error("the results fetcher was not ready in time; try again shortly")]
    ResultsNotReady,
    /// The cluster could not be reached to create the results job.
    #[error("The cluster could not create the job")]
    ClusterUnavailable,
    /// The task has no cron job.
    #[error("CronJob not found")]
    CronJobNotFound,
    /// The pod or cron job started, but the delivery resource could not be
    /// registered; delivery automation needs manual attention.
    #[error("Could not activate automatic delivery: {0}")]
    CrdDelivery(String),
    /// A cluster call failed.
    #[error(transparent)]
    Cluster(#[from] fednode_cluster::Error),
    /// A database call failed.
    #[error(transparent)]
    Database(#[from] fednode_db::Error),
}

/// The result type of task engine operations.
pub type Result<T> = std::result::Result<T, Error>;

/// A single task executor: the image to run and how to run it.
#[derive(Debug, Clone, Deserialize)]
pub struct Executor {
    /// The image reference as submitted.
    pub image: String,
    /// The command override, if any.
    #[serde(default)]
    pub command: Vec<String>,
    /// The environment passed to the container.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

/// A CPU/memory quantity pair.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct QuantitySet {
    /// The CPU quantity.
    #[serde(default)]
    pub cpu: Option<String>,
    /// The memory quantity.
    #[serde(default)]
    pub memory: Option<String>,
}

/// Requested pod resources, in Kubernetes quantity syntax.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ResourceSpec {
    /// The resource limits.
    #[serde(default)]
    pub limits: QuantitySet,
    /// The resource requests.
    #[serde(default)]
    pub requests: QuantitySet,
}

impl ResourceSpec {
    /// Validates quantity syntax and that limits cover requests.
    fn validate(&self) -> quantity::Result<()> {
        quantity::validate_cpu_resources(self.limits.cpu.as_deref(), self.requests.cpu.as_deref())?;
        quantity::validate_memory_resources(
            self.limits.memory.as_deref(),
            self.requests.memory.as_deref(),
        )
    }

    /// Converts into Kubernetes resource requirements.
    fn to_requirements(&self) -> ResourceRequirements {
        let collect = |set: &QuantitySet| {
            let mut map = BTreeMap::new();
            if let Some(cpu) = &set.cpu {
                map.insert("cpu".to_string(), Quantity(cpu.clone()));
            }
            if let Some(memory) = &set.memory {
                map.insert("memory".to_string(), Quantity(memory.clone()));
            }
            (!map.is_empty()).then_some(map)
        };

        ResourceRequirements {
            limits: collect(&self.limits),
            requests: collect(&self.requests),
            ..Default::default()
        }
    }
}

/// A database extraction query as submitted.
#[derive(Debug, Clone, Deserialize)]
pub struct DbQuery {
    /// The query text.
    #[serde(default)]
    pub query: Option<String>,
    /// The SQL dialect the query was written in.
    #[serde(default)]
    pub dialect: Option<String>,
}

/// A task submission.
///
/// Only a subset of these fields is persisted; the execution shape
/// (executors, mounts, resources, query, schedule) exists for the lifetime
/// of the request that launches the task.
#[derive(Debug, Clone, Deserialize)]
pub struct TaskDefinition {
    /// The task name.
    pub name: String,
    /// The free-form description.
    #[serde(default)]
    pub description: String,
    /// The dataset to run against.
    pub dataset_id: i64,
    /// The requesting user id.
    ///
    /// Populated by the authentication layer when absent from the body.
    #[serde(default)]
    pub requested_by: Option<String>,
    /// The executors; only the first is run.
    pub executors: Vec<Executor>,
    /// Input mounts: logical file name to mount path.
    #[serde(default)]
    pub inputs: BTreeMap<String, String>,
    /// Output mounts: logical folder name to mount path.
    #[serde(default)]
    pub outputs: BTreeMap<String, String>,
    /// Requested pod resources.
    #[serde(default)]
    pub resources: Option<ResourceSpec>,
    /// The extraction query.
    #[serde(default)]
    pub db_query: Option<DbQuery>,
    /// Whether the submission originates from the external task controller.
    #[serde(default, rename = "task_controller")]
    pub from_controller: bool,
    /// The delivery resource name; required when submitted by the
    /// controller.
    #[serde(default)]
    pub crd_name: Option<String>,
    /// A cron schedule; its presence promotes the task to a cron job.
    #[serde(default)]
    pub schedule: Option<String>,
}

/// The status of a scheduled task, summarized from its most recent job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CronStatus {
    /// How many pods of the job succeeded.
    pub succeeded: i32,
    /// How many pods of the job are ready.
    pub ready: i32,
    /// How many pods of the job failed.
    pub failed: i32,
}

/// A task status report.
///
/// Live states come straight from the cluster; when no pod can be found the
/// report falls back to the last confirmed marker, or to `deleted` if the
/// pod was last seen running. The fallback cannot distinguish "never
/// started" from "started and vanished" beyond that last observation.
#[derive(Debug, Clone, PartialEq)]
pub enum StatusReport {
    /// The live pod status.
    Live(TaskStatus),
    /// No pod exists; the last confirmed marker.
    Marker(TaskMarker),
    /// No pod exists and the task was last seen running.
    Deleted,
    /// The task is scheduled; the most recent job counts.
    Cron(CronStatus),
}

impl Serialize for StatusReport {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self {
            Self::Live(status) => status.serialize(serializer),
            Self::Marker(marker) => serializer.serialize_str(&marker.to_string()),
            Self::Deleted => serializer.serialize_str("deleted"),
            Self::Cron(status) => status.serialize(serializer),
        }
    }
}

/// The outcome of a results request.
#[derive(Debug, Clone)]
pub enum ResultsOutcome {
    /// The results archive was copied out of the cluster.
    Archive(PathBuf),
    /// Release review has not approved the task; the gate state is
    /// returned instead of an archive.
    ReviewPending(&'static str),
}

/// A validated, resolved task ready to launch.
struct Prepared {
    /// The dataset the task runs against.
    dataset: Dataset,
    /// The fully qualified image reference.
    docker_image: String,
    /// The first executor.
    executor: Executor,
    /// Normalized input mounts.
    inputs: BTreeMap<String, String>,
    /// Normalized output mounts.
    outputs: BTreeMap<String, String>,
    /// Validated resources.
    resources: Option<ResourceRequirements>,
    /// The prepared extraction query.
    query: Option<PodQuery>,
}

/// The task lifecycle service.
pub struct TaskService {
    /// The engine configuration.
    config: Arc<Config>,
    /// The node database.
    database: SharedDatabase,
    /// The cluster gateway.
    gateway: Arc<Gateway>,
    /// The remote registry API.
    registry_api: Arc<dyn RegistryApi>,
    /// The identity provider lookup.
    users: Arc<dyn UserLookup>,
}

impl TaskService {
    /// Constructs a new task service.
    pub fn new(
        config: Arc<Config>,
        database: SharedDatabase,
        gateway: Arc<Gateway>,
        registry_api: Arc<dyn RegistryApi>,
        users: Arc<dyn UserLookup>,
    ) -> Self {
        Self {
            config,
            database,
            gateway,
            registry_api,
            users,
        }
    }

    /// Validates a submission without creating anything.
    pub async fn validate(&self, def: &TaskDefinition) -> Result<()> {
        self.prepare(def).await.map(|_| ())
    }

    /// Submits a task: validates, persists the row, and launches the pod or
    /// cron job.
    ///
    /// If the launch fails outright the row is removed again so it does not
    /// linger in a `scheduled` state inconsistent with reality. A delivery
    /// registration failure is the one exception: the pod is genuinely
    /// running, so the row stays and the failure is surfaced as its own
    /// error category.
    pub async fn submit(&self, def: &TaskDefinition) -> Result<TaskRecord> {
        let prepared = self.prepare(def).await?;
        let requested_by = def
            .requested_by
            .clone()
            .ok_or_else(|| Error::InvalidRequest("a requesting user is required".to_string()))?;

        let record = self
            .database
            .insert_task(NewTask {
                name: def.name.trim().to_string(),
                docker_image: prepared.docker_image.clone(),
                description: def.description.clone(),
                requested_by,
                dataset_id: prepared.dataset.id,
            })
            .await?;

        match self.launch(&record, def, &prepared).await {
            Ok(()) => Ok(record),
            Err(e @ Error::CrdDelivery(_)) => Err(e),
            Err(e) => {
                if let Err(delete_err) = self.database.delete_task(record.id).await {
                    error!(
                        "failed to roll back task {id} after launch failure: {delete_err}",
                        id = record.id
                    );
                }
                Err(e)
            }
        }
    }

    /// Gets a task row.
    pub async fn get_task(&self, id: i64) -> Result<TaskRecord> {
        Ok(self.database.get_task(id).await?)
    }

    /// Lists all task rows.
    pub async fn list_tasks(&self) -> Result<Vec<TaskRecord>> {
        Ok(self.database.list_tasks().await?)
    }

    /// Validates and resolves a submission.
    async fn prepare(&self, def: &TaskDefinition) -> Result<Prepared> {
        if def.name.trim().is_empty() {
            return Err(Error::InvalidRequest("name is a mandatory field".to_string()));
        }

        let executor = def
            .executors
            .first()
            .cloned()
            .ok_or_else(|| Error::InvalidRequest("at least one executor is required".to_string()))?;

        let query = match &def.db_query {
            None => None,
            Some(q) => match q.query.as_deref().filter(|q| !q.trim().is_empty()) {
                Some(text) => Some(PodQuery {
                    query: text.to_string(),
                    from_dialect: q.dialect.clone().unwrap_or_else(|| "postgres".to_string()),
                }),
                None => {
                    return Err(Error::InvalidRequest(
                        "`db_query` field must include a `query`".to_string(),
                    ));
                }
            },
        };

        if def.from_controller && def.crd_name.as_deref().unwrap_or("").is_empty() {
            return Err(Error::InvalidRequest(
                "Missing crd name in the request, or None passed".to_string(),
            ));
        }

        let resources = match &def.resources {
            Some(spec) => {
                spec.validate()?;
                Some(spec.to_requirements())
            }
            None => None,
        };

        let dataset = self.database.get_dataset(def.dataset_id).await?;
        let docker_image = self.resolve_image(&executor.image).await?;

        let mut outputs = def.outputs.clone();
        if outputs.is_empty() {
            outputs.insert(
                "results".to_string(),
                self.config.task_pod_results_path.clone(),
            );
        }

        Ok(Prepared {
            dataset,
            docker_image,
            executor,
            inputs: def.inputs.clone(),
            outputs,
            resources,
            query,
        })
    }

    /// Splits the registry prefix off an image reference.
    ///
    /// Scans the `/`-delimited name from the left, trying each increasing
    /// prefix against the known registries; the first (leftmost-shortest)
    /// match wins. Registries whose URLs are prefixes of each other resolve
    /// to the shorter one by construction; that tie-break is part of the
    /// contract.
    pub async fn split_registry_from_image(
        database: &dyn fednode_db::Database,
        image: &str,
    ) -> Result<Option<(Registry, String)>> {
        let registries = database.list_registries().await?;
        let segments: Vec<&str> = image.split('/').collect();

        for end in 1..segments.len() {
            let candidate = segments[..end].join("/");
            if let Some(registry) = registries
                .iter()
                .filter(|r| r.active)
                .find(|r| r.name() == candidate || r.url == candidate)
            {
                return Ok(Some((registry.clone(), segments[end..].join("/"))));
            }
        }

        Ok(None)
    }

    /// Resolves a submitted image reference to a fully qualified, pullable
    /// image name.
    ///
    /// Resolution finds the registry prefix, matches the remainder against
    /// the registered containers, and additionally asks the registry's
    /// remote API whether the tag or digest still exists: a locally cached
    /// row may reference a since-deleted remote image, and the two failure
    /// modes produce distinct errors.
    async fn resolve_image(&self, image: &str) -> Result<String> {
        let (registry, remainder) =
            Self::split_registry_from_image(self.database.as_ref(), image)
                .await?
                .ok_or_else(|| Error::ImageNotFound(image.to_string()))?;

        let image_ref: ImageRef = remainder
            .parse()
            .map_err(|e: anyhow::Error| Error::InvalidRequest(e.to_string()))?;

        let container = self
            .database
            .find_container(registry.id, image_ref.name(), &image_ref)
            .await?
            .ok_or_else(|| Error::ImageNotFound(image.to_string()))?;

        match self.registry_api.has_image(&registry, &image_ref).await {
            Ok(true) => Ok(container.full_image_name(&registry)),
            Ok(false) => Err(Error::ImageNotOnRegistry(image.to_string())),
            Err(e) => Err(Error::RegistryCheck(e.to_string())),
        }
    }

    /// Launches the pod or cron job for a freshly inserted task row.
    async fn launch(
        &self,
        record: &TaskRecord,
        def: &TaskDefinition,
        prepared: &Prepared,
    ) -> Result<()> {
        let suffix = name::Alphanumeric::default().generate();
        let pod_name = name::pod_name(&record.name, &suffix);

        let labels = BTreeMap::from([
            (TASK_ID_LABEL.to_string(), record.id.to_string()),
            (REQUESTED_BY_LABEL.to_string(), record.requested_by.clone()),
            (
                name::DELETE_BY_LABEL.to_string(),
                name::expiration_label(Utc::now(), self.config.cleanup_after_days),
            ),
        ]);

        let credentials = self.dataset_credentials(&prepared.dataset).await?;
        let task_pod = TaskPod {
            name: pod_name,
            task_id: record.id,
            image: prepared.docker_image.clone(),
            labels,
            command: prepared.executor.command.clone(),
            environment: prepared.executor.env.clone(),
            inputs: prepared.inputs.clone(),
            outputs: prepared.outputs.clone(),
            resources: prepared.resources.clone(),
            db_query: prepared.query.clone(),
            dataset: prepared.dataset.clone(),
            credentials,
        };

        let volume = self
            .gateway
            .ensure_storage(&task_pod.storage_spec(&self.config))
            .await?;
        let pod = task_pod.build(&self.config, &volume);

        match &def.schedule {
            Some(schedule) => {
                let binding = def.crd_name.as_ref().map(|crd_name| cron::ControllerBinding {
                    crd_name: crd_name.clone(),
                    crd_domain: self.config.crd_domain.clone(),
                    kubectl_image: self.config.kubectl_image.clone(),
                });
                let cronjob =
                    cron::build_cronjob(&record.name, &suffix, &pod, schedule, binding.as_ref());
                self.gateway.create_cronjob(&cronjob).await?;
                info!(
                    "created cron job `{name}` for task {id}",
                    name = cronjob.name_any(),
                    id = record.id
                );
            }
            None => {
                // Check-then-act: two near-simultaneous submissions can race
                // between this lookup and the create below
                if self.current_pod(record, true).await?.is_some() {
                    return Err(Error::AlreadyRunning);
                }

                self.gateway.create_pod(&pod).await?;
                info!(
                    "created pod `{name}` for task {id}",
                    name = pod.name_any(),
                    id = record.id
                );
            }
        }

        if !def.from_controller && self.config.task_controller_enabled {
            self.register_delivery(record, &prepared.dataset).await?;
        }

        Ok(())
    }

    /// Reads the dataset's database credentials from its secret.
    async fn dataset_credentials(&self, dataset: &Dataset) -> Result<DatasetCredentials> {
        let secret = self
            .gateway
            .read_secret(
                &dataset.creds_secret_name(),
                self.gateway.default_namespace(),
            )
            .await?;

        Ok(DatasetCredentials {
            user: Gateway::secret_value(&secret, SECRET_USER_KEY)?,
            password: Gateway::secret_value(&secret, SECRET_PASSWORD_KEY)?.into(),
        })
    }

    /// Gets the newest pod for a task whose image matches the task row.
    ///
    /// Multiple historical pods can carry the same task id after retries;
    /// the newest live one wins. With `running_only`, pods whose first
    /// container already terminated are skipped.
    async fn current_pod(&self, record: &TaskRecord, running_only: bool) -> Result<Option<Pod>> {
        let pods = self
            .gateway
            .list_pods(Some(&format!("{TASK_ID_LABEL}={id}", id = record.id)))
            .await?;

        Ok(pods.into_iter().find(|pod| {
            let image_matches = pod
                .spec
                .as_ref()
                .and_then(|s| s.containers.first())
                .and_then(|c| c.image.as_deref())
                == Some(record.docker_image.as_str());
            image_matches && (!running_only || !TaskStatus::from_pod(pod).is_terminated())
        }))
    }

    /// Derives the task's status.
    ///
    /// The cluster is the source of truth: the status is recomputed on
    /// every call, never cached, so the answer always reflects current
    /// cluster state.
    pub async fn status(&self, id: i64) -> Result<StatusReport> {
        let record = self.database.get_task(id).await?;

        let cronjobs = self
            .gateway
            .list_cronjobs(Some(&format!("{TASK_ID_LABEL}={id}")))
            .await?;
        if !cronjobs.is_empty() {
            let jobs = self
                .gateway
                .list_jobs(Some(&format!("{TASK_ID_LABEL}={id}")))
                .await?;
            let status = jobs
                .first()
                .and_then(|j| j.status.as_ref())
                .map(|s| CronStatus {
                    succeeded: s.succeeded.unwrap_or_default(),
                    ready: s.ready.unwrap_or_default(),
                    failed: s.failed.unwrap_or_default(),
                })
                .unwrap_or(CronStatus {
                    succeeded: 0,
                    ready: 0,
                    failed: 0,
                });
            return Ok(StatusReport::Cron(status));
        }

        match self.current_pod(&record, false).await? {
            Some(pod) => {
                let status = TaskStatus::from_pod(&pod);
                if let Some(marker) = marker_for(&status) {
                    self.database.update_task_marker(id, marker).await?;
                }
                Ok(StatusReport::Live(status))
            }
            None => match record.marker {
                TaskMarker::Running => Ok(StatusReport::Deleted),
                marker => Ok(StatusReport::Marker(marker)),
            },
        }
    }

    /// Cancels a task: best-effort pod deletion and a terminal marker.
    ///
    /// A failure to delete (including the pod already being gone) is
    /// reported as an already-cancelled condition after the marker is set;
    /// the derived status is never `running` afterwards.
    pub async fn cancel(&self, id: i64) -> Result<TaskRecord> {
        let record = self.database.get_task(id).await?;

        let mut delete_failed = false;
        match self.current_pod(&record, false).await? {
            Some(pod) => {
                if let Err(e) = self.gateway.delete_pod(&pod.name_any()).await {
                    error!(
                        "failed to delete pod `{name}`: {e}",
                        name = pod.name_any()
                    );
                    delete_failed = true;
                }
            }
            None => delete_failed = true,
        }

        self.database
            .update_task_marker(id, TaskMarker::Cancelled)
            .await?;

        if delete_failed {
            return Err(Error::AlreadyCancelled);
        }
        self.database.get_task(id).await.map_err(Into::into)
    }

    /// Retrieves the task's results as a local archive.
    ///
    /// Spins up an ephemeral job that mounts the task's volume read-only,
    /// waits for its pod, streams the results subtree into an archive, and
    /// deletes the helper pod and job again whether or not the copy
    /// succeeded.
    pub async fn get_results(&self, id: i64, admin: bool) -> Result<ResultsOutcome> {
        let record = self.database.get_task(id).await?;

        if results_expired(
            record.created_at,
            Utc::now(),
            self.config.cleanup_after_days,
        ) {
            return Err(Error::ResultsExpired);
        }

        if self.config.task_review_required
            && !admin
            && record.review_status != ReviewStatus::Approved
        {
            return Ok(ResultsOutcome::ReviewPending(record.review_status.label()));
        }

        let claim_name = self.results_claim_name(&record).await?;
        let job_name = format!(
            "result-job-{suffix}",
            suffix = name::Alphanumeric::default().generate()
        );
        let job = self.results_job(&record, &job_name, &claim_name);

        match self.gateway.create_job(&job).await {
            Ok(_) => {}
            Err(fednode_cluster::Error::Transport(e)) => {
                error!("cluster unreachable while creating results job: {e}");
                return Err(Error::ClusterUnavailable);
            }
            Err(e) => return Err(e.into()),
        }

        let ready = self
            .gateway
            .wait_until_pod_ready(
                &format!("job-name={job_name}"),
                self.config.results_fetch_timeout,
            )
            .await;

        let fetcher = match ready {
            Ok(pod) => pod,
            Err(e) => {
                // Do not leak the helper job on a failed wait
                self.cleanup_results_job(&job_name, None).await;
                return match e {
                    fednode_cluster::Error::ReadyTimeout(_) => Err(Error::ResultsNotReady),
                    other => Err(other.into()),
                };
            }
        };

        let copied = self
            .gateway
            .copy_from_pod(
                &fetcher.name_any(),
                None,
                &format!(
                    "{base}/{id}",
                    base = self.config.task_pod_results_path,
                    id = record.id
                ),
                &self.config.results_path.join(record.id.to_string()),
                "results.tar",
            )
            .await;

        // Cleanup happens whether or not the copy succeeded
        self.cleanup_results_job(&job_name, Some(&fetcher.name_any())).await;

        Ok(ResultsOutcome::Archive(copied?))
    }

    /// Deletes the results helper pod and job, logging failures.
    async fn cleanup_results_job(&self, job_name: &str, pod_name: Option<&str>) {
        if let Some(pod_name) = pod_name {
            if let Err(e) = self.gateway.delete_pod(pod_name).await {
                error!("failed to delete results pod `{pod_name}`: {e}");
            }
        }
        if let Err(e) = self.gateway.delete_job(job_name).await {
            error!("failed to delete results job `{job_name}`: {e}");
        }
    }

    /// Finds the claim backing the task's shared volume.
    ///
    /// Scheduled tasks carry it in their cron job template; plain tasks in
    /// their newest pod.
    async fn results_claim_name(&self, record: &TaskRecord) -> Result<String> {
        let cronjobs = self
            .gateway
            .list_cronjobs(Some(&format!("{TASK_ID_LABEL}={id}", id = record.id)))
            .await?;
        if let Some(cronjob) = cronjobs.first() {
            return cronjob
                .spec
                .as_ref()
                .and_then(|s| s.job_template.spec.as_ref())
                .and_then(|s| s.template.spec.as_ref())
                .and_then(|s| s.volumes.as_ref())
                .and_then(|v| v.first())
                .and_then(|v| v.persistent_volume_claim.as_ref())
                .map(|c| c.claim_name.clone())
                .ok_or(Error::CronJobNotFound);
        }

        let pod = self
            .current_pod(record, false)
            .await?
            .ok_or_else(|| Error::InvalidRequest("no pod found for the task".to_string()))?;
        pod.spec
            .as_ref()
            .and_then(|s| s.volumes.as_ref())
            .and_then(|v| v.first())
            .and_then(|v| v.persistent_volume_claim.as_ref())
            .map(|c| c.claim_name.clone())
            .ok_or_else(|| Error::InvalidRequest("the task pod has no results volume".to_string()))
    }

    /// Builds the ephemeral results-fetcher job.
    ///
    /// The job's pod holds idle with the task volume mounted read-only so
    /// the engine can stream the archive out, then both are deleted.
    fn results_job(&self, record: &TaskRecord, job_name: &str, claim_name: &str) -> Job {
        let labels = BTreeMap::from([
            (TASK_ID_LABEL.to_string(), record.id.to_string()),
            (REQUESTED_BY_LABEL.to_string(), record.requested_by.clone()),
        ]);

        Job {
            metadata: ObjectMeta {
                name: Some(job_name.to_string()),
                labels: Some(labels.clone()),
                ..Default::default()
            },
            spec: Some(JobSpec {
                backoff_limit: Some(1),
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(labels),
                        ..Default::default()
                    }),
                    spec: Some(PodSpec {
                        containers: vec![Container {
                            name: "results-fetcher".to_string(),
                            image: Some(self.config.alpine_image.clone()),
                            command: Some(vec!["sleep".to_string(), "86400".to_string()]),
                            volume_mounts: Some(vec![VolumeMount {
                                name: "data".to_string(),
                                mount_path: self.config.task_pod_results_path.clone(),
                                read_only: Some(true),
                                ..Default::default()
                            }]),
                            ..Default::default()
                        }],
                        restart_policy: Some("Never".to_string()),
                        volumes: Some(vec![Volume {
                            name: "data".to_string(),
                            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                                claim_name: claim_name.to_string(),
                                read_only: Some(true),
                            }),
                            ..Default::default()
                        }]),
                        ..Default::default()
                    }),
                },
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// Gets the logs of every pod the task has had, newest pod first.
    pub async fn get_logs(&self, id: i64) -> Result<BTreeMap<String, Vec<String>>> {
        // Ensure the task exists before hitting the cluster
        self.database.get_task(id).await?;

        let pods = self
            .gateway
            .list_pods(Some(&format!("{TASK_ID_LABEL}={id}")))
            .await?;

        let mut logs = BTreeMap::new();
        for (index, pod) in pods.iter().enumerate() {
            let container = pod
                .spec
                .as_ref()
                .and_then(|s| s.containers.first())
                .map(|c| c.name.as_str());
            let lines = self.gateway.pod_logs(&pod.name_any(), container).await?;
            logs.insert(format!("pod_{index}"), lines);
        }

        Ok(logs)
    }

    /// Suspends the task's cron job.
    pub async fn suspend(&self, id: i64) -> Result<()> {
        self.set_cron_suspend(id, true).await
    }

    /// Resumes the task's cron job.
    pub async fn resume(&self, id: i64) -> Result<()> {
        self.set_cron_suspend(id, false).await
    }

    /// Flips the suspend flag on the task's cron job.
    ///
    /// Asking for the state the cron job is already in is a client error,
    /// not a no-op.
    async fn set_cron_suspend(&self, id: i64, suspend: bool) -> Result<()> {
        self.database.get_task(id).await?;

        let cronjobs = self
            .gateway
            .list_cronjobs(Some(&format!("{TASK_ID_LABEL}={id}")))
            .await?;
        let cronjob = cronjobs.first().ok_or(Error::CronJobNotFound)?;

        let current = cronjob
            .spec
            .as_ref()
            .and_then(|s| s.suspend)
            .unwrap_or(false);
        if current == suspend {
            return Err(Error::InvalidRequest(format!(
                "CronJob is already set to be {state}",
                state = if suspend { "suspended" } else { "enabled" }
            )));
        }

        self.gateway
            .patch_cronjob(
                &cronjob.name_any(),
                &serde_json::json!({ "spec": { "suspend": suspend } }),
            )
            .await?;
        Ok(())
    }

    /// Applies a review decision to the task.
    ///
    /// Review is write-once; a second decision is rejected.
    pub async fn review(&self, id: i64, approve: bool) -> Result<&'static str> {
        let record = self.database.get_task(id).await?;
        let decided = record.review_status.decide(approve)?;
        self.database.update_review_status(id, decided).await?;
        Ok(decided.label())
    }

    /// Gets the task's review gate label.
    pub async fn review_status(&self, id: i64) -> Result<&'static str> {
        Ok(self.database.get_task(id).await?.review_status.label())
    }

    /// Registers (or refreshes) the delivery resource for a task.
    ///
    /// A resource that already exists is refreshed rather than duplicated;
    /// any other failure is surfaced as a delivery-specific error so the
    /// caller can tell "pod is running but delivery registration failed"
    /// from "pod never started".
    async fn register_delivery(&self, record: &TaskRecord, dataset: &Dataset) -> Result<()> {
        let username = self
            .users
            .username(&record.requested_by)
            .await
            .map_err(|e| Error::CrdDelivery(e.to_string()))?;

        let domain = &self.config.crd_domain;
        let annotations = BTreeMap::from([
            (format!("{domain}/task_id"), record.id.to_string()),
            (format!("{domain}/user"), username.clone()),
            (format!("{domain}/done"), "true".to_string()),
        ]);

        let existing = self
            .get_task_crd(record.id)
            .await
            .map_err(|e| Error::CrdDelivery(e.to_string()))?;
        if let Some(existing) = existing {
            self.gateway
                .patch_analytics_annotations(&existing.name_any(), &annotations)
                .await
                .map_err(|e| Error::CrdDelivery(e.to_string()))?;
            return Ok(());
        }

        let crd = Analytics {
            metadata: ObjectMeta {
                generate_name: Some("analytics-".to_string()),
                annotations: Some(annotations),
                ..Default::default()
            },
            spec: AnalyticsSpec {
                user: username,
                image: record.docker_image.clone(),
                dataset: dataset.name.clone(),
            },
        };

        match self.gateway.create_analytics(&crd).await {
            Ok(_) => Ok(()),
            // Already registered by a concurrent submission
            Err(e) if e.is_conflict() => Ok(()),
            Err(e) => Err(Error::CrdDelivery(e.to_string())),
        }
    }

    /// Finds the delivery resource for a task.
    ///
    /// Resources are keyed by the task id annotation, not by name, so every
    /// lookup scans the full listing. That is a documented scaling
    /// limitation at high task volumes.
    pub async fn get_task_crd(&self, task_id: i64) -> Result<Option<Analytics>> {
        let domain = &self.config.crd_domain;
        Ok(self
            .gateway
            .list_analytics()
            .await?
            .into_iter()
            .find(|crd| crd.is_for_task(domain, task_id)))
    }

    /// Gets the name of the task's delivery resource, if one exists.
    pub async fn crd_name(&self, task_id: i64) -> Result<Option<String>> {
        Ok(self.get_task_crd(task_id).await?.map(|crd| crd.name_any()))
    }

    /// Updates the annotations of the task's delivery resource.
    pub async fn update_task_crd(
        &self,
        task_id: i64,
        annotations: &BTreeMap<String, String>,
    ) -> Result<()> {
        let crd = self
            .get_task_crd(task_id)
            .await?
            .ok_or_else(|| Error::InvalidRequest("no delivery resource for the task".to_string()))?;
        self.gateway
            .patch_analytics_annotations(&crd.name_any(), annotations)
            .await?;
        Ok(())
    }
}

/// Maps a live status onto the persisted marker, when there is one to
/// remember.
fn marker_for(status: &TaskStatus) -> Option<TaskMarker> {
    match status {
        TaskStatus::Pending => None,
        TaskStatus::Waiting { .. } => Some(TaskMarker::Waiting),
        TaskStatus::Running { .. } => Some(TaskMarker::Running),
        TaskStatus::Terminated { .. } => Some(TaskMarker::Terminated),
    }
}

/// Whether a task is past its results retention window.
fn results_expired(created_at: DateTime<Utc>, now: DateTime<Utc>, retention_days: i64) -> bool {
    match created_at.checked_add_days(Days::new(retention_days.max(0) as u64)) {
        Some(deadline) => now > deadline,
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use fednode_db::MemoryDatabase;

    use super::*;

    fn registry(url: &str) -> Registry {
        Registry {
            id: 0,
            url: url.to_string(),
            username: None,
            password: None,
            active: true,
        }
    }

    #[tokio::test]
    async fn registry_resolution_prefers_leftmost_shortest_prefix() {
        let db = MemoryDatabase::new();
        db.insert_registry(registry("a")).await;
        db.insert_registry(registry("a/b")).await;

        let (matched, remainder) =
            TaskService::split_registry_from_image(&db, "a/b/c:tag")
                .await
                .unwrap()
                .unwrap();
        assert_eq!(matched.url, "a");
        assert_eq!(remainder, "b/c:tag");
    }

    #[tokio::test]
    async fn registry_resolution_matches_exact_url() {
        let db = MemoryDatabase::new();
        db.insert_registry(registry("ghcr.io")).await;

        let (matched, remainder) =
            TaskService::split_registry_from_image(&db, "ghcr.io/org/repo:tag")
                .await
                .unwrap()
                .unwrap();
        assert_eq!(matched.url, "ghcr.io");
        assert_eq!(remainder, "org/repo:tag");

        assert!(
            TaskService::split_registry_from_image(&db, "docker.io/org/repo:tag")
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn registry_resolution_skips_inactive_registries() {
        let db = MemoryDatabase::new();
        let mut inactive = registry("ghcr.io");
        inactive.active = false;
        db.insert_registry(inactive).await;

        assert!(
            TaskService::split_registry_from_image(&db, "ghcr.io/org/repo:tag")
                .await
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn retention_window_is_enforced() {
        let created = Utc::now() - chrono::Duration::days(5);
        assert!(results_expired(created, Utc::now(), 3));
        assert!(!results_expired(created, Utc::now(), 7));
        assert!(!results_expired(Utc::now(), Utc::now(), 0));
    }

    #[test]
    fn status_report_serialization_shapes() {
        let deleted = serde_json::to_value(StatusReport::Deleted).unwrap();
        assert_eq!(deleted, "deleted");

        let marker = serde_json::to_value(StatusReport::Marker(TaskMarker::Scheduled)).unwrap();
        assert_eq!(marker, "scheduled");

        let cron = serde_json::to_value(StatusReport::Cron(CronStatus {
            succeeded: 1,
            ready: 0,
            failed: 0,
        }))
        .unwrap();
        assert_eq!(cron["succeeded"], 1);

        let live = serde_json::to_value(StatusReport::Live(TaskStatus::Pending)).unwrap();
        assert_eq!(live, "pending");
    }

    #[test]
    fn resource_spec_converts_to_requirements() {
        let spec = ResourceSpec {
            limits: QuantitySet {
                cpu: Some("1".to_string()),
                memory: Some("1Gi".to_string()),
            },
            requests: QuantitySet {
                cpu: Some("500m".to_string()),
                memory: None,
            },
        };
        spec.validate().unwrap();

        let requirements = spec.to_requirements();
        assert_eq!(
            requirements.limits.unwrap().get("cpu").unwrap().0,
            "1"
        );
        let requests = requirements.requests.unwrap();
        assert_eq!(requests.get("cpu").unwrap().0, "500m");
        assert!(!requests.contains_key("memory"));
    }

    #[test]
    fn resource_spec_rejects_limit_below_request() {
        let spec = ResourceSpec {
            limits: QuantitySet {
                cpu: Some("100m".to_string()),
                memory: None,
            },
            requests: QuantitySet {
                cpu: Some("200m".to_string()),
                memory: None,
            },
        };
        assert!(spec.validate().is_err());
    }

    #[test]
    fn task_definition_deserializes_from_request_shape() {
        let def: TaskDefinition = serde_json::from_str(
            r#"{
                "name": "pheno analysis",
                "dataset_id": 7,
                "executors": [{
                    "image": "acr.azurecr.io/org/analytics:1.0",
                    "env": {"MODE": "full"}
                }],
                "db_query": {"query": "SELECT 1", "dialect": "postgres"},
                "task_controller": true,
                "crd_name": "analytics-x1",
                "schedule": "0 12 * * *"
            }"#,
        )
        .unwrap();

        assert_eq!(def.executors[0].image, "acr.azurecr.io/org/analytics:1.0");
        assert!(def.from_controller);
        assert_eq!(def.schedule.as_deref(), Some("0 12 * * *"));
        assert!(def.outputs.is_empty());
    }
}
