//! The cluster gateway implementation.

use std::collections::BTreeMap;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context as _;
use k8s_openapi::api::batch::v1::CronJob;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::PersistentVolume;
use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::api::core::v1::Secret;
use kube::Api;
use kube::Client;
use kube::ResourceExt;
use kube::api::AttachParams;
use kube::api::DeleteParams;
use kube::api::ListParams;
use kube::api::LogParams;
use kube::api::Patch;
use kube::api::PatchParams;
use kube::api::PostParams;
use kube::core::ErrorResponse;
use tracing::debug;
use tracing::warn;

use crate::Analytics;
use crate::Error;
use crate::Result;
use crate::TaskStatus;

/// The interval between readiness polls.
const READY_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// The PV/PVC pair backing a task's shared results volume.
///
/// Built by the pod spec builder; persisted by [`Gateway::ensure_storage`].
#[derive(Debug, Clone)]
pub struct TaskStorage {
    /// The persistent volume.
    pub pv: PersistentVolume,
    /// The persistent volume claim bound to it.
    pub pvc: PersistentVolumeClaim,
}

impl TaskStorage {
    /// Gets the volume reference a pod spec mounts.
    pub fn volume_ref(&self) -> VolumeRef {
        VolumeRef {
            claim_name: self.pvc.name_any(),
        }
    }
}

/// A reference to provisioned task storage.
#[derive(Debug, Clone)]
pub struct VolumeRef {
    /// The name of the persistent volume claim.
    pub claim_name: String,
}

/// The gateway to the Kubernetes cluster.
///
/// Operations are thin wrappers over the namespaced object APIs with the
/// idempotency rules the engine relies on: deletes absorb 404s, and
/// storage/secret creation absorbs 409s. Pod creation does *not* absorb
/// conflicts; a duplicate pod is a hard error for the caller to surface.
#[derive(Clone)]
pub struct Gateway {
    /// The Kubernetes client.
    client: Client,
    /// The namespace task pods run in.
    task_namespace: String,
    /// The namespace shared node services run in.
    default_namespace: String,
}

impl Gateway {
    /// Constructs a gateway from the default Kubernetes client
    /// configuration (in-cluster when available, kubeconfig otherwise).
    pub async fn connect(
        task_namespace: impl Into<String>,
        default_namespace: impl Into<String>,
    ) -> Result<Self> {
        let client = Client::try_default()
            .await
            .map_err(|e| Error::Transport(e.to_string()))?;
        Ok(Self::new(client, task_namespace, default_namespace))
    }

    /// Constructs a gateway from an existing client.
    pub fn new(
        client: Client,
        task_namespace: impl Into<String>,
        default_namespace: impl Into<String>,
    ) -> Self {
        Self {
            client,
            task_namespace: task_namespace.into(),
            default_namespace: default_namespace.into(),
        }
    }

    /// Gets the namespace task pods run in.
    pub fn task_namespace(&self) -> &str {
        &self.task_namespace
    }

    /// Gets the namespace shared node services run in.
    pub fn default_namespace(&self) -> &str {
        &self.default_namespace
    }

    /// The pods API in the task namespace.
    fn pods(&self) -> Api<Pod> {
        Api::namespaced(self.client.clone(), &self.task_namespace)
    }

    /// The jobs API in the task namespace.
    fn jobs(&self) -> Api<Job> {
        Api::namespaced(self.client.clone(), &self.task_namespace)
    }

    /// The cron jobs API in the task namespace.
    fn cronjobs(&self) -> Api<CronJob> {
        Api::namespaced(self.client.clone(), &self.task_namespace)
    }

    /// Creates a pod in the task namespace.
    pub async fn create_pod(&self, pod: &Pod) -> Result<Pod> {
        debug!("creating pod `{name}`", name = pod.name_any());
        Ok(self.pods().create(&PostParams::default(), pod).await?)
    }

    /// Lists pods in the task namespace, newest first.
    pub async fn list_pods(&self, label_selector: Option<&str>) -> Result<Vec<Pod>> {
        let mut params = ListParams::default();
        if let Some(selector) = label_selector {
            params = params.labels(selector);
        }

        let mut pods = self.pods().list(&params).await?.items;
        pods.sort_by(|a, b| {
            b.metadata
                .creation_timestamp
                .as_ref()
                .map(|t| t.0)
                .cmp(&a.metadata.creation_timestamp.as_ref().map(|t| t.0))
        });
        Ok(pods)
    }

    /// Deletes a pod in the task namespace.
    ///
    /// An already-deleted pod is treated as success.
    pub async fn delete_pod(&self, name: &str) -> Result<()> {
        debug!("deleting pod `{name}`");
        match self.pods().delete(name, &DeleteParams::default()).await {
            Ok(_) | Err(kube::Error::Api(ErrorResponse { code: 404, .. })) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Reads the log lines of a pod container in the task namespace.
    pub async fn pod_logs(&self, name: &str, container: Option<&str>) -> Result<Vec<String>> {
        let logs = self
            .pods()
            .logs(name, &LogParams {
                container: container.map(String::from),
                timestamps: true,
                ..Default::default()
            })
            .await?;
        Ok(logs.lines().map(String::from).collect())
    }

    /// Creates a job in the task namespace.
    pub async fn create_job(&self, job: &Job) -> Result<Job> {
        debug!("creating job `{name}`", name = job.name_any());
        Ok(self.jobs().create(&PostParams::default(), job).await?)
    }

    /// Lists jobs in the task namespace.
    pub async fn list_jobs(&self, label_selector: Option<&str>) -> Result<Vec<Job>> {
        let mut params = ListParams::default();
        if let Some(selector) = label_selector {
            params = params.labels(selector);
        }
        Ok(self.jobs().list(&params).await?.items)
    }

    /// Deletes a job and its pods in the task namespace.
    ///
    /// An already-deleted job is treated as success.
    pub async fn delete_job(&self, name: &str) -> Result<()> {
        debug!("deleting job `{name}`");
        match self.jobs().delete(name, &DeleteParams::background()).await {
            Ok(_) | Err(kube::Error::Api(ErrorResponse { code: 404, .. })) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Creates a cron job in the task namespace.
    pub async fn create_cronjob(&self, cronjob: &CronJob) -> Result<CronJob> {
        debug!("creating cron job `{name}`", name = cronjob.name_any());
        Ok(self
            .cronjobs()
            .create(&PostParams::default(), cronjob)
            .await?)
    }

    /// Lists cron jobs in the task namespace.
    pub async fn list_cronjobs(&self, label_selector: Option<&str>) -> Result<Vec<CronJob>> {
        let mut params = ListParams::default();
        if let Some(selector) = label_selector {
            params = params.labels(selector);
        }
        Ok(self.cronjobs().list(&params).await?.items)
    }

    /// Merge-patches a cron job in the task namespace.
    pub async fn patch_cronjob(&self, name: &str, patch: &serde_json::Value) -> Result<CronJob> {
        debug!("patching cron job `{name}`");
        Ok(self
            .cronjobs()
            .patch(name, &PatchParams::default(), &Patch::Merge(patch))
            .await?)
    }

    /// Reads a secret from the given namespace.
    pub async fn read_secret(&self, name: &str, namespace: &str) -> Result<Secret> {
        Ok(Api::<Secret>::namespaced(self.client.clone(), namespace)
            .get(name)
            .await?)
    }

    /// Decodes a string value from a secret.
    pub fn secret_value(secret: &Secret, key: &str) -> Result<String> {
        let bytes = secret
            .data
            .as_ref()
            .and_then(|d| d.get(key))
            .with_context(|| {
                format!(
                    "secret `{name}` has no `{key}` entry",
                    name = secret.name_any()
                )
            })?;
        Ok(String::from_utf8(bytes.0.clone())
            .with_context(|| format!("secret value `{key}` is not valid UTF-8"))?)
    }

    /// Creates an opaque secret in each of the given namespaces.
    ///
    /// A namespace that already holds the secret is skipped (409 absorbed).
    pub async fn create_secret(
        &self,
        name: &str,
        values: &BTreeMap<String, String>,
        namespaces: &[&str],
    ) -> Result<()> {
        let secret = Secret {
            metadata: kube::api::ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            string_data: Some(values.clone()),
            type_: Some("Opaque".to_string()),
            ..Default::default()
        };

        for namespace in namespaces {
            let api = Api::<Secret>::namespaced(self.client.clone(), namespace);
            match api.create(&PostParams::default(), &secret).await {
                Ok(_) | Err(kube::Error::Api(ErrorResponse { code: 409, .. })) => {}
                Err(e) => return Err(e.into()),
            }
        }

        Ok(())
    }

    /// Merge-patches the string data of a secret.
    pub async fn patch_secret(
        &self,
        name: &str,
        namespace: &str,
        values: &BTreeMap<String, String>,
    ) -> Result<Secret> {
        Ok(Api::<Secret>::namespaced(self.client.clone(), namespace)
            .patch(
                name,
                &PatchParams::default(),
                &Patch::Merge(serde_json::json!({ "stringData": values })),
            )
            .await?)
    }

    /// Deletes a secret from the given namespace.
    ///
    /// An already-deleted secret is treated as success.
    pub async fn delete_secret(&self, name: &str, namespace: &str) -> Result<()> {
        let api = Api::<Secret>::namespaced(self.client.clone(), namespace);
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) | Err(kube::Error::Api(ErrorResponse { code: 404, .. })) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Provisions a task's storage, returning the volume reference its pod
    /// spec mounts.
    ///
    /// Idempotent: storage that already exists (409) is reused.
    pub async fn ensure_storage(&self, storage: &TaskStorage) -> Result<VolumeRef> {
        let volumes = Api::<PersistentVolume>::all(self.client.clone());
        match volumes.create(&PostParams::default(), &storage.pv).await {
            Ok(_) | Err(kube::Error::Api(ErrorResponse { code: 409, .. })) => {}
            Err(e) => return Err(e.into()),
        }

        let claims =
            Api::<PersistentVolumeClaim>::namespaced(self.client.clone(), &self.task_namespace);
        match claims.create(&PostParams::default(), &storage.pvc).await {
            Ok(_) | Err(kube::Error::Api(ErrorResponse { code: 409, .. })) => {}
            Err(e) => return Err(e.into()),
        }

        Ok(storage.volume_ref())
    }

    /// Blocks until a pod matching the label selector reports a running
    /// container, polling the pod list.
    ///
    /// Returns the matching pod, or [`Error::ReadyTimeout`] once the
    /// timeout elapses.
    pub async fn wait_until_pod_ready(
        &self,
        label_selector: &str,
        timeout: Duration,
    ) -> Result<Pod> {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            for pod in self.list_pods(Some(label_selector)).await? {
                if TaskStatus::from_pod(&pod).is_running() {
                    return Ok(pod);
                }
            }

            if tokio::time::Instant::now() >= deadline {
                return Err(Error::ReadyTimeout(timeout));
            }

            tokio::time::sleep(READY_POLL_INTERVAL).await;
        }
    }

    /// Copies a directory tree out of a running pod into a local tar
    /// archive, returning the archive path.
    ///
    /// The copy is streamed through a `tar` process exec'd in the pod, the
    /// same transport `kubectl cp` uses.
    pub async fn copy_from_pod(
        &self,
        pod_name: &str,
        container: Option<&str>,
        source_path: &str,
        dest_dir: &Path,
        archive_name: &str,
    ) -> Result<PathBuf> {
        debug!("copying `{source_path}` out of pod `{pod_name}`");

        let mut params = AttachParams::default().stdout(true).stderr(false);
        if let Some(container) = container {
            params = params.container(container);
        }

        let mut process = self
            .pods()
            .exec(
                pod_name,
                ["tar", "cf", "-", "-C", source_path, "."],
                &params,
            )
            .await?;

        let mut stdout = process
            .stdout()
            .context("exec stream has no stdout channel")?;

        tokio::fs::create_dir_all(dest_dir)
            .await
            .with_context(|| format!("failed to create `{dir}`", dir = dest_dir.display()))?;
        let dest = dest_dir.join(archive_name);
        let mut file = tokio::fs::File::create(&dest)
            .await
            .with_context(|| format!("failed to create `{dest}`", dest = dest.display()))?;

        tokio::io::copy(&mut stdout, &mut file)
            .await
            .context("failed to stream archive from pod")?;

        if let Err(e) = process.join().await {
            // The archive is already on disk; a close error is not fatal
            warn!("exec stream for pod `{pod_name}` did not close cleanly: {e}");
        }

        Ok(dest)
    }

    /// The analytics custom resource API (cluster scoped).
    fn analytics(&self) -> Api<Analytics> {
        Api::all(self.client.clone())
    }

    /// Lists all analytics custom resources.
    pub async fn list_analytics(&self) -> Result<Vec<Analytics>> {
        Ok(self.analytics().list(&ListParams::default()).await?.items)
    }

    /// Creates an analytics custom resource.
    ///
    /// Conflicts are *not* absorbed here; the engine decides whether an
    /// existing resource is acceptable.
    pub async fn create_analytics(&self, crd: &Analytics) -> Result<Analytics> {
        debug!(
            "creating analytics resource `{name}`",
            name = crd.metadata.generate_name.as_deref().unwrap_or_default()
        );
        Ok(self.analytics().create(&PostParams::default(), crd).await?)
    }

    /// Merge-patches the annotations of an analytics custom resource.
    pub async fn patch_analytics_annotations(
        &self,
        name: &str,
        annotations: &BTreeMap<String, String>,
    ) -> Result<Analytics> {
        Ok(self
            .analytics()
            .patch(
                name,
                &PatchParams::default(),
                &Patch::Merge(serde_json::json!({
                    "metadata": { "annotations": annotations }
                })),
            )
            .await?)
    }
}
