//! Engine configuration.

use std::path::PathBuf;
use std::time::Duration;

/// Azure File storage parameters for the shared results volume.
#[derive(Debug, Clone)]
pub struct AzureStorage {
    /// The name of the secret holding the storage account credentials.
    pub secret_name: String,
    /// The name of the Azure File share.
    pub share_name: String,
}

/// The engine configuration, resolved once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    /// The namespace task pods run in.
    pub task_namespace: String,
    /// The namespace shared node services run in.
    pub default_namespace: String,
    /// The local directory result archives are written to.
    pub results_path: PathBuf,
    /// The path task pods mount their results volume at.
    pub task_pod_results_path: String,
    /// The path task pods mount their inputs at when no explicit location
    /// is given.
    pub task_pod_inputs_path: String,
    /// How many days task resources are kept before bulk cleanup reaps them.
    pub cleanup_after_days: i64,
    /// The annotation domain for the analytics delivery custom resource.
    pub crd_domain: String,
    /// Whether the external task controller integration is enabled.
    pub task_controller_enabled: bool,
    /// Whether results require an approved review before release.
    pub task_review_required: bool,
    /// The storage class of the shared results volumes.
    pub storage_class: String,
    /// The capacity of each task's shared results volume.
    pub claim_capacity: String,
    /// The name of the image pull secret in the task namespace.
    pub pull_secret_name: String,
    /// The image used for workspace-setup init containers.
    pub alpine_image: String,
    /// The repository of the database connector image.
    pub db_connector_repository: String,
    /// The tag applied to node-owned sidecar and init images.
    pub image_tag: String,
    /// The image used by the cron refresh init container to annotate the
    /// delivery resource.
    pub kubectl_image: String,
    /// Azure File parameters; host-path storage is used when absent.
    pub azure_storage: Option<AzureStorage>,
    /// How long to wait for the results-fetcher pod to become ready.
    pub results_fetch_timeout: Duration,
}

impl Config {
    /// Gets the full database connector image reference.
    pub fn db_connector_image(&self) -> String {
        format!(
            "{repo}:{tag}",
            repo = self.db_connector_repository,
            tag = self.image_tag
        )
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            task_namespace: "tasks".to_string(),
            default_namespace: "default".to_string(),
            results_path: PathBuf::from("/data/results"),
            task_pod_results_path: "/mnt/data".to_string(),
            task_pod_inputs_path: "/mnt/inputs".to_string(),
            cleanup_after_days: 3,
            crd_domain: "federatednode.com".to_string(),
            task_controller_enabled: false,
            task_review_required: false,
            storage_class: "shared-results".to_string(),
            claim_capacity: "100Mi".to_string(),
            pull_secret_name: "fednode-regcred".to_string(),
            alpine_image: "alpine:3.19".to_string(),
            db_connector_repository: "ghcr.io/federated-node/db-connector".to_string(),
            image_tag: "latest".to_string(),
            kubectl_image: "bitnami/kubectl:latest".to_string(),
            azure_storage: None,
            results_fetch_timeout: Duration::from_secs(120),
        }
    }
}
