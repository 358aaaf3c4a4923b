//! The `fednode` server binary.

use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use anyhow::Result;
use clap::Parser;
use clap_verbosity_flag::Verbosity;
use clap_verbosity_flag::WarnLevel;
use fednode::Config;
use fednode::TaskService;
use fednode::config::AzureStorage;
use fednode::keycloak::KeycloakUsers;
use fednode::keycloak::PassthroughUsers;
use fednode::keycloak::UserLookup;
use fednode::registry::HttpRegistryApi;
use fednode::server::DEFAULT_ADDRESS;
use fednode::server::DEFAULT_PORT;
use fednode::server::Server;
use fednode_cluster::Gateway;
use fednode_db::MemoryDatabase;
use secrecy::SecretString;
use tracing_log::AsTrace as _;
use tracing_subscriber::EnvFilter;
use url::Url;

/// A Federated Node: runs analytics tasks as Kubernetes pods against
/// registered datasets.
#[derive(Parser)]
pub struct Args {
    /// The address to bind the service to.
    #[clap(short, long, default_value = DEFAULT_ADDRESS)]
    address: String,

    /// The port to bind the service to.
    #[clap(short, long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// The verbosity level.
    #[command(flatten)]
    verbose: Verbosity<WarnLevel>,

    /// The Kubernetes namespace task pods run in.
    #[clap(long, env, default_value = "tasks")]
    task_namespace: String,

    /// The Kubernetes namespace shared node services run in.
    #[clap(long, env, default_value = "default")]
    default_namespace: String,

    /// The local directory result archives are written to.
    #[clap(long, env, default_value = "/data/results")]
    results_path: PathBuf,

    /// The path task pods mount their results volume at.
    #[clap(long, env, default_value = "/mnt/data")]
    task_pod_results_path: String,

    /// The default mount path for task inputs.
    #[clap(long, env, default_value = "/mnt/inputs")]
    task_pod_inputs_path: String,

    /// How many days task resources are kept before cleanup.
    #[clap(long, env, default_value_t = 3)]
    cleanup_after_days: i64,

    /// The annotation domain for the delivery custom resource.
    #[clap(long, env, default_value = "federatednode.com")]
    crd_domain: String,

    /// Enables the external task controller integration.
    #[clap(long, env)]
    task_controller_enabled: bool,

    /// Requires an approved review before results are released.
    #[clap(long, env)]
    task_review: bool,

    /// The storage class of the shared results volumes.
    #[clap(long, env, default_value = "shared-results")]
    storage_class: String,

    /// The capacity of each task's shared results volume.
    #[clap(long, env, default_value = "100Mi")]
    claim_capacity: String,

    /// The name of the image pull secret in the task namespace.
    #[clap(long, env, default_value = "fednode-regcred")]
    pull_secret_name: String,

    /// The image used for workspace-setup init containers.
    #[clap(long, env, default_value = "alpine:3.19")]
    alpine_image: String,

    /// The repository of the database connector image.
    #[clap(long, env, default_value = "ghcr.io/federated-node/db-connector")]
    db_connector_repository: String,

    /// The tag applied to node-owned sidecar and init images.
    #[clap(long, env, default_value = "latest")]
    image_tag: String,

    /// The image used to annotate the delivery resource on scheduled runs.
    #[clap(long, env, default_value = "bitnami/kubectl:latest")]
    kubectl_image: String,

    /// Backs shared results volumes with an Azure File share.
    #[clap(long, env)]
    azure_storage_enabled: bool,

    /// The secret holding the Azure storage account credentials.
    #[clap(long, env)]
    azure_secret_name: Option<String>,

    /// The Azure File share name.
    #[clap(long, env)]
    azure_share_name: Option<String>,

    /// How long to wait for the results fetcher to become ready, in
    /// seconds.
    #[clap(long, env, default_value_t = 120)]
    results_fetch_timeout: u64,

    /// The Keycloak base URL; user lookups are disabled when unset.
    #[clap(long, env)]
    keycloak_url: Option<Url>,

    /// The Keycloak realm.
    #[clap(long, env, default_value = "FederatedNode")]
    keycloak_realm: String,

    /// The Keycloak service client id.
    #[clap(long, env, default_value = "global")]
    keycloak_client: String,

    /// The Keycloak service client secret.
    #[clap(long, env, hide_env_values(true))]
    keycloak_secret: Option<SecretString>,
}

impl Args {
    /// Builds the engine configuration from the CLI options.
    fn config(&self) -> Result<Config> {
        let azure_storage = if self.azure_storage_enabled {
            Some(AzureStorage {
                secret_name: self
                    .azure_secret_name
                    .clone()
                    .context("--azure-secret-name is required with Azure storage")?,
                share_name: self
                    .azure_share_name
                    .clone()
                    .context("--azure-share-name is required with Azure storage")?,
            })
        } else {
            None
        };

        Ok(Config {
            task_namespace: self.task_namespace.clone(),
            default_namespace: self.default_namespace.clone(),
            results_path: self.results_path.clone(),
            task_pod_results_path: self.task_pod_results_path.clone(),
            task_pod_inputs_path: self.task_pod_inputs_path.clone(),
            cleanup_after_days: self.cleanup_after_days,
            crd_domain: self.crd_domain.clone(),
            task_controller_enabled: self.task_controller_enabled,
            task_review_required: self.task_review,
            storage_class: self.storage_class.clone(),
            claim_capacity: self.claim_capacity.clone(),
            pull_secret_name: self.pull_secret_name.clone(),
            alpine_image: self.alpine_image.clone(),
            db_connector_repository: self.db_connector_repository.clone(),
            image_tag: self.image_tag.clone(),
            kubectl_image: self.kubectl_image.clone(),
            azure_storage,
            results_fetch_timeout: Duration::from_secs(self.results_fetch_timeout),
        })
    }

    /// Gets the identity provider lookup from the CLI options.
    fn users(&self) -> Arc<dyn UserLookup> {
        match (&self.keycloak_url, &self.keycloak_secret) {
            (Some(url), Some(secret)) => Arc::new(KeycloakUsers::new(
                url.clone(),
                self.keycloak_realm.clone(),
                self.keycloak_client.clone(),
                secret.clone(),
            )),
            _ => Arc::new(PassthroughUsers),
        }
    }
}

#[cfg(unix)]
/// An async function that waits for a termination signal.
async fn terminate() {
    use tokio::select;
    use tokio::signal::unix::SignalKind;
    use tokio::signal::unix::signal;
    use tracing::info;

    let mut sigterm = signal(SignalKind::terminate()).expect("failed to create SIGTERM handler");
    let mut sigint = signal(SignalKind::interrupt()).expect("failed to create SIGINT handler");

    let signal = select! {
        _ = sigterm.recv() => "SIGTERM",
        _ = sigint.recv() => "SIGINT",
    };

    info!("received {signal} signal: initiating shutdown");
}

#[cfg(windows)]
/// An async function that waits for a termination signal.
async fn terminate() {
    use tokio::signal::windows::ctrl_c;
    use tracing::info;

    let mut signal = ctrl_c().expect("failed to create ctrl-c handler");
    signal.recv().await;

    info!("received Ctrl-C signal: initiating shutdown");
}

/// The main method.
#[tokio::main]
pub async fn main() -> Result<()> {
    let args = Args::parse();

    match std::env::var("RUST_LOG") {
        Ok(_) => tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_ansi(std::io::stdout().is_terminal())
            .init(),
        Err(_) => tracing_subscriber::fmt()
            .with_max_level(args.verbose.log_level_filter().as_trace())
            .with_ansi(std::io::stdout().is_terminal())
            .init(),
    }

    let config = Arc::new(args.config()?);
    let gateway = Arc::new(
        Gateway::connect(&config.task_namespace, &config.default_namespace)
            .await
            .context("failed to initialize the cluster gateway")?,
    );

    let service = Arc::new(TaskService::new(
        config.clone(),
        Arc::new(MemoryDatabase::new()),
        gateway,
        Arc::new(HttpRegistryApi::new()),
        args.users(),
    ));

    Server::builder()
        .address(&args.address)
        .port(args.port)
        .service(service)
        .build()
        .run(terminate())
        .await
        .context("failed to run server")
}
