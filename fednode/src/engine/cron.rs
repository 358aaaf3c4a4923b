//! Cron job construction.
//!
//! A scheduled task wraps its pod specification in a cron job. When the
//! task is backed by the external delivery controller, the job template is
//! augmented so every scheduled run re-annotates the delivery resource:
//! cron-triggered pod creation is not otherwise observable to a watcher
//! that only follows the custom resource.

use k8s_openapi::api::batch::v1::CronJob;
use k8s_openapi::api::batch::v1::CronJobSpec;
use k8s_openapi::api::batch::v1::JobSpec;
use k8s_openapi::api::batch::v1::JobTemplateSpec;
use k8s_openapi::api::core::v1::ConfigMapProjection;
use k8s_openapi::api::core::v1::Container;
use k8s_openapi::api::core::v1::DownwardAPIProjection;
use k8s_openapi::api::core::v1::DownwardAPIVolumeFile;
use k8s_openapi::api::core::v1::KeyToPath;
use k8s_openapi::api::core::v1::ObjectFieldSelector;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::api::core::v1::PodTemplateSpec;
use k8s_openapi::api::core::v1::ProjectedVolumeSource;
use k8s_openapi::api::core::v1::ServiceAccountTokenProjection;
use k8s_openapi::api::core::v1::Volume;
use k8s_openapi::api::core::v1::VolumeMount;
use k8s_openapi::api::core::v1::VolumeProjection;
use kube::api::ObjectMeta;

/// The service account identity scheduled controller tasks run under.
const HANDLER_SERVICE_ACCOUNT: &str = "secret-backend-handler";

/// The name of the projected service-account volume.
const API_ACCESS_VOLUME_NAME: &str = "kube-api-access-fednode";

/// The conventional mount point for service-account credentials.
const API_ACCESS_MOUNT_PATH: &str = "/var/run/secrets/kubernetes.io/serviceaccount";

/// The lifetime of the projected service-account token, in seconds.
const API_TOKEN_EXPIRATION_SECONDS: i64 = 3600;

/// The delivery-controller binding for a scheduled task.
#[derive(Debug, Clone)]
pub struct ControllerBinding {
    /// The name of the delivery custom resource to annotate on every run.
    pub crd_name: String,
    /// The annotation domain.
    pub crd_domain: String,
    /// The image carrying `kubectl` for the refresh container.
    pub kubectl_image: String,
}

/// Builds a cron job wrapping the given pod specification.
///
/// Labels are copied from the pod, with the task name added (and the
/// resource name, in controller mode) to keep the cron job findable by the
/// same selectors as its pods.
pub fn build_cronjob(
    task_name: &str,
    suffix: &str,
    pod: &Pod,
    schedule: &str,
    controller: Option<&ControllerBinding>,
) -> CronJob {
    let mut labels = pod.metadata.labels.clone().unwrap_or_default();
    labels.insert("name".to_string(), task_name.to_string());

    let mut pod_spec = pod.spec.clone().unwrap_or_default();
    if let Some(binding) = controller {
        labels.insert("crd_name".to_string(), binding.crd_name.clone());
        pod_spec.service_account_name = Some(HANDLER_SERVICE_ACCOUNT.to_string());
        pod_spec
            .volumes
            .get_or_insert_default()
            .push(api_access_volume());
        pod_spec
            .init_containers
            .get_or_insert_default()
            .push(refresh_container(binding));
    }

    CronJob {
        metadata: ObjectMeta {
            name: Some(format!("cron-{suffix}")),
            namespace: pod.metadata.namespace.clone(),
            labels: Some(labels.clone()),
            ..Default::default()
        },
        spec: Some(CronJobSpec {
            schedule: schedule.to_string(),
            successful_jobs_history_limit: Some(1),
            failed_jobs_history_limit: Some(1),
            job_template: JobTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels.clone()),
                    ..Default::default()
                }),
                spec: Some(JobSpec {
                    template: PodTemplateSpec {
                        metadata: Some(ObjectMeta {
                            labels: Some(labels),
                            ..Default::default()
                        }),
                        spec: Some(pod_spec),
                    },
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// The projected volume granting the refresh container a short-lived API
/// token, the cluster CA bundle, and the pod's namespace.
fn api_access_volume() -> Volume {
    Volume {
        name: API_ACCESS_VOLUME_NAME.to_string(),
        projected: Some(ProjectedVolumeSource {
            sources: Some(vec![
                VolumeProjection {
                    service_account_token: Some(ServiceAccountTokenProjection {
                        expiration_seconds: Some(API_TOKEN_EXPIRATION_SECONDS),
                        path: "token".to_string(),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
                VolumeProjection {
                    config_map: Some(ConfigMapProjection {
                        name: "kube-root-ca.crt".to_string(),
                        items: Some(vec![KeyToPath {
                            key: "ca.crt".to_string(),
                            path: "ca.crt".to_string(),
                            ..Default::default()
                        }]),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
                VolumeProjection {
                    downward_api: Some(DownwardAPIProjection {
                        items: Some(vec![DownwardAPIVolumeFile {
                            field_ref: Some(ObjectFieldSelector {
                                field_path: "metadata.namespace".to_string(),
                                ..Default::default()
                            }),
                            path: "namespace".to_string(),
                            ..Default::default()
                        }]),
                    }),
                    ..Default::default()
                },
            ]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// The init container that stamps the delivery resource with a fresh
/// timestamp on every scheduled run.
fn refresh_container(binding: &ControllerBinding) -> Container {
    Container {
        name: "refresh-crd".to_string(),
        image: Some(binding.kubectl_image.clone()),
        command: Some(vec![
            "sh".to_string(),
            "-c".to_string(),
            format!(
                "kubectl annotate analytics {name} --overwrite \
                 {domain}/last_run=\"$(date -u +%Y-%m-%dT%H:%M:%SZ)\"",
                name = binding.crd_name,
                domain = binding.crd_domain,
            ),
        ]),
        volume_mounts: Some(vec![VolumeMount {
            name: API_ACCESS_VOLUME_NAME.to_string(),
            mount_path: API_ACCESS_MOUNT_PATH.to_string(),
            read_only: Some(true),
            ..Default::default()
        }]),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use k8s_openapi::api::core::v1::PodSpec;

    use super::*;

    fn pod() -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some("pheno-analysis-a1b2c3".to_string()),
                namespace: Some("tasks".to_string()),
                labels: Some(BTreeMap::from([(
                    "task_id".to_string(),
                    "42".to_string(),
                )])),
                ..Default::default()
            },
            spec: Some(PodSpec {
                containers: vec![Container {
                    name: "analysis".to_string(),
                    ..Default::default()
                }],
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn cronjob_wraps_pod_with_history_limits() {
        let cronjob = build_cronjob("pheno analysis", "a1b2c3", &pod(), "0 12 * * *", None);

        assert_eq!(cronjob.metadata.name.as_deref(), Some("cron-a1b2c3"));
        let spec = cronjob.spec.unwrap();
        assert_eq!(spec.schedule, "0 12 * * *");
        assert_eq!(spec.successful_jobs_history_limit, Some(1));
        assert_eq!(spec.failed_jobs_history_limit, Some(1));

        let labels = cronjob.metadata.labels.unwrap();
        assert_eq!(labels.get("task_id").map(String::as_str), Some("42"));
        assert_eq!(labels.get("name").map(String::as_str), Some("pheno analysis"));
        assert!(!labels.contains_key("crd_name"));

        let template = spec.job_template.spec.unwrap().template;
        assert_eq!(
            template.spec.unwrap().containers[0].name,
            "analysis"
        );
    }

    #[test]
    fn controller_mode_adds_refresh_machinery() {
        let binding = ControllerBinding {
            crd_name: "analytics-x1".to_string(),
            crd_domain: "federatednode.com".to_string(),
            kubectl_image: "bitnami/kubectl:latest".to_string(),
        };
        let cronjob =
            build_cronjob("pheno analysis", "a1b2c3", &pod(), "0 12 * * *", Some(&binding));

        let labels = cronjob.metadata.labels.unwrap();
        assert_eq!(
            labels.get("crd_name").map(String::as_str),
            Some("analytics-x1")
        );

        let pod_spec = cronjob
            .spec
            .unwrap()
            .job_template
            .spec
            .unwrap()
            .template
            .spec
            .unwrap();
        assert_eq!(
            pod_spec.service_account_name.as_deref(),
            Some("secret-backend-handler")
        );

        let volume = &pod_spec.volumes.as_deref().unwrap()[0];
        let sources = volume
            .projected
            .as_ref()
            .unwrap()
            .sources
            .as_deref()
            .unwrap();
        assert_eq!(sources.len(), 3);
        assert_eq!(
            sources[0]
                .service_account_token
                .as_ref()
                .unwrap()
                .expiration_seconds,
            Some(3600)
        );

        let inits = pod_spec.init_containers.as_deref().unwrap();
        let refresh = inits.iter().find(|c| c.name == "refresh-crd").unwrap();
        let script = &refresh.command.as_deref().unwrap()[2];
        assert!(script.contains("kubectl annotate analytics analytics-x1"));
        assert!(script.contains("federatednode.com/last_run"));
    }
}
