//! Task status derivation.

use chrono::DateTime;
use chrono::Utc;
use k8s_openapi::api::core::v1::Pod;
use serde::Serialize;

/// The live status of a task pod, derived from the cluster.
///
/// Exactly one of `running`, `waiting`, or `terminated` is populated by the
/// cluster on a container status; this type is built once from the pod at
/// the gateway boundary instead of being re-interpreted by each caller.
///
/// Serialization follows the shape the API always exposed: struct variants
/// render as `{"running": {...}}`-style objects and `Pending` as the bare
/// string `"pending"`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// The pod exists but has no container status yet.
    Pending,
    /// The first container is waiting to start.
    Waiting {
        /// The reason the container is waiting.
        reason: Option<String>,
        /// A human-readable message for the wait.
        message: Option<String>,
    },
    /// The first container is running.
    Running {
        /// When the container started.
        started_at: Option<DateTime<Utc>>,
    },
    /// The first container has terminated.
    Terminated {
        /// When the container started.
        started_at: Option<DateTime<Utc>>,
        /// When the container finished.
        finished_at: Option<DateTime<Utc>>,
        /// The container exit code.
        exit_code: Option<i32>,
        /// The termination reason.
        reason: Option<String>,
    },
}

impl TaskStatus {
    /// Derives the status from a pod object.
    pub fn from_pod(pod: &Pod) -> Self {
        let Some(state) = pod
            .status
            .as_ref()
            .and_then(|s| s.container_statuses.as_ref())
            .and_then(|s| s.first())
            .and_then(|s| s.state.as_ref())
        else {
            return Self::Pending;
        };

        if let Some(running) = &state.running {
            return Self::Running {
                started_at: running.started_at.as_ref().map(|t| t.0),
            };
        }

        if let Some(waiting) = &state.waiting {
            return Self::Waiting {
                reason: waiting.reason.clone(),
                message: waiting.message.clone(),
            };
        }

        if let Some(terminated) = &state.terminated {
            return Self::Terminated {
                started_at: terminated.started_at.as_ref().map(|t| t.0),
                finished_at: terminated.finished_at.as_ref().map(|t| t.0),
                exit_code: Some(terminated.exit_code),
                reason: terminated.reason.clone(),
            };
        }

        Self::Pending
    }

    /// Whether the first container is currently running.
    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running { .. })
    }

    /// Whether the first container has terminated.
    pub fn is_terminated(&self) -> bool {
        matches!(self, Self::Terminated { .. })
    }
}

#[cfg(test)]
mod tests {
    use k8s_openapi::api::core::v1::ContainerState;
    use k8s_openapi::api::core::v1::ContainerStateRunning;
    use k8s_openapi::api::core::v1::ContainerStateTerminated;
    use k8s_openapi::api::core::v1::ContainerStatus;
    use k8s_openapi::api::core::v1::PodStatus;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

    use super::*;

    fn pod_with_state(state: Option<ContainerState>) -> Pod {
        Pod {
            status: Some(PodStatus {
                container_statuses: state.map(|state| {
                    vec![ContainerStatus {
                        state: Some(state),
                        ..Default::default()
                    }]
                }),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn no_container_status_is_pending() {
        let status = TaskStatus::from_pod(&pod_with_state(None));
        assert_eq!(status, TaskStatus::Pending);
        assert_eq!(serde_json::to_value(&status).unwrap(), "pending");
    }

    #[test]
    fn running_state_carries_start_time() {
        let started = Utc::now();
        let status = TaskStatus::from_pod(&pod_with_state(Some(ContainerState {
            running: Some(ContainerStateRunning {
                started_at: Some(Time(started)),
            }),
            ..Default::default()
        })));

        assert!(status.is_running());
        assert_eq!(status, TaskStatus::Running {
            started_at: Some(started),
        });

        let value = serde_json::to_value(&status).unwrap();
        assert!(value.get("running").is_some());
    }

    #[test]
    fn terminated_state_carries_exit_details() {
        let status = TaskStatus::from_pod(&pod_with_state(Some(ContainerState {
            terminated: Some(ContainerStateTerminated {
                exit_code: 1,
                reason: Some("Error".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        })));

        assert!(status.is_terminated());
        let value = serde_json::to_value(&status).unwrap();
        assert_eq!(value["terminated"]["exit_code"], 1);
        assert_eq!(value["terminated"]["reason"], "Error");
    }
}
