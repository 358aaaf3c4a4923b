//! The analytics delivery custom resource.
//!
//! The resource is a signalling surface for the external delivery
//! controller: the engine creates one per task and keeps its annotations
//! fresh, and the controller reacts to annotation changes alone. Objects
//! are keyed by a `<domain>/task_id` annotation rather than by name,
//! because the name is server-generated.

use kube::CustomResource;
use kube::ResourceExt;
use schemars::JsonSchema;
use serde::Deserialize;
use serde::Serialize;

/// The API group of the analytics custom resource.
pub const ANALYTICS_CRD_GROUP: &str = "federatednode.com";

/// The spec of the analytics delivery custom resource.
#[derive(CustomResource, Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "federatednode.com",
    version = "v1",
    kind = "Analytics",
    plural = "analytics"
)]
#[serde(rename_all = "camelCase")]
pub struct AnalyticsSpec {
    /// The username of the requesting user.
    pub user: String,
    /// The fully qualified image the task runs.
    pub image: String,
    /// The name of the dataset the task runs against.
    pub dataset: String,
}

impl Analytics {
    /// Gets the value of an annotation under the given domain.
    pub fn domain_annotation(&self, domain: &str, key: &str) -> Option<&str> {
        self.annotations()
            .get(&format!("{domain}/{key}"))
            .map(String::as_str)
    }

    /// Whether the resource is annotated with the given task id.
    pub fn is_for_task(&self, domain: &str, task_id: i64) -> bool {
        self.domain_annotation(domain, "task_id") == Some(task_id.to_string().as_str())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    #[test]
    fn annotation_keyed_lookup() {
        let mut crd = Analytics::new("analytics-abc12", AnalyticsSpec {
            user: "analyst".to_string(),
            image: "acr.azurecr.io/org/analytics:1.0".to_string(),
            dataset: "phenotypes".to_string(),
        });
        crd.metadata.annotations = Some(BTreeMap::from([
            ("federatednode.com/task_id".to_string(), "42".to_string()),
            ("federatednode.com/done".to_string(), "true".to_string()),
        ]));

        assert!(crd.is_for_task("federatednode.com", 42));
        assert!(!crd.is_for_task("federatednode.com", 43));
        assert_eq!(
            crd.domain_annotation("federatednode.com", "done"),
            Some("true")
        );
        assert_eq!(crd.domain_annotation("other.example.com", "done"), None);
    }
}
