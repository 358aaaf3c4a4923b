//! The Kubernetes gateway for the Federated Node task engine.
//!
//! Every outbound cluster call the engine makes goes through [`Gateway`];
//! no other crate talks to the Kubernetes API.

use std::time::Duration;

mod crd;
mod gateway;
mod status;

pub use crd::ANALYTICS_CRD_GROUP;
pub use crd::Analytics;
pub use crd::AnalyticsSpec;
pub use gateway::Gateway;
pub use gateway::TaskStorage;
pub use gateway::VolumeRef;
pub use status::TaskStatus;

/// Represents an error from the cluster gateway.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The cluster rejected an API call.
    ///
    /// The original reason and body are preserved for operator debugging.
    #[error("cluster API error ({status}): {reason}")]
    Api {
        /// The HTTP status code of the rejection.
        status: u16,
        /// The rejection reason.
        reason: String,
        /// The raw response body.
        body: String,
    },
    /// The cluster could not be reached at all.
    ///
    /// This is infrastructure trouble, not a semantic rejection, and is kept
    /// distinct so callers can surface it as such.
    #[error("the cluster could not be reached: {0}")]
    Transport(String),
    /// A readiness wait ran out of time.
    #[error("timed out after {0:?} waiting for a ready pod")]
    ReadyTimeout(Duration),
    /// Another type of error occurred during a gateway operation.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Gets the HTTP status of the cluster rejection, if this is an API error.
    pub fn api_status(&self) -> Option<u16> {
        match self {
            Self::Api { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Whether the error is a 404-class cluster rejection.
    pub fn is_not_found(&self) -> bool {
        self.api_status() == Some(404)
    }

    /// Whether the error is a 409-class cluster rejection.
    pub fn is_conflict(&self) -> bool {
        self.api_status() == Some(409)
    }
}

impl From<kube::Error> for Error {
    fn from(e: kube::Error) -> Self {
        match e {
            kube::Error::Api(response) => Self::Api {
                status: response.code,
                reason: response.reason,
                body: response.message,
            },
            other => Self::Transport(other.to_string()),
        }
    }
}

/// The result type of gateway operations.
pub type Result<T> = std::result::Result<T, Error>;
