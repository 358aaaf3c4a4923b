//! The Federated Node task engine.
//!
//! Lets authorized users run analytics tasks as Kubernetes pods or cron
//! jobs against registered datasets, with per-dataset credential injection,
//! result extraction through ephemeral jobs, and optional state mirroring
//! into a delivery custom resource.

pub mod config;
pub mod engine;
pub mod keycloak;
pub mod name;
pub mod quantity;
pub mod registry;
pub mod server;

pub use config::Config;
pub use engine::TaskService;
