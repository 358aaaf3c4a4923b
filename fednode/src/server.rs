//! The HTTP server.

use std::any::Any;
use std::future::Future;
use std::sync::Arc;

use anyhow::Context as _;
use axum::Router;
use axum::body::Body;
use axum::extract::FromRequest;
use axum::extract::FromRequestParts;
use axum::extract::rejection::JsonRejection;
use axum::extract::rejection::PathRejection;
use axum::http;
use axum::http::HeaderName;
use axum::http::StatusCode;
use axum::http::header;
use axum::response::IntoResponse;
use axum::response::Response;
use bon::Builder;
use serde::Serialize;
use serde::Serializer;
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::LatencyUnit;
use tower_http::compression::CompressionLayer;
use tower_http::sensitive_headers::SetSensitiveRequestHeadersLayer;
use tower_http::sensitive_headers::SetSensitiveResponseHeadersLayer;
use tower_http::trace::DefaultMakeSpan;
use tower_http::trace::DefaultOnResponse;
use tower_http::trace::TraceLayer;
use tracing::Span;
use tracing::debug;
use tracing::error;
use tracing::info;

mod tasks;

use crate::engine;
use crate::engine::TaskService;

/// The default address to bind the server to.
pub const DEFAULT_ADDRESS: &str = "0.0.0.0";

/// The default port to bind the server to.
pub const DEFAULT_PORT: u16 = 5000;

/// Header values to be blocked from logging.
const SENSITIVE_HEADERS: [HeaderName; 2] = [header::AUTHORIZATION, header::COOKIE];

/// A panic handler for returning 500.
fn handle_panic(err: Box<dyn Any + Send + 'static>) -> Response {
    if let Some(s) = err.downcast_ref::<String>() {
        error!("server panicked: {s}");
    } else if let Some(s) = err.downcast_ref::<&str>() {
        error!("server panicked: {s}");
    } else {
        error!("server panicked: unknown panic message");
    };

    Error {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        message: "internal server error".to_string(),
    }
    .into_response()
}

/// An extractor that wraps the JSON extractor of Axum.
///
/// This extractor returns an error object on rejection.
#[derive(FromRequest)]
#[from_request(via(axum::Json), rejection(Error))]
struct Json<T>(pub T);

impl<T> IntoResponse for Json<T>
where
    T: Serialize,
{
    fn into_response(self) -> Response {
        axum::Json(self.0).into_response()
    }
}

/// An extractor that wraps the path extractor of Axum.
///
/// This extractor returns an API error on rejection.
#[derive(FromRequestParts)]
#[from_request(via(axum::extract::Path), rejection(Error))]
struct Path<T>(T);

/// Helper for serializing a HTTP status code.
fn serialize_status<S>(status: &StatusCode, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_u16(status.as_u16())
}

/// Represents a generic error from the API.
#[derive(Serialize, Debug)]
pub struct Error {
    /// The status code being returned in the response.
    #[serde(serialize_with = "serialize_status")]
    pub status: StatusCode,
    /// The error message.
    pub message: String,
}

impl From<engine::Error> for Error {
    fn from(e: engine::Error) -> Self {
        use engine::Error as E;

        let (status, message) = match &e {
            E::InvalidRequest(_) | E::Quantity(_) => (StatusCode::BAD_REQUEST, e.to_string()),
            E::ImageNotFound(_) => (StatusCode::NOT_FOUND, e.to_string()),
            E::ImageNotOnRegistry(_) => (StatusCode::BAD_REQUEST, e.to_string()),
            E::RegistryCheck(_) => (StatusCode::BAD_GATEWAY, e.to_string()),
            E::AlreadyRunning => (StatusCode::CONFLICT, e.to_string()),
            E::AlreadyCancelled => (StatusCode::BAD_REQUEST, e.to_string()),
            E::ResultsExpired => (StatusCode::GONE, e.to_string()),
            E::ResultsNotReady | E::ClusterUnavailable => {
                (StatusCode::SERVICE_UNAVAILABLE, e.to_string())
            }
            E::CronJobNotFound => (StatusCode::NOT_FOUND, e.to_string()),
            E::CrdDelivery(_) => (StatusCode::BAD_GATEWAY, e.to_string()),
            E::Cluster(cluster) => return cluster_error(cluster),
            E::Database(db) => return database_error(db),
        };

        Self { status, message }
    }
}

/// Maps a cluster gateway error onto an API error.
///
/// Cluster rejections keep their underlying message so operator-relevant
/// detail (for example a cron schedule validation failure) survives the
/// translation.
fn cluster_error(e: &fednode_cluster::Error) -> Error {
    use fednode_cluster::Error as C;

    match e {
        C::Api {
            status,
            reason,
            body,
        } => {
            let message = if body.is_empty() {
                reason.clone()
            } else {
                body.clone()
            };
            let status = match *status {
                404 => StatusCode::NOT_FOUND,
                409 => StatusCode::CONFLICT,
                400..=499 => StatusCode::BAD_REQUEST,
                _ => {
                    error!("cluster API error ({status}): {message}");
                    StatusCode::BAD_GATEWAY
                }
            };
            Error { status, message }
        }
        C::Transport(_) | C::ReadyTimeout(_) => Error {
            status: StatusCode::SERVICE_UNAVAILABLE,
            message: e.to_string(),
        },
        C::Other(inner) => {
            // Log the error but do not return it to the client
            error!("cluster gateway error: {inner:#}");
            Error {
                status: StatusCode::INTERNAL_SERVER_ERROR,
                message: StatusCode::INTERNAL_SERVER_ERROR.to_string(),
            }
        }
    }
}

/// Maps a database error onto an API error.
fn database_error(e: &fednode_db::Error) -> Error {
    use fednode_db::Error as D;

    match e {
        D::TaskNotFound(_) | D::DatasetNotFound(_) => Error {
            status: StatusCode::NOT_FOUND,
            message: e.to_string(),
        },
        D::AlreadyReviewed => Error {
            status: StatusCode::BAD_REQUEST,
            message: e.to_string(),
        },
        D::Other(inner) => {
            // Log the error but do not return it to the client
            error!("database error: {inner:#}");
            Error {
                status: StatusCode::INTERNAL_SERVER_ERROR,
                message: StatusCode::INTERNAL_SERVER_ERROR.to_string(),
            }
        }
    }
}

impl From<JsonRejection> for Error {
    fn from(rejection: JsonRejection) -> Self {
        Self {
            status: rejection.status(),
            message: rejection.body_text(),
        }
    }
}

impl From<PathRejection> for Error {
    fn from(rejection: PathRejection) -> Self {
        Self {
            status: rejection.status(),
            message: rejection.body_text(),
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        (self.status, axum::Json(self)).into_response()
    }
}

/// Represents the response type for most API endpoints.
type ServerResponse<T> = Result<T, Error>;

/// Returns a "not found" JSON error response.
fn not_found() -> Error {
    Error {
        status: StatusCode::NOT_FOUND,
        message: "the requested resource was not found".to_string(),
    }
}

/// The state for the server.
#[derive(Clone)]
pub struct State {
    /// The task lifecycle service.
    service: Arc<TaskService>,
}

/// The Federated Node API server.
#[derive(Builder)]
pub struct Server {
    /// The address to bind the server to.
    #[builder(into, default = DEFAULT_ADDRESS)]
    address: String,

    /// The port to bind the server to.
    #[builder(into, default = DEFAULT_PORT)]
    port: u16,

    /// The task lifecycle service.
    service: Arc<TaskService>,
}

impl Server {
    /// Runs the server.
    pub async fn run<F>(self, shutdown: F) -> anyhow::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        // Hook up the axum middleware
        let middleware = ServiceBuilder::new()
            .layer(SetSensitiveRequestHeadersLayer::new(SENSITIVE_HEADERS))
            .layer(
                TraceLayer::new_for_http()
                    .make_span_with(DefaultMakeSpan::new().include_headers(true))
                    .on_request(|request: &http::Request<Body>, _span: &Span| {
                        debug!(
                            "{method} {path}",
                            method = request.method(),
                            path = request.uri().path()
                        )
                    })
                    .on_response(
                        DefaultOnResponse::new()
                            .level(tracing::Level::DEBUG)
                            .latency_unit(LatencyUnit::Micros),
                    ),
            )
            .layer(CompressionLayer::new())
            .layer(SetSensitiveResponseHeadersLayer::new(SENSITIVE_HEADERS));

        // Construct the axum app
        let app = Router::new()
            .route("/ping", axum::routing::get(async || {}))
            .merge(tasks::router())
            .fallback(async || not_found())
            .layer(middleware)
            .layer(tower_http::catch_panic::CatchPanicLayer::custom(
                handle_panic,
            ))
            .with_state(State {
                service: self.service,
            });

        // Run the server
        let addr = format!("{address}:{port}", address = self.address, port = self.port);
        let listener = TcpListener::bind(&addr)
            .await
            .context("binding to the provided address")?;

        info!("listening at {addr}");

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await
            .context("failed to run API server")?;

        Ok(())
    }
}
