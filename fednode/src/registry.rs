//! Remote container registry access.

use anyhow::Context as _;
use anyhow::bail;
use fednode_db::ImageRef;
use fednode_db::Registry;
use fednode_db::RegistryApi;
use reqwest::StatusCode;
use reqwest::header;
use secrecy::ExposeSecret as _;

/// The manifest media types accepted when probing for an image.
const MANIFEST_ACCEPT: &str = "application/vnd.oci.image.manifest.v1+json, \
                               application/vnd.docker.distribution.manifest.v2+json";

/// A [`RegistryApi`] backed by the registry HTTP API (the `/v2/` manifest
/// endpoint every supported registry speaks).
pub struct HttpRegistryApi {
    /// The HTTP client.
    http: reqwest::Client,
}

impl HttpRegistryApi {
    /// Constructs a new remote registry API client.
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::new(),
        }
    }
}

impl Default for HttpRegistryApi {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl RegistryApi for HttpRegistryApi {
    async fn has_image(&self, registry: &Registry, image: &ImageRef) -> anyhow::Result<bool> {
        let reference = match image {
            ImageRef::Tag { tag, .. } => tag.clone(),
            ImageRef::Digest { sha, .. } => format!("sha256:{sha}"),
        };

        let url = format!(
            "https://{host}/v2/{name}/manifests/{reference}",
            host = registry.name(),
            name = image.name(),
        );

        let mut request = self
            .http
            .head(&url)
            .header(header::ACCEPT, MANIFEST_ACCEPT);
        if let (Some(username), Some(password)) = (&registry.username, &registry.password) {
            request = request.basic_auth(username, Some(password.expose_secret()));
        }

        let response = request
            .send()
            .await
            .with_context(|| format!("failed to query registry `{url}`"))?;

        match response.status() {
            StatusCode::OK => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            status => bail!(
                "registry `{host}` rejected the manifest check with {status}",
                host = registry.name()
            ),
        }
    }
}
