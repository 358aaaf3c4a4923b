//! Keycloak user lookups.
//!
//! The engine only needs one thing from the identity provider: the username
//! behind a user id, used to annotate the delivery custom resource.

use anyhow::Context as _;
use secrecy::ExposeSecret as _;
use secrecy::SecretString;
use serde::Deserialize;
use url::Url;

/// Resolves user ids to usernames.
#[async_trait::async_trait]
pub trait UserLookup: Send + Sync + 'static {
    /// Gets the username for the given user id.
    async fn username(&self, user_id: &str) -> anyhow::Result<String>;
}

/// A [`UserLookup`] that returns the id unchanged.
///
/// Used when the Keycloak integration is not configured.
pub struct PassthroughUsers;

#[async_trait::async_trait]
impl UserLookup for PassthroughUsers {
    async fn username(&self, user_id: &str) -> anyhow::Result<String> {
        Ok(user_id.to_string())
    }
}

/// The token response from Keycloak.
#[derive(Deserialize)]
struct TokenResponse {
    /// The bearer token.
    access_token: String,
}

/// The subset of the Keycloak user representation the engine reads.
#[derive(Deserialize)]
struct UserRepresentation {
    /// The username.
    username: String,
}

/// A [`UserLookup`] backed by the Keycloak admin API.
pub struct KeycloakUsers {
    /// The HTTP client.
    http: reqwest::Client,
    /// The Keycloak base URL.
    base_url: Url,
    /// The realm users belong to.
    realm: String,
    /// The service client id used to authenticate.
    client_id: String,
    /// The service client secret.
    client_secret: SecretString,
}

impl KeycloakUsers {
    /// Constructs a new Keycloak user lookup.
    pub fn new(
        base_url: Url,
        realm: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: SecretString,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url,
            realm: realm.into(),
            client_id: client_id.into(),
            client_secret,
        }
    }

    /// Gets a service-account token.
    async fn token(&self) -> anyhow::Result<String> {
        let url = self
            .base_url
            .join(&format!(
                "realms/{realm}/protocol/openid-connect/token",
                realm = self.realm
            ))
            .context("failed to build the Keycloak token URL")?;

        let response = self
            .http
            .post(url)
            .form(&[
                ("grant_type", "client_credentials"),
                ("client_id", &self.client_id),
                ("client_secret", self.client_secret.expose_secret()),
            ])
            .send()
            .await
            .context("failed to reach Keycloak")?
            .error_for_status()
            .context("Keycloak rejected the service login")?;

        Ok(response.json::<TokenResponse>().await?.access_token)
    }
}

#[async_trait::async_trait]
impl UserLookup for KeycloakUsers {
    async fn username(&self, user_id: &str) -> anyhow::Result<String> {
        let token = self.token().await?;
        let url = self
            .base_url
            .join(&format!(
                "admin/realms/{realm}/users/{user_id}",
                realm = self.realm
            ))
            .context("failed to build the Keycloak user URL")?;

        let user = self
            .http
            .get(url)
            .bearer_auth(token)
            .send()
            .await
            .context("failed to reach Keycloak")?
            .error_for_status()
            .with_context(|| format!("Keycloak has no user `{user_id}`"))?
            .json::<UserRepresentation>()
            .await
            .context("unexpected user representation from Keycloak")?;

        Ok(user.username)
    }
}
