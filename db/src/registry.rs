//! Container registries and registered images.

use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use anyhow::bail;
use regex::Regex;
use secrecy::SecretString;
use serde::Deserialize;
use serde::Serialize;

/// Matches an image reference: `<name>:<tag>` or `<name>@sha256:<digest>`.
static IMAGE_REF: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?P<name>[\w.-]+(?:/[\w.-]+)*)(?::(?P<tag>[\w.-]+)|@sha256:(?P<sha>[0-9a-fA-F]{6,64}))$")
        .expect("regex should compile")
});

/// Matches the URL scheme prefix stripped from registry URLs.
static REGISTRY_SCHEME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^http(s)?://").expect("regex should compile"));

/// A container registry known to the node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Registry {
    /// The registry identifier.
    pub id: i64,
    /// The registry URL.
    pub url: String,
    /// The username used to authenticate against the registry, if any.
    #[serde(default)]
    pub username: Option<String>,
    /// The password or token used to authenticate, if any.
    #[serde(default, skip_serializing)]
    pub password: Option<SecretString>,
    /// Whether the registry is active for image resolution.
    #[serde(default = "default_active")]
    pub active: bool,
}

/// The default value for [`Registry::active`].
fn default_active() -> bool {
    true
}

impl Registry {
    /// Gets the registry host name, without any URL scheme.
    pub fn name(&self) -> String {
        REGISTRY_SCHEME.replace(&self.url, "").into_owned()
    }
}

/// A parsed image reference: a tag or a sha256 digest, never both.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageRef {
    /// The image is referenced by tag.
    Tag {
        /// The repository-relative image name.
        name: String,
        /// The tag.
        tag: String,
    },
    /// The image is referenced by digest.
    Digest {
        /// The repository-relative image name.
        name: String,
        /// The sha256 digest, without the `sha256:` prefix.
        sha: String,
    },
}

impl ImageRef {
    /// Gets the repository-relative image name.
    pub fn name(&self) -> &str {
        match self {
            Self::Tag { name, .. } | Self::Digest { name, .. } => name,
        }
    }

    /// Gets the tag, if the image is referenced by tag.
    pub fn tag(&self) -> Option<&str> {
        match self {
            Self::Tag { tag, .. } => Some(tag),
            Self::Digest { .. } => None,
        }
    }

    /// Gets the sha256 digest, if the image is referenced by digest.
    pub fn sha(&self) -> Option<&str> {
        match self {
            Self::Tag { .. } => None,
            Self::Digest { sha, .. } => Some(sha),
        }
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tag { name, tag } => write!(f, "{name}:{tag}"),
            Self::Digest { name, sha } => write!(f, "{name}@sha256:{sha}"),
        }
    }
}

impl FromStr for ImageRef {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let Some(captures) = IMAGE_REF.captures(s) else {
            bail!(
                "{s} does not have a tag. Please provide one in the format <image>:<tag>"
            );
        };

        let name = captures["name"].to_string();
        match (captures.name("tag"), captures.name("sha")) {
            (Some(tag), None) => Ok(Self::Tag {
                name,
                tag: tag.as_str().to_string(),
            }),
            (None, Some(sha)) => Ok(Self::Digest {
                name,
                sha: sha.as_str().to_string(),
            }),
            _ => unreachable!("the alternation captures exactly one of tag or sha"),
        }
    }
}

/// A container image registered for task execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Container {
    /// The container identifier.
    pub id: i64,
    /// The repository-relative image name.
    pub name: String,
    /// The image tag, if registered by tag.
    pub tag: Option<String>,
    /// The image sha256 digest, if registered by digest.
    pub sha: Option<String>,
    /// The registry the image belongs to.
    pub registry_id: i64,
}

impl Container {
    /// Gets the fully qualified, pullable image name.
    pub fn full_image_name(&self, registry: &Registry) -> String {
        match (&self.tag, &self.sha) {
            (Some(tag), _) => format!("{url}/{name}:{tag}", url = registry.name(), name = self.name),
            (None, Some(sha)) => {
                format!("{url}/{name}@sha256:{sha}", url = registry.name(), name = self.name)
            }
            (None, None) => format!("{url}/{name}", url = registry.name(), name = self.name),
        }
    }

    /// Checks whether the container matches the given image reference.
    pub fn matches(&self, image: &ImageRef) -> bool {
        if self.name != image.name() {
            return false;
        }

        match image {
            ImageRef::Tag { tag, .. } => self.tag.as_deref() == Some(tag),
            ImageRef::Digest { sha, .. } => self.sha.as_deref() == Some(sha),
        }
    }
}

/// The remote side of a registry: can it still serve a given image?
///
/// A locally registered [`Container`] row may reference a tag that has since
/// been deleted from the registry; resolution asks the remote API before
/// trusting the row.
#[async_trait::async_trait]
pub trait RegistryApi: Send + Sync + 'static {
    /// Checks whether the registry still has the given tag or digest.
    async fn has_image(&self, registry: &Registry, image: &ImageRef) -> anyhow::Result<bool>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_ref_parses_tags() {
        let image: ImageRef = "org/analytics:1.2.3".parse().unwrap();
        assert_eq!(image.name(), "org/analytics");
        assert_eq!(image.tag(), Some("1.2.3"));
        assert_eq!(image.sha(), None);
        assert_eq!(image.to_string(), "org/analytics:1.2.3");
    }

    #[test]
    fn image_ref_parses_digests() {
        let image: ImageRef = "analytics@sha256:0a1b2c3d4e5f".parse().unwrap();
        assert_eq!(image.name(), "analytics");
        assert_eq!(image.sha(), Some("0a1b2c3d4e5f"));
    }

    #[test]
    fn image_ref_rejects_missing_tag() {
        assert!("analytics".parse::<ImageRef>().is_err());
        assert!("analytics@md5:abcdef".parse::<ImageRef>().is_err());
        assert!("analytics:".parse::<ImageRef>().is_err());
    }

    #[test]
    fn full_image_name_qualifies_registry() {
        let registry = Registry {
            id: 1,
            url: "https://acr.azurecr.io".to_string(),
            username: None,
            password: None,
            active: true,
        };
        let container = Container {
            id: 1,
            name: "org/analytics".to_string(),
            tag: Some("latest".to_string()),
            sha: None,
            registry_id: 1,
        };

        assert_eq!(
            container.full_image_name(&registry),
            "acr.azurecr.io/org/analytics:latest"
        );
    }
}
