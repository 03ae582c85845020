//! Container image references and build outputs.

use std::fmt;
use std::str::FromStr;

use quayside_state::ImageDigest;
use serde::{Deserialize, Serialize};

use super::error::ValidationError;
use crate::tagging::is_valid_tag;

/// Image address in the form `registry/namespace/name:tag`.
///
/// `namespace` may itself contain slashes (`acme/platform`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageRef {
    pub registry: String,
    pub namespace: String,
    pub name: String,
    pub tag: String,
}

impl ImageRef {
    pub fn new(
        registry: impl Into<String>,
        namespace: impl Into<String>,
        name: impl Into<String>,
        tag: impl Into<String>,
    ) -> Result<Self, ValidationError> {
        let image = ImageRef {
            registry: registry.into(),
            namespace: namespace.into(),
            name: name.into(),
            tag: tag.into(),
        };
        image.validate()?;
        Ok(image)
    }

    /// Same repository, different tag.
    pub fn with_tag(&self, tag: impl Into<String>) -> Result<Self, ValidationError> {
        let tag = tag.into();
        if !is_valid_tag(&tag) {
            return Err(ValidationError::InvalidTag { tag });
        }
        Ok(ImageRef {
            tag,
            ..self.clone()
        })
    }

    /// `registry/namespace/name` without the tag.
    pub fn repository(&self) -> String {
        if self.namespace.is_empty() {
            format!("{}/{}", self.registry, self.name)
        } else {
            format!("{}/{}/{}", self.registry, self.namespace, self.name)
        }
    }

    /// `registry/namespace/name@sha256:...`, the immutable address of a digest.
    pub fn pinned(&self, digest: &ImageDigest) -> String {
        format!("{}@{}", self.repository(), digest)
    }

    fn validate(&self) -> Result<(), ValidationError> {
        let invalid = |reason: &str| ValidationError::InvalidImageRef {
            value: self.to_string(),
            reason: reason.to_string(),
        };
        if self.registry.is_empty() {
            return Err(invalid("registry is empty"));
        }
        if self.name.is_empty() {
            return Err(invalid("name is empty"));
        }
        let repo_ok = |s: &str| {
            s.chars().all(|c| {
                c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '.' | '_' | '-' | '/')
            })
        };
        if !repo_ok(&self.namespace) || !repo_ok(&self.name) {
            return Err(invalid("repository path must be lowercase"));
        }
        if !is_valid_tag(&self.tag) {
            return Err(ValidationError::InvalidTag {
                tag: self.tag.clone(),
            });
        }
        Ok(())
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.repository(), self.tag)
    }
}

impl FromStr for ImageRef {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| ValidationError::InvalidImageRef {
            value: s.to_string(),
            reason: reason.to_string(),
        };

        let (path, tag) = match s.rsplit_once(':') {
            Some((path, tag)) if !tag.contains('/') => (path, tag),
            _ => return Err(invalid("missing tag")),
        };
        let mut segments: Vec<&str> = path.split('/').collect();
        if segments.len() < 2 {
            return Err(invalid("expected registry/namespace/name"));
        }
        let registry = segments.remove(0);
        let name = segments.pop().unwrap_or_default();
        ImageRef::new(registry, segments.join("/"), name, tag)
    }
}

/// Target platform in `os/arch[/variant]` form, e.g. `linux/arm64`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Platform(String);

impl Platform {
    pub fn new(platform: impl Into<String>) -> Self {
        Platform(platform.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Architecture slug without the OS prefix (`linux/arm/v7` -> `arm-v7`).
    pub fn arch(&self) -> String {
        let rest = self.0.split_once('/').map(|(_, r)| r).unwrap_or(&self.0);
        rest.replace('/', "-")
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A single-platform image pushed by the build matrix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuiltImage {
    pub platform: Platform,
    pub digest: ImageDigest,
    /// Tags pointing directly at this image (empty when pushed by digest)
    pub tags: Vec<ImageRef>,
}

/// Multi-platform manifest list assembled from the matrix outputs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageManifest {
    pub digest: ImageDigest,
    pub tags: Vec<ImageRef>,
    pub platforms: Vec<Platform>,
}

impl ImageManifest {
    /// Most specific tag: `<branch>-<sha>` is always derived last.
    pub fn traceable_tag(&self) -> Option<&ImageRef> {
        self.tags.last()
    }
}
