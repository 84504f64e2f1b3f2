//! Parsing of docker-style image references, like `nginx`,
//! `quay.io/prometheus/node-exporter:v1.8.0` or `busybox@sha256:…`.

use std::str::FromStr;

use crate::Digest;

pub const DEFAULT_DOMAIN: &str = "docker.io";
pub const DEFAULT_TAG: &str = "latest";

/// The host serving the registry API for [DEFAULT_DOMAIN].
const DEFAULT_REGISTRY_HOST: &str = "registry-1.docker.io";
const LEGACY_DEFAULT_DOMAIN: &str = "index.docker.io";
const OFFICIAL_REPO_PREFIX: &str = "library/";

const MAX_TAG_LEN: usize = 128;

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum Error {
    #[error("reference is empty")]
    Empty,

    #[error("invalid reference format: {0}")]
    InvalidFormat(String),

    #[error("repository name must be lowercase: {0}")]
    NameNotLowercase(String),

    #[error("invalid tag in {0}")]
    InvalidTag(String),

    #[error("invalid digest in {0}: {1}")]
    InvalidDigest(String, crate::digests::Error),
}

/// A fully qualified image reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Reference {
    domain: String,
    path: String,
    tag: Option<String>,
    digest: Option<Digest>,
}

/// Appends the default tag to an image reference that carries neither a tag
/// nor a digest. Everything else is returned unchanged, so the familiar form
/// the chart author wrote (e.g. `nginx:1.27`) is kept.
pub fn normalize(image: &str) -> String {
    let image = image.trim();
    if image.contains('@') {
        return image.to_string();
    }
    let last_segment = image.rsplit('/').next().unwrap_or(image);
    if last_segment.contains(':') {
        image.to_string()
    } else {
        format!("{}:{}", image, DEFAULT_TAG)
    }
}

impl Reference {
    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// Repository path inside the registry, e.g. `library/nginx`.
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    pub fn digest(&self) -> Option<&Digest> {
        self.digest.as_ref()
    }

    /// The fully qualified repository name, e.g. `docker.io/library/nginx`.
    pub fn name(&self) -> String {
        format!("{}/{}", self.domain, self.path)
    }

    /// Host to talk to for the registry API.
    pub fn registry_host(&self) -> &str {
        if self.domain == DEFAULT_DOMAIN {
            DEFAULT_REGISTRY_HOST
        } else {
            &self.domain
        }
    }

    /// What to ask the registry for: the digest if pinned, the tag otherwise.
    pub fn object(&self) -> String {
        match (&self.digest, &self.tag) {
            (Some(digest), _) => digest.to_string(),
            (None, Some(tag)) => tag.clone(),
            (None, None) => DEFAULT_TAG.to_string(),
        }
    }

    /// Returns the reference with the default tag added, unless it is
    /// already tagged or pinned by digest.
    pub fn with_default_tag(mut self) -> Self {
        if self.tag.is_none() && self.digest.is_none() {
            self.tag = Some(DEFAULT_TAG.to_string());
        }
        self
    }
}

impl std::fmt::Display for Reference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())?;
        if let Some(tag) = &self.tag {
            write!(f, ":{}", tag)?;
        }
        if let Some(digest) = &self.digest {
            write!(f, "@{}", digest)?;
        }
        Ok(())
    }
}

fn valid_path_component(component: &str) -> bool {
    !component.is_empty()
        && component
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || "._-".contains(c))
        && component.starts_with(|c: char| c.is_ascii_alphanumeric())
        && component.ends_with(|c: char| c.is_ascii_alphanumeric())
}

fn valid_tag(tag: &str) -> bool {
    !tag.is_empty()
        && tag.len() <= MAX_TAG_LEN
        && tag.starts_with(|c: char| c.is_ascii_alphanumeric() || c == '_')
        && tag
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "_.-".contains(c))
}

impl FromStr for Reference {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(Error::Empty);
        }

        let (remainder, digest) = match s.split_once('@') {
            Some((name, digest)) => (
                name,
                Some(
                    digest
                        .parse::<Digest>()
                        .map_err(|e| Error::InvalidDigest(s.to_string(), e))?,
                ),
            ),
            None => (s, None),
        };

        // a ':' after the last '/' separates the tag, earlier ones belong to
        // a registry port.
        let last_slash = remainder.rfind('/').map(|i| i + 1).unwrap_or(0);
        let (name, tag) = match remainder[last_slash..].rfind(':') {
            Some(i) => {
                let (name, tag) = remainder.split_at(last_slash + i);
                let tag = &tag[1..];
                if !valid_tag(tag) {
                    return Err(Error::InvalidTag(s.to_string()));
                }
                (name, Some(tag.to_string()))
            }
            None => (remainder, None),
        };

        let (domain, mut path) = match name.split_once('/') {
            Some((first, rest))
                if first.contains('.') || first.contains(':') || first == "localhost" =>
            {
                (first.to_string(), rest.to_string())
            }
            _ => (DEFAULT_DOMAIN.to_string(), name.to_string()),
        };

        let domain = if domain == LEGACY_DEFAULT_DOMAIN {
            DEFAULT_DOMAIN.to_string()
        } else {
            domain
        };

        if domain == DEFAULT_DOMAIN && !path.contains('/') {
            path = format!("{}{}", OFFICIAL_REPO_PREFIX, path);
        }

        if path.chars().any(|c| c.is_ascii_uppercase()) {
            return Err(Error::NameNotLowercase(s.to_string()));
        }
        if !path.split('/').all(valid_path_component) {
            return Err(Error::InvalidFormat(s.to_string()));
        }

        Ok(Reference {
            domain,
            path,
            tag,
            digest,
        })
    }
}
