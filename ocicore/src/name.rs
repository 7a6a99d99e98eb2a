//! Docker-style image reference parsing.
//!
//! A reference is `[registry/]repository[:tag][@algo:hex]` where the
//! registry is recognized by looking like a host (contains `.` or `:`, or is
//! `localhost`). Everything else is repository path. A missing tag defaults
//! to `latest`, a missing registry to the configured default.

use crate::digest::{is_lower_hex, SHA256_HEX_LEN};

pub const DEFAULT_REGISTRY: &str = "index.docker.io";
pub const DEFAULT_TAG: &str = "latest";

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum NameError {
    #[error("empty reference")]
    Empty,
    #[error("bad repository {0:?}")]
    BadRepository(String),
    #[error("bad tag {0:?}")]
    BadTag(String),
    #[error("bad digest {0:?}")]
    BadDigest(String),
    #[error("bad registry {0:?}")]
    BadRegistry(String),
    #[error("registry {0:?} must contain '.' or ':'")]
    RegistryNotDistinct(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Pull,
    Push,
    Delete,
}

impl Action {
    fn as_str(&self) -> &'static str {
        match self {
            Action::Pull => "pull",
            Action::Push => "push",
            Action::Delete => "delete",
        }
    }
}

/// What the reference points at within the repository.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Target {
    Tag(String),
    /// (algorithm, lowercase hex)
    Digest(String, String),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Reference {
    registry: String,
    repository: String,
    target: Target,
}

#[derive(Debug, Clone)]
pub struct ParseOptions {
    pub default_registry: String,
    pub default_tag: String,
    /// Require the registry part to be written out (contain `.` or `:`).
    pub strict: bool,
}

impl Default for ParseOptions {
    fn default() -> Self {
        ParseOptions {
            default_registry: DEFAULT_REGISTRY.to_string(),
            default_tag: DEFAULT_TAG.to_string(),
            strict: false,
        }
    }
}

// first path component is a registry if it reads like a host
fn looks_like_host(s: &str) -> bool {
    s == "localhost" || s.contains('.') || s.contains(':')
}

/// Whether `s` is a well-formed repository name: one or more non-empty
/// slash-separated components of lowercase alphanumerics and `._-`.
/// Shared with the server side, which rejects anything else up front.
pub fn valid_repository(s: &str) -> bool {
    if s.is_empty() {
        return false;
    }
    s.split('/').all(|component| {
        !component.is_empty()
            && component.chars().all(|c| {
                c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '.' | '_' | '-')
            })
    })
}

fn valid_tag(s: &str) -> bool {
    if s.is_empty() || s.len() > 128 {
        return false;
    }
    let mut chars = s.chars();
    let first = chars.next().unwrap();
    (first.is_ascii_alphanumeric() || first == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
}

fn valid_registry(s: &str) -> bool {
    !s.is_empty()
        && !s.contains('/')
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | ':' | '[' | ']'))
}

impl Reference {
    pub fn parse(s: &str) -> Result<Reference, NameError> {
        Self::parse_with(s, &ParseOptions::default())
    }

    pub fn parse_strict(s: &str) -> Result<Reference, NameError> {
        Self::parse_with(
            s,
            &ParseOptions {
                strict: true,
                ..ParseOptions::default()
            },
        )
    }

    pub fn parse_with(s: &str, opts: &ParseOptions) -> Result<Reference, NameError> {
        if s.is_empty() {
            return Err(NameError::Empty);
        }

        let (rest, digest) = match s.split_once('@') {
            Some((l, r)) => (l, Some(r)),
            None => (s, None),
        };

        // the tag separator is a ':' after the last '/'
        let (rest, tag) = match rest.rsplit_once(':') {
            Some((l, r)) if !r.contains('/') => (l, Some(r)),
            _ => (rest, None),
        };

        let (registry, repository) = match rest.split_once('/') {
            Some((head, tail)) if looks_like_host(head) => (head.to_string(), tail.to_string()),
            _ => (opts.default_registry.clone(), rest.to_string()),
        };

        if !valid_registry(&registry) {
            return Err(NameError::BadRegistry(registry));
        }
        if opts.strict && !registry.contains('.') && !registry.contains(':') {
            return Err(NameError::RegistryNotDistinct(registry));
        }
        if !valid_repository(&repository) {
            return Err(NameError::BadRepository(repository.to_string()));
        }

        let target = match (tag, digest) {
            // a digest wins over a tag when both are written
            (_, Some(d)) => {
                let (algo, hex) = d.split_once(':').ok_or(NameError::BadDigest(d.into()))?;
                if algo != "sha256" || hex.len() != SHA256_HEX_LEN || !is_lower_hex(hex) {
                    return Err(NameError::BadDigest(d.to_string()));
                }
                Target::Digest(algo.to_string(), hex.to_string())
            }
            (Some(t), None) => {
                if !valid_tag(t) {
                    return Err(NameError::BadTag(t.to_string()));
                }
                Target::Tag(t.to_string())
            }
            (None, None) => Target::Tag(opts.default_tag.clone()),
        };

        Ok(Reference {
            registry,
            repository,
            target,
        })
    }

    pub fn registry(&self) -> &str {
        &self.registry
    }

    pub fn repository(&self) -> &str {
        &self.repository
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    pub fn tag(&self) -> Option<&str> {
        match &self.target {
            Target::Tag(t) => Some(t),
            Target::Digest(..) => None,
        }
    }

    /// The full `algo:hex` form, when this is a digest reference.
    pub fn digest(&self) -> Option<String> {
        match &self.target {
            Target::Tag(_) => None,
            Target::Digest(algo, hex) => Some(format!("{algo}:{hex}")),
        }
    }

    /// Tag or `algo:hex`, as used in `/v2/<name>/manifests/<identifier>`.
    pub fn identifier(&self) -> String {
        match &self.target {
            Target::Tag(t) => t.clone(),
            Target::Digest(algo, hex) => format!("{algo}:{hex}"),
        }
    }

    pub fn with_tag(&self, tag: impl Into<String>) -> Reference {
        Reference {
            registry: self.registry.clone(),
            repository: self.repository.clone(),
            target: Target::Tag(tag.into()),
        }
    }

    pub fn with_digest(&self, digest: &str) -> Result<Reference, NameError> {
        let (algo, hex) = digest
            .split_once(':')
            .ok_or(NameError::BadDigest(digest.to_string()))?;
        if algo != "sha256" || hex.len() != SHA256_HEX_LEN || !is_lower_hex(hex) {
            return Err(NameError::BadDigest(digest.to_string()));
        }
        Ok(Reference {
            registry: self.registry.clone(),
            repository: self.repository.clone(),
            target: Target::Digest(algo.to_string(), hex.to_string()),
        })
    }

    /// Auth scope string for this repository.
    pub fn scope(&self, action: Action) -> String {
        format!("repository:{}:{}", self.repository, action.as_str())
    }

    /// Registry host without port or ipv6 brackets.
    pub fn host(&self) -> &str {
        let h = match self.registry.rfind(':') {
            // a colon inside brackets is part of an ipv6 address
            Some(i) if !self.registry[i..].contains(']') => &self.registry[..i],
            _ => &self.registry[..],
        };
        h.strip_prefix('[')
            .and_then(|x| x.strip_suffix(']'))
            .unwrap_or(h)
    }

    /// Loopback and localhost registries default to plain http.
    pub fn is_insecure(&self) -> bool {
        let host = self.host();
        if host == "localhost" || host == "::1" {
            return true;
        }
        let mut octets = host.split('.');
        matches!(octets.next(), Some("127"))
            && octets.clone().count() == 3
            && octets.all(|o| o.parse::<u8>().is_ok())
    }
}

/// Scope that grants catalog listing on a registry.
pub const CATALOG_SCOPE: &str = "registry:catalog:*";

impl std::str::FromStr for Reference {
    type Err = NameError;
    fn from_str(s: &str) -> Result<Self, NameError> {
        Reference::parse(s)
    }
}

impl std::fmt::Display for Reference {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match &self.target {
            Target::Tag(t) => write!(f, "{}/{}:{}", self.registry, self.repository, t),
            Target::Digest(algo, hex) => {
                write!(f, "{}/{}@{}:{}", self.registry, self.repository, algo, hex)
            }
        }
    }
}
