pub mod authn;
pub mod pingcache;
pub mod pull;
pub mod push;
pub mod resume;
pub mod transport;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use bytes::Bytes;
use log::error;
use moka::future::Cache;
use tokio_util::sync::CancellationToken;

use ocicore::name::{Action, Reference};
use ocicore::wire::ErrorBody;

use authn::{AuthMap, Credential};
use pingcache::DiskCache;
use transport::{RetryConfig, Transport};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    Reqwest(#[from] reqwest::Error),
    Name(#[from] ocicore::name::NameError),
    Digest(#[from] ocicore::digest::DigestError),
    OciSpec(#[from] oci_spec::OciSpecError),
    Io(#[from] std::io::Error),
    Json(#[from] serde_json::Error),
    DigestMismatch,
    SizeMismatch,
    /// The registry handed back a signed schema 1 manifest; the raw bytes
    /// ride along so copy-style callers can still move them.
    Schema1Unsupported(Bytes),
    BadContentType(String),
    NoMatchingManifest,
    NoChallengeRecognized(String),
    OauthNotSupported,
    TokenExchangeFailed(u16),
    TokenMissing,
    BodyNotReplayable,
    ResumeTooFar(u64),
    ResumeStalled(u64),
    ResumeOffsetMismatch { want: u64, got: u64 },
    Canceled,
    PingFailed(String),
    MissingLocation,
    /// Structured error body from the registry, preserved across retries.
    Registry { status: u16, errors: ErrorBody },
    /// Non-2xx without a structured body. Url is already redacted.
    Http {
        method: String,
        url: String,
        status: u16,
        body: String,
    },
    /// Context wrapper naming the top-level operation and reference.
    Op {
        op: &'static str,
        reference: String,
        #[source]
        source: Box<Error>,
    },
    Shared(Arc<Error>),
}

// render the variant, the interesting ones carry their fields
impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::Op { op, reference, source } => {
                write!(f, "{op} {reference}: {source}")
            }
            Error::Registry { status, errors } => {
                write!(f, "registry error (status {status}): {errors}")
            }
            Error::Http {
                method,
                url,
                status,
                body,
            } => write!(f, "{method} {url} returned {status}: {body}"),
            other => write!(f, "{:?}", other),
        }
    }
}

impl Error {
    pub(crate) fn with_op(self, op: &'static str, reference: &Reference) -> Error {
        Error::Op {
            op,
            reference: reference.to_string(),
            source: Box::new(self),
        }
    }

    /// The structured registry code, when one survived to the surface.
    pub fn registry_code(&self) -> Option<ocicore::wire::ErrorCode> {
        match self {
            Error::Registry { errors, .. } => Some(errors.first_code()),
            Error::Op { source, .. } => source.registry_code(),
            Error::Shared(inner) => inner.registry_code(),
            _ => None,
        }
    }
}

/// Platform selector for picking a child out of an image index. Variant
/// only participates when set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformSelector {
    pub architecture: String,
    pub os: String,
    pub variant: Option<String>,
}

impl Default for PlatformSelector {
    fn default() -> Self {
        PlatformSelector {
            architecture: "amd64".to_string(),
            os: "linux".to_string(),
            variant: None,
        }
    }
}

impl PlatformSelector {
    pub fn matches(&self, platform: &ocicore::wire::PlatformJson) -> bool {
        platform.architecture == self.architecture
            && platform.os == self.os
            && match &self.variant {
                Some(v) => platform.variant.as_deref() == Some(v),
                None => true,
            }
    }
}

pub const DEFAULT_USER_AGENT: &str = concat!("ocidist/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub user_agent: String,
    /// Parallel blob uploads per push.
    pub jobs: usize,
    pub platform: PlatformSelector,
    pub retry: RetryConfig,
    /// Page size for tags/catalog listings; None lets the server pick.
    pub page_size: Option<usize>,
    /// Root for the ping/token disk cache; None keeps it in memory only.
    pub cache_dir: Option<PathBuf>,
    /// Upload layers whose descriptors mark them non-distributable.
    pub nondistributable: bool,
    pub cancel: CancellationToken,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            user_agent: DEFAULT_USER_AGENT.to_string(),
            jobs: 4,
            platform: PlatformSelector::default(),
            retry: RetryConfig::default(),
            page_size: None,
            cache_dir: None,
            nondistributable: false,
            cancel: CancellationToken::new(),
        }
    }
}

// Clone hands out another handle onto the same caches, moka-style.
#[derive(Clone)]
pub struct Client {
    pub(crate) http: reqwest::Client,
    pub(crate) config: Arc<ClientConfig>,
    auth_store: Arc<ArcSwap<AuthMap>>,
    transports: Cache<String, Arc<Transport>>,
    disk_cache: Option<Arc<DiskCache>>,
}

impl Client {
    pub fn new() -> Result<Client, Error> {
        Self::with_config(ClientConfig::default())
    }

    pub fn with_config(config: ClientConfig) -> Result<Client, Error> {
        let http = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::limited(2))
            .user_agent(config.user_agent.clone())
            .connect_timeout(Duration::from_secs(30))
            .build()?;

        let disk_cache = match &config.cache_dir {
            Some(root) => Some(Arc::new(DiskCache::new(root)?)),
            None => None,
        };

        let transports = Cache::builder()
            .max_capacity(1000)
            .time_to_idle(Duration::from_secs(60 * 60))
            .build();

        Ok(Client {
            http,
            config: Arc::new(config),
            auth_store: Arc::new(ArcSwap::from_pointee(AuthMap::new())),
            transports,
            disk_cache,
        })
    }

    pub fn set_auth(&self, auth: AuthMap) {
        self.auth_store.store(auth.into());
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.config.cancel.clone()
    }

    fn credential_for(&self, registry: &str) -> Credential {
        self.auth_store
            .load()
            .get(registry)
            .cloned()
            .unwrap_or(Credential::Anonymous)
    }

    /// Authenticated transport for a repository, built once per
    /// (repository, action set) and shared; concurrent first users block
    /// on the same initialization.
    pub(crate) async fn transport_for(
        &self,
        reference: &Reference,
        actions: &[Action],
    ) -> Result<Arc<Transport>, Error> {
        let scopes: Vec<String> = actions.iter().map(|a| reference.scope(*a)).collect();
        let key = format!("{}/{}#{}", reference.registry(), reference.repository(), scopes.join(","));

        self.transports
            .entry(key)
            .or_try_insert_with(Transport::connect(
                self.http.clone(),
                reference,
                scopes,
                self.credential_for(reference.registry()),
                self.config.clone(),
                self.disk_cache.clone(),
            ))
            .await
            .map(|entry| entry.into_value())
            .map_err(|e: Arc<Error>| {
                error!("transport init for {} failed: {:?}", reference, e);
                Error::Shared(e)
            })
    }

    /// Transport scoped to the registry itself (catalog listing).
    pub(crate) async fn registry_transport(&self, registry: &str) -> Result<Arc<Transport>, Error> {
        let reference = Reference::parse(&format!("{registry}/library/ignored"))?;
        let key = format!("{registry}#catalog");
        self.transports
            .entry(key)
            .or_try_insert_with(Transport::connect(
                self.http.clone(),
                &reference,
                vec![ocicore::name::CATALOG_SCOPE.to_string()],
                self.credential_for(registry),
                self.config.clone(),
                self.disk_cache.clone(),
            ))
            .await
            .map(|entry| entry.into_value())
            .map_err(|e: Arc<Error>| Error::Shared(e))
    }
}
