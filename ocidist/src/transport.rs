//! The per-repository transport: ping, challenge handling, bearer state,
//! retry with backoff, scheme pinning and redacted logging. Everything a
//! request needs between "I have a reference" and "bytes are flowing".

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, trace, warn};
use reqwest::{header, Method, RequestBuilder, Response, StatusCode};
use tokio::sync::RwLock;

use ocicore::name::Reference;
use ocicore::wire::ErrorBody;

use crate::authn::{
    self, parse_challenges, pick_challenge, split_scopes, BearerChallenge, Challenge, Credential,
};
use crate::pingcache::DiskCache;
use crate::{ClientConfig, Error};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Https,
    Http,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Https => "https",
            Scheme::Http => "http",
        }
    }
}

impl std::fmt::Display for Scheme {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub duration: Duration,
    pub factor: f64,
    pub jitter: f64,
    /// Total attempts, not extra retries.
    pub steps: u32,
    pub statuses: BTreeSet<u16>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            duration: Duration::from_secs(1),
            factor: 3.0,
            jitter: 0.1,
            steps: 3,
            statuses: [408, 429, 500, 502, 503, 504].into_iter().collect(),
        }
    }
}

impl RetryConfig {
    pub fn backoff(&self, step: u32) -> Duration {
        let base = self.duration.as_secs_f64() * self.factor.powi(step as i32);
        let jitter = base * self.jitter * rand::random::<f64>();
        Duration::from_secs_f64(base + jitter)
    }
}

/// Outcome of the `/v2/` version check.
#[derive(Debug, Clone)]
pub struct Pong {
    pub scheme: Scheme,
    pub challenges: Vec<Challenge>,
}

const HTTP_FALLBACK_DELAY: Duration = Duration::from_millis(300);

async fn ping_scheme(
    http: &reqwest::Client,
    registry: &str,
    scheme: Scheme,
) -> Result<Pong, Error> {
    let url = format!("{scheme}://{registry}/v2/");
    trace!("GET {url} (ping)");
    let res = http.get(&url).send().await?;
    match res.status() {
        StatusCode::OK => Ok(Pong {
            scheme,
            challenges: Vec::new(),
        }),
        StatusCode::UNAUTHORIZED => {
            let challenges: Vec<Challenge> = res
                .headers()
                .get_all(header::WWW_AUTHENTICATE)
                .iter()
                .filter_map(|v| v.to_str().ok())
                .flat_map(parse_challenges)
                .collect();
            if challenges.is_empty() {
                return Err(Error::NoChallengeRecognized(String::new()));
            }
            Ok(Pong { scheme, challenges })
        }
        _ => Err(failure("GET", res).await),
    }
}

/// Version check with a happy-eyeballs race: https goes first, plain http
/// joins after a grace period for registries that look insecure. First
/// success wins; two failures are reported together.
pub(crate) async fn ping(
    http: &reqwest::Client,
    registry: &str,
    insecure: bool,
) -> Result<Pong, Error> {
    if !insecure {
        return ping_scheme(http, registry, Scheme::Https).await;
    }

    let mut https = std::pin::pin!(ping_scheme(http, registry, Scheme::Https));
    let mut plain = std::pin::pin!(async {
        tokio::time::sleep(HTTP_FALLBACK_DELAY).await;
        ping_scheme(http, registry, Scheme::Http).await
    });

    let mut https_err: Option<Error> = None;
    let mut plain_err: Option<Error> = None;
    loop {
        tokio::select! {
            res = &mut https, if https_err.is_none() => match res {
                Ok(pong) => return Ok(pong),
                Err(e) => {
                    https_err = Some(e);
                    if plain_err.is_some() {
                        break;
                    }
                }
            },
            res = &mut plain, if plain_err.is_none() => match res {
                Ok(pong) => return Ok(pong),
                Err(e) => {
                    plain_err = Some(e);
                    if https_err.is_some() {
                        break;
                    }
                }
            },
        }
    }
    Err(Error::PingFailed(format!(
        "https: {}; http: {}",
        https_err.expect("both branches failed"),
        plain_err.expect("both branches failed"),
    )))
}

enum AuthState {
    Anonymous,
    Basic,
    Bearer {
        challenge: BearerChallenge,
        token: Option<String>,
    },
}

pub struct Transport {
    http: reqwest::Client,
    registry: String,
    scheme: Scheme,
    cred: RwLock<Credential>,
    auth: RwLock<AuthState>,
    scopes: RwLock<BTreeSet<String>>,
    config: Arc<ClientConfig>,
    cache: Option<Arc<DiskCache>>,
}

impl Transport {
    pub(crate) async fn connect(
        http: reqwest::Client,
        reference: &Reference,
        scopes: Vec<String>,
        cred: Credential,
        config: Arc<ClientConfig>,
        cache: Option<Arc<DiskCache>>,
    ) -> Result<Arc<Transport>, Error> {
        let registry = reference.registry().to_string();

        let pong = match cache.as_ref().and_then(|c| c.load_ping(&registry)) {
            Some(pong) => {
                trace!("ping for {registry} served from cache");
                pong
            }
            None => {
                let pong = ping(&http, &registry, reference.is_insecure()).await?;
                if let Some(cache) = &cache {
                    cache.store_ping(&registry, &pong);
                }
                pong
            }
        };

        let mut scope_set: BTreeSet<String> = scopes.into_iter().collect();
        let auth = if pong.challenges.is_empty() {
            AuthState::Anonymous
        } else {
            let picked = pick_challenge(&pong.challenges)?;
            match BearerChallenge::from_challenge(picked) {
                Some(challenge) => {
                    if let Some(scope) = &challenge.scope {
                        scope_set.extend(split_scopes(scope).map(String::from));
                    }
                    AuthState::Bearer {
                        challenge,
                        token: None,
                    }
                }
                None => AuthState::Basic,
            }
        };

        let transport = Arc::new(Transport {
            http,
            registry,
            scheme: pong.scheme,
            cred: RwLock::new(cred),
            auth: RwLock::new(auth),
            scopes: RwLock::new(scope_set),
            config,
            cache,
        });

        if transport.is_bearer().await {
            transport.refresh_bearer().await?;
        }

        Ok(transport)
    }

    async fn is_bearer(&self) -> bool {
        matches!(&*self.auth.read().await, AuthState::Bearer { .. })
    }

    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    pub fn registry(&self) -> &str {
        &self.registry
    }

    /// Absolute URL on the registry host, in its pinned scheme.
    pub fn url(&self, path_and_query: &str) -> String {
        format!("{}://{}{}", self.scheme, self.registry, path_and_query)
    }

    /// Resolve a Location-style value. Relative locations go to the
    /// registry host; absolute URLs naming the registry host get the
    /// pinned scheme forced, any other host keeps its own scheme.
    pub fn resolve(&self, location: &str) -> String {
        match location.split_once("://") {
            None => self.url(location),
            Some((_scheme, rest)) => {
                let host = rest.split('/').next().unwrap_or("");
                if host == self.registry {
                    format!("{}://{}", self.scheme, rest)
                } else {
                    location.to_string()
                }
            }
        }
    }

    pub fn request(&self, method: Method, url: &str) -> RequestBuilder {
        self.http.request(method, url)
    }

    async fn token_cache_key(&self) -> String {
        let scopes = self.scopes.read().await;
        format!(
            "{}#{}",
            self.registry,
            scopes.iter().cloned().collect::<Vec<_>>().join(",")
        )
    }

    async fn refresh_bearer(&self) -> Result<(), Error> {
        let key = self.token_cache_key().await;
        let scopes = self.scopes.read().await.clone();
        let mut auth = self.auth.write().await;
        let AuthState::Bearer { challenge, token } = &mut *auth else {
            return Ok(());
        };

        if let Some(cached) = self.cache.as_ref().and_then(|c| c.load_token(&key)) {
            trace!("token for {key} served from cache");
            *token = Some(cached);
            return Ok(());
        }

        let cred = self.cred.read().await.clone();
        let fetched =
            authn::exchange(&self.http, challenge, &cred, &scopes, &self.config.user_agent)
                .await?;
        if let Some(rotated) = &fetched.refresh_token {
            let mut cred = self.cred.write().await;
            if let Credential::IdentityToken(user, _) = &*cred {
                *cred = Credential::IdentityToken(user.clone(), rotated.clone());
            }
        }
        if let Some(cache) = &self.cache {
            cache.store_token(&key, &fetched);
        }
        debug!("obtained bearer token for {}", self.registry);
        *token = Some(fetched.token);
        Ok(())
    }

    async fn authorize(&self, req: RequestBuilder) -> RequestBuilder {
        match &*self.auth.read().await {
            AuthState::Anonymous => req,
            AuthState::Basic => match self.cred.read().await.basic_parts() {
                Some((user, pass)) => req.basic_auth(user, pass),
                None => req,
            },
            AuthState::Bearer {
                token: Some(token), ..
            } => req.bearer_auth(token),
            AuthState::Bearer { token: None, .. } => req,
        }
    }

    /// Merge scopes demanded by a live 401 and rebuild the bearer state.
    /// Returns whether a retry makes sense.
    async fn handle_unauthorized(&self, res: &Response) -> Result<bool, Error> {
        let challenges: Vec<Challenge> = res
            .headers()
            .get_all(header::WWW_AUTHENTICATE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(parse_challenges)
            .collect();
        let Some(bearer) = challenges
            .iter()
            .find_map(BearerChallenge::from_challenge)
        else {
            // nothing bearer-shaped to renegotiate with
            return Ok(false);
        };

        if let Some(scope) = &bearer.scope {
            let mut scopes = self.scopes.write().await;
            for s in split_scopes(scope) {
                if scopes.insert(s.to_string()) {
                    debug!("{}: adding scope {s}", self.registry);
                }
            }
        }

        {
            // a stale cached ping may have left us anonymous; adopt the
            // live challenge either way
            let mut auth = self.auth.write().await;
            match &mut *auth {
                AuthState::Bearer { challenge, token } => {
                    *challenge = bearer;
                    *token = None;
                }
                state => {
                    *state = AuthState::Bearer {
                        challenge: bearer,
                        token: None,
                    }
                }
            }
        }
        if let Some(cache) = &self.cache {
            cache.drop_token(&self.token_cache_key().await);
        }
        self.refresh_bearer().await?;
        Ok(true)
    }

    /// Send with the full chain: auth header, one in-band renegotiation on
    /// 401, retry with backoff on the temporary predicate and the
    /// configured status set. The request body must be replayable (empty
    /// or bytes); streams go through [`Transport::send_rewindable`].
    pub async fn send(&self, req: RequestBuilder) -> Result<Response, Error> {
        self.send_rewindable(move || {
            let cloned = req.try_clone().ok_or(Error::BodyNotReplayable);
            async move { cloned }
        })
        .await
    }

    /// Like [`Transport::send`] for requests whose body has to be rebuilt
    /// per attempt (opened files, hashing streams).
    pub async fn send_rewindable<F>(&self, mut make: F) -> Result<Response, Error>
    where
        F: AsyncFnMut() -> Result<RequestBuilder, Error>,
    {
        let mut step = 0u32;
        let mut renegotiated = false;
        loop {
            if self.config.cancel.is_cancelled() {
                return Err(Error::Canceled);
            }
            let attempt = self.authorize(make().await?).await;
            match attempt.send().await {
                Err(e) if is_temporary(&e) && step + 1 < self.config.retry.steps => {
                    warn!("temporary send error, backing off: {e}");
                    self.backoff_sleep(step).await?;
                    step += 1;
                }
                Err(e) => return Err(e.into()),
                Ok(res) => {
                    trace!("{} -> {}", redact_url(res.url().as_str()), res.status());
                    if res.status() == StatusCode::UNAUTHORIZED && !renegotiated {
                        renegotiated = true;
                        if self.handle_unauthorized(&res).await? {
                            continue;
                        }
                        return Ok(res);
                    }
                    if self.config.retry.statuses.contains(&res.status().as_u16())
                        && step + 1 < self.config.retry.steps
                    {
                        debug!(
                            "retryable status {} from {}, backing off",
                            res.status(),
                            self.registry
                        );
                        self.backoff_sleep(step).await?;
                        step += 1;
                        continue;
                    }
                    return Ok(res);
                }
            }
        }
    }

    async fn backoff_sleep(&self, step: u32) -> Result<(), Error> {
        let delay = self.config.retry.backoff(step);
        tokio::select! {
            _ = self.config.cancel.cancelled() => Err(Error::Canceled),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }

    pub(crate) fn cancel(&self) -> tokio_util::sync::CancellationToken {
        self.config.cancel.clone()
    }
}

fn is_temporary(e: &reqwest::Error) -> bool {
    e.is_timeout() || e.is_connect()
}

/// Strip credential-bearing query values before a URL reaches a log line
/// or an error message.
pub(crate) fn redact_url(url: &str) -> String {
    let Some((base, query)) = url.split_once('?') else {
        return url.to_string();
    };
    let redacted: Vec<String> = query
        .split('&')
        .map(|pair| match pair.split_once('=') {
            Some((k, _)) if k.eq_ignore_ascii_case("access_token") || k.eq_ignore_ascii_case("token") => {
                format!("{k}=REDACTED")
            }
            _ => pair.to_string(),
        })
        .collect();
    format!("{base}?{}", redacted.join("&"))
}

const BODY_EXCERPT: usize = 256;

/// Turn a non-2xx response into the error the caller sees. A structured
/// body survives as [`Error::Registry`]; anything else keeps a short
/// excerpt with the url redacted.
pub(crate) async fn failure(method: &'static str, res: Response) -> Error {
    let status = res.status().as_u16();
    let url = redact_url(res.url().as_str());
    let body = res.bytes().await.unwrap_or_default();
    if let Some(errors) = ErrorBody::parse(&body) {
        Error::Registry { status, errors }
    } else {
        let mut excerpt = String::from_utf8_lossy(&body).into_owned();
        excerpt.truncate(BODY_EXCERPT);
        Error::Http {
            method: method.to_string(),
            url,
            status,
            body: excerpt,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_schedule() {
        let retry = RetryConfig {
            jitter: 0.0,
            ..RetryConfig::default()
        };
        assert_eq!(retry.backoff(0), Duration::from_secs(1));
        assert_eq!(retry.backoff(1), Duration::from_secs(3));
        assert_eq!(retry.backoff(2), Duration::from_secs(9));
    }

    #[test]
    fn test_backoff_jitter_bounded() {
        let retry = RetryConfig::default();
        for step in 0..3 {
            let base = Duration::from_secs(3u64.pow(step));
            let d = retry.backoff(step);
            assert!(d >= base);
            assert!(d <= base.mul_f64(1.1));
        }
    }

    #[test]
    fn test_redact_url() {
        assert_eq!(
            redact_url("https://ts.example/token?service=reg&access_token=secret"),
            "https://ts.example/token?service=reg&access_token=REDACTED"
        );
        assert_eq!(
            redact_url("https://reg.example/v2/foo/blobs/sha256:abc"),
            "https://reg.example/v2/foo/blobs/sha256:abc"
        );
    }

    #[test]
    fn test_default_retry_statuses() {
        let retry = RetryConfig::default();
        for status in [408, 429, 500, 502, 503, 504] {
            assert!(retry.statuses.contains(&status));
        }
        assert!(!retry.statuses.contains(&404));
        assert!(!retry.statuses.contains(&401));
    }
}







