//! The `/v2` HTTP surface.
//!
//! Repository names may contain slashes, so everything under `/v2/` goes
//! through one wildcard route and a path parser that recognizes the
//! distribution endpoints from the right-hand side.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{header, HeaderMap, Response, StatusCode};
use axum::routing::any;
use axum::Router;
use bytes::Bytes;
use serde::Serialize;
use tokio::io::AsyncReadExt;
use tokio_util::io::ReaderStream;

use ocicore::digest::{digest_eq, parse_sha256, sha256_digest};
use ocicore::name::valid_repository;
use ocicore::wire::{
    ErrorCode, ManifestSummary, DOCKER_API_VERSION, DOCKER_API_VERSION_VALUE,
    DOCKER_CONTENT_DIGEST, OCI_IMAGE_INDEX_V1, OCI_IMAGE_MANIFEST_V1,
};

use crate::blobs::BlobError;
use crate::error::RegistryError;
use crate::uploads::UploadError;
use crate::Registry;

// bodies buffered in full (manifests, upload chunks); a production
// deployment would raise this behind DefaultBodyLimit instead
const MAX_BODY: usize = 1024 * 1024 * 1024;

pub fn router(registry: Arc<Registry>) -> Router {
    Router::new()
        .route("/v2/", any(ping))
        .route("/v2", any(ping))
        .route("/v2/{*rest}", any(dispatch))
        .with_state(registry)
}

async fn ping() -> Response<Body> {
    Response::builder()
        .status(StatusCode::OK)
        .header(DOCKER_API_VERSION, DOCKER_API_VERSION_VALUE)
        .body(Body::empty())
        .unwrap()
}

#[derive(Debug, PartialEq, Eq)]
enum Route {
    Catalog,
    Tags(String),
    Referrers(String, String),
    Manifest(String, String),
    Blob(String, String),
    UploadStart(String),
    Upload(String, String),
}

impl Route {
    fn name(&self) -> Option<&str> {
        match self {
            Route::Catalog => None,
            Route::Tags(name)
            | Route::Referrers(name, _)
            | Route::Manifest(name, _)
            | Route::Blob(name, _)
            | Route::UploadStart(name)
            | Route::Upload(name, _) => Some(name),
        }
    }
}

fn parse_route(rest: &str) -> Option<Route> {
    if rest == "_catalog" {
        return Some(Route::Catalog);
    }
    let segs: Vec<&str> = rest.split('/').collect();
    let n = segs.len();
    let name = |upto: usize| -> Option<String> {
        if upto == 0 {
            None
        } else {
            Some(segs[..upto].join("/"))
        }
    };
    if n >= 4 && segs[n - 3] == "blobs" && segs[n - 2] == "uploads" {
        let nm = name(n - 3)?;
        if segs[n - 1].is_empty() {
            return Some(Route::UploadStart(nm));
        }
        return Some(Route::Upload(nm, segs[n - 1].to_string()));
    }
    if n >= 3 && segs[n - 2] == "blobs" && !segs[n - 1].is_empty() {
        return Some(Route::Blob(name(n - 2)?, segs[n - 1].to_string()));
    }
    if n >= 3 && segs[n - 2] == "manifests" && !segs[n - 1].is_empty() {
        return Some(Route::Manifest(name(n - 2)?, segs[n - 1].to_string()));
    }
    if n >= 3 && segs[n - 2] == "referrers" && !segs[n - 1].is_empty() {
        return Some(Route::Referrers(name(n - 2)?, segs[n - 1].to_string()));
    }
    if n >= 3 && segs[n - 2] == "tags" && segs[n - 1] == "list" {
        return Some(Route::Tags(name(n - 2)?));
    }
    None
}

fn percent_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' if i + 2 < bytes.len() => {
                let hi = (bytes[i + 1] as char).to_digit(16);
                let lo = (bytes[i + 2] as char).to_digit(16);
                if let (Some(hi), Some(lo)) = (hi, lo) {
                    out.push((hi * 16 + lo) as u8);
                    i += 3;
                } else {
                    out.push(bytes[i]);
                    i += 1;
                }
            }
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn query_get(query: &str, key: &str) -> Option<String> {
    query.split('&').find_map(|pair| {
        let (k, v) = pair.split_once('=')?;
        if k == key { Some(percent_decode(v)) } else { None }
    })
}

async fn dispatch(
    State(registry): State<Arc<Registry>>,
    req: Request,
) -> Result<Response<Body>, RegistryError> {
    let method = req.method().clone();
    let uri = req.uri().clone();
    let rest = uri.path().strip_prefix("/v2/").unwrap_or("");
    let query = uri.query().unwrap_or("").to_string();
    let headers = req.headers().clone();

    let Some(route) = parse_route(rest) else {
        return Err(RegistryError::oci(ErrorCode::Unsupported, "unknown route"));
    };
    if let Some(name) = route.name() {
        if !valid_repository(name) {
            return Err(RegistryError::oci(
                ErrorCode::NameInvalid,
                format!("invalid repository name {name:?}"),
            ));
        }
    }
    log::trace!("{} /v2/{} -> {:?}", method, rest, route);

    match (route, method.as_str()) {
        (Route::Catalog, "GET") => catalog(&registry, &query),
        (Route::Tags(name), "GET") => tags(&registry, &name, &query),
        (Route::Referrers(name, digest), "GET") => referrers(&registry, &name, &digest, &query),
        (Route::Manifest(name, reference), "GET") => {
            manifest_get(&registry, &name, &reference, true)
        }
        (Route::Manifest(name, reference), "HEAD") => {
            manifest_get(&registry, &name, &reference, false)
        }
        (Route::Manifest(name, reference), "PUT") => {
            let body = read_body(req).await?;
            manifest_put(&registry, &name, &reference, &headers, body)
        }
        (Route::Manifest(name, reference), "DELETE") => {
            manifest_delete(&registry, &name, &reference)
        }
        (Route::Blob(name, digest), "HEAD") => blob_head(&registry, &name, &digest).await,
        (Route::Blob(name, digest), "GET") => {
            blob_get(&registry, &name, &digest, &headers).await
        }
        (Route::Blob(name, digest), "DELETE") => {
            blob_delete(&registry, &name, &digest).await
        }
        (Route::UploadStart(name), "POST") => {
            let body = read_body(req).await?;
            upload_start(&registry, &name, &query, &headers, body).await
        }
        (Route::Upload(name, id), "PATCH") => {
            let body = read_body(req).await?;
            upload_patch(&registry, &name, &id, &headers, body)
        }
        (Route::Upload(name, id), "PUT") => {
            let body = read_body(req).await?;
            upload_put(&registry, &name, &id, &query, body).await
        }
        _ => Err(RegistryError::oci(
            ErrorCode::Unsupported,
            "method not allowed for route",
        )),
    }
}

async fn read_body(req: Request) -> Result<Bytes, RegistryError> {
    axum::body::to_bytes(req.into_body(), MAX_BODY)
        .await
        .map_err(|e| RegistryError::BodyRead(axum::Error::new(e)))
}

fn blob_location(name: &str, digest: &str) -> String {
    format!("/v2/{name}/blobs/{digest}")
}

fn upload_location(name: &str, id: u64) -> String {
    format!("/v2/{name}/blobs/uploads/{id}")
}

// --- blobs

async fn blob_head(
    registry: &Registry,
    name: &str,
    digest: &str,
) -> Result<Response<Body>, RegistryError> {
    let digest = parse_sha256(digest)
        .map_err(|e| RegistryError::oci(ErrorCode::DigestInvalid, e.to_string()))?;
    match registry.blobs.stat(name, &digest).await {
        Ok(size) => Ok(Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_LENGTH, size)
            .header(header::CONTENT_TYPE, "application/octet-stream")
            .header(DOCKER_CONTENT_DIGEST, digest.to_string())
            .body(Body::empty())
            .unwrap()),
        Err(BlobError::NotFound) => Err(RegistryError::blob_unknown()),
        Err(BlobError::Io(e)) => Err(e.into()),
    }
}

// single `bytes=s-e` range, end inclusive and optional
fn parse_range(headers: &HeaderMap, size: u64) -> Option<Result<(u64, u64), ()>> {
    let raw = headers.get(header::RANGE)?.to_str().ok()?;
    let spec = raw.strip_prefix("bytes=")?;
    let (start, end) = spec.split_once('-')?;
    let start: u64 = match start.parse() {
        Ok(v) => v,
        Err(_) => return Some(Err(())),
    };
    let end: u64 = if end.is_empty() {
        size.saturating_sub(1)
    } else {
        match end.parse() {
            Ok(v) => v,
            Err(_) => return Some(Err(())),
        }
    };
    if start > end || start >= size {
        return Some(Err(()));
    }
    Some(Ok((start, end.min(size.saturating_sub(1)))))
}

async fn blob_get(
    registry: &Registry,
    name: &str,
    digest: &str,
    headers: &HeaderMap,
) -> Result<Response<Body>, RegistryError> {
    let digest = parse_sha256(digest)
        .map_err(|e| RegistryError::oci(ErrorCode::DigestInvalid, e.to_string()))?;
    let size = match registry.blobs.stat(name, &digest).await {
        Ok(size) => size,
        Err(BlobError::NotFound) => return Err(RegistryError::blob_unknown()),
        Err(BlobError::Io(e)) => return Err(e.into()),
    };
    let mut reader = match registry.blobs.get(name, &digest).await {
        Ok(r) => r,
        Err(BlobError::NotFound) => return Err(RegistryError::blob_unknown()),
        Err(BlobError::Io(e)) => return Err(e.into()),
    };

    match parse_range(headers, size) {
        None => Ok(Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_LENGTH, size)
            .header(header::CONTENT_TYPE, "application/octet-stream")
            .header(DOCKER_CONTENT_DIGEST, digest.to_string())
            .body(Body::from_stream(ReaderStream::new(reader)))
            .unwrap()),
        Some(Err(())) => Ok(Response::builder()
            .status(StatusCode::RANGE_NOT_SATISFIABLE)
            .header(header::CONTENT_RANGE, format!("bytes */{size}"))
            .body(Body::empty())
            .unwrap()),
        Some(Ok((start, end))) => {
            if start > 0 {
                tokio::io::copy(&mut (&mut reader).take(start), &mut tokio::io::sink()).await?;
            }
            let len = end - start + 1;
            Ok(Response::builder()
                .status(StatusCode::PARTIAL_CONTENT)
                .header(header::CONTENT_LENGTH, len)
                .header(
                    header::CONTENT_RANGE,
                    format!("bytes {start}-{end}/{size}"),
                )
                .header(DOCKER_CONTENT_DIGEST, digest.to_string())
                .body(Body::from_stream(ReaderStream::new(reader.take(len))))
                .unwrap())
        }
    }
}

async fn blob_delete(
    registry: &Registry,
    name: &str,
    digest: &str,
) -> Result<Response<Body>, RegistryError> {
    let digest = parse_sha256(digest)
        .map_err(|e| RegistryError::oci(ErrorCode::DigestInvalid, e.to_string()))?;
    match registry.blobs.delete(name, &digest).await {
        Ok(()) => Ok(Response::builder()
            .status(StatusCode::ACCEPTED)
            .body(Body::empty())
            .unwrap()),
        Err(BlobError::NotFound) => Err(RegistryError::blob_unknown()),
        Err(BlobError::Io(e)) => Err(e.into()),
    }
}

// --- uploads

async fn upload_start(
    registry: &Registry,
    name: &str,
    query: &str,
    headers: &HeaderMap,
    body: Bytes,
) -> Result<Response<Body>, RegistryError> {
    // cross-repo mount short-circuits when the blob is already present
    if let (Some(mount), Some(from)) = (query_get(query, "mount"), query_get(query, "from")) {
        if let Ok(digest) = parse_sha256(&mount) {
            if registry.blobs.stat(&from, &digest).await.is_ok() {
                return Ok(Response::builder()
                    .status(StatusCode::CREATED)
                    .header(header::LOCATION, blob_location(name, &digest.to_string()))
                    .header(DOCKER_CONTENT_DIGEST, digest.to_string())
                    .body(Body::empty())
                    .unwrap());
            }
        }
        // fall through to a regular session
    }

    if let Some(digest) = query_get(query, "digest") {
        // monolithic one-shot: the exact bytes must ride on the POST
        if headers.contains_key(header::CONTENT_RANGE) {
            return Err(RegistryError::oci(
                ErrorCode::BlobUploadInvalid,
                "chunked monolithic upload not accepted",
            ));
        }
        let digest = parse_sha256(&digest)
            .map_err(|e| RegistryError::oci(ErrorCode::DigestInvalid, e.to_string()))?;
        if sha256_digest(&body).digest() != digest.digest() {
            return Err(RegistryError::oci(
                ErrorCode::DigestInvalid,
                "digest does not match uploaded content",
            ));
        }
        registry
            .blobs
            .put(name, &digest, body)
            .await
            .map_err(|e| match e {
                BlobError::Io(e) => RegistryError::Io(e),
                BlobError::NotFound => RegistryError::blob_unknown(),
            })?;
        return Ok(Response::builder()
            .status(StatusCode::CREATED)
            .header(header::LOCATION, blob_location(name, &digest.to_string()))
            .header(DOCKER_CONTENT_DIGEST, digest.to_string())
            .body(Body::empty())
            .unwrap());
    }

    let id = registry.uploads.begin();
    if !body.is_empty() {
        // a body on a plain POST seeds the session
        registry
            .uploads
            .append(id, None, &body)
            .expect("freshly created session");
    }
    Ok(Response::builder()
        .status(StatusCode::ACCEPTED)
        .header(header::LOCATION, upload_location(name, id))
        .header(header::RANGE, "0-0")
        .header("docker-upload-uuid", id.to_string())
        .header(header::CONTENT_LENGTH, 0)
        .body(Body::empty())
        .unwrap())
}

// inbound `Content-Range: <s>-<e>` with an optional `bytes ` prefix and
// optional `/<total>` suffix
fn parse_content_range_start(headers: &HeaderMap) -> Option<Result<u64, ()>> {
    let raw = headers.get(header::CONTENT_RANGE)?.to_str().ok()?;
    let spec = raw.strip_prefix("bytes ").unwrap_or(raw);
    let spec = spec.split_once('/').map(|(l, _)| l).unwrap_or(spec);
    let (start, _end) = match spec.split_once('-') {
        Some(x) => x,
        None => return Some(Err(())),
    };
    Some(start.parse().map_err(|_| ()))
}

fn upload_patch(
    registry: &Registry,
    name: &str,
    id: &str,
    headers: &HeaderMap,
    body: Bytes,
) -> Result<Response<Body>, RegistryError> {
    let id: u64 = id
        .parse()
        .map_err(|_| RegistryError::oci(ErrorCode::BlobUploadUnknown, "bad upload id"))?;
    let declared_start = match parse_content_range_start(headers) {
        None => None,
        Some(Ok(s)) => Some(s),
        Some(Err(())) => {
            return Err(RegistryError::oci(
                ErrorCode::BlobUploadInvalid,
                "malformed content range",
            ))
        }
    };
    match registry.uploads.append(id, declared_start, &body) {
        Ok(accumulated) => Ok(Response::builder()
            .status(StatusCode::ACCEPTED)
            .header(header::LOCATION, upload_location(name, id))
            .header(
                header::RANGE,
                format!("0-{}", accumulated.saturating_sub(1)),
            )
            .header("docker-upload-uuid", id.to_string())
            .header(header::CONTENT_LENGTH, 0)
            .body(Body::empty())
            .unwrap()),
        Err(UploadError::Unknown) => Err(RegistryError::oci(
            ErrorCode::BlobUploadUnknown,
            "upload session unknown",
        )),
        Err(UploadError::RangeMismatch { expected, got }) => {
            // out-of-order chunk: tell the client where we are
            log::debug!("upload {id} range mismatch: expected {expected} got {got}");
            let body = serde_json::to_vec(&ocicore::wire::ErrorBody::single(
                ErrorCode::BlobUploadUnknown,
                format!("range start {got} != accumulated {expected}"),
            ))
            .unwrap();
            Ok(Response::builder()
                .status(StatusCode::RANGE_NOT_SATISFIABLE)
                .header(header::LOCATION, upload_location(name, id))
                .header(header::RANGE, format!("0-{}", expected.saturating_sub(1)))
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body))
                .unwrap())
        }
    }
}

async fn upload_put(
    registry: &Registry,
    name: &str,
    id: &str,
    query: &str,
    body: Bytes,
) -> Result<Response<Body>, RegistryError> {
    let id: u64 = id
        .parse()
        .map_err(|_| RegistryError::oci(ErrorCode::BlobUploadUnknown, "bad upload id"))?;
    let Some(digest) = query_get(query, "digest") else {
        return Err(RegistryError::oci(
            ErrorCode::DigestInvalid,
            "digest query parameter required",
        ));
    };

    let mut accumulated = registry.uploads.take(id);
    accumulated.extend_from_slice(&body);

    let digest = match parse_sha256(&digest) {
        Ok(d) => d,
        Err(e) => {
            registry.uploads.restore(id, accumulated);
            return Err(RegistryError::oci(ErrorCode::DigestInvalid, e.to_string()));
        }
    };

    {
        use sha2::Digest as _;
        let mut hasher = sha2::Sha256::new();
        hasher.update(&accumulated);
        if !digest_eq(digest.digest(), hasher) {
            // leave the session for the client to recover or abandon
            registry.uploads.restore(id, accumulated);
            return Err(RegistryError::oci(
                ErrorCode::DigestInvalid,
                "digest does not match uploaded content",
            ));
        }
    }

    registry
        .blobs
        .put(name, &digest, Bytes::from(accumulated))
        .await
        .map_err(|e| match e {
            BlobError::Io(e) => RegistryError::Io(e),
            BlobError::NotFound => RegistryError::blob_unknown(),
        })?;

    Ok(Response::builder()
        .status(StatusCode::CREATED)
        .header(header::LOCATION, blob_location(name, &digest.to_string()))
        .header(DOCKER_CONTENT_DIGEST, digest.to_string())
        .body(Body::empty())
        .unwrap())
}

// --- manifests

fn manifest_get(
    registry: &Registry,
    name: &str,
    reference: &str,
    with_body: bool,
) -> Result<Response<Body>, RegistryError> {
    if !registry.manifests.has_repo(name) {
        return Err(RegistryError::name_unknown());
    }
    let stored = registry
        .manifests
        .get(name, reference)
        .ok_or_else(RegistryError::manifest_unknown)?;
    let builder = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, stored.content_type.clone())
        .header(header::CONTENT_LENGTH, stored.bytes.len())
        .header(DOCKER_CONTENT_DIGEST, stored.digest.clone());
    let body = if with_body {
        Body::from(stored.bytes.clone())
    } else {
        Body::empty()
    };
    Ok(builder.body(body).unwrap())
}

fn manifest_put(
    registry: &Registry,
    name: &str,
    reference: &str,
    headers: &HeaderMap,
    body: Bytes,
) -> Result<Response<Body>, RegistryError> {
    if ManifestSummary::parse(&body).is_err() {
        return Err(RegistryError::oci(
            ErrorCode::ManifestInvalid,
            "manifest is not valid json",
        ));
    }
    // a digest-form target must match the bytes it names
    if reference.starts_with("sha256:") {
        let expected = parse_sha256(reference)
            .map_err(|e| RegistryError::oci(ErrorCode::DigestInvalid, e.to_string()))?;
        if sha256_digest(&body).digest() != expected.digest() {
            return Err(RegistryError::oci(
                ErrorCode::DigestInvalid,
                "manifest digest does not match target",
            ));
        }
    }
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or(OCI_IMAGE_MANIFEST_V1)
        .to_string();
    let stored = registry.manifests.put(name, reference, &content_type, body);
    Ok(Response::builder()
        .status(StatusCode::CREATED)
        .header(
            header::LOCATION,
            format!("/v2/{name}/manifests/{reference}"),
        )
        .header(DOCKER_CONTENT_DIGEST, stored.digest.clone())
        .header(header::CONTENT_LENGTH, 0)
        .body(Body::empty())
        .unwrap())
}

fn manifest_delete(
    registry: &Registry,
    name: &str,
    reference: &str,
) -> Result<Response<Body>, RegistryError> {
    if !registry.manifests.has_repo(name) {
        return Err(RegistryError::name_unknown());
    }
    registry
        .manifests
        .delete(name, reference)
        .ok_or_else(RegistryError::manifest_unknown)?;
    Ok(Response::builder()
        .status(StatusCode::ACCEPTED)
        .body(Body::empty())
        .unwrap())
}

// --- listings

#[derive(Serialize)]
struct ReferrersIndex {
    #[serde(rename = "schemaVersion")]
    schema_version: u32,
    #[serde(rename = "mediaType")]
    media_type: &'static str,
    manifests: Vec<ocicore::wire::DescriptorJson>,
}

fn referrers(
    registry: &Registry,
    name: &str,
    digest: &str,
    query: &str,
) -> Result<Response<Body>, RegistryError> {
    let digest = parse_sha256(digest)
        .map_err(|e| RegistryError::oci(ErrorCode::DigestInvalid, e.to_string()))?;
    let artifact_type = query_get(query, "artifactType");
    let manifests =
        registry
            .manifests
            .referrers(name, &digest.to_string(), artifact_type.as_deref());
    let index = ReferrersIndex {
        schema_version: 2,
        media_type: OCI_IMAGE_INDEX_V1,
        manifests,
    };
    let bytes = serde_json::to_vec(&index).expect("descriptor lists serialize");
    Ok(Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, OCI_IMAGE_INDEX_V1)
        .body(Body::from(bytes))
        .unwrap())
}

#[derive(Serialize)]
struct TagList {
    name: String,
    tags: Vec<String>,
}

fn paged(items: Vec<String>, query: &str) -> (Vec<String>, Option<(usize, String)>) {
    let n: Option<usize> = query_get(query, "n").and_then(|v| v.parse().ok());
    let last = query_get(query, "last");
    let filtered: Vec<String> = match &last {
        Some(last) => items.into_iter().filter(|t| t > last).collect(),
        None => items,
    };
    match n {
        Some(n) if filtered.len() > n => {
            let page: Vec<String> = filtered.into_iter().take(n).collect();
            let next_last = page.last().cloned().unwrap_or_default();
            (page, Some((n, next_last)))
        }
        _ => (filtered, None),
    }
}

fn tags(registry: &Registry, name: &str, query: &str) -> Result<Response<Body>, RegistryError> {
    let all = registry
        .manifests
        .tags(name)
        .ok_or_else(RegistryError::name_unknown)?;
    let (page, next) = paged(all, query);
    let body = serde_json::to_vec(&TagList {
        name: name.to_string(),
        tags: page,
    })
    .unwrap();
    let mut builder = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/json");
    if let Some((n, last)) = next {
        builder = builder.header(
            header::LINK,
            format!("</v2/{name}/tags/list?n={n}&last={last}>; rel=\"next\""),
        );
    }
    Ok(builder.body(Body::from(body)).unwrap())
}

#[derive(Serialize)]
struct RepositoryList {
    repositories: Vec<String>,
}

fn catalog(registry: &Registry, query: &str) -> Result<Response<Body>, RegistryError> {
    let (page, next) = paged(registry.manifests.repositories(), query);
    let body = serde_json::to_vec(&RepositoryList { repositories: page }).unwrap();
    let mut builder = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/json");
    if let Some((n, last)) = next {
        builder = builder.header(
            header::LINK,
            format!("</v2/_catalog?n={n}&last={last}>; rel=\"next\""),
        );
    }
    Ok(builder.body(Body::from(body)).unwrap())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_route() {
        assert_eq!(parse_route("_catalog"), Some(Route::Catalog));
        assert_eq!(
            parse_route("foo/bar/tags/list"),
            Some(Route::Tags("foo/bar".into()))
        );
        assert_eq!(
            parse_route("foo/blobs/sha256:abcd"),
            Some(Route::Blob("foo".into(), "sha256:abcd".into()))
        );
        assert_eq!(
            parse_route("a/b/c/manifests/latest"),
            Some(Route::Manifest("a/b/c".into(), "latest".into()))
        );
        assert_eq!(
            parse_route("foo/blobs/uploads/"),
            Some(Route::UploadStart("foo".into()))
        );
        assert_eq!(
            parse_route("foo/blobs/uploads/123"),
            Some(Route::Upload("foo".into(), "123".into()))
        );
        assert_eq!(
            parse_route("foo/referrers/sha256:abcd"),
            Some(Route::Referrers("foo".into(), "sha256:abcd".into()))
        );
        assert_eq!(parse_route("foo"), None);
        assert_eq!(parse_route("blobs/sha256:x"), None);
    }

    #[test]
    fn test_query_get() {
        assert_eq!(
            query_get("digest=sha256%3Aabc&x=1", "digest").as_deref(),
            Some("sha256:abc")
        );
        assert_eq!(query_get("a=1&b=2", "b").as_deref(), Some("2"));
        assert_eq!(query_get("a=1", "missing"), None);
    }

    #[test]
    fn test_paged() {
        let items: Vec<String> = ["a", "b", "c", "d"].iter().map(|s| s.to_string()).collect();
        let (page, next) = paged(items.clone(), "n=2");
        assert_eq!(page, vec!["a", "b"]);
        assert_eq!(next, Some((2, "b".to_string())));
        let (page, next) = paged(items.clone(), "n=2&last=b");
        assert_eq!(page, vec!["c", "d"]);
        assert_eq!(next, None);
        let (page, next) = paged(items, "");
        assert_eq!(page.len(), 4);
        assert!(next.is_none());
    }
}
