//! Pull side: manifest fetch and dispatch, verified blob streams, tag and
//! catalog listings, referrers lookup with the fallback-tag scheme.

use bytes::Bytes;
use log::trace;
use reqwest::{header, Method, StatusCode};
use serde::Deserialize;
use tokio::io::{AsyncRead, AsyncWrite};

use oci_spec::image::{Descriptor, Digest, ImageConfiguration, ImageIndex, ImageManifest};

use ocicore::digest::{expect_sha256, sha256_digest};
use ocicore::name::{Action, Reference, Target};
use ocicore::verify::{verify_error, VerifyError, VerifyReader};
use ocicore::wire::{
    DescriptorJson, ManifestKind, ManifestSummary, ACCEPT_MANIFEST,
};

use crate::resume::ResumableBody;
use crate::transport::failure;
use crate::{Client, Error};

/// Raw manifest bytes plus the identity they verified against.
pub struct ManifestResponse {
    pub reference: Reference,
    pub digest: Digest,
    pub media_type: String,
    pub data: Bytes,
}

impl ManifestResponse {
    pub fn summary(&self) -> ManifestSummary {
        ManifestSummary::parse(&self.data).unwrap_or_default()
    }

    pub fn kind(&self) -> ManifestKind {
        self.summary().kind(Some(&self.media_type))
    }
}

/// A pulled single-platform image. Layers stay on the registry until read.
pub struct Image {
    pub reference: Reference,
    pub digest: Digest,
    pub media_type: String,
    pub data: Bytes,
    manifest: ImageManifest,
}

impl Image {
    pub fn manifest(&self) -> &ImageManifest {
        &self.manifest
    }

    pub fn layers(&self) -> &[Descriptor] {
        self.manifest.layers()
    }

    pub fn config_descriptor(&self) -> &Descriptor {
        self.manifest.config()
    }

    /// Where the layers live, for cross-repo mount attempts on a later
    /// push to the same registry.
    pub fn source(&self) -> &Reference {
        &self.reference
    }
}

/// A pulled image index.
pub struct Index {
    pub reference: Reference,
    pub digest: Digest,
    pub media_type: String,
    pub data: Bytes,
    index: ImageIndex,
}

impl Index {
    pub fn index(&self) -> &ImageIndex {
        &self.index
    }

    pub fn children(&self) -> &[Descriptor] {
        self.index.manifests()
    }
}

fn manifest_path(reference: &Reference) -> String {
    format!(
        "/v2/{}/manifests/{}",
        reference.repository(),
        reference.identifier()
    )
}

fn blob_path(reference: &Reference, digest: &Digest) -> String {
    format!("/v2/{}/blobs/{}", reference.repository(), digest)
}

// io errors coming back out of a verified/resumable stream carry our own
// error types; unwrap them so callers see DigestMismatch, not "io error"
fn unwrap_stream_error(e: std::io::Error) -> Error {
    match verify_error(&e) {
        Some(VerifyError::DigestMismatch { .. }) => return Error::DigestMismatch,
        Some(VerifyError::SizeMismatch { .. }) => return Error::SizeMismatch,
        None => {}
    }
    match e.downcast::<Error>() {
        Ok(inner) => inner,
        Err(e) => Error::Io(e),
    }
}

impl Client {
    /// GET a manifest and verify its identity. Digest references must hash
    /// to their digest; tag references adopt the computed digest. Signed
    /// schema 1 comes back as [`Error::Schema1Unsupported`] with the raw
    /// bytes attached.
    pub async fn get_manifest(
        &self,
        reference: &Reference,
    ) -> Result<Option<ManifestResponse>, Error> {
        let transport = self.transport_for(reference, &[Action::Pull]).await?;
        let url = transport.url(&manifest_path(reference));
        trace!("GET {url}");
        let req = transport
            .request(Method::GET, &url)
            .header(header::ACCEPT, ACCEPT_MANIFEST);
        let res = transport.send(req).await?;

        match res.status() {
            StatusCode::OK => {}
            StatusCode::NOT_FOUND => return Ok(None),
            _ => return Err(failure("GET", res).await.with_op("pull", reference)),
        }

        let media_type = res
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        let data = res.bytes().await?;

        let computed = sha256_digest(&data);
        let digest = match reference.target() {
            Target::Digest(_, hex) => {
                if computed.digest() != hex {
                    return Err(Error::DigestMismatch.with_op("pull", reference));
                }
                computed
            }
            Target::Tag(_) => computed,
        };

        let summary = ManifestSummary::parse(&data).unwrap_or_default();
        if summary.kind(Some(&media_type)) == ManifestKind::Schema1 {
            return Err(Error::Schema1Unsupported(data));
        }

        Ok(Some(ManifestResponse {
            reference: reference.clone(),
            digest,
            media_type,
            data,
        }))
    }

    /// Pull a single image. An index answer picks the child matching the
    /// configured platform and follows it by digest.
    pub async fn pull_image(&self, reference: &Reference) -> Result<Option<Image>, Error> {
        let Some(response) = self.get_manifest(reference).await? else {
            return Ok(None);
        };
        match response.kind() {
            ManifestKind::Image => image_from(response),
            ManifestKind::Index => {
                let summary = response.summary();
                let child = summary
                    .manifests
                    .iter()
                    .find(|d| {
                        d.platform
                            .as_ref()
                            .map(|p| self.config.platform.matches(p))
                            .unwrap_or(false)
                    })
                    .ok_or(Error::NoMatchingManifest)?;
                let child_ref = reference.with_digest(&child.digest)?;
                let Some(child_response) = self.get_manifest(&child_ref).await? else {
                    return Err(Error::NoMatchingManifest.with_op("pull", reference));
                };
                if child_response.kind() != ManifestKind::Image {
                    return Err(Error::BadContentType(child_response.media_type));
                }
                image_from(child_response)
            }
            ManifestKind::Schema1 => unreachable!("rejected in get_manifest"),
            ManifestKind::Unknown => Err(Error::BadContentType(response.media_type)),
        }
    }

    /// Pull an index handle without resolving a platform.
    pub async fn pull_index(&self, reference: &Reference) -> Result<Option<Index>, Error> {
        let Some(response) = self.get_manifest(reference).await? else {
            return Ok(None);
        };
        if response.kind() != ManifestKind::Index {
            return Err(Error::BadContentType(response.media_type));
        }
        let index = ImageIndex::from_reader(std::io::Cursor::new(&response.data))?;
        Ok(Some(Index {
            reference: response.reference,
            digest: response.digest,
            media_type: response.media_type,
            data: response.data,
            index,
        }))
    }

    /// Resumable body for a blob, unverified. `None` when absent.
    pub async fn blob_body(
        &self,
        reference: &Reference,
        digest: &Digest,
    ) -> Result<Option<ResumableBody>, Error> {
        let transport = self.transport_for(reference, &[Action::Pull]).await?;
        let url = transport.url(&blob_path(reference, digest));
        trace!("GET {url}");
        let res = transport.send(transport.request(Method::GET, &url)).await?;
        match res.status() {
            StatusCode::OK | StatusCode::PARTIAL_CONTENT => {
                Ok(Some(ResumableBody::new(transport, url, res)))
            }
            StatusCode::NOT_FOUND => Ok(None),
            _ => Err(failure("GET", res).await.with_op("pull", reference)),
        }
    }

    /// Verified streaming read of a layer or config blob. EOF is only
    /// reported once the size and digest both check out.
    pub async fn blob_reader(
        &self,
        reference: &Reference,
        descriptor: &Descriptor,
    ) -> Result<Option<VerifyReader<impl AsyncRead + Send>>, Error> {
        let hex = expect_sha256(descriptor.digest())?.to_string();
        let Some(body) = self.blob_body(reference, descriptor.digest()).await? else {
            return Ok(None);
        };
        Ok(Some(VerifyReader::new(
            body.into_async_read(),
            hex,
            Some(descriptor.size()),
        )))
    }

    /// Drain a blob into a writer, verifying on the way. Returns the byte
    /// count, or `None` when the blob is absent.
    pub async fn get_blob(
        &self,
        reference: &Reference,
        descriptor: &Descriptor,
        writer: &mut (impl AsyncWrite + Unpin),
    ) -> Result<Option<u64>, Error> {
        let Some(mut reader) = self.blob_reader(reference, descriptor).await? else {
            return Ok(None);
        };
        let n = tokio::io::copy(&mut reader, writer)
            .await
            .map_err(unwrap_stream_error)
            .map_err(|e| e.with_op("pull", reference))?;
        Ok(Some(n))
    }

    /// Fetch and parse the image configuration for a manifest.
    pub async fn get_image_configuration(
        &self,
        reference: &Reference,
        descriptor: &Descriptor,
    ) -> Result<Option<ImageConfiguration>, Error> {
        let mut buf = Vec::with_capacity(descriptor.size() as usize);
        match self.get_blob(reference, descriptor, &mut buf).await? {
            Some(_) => Ok(Some(ImageConfiguration::from_reader(
                std::io::Cursor::new(&buf),
            )?)),
            None => Ok(None),
        }
    }

    /// All tags of a repository, following `Link: ...; rel="next"` paging.
    pub async fn list_tags(&self, reference: &Reference) -> Result<Vec<String>, Error> {
        #[derive(Deserialize)]
        struct TagsPage {
            #[serde(default)]
            tags: Vec<String>,
        }

        let transport = self.transport_for(reference, &[Action::Pull]).await?;
        let mut url = match self.config.page_size {
            Some(n) => transport.url(&format!(
                "/v2/{}/tags/list?n={n}",
                reference.repository()
            )),
            None => transport.url(&format!("/v2/{}/tags/list", reference.repository())),
        };

        let mut tags = Vec::new();
        loop {
            trace!("GET {url}");
            let res = transport.send(transport.request(Method::GET, &url)).await?;
            if res.status() != StatusCode::OK {
                return Err(failure("GET", res).await.with_op("tags", reference));
            }
            let next = res
                .headers()
                .get(header::LINK)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_next_link)
                .map(|l| transport.resolve(&l));
            let page: TagsPage = res.json().await?;
            tags.extend(page.tags);
            match next {
                Some(next) => url = next,
                None => return Ok(tags),
            }
        }
    }

    /// Repositories of a registry via `_catalog`, with paging.
    pub async fn list_repositories(&self, registry: &str) -> Result<Vec<String>, Error> {
        #[derive(Deserialize)]
        struct CatalogPage {
            #[serde(default)]
            repositories: Vec<String>,
        }

        let transport = self.registry_transport(registry).await?;
        let mut url = match self.config.page_size {
            Some(n) => transport.url(&format!("/v2/_catalog?n={n}")),
            None => transport.url("/v2/_catalog"),
        };

        let mut repositories = Vec::new();
        loop {
            trace!("GET {url}");
            let res = transport.send(transport.request(Method::GET, &url)).await?;
            if res.status() != StatusCode::OK {
                return Err(failure("GET", res).await);
            }
            let next = res
                .headers()
                .get(header::LINK)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_next_link)
                .map(|l| transport.resolve(&l));
            let page: CatalogPage = res.json().await?;
            repositories.extend(page.repositories);
            match next {
                Some(next) => url = next,
                None => return Ok(repositories),
            }
        }
    }

    /// Referrers of a subject digest. Registries without the endpoint get
    /// the fallback tag treatment: `sha256-<hex>` fetched as an index.
    pub async fn referrers(
        &self,
        reference: &Reference,
        subject: &Digest,
        artifact_type: Option<&str>,
    ) -> Result<Vec<DescriptorJson>, Error> {
        #[derive(Deserialize)]
        struct ReferrersPage {
            #[serde(default)]
            manifests: Vec<DescriptorJson>,
        }

        let transport = self.transport_for(reference, &[Action::Pull]).await?;
        let mut path = format!(
            "/v2/{}/referrers/{}",
            reference.repository(),
            subject
        );
        if let Some(t) = artifact_type {
            path.push_str(&format!("?artifactType={t}"));
        }
        let url = transport.url(&path);
        trace!("GET {url}");
        let res = transport.send(transport.request(Method::GET, &url)).await?;
        match res.status().as_u16() {
            200 => {
                let page: ReferrersPage = res.json().await?;
                Ok(page.manifests)
            }
            404 | 400 | 406 => {
                // endpoint not implemented, try the tag scheme
                let tag = subject.to_string().replace(':', "-");
                let fallback = reference.with_tag(tag);
                let Some(response) = self.get_manifest(&fallback).await? else {
                    return Ok(Vec::new());
                };
                let manifests = response.summary().manifests;
                Ok(manifests
                    .into_iter()
                    .filter(|d| {
                        artifact_type.is_none() || d.artifact_type.as_deref() == artifact_type
                    })
                    .collect())
            }
            _ => Err(failure("GET", res).await.with_op("referrers", reference)),
        }
    }

    pub async fn delete_manifest(&self, reference: &Reference) -> Result<(), Error> {
        let transport = self
            .transport_for(reference, &[Action::Pull, Action::Delete])
            .await?;
        let url = transport.url(&manifest_path(reference));
        let res = transport
            .send(transport.request(Method::DELETE, &url))
            .await?;
        if res.status().is_success() {
            Ok(())
        } else {
            Err(failure("DELETE", res).await.with_op("delete", reference))
        }
    }

    pub async fn delete_blob(&self, reference: &Reference, digest: &Digest) -> Result<(), Error> {
        let transport = self
            .transport_for(reference, &[Action::Pull, Action::Delete])
            .await?;
        let url = transport.url(&blob_path(reference, digest));
        let res = transport
            .send(transport.request(Method::DELETE, &url))
            .await?;
        if res.status().is_success() {
            Ok(())
        } else {
            Err(failure("DELETE", res).await.with_op("delete", reference))
        }
    }
}

fn image_from(response: ManifestResponse) -> Result<Option<Image>, Error> {
    let manifest = ImageManifest::from_reader(std::io::Cursor::new(&response.data))?;
    Ok(Some(Image {
        reference: response.reference,
        digest: response.digest,
        media_type: response.media_type,
        data: response.data,
        manifest,
    }))
}

// `<https://r.example/v2/foo/tags/list?last=x>; rel="next"`
fn parse_next_link(value: &str) -> Option<String> {
    for part in value.split(',') {
        let part = part.trim();
        let (url, params) = part.split_once(';')?;
        if params.contains("rel=\"next\"") || params.contains("rel=next") {
            let url = url.trim().strip_prefix('<')?.strip_suffix('>')?;
            return Some(url.to_string());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_next_link() {
        assert_eq!(
            parse_next_link(r#"</v2/foo/tags/list?n=2&last=b>; rel="next""#).as_deref(),
            Some("/v2/foo/tags/list?n=2&last=b")
        );
        assert_eq!(
            parse_next_link(r#"<https://r/v2/_catalog?last=x>; rel=next"#).as_deref(),
            Some("https://r/v2/_catalog?last=x")
        );
        assert_eq!(parse_next_link(r#"</other>; rel="prev""#), None);
    }
}
