//! Push side: collect the transitive blob set, upload it through a worker
//! pool (existence check, cross-repo mount, monolithic short-circuit,
//! chunked stream, commit), then PUT manifests children-first.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use futures::StreamExt;
use log::{debug, trace};
use reqwest::{header, Method, Response, StatusCode};
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;

use oci_spec::image::Digest;

use ocicore::digest::sha256_digest;
use ocicore::name::{Action, Reference};
use ocicore::verify::HashingReader;

use crate::transport::{failure, Transport};
use crate::{Client, Error};

#[derive(Debug, Clone)]
pub enum BlobSource {
    Bytes(Bytes),
    File(PathBuf),
}

/// One blob to get onto the registry. Digest and size may be unknown up
/// front (a streaming layer); they are computed on the wire and only the
/// final commit names them.
#[derive(Debug, Clone)]
pub struct PushBlob {
    /// full `sha256:<hex>` form when known
    pub digest: Option<String>,
    pub size: Option<u64>,
    pub source: BlobSource,
    /// same-registry repository known to hold this blob already
    pub origin: Option<Reference>,
    /// foreign layer, only uploaded when the config says so
    pub foreign: bool,
}

impl PushBlob {
    pub fn from_bytes(data: impl Into<Bytes>) -> PushBlob {
        let data = data.into();
        PushBlob {
            digest: Some(sha256_digest(&data).to_string()),
            size: Some(data.len() as u64),
            source: BlobSource::Bytes(data),
            origin: None,
            foreign: false,
        }
    }

    /// A streaming layer: nothing known until the file has been read.
    pub fn from_file(path: impl Into<PathBuf>) -> PushBlob {
        PushBlob {
            digest: None,
            size: None,
            source: BlobSource::File(path.into()),
            origin: None,
            foreign: false,
        }
    }

    pub fn with_origin(mut self, origin: Reference) -> PushBlob {
        self.origin = Some(origin);
        self
    }
}

#[derive(Debug, Clone)]
pub struct PushImage {
    pub manifest: Bytes,
    pub media_type: String,
    pub blobs: Vec<PushBlob>,
}

#[derive(Debug, Clone)]
pub struct PushIndex {
    pub manifest: Bytes,
    pub media_type: String,
    pub children: Vec<PushItem>,
}

#[derive(Debug, Clone)]
pub enum PushItem {
    Image(PushImage),
    Index(PushIndex),
}

impl PushItem {
    pub fn manifest(&self) -> &Bytes {
        match self {
            PushItem::Image(i) => &i.manifest,
            PushItem::Index(i) => &i.manifest,
        }
    }

    pub fn media_type(&self) -> &str {
        match self {
            PushItem::Image(i) => &i.media_type,
            PushItem::Index(i) => &i.media_type,
        }
    }

    pub fn digest(&self) -> String {
        sha256_digest(self.manifest()).to_string()
    }
}

/// Byte-level progress over the optional update channel.
#[derive(Debug, Clone)]
pub struct Progress {
    pub total: u64,
    pub complete: u64,
    pub error: Option<String>,
}

struct Plan {
    blobs: Vec<(Reference, PushBlob)>,
    /// (target, media type, bytes) in commit order
    commits: Vec<(Reference, String, Bytes)>,
    total: u64,
}

// tree height: images are leaves, an index sits above its tallest child.
// committing in ascending height puts every child before its parent.
fn walk(
    item: &PushItem,
    dst: &Reference,
    requested: &BTreeSet<String>,
    seen_blobs: &mut BTreeSet<(String, String)>,
    blobs: &mut Vec<(Reference, PushBlob)>,
    new_manifests: &mut BTreeMap<String, (Reference, String, Bytes, u32)>,
) -> Result<u32, Error> {
    let repo_key = format!("{}/{}", dst.registry(), dst.repository());
    match item {
        PushItem::Image(image) => {
            for blob in &image.blobs {
                match &blob.digest {
                    Some(digest) => {
                        if seen_blobs.insert((repo_key.clone(), digest.clone())) {
                            blobs.push((dst.clone(), blob.clone()));
                        }
                    }
                    // streaming blobs can't dedup before their bytes flow
                    None => blobs.push((dst.clone(), blob.clone())),
                }
            }
            Ok(0)
        }
        PushItem::Index(index) => {
            let mut height = 0;
            for child in &index.children {
                let child_height =
                    walk(child, dst, requested, seen_blobs, blobs, new_manifests)?;
                height = height.max(child_height + 1);
                let digest = child.digest();
                if !requested.contains(&digest) {
                    new_manifests.entry(digest.clone()).or_insert((
                        dst.with_digest(&digest)?,
                        child.media_type().to_string(),
                        child.manifest().clone(),
                        child_height,
                    ));
                }
            }
            Ok(height)
        }
    }
}

fn plan(items: &BTreeMap<Reference, PushItem>) -> Result<Plan, Error> {
    let requested: BTreeSet<String> = items.values().map(|i| i.digest()).collect();

    let mut seen_blobs = BTreeSet::new();
    let mut blobs = Vec::new();
    let mut new_manifests = BTreeMap::new();
    let mut requested_images = Vec::new();
    let mut requested_indexes = Vec::new();

    for (reference, item) in items {
        let height = walk(
            item,
            reference,
            &requested,
            &mut seen_blobs,
            &mut blobs,
            &mut new_manifests,
        )?;
        let commit = (
            reference.clone(),
            item.media_type().to_string(),
            item.manifest().clone(),
        );
        match item {
            PushItem::Image(_) => requested_images.push(commit),
            PushItem::Index(_) => requested_indexes.push((height, commit)),
        }
    }

    let mut new_ordered: Vec<(Reference, String, Bytes, u32)> =
        new_manifests.into_values().collect();
    new_ordered.sort_by_key(|(_, _, _, height)| *height);
    requested_indexes.sort_by_key(|(height, _)| *height);

    let mut commits = requested_images;
    commits.extend(new_ordered.into_iter().map(|(r, mt, b, _)| (r, mt, b)));
    commits.extend(requested_indexes.into_iter().map(|(_, c)| c));

    let total = blobs.iter().filter_map(|(_, b)| b.size).sum();

    Ok(Plan {
        blobs,
        commits,
        total,
    })
}

async fn report(progress: &Option<mpsc::Sender<Progress>>, update: Progress) {
    if let Some(sender) = progress {
        let _ = sender.send(update).await;
    }
}

impl Client {
    /// Push a set of images and indexes. Blobs first through a pool of
    /// `jobs` uploaders, then manifests children-before-parents; no
    /// manifest is PUT until every blob commit has succeeded.
    pub async fn push(
        &self,
        items: BTreeMap<Reference, PushItem>,
        progress: Option<mpsc::Sender<Progress>>,
    ) -> Result<(), Error> {
        let plan = plan(&items)?;
        debug!(
            "pushing {} blobs then {} manifests",
            plan.blobs.len(),
            plan.commits.len()
        );

        let total = plan.total;
        let complete = Arc::new(AtomicU64::new(0));

        let results: Vec<Result<(), Error>> = futures::stream::iter(plan.blobs)
            .map(|(dst, blob)| {
                let client = self.clone();
                let progress = progress.clone();
                let complete = complete.clone();
                async move {
                    match client.upload_blob(&dst, &blob).await {
                        Ok((_, size)) => {
                            let done = complete.fetch_add(size, Ordering::Relaxed) + size;
                            report(
                                &progress,
                                Progress {
                                    total,
                                    complete: done,
                                    error: None,
                                },
                            )
                            .await;
                            Ok(())
                        }
                        Err(e) => {
                            report(
                                &progress,
                                Progress {
                                    total,
                                    complete: complete.load(Ordering::Relaxed),
                                    error: Some(e.to_string()),
                                },
                            )
                            .await;
                            Err(e)
                        }
                    }
                }
            })
            .buffer_unordered(self.config.jobs.max(1))
            .collect()
            .await;
        // the pool drains fully before any manifest goes up
        results.into_iter().collect::<Result<Vec<_>, _>>()?;

        for (reference, media_type, data) in plan.commits {
            self.put_manifest(&reference, &media_type, data).await?;
        }
        Ok(())
    }

    /// PUT one manifest. Structured 4xx bodies surface verbatim.
    pub async fn put_manifest(
        &self,
        reference: &Reference,
        media_type: &str,
        data: Bytes,
    ) -> Result<Digest, Error> {
        let transport = self
            .transport_for(reference, &[Action::Pull, Action::Push])
            .await?;
        let url = transport.url(&format!(
            "/v2/{}/manifests/{}",
            reference.repository(),
            reference.identifier()
        ));
        trace!("PUT {url}");
        let digest = sha256_digest(&data);
        let res = transport
            .send(
                transport
                    .request(Method::PUT, &url)
                    .header(header::CONTENT_TYPE, media_type)
                    .body(data),
            )
            .await?;
        if !res.status().is_success() {
            return Err(failure("PUT", res).await.with_op("push", reference));
        }
        Ok(digest)
    }

    /// Upload a single blob, streaming layers included. Returns the final
    /// `sha256:<hex>` and the byte size.
    pub async fn write_layer(
        &self,
        reference: &Reference,
        blob: &PushBlob,
    ) -> Result<(String, u64), Error> {
        self.upload_blob(reference, blob)
            .await
            .map_err(|e| e.with_op("write-layer", reference))
    }

    async fn upload_blob(
        &self,
        dst: &Reference,
        blob: &PushBlob,
    ) -> Result<(String, u64), Error> {
        if blob.foreign && !self.config.nondistributable {
            debug!("skipping foreign layer for {dst}");
            return Ok((blob.digest.clone().unwrap_or_default(), 0));
        }

        // mounts need pull on the source, so ask for both up front
        let transport = self
            .transport_for(dst, &[Action::Pull, Action::Push])
            .await?;

        if let Some(digest) = &blob.digest {
            // stage 1: maybe it's already there
            let head_url = transport.url(&format!("/v2/{}/blobs/{digest}", dst.repository()));
            let res = transport
                .send(transport.request(Method::HEAD, &head_url))
                .await?;
            if res.status() == StatusCode::OK {
                trace!("{digest} already on {}", dst.repository());
                return Ok((digest.clone(), blob.size.unwrap_or(0)));
            }

            // stage 2: cross-repo mount via the layer's origin
            if let Some(origin) = &blob.origin {
                if origin.registry() == dst.registry()
                    && origin.repository() != dst.repository()
                {
                    let url = transport.url(&format!(
                        "/v2/{}/blobs/uploads/?mount={digest}&from={}",
                        dst.repository(),
                        origin.repository()
                    ));
                    trace!("POST {url} (mount)");
                    let res = transport.send(transport.request(Method::POST, &url)).await?;
                    match res.status() {
                        StatusCode::CREATED => {
                            debug!("mounted {digest} from {}", origin.repository());
                            return Ok((digest.clone(), blob.size.unwrap_or(0)));
                        }
                        // the registry opened a session instead, ride it
                        StatusCode::ACCEPTED => {
                            let location = location_of(&transport, &res)?;
                            return self.upload_session(&transport, blob, location).await;
                        }
                        _ => {
                            debug!("mount of {digest} declined, uploading");
                        }
                    }
                }
            }

            // stage 3: monolithic short-circuit when the bytes are at hand
            if let BlobSource::Bytes(data) = &blob.source {
                let url = transport.url(&format!(
                    "/v2/{}/blobs/uploads/?digest={digest}",
                    dst.repository()
                ));
                trace!("POST {url} (monolithic)");
                let res = transport
                    .send(
                        transport
                            .request(Method::POST, &url)
                            .header(header::CONTENT_TYPE, "application/octet-stream")
                            .body(data.clone()),
                    )
                    .await?;
                match res.status() {
                    StatusCode::CREATED => {
                        return Ok((digest.clone(), data.len() as u64));
                    }
                    StatusCode::ACCEPTED => {
                        let location = location_of(&transport, &res)?;
                        return self.upload_session(&transport, blob, location).await;
                    }
                    _ => return Err(failure("POST", res).await),
                }
            }
        }

        // stage 3 for streams: plain initiate
        let url = transport.url(&format!("/v2/{}/blobs/uploads/", dst.repository()));
        trace!("POST {url}");
        let res = transport.send(transport.request(Method::POST, &url)).await?;
        if res.status() != StatusCode::ACCEPTED {
            return Err(failure("POST", res).await);
        }
        let location = location_of(&transport, &res)?;
        self.upload_session(&transport, blob, location).await
    }

    // stages 4 and 5: PATCH the bytes (hashing on the wire), PUT the digest
    async fn upload_session(
        &self,
        transport: &Arc<Transport>,
        blob: &PushBlob,
        location: String,
    ) -> Result<(String, u64), Error> {
        let hashed: Arc<Mutex<Option<(String, u64)>>> = Arc::new(Mutex::new(None));

        let res = transport
            .send_rewindable(async || {
                let body = hashing_body(&blob.source, hashed.clone()).await?;
                Ok(transport
                    .request(Method::PATCH, &location)
                    .header(header::CONTENT_TYPE, "application/octet-stream")
                    .body(body))
            })
            .await?;
        if res.status() != StatusCode::ACCEPTED {
            return Err(failure("PATCH", res).await);
        }
        let commit_location = location_of(transport, &res).unwrap_or(location);

        let (digest, size) = match (&blob.digest, blob.size) {
            (Some(d), Some(s)) => (d.clone(), s),
            _ => hashed
                .lock()
                .unwrap()
                .clone()
                .ok_or(Error::BodyNotReplayable)?,
        };

        let sep = if commit_location.contains('?') { '&' } else { '?' };
        let put_url = format!("{commit_location}{sep}digest={digest}");
        trace!("PUT {put_url}");
        let res = transport.send(transport.request(Method::PUT, &put_url)).await?;
        if res.status() != StatusCode::CREATED {
            return Err(failure("PUT", res).await);
        }
        Ok((digest, size))
    }
}

fn location_of(transport: &Transport, res: &Response) -> Result<String, Error> {
    res.headers()
        .get(header::LOCATION)
        .and_then(|v| v.to_str().ok())
        .map(|l| transport.resolve(l))
        .ok_or(Error::MissingLocation)
}

async fn hashing_body(
    source: &BlobSource,
    slot: Arc<Mutex<Option<(String, u64)>>>,
) -> Result<reqwest::Body, Error> {
    *slot.lock().unwrap() = None;
    match source {
        BlobSource::Bytes(data) => {
            *slot.lock().unwrap() =
                Some((sha256_digest(data).to_string(), data.len() as u64));
            Ok(reqwest::Body::from(data.clone()))
        }
        BlobSource::File(path) => {
            let file = tokio::fs::File::open(path).await?;
            let reader = HashingReader::new(file);
            let stream = futures::stream::try_unfold(
                (reader, slot),
                |(mut reader, slot)| async move {
                    let mut buf = vec![0u8; 64 * 1024];
                    let n = reader.read(&mut buf).await?;
                    if n == 0 {
                        let (hex, size) = reader.finalize();
                        *slot.lock().unwrap() = Some((format!("sha256:{hex}"), size));
                        Ok::<_, std::io::Error>(None)
                    } else {
                        buf.truncate(n);
                        Ok(Some((Bytes::from(buf), (reader, slot))))
                    }
                },
            );
            Ok(reqwest::Body::wrap_stream(stream))
        }
    }
}
