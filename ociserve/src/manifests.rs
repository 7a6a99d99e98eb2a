//! Manifest storage: a per-repository index keyed by tag or digest, plus
//! the referrers index derived from manifests that declare a subject.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use bytes::Bytes;

use ocicore::digest::sha256_digest;
use ocicore::wire::{DescriptorJson, ManifestSummary};

#[derive(Debug, Clone)]
pub struct StoredManifest {
    pub content_type: String,
    pub bytes: Bytes,
    /// `sha256:<hex>` of bytes, computed once at put.
    pub digest: String,
}

#[derive(Default)]
struct Inner {
    // repo -> (tag | "sha256:<hex>") -> manifest
    repos: BTreeMap<String, BTreeMap<String, Arc<StoredManifest>>>,
    // repo -> subject digest -> referrer descriptors, insertion ordered
    referrers: BTreeMap<String, BTreeMap<String, Vec<DescriptorJson>>>,
}

#[derive(Default)]
pub struct ManifestStore {
    inner: Mutex<Inner>,
}

/// Descriptor for an uploaded manifest as it should appear in a referrers
/// list: artifactType falls back from the manifest's own field to the
/// config media type, annotations come from the manifest's top level.
fn referrer_descriptor(
    content_type: &str,
    digest: &str,
    size: u64,
    summary: &ManifestSummary,
) -> DescriptorJson {
    let artifact_type = summary
        .artifact_type
        .clone()
        .or_else(|| summary.config.as_ref().map(|c| c.media_type.clone()));
    DescriptorJson {
        media_type: summary
            .media_type
            .clone()
            .unwrap_or_else(|| content_type.to_string()),
        digest: digest.to_string(),
        size,
        platform: None,
        artifact_type,
        urls: None,
        annotations: summary.annotations.clone(),
    }
}

impl ManifestStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store bytes under `key` and under their computed digest. Returns the
    /// stored record (for the Docker-Content-Digest header).
    pub fn put(
        &self,
        repo: &str,
        key: &str,
        content_type: &str,
        bytes: Bytes,
    ) -> Arc<StoredManifest> {
        let digest = sha256_digest(&bytes).to_string();
        let stored = Arc::new(StoredManifest {
            content_type: content_type.to_string(),
            bytes: bytes.clone(),
            digest: digest.clone(),
        });

        let summary = ManifestSummary::parse(&bytes).unwrap_or_default();

        let mut inner = self.inner.lock().unwrap();
        let repo_map = inner.repos.entry(repo.to_string()).or_default();
        repo_map.insert(key.to_string(), stored.clone());
        repo_map.insert(digest.clone(), stored.clone());

        if let Some(subject) = &summary.subject {
            let descriptor =
                referrer_descriptor(content_type, &digest, bytes.len() as u64, &summary);
            let list = inner
                .referrers
                .entry(repo.to_string())
                .or_default()
                .entry(subject.digest.clone())
                .or_default();
            if !list.iter().any(|d| d.digest == descriptor.digest) {
                list.push(descriptor);
            }
        }

        stored
    }

    pub fn get(&self, repo: &str, key: &str) -> Option<Arc<StoredManifest>> {
        self.inner
            .lock()
            .unwrap()
            .repos
            .get(repo)?
            .get(key)
            .cloned()
    }

    pub fn has_repo(&self, repo: &str) -> bool {
        self.inner.lock().unwrap().repos.contains_key(repo)
    }

    /// Remove the entry under `key`. When no other key in the repository
    /// still points at the same bytes, any referrers entry the manifest
    /// contributed is dropped too.
    pub fn delete(&self, repo: &str, key: &str) -> Option<()> {
        let mut inner = self.inner.lock().unwrap();
        let repo_map = inner.repos.get_mut(repo)?;
        let removed = repo_map.remove(key)?;

        let still_referenced = repo_map.values().any(|m| m.digest == removed.digest);
        if !still_referenced {
            if let Ok(summary) = ManifestSummary::parse(&removed.bytes) {
                if let Some(subject) = summary.subject {
                    if let Some(by_subject) = inner.referrers.get_mut(repo) {
                        if let Some(list) = by_subject.get_mut(&subject.digest) {
                            list.retain(|d| d.digest != removed.digest);
                            if list.is_empty() {
                                by_subject.remove(&subject.digest);
                            }
                        }
                    }
                }
            }
        }
        Some(())
    }

    /// Current referrers of a subject, newest last, optionally filtered by
    /// artifact type. Only descriptors whose manifest is still stored and
    /// still declares the subject are listed.
    pub fn referrers(
        &self,
        repo: &str,
        subject_digest: &str,
        artifact_type: Option<&str>,
    ) -> Vec<DescriptorJson> {
        let inner = self.inner.lock().unwrap();
        let Some(list) = inner
            .referrers
            .get(repo)
            .and_then(|m| m.get(subject_digest))
        else {
            return Vec::new();
        };
        list.iter()
            .filter(|d| {
                artifact_type.is_none() || d.artifact_type.as_deref() == artifact_type
            })
            .filter(|d| {
                // binding check: the stored manifest must still declare us
                inner
                    .repos
                    .get(repo)
                    .and_then(|m| m.get(&d.digest))
                    .map(|stored| {
                        ManifestSummary::parse(&stored.bytes)
                            .ok()
                            .and_then(|s| s.subject)
                            .map(|s| s.digest == subject_digest)
                            .unwrap_or(false)
                    })
                    .unwrap_or(false)
            })
            .cloned()
            .collect()
    }

    /// Tags of a repository in lexical order, digest keys excluded.
    pub fn tags(&self, repo: &str) -> Option<Vec<String>> {
        let inner = self.inner.lock().unwrap();
        let repo_map = inner.repos.get(repo)?;
        Some(
            repo_map
                .keys()
                .filter(|k| !k.starts_with("sha256:"))
                .cloned()
                .collect(),
        )
    }

    pub fn repositories(&self) -> Vec<String> {
        self.inner.lock().unwrap().repos.keys().cloned().collect()
    }
}
