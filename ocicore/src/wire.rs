//! Wire-level odds and ends shared by client and server: the structured
//! error body, media type constants, and a lenient view of a manifest that
//! is good enough to dispatch on without giving up the raw bytes.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub const DOCKER_CONTENT_DIGEST: &str = "docker-content-digest";
pub const DOCKER_API_VERSION: &str = "docker-distribution-api-version";
pub const DOCKER_API_VERSION_VALUE: &str = "registry/2.0";

pub const OCI_IMAGE_MANIFEST_V1: &str = "application/vnd.oci.image.manifest.v1+json";
pub const OCI_IMAGE_INDEX_V1: &str = "application/vnd.oci.image.index.v1+json";
pub const OCI_IMAGE_CONFIG_V1: &str = "application/vnd.oci.image.config.v1+json";
pub const DOCKER_IMAGE_MANIFEST_V2: &str = "application/vnd.docker.distribution.manifest.v2+json";
pub const DOCKER_IMAGE_MANIFEST_LIST_V2: &str =
    "application/vnd.docker.distribution.manifest.list.v2+json";
pub const DOCKER_IMAGE_MANIFEST_V1_SIGNED: &str =
    "application/vnd.docker.distribution.manifest.v1+prettyjws";
pub const DOCKER_IMAGE_MANIFEST_V1: &str = "application/vnd.docker.distribution.manifest.v1+json";

/// All manifest media types a pull is willing to accept.
pub const ACCEPT_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json, application/vnd.docker.distribution.manifest.v2+json, application/vnd.oci.image.index.v1+json, application/vnd.docker.distribution.manifest.list.v2+json";

pub fn is_image_manifest(media_type: &str) -> bool {
    media_type == OCI_IMAGE_MANIFEST_V1 || media_type == DOCKER_IMAGE_MANIFEST_V2
}

pub fn is_image_index(media_type: &str) -> bool {
    media_type == OCI_IMAGE_INDEX_V1 || media_type == DOCKER_IMAGE_MANIFEST_LIST_V2
}

pub fn is_schema1(media_type: &str) -> bool {
    media_type == DOCKER_IMAGE_MANIFEST_V1_SIGNED || media_type == DOCKER_IMAGE_MANIFEST_V1
}

/// Error codes of the distribution error body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    #[serde(rename = "BLOB_UNKNOWN")]
    BlobUnknown,
    #[serde(rename = "BLOB_UPLOAD_INVALID")]
    BlobUploadInvalid,
    #[serde(rename = "BLOB_UPLOAD_UNKNOWN")]
    BlobUploadUnknown,
    #[serde(rename = "DIGEST_INVALID")]
    DigestInvalid,
    #[serde(rename = "MANIFEST_BLOB_UNKNOWN")]
    ManifestBlobUnknown,
    #[serde(rename = "MANIFEST_INVALID")]
    ManifestInvalid,
    #[serde(rename = "MANIFEST_UNKNOWN")]
    ManifestUnknown,
    #[serde(rename = "NAME_INVALID")]
    NameInvalid,
    #[serde(rename = "NAME_UNKNOWN")]
    NameUnknown,
    #[serde(rename = "SIZE_INVALID")]
    SizeInvalid,
    #[serde(rename = "UNAUTHORIZED")]
    Unauthorized,
    #[serde(rename = "DENIED")]
    Denied,
    #[serde(rename = "UNSUPPORTED")]
    Unsupported,
    #[serde(rename = "TOOMANYREQUESTS")]
    TooManyRequests,
    #[serde(rename = "UNAVAILABLE")]
    Unavailable,
    #[serde(other, rename = "UNKNOWN")]
    Unknown,
}

impl ErrorCode {
    pub fn http_status(&self) -> u16 {
        use ErrorCode::*;
        match self {
            BlobUnknown | ManifestBlobUnknown | ManifestUnknown | NameUnknown => 404,
            BlobUploadUnknown => 416,
            BlobUploadInvalid | DigestInvalid | ManifestInvalid | NameInvalid | SizeInvalid => 400,
            Unauthorized => 401,
            Denied => 403,
            Unsupported => 405,
            TooManyRequests => 429,
            Unavailable => 503,
            Unknown => 500,
        }
    }

    /// Whether a client is allowed to retry the operation that produced
    /// this code.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ErrorCode::BlobUploadInvalid | ErrorCode::TooManyRequests | ErrorCode::Unavailable
        )
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        // the wire form is the canonical rendering
        let s = serde_json::to_value(self)
            .ok()
            .and_then(|v| v.as_str().map(String::from))
            .unwrap_or_else(|| "UNKNOWN".to_string());
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub code: ErrorCode,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<serde_json::Value>,
}

/// `{"errors":[{"code","message","detail"}]}`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub errors: Vec<ErrorInfo>,
}

impl ErrorBody {
    pub fn single(code: ErrorCode, message: impl Into<String>) -> ErrorBody {
        ErrorBody {
            errors: vec![ErrorInfo {
                code,
                message: message.into(),
                detail: None,
            }],
        }
    }

    /// Best-effort parse of a response body; anything that isn't the
    /// structured form yields None.
    pub fn parse(body: &[u8]) -> Option<ErrorBody> {
        let parsed: ErrorBody = serde_json::from_slice(body).ok()?;
        if parsed.errors.is_empty() {
            None
        } else {
            Some(parsed)
        }
    }

    pub fn first_code(&self) -> ErrorCode {
        self.errors
            .first()
            .map(|e| e.code)
            .unwrap_or(ErrorCode::Unknown)
    }
}

impl std::fmt::Display for ErrorBody {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        for (i, e) in self.errors.iter().enumerate() {
            if i > 0 {
                write!(f, "; ")?;
            }
            write!(f, "{}: {}", e.code, e.message)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PlatformJson {
    pub architecture: String,
    pub os: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
}

/// Descriptor as it appears inside manifest JSON. Kept permissive so that
/// foreign and future fields don't break parsing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DescriptorJson {
    pub media_type: String,
    pub digest: String,
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<PlatformJson>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub urls: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,
}

/// The parts of a manifest body needed for dispatch, dependency walks and
/// referrers upkeep. The raw bytes stay the source of truth; this never
/// round-trips.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ManifestSummary {
    #[serde(default)]
    pub schema_version: u32,
    #[serde(default)]
    pub media_type: Option<String>,
    #[serde(default)]
    pub artifact_type: Option<String>,
    #[serde(default)]
    pub config: Option<DescriptorJson>,
    #[serde(default)]
    pub layers: Vec<DescriptorJson>,
    #[serde(default)]
    pub manifests: Vec<DescriptorJson>,
    #[serde(default)]
    pub subject: Option<DescriptorJson>,
    #[serde(default)]
    pub annotations: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManifestKind {
    Image,
    Index,
    Schema1,
    Unknown,
}

impl ManifestSummary {
    pub fn parse(body: &[u8]) -> Result<ManifestSummary, serde_json::Error> {
        serde_json::from_slice(body)
    }

    /// Classify by declared media type, falling back to shape for bodies
    /// that never declared one.
    pub fn kind(&self, content_type: Option<&str>) -> ManifestKind {
        let declared = self.media_type.as_deref().or(content_type);
        match declared {
            Some(mt) if is_image_index(mt) => ManifestKind::Index,
            Some(mt) if is_image_manifest(mt) => ManifestKind::Image,
            Some(mt) if is_schema1(mt) => ManifestKind::Schema1,
            _ if self.schema_version == 1 => ManifestKind::Schema1,
            _ if !self.manifests.is_empty() => ManifestKind::Index,
            _ if self.config.is_some() => ManifestKind::Image,
            _ => ManifestKind::Unknown,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_body_roundtrip() {
        let body = ErrorBody::single(ErrorCode::BlobUnknown, "blob unknown to registry");
        let bytes = serde_json::to_vec(&body).unwrap();
        assert!(String::from_utf8_lossy(&bytes).contains("BLOB_UNKNOWN"));
        let parsed = ErrorBody::parse(&bytes).unwrap();
        assert_eq!(parsed.first_code(), ErrorCode::BlobUnknown);
    }

    #[test]
    fn test_error_body_unknown_code() {
        let parsed =
            ErrorBody::parse(br#"{"errors":[{"code":"SOMETHING_NEW","message":"hm"}]}"#).unwrap();
        assert_eq!(parsed.first_code(), ErrorCode::Unknown);
    }

    #[test]
    fn test_error_body_not_structured() {
        assert!(ErrorBody::parse(b"<html>502</html>").is_none());
        assert!(ErrorBody::parse(br#"{"errors":[]}"#).is_none());
    }

    #[test]
    fn test_toomanyrequests_spelling() {
        let body = ErrorBody::single(ErrorCode::TooManyRequests, "slow down");
        let s = serde_json::to_string(&body).unwrap();
        assert!(s.contains("TOOMANYREQUESTS"));
    }

    #[test]
    fn test_manifest_kind() {
        let image = br#"{"schemaVersion":2,"mediaType":"application/vnd.oci.image.manifest.v1+json","config":{"mediaType":"application/vnd.oci.image.config.v1+json","digest":"sha256:aa","size":2},"layers":[]}"#;
        let summary = ManifestSummary::parse(image).unwrap();
        assert_eq!(summary.kind(None), ManifestKind::Image);

        let index = br#"{"schemaVersion":2,"manifests":[{"mediaType":"application/vnd.oci.image.manifest.v1+json","digest":"sha256:bb","size":3}]}"#;
        let summary = ManifestSummary::parse(index).unwrap();
        assert_eq!(summary.kind(None), ManifestKind::Index);
        assert_eq!(
            summary.kind(Some(OCI_IMAGE_INDEX_V1)),
            ManifestKind::Index
        );

        let schema1 = br#"{"schemaVersion":1,"fsLayers":[]}"#;
        let summary = ManifestSummary::parse(schema1).unwrap();
        assert_eq!(summary.kind(None), ManifestKind::Schema1);
    }

    #[test]
    fn test_subject_parses() {
        let body = br#"{"schemaVersion":2,"mediaType":"application/vnd.oci.image.manifest.v1+json","artifactType":"application/spdx+json","config":{"mediaType":"application/vnd.oci.empty.v1+json","digest":"sha256:cc","size":2},"layers":[],"subject":{"mediaType":"application/vnd.oci.image.manifest.v1+json","digest":"sha256:dd","size":4},"annotations":{"vnd.test.note":"hello"}}"#;
        let summary = ManifestSummary::parse(body).unwrap();
        assert_eq!(summary.subject.as_ref().unwrap().digest, "sha256:dd");
        assert_eq!(summary.artifact_type.as_deref(), Some("application/spdx+json"));
        assert_eq!(
            summary
                .annotations
                .as_ref()
                .unwrap()
                .get("vnd.test.note")
                .map(String::as_str),
            Some("hello")
        );
    }
}
