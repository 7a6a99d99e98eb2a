use axum::body::Body;
use axum::http::{header::CONTENT_TYPE, Response, StatusCode};
use axum::response::IntoResponse;

use ocicore::wire::{ErrorBody, ErrorCode};

/// Errors produced while serving a registry request. The [`IntoResponse`]
/// impl renders the structured error body, so handlers can `?` their way
/// out of anything.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("{code}: {message}")]
    Oci { code: ErrorCode, message: String },
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("failed to read request body")]
    BodyRead(#[source] axum::Error),
}

impl RegistryError {
    pub fn oci(code: ErrorCode, message: impl Into<String>) -> RegistryError {
        RegistryError::Oci {
            code,
            message: message.into(),
        }
    }

    pub fn blob_unknown() -> RegistryError {
        Self::oci(ErrorCode::BlobUnknown, "blob unknown to registry")
    }

    pub fn manifest_unknown() -> RegistryError {
        Self::oci(ErrorCode::ManifestUnknown, "manifest unknown to registry")
    }

    pub fn name_unknown() -> RegistryError {
        Self::oci(ErrorCode::NameUnknown, "repository name not known to registry")
    }
}

pub fn oci_error_response(status: StatusCode, body: &ErrorBody) -> Response<Body> {
    let bytes = serde_json::to_vec(body).expect("error body always serializes");
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "application/json")
        .body(Body::from(bytes))
        .expect("static response parts")
}

impl IntoResponse for RegistryError {
    fn into_response(self) -> axum::response::Response {
        match self {
            RegistryError::Oci { code, message } => {
                let status = StatusCode::from_u16(code.http_status())
                    .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
                oci_error_response(status, &ErrorBody::single(code, message))
            }
            RegistryError::Io(e) => {
                log::error!("io error serving request: {e}");
                oci_error_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    &ErrorBody::single(ErrorCode::Unknown, "internal error"),
                )
            }
            RegistryError::BodyRead(e) => {
                log::warn!("failed reading request body: {e}");
                oci_error_response(
                    StatusCode::BAD_REQUEST,
                    &ErrorBody::single(ErrorCode::Unknown, "failed to read request body"),
                )
            }
        }
    }
}
