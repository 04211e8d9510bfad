//! Admin input validation and normalisation.

use axum::http::{HeaderName, HeaderValue};
use thiserror::Error;

use crate::glob::{GlobError, Pattern};
use crate::models::token::{ConfigPatch, Header};

pub const MAX_LABEL_LEN: usize = 256;
pub const MAX_HEADERS: usize = 32;
pub const MAX_HEADER_VALUE_LEN: usize = 4096;

/// Headers the gate sets itself or that would break request framing.
const RESERVED_HEADERS: &[&str] = &[
    "host",
    "content-length",
    "transfer-encoding",
    "connection",
    "upgrade",
    "x-user",
    "x-token-hint",
];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("invalid host pattern: {0}")]
    HostPattern(#[source] GlobError),

    #[error("invalid path pattern: {0}")]
    PathPattern(#[source] GlobError),

    #[error("label exceeds {MAX_LABEL_LEN} characters")]
    LabelTooLong,

    #[error("at most {MAX_HEADERS} headers are allowed")]
    TooManyHeaders,

    #[error("invalid header name '{0}'")]
    HeaderName(String),

    #[error("header '{0}' is reserved")]
    ReservedHeader(String),

    #[error("value of header '{0}' is invalid or exceeds {MAX_HEADER_VALUE_LEN} bytes")]
    HeaderValue(String),
}

/// Check every set field of `patch` and normalise it in place: host patterns
/// are lowercased so they compare against lowercased request hosts.
pub fn normalize(patch: ConfigPatch) -> Result<ConfigPatch, ValidationError> {
    if let Some(label) = patch.label.as_set() {
        if label.chars().count() > MAX_LABEL_LEN {
            return Err(ValidationError::LabelTooLong);
        }
    }

    let host = patch.host.map(|host| host.trim().to_ascii_lowercase());
    if let Some(host) = host.as_set() {
        Pattern::compile(host).map_err(ValidationError::HostPattern)?;
    }

    if let Some(path) = patch.path.as_set() {
        Pattern::compile(path).map_err(ValidationError::PathPattern)?;
    }

    if let Some(headers) = patch.headers.as_set() {
        validate_headers(headers)?;
    }

    Ok(ConfigPatch { host, ..patch })
}

fn validate_headers(headers: &[Header]) -> Result<(), ValidationError> {
    if headers.len() > MAX_HEADERS {
        return Err(ValidationError::TooManyHeaders);
    }

    for header in headers {
        let name = HeaderName::from_bytes(header.name.as_bytes())
            .map_err(|_| ValidationError::HeaderName(header.name.clone()))?;

        if RESERVED_HEADERS.contains(&name.as_str()) {
            return Err(ValidationError::ReservedHeader(header.name.clone()));
        }

        if header.value.len() > MAX_HEADER_VALUE_LEN
            || HeaderValue::from_str(&header.value).is_err()
        {
            return Err(ValidationError::HeaderValue(header.name.clone()));
        }
    }

    Ok(())
}
