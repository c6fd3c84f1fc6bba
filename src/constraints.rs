//! Request validation limits.
//!
//! Every limit here is enforced before any backend traffic, with exact
//! boundaries: a value at the limit passes, one past it is rejected.

use http::{HeaderMap, StatusCode};

/// Largest object body accepted on PUT.
pub const MAX_FILE_SIZE: u64 = 5 * 1024 * 1024 * 1024 + 2;
/// Longest metadata header name past the `x-<type>-meta-` prefix.
pub const MAX_META_NAME_LENGTH: usize = 128;
/// Longest metadata header value.
pub const MAX_META_VALUE_LENGTH: usize = 256;
/// Most metadata headers on one resource.
pub const MAX_META_COUNT: usize = 90;
/// Total bytes of metadata names plus values.
pub const MAX_META_OVERALL_SIZE: usize = 4096;
pub const MAX_ACCOUNT_NAME_LENGTH: usize = 256;
pub const MAX_CONTAINER_NAME_LENGTH: usize = 256;
pub const MAX_OBJECT_NAME_LENGTH: usize = 1024;
/// Page size for container listings; also the segment-count ceiling for
/// consolidating manifest copies.
pub const CONTAINER_LISTING_LIMIT: usize = 10_000;
pub const ACCOUNT_LISTING_LIMIT: usize = 10_000;

/// Which backend tier a request addresses; decides the metadata prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resource {
    Account,
    Container,
    Object,
}

impl Resource {
    pub fn meta_prefix(&self) -> &'static str {
        match self {
            Resource::Account => "x-account-meta-",
            Resource::Container => "x-container-meta-",
            Resource::Object => "x-object-meta-",
        }
    }

    pub fn remove_meta_prefix(&self) -> &'static str {
        match self {
            Resource::Account => "x-remove-account-meta-",
            Resource::Container => "x-remove-container-meta-",
            Resource::Object => "x-remove-object-meta-",
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Resource::Account => "Account",
            Resource::Container => "Container",
            Resource::Object => "Object",
        }
    }
}

/// A rejected request, with the status the client should see.
#[derive(thiserror::Error, Debug, PartialEq, Eq)]
#[error("{message}")]
pub struct ConstraintViolation {
    pub status: StatusCode,
    pub message: String,
}

impl ConstraintViolation {
    fn bad_request(message: impl Into<String>) -> Self {
        Self { status: StatusCode::BAD_REQUEST, message: message.into() }
    }
}

/// Validate user metadata headers for the given resource tier.
pub fn check_metadata(headers: &HeaderMap, resource: Resource) -> Result<(), ConstraintViolation> {
    let prefix = resource.meta_prefix();
    let mut count = 0usize;
    let mut size = 0usize;
    for (name, value) in headers {
        let Some(key) = name.as_str().strip_prefix(prefix) else {
            continue;
        };
        let value = value.as_bytes();
        count += 1;
        size += key.len() + value.len();
        if key.is_empty() {
            return Err(ConstraintViolation::bad_request("Metadata name cannot be empty"));
        }
        if key.len() > MAX_META_NAME_LENGTH {
            return Err(ConstraintViolation::bad_request(format!(
                "Metadata name too long; max {MAX_META_NAME_LENGTH}"
            )));
        }
        if value.len() > MAX_META_VALUE_LENGTH {
            return Err(ConstraintViolation::bad_request(format!(
                "Metadata value longer than {MAX_META_VALUE_LENGTH}"
            )));
        }
    }
    if count > MAX_META_COUNT {
        return Err(ConstraintViolation::bad_request(format!(
            "Too many metadata items; max {MAX_META_COUNT}"
        )));
    }
    if size > MAX_META_OVERALL_SIZE {
        return Err(ConstraintViolation::bad_request(format!(
            "Total metadata too large; max {MAX_META_OVERALL_SIZE}"
        )));
    }
    Ok(())
}

/// Validate an object PUT before dispatch: name length, declared length,
/// content type presence.
pub fn check_object_creation(
    headers: &HeaderMap,
    object_name: &str,
) -> Result<(), ConstraintViolation> {
    if let Some(len) = headers.get(http::header::CONTENT_LENGTH) {
        let parsed: u64 = len
            .to_str()
            .ok()
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| ConstraintViolation::bad_request("Invalid Content-Length header"))?;
        if parsed > MAX_FILE_SIZE {
            return Err(ConstraintViolation {
                status: StatusCode::PAYLOAD_TOO_LARGE,
                message: "Your request is too large.".into(),
            });
        }
    }
    if object_name.len() > MAX_OBJECT_NAME_LENGTH {
        return Err(ConstraintViolation::bad_request(format!(
            "Object name length of {} longer than {MAX_OBJECT_NAME_LENGTH}",
            object_name.len()
        )));
    }
    if !headers.contains_key(http::header::CONTENT_TYPE) {
        return Err(ConstraintViolation::bad_request("No content type"));
    }
    Ok(())
}
