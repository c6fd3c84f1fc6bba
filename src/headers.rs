//! Header plumbing shared by the controllers.

use crate::constraints::Resource;
use http::header::{HeaderName, HeaderValue};
use http::HeaderMap;

/// Hop-by-hop headers that never cross the proxy in either direction.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "expect",
    "host",
];

pub fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP.contains(&name.as_str())
}

/// Strip surrounding double quotes from an etag value.
pub fn unquote_etag(value: &str) -> &str {
    value.trim().trim_start_matches('"').trim_end_matches('"')
}

/// Quote an etag for a client-facing object response.
pub fn quote_etag(value: &str) -> String {
    format!("\"{}\"", unquote_etag(value))
}

/// Convert `X-Remove-<tier>-Meta-*` headers into empty-valued metadata
/// headers, which backends interpret as deletion.
pub fn fold_remove_headers(headers: &mut HeaderMap, resource: Resource) {
    let remove_prefix = resource.remove_meta_prefix();
    let meta_prefix = resource.meta_prefix();
    let converted: Vec<HeaderName> = headers
        .keys()
        .filter_map(|name| {
            let key = name.as_str().strip_prefix(remove_prefix)?;
            format!("{meta_prefix}{key}").parse().ok()
        })
        .collect();
    let removed: Vec<HeaderName> = headers
        .keys()
        .filter(|name| name.as_str().starts_with(remove_prefix))
        .cloned()
        .collect();
    for name in removed {
        headers.remove(&name);
    }
    for name in converted {
        headers.insert(name, HeaderValue::from_static(""));
    }
}

/// Copy client headers that belong on a backend object write: user metadata,
/// standard content headers, and anything the operator whitelisted.
pub fn object_write_headers(
    client: &HeaderMap,
    allowed: &[String],
) -> HeaderMap {
    let mut out = HeaderMap::new();
    for (name, value) in client {
        let key = name.as_str();
        let standard = matches!(
            key,
            "content-type" | "content-encoding" | "content-disposition" | "etag"
                | "x-delete-at" | "x-object-manifest"
        );
        let pass = standard
            || key.starts_with(Resource::Object.meta_prefix())
            || allowed.iter().any(|a| a.eq_ignore_ascii_case(key));
        if pass {
            out.append(name.clone(), value.clone());
        }
    }
    out
}

/// Copy a backend response header set onto a client response, dropping
/// hop-by-hop headers and anything the proxy recomputes itself.
pub fn client_response_headers(backend: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::new();
    for (name, value) in backend {
        if is_hop_by_hop(name) || name.as_str() == "content-length" {
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    out
}
