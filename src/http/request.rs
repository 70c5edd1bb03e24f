//! Inbound request inspection.
//!
//! # Responsibilities
//! - Decide whether the client connection stays open after the response
//! - Extract the origin-form target forwarded to the backend

use axum::http::{header, HeaderMap, Uri, Version};

/// Correlation header added to every forwarded request.
pub const X_REQUEST_ID: &str = "x-request-id";

/// HTTP/1.1 defaults to keep-alive unless `Connection: close`; HTTP/1.0
/// defaults to close unless `Connection: keep-alive`.
pub fn wants_keep_alive(version: Version, headers: &HeaderMap) -> bool {
    let has_token = |token: &str| {
        headers
            .get_all(header::CONNECTION)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(','))
            .any(|t| t.trim().eq_ignore_ascii_case(token))
    };
    match version {
        Version::HTTP_09 | Version::HTTP_10 => has_token("keep-alive"),
        _ => !has_token("close"),
    }
}

/// Path and query of `uri`, `/` when empty.
pub fn origin_form(uri: &Uri) -> &str {
    uri.path_and_query()
        .map(|pq| pq.as_str())
        .filter(|pq| !pq.is_empty())
        .unwrap_or("/")
}
