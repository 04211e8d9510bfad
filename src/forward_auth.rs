//! Forward-auth endpoint for reverse proxies.
//!
//! The proxy forwards each inbound request's metadata here before routing
//! it. A `204` lets the request through with identity and token headers to
//! copy upstream; a `401` rejects it.

use std::sync::Arc;

use axum::{
    extract::State,
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode, Uri},
    response::{IntoResponse, Response},
    Router,
};

use crate::authz::{Decision, Grant};
use crate::server::AppState;

pub const TOKEN_HEADER: &str = "x-token";
pub const TOKEN_QUERY: &str = "token";
pub const FORWARDED_URI: &str = "x-forwarded-uri";
pub const FORWARDED_HOST: &str = "x-forwarded-host";
pub const USER_HEADER: &str = "x-user";
pub const HINT_HEADER: &str = "x-token-hint";

/// Answers every method on every path.
pub fn router() -> Router<Arc<AppState>> {
    Router::new().fallback(check)
}

/// What the proxy told us about the original request.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Forwarded {
    pub token: Option<String>,
    pub host: String,
    pub path: String,
}

impl Forwarded {
    pub fn from_request(headers: &HeaderMap, uri: &Uri) -> Self {
        let header = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .filter(|v| !v.is_empty())
        };

        let original = header(FORWARDED_URI).and_then(parse_forwarded_uri);

        let token = header(TOKEN_HEADER).map(String::from).or_else(|| {
            original.as_ref().and_then(|url| {
                url.query_pairs()
                    .find(|(k, _)| k == TOKEN_QUERY)
                    .map(|(_, v)| v.into_owned())
            })
        });

        let host = match header(FORWARDED_HOST) {
            Some(host) => host,
            None => {
                let own = header("host").unwrap_or_default();
                tracing::debug!(host = own, "no X-Forwarded-Host; evaluating against Host");
                own
            }
        }
        .to_string();

        let path = match &original {
            Some(url) => url.path().to_string(),
            None => uri.path().to_string(),
        };

        Self { token, host, path }
    }
}

/// Accepts both a bare `path?query` and an absolute `scheme://` URL.
///
/// The path is rebuilt before URL parsing: `\` counts as `/`, empty segments
/// are dropped and dot segments are resolved, so `//a/b`, `/x/../a/b` and
/// `\a\b` are all evaluated as `/a/b`. A leading `//` is never read as an
/// authority.
fn parse_forwarded_uri(raw: &str) -> Option<url::Url> {
    let is_sep = |c: char| c == '/' || c == '\\';

    let target = match url::Url::parse(raw) {
        Ok(absolute) if !raw.starts_with(is_sep) && absolute.has_host() => {
            absolute[url::Position::BeforePath..url::Position::AfterQuery].to_string()
        }
        _ => raw.split('#').next().unwrap_or_default().to_string(),
    };
    let (path, query) = match target.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (target.as_str(), None),
    };

    let mut rebuilt = String::with_capacity(target.len() + 1);
    for segment in path.split(is_sep).filter(|s| !s.is_empty()) {
        rebuilt.push('/');
        rebuilt.push_str(segment);
    }
    if rebuilt.is_empty() || path.ends_with(is_sep) {
        rebuilt.push('/');
    }
    if let Some(query) = query {
        rebuilt.push('?');
        rebuilt.push_str(query);
    }

    url::Url::parse("http://forwarded.invalid/")
        .and_then(|base| base.join(&rebuilt))
        .ok()
}

async fn check(State(state): State<Arc<AppState>>, headers: HeaderMap, uri: Uri) -> Response {
    let forwarded = Forwarded::from_request(&headers, &uri);

    let Some(token) = forwarded.token.as_deref() else {
        tracing::debug!(host = %forwarded.host, path = %forwarded.path, "no token presented");
        return StatusCode::UNAUTHORIZED.into_response();
    };

    match state
        .authorizer
        .authorize(token, &forwarded.host, &forwarded.path)
        .await
    {
        Ok(Decision::Allow(grant)) => {
            tracing::debug!(
                token_id = grant.token_id,
                hint = %grant.key_id.hint(),
                host = %forwarded.host,
                path = %forwarded.path,
                "authorized"
            );
            allow(&grant)
        }
        Ok(Decision::Deny(reason)) => {
            tracing::debug!(
                ?reason,
                host = %forwarded.host,
                path = %forwarded.path,
                "denied"
            );
            StatusCode::UNAUTHORIZED.into_response()
        }
        Err(e) => {
            tracing::error!("authorization lookup failed: {}", e);
            StatusCode::SERVICE_UNAVAILABLE.into_response()
        }
    }
}

fn allow(grant: &Grant) -> Response {
    let mut headers = HeaderMap::new();

    if let Ok(user) = HeaderValue::from_str(&grant.user) {
        headers.insert(USER_HEADER, user);
    }
    if let Ok(hint) = HeaderValue::from_str(&grant.key_id.hint()) {
        headers.insert(HINT_HEADER, hint);
    }

    for header in &grant.headers {
        match (
            HeaderName::from_bytes(header.name.as_bytes()),
            HeaderValue::from_str(&header.value),
        ) {
            (Ok(name), Ok(value)) => {
                headers.append(name, value);
            }
            _ => tracing::warn!(token_id = grant.token_id, header = %header.name, "skipping invalid stored header"),
        }
    }

    (StatusCode::NO_CONTENT, headers).into_response()
}
