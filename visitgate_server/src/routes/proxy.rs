//! Forwarding of allowed requests to the upstream site

use crate::routes::AppState;
use axum::{
    body::Body,
    extract::Request,
    http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};

/// Request bodies above this size are rejected
const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

/// Headers that describe a single connection and must not be forwarded
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Forward a request to the upstream origin and relay the response
pub async fn forward(state: &AppState, client_address: &str, request: Request<Body>) -> Response {
    let (parts, body) = request.into_parts();

    let body_bytes = match axum::body::to_bytes(body, MAX_BODY_BYTES).await {
        Ok(b) => b,
        Err(e) => {
            tracing::warn!("Failed to read request body from {}: {}", client_address, e);
            return (StatusCode::BAD_REQUEST, "Failed to read body").into_response();
        }
    };

    let path_and_query = parts.uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    // Scheme and authority always come from the target, even for `//host/...` paths
    let mut url = state.config.target_url.clone();
    url.set_path(parts.uri.path());
    url.set_query(parts.uri.query());

    let public_host = parts
        .headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let target_origin = state.config.target_origin();

    let mut headers = upstream_headers(&parts.headers, &target_origin);
    set_forwarding_headers(&mut headers, &parts.headers, client_address, public_host.as_deref());

    let upstream = state
        .http_client
        .request(parts.method.clone(), url)
        .headers(headers)
        .body(body_bytes)
        .send()
        .await;

    match upstream {
        Ok(resp) => {
            let status = resp.status();
            let mut builder = Response::builder().status(status);

            for (key, value) in resp.headers() {
                if is_hop_by_hop(key) || key == header::CONTENT_LENGTH {
                    continue;
                }
                if key == header::LOCATION {
                    if let Some(location) = relative_location(value, &target_origin) {
                        builder = builder.header(key, location);
                        continue;
                    }
                }
                builder = builder.header(key, value);
            }

            builder
                .body(Body::from_stream(resp.bytes_stream()))
                .unwrap_or_else(|_| (StatusCode::INTERNAL_SERVER_ERROR, "Response build failed").into_response())
        }
        Err(e) => {
            tracing::error!("Proxy error for {} {}: {}", parts.method, path_and_query, e);
            proxy_error()
        }
    }
}

fn proxy_error() -> Response {
    (
        StatusCode::BAD_GATEWAY,
        Json(serde_json::json!({ "error": "Proxy error occurred" })),
    )
        .into_response()
}

fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP.contains(&name.as_str())
}

/// Copy client headers for the upstream request, presenting the upstream as origin
fn upstream_headers(incoming: &HeaderMap, target_origin: &str) -> HeaderMap {
    let mut headers = HeaderMap::with_capacity(incoming.len());

    for (key, value) in incoming {
        if is_hop_by_hop(key) || key == header::HOST || key == header::CONTENT_LENGTH {
            continue;
        }

        if key == header::ORIGIN {
            if let Ok(origin) = HeaderValue::from_str(target_origin) {
                headers.insert(header::ORIGIN, origin);
            }
            continue;
        }

        if key == header::REFERER {
            if let Some(referer) = value.to_str().ok().and_then(|r| rebase_url(r, target_origin)) {
                if let Ok(referer) = HeaderValue::from_str(&referer) {
                    headers.insert(header::REFERER, referer);
                }
            }
            continue;
        }

        headers.append(key, value.clone());
    }

    headers
}

fn set_forwarding_headers(
    headers: &mut HeaderMap,
    incoming: &HeaderMap,
    client_address: &str,
    public_host: Option<&str>,
) {
    if let Ok(addr) = HeaderValue::from_str(client_address) {
        headers.insert("x-forwarded-for", addr.clone());
        headers.insert("x-real-ip", addr);
    }

    if let Some(host) = public_host.and_then(|h| HeaderValue::from_str(h).ok()) {
        headers.insert("x-forwarded-host", host);
    }

    let proto = incoming
        .get("x-forwarded-proto")
        .cloned()
        .unwrap_or_else(|| HeaderValue::from_static("http"));
    headers.insert("x-forwarded-proto", proto);
}

/// Replace the scheme and authority of an absolute URL with `target_origin`
fn rebase_url(raw: &str, target_origin: &str) -> Option<String> {
    let url = reqwest::Url::parse(raw).ok()?;
    let mut rebased = reqwest::Url::parse(target_origin).ok()?;
    rebased.set_path(url.path());
    rebased.set_query(url.query());
    rebased.set_fragment(url.fragment());
    Some(rebased.to_string())
}

/// Turn an absolute upstream `Location` into a path so the client stays on the proxy
fn relative_location(value: &HeaderValue, target_origin: &str) -> Option<HeaderValue> {
    let location = value.to_str().ok()?;
    let rest = location.strip_prefix(target_origin)?;
    let relative = match rest {
        "" => "/".to_string(),
        r if r.starts_with('/') => r.to_string(),
        r if r.starts_with('?') || r.starts_with('#') => format!("/{}", r),
        _ => return None,
    };
    HeaderValue::from_str(&relative).ok()
}
