//! Visitor gate: every public request passes through here
//!
//! Rate limit, then the ban engine, then either the diversion responder or
//! the upstream forwarder. Redirect-loop targets are ordinary paths here and
//! get classified like any other request.

use crate::client_ip::{self, ClientAddress};
use crate::routes::{diversion, proxy, AppState};
use axum::{
    body::Body,
    extract::{ConnectInfo, Query, Request, State},
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use std::net::SocketAddr;
use visitgate_core::{truncate_user_agent, Attribution, Outcome, VisitRequest};

/// Fallback handler for all non-admin traffic
pub async fn handle_request(State(state): State<AppState>, request: Request<Body>) -> Response {
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip());
    let ClientAddress { address, forwarded } =
        client_ip::resolve(request.headers(), peer, state.config.forwarding_hops());

    // Raw bytes, lossily decoded: any user agent is tracked, none is rejected
    let user_agent = request
        .headers()
        .get(header::USER_AGENT)
        .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned())
        .unwrap_or_default();

    if let Some(limit) = state.config.rate_limit() {
        let result = state.rate_limiter.check_visitor(&address, &limit).await;
        if !result.allowed {
            tracing::warn!("Rate limit exceeded for {} ({} requests)", address, result.current);
            let mut response = (
                StatusCode::TOO_MANY_REQUESTS,
                "Too many requests from this IP, please try again later.",
            )
                .into_response();
            let headers = response.headers_mut();
            for (name, value) in result.headers() {
                if let (Ok(name), Ok(value)) = (
                    header::HeaderName::from_bytes(name.as_bytes()),
                    HeaderValue::from_str(&value),
                ) {
                    headers.insert(name, value);
                }
            }
            headers.insert(header::RETRY_AFTER, HeaderValue::from(result.reset_in_secs));
            return response;
        }
    }

    let attribution = Query::<Vec<(String, String)>>::try_from_uri(request.uri())
        .map(|Query(pairs)| Attribution::from_pairs(pairs.iter().map(|(k, v)| (k.as_str(), v.as_str()))))
        .unwrap_or_default();

    if diversion::is_redirect_path(request.uri().path()) {
        tracing::debug!("Redirect loop follow-up from {}: {}", address, request.uri().path());
    }

    let visit = VisitRequest {
        address: address.clone(),
        user_agent,
        attribution,
        forwarded,
    };
    let verdict = state.engine.classify_request(&visit).await;

    if !verdict.allowed {
        return state.diversion.respond(&address, &visit.user_agent).await;
    }

    if verdict.outcome == Outcome::Degraded {
        tracing::debug!(
            "Forwarding untracked request from {}, UA: {}",
            address,
            truncate_user_agent(&visit.user_agent)
        );
    }

    proxy::forward(&state, &address, request).await
}
