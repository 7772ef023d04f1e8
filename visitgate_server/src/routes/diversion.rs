//! Responses for banned visitors
//!
//! Neither strategy reveals the ban: a banned client either chases an
//! endless chain of redirects or sees a generic outage page.

use axum::{
    http::{header, StatusCode},
    response::{Html, IntoResponse, Response},
};
use rand::Rng;
use std::str::FromStr;
use std::time::Duration;
use visitgate_core::truncate_user_agent;

/// Path prefix of the redirect loop targets
pub const REDIRECT_PREFIX: &str = "/redirect-";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiversionStrategy {
    /// 302 to a random `/redirect-<n>` path, which is gated again
    RedirectLoop,
    /// Generic 503 page
    GenericError,
}

impl FromStr for DiversionStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "redirect-loop" | "redirect" => Ok(Self::RedirectLoop),
            "error" => Ok(Self::GenericError),
            other => Err(format!("unknown diversion strategy '{}'", other)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DiversionPolicy {
    pub strategy: DiversionStrategy,
    pub delay: Duration,
}

impl DiversionPolicy {
    pub fn new(strategy: DiversionStrategy, delay: Duration) -> Self {
        Self { strategy, delay }
    }

    /// Answer a blocked request after the configured delay
    pub async fn respond(&self, address: &str, user_agent: &str) -> Response {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        match self.strategy {
            DiversionStrategy::RedirectLoop => {
                let location = redirect_target(rand::thread_rng().gen_range(1..=10_000));
                tracing::info!(
                    "Redirecting banned IP {} to {}, UA: {}",
                    address,
                    location,
                    truncate_user_agent(user_agent)
                );
                (
                    StatusCode::FOUND,
                    [(header::LOCATION, location), (header::CACHE_CONTROL, "no-store".to_string())],
                )
                    .into_response()
            }
            DiversionStrategy::GenericError => {
                tracing::info!("Serving error page to banned IP {}", address);
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    [(header::CACHE_CONTROL, "no-store")],
                    Html(UNAVAILABLE_HTML),
                )
                    .into_response()
            }
        }
    }
}

fn redirect_target(n: u32) -> String {
    format!("{}{}", REDIRECT_PREFIX, n)
}

/// Whether a path is one of the redirect loop targets
pub fn is_redirect_path(path: &str) -> bool {
    path.strip_prefix(REDIRECT_PREFIX)
        .is_some_and(|n| !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit()))
}

const UNAVAILABLE_HTML: &str = r#"<!DOCTYPE html>
<html lang="en">
<head>
    <meta charset="UTF-8">
    <title>Service Unavailable</title>
</head>
<body>
    <h1>Service Unavailable</h1>
    <p>The server is temporarily unable to handle your request. Please try again later.</p>
</body>
</html>"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strategy_parse() {
        assert_eq!("redirect-loop".parse(), Ok(DiversionStrategy::RedirectLoop));
        assert_eq!("ERROR".parse(), Ok(DiversionStrategy::GenericError));
        assert!("tarpit".parse::<DiversionStrategy>().is_err());
    }

    #[test]
    fn test_redirect_paths() {
        assert!(is_redirect_path(&redirect_target(42)));
        assert!(!is_redirect_path("/redirect-"));
        assert!(!is_redirect_path("/redirect-abc"));
        assert!(!is_redirect_path("/pricing"));
    }

    #[tokio::test]
    async fn test_redirect_loop_response() {
        let policy = DiversionPolicy::new(DiversionStrategy::RedirectLoop, Duration::ZERO);
        let response = policy.respond("203.0.113.9", "curl/8.0").await;

        assert_eq!(response.status(), StatusCode::FOUND);
        let location = response.headers()[header::LOCATION].to_str().unwrap();
        assert!(is_redirect_path(location), "unexpected location {}", location);
        let n: u32 = location.trim_start_matches(REDIRECT_PREFIX).parse().unwrap();
        assert!((1..=10_000).contains(&n));
    }

    #[tokio::test]
    async fn test_error_response() {
        let policy = DiversionPolicy::new(DiversionStrategy::GenericError, Duration::ZERO);
        let response = policy.respond("203.0.113.9", "curl/8.0").await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_delay_applies() {
        let policy = DiversionPolicy::new(DiversionStrategy::GenericError, Duration::from_millis(50));
        let started = std::time::Instant::now();
        policy.respond("203.0.113.9", "curl/8.0").await;
        assert!(started.elapsed() >= Duration::from_millis(50));
    }
}
