//! Route handlers for the visitgate server

pub mod admin;
pub mod diversion;
pub mod gate;
pub mod proxy;

use crate::{abuse::RateLimiter, config::Config};
use axum::Router;
use diversion::DiversionPolicy;
use fred::clients::Client as RedisClient;
use std::sync::Arc;
use std::time::Duration;
use visitgate_core::{BanEngine, Classifier, VisitStore, WhitelistRules};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub engine: BanEngine,
    pub rate_limiter: RateLimiter,
    /// Upstream client; never follows redirects so `Location` reaches the visitor
    pub http_client: reqwest::Client,
    pub diversion: DiversionPolicy,
}

impl AppState {
    pub fn new(config: Config, store: Arc<dyn VisitStore>, redis: Option<RedisClient>) -> anyhow::Result<Self> {
        let rules = WhitelistRules::load_or_empty(config.whitelist_file.as_deref(), &config.whitelist_addresses);

        let classifier = Classifier::new(config.allow_search_bots, &config.trusted_agent_tokens, rules);
        let engine = BanEngine::new(Arc::new(classifier), store, config.ban_policy());

        let http_client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(60))
            .build()?;

        let diversion = DiversionPolicy::new(config.diversion_strategy, config.redirect_delay);

        Ok(Self {
            config: Arc::new(config),
            engine,
            rate_limiter: RateLimiter::new(redis.map(Arc::new)),
            http_client,
            diversion,
        })
    }
}

/// Admin routes plus the visitor gate as fallback
pub fn router() -> Router<AppState> {
    Router::new()
        .merge(admin::router())
        .fallback(gate::handle_request)
}

/// State over the given store, configured from `vars` on top of test defaults
#[cfg(test)]
pub(crate) fn test_state(target_url: &str, vars: &[(&str, &str)], store: Arc<dyn VisitStore>) -> AppState {
    use std::collections::HashMap;

    let mut env: HashMap<String, String> = HashMap::from([
        ("TARGET_URL".to_string(), target_url.to_string()),
        ("REDIRECT_DELAY_MS".to_string(), "0".to_string()),
    ]);
    env.extend(vars.iter().map(|(k, v)| (k.to_string(), v.to_string())));

    let config = Config::from_lookup(|name| env.get(name).cloned()).unwrap();
    AppState::new(config, store, None).unwrap()
}
