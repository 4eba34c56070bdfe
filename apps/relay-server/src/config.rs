use std::{env, net::SocketAddr, str::FromStr, time::Duration};

use anyhow::{Context, Result, bail};
use relay_messages::MatchPolicy;

const DEV_TOKEN_SECRET: &str = "relay-dev-token-secret";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Production,
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub environment: Environment,
    pub addr: SocketAddr,
    pub database_path: String,
    pub redis_url: Option<String>,
    pub redis_namespace: String,
    pub token_hash_secret: String,
    pub webhook_signature_secret: Option<String>,
    pub admin_token: Option<String>,
    pub pairing_ttl: Duration,
    pub queue_ttl: Duration,
    pub callback_ttl: Duration,
    pub reply_wait: Duration,
    pub reaper_interval: Duration,
    pub default_rate_limit_per_minute: u32,
    pub broker_buffer: usize,
    pub sse_keepalive: Duration,
    pub match_policy: MatchPolicy,
}

impl RelayConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let environment = match var("RELAY_ENV").as_deref().map(str::to_lowercase).as_deref() {
            None | Some("dev") | Some("development") | Some("local") => Environment::Development,
            Some("prod") | Some("production") => Environment::Production,
            Some(other) => bail!("RELAY_ENV must be development or production, got `{other}`"),
        };

        let addr = var("RELAY_ADDR").unwrap_or_else(|| "0.0.0.0:8080".into());
        let addr = SocketAddr::from_str(&addr).with_context(|| format!("invalid RELAY_ADDR `{addr}`"))?;

        let token_hash_secret = match var("TOKEN_HASH_SECRET") {
            Some(secret) => secret,
            None if environment == Environment::Production => {
                bail!("TOKEN_HASH_SECRET is required in production")
            }
            None => DEV_TOKEN_SECRET.into(),
        };

        let match_policy = match var("MATCH_POLICY") {
            Some(raw) => raw.parse::<MatchPolicy>().map_err(anyhow::Error::msg)?,
            None => MatchPolicy::default(),
        };

        let config = Self {
            environment,
            addr,
            database_path: var("DATABASE_PATH").unwrap_or_else(|| "relay.db".into()),
            redis_url: var("REDIS_URL"),
            redis_namespace: var("REDIS_NAMESPACE").unwrap_or_else(|| "relay".into()),
            token_hash_secret,
            webhook_signature_secret: var("WEBHOOK_SIGNATURE_SECRET"),
            admin_token: var("ADMIN_TOKEN"),
            pairing_ttl: Duration::from_secs(parse_or(&var, "PAIRING_TTL_SECONDS", 600)?),
            queue_ttl: Duration::from_secs(parse_or(&var, "QUEUE_TTL_SECONDS", 900)?),
            callback_ttl: Duration::from_secs(parse_or(&var, "CALLBACK_TTL_SECONDS", 55)?),
            reply_wait: Duration::from_millis(parse_or(&var, "REPLY_WAIT_MS", 4500)?),
            reaper_interval: Duration::from_secs(parse_or(&var, "REAPER_INTERVAL_SECONDS", 60)?),
            default_rate_limit_per_minute: parse_or(&var, "DEFAULT_RATE_LIMIT_PER_MINUTE", 60)?,
            broker_buffer: parse_or(&var, "BROKER_BUFFER", 64)?,
            sse_keepalive: Duration::from_secs(parse_or(&var, "SSE_KEEPALIVE_SECONDS", 15)?),
            match_policy,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.pairing_ttl.is_zero() || self.queue_ttl.is_zero() || self.reaper_interval.is_zero() {
            bail!("PAIRING_TTL_SECONDS, QUEUE_TTL_SECONDS and REAPER_INTERVAL_SECONDS must be positive");
        }
        if self.broker_buffer == 0 {
            bail!("BROKER_BUFFER must be at least 1");
        }
        if self.sse_keepalive.is_zero() {
            bail!("SSE_KEEPALIVE_SECONDS must be positive");
        }
        Ok(())
    }

    /// Longest a webhook call blocks on a reply: the wait bound, capped by the callback window.
    pub fn effective_reply_wait(&self) -> Duration {
        self.reply_wait.min(self.callback_ttl)
    }

    /// Settings that work but should not ship to production.
    pub fn warnings(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if self.token_hash_secret == DEV_TOKEN_SECRET {
            warnings.push("TOKEN_HASH_SECRET not set; using the development secret".to_string());
        }
        if self.environment == Environment::Production {
            if self.webhook_signature_secret.is_none() {
                warnings.push("WEBHOOK_SIGNATURE_SECRET not set; webhook calls are unauthenticated".into());
            }
            if self.admin_token.is_none() {
                warnings.push("ADMIN_TOKEN not set; admin endpoints are open".into());
            }
            if self
                .redis_url
                .as_deref()
                .is_some_and(|url| !url.starts_with("rediss://"))
            {
                warnings.push("REDIS_URL does not use TLS (rediss://)".into());
            }
            if self.redis_url.is_none() {
                warnings.push("REDIS_URL not set; rate limits and events stay process-local".into());
            }
        }
        warnings
    }
}

fn parse_or<T>(var: impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match var(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|err| anyhow::anyhow!("invalid {key} `{raw}`: {err}")),
        None => Ok(default),
    }
}
