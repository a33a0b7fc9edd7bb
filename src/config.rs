// src/config.rs
use std::{env, net::SocketAddr, path::PathBuf, time::Duration};

use anyhow::Context;
use serde_json::Value;
use tracing::warn;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StoreBackend {
    Postgres,
    Memory,
}

#[derive(Clone, Debug, Default)]
pub struct WechatConfig {
    pub appid: Option<String>,
    pub secret: Option<String>,
    pub template_id: Option<String>,
    pub api_base: String,
}

impl WechatConfig {
    /// Enough to run the OAuth callback that binds a callsign.
    pub fn subscribe_enabled(&self) -> bool {
        self.appid.is_some() && self.secret.is_some()
    }

    pub fn push_enabled(&self) -> bool {
        self.subscribe_enabled() && self.template_id.is_some()
    }
}

/// Process-wide settings, read once at startup and shared through `AppState`.
#[derive(Clone, Debug)]
pub struct Config {
    pub bind_addr: SocketAddr,
    pub store_backend: StoreBackend,
    pub database_url: Option<String>,
    pub api_key: Option<String>,
    pub client_sign_key: Option<String>,
    pub captcha_secret: Option<String>,
    pub rate_limit_enabled: bool,
    pub rate_limit_max: u32,
    pub rate_limit_window: u64,
    pub sign_window: Duration,
    pub captcha_ttl: Duration,
    pub wechat: WechatConfig,
    pub outbound_timeout: Duration,
    pub request_timeout: Duration,
    pub site_filing: Option<Value>,
    pub assets_dir: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            store_backend: StoreBackend::Memory,
            database_url: None,
            api_key: None,
            client_sign_key: None,
            captcha_secret: None,
            rate_limit_enabled: true,
            rate_limit_max: 20,
            rate_limit_window: 60,
            sign_window: Duration::from_secs(5 * 60),
            captcha_ttl: Duration::from_secs(5 * 60),
            wechat: WechatConfig {
                api_base: "https://api.weixin.qq.com".into(),
                ..WechatConfig::default()
            },
            outbound_timeout: Duration::from_millis(5000),
            request_timeout: Duration::from_secs(10),
            site_filing: None,
            assets_dir: PathBuf::from("./public"),
        }
    }
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let defaults = Config::default();

        let bind_addr = match env::var("BIND_ADDR") {
            Ok(s) => s.parse().with_context(|| format!("invalid BIND_ADDR {s}"))?,
            Err(_) => defaults.bind_addr,
        };

        let store_backend = match opt("STORE_BACKEND").as_deref() {
            None | Some("postgres") => StoreBackend::Postgres,
            Some("memory") => StoreBackend::Memory,
            Some(other) => anyhow::bail!("unknown STORE_BACKEND {other}"),
        };
        let database_url = opt("DATABASE_URL");
        if store_backend == StoreBackend::Postgres && database_url.is_none() {
            anyhow::bail!("DATABASE_URL is required when STORE_BACKEND=postgres");
        }

        let site_filing = opt("SITE_FILING").and_then(|raw| match serde_json::from_str(&raw) {
            Ok(v) => Some(v),
            Err(e) => {
                warn!("ignoring SITE_FILING: {e}");
                None
            }
        });

        Ok(Self {
            bind_addr,
            store_backend,
            database_url,
            api_key: opt("API_KEY"),
            client_sign_key: opt("CLIENT_SIGN_KEY"),
            captcha_secret: opt("CAPTCHA_SECRET"),
            rate_limit_enabled: parsed("RATE_LIMIT_ENABLED", defaults.rate_limit_enabled)?,
            rate_limit_max: parsed("RATE_LIMIT_MAX", defaults.rate_limit_max)?,
            rate_limit_window: parsed("RATE_LIMIT_WINDOW_SECS", defaults.rate_limit_window)?,
            sign_window: Duration::from_secs(parsed("SIGN_WINDOW_SECS", 300)?),
            captcha_ttl: Duration::from_secs(parsed("CAPTCHA_TTL_SECS", 300)?),
            wechat: WechatConfig {
                appid: opt("WECHAT_APPID"),
                secret: opt("WECHAT_SECRET"),
                template_id: opt("WECHAT_TEMPLATE_ID"),
                api_base: opt("WECHAT_API_BASE").unwrap_or(defaults.wechat.api_base),
            },
            outbound_timeout: Duration::from_millis(parsed("OUTBOUND_TIMEOUT_MS", 5000)?),
            request_timeout: Duration::from_secs(parsed("REQUEST_TIMEOUT_SECS", 10)?),
            site_filing,
            assets_dir: opt("ASSETS_DIR").map(PathBuf::from).unwrap_or(defaults.assets_dir),
        })
    }

    pub fn captcha_enabled(&self) -> bool {
        self.client_sign_key.is_some() && self.captcha_secret.is_some()
    }
}

// Empty values count as unset, same as a missing binding.
fn opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn parsed<T>(key: &str, default: T) -> anyhow::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match opt(key) {
        Some(raw) => raw
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid {key}={raw}: {e}")),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn feature_flags_follow_configured_secrets() {
        let mut cfg = Config::default();
        assert!(!cfg.captcha_enabled());
        assert!(!cfg.wechat.subscribe_enabled());

        cfg.client_sign_key = Some("k".into());
        cfg.captcha_secret = Some("c".into());
        cfg.wechat.appid = Some("wx".into());
        cfg.wechat.secret = Some("s".into());
        assert!(cfg.captcha_enabled());
        assert!(cfg.wechat.subscribe_enabled());
        assert!(!cfg.wechat.push_enabled());

        cfg.wechat.template_id = Some("t".into());
        assert!(cfg.wechat.push_enabled());
    }
}
