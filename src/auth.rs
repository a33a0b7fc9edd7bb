// src/auth.rs
use std::sync::Arc;
use std::time::Duration;

use axum::http::{header::AUTHORIZATION, HeaderMap};
use chrono::Utc;
use tracing::warn;

use crate::canon::{self, PARAM_NONCE, PARAM_SIGNATURE, PARAM_TIMESTAMP};
use crate::error::{GatewayError, GatewayResult};
use crate::store::NonceLedger;

/// Outcome of a check that can refuse a request for a caller-visible reason.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict<R> {
    Accepted,
    Rejected(R),
}

impl<R: std::fmt::Display> Verdict<R> {
    /// Rejections become 403s.
    pub fn into_result(self) -> GatewayResult<()> {
        match self {
            Verdict::Accepted => Ok(()),
            Verdict::Rejected(r) => Err(GatewayError::Forbidden(r.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SignatureRejection {
    #[error("missing signature parameters")]
    MissingParams,
    #[error("expired signature")]
    Expired,
    #[error("already processed")]
    Replayed,
    #[error("invalid signature")]
    Invalid,
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
}

/// Checks the desktop client's API key. No key configured means open access.
pub fn check_bearer(headers: &HeaderMap, api_key: Option<&str>) -> GatewayResult<()> {
    match api_key {
        Some(expected) if bearer_token(headers) != Some(expected) => Err(
            GatewayError::Unauthorized("invalid API key".into()),
        ),
        _ => Ok(()),
    }
}

/// Verifies `_ts`/`_nonce`/`_sig` on signed query endpoints.
#[derive(Clone)]
pub struct RequestAuthenticator {
    secret: Option<String>,
    ledger: Option<Arc<dyn NonceLedger>>,
    window: Duration,
}

impl RequestAuthenticator {
    pub fn new(
        secret: Option<String>,
        ledger: Option<Arc<dyn NonceLedger>>,
        window: Duration,
    ) -> Self {
        Self { secret, ledger, window }
    }

    pub async fn authenticate(
        &self,
        path: &str,
        params: &[(String, String)],
    ) -> GatewayResult<Verdict<SignatureRejection>> {
        self.authenticate_at(path, params, Utc::now().timestamp_millis())
            .await
    }

    /// `now_ms` is Unix time in milliseconds, the unit `_ts` is sent in.
    pub async fn authenticate_at(
        &self,
        path: &str,
        params: &[(String, String)],
        now_ms: i64,
    ) -> GatewayResult<Verdict<SignatureRejection>> {
        let Some(secret) = self.secret.as_deref() else {
            return Ok(Verdict::Accepted);
        };

        let find = |key: &str| {
            params
                .iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.as_str())
                .filter(|v| !v.is_empty())
        };
        let (Some(ts), Some(nonce), Some(sig)) =
            (find(PARAM_TIMESTAMP), find(PARAM_NONCE), find(PARAM_SIGNATURE))
        else {
            return Ok(Verdict::Rejected(SignatureRejection::MissingParams));
        };

        let window_ms = self.window.as_millis() as u64;
        let fresh = ts
            .parse::<i64>()
            .map(|t| now_ms.abs_diff(t) <= window_ms)
            .unwrap_or(false);
        if !fresh {
            warn!(path, ts, "signature outside acceptance window");
            return Ok(Verdict::Rejected(SignatureRejection::Expired));
        }

        // Recorded before the digest check; a bad signature still burns its nonce.
        if let Some(ledger) = &self.ledger {
            if !ledger.insert_if_absent(nonce, self.window).await? {
                warn!(path, nonce, "replayed nonce");
                return Ok(Verdict::Rejected(SignatureRejection::Replayed));
            }
        }

        let canonical = canon::canonical_params(params.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        if !canon::verify(path, &canonical, ts, nonce, secret, sig) {
            warn!(path, "signature mismatch");
            return Ok(Verdict::Rejected(SignatureRejection::Invalid));
        }

        Ok(Verdict::Accepted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use axum::http::HeaderValue;

    const NOW: i64 = 1_700_000_000_000;
    const PATH: &str = "/api/callsigns/BV2ABC";

    fn authenticator() -> RequestAuthenticator {
        RequestAuthenticator::new(
            Some("sign-key".into()),
            Some(Arc::new(MemoryStore::new())),
            Duration::from_secs(300),
        )
    }

    fn signed(path: &str, extra: &[(&str, &str)], ts: i64, nonce: &str) -> Vec<(String, String)> {
        let canonical = canon::canonical_params(extra.iter().copied());
        let sig = canon::sign(path, &canonical, &ts.to_string(), nonce, "sign-key");
        let mut out: Vec<(String, String)> = extra
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        out.push(("_ts".into(), ts.to_string()));
        out.push(("_nonce".into(), nonce.into()));
        out.push(("_sig".into(), sig));
        out
    }

    #[tokio::test]
    async fn accepts_well_formed_request() {
        let auth = authenticator();
        let params = signed(PATH, &[("lang", "en")], NOW, "n-1");
        assert_eq!(auth.authenticate_at(PATH, &params, NOW).await.unwrap(), Verdict::Accepted);
    }

    #[tokio::test]
    async fn missing_fields_are_rejected_first() {
        let auth = authenticator();
        let mut params = signed(PATH, &[], NOW, "n-1");
        params.retain(|(k, _)| k != "_nonce");
        assert_eq!(
            auth.authenticate_at(PATH, &params, NOW).await.unwrap(),
            Verdict::Rejected(SignatureRejection::MissingParams)
        );
    }

    #[tokio::test]
    async fn stale_or_future_timestamps_are_rejected() {
        let auth = authenticator();
        let old = signed(PATH, &[], NOW - 300_001, "n-old");
        assert_eq!(
            auth.authenticate_at(PATH, &old, NOW).await.unwrap(),
            Verdict::Rejected(SignatureRejection::Expired)
        );
        let future = signed(PATH, &[], NOW + 300_001, "n-future");
        assert_eq!(
            auth.authenticate_at(PATH, &future, NOW).await.unwrap(),
            Verdict::Rejected(SignatureRejection::Expired)
        );
        let edge = signed(PATH, &[], NOW - 300_000, "n-edge");
        assert_eq!(auth.authenticate_at(PATH, &edge, NOW).await.unwrap(), Verdict::Accepted);
    }

    #[tokio::test]
    async fn extreme_timestamps_are_expired() {
        let auth = authenticator();
        for ts in [i64::MIN, i64::MAX] {
            let params = signed(PATH, &[], ts, &format!("n-{ts}"));
            assert_eq!(
                auth.authenticate_at(PATH, &params, NOW).await.unwrap(),
                Verdict::Rejected(SignatureRejection::Expired)
            );
        }
    }

    #[tokio::test]
    async fn nonce_cannot_be_replayed() {
        let auth = authenticator();
        let params = signed(PATH, &[], NOW, "n-1");
        assert_eq!(auth.authenticate_at(PATH, &params, NOW).await.unwrap(), Verdict::Accepted);
        assert_eq!(
            auth.authenticate_at(PATH, &params, NOW + 1_000).await.unwrap(),
            Verdict::Rejected(SignatureRejection::Replayed)
        );
    }

    #[tokio::test]
    async fn tampered_params_fail_digest() {
        let auth = authenticator();
        let mut params = signed(PATH, &[("callsign", "BV2ABC")], NOW, "n-1");
        params[0].1 = "BV2ABD".into();
        assert_eq!(
            auth.authenticate_at(PATH, &params, NOW).await.unwrap(),
            Verdict::Rejected(SignatureRejection::Invalid)
        );

        let params = signed(PATH, &[], NOW, "n-2");
        assert_eq!(
            auth.authenticate_at("/api/callsigns/BV2ABD", &params, NOW).await.unwrap(),
            Verdict::Rejected(SignatureRejection::Invalid)
        );
    }

    #[tokio::test]
    async fn no_secret_means_pass_through() {
        let auth = RequestAuthenticator::new(None, None, Duration::from_secs(300));
        assert_eq!(auth.authenticate_at(PATH, &[], NOW).await.unwrap(), Verdict::Accepted);
    }

    #[test]
    fn bearer_check() {
        let mut headers = HeaderMap::new();
        assert!(check_bearer(&headers, None).is_ok());
        assert!(check_bearer(&headers, Some("k")).is_err());

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer k"));
        assert!(check_bearer(&headers, Some("k")).is_ok());
        assert!(check_bearer(&headers, Some("other")).is_err());
    }
}
