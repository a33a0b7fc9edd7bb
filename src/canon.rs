// src/canon.rs
//! Request signing: canonical query string plus a SHA-256 digest keyed by
//! appending the shared secret.
//!
//! The secret is published through `/api/config`, so a valid signature only
//! shows the caller went through the query page. It is not a credential.

use chrono::Utc;
use sha2::{Digest, Sha256};
use url::form_urlencoded;
use uuid::Uuid;

pub const PARAM_TIMESTAMP: &str = "_ts";
pub const PARAM_NONCE: &str = "_nonce";
pub const PARAM_SIGNATURE: &str = "_sig";

fn is_signature_param(key: &str) -> bool {
    matches!(key, PARAM_TIMESTAMP | PARAM_NONCE | PARAM_SIGNATURE)
}

/// Sorts by key (stable, so repeated keys keep their order), drops the
/// signature fields and form-encodes the rest.
pub fn canonical_params<'a, I>(params: I) -> String
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let mut kept: Vec<(&str, &str)> = params
        .into_iter()
        .filter(|(k, _)| !is_signature_param(k))
        .collect();
    kept.sort_by(|a, b| a.0.as_bytes().cmp(b.0.as_bytes()));

    let mut ser = form_urlencoded::Serializer::new(String::new());
    for (k, v) in kept {
        ser.append_pair(k, v);
    }
    ser.finish()
}

/// Hex digest over `path:params:timestamp:nonce` followed by the secret.
pub fn sign(path: &str, canonical: &str, timestamp: &str, nonce: &str, secret: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("{path}:{canonical}:{timestamp}:{nonce}").as_bytes());
    hasher.update(secret.as_bytes());
    hex::encode(hasher.finalize())
}

pub fn verify(
    path: &str,
    canonical: &str,
    timestamp: &str,
    nonce: &str,
    secret: &str,
    supplied: &str,
) -> bool {
    sign(path, canonical, timestamp, nonce, secret) == supplied
}

/// Client-side counterpart: the three fields a caller appends to its query.
#[derive(Debug, Clone)]
pub struct SignedParams {
    pub timestamp: String,
    pub nonce: String,
    pub signature: String,
}

impl SignedParams {
    pub fn pairs(&self) -> [(&'static str, &str); 3] {
        [
            (PARAM_TIMESTAMP, self.timestamp.as_str()),
            (PARAM_NONCE, self.nonce.as_str()),
            (PARAM_SIGNATURE, self.signature.as_str()),
        ]
    }
}

/// Signs `params` for `path` with the current time and a fresh v4 nonce.
pub fn sign_request(path: &str, params: &[(&str, &str)], secret: &str) -> SignedParams {
    let timestamp = Utc::now().timestamp_millis().to_string();
    let nonce = Uuid::new_v4().to_string();
    let canonical = canonical_params(params.iter().copied());
    let signature = sign(path, &canonical, &timestamp, &nonce, secret);
    SignedParams {
        timestamp,
        nonce,
        signature,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_sorts_and_strips_signature_fields() {
        let params = [
            ("callsign", "BV2ABC"),
            ("_sig", "deadbeef"),
            ("b", "2"),
            ("_ts", "1"),
            ("a", "x y"),
            ("_nonce", "n"),
        ];
        assert_eq!(canonical_params(params), "a=x+y&b=2&callsign=BV2ABC");
    }

    #[test]
    fn empty_params_give_empty_string() {
        assert_eq!(canonical_params(std::iter::empty::<(&str, &str)>()), "");
    }

    #[test]
    fn digest_matches_known_layout() {
        let expected = {
            let mut h = Sha256::new();
            h.update(b"/api/callsigns/BV2ABC::1700000000000:n1secret");
            hex::encode(h.finalize())
        };
        assert_eq!(
            sign("/api/callsigns/BV2ABC", "", "1700000000000", "n1", "secret"),
            expected
        );
    }

    #[test]
    fn client_signature_verifies() {
        let signed = sign_request("/api/query", &[("callsign", "BV2ABC")], "k");
        let mut all = vec![("callsign", "BV2ABC")];
        all.extend(signed.pairs());
        let canonical = canonical_params(all.iter().copied());
        assert_eq!(canonical, "callsign=BV2ABC");
        assert!(verify(
            "/api/query",
            &canonical,
            &signed.timestamp,
            &signed.nonce,
            "k",
            &signed.signature
        ));
        assert_ne!(signed.nonce, sign_request("/api/query", &[], "k").nonce);
    }

    #[test]
    fn any_single_field_change_breaks_verification() {
        let sig = sign("/api/query", "callsign=BV2ABC", "1700000000000", "n1", "k");
        assert!(verify("/api/query", "callsign=BV2ABC", "1700000000000", "n1", "k", &sig));

        assert!(!verify("/api/querz", "callsign=BV2ABC", "1700000000000", "n1", "k", &sig));
        assert!(!verify("/api/query", "callsign=BV2ABD", "1700000000000", "n1", "k", &sig));
        assert!(!verify("/api/query", "callsign=BV2ABC", "1700000000001", "n1", "k", &sig));
        assert!(!verify("/api/query", "callsign=BV2ABC", "1700000000000", "n2", "k", &sig));
        assert!(!verify("/api/query", "callsign=BV2ABC", "1700000000000", "n1", "j", &sig));
    }
}
