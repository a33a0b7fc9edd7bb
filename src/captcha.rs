// src/captcha.rs
//! Arithmetic captcha with no server-side state.
//!
//! The token is `base64(json{a, e, s})` where `s` is an HMAC over `a:e`.
//! Whoever holds the captcha secret can check a token; nothing is stored.

use std::time::Duration;

use base64::{engine::general_purpose::STANDARD as B64, Engine};
use chrono::Utc;
use hmac::{Hmac, Mac};
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::auth::Verdict;
use crate::error::{GatewayError, GatewayResult};

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum CaptchaRejection {
    #[error("missing captcha parameters")]
    Missing,
    #[error("malformed captcha token")]
    Malformed,
    #[error("captcha expired")]
    Expired,
    #[error("invalid captcha")]
    Invalid,
    #[error("wrong captcha answer")]
    WrongAnswer,
}

#[derive(Serialize, Deserialize)]
struct TokenBody {
    a: i64,
    e: i64,
    s: String,
}

#[derive(Debug, Clone)]
pub struct Challenge {
    pub question: String,
    pub answer: i64,
    pub token: String,
    /// Unix milliseconds.
    pub expires_at: i64,
}

#[derive(Clone)]
pub struct CaptchaService {
    secret: Option<String>,
    ttl: Duration,
}

impl CaptchaService {
    pub fn new(secret: Option<String>, ttl: Duration) -> Self {
        Self { secret, ttl }
    }

    pub fn enabled(&self) -> bool {
        self.secret.is_some()
    }

    pub fn issue(&self) -> GatewayResult<Challenge> {
        self.issue_at(Utc::now().timestamp_millis())
    }

    pub fn issue_at(&self, now_ms: i64) -> GatewayResult<Challenge> {
        let secret = self
            .secret
            .as_deref()
            .ok_or_else(|| GatewayError::Unavailable("captcha is not enabled".into()))?;

        let mut rng = rand::thread_rng();
        // Subtraction draws the minuend from 20..=69 and the subtrahend from
        // 1..=20, so the answer is never negative.
        let (question, answer) = if rng.gen_bool(0.5) {
            let (x, y) = (rng.gen_range(1..=50), rng.gen_range(1..=50));
            (format!("{x} + {y} = ?"), x + y)
        } else {
            let (x, y) = (rng.gen_range(20..=69), rng.gen_range(1..=20));
            (format!("{x} - {y} = ?"), x - y)
        };

        let expires_at = now_ms + self.ttl.as_millis() as i64;
        let body = TokenBody {
            a: answer,
            e: expires_at,
            s: hex::encode(keyed_mac(secret, answer, expires_at).finalize().into_bytes()),
        };
        let token = B64.encode(serde_json::to_vec(&body)?);

        Ok(Challenge {
            question,
            answer,
            token,
            expires_at,
        })
    }

    pub fn verify(&self, token: &str, user_answer: &str) -> Verdict<CaptchaRejection> {
        self.verify_at(token, user_answer, Utc::now().timestamp_millis())
    }

    pub fn verify_at(
        &self,
        token: &str,
        user_answer: &str,
        now_ms: i64,
    ) -> Verdict<CaptchaRejection> {
        let Some(secret) = self.secret.as_deref() else {
            return Verdict::Accepted;
        };

        let Some(body) = B64
            .decode(token.trim())
            .ok()
            .and_then(|raw| serde_json::from_slice::<TokenBody>(&raw).ok())
        else {
            return Verdict::Rejected(CaptchaRejection::Malformed);
        };

        if now_ms > body.e {
            return Verdict::Rejected(CaptchaRejection::Expired);
        }
        let mac_ok = hex::decode(&body.s)
            .map(|sig| keyed_mac(secret, body.a, body.e).verify_slice(&sig).is_ok())
            .unwrap_or(false);
        if !mac_ok {
            return Verdict::Rejected(CaptchaRejection::Invalid);
        }
        if user_answer.trim().parse::<i64>().ok() != Some(body.a) {
            return Verdict::Rejected(CaptchaRejection::WrongAnswer);
        }
        Verdict::Accepted
    }
}

fn keyed_mac(secret: &str, answer: i64, expires_at: i64) -> HmacSha256 {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC can take key of any size");
    mac.update(format!("{answer}:{expires_at}").as_bytes());
    mac
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: i64 = 1_700_000_000_000;

    fn service() -> CaptchaService {
        CaptchaService::new(Some("captcha-secret".into()), Duration::from_secs(300))
    }

    fn reencode(body: &TokenBody) -> String {
        B64.encode(serde_json::to_vec(body).unwrap())
    }

    #[test]
    fn issued_question_matches_answer() {
        let svc = service();
        for _ in 0..200 {
            let c = svc.issue_at(NOW).unwrap();
            assert!(c.answer >= 0);
            assert_eq!(c.expires_at, NOW + 300_000);
            let parts: Vec<&str> = c.question.split(' ').collect();
            let (x, y): (i64, i64) = (parts[0].parse().unwrap(), parts[2].parse().unwrap());
            let expected = if parts[1] == "+" { x + y } else { x - y };
            assert_eq!(expected, c.answer);
        }
    }

    #[test]
    fn correct_answer_before_expiry_is_accepted() {
        let svc = service();
        let c = svc.issue_at(NOW).unwrap();
        assert_eq!(
            svc.verify_at(&c.token, &c.answer.to_string(), NOW + 1_000),
            Verdict::Accepted
        );
        assert_eq!(
            svc.verify_at(&c.token, &(c.answer + 1).to_string(), NOW + 1_000),
            Verdict::Rejected(CaptchaRejection::WrongAnswer)
        );
    }

    #[test]
    fn expired_token_is_rejected() {
        let svc = service();
        let c = svc.issue_at(NOW).unwrap();
        assert_eq!(
            svc.verify_at(&c.token, &c.answer.to_string(), c.expires_at + 1),
            Verdict::Rejected(CaptchaRejection::Expired)
        );
    }

    #[test]
    fn altered_fields_are_rejected() {
        let svc = service();
        let c = svc.issue_at(NOW).unwrap();
        let raw = B64.decode(&c.token).unwrap();
        let body: TokenBody = serde_json::from_slice(&raw).unwrap();

        let forged_answer = reencode(&TokenBody { a: body.a + 1, e: body.e, s: body.s.clone() });
        assert_eq!(
            svc.verify_at(&forged_answer, &(c.answer + 1).to_string(), NOW),
            Verdict::Rejected(CaptchaRejection::Invalid)
        );

        let forged_expiry = reencode(&TokenBody { a: body.a, e: body.e + 60_000, s: body.s.clone() });
        assert_eq!(
            svc.verify_at(&forged_expiry, &c.answer.to_string(), NOW),
            Verdict::Rejected(CaptchaRejection::Invalid)
        );

        let forged_sig = reencode(&TokenBody { a: body.a, e: body.e, s: "00".repeat(32) });
        assert_eq!(
            svc.verify_at(&forged_sig, &c.answer.to_string(), NOW),
            Verdict::Rejected(CaptchaRejection::Invalid)
        );

        let truncated = reencode(&TokenBody { a: body.a, e: body.e, s: body.s[..32].to_owned() });
        assert_eq!(
            svc.verify_at(&truncated, &c.answer.to_string(), NOW),
            Verdict::Rejected(CaptchaRejection::Invalid)
        );

        let not_hex = reencode(&TokenBody { a: body.a, e: body.e, s: "zz".repeat(32) });
        assert_eq!(
            svc.verify_at(&not_hex, &c.answer.to_string(), NOW),
            Verdict::Rejected(CaptchaRejection::Invalid)
        );
    }

    #[test]
    fn token_from_other_secret_is_rejected() {
        let other = CaptchaService::new(Some("other".into()), Duration::from_secs(300));
        let c = other.issue_at(NOW).unwrap();
        assert_eq!(
            service().verify_at(&c.token, &c.answer.to_string(), NOW),
            Verdict::Rejected(CaptchaRejection::Invalid)
        );
    }

    #[test]
    fn garbage_is_malformed() {
        let svc = service();
        assert_eq!(
            svc.verify_at("not base64!!", "3", NOW),
            Verdict::Rejected(CaptchaRejection::Malformed)
        );
        assert_eq!(
            svc.verify_at(&B64.encode(b"{\"a\":1}"), "1", NOW),
            Verdict::Rejected(CaptchaRejection::Malformed)
        );
    }

    #[test]
    fn disabled_service() {
        let svc = CaptchaService::new(None, Duration::from_secs(300));
        assert!(svc.issue_at(NOW).is_err());
        assert_eq!(svc.verify_at("anything", "0", NOW), Verdict::Accepted);
    }
}
