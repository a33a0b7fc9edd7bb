// src/routes.rs
//! HTTP surface of the gateway.
//!
//! Layer order on the signed query endpoints, outermost first: rate limit,
//! request signature, then captcha inside the handler.

use std::net::SocketAddr;
use std::path::Path as FsPath;
use std::sync::Arc;

use axum::{
    body::{Body, Bytes},
    extract::{ConnectInfo, Path, Query, RawQuery, Request, State},
    http::{header, HeaderMap, Method, StatusCode},
    middleware::{self, Next},
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde_json::Value;
use tower::{Layer, ServiceExt};
use tower_http::{
    cors::{Any, CorsLayer},
    normalize_path::{NormalizePath, NormalizePathLayer},
    services::{ServeDir, ServeFile},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};
use tracing::{info, warn};

use crate::auth::{self, RequestAuthenticator, Verdict};
use crate::captcha::{CaptchaRejection, CaptchaService};
use crate::config::Config;
use crate::error::{GatewayError, GatewayResult};
use crate::push::{PushDispatcher, SubscriberChannel};
use crate::ratelimit::RateLimiter;
use crate::store::{Backends, CardMatch, RecordStore};
use crate::sync::SyncIngestor;
use crate::types::*;
use crate::webhook::{self, WebhookIngestor};

/// Everything a handler can reach. Built once at startup.
pub struct AppState {
    pub config: Config,
    pub rate_limiter: RateLimiter,
    pub authenticator: RequestAuthenticator,
    pub captcha: CaptchaService,
    pub sync: SyncIngestor,
    pub webhook: WebhookIngestor,
    pub store: Arc<dyn RecordStore>,
    /// Present only when the OAuth half of the channel is configured.
    pub channel: Option<Arc<dyn SubscriberChannel>>,
}

impl AppState {
    pub fn new(
        config: Config,
        backends: Backends,
        channel: Option<Arc<dyn SubscriberChannel>>,
    ) -> Self {
        let counters = config.rate_limit_enabled.then(|| backends.counters.clone());
        let push_channel = channel.clone().filter(|_| config.wechat.push_enabled());
        let subscribe_channel = channel.filter(|_| config.wechat.subscribe_enabled());

        Self {
            rate_limiter: RateLimiter::new(counters, config.rate_limit_max, config.rate_limit_window),
            authenticator: RequestAuthenticator::new(
                config.client_sign_key.clone(),
                Some(backends.nonces.clone()),
                config.sign_window,
            ),
            captcha: CaptchaService::new(config.captcha_secret.clone(), config.captcha_ttl),
            sync: SyncIngestor::new(backends.records.clone()),
            webhook: WebhookIngestor::new(
                backends.records.clone(),
                PushDispatcher::new(backends.records.clone(), push_channel),
            ),
            store: backends.records,
            channel: subscribe_channel,
            config,
        }
    }
}

pub type SharedState = Arc<AppState>;

pub fn app(state: SharedState) -> NormalizePath<Router> {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
        .max_age(std::time::Duration::from_secs(86400));

    let signed = Router::new()
        .route("/api/callsigns/:callsign", get(callsign_by_path))
        .route("/api/query", get(callsign_by_query))
        .route_layer(middleware::from_fn_with_state(state.clone(), verify_signature))
        .route_layer(middleware::from_fn_with_state(state.clone(), rate_limit));

    let limited = Router::new()
        .route("/api/captcha", get(captcha))
        .route_layer(middleware::from_fn_with_state(state.clone(), rate_limit));

    let router = Router::new()
        .route("/ping", get(ping))
        .route("/sync", post(sync))
        .route("/api/sf/route-push", post(route_push))
        .route("/api/sf/route-push/sandbox", post(route_push_sandbox))
        .route("/api/wechat/auth-callback", get(auth_callback))
        .route("/api/config", get(public_config))
        .merge(signed)
        .merge(limited)
        .fallback(static_assets)
        .with_state(state.clone())
        .layer(cors)
        .layer(TimeoutLayer::new(state.config.request_timeout))
        .layer(TraceLayer::new_for_http());

    NormalizePathLayer::trim_trailing_slash().layer(router)
}

// ---------- middleware ---------- //

/// Proxy headers first, then the socket peer.
pub fn client_ip(req: &Request) -> String {
    let headers = req.headers();
    let header_ip = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_owned)
    };

    header_ip("cf-connecting-ip")
        .or_else(|| header_ip("x-forwarded-for"))
        .or_else(|| {
            req.extensions()
                .get::<ConnectInfo<SocketAddr>>()
                .map(|ConnectInfo(addr)| addr.ip().to_string())
        })
        .unwrap_or_else(|| "unknown".into())
}

async fn rate_limit(
    State(state): State<SharedState>,
    req: Request,
    next: Next,
) -> Result<Response, GatewayError> {
    let ip = client_ip(&req);
    let decision = state.rate_limiter.check_and_consume(&ip).await;
    if !decision.allowed {
        return Err(GatewayError::RateLimited {
            retry_after: decision.retry_after(Utc::now().timestamp().max(0) as u64),
        });
    }
    Ok(next.run(req).await)
}

async fn verify_signature(
    State(state): State<SharedState>,
    req: Request,
    next: Next,
) -> Result<Response, GatewayError> {
    let params = query_pairs(req.uri().query());
    state
        .authenticator
        .authenticate(req.uri().path(), &params)
        .await?
        .into_result()?;
    Ok(next.run(req).await)
}

pub fn query_pairs(query: Option<&str>) -> Vec<(String, String)> {
    query
        .map(|q| {
            url::form_urlencoded::parse(q.as_bytes())
                .into_owned()
                .collect()
        })
        .unwrap_or_default()
}

fn param<'a>(params: &'a [(String, String)], key: &str) -> Option<&'a str> {
    params
        .iter()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.as_str())
        .filter(|v| !v.is_empty())
}

// ---------- desktop client ---------- //

async fn ping(State(state): State<SharedState>, headers: HeaderMap) -> GatewayResult<Json<PingRes>> {
    auth::check_bearer(&headers, state.config.api_key.as_deref())?;
    Ok(Json(PingRes {
        success: true,
        message: "pong",
        server_time: Utc::now().to_rfc3339(),
    }))
}

async fn sync(
    State(state): State<SharedState>,
    headers: HeaderMap,
    body: Bytes,
) -> GatewayResult<Json<SyncRes>> {
    auth::check_bearer(&headers, state.config.api_key.as_deref())?;
    let req: SyncReq = serde_json::from_slice(&body)
        .map_err(|e| GatewayError::Validation(format!("invalid JSON: {e}")))?;

    let received_at = Utc::now().to_rfc3339();
    let stats = state.sync.replace(req, &received_at).await?;
    Ok(Json(SyncRes {
        success: true,
        message: "sync completed".into(),
        received_at,
        stats,
    }))
}

// ---------- public query ---------- //

async fn captcha(State(state): State<SharedState>) -> GatewayResult<Json<CaptchaRes>> {
    let challenge = state.captcha.issue()?;
    Ok(Json(CaptchaRes {
        success: true,
        question: challenge.question,
        token: challenge.token,
        expires: challenge.expires_at,
    }))
}

async fn callsign_by_path(
    State(state): State<SharedState>,
    Path(callsign): Path<String>,
    RawQuery(query): RawQuery,
) -> GatewayResult<Json<CallsignRes>> {
    let params = query_pairs(query.as_deref());
    lookup_callsign(&state, &callsign, &params).await.map(Json)
}

async fn callsign_by_query(
    State(state): State<SharedState>,
    RawQuery(query): RawQuery,
) -> GatewayResult<Json<CallsignRes>> {
    let params = query_pairs(query.as_deref());
    let callsign = param(&params, "callsign")
        .ok_or_else(|| GatewayError::Validation("missing callsign".into()))?
        .to_owned();
    lookup_callsign(&state, &callsign, &params).await.map(Json)
}

async fn lookup_callsign(
    state: &AppState,
    callsign: &str,
    params: &[(String, String)],
) -> GatewayResult<CallsignRes> {
    if state.config.captcha_enabled() {
        let verdict = match (param(params, "captcha_token"), param(params, "captcha_answer")) {
            (Some(token), Some(answer)) => state.captcha.verify(token, answer),
            _ => Verdict::Rejected(CaptchaRejection::Missing),
        };
        verdict.into_result()?;
    }

    let callsign = callsign.trim().to_uppercase();
    if callsign.is_empty() {
        return Err(GatewayError::Validation("missing callsign".into()));
    }

    let items = state
        .store
        .cards_by_callsign(&callsign)
        .await?
        .into_iter()
        .map(summarize)
        .collect();
    Ok(CallsignRes {
        success: true,
        callsign,
        items,
    })
}

/// Projects the public part of a card out of its metadata blob.
pub fn summarize(card: CardMatch) -> CardSummary {
    let section = |name: &str| {
        card.metadata
            .as_ref()
            .and_then(|m| m.get(name))
            .filter(|v| v.is_object())
            .cloned()
    };
    let text = |v: &Value, key: &str| v.get(key).and_then(Value::as_str).map(str::to_owned);

    let distribution = section("distribution").map(|d| Distribution {
        method: text(&d, "method"),
        proxy_callsign: text(&d, "proxy_callsign"),
        remarks: text(&d, "remarks"),
    });
    let return_info = section("return_info").map(|r| ReturnInfo {
        method: text(&r, "method"),
        remarks: text(&r, "remarks"),
    });

    CardSummary {
        id: card.id,
        project_name: card.project_name,
        status: card.status,
        distribution,
        return_info,
    }
}

// ---------- carrier webhook ---------- //

async fn route_push(State(state): State<SharedState>, body: Bytes) -> Json<RoutePushRes> {
    ingest_routes(&state, &body, false).await
}

async fn route_push_sandbox(State(state): State<SharedState>, body: Bytes) -> Json<RoutePushRes> {
    ingest_routes(&state, &body, true).await
}

// Always acknowledges once the body parses; the carrier retries otherwise.
async fn ingest_routes(state: &AppState, body: &[u8], sandbox: bool) -> Json<RoutePushRes> {
    let routes = match webhook::parse_batch(body) {
        Ok(r) => r,
        Err(e) => {
            warn!(sandbox, "route push body is not JSON: {e}");
            return Json(RoutePushRes::invalid_json());
        }
    };
    let fresh = state.webhook.ingest(routes).await;
    // Detached; the handle is dropped.
    let _ = state.webhook.schedule_dispatch(fresh, sandbox);
    Json(RoutePushRes::ok())
}

// ---------- subscriber binding ---------- //

async fn auth_callback(
    State(state): State<SharedState>,
    Query(q): Query<AuthCallbackQuery>,
) -> Response {
    let code = q.code.filter(|c| !c.is_empty());
    let callsign = q
        .state
        .map(|s| s.trim().to_uppercase())
        .filter(|s| !s.is_empty());
    let (Some(code), Some(callsign)) = (code, callsign) else {
        return (StatusCode::BAD_REQUEST, "缺少 code 或 state（呼号）").into_response();
    };
    let Some(channel) = &state.channel else {
        return (StatusCode::SERVICE_UNAVAILABLE, "未配置微信服务号").into_response();
    };

    let openid = match channel.resolve_subscriber(&code).await {
        Ok(id) => id,
        Err(e) => {
            warn!(%callsign, "oauth exchange failed: {e:#}");
            return (StatusCode::BAD_REQUEST, format!("微信授权失败：{e}")).into_response();
        }
    };
    if let Err(e) = state.store.bind_subscriber(&callsign, &openid).await {
        return e.into_response();
    }
    info!(%callsign, "subscriber bound");

    Html(format!(
        "<!DOCTYPE html><html><head><meta charset=\"UTF-8\"/><title>订阅成功</title></head>\
         <body><p>订阅收卡成功！呼号 {} 已与您的微信绑定，后续该呼号的卡片分发与物流动态将推送至微信。</p></body></html>",
        escape_html(&callsign)
    ))
    .into_response()
}

fn escape_html(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}

// ---------- misc ---------- //

async fn public_config(State(state): State<SharedState>) -> Json<ConfigRes> {
    let cfg = &state.config;
    Json(ConfigRes {
        features: FeatureFlags {
            wechat_subscribe: cfg.wechat.subscribe_enabled(),
            wechat_push: cfg.wechat.push_enabled(),
            captcha: cfg.captcha_enabled(),
        },
        wechat_appid: cfg
            .wechat
            .appid
            .clone()
            .filter(|_| cfg.wechat.subscribe_enabled()),
        sign_key: cfg.client_sign_key.clone(),
        filing: cfg.site_filing.clone(),
    })
}

/// Static assets; extensionless paths that miss fall back to the SPA entry.
async fn static_assets(State(state): State<SharedState>, req: Request) -> Response {
    let dir = state.config.assets_dir.as_path();
    if !dir.is_dir() {
        return GatewayError::NotFound.into_response();
    }

    let path = req.uri().path().to_owned();
    let res = ServeDir::new(dir)
        .oneshot(req)
        .await
        .unwrap_or_else(|never| match never {});
    if res.status() != StatusCode::NOT_FOUND || path.contains('.') {
        return res.into_response();
    }
    serve_index(dir).await
}

async fn serve_index(dir: &FsPath) -> Response {
    let res = ServeFile::new(dir.join("index.html"))
        .oneshot(Request::new(Body::empty()))
        .await
        .unwrap_or_else(|never| match never {});
    if res.status() == StatusCode::NOT_FOUND {
        return GatewayError::NotFound.into_response();
    }
    res.into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn card(metadata: Option<Value>) -> CardMatch {
        CardMatch {
            id: "k1".into(),
            project_name: Some("2025".into()),
            status: "distributed".into(),
            metadata,
            created_at: "2026-01-01T00:00:00+00:00".into(),
        }
    }

    #[test]
    fn summary_projects_distribution_and_return() {
        let s = summarize(card(Some(json!({
            "distribution": { "method": "proxy", "proxy_callsign": "BY1AA", "remarks": "via club" },
            "return_info": { "method": "bureau" },
            "private": "not exposed"
        }))));
        assert_eq!(
            s.distribution,
            Some(Distribution {
                method: Some("proxy".into()),
                proxy_callsign: Some("BY1AA".into()),
                remarks: Some("via club".into()),
            })
        );
        assert_eq!(
            s.return_info,
            Some(ReturnInfo { method: Some("bureau".into()), remarks: None })
        );
    }

    #[test]
    fn summary_without_metadata_has_no_sections() {
        let s = summarize(card(None));
        assert_eq!(s.distribution, None);
        assert_eq!(s.return_info, None);
        let s = summarize(card(Some(json!({ "distribution": "direct" }))));
        assert_eq!(s.distribution, None);
    }

    #[test]
    fn client_ip_prefers_proxy_headers() {
        let req = axum::http::Request::builder()
            .header("x-forwarded-for", "203.0.113.7, 10.0.0.1")
            .body(Body::empty())
            .unwrap();
        assert_eq!(client_ip(&req), "203.0.113.7");

        let req = axum::http::Request::builder()
            .header("cf-connecting-ip", "198.51.100.2")
            .header("x-forwarded-for", "203.0.113.7")
            .body(Body::empty())
            .unwrap();
        assert_eq!(client_ip(&req), "198.51.100.2");

        let mut req = Request::new(Body::empty());
        req.extensions_mut()
            .insert(ConnectInfo(SocketAddr::from(([192, 0, 2, 9], 4000))));
        assert_eq!(client_ip(&req), "192.0.2.9");

        assert_eq!(client_ip(&Request::new(Body::empty())), "unknown");
    }

    #[test]
    fn query_pairs_decode_percent_escapes() {
        let pairs = query_pairs(Some("callsign=bv2%2Fabc&_ts=1&empty="));
        assert_eq!(pairs[0], ("callsign".into(), "bv2/abc".into()));
        assert_eq!(param(&pairs, "_ts"), Some("1"));
        assert_eq!(param(&pairs, "empty"), None);
        assert!(query_pairs(None).is_empty());
    }

    #[test]
    fn escaping_neutralizes_markup() {
        assert_eq!(escape_html("<b>&\"'"), "&lt;b&gt;&amp;&quot;&#39;");
    }
}
