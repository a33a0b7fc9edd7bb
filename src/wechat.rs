// src/wechat.rs
//! WeChat official-account channel: web OAuth for binding a callsign and
//! template messages for route updates.

use std::time::Duration;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use crate::config::WechatConfig;
use crate::push::{Notification, SubscriberChannel};

const SANDBOX_PREFIX: &str = "【沙箱】";

#[derive(Deserialize)]
struct OauthRes {
    openid: Option<String>,
    errmsg: Option<String>,
}

#[derive(Deserialize)]
struct TokenRes {
    access_token: Option<String>,
    errmsg: Option<String>,
}

#[derive(Deserialize)]
struct SendRes {
    #[serde(default)]
    errcode: i64,
    errmsg: Option<String>,
}

pub struct WechatChannel {
    client: reqwest::Client,
    api_base: String,
    appid: String,
    secret: String,
    template_id: Option<String>,
}

impl WechatChannel {
    /// `None` unless app id and secret are both configured.
    pub fn from_config(cfg: &WechatConfig, timeout: Duration) -> anyhow::Result<Option<Self>> {
        let (Some(appid), Some(secret)) = (&cfg.appid, &cfg.secret) else {
            return Ok(None);
        };
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Some(Self {
            client,
            api_base: cfg.api_base.trim_end_matches('/').to_owned(),
            appid: appid.clone(),
            secret: secret.clone(),
            template_id: cfg.template_id.clone(),
        }))
    }

    async fn access_token(&self) -> anyhow::Result<String> {
        let res: TokenRes = self
            .client
            .get(format!("{}/cgi-bin/token", self.api_base))
            .query(&[
                ("grant_type", "client_credential"),
                ("appid", self.appid.as_str()),
                ("secret", self.secret.as_str()),
            ])
            .send()
            .await?
            .json()
            .await
            .context("token response")?;
        res.access_token
            .ok_or_else(|| anyhow!("no access token: {}", res.errmsg.unwrap_or_default()))
    }
}

pub fn template_payload(template_id: &str, subscriber: &str, note: &Notification) -> serde_json::Value {
    let prefix = if note.sandbox { SANDBOX_PREFIX } else { "" };
    let or_dash = |v: &Option<String>| v.clone().filter(|s| !s.is_empty()).unwrap_or_else(|| "-".into());
    json!({
        "touser": subscriber,
        "template_id": template_id,
        "data": {
            "first": { "value": format!("{prefix}您的 QSL 卡片物流更新（呼号 {}）", note.callsign) },
            "keyword1": { "value": or_dash(&note.waybill_no) },
            "keyword2": { "value": or_dash(&note.remark) },
            "keyword3": { "value": or_dash(&note.accept_time) },
            "remark": { "value": "来自 QSL CardHub" },
        }
    })
}

#[async_trait]
impl SubscriberChannel for WechatChannel {
    async fn resolve_subscriber(&self, code: &str) -> anyhow::Result<String> {
        let res: OauthRes = self
            .client
            .get(format!("{}/sns/oauth2/access_token", self.api_base))
            .query(&[
                ("appid", self.appid.as_str()),
                ("secret", self.secret.as_str()),
                ("code", code),
                ("grant_type", "authorization_code"),
            ])
            .send()
            .await?
            .json()
            .await
            .context("oauth response")?;
        res.openid
            .ok_or_else(|| anyhow!(res.errmsg.unwrap_or_else(|| "no openid returned".into())))
    }

    async fn send(&self, subscriber: &str, note: &Notification) -> anyhow::Result<()> {
        let template_id = self
            .template_id
            .as_deref()
            .ok_or_else(|| anyhow!("template id not configured"))?;
        let token = self.access_token().await?;
        let res: SendRes = self
            .client
            .post(format!("{}/cgi-bin/message/template/send", self.api_base))
            .query(&[("access_token", token.as_str())])
            .json(&template_payload(template_id, subscriber, note))
            .send()
            .await?
            .json()
            .await
            .context("template send response")?;
        if res.errcode != 0 {
            return Err(anyhow!(
                "template send errcode {}: {}",
                res.errcode,
                res.errmsg.unwrap_or_default()
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn note(sandbox: bool) -> Notification {
        Notification {
            callsign: "BV2ABC".into(),
            waybill_no: Some("SF100".into()),
            remark: None,
            accept_time: Some("2026-01-01 12:00:00".into()),
            sandbox,
        }
    }

    #[test]
    fn payload_marks_sandbox_and_fills_blanks() {
        let p = template_payload("tpl", "openid-a", &note(true));
        assert_eq!(p["touser"], "openid-a");
        assert_eq!(p["template_id"], "tpl");
        assert!(p["data"]["first"]["value"].as_str().unwrap().starts_with(SANDBOX_PREFIX));
        assert!(p["data"]["first"]["value"].as_str().unwrap().contains("BV2ABC"));
        assert_eq!(p["data"]["keyword1"]["value"], "SF100");
        assert_eq!(p["data"]["keyword2"]["value"], "-");

        let p = template_payload("tpl", "openid-a", &note(false));
        assert!(!p["data"]["first"]["value"].as_str().unwrap().starts_with(SANDBOX_PREFIX));
    }

    #[test]
    fn channel_needs_app_credentials() {
        let mut cfg = WechatConfig {
            api_base: "https://api.weixin.qq.com/".into(),
            ..Default::default()
        };
        assert!(WechatChannel::from_config(&cfg, Duration::from_secs(1)).unwrap().is_none());

        cfg.appid = Some("wx1".into());
        cfg.secret = Some("s".into());
        let ch = WechatChannel::from_config(&cfg, Duration::from_secs(1)).unwrap().unwrap();
        assert_eq!(ch.api_base, "https://api.weixin.qq.com");
    }
}
