// src/types.rs
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------- /sync ---------- //

#[derive(Deserialize)]
pub struct SyncReq {
    pub client_id: Option<String>,
    pub sync_time: Option<String>,
    pub data: Option<SyncData>,
}

#[derive(Deserialize, Default)]
pub struct SyncData {
    #[serde(default)]
    pub projects: Vec<ProjectIn>,
    #[serde(default)]
    pub cards: Vec<CardIn>,
    #[serde(default)]
    pub sf_senders: Vec<SenderIn>,
    #[serde(default)]
    pub sf_orders: Vec<OrderIn>,
}

#[derive(Deserialize)]
pub struct ProjectIn {
    pub id: String,
    pub name: String,
    pub created_at: Option<String>,
    pub updated_at: Option<String>,
}

#[derive(Deserialize)]
pub struct CardIn {
    pub id: String,
    pub project_id: String,
    pub creator_id: Option<String>,
    pub callsign: String,
    pub qty: i64,
    pub serial: Option<i64>,
    /// Either `"pending"` or `{ "value": "pending" }`.
    pub status: Option<Value>,
    pub metadata: Option<Value>,
    pub created_at: Option<String>,
    pub updated_at: Option<String>,
}

#[derive(Deserialize)]
pub struct SenderIn {
    pub id: String,
    pub name: String,
    pub phone: String,
    pub mobile: Option<String>,
    pub province: String,
    pub city: String,
    pub district: String,
    pub address: String,
    #[serde(default)]
    pub is_default: bool,
    pub created_at: Option<String>,
    pub updated_at: Option<String>,
}

#[derive(Deserialize)]
pub struct OrderIn {
    pub id: String,
    pub order_id: String,
    pub waybill_no: Option<String>,
    pub card_id: Option<String>,
    pub status: Option<String>,
    pub pay_method: Option<i64>,
    pub cargo_name: Option<String>,
    pub sender_info: Option<Value>,
    pub recipient_info: Option<Value>,
    pub created_at: Option<String>,
    pub updated_at: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncStats {
    pub projects: usize,
    pub cards: usize,
    pub sf_senders: usize,
    pub sf_orders: usize,
}

#[derive(Serialize)]
pub struct SyncRes {
    pub success: bool,
    pub message: String,
    pub received_at: String,
    pub stats: SyncStats,
}

// ---------- callsign query ---------- //

#[derive(Serialize, Debug, PartialEq)]
pub struct CardSummary {
    pub id: String,
    pub project_name: Option<String>,
    pub status: String,
    pub distribution: Option<Distribution>,
    pub return_info: Option<ReturnInfo>,
}

#[derive(Serialize, Debug, PartialEq)]
pub struct Distribution {
    pub method: Option<String>,
    pub proxy_callsign: Option<String>,
    pub remarks: Option<String>,
}

#[derive(Serialize, Debug, PartialEq)]
pub struct ReturnInfo {
    pub method: Option<String>,
    pub remarks: Option<String>,
}

#[derive(Serialize)]
pub struct CallsignRes {
    pub success: bool,
    pub callsign: String,
    pub items: Vec<CardSummary>,
}

// ---------- captcha ---------- //

#[derive(Serialize)]
pub struct CaptchaRes {
    pub success: bool,
    pub question: String,
    pub token: String,
    pub expires: i64,
}

// ---------- carrier webhook ---------- //

/// One carrier route node. Fields are relayed as text whatever JSON type the
/// carrier used; `null` and absent both read as `None`.
#[derive(Deserialize, Serialize, Debug, Clone, Default, PartialEq)]
pub struct WaybillRoute {
    #[serde(default, deserialize_with = "lenient_text")]
    pub id: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    pub mailno: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    pub orderid: Option<String>,
    #[serde(rename = "opCode", default, deserialize_with = "lenient_text")]
    pub op_code: Option<String>,
    #[serde(rename = "acceptTime", default, deserialize_with = "lenient_text")]
    pub accept_time: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    pub remark: Option<String>,
}

fn lenient_text<'de, D>(de: D) -> Result<Option<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(match Option::<Value>::deserialize(de)? {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s),
        Some(other) => Some(other.to_string()),
    })
}

#[derive(Serialize)]
pub struct RoutePushRes {
    pub return_code: &'static str,
    pub return_msg: &'static str,
}

impl RoutePushRes {
    pub fn ok() -> Self {
        Self { return_code: "0000", return_msg: "success" }
    }

    pub fn invalid_json() -> Self {
        Self { return_code: "1000", return_msg: "invalid JSON" }
    }
}

// ---------- misc ---------- //

#[derive(Serialize)]
pub struct PingRes {
    pub success: bool,
    pub message: &'static str,
    pub server_time: String,
}

#[derive(Serialize)]
pub struct FeatureFlags {
    pub wechat_subscribe: bool,
    pub wechat_push: bool,
    pub captcha: bool,
}

#[derive(Serialize)]
pub struct ConfigRes {
    pub features: FeatureFlags,
    pub wechat_appid: Option<String>,
    pub sign_key: Option<String>,
    pub filing: Option<Value>,
}

#[derive(Deserialize)]
pub struct AuthCallbackQuery {
    pub code: Option<String>,
    pub state: Option<String>,
}
