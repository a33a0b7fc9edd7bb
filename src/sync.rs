// src/sync.rs
//! Full-replace synchronization of a desktop client's dataset.
//!
//! Each call wipes every row owned by the client id and writes the new
//! snapshot. There is no merge and no conflict detection: two devices sharing
//! one client id overwrite each other, last writer wins.

use std::sync::Arc;

use serde_json::Value;
use tracing::info;

use crate::error::{GatewayError, GatewayResult};
use crate::store::{CardRow, OrderRow, ProjectRow, RecordStore, SenderRow, Snapshot};
use crate::types::{CardIn, OrderIn, ProjectIn, SenderIn, SyncReq, SyncStats};

const DEFAULT_STATUS: &str = "pending";
const DEFAULT_PAY_METHOD: i64 = 1;
const DEFAULT_CARGO_NAME: &str = "QSL卡片";

#[derive(Clone)]
pub struct SyncIngestor {
    store: Arc<dyn RecordStore>,
}

impl SyncIngestor {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self { store }
    }

    /// `received_at` fills every timestamp the client left out.
    pub async fn replace(&self, req: SyncReq, received_at: &str) -> GatewayResult<SyncStats> {
        let snapshot = build_snapshot(req, received_at)?;
        let stats = self.store.replace_snapshot(&snapshot).await?;
        info!(
            client_id = %snapshot.client_id,
            projects = stats.projects,
            cards = stats.cards,
            sf_senders = stats.sf_senders,
            sf_orders = stats.sf_orders,
            "snapshot replaced"
        );
        Ok(stats)
    }
}

pub fn build_snapshot(req: SyncReq, received_at: &str) -> GatewayResult<Snapshot> {
    let client_id = req.client_id.filter(|c| !c.is_empty());
    let (Some(client_id), Some(data)) = (client_id, req.data) else {
        return Err(GatewayError::Validation("missing client_id or data".into()));
    };
    let stamp = |v: Option<String>| v.filter(|s| !s.is_empty()).unwrap_or_else(|| received_at.to_owned());

    Ok(Snapshot {
        sync_time: stamp(req.sync_time),
        received_at: received_at.to_owned(),
        projects: data
            .projects
            .into_iter()
            .map(|p: ProjectIn| ProjectRow {
                id: p.id,
                name: p.name,
                created_at: stamp(p.created_at),
                updated_at: stamp(p.updated_at),
            })
            .collect(),
        cards: data
            .cards
            .into_iter()
            .map(|c: CardIn| CardRow {
                status: card_status(c.status.as_ref()),
                metadata: c.metadata.filter(|m| !m.is_null()).map(|m| m.to_string()),
                id: c.id,
                project_id: c.project_id,
                creator_id: c.creator_id,
                callsign: c.callsign,
                qty: c.qty,
                serial: c.serial,
                created_at: stamp(c.created_at),
                updated_at: stamp(c.updated_at),
            })
            .collect(),
        senders: data
            .sf_senders
            .into_iter()
            .map(|s: SenderIn| SenderRow {
                id: s.id,
                name: s.name,
                phone: s.phone,
                mobile: s.mobile,
                province: s.province,
                city: s.city,
                district: s.district,
                address: s.address,
                is_default: s.is_default,
                created_at: stamp(s.created_at),
                updated_at: stamp(s.updated_at),
            })
            .collect(),
        orders: data
            .sf_orders
            .into_iter()
            .map(|o: OrderIn| OrderRow {
                id: o.id,
                order_id: o.order_id,
                waybill_no: o.waybill_no,
                card_id: o.card_id,
                status: o
                    .status
                    .filter(|s| !s.is_empty())
                    .unwrap_or_else(|| DEFAULT_STATUS.into()),
                pay_method: o.pay_method.unwrap_or(DEFAULT_PAY_METHOD),
                cargo_name: o.cargo_name.unwrap_or_else(|| DEFAULT_CARGO_NAME.into()),
                sender_info: json_text(o.sender_info),
                recipient_info: json_text(o.recipient_info),
                created_at: stamp(o.created_at),
                updated_at: stamp(o.updated_at),
            })
            .collect(),
        client_id,
    })
}

// Status arrives either as a bare string or as `{ "value": ... }`.
fn card_status(v: Option<&Value>) -> String {
    match v {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Object(m)) => m
            .get("value")
            .and_then(Value::as_str)
            .unwrap_or(DEFAULT_STATUS)
            .to_owned(),
        _ => DEFAULT_STATUS.to_owned(),
    }
}

// Address blobs are relayed as JSON text; strings pass through untouched.
fn json_text(v: Option<Value>) -> String {
    match v {
        Some(Value::String(s)) if !s.is_empty() => s,
        Some(Value::Object(m)) => Value::Object(m).to_string(),
        _ => "{}".to_owned(),
    }
}
