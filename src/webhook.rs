// src/webhook.rs
//! Carrier route-push ingestion.
//!
//! The event log doubles as the dedup ledger: an id already in the log is
//! skipped, so carrier redeliveries are harmless. Only events written by this
//! batch go on to the push dispatcher, which runs detached from the response.

use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::push::{DispatchReport, PushDispatcher};
use crate::store::{RecordStore, WebhookEvent};
use crate::types::WaybillRoute;

/// Pulls `Body.WaybillRoute` out of a push body.
///
/// `Err` only when the bytes are not JSON. A missing or non-array route list
/// is an empty batch, and entries that are not objects are dropped.
pub fn parse_batch(body: &[u8]) -> Result<Vec<WaybillRoute>, serde_json::Error> {
    let root: Value = serde_json::from_slice(body)?;
    let Some(items) = root
        .get("Body")
        .and_then(|b| b.get("WaybillRoute"))
        .and_then(Value::as_array)
    else {
        return Ok(Vec::new());
    };

    Ok(items
        .iter()
        .filter_map(|item| match serde_json::from_value(item.clone()) {
            Ok(route) => Some(route),
            Err(e) => {
                warn!("dropping malformed route entry: {e}");
                None
            }
        })
        .collect())
}

/// Carrier id when given, else `{mailno}-{opCode}-{arrival_ms}`.
pub fn event_id(route: &WaybillRoute, arrival_ms: i64) -> String {
    match route.id.as_deref().filter(|id| !id.is_empty()) {
        Some(id) => id.to_owned(),
        None => format!(
            "{}-{}-{}",
            route.mailno.as_deref().unwrap_or_default(),
            route.op_code.as_deref().unwrap_or_default(),
            arrival_ms
        ),
    }
}

#[derive(Clone)]
pub struct WebhookIngestor {
    store: Arc<dyn RecordStore>,
    dispatcher: PushDispatcher,
}

impl WebhookIngestor {
    pub fn new(store: Arc<dyn RecordStore>, dispatcher: PushDispatcher) -> Self {
        Self { store, dispatcher }
    }

    /// Writes unseen events to the log and returns them. Store failures are
    /// logged per event; the carrier is acknowledged regardless.
    pub async fn ingest(&self, routes: Vec<WaybillRoute>) -> Vec<WaybillRoute> {
        self.ingest_at(routes, Utc::now().timestamp_millis()).await
    }

    pub async fn ingest_at(&self, routes: Vec<WaybillRoute>, arrival_ms: i64) -> Vec<WaybillRoute> {
        let total = routes.len();
        let mut fresh = Vec::new();

        for route in routes {
            let event = WebhookEvent {
                id: event_id(&route, arrival_ms),
                mail_no: route.mailno.clone(),
                order_id: route.orderid.clone(),
                op_code: route.op_code.clone(),
                accept_time: route.accept_time.clone(),
                remark: route.remark.clone(),
            };
            match self.store.insert_event_if_absent(&event).await {
                Ok(true) => fresh.push(route),
                Ok(false) => {}
                Err(e) => error!(id = %event.id, "route log insert failed: {e}"),
            }
        }

        info!(total, new = fresh.len(), "route batch ingested");
        fresh
    }

    /// Hands fresh events to the dispatcher on a detached task. The caller
    /// never awaits it; the handle is only useful to tests.
    pub fn schedule_dispatch(
        &self,
        fresh: Vec<WaybillRoute>,
        sandbox: bool,
    ) -> Option<JoinHandle<DispatchReport>> {
        if fresh.is_empty() || !self.dispatcher.enabled() {
            return None;
        }
        let dispatcher = self.dispatcher.clone();
        Some(tokio::spawn(async move {
            dispatcher.dispatch(&fresh, sandbox).await
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::push::tests::RecordingChannel;
    use crate::store::MemoryStore;
    use serde_json::json;

    fn ingestor(store: Arc<MemoryStore>, channel: Option<Arc<RecordingChannel>>) -> WebhookIngestor {
        let channel = channel.map(|c| c as Arc<dyn crate::push::SubscriberChannel>);
        WebhookIngestor::new(store.clone(), PushDispatcher::new(store, channel))
    }

    #[test]
    fn parse_accepts_empty_and_missing_lists() {
        assert!(parse_batch(b"{}").unwrap().is_empty());
        assert!(parse_batch(br#"{"Body":{"WaybillRoute":[]}}"#).unwrap().is_empty());
        assert!(parse_batch(br#"{"Body":{"WaybillRoute":"nope"}}"#).unwrap().is_empty());
        assert!(parse_batch(b"not json").is_err());
    }

    #[test]
    fn parse_reads_route_fields() {
        let body = json!({
            "Body": { "WaybillRoute": [
                { "id": "r1", "mailno": "SF100", "orderid": "QSL-1", "opCode": "50",
                  "acceptTime": "2026-01-01 10:00:00", "remark": "picked up" },
                { "mailno": 42, "opCode": 80, "remark": null, "acceptTime": true },
                "not a route"
            ]}
        });
        let routes = parse_batch(body.to_string().as_bytes()).unwrap();
        assert_eq!(routes.len(), 2);
        assert_eq!(routes[0].op_code.as_deref(), Some("50"));
        assert_eq!(routes[0].accept_time.as_deref(), Some("2026-01-01 10:00:00"));
        assert_eq!(routes[1].mailno.as_deref(), Some("42"));
        assert_eq!(routes[1].op_code.as_deref(), Some("80"));
        assert_eq!(routes[1].accept_time.as_deref(), Some("true"));
        assert_eq!(routes[1].remark, None);
        assert_eq!(routes[1].id, None);
    }

    #[tokio::test]
    async fn numeric_fields_are_still_logged() {
        let store = Arc::new(MemoryStore::new());
        let ing = ingestor(store.clone(), None);
        let body = json!({
            "Body": { "WaybillRoute": [
                { "id": "r1", "mailno": "SF1", "opCode": 50, "acceptTime": "2026-01-01 10:00:00" }
            ]}
        });

        let routes = parse_batch(body.to_string().as_bytes()).unwrap();
        assert_eq!(ing.ingest(routes).await.len(), 1);
        let events = store.events().await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].op_code.as_deref(), Some("50"));
    }

    #[test]
    fn synthesized_id_is_deterministic() {
        let r = WaybillRoute {
            mailno: Some("SF100".into()),
            op_code: Some("50".into()),
            ..Default::default()
        };
        assert_eq!(event_id(&r, 1_700_000_000_000), "SF100-50-1700000000000");
        assert_eq!(event_id(&r, 1_700_000_000_000), event_id(&r, 1_700_000_000_000));

        let with_id = WaybillRoute { id: Some("carrier-7".into()), ..r };
        assert_eq!(event_id(&with_id, 1), "carrier-7");
    }

    #[tokio::test]
    async fn redelivery_is_stored_once() {
        let store = Arc::new(MemoryStore::new());
        let ing = ingestor(store.clone(), None);
        let route = WaybillRoute {
            id: Some("r1".into()),
            mailno: Some("SF100".into()),
            ..Default::default()
        };

        assert_eq!(ing.ingest(vec![route.clone()]).await.len(), 1);
        assert!(ing.ingest(vec![route.clone()]).await.is_empty());
        assert!(ing.ingest(vec![route]).await.is_empty());
        assert_eq!(store.events().await.len(), 1);
    }

    #[tokio::test]
    async fn nothing_scheduled_without_channel_or_fresh_events() {
        let store = Arc::new(MemoryStore::new());
        let route = WaybillRoute { id: Some("r1".into()), ..Default::default() };

        let ing = ingestor(store.clone(), None);
        assert!(ing.schedule_dispatch(vec![route], false).is_none());

        let ing = ingestor(store, Some(Arc::new(RecordingChannel::default())));
        assert!(ing.schedule_dispatch(Vec::new(), false).is_none());
    }
}
