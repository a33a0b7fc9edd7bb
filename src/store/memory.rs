// src/store/memory.rs
//! Process-local backend. State is lost on restart, so this is meant for
//! development runs and tests only.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;

use super::{
    CardMatch, CounterStore, NonceLedger, RateWindow, RecordStore, Snapshot, WebhookEvent,
};
use crate::error::GatewayResult;
use crate::types::SyncStats;

#[derive(Default)]
pub struct MemoryStore {
    nonces: Mutex<HashMap<String, Instant>>,
    windows: Mutex<HashMap<String, (RateWindow, Instant)>>,
    records: Mutex<Records>,
}

#[derive(Default)]
struct Records {
    snapshots: BTreeMap<String, Snapshot>,
    events: Vec<WebhookEvent>,
    event_ids: HashSet<String>,
    bindings: Vec<(String, String)>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn snapshot(&self, client_id: &str) -> Option<Snapshot> {
        self.records.lock().await.snapshots.get(client_id).cloned()
    }

    pub async fn events(&self) -> Vec<WebhookEvent> {
        self.records.lock().await.events.clone()
    }
}

#[async_trait]
impl NonceLedger for MemoryStore {
    async fn insert_if_absent(&self, nonce: &str, ttl: Duration) -> GatewayResult<bool> {
        let now = Instant::now();
        let mut nonces = self.nonces.lock().await;
        nonces.retain(|_, expires| *expires > now);
        if nonces.contains_key(nonce) {
            return Ok(false);
        }
        nonces.insert(nonce.to_owned(), now + ttl);
        Ok(true)
    }
}

#[async_trait]
impl CounterStore for MemoryStore {
    async fn load(&self, client_key: &str) -> GatewayResult<Option<RateWindow>> {
        let windows = self.windows.lock().await;
        Ok(windows
            .get(client_key)
            .filter(|(_, expires)| *expires > Instant::now())
            .map(|(w, _)| *w))
    }

    async fn save(&self, client_key: &str, window: RateWindow, ttl: Duration) -> GatewayResult<()> {
        let now = Instant::now();
        let mut windows = self.windows.lock().await;
        windows.retain(|_, (_, expires)| *expires > now);
        windows.insert(client_key.to_owned(), (window, now + ttl));
        Ok(())
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn replace_snapshot(&self, snapshot: &Snapshot) -> GatewayResult<SyncStats> {
        let mut records = self.records.lock().await;
        records.snapshots.insert(snapshot.client_id.clone(), snapshot.clone());
        Ok(snapshot.stats())
    }

    async fn cards_by_callsign(&self, callsign: &str) -> GatewayResult<Vec<CardMatch>> {
        let records = self.records.lock().await;
        let mut out = Vec::new();
        for snap in records.snapshots.values() {
            for card in snap.cards.iter().filter(|c| c.callsign.eq_ignore_ascii_case(callsign)) {
                let project_name = snap
                    .projects
                    .iter()
                    .find(|p| p.id == card.project_id)
                    .map(|p| p.name.clone());
                out.push(CardMatch {
                    id: card.id.clone(),
                    project_name,
                    status: card.status.clone(),
                    metadata: card
                        .metadata
                        .as_deref()
                        .and_then(|m| serde_json::from_str(m).ok()),
                    created_at: card.created_at.clone(),
                });
            }
        }
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(out)
    }

    async fn insert_event_if_absent(&self, event: &WebhookEvent) -> GatewayResult<bool> {
        let mut records = self.records.lock().await;
        if !records.event_ids.insert(event.id.clone()) {
            return Ok(false);
        }
        records.events.push(event.clone());
        Ok(true)
    }

    async fn callsign_for_order(&self, order_id: &str) -> GatewayResult<Option<String>> {
        let records = self.records.lock().await;
        Ok(callsign_where(&records, |o| o.order_id == order_id))
    }

    async fn callsign_for_waybill(&self, waybill_no: &str) -> GatewayResult<Option<String>> {
        let records = self.records.lock().await;
        Ok(callsign_where(&records, |o| o.waybill_no.as_deref() == Some(waybill_no)))
    }

    async fn subscribers_for(&self, callsign: &str) -> GatewayResult<Vec<String>> {
        let records = self.records.lock().await;
        Ok(records
            .bindings
            .iter()
            .filter(|(c, _)| c == callsign)
            .map(|(_, openid)| openid.clone())
            .collect())
    }

    async fn bind_subscriber(&self, callsign: &str, openid: &str) -> GatewayResult<()> {
        let mut records = self.records.lock().await;
        let exists = records
            .bindings
            .iter()
            .any(|(c, o)| c == callsign && o == openid);
        if !exists {
            records.bindings.push((callsign.to_owned(), openid.to_owned()));
        }
        Ok(())
    }
}

// Order -> card join within the owning client's snapshot.
fn callsign_where<F>(records: &Records, pred: F) -> Option<String>
where
    F: Fn(&super::OrderRow) -> bool,
{
    records.snapshots.values().find_map(|snap| {
        snap.orders.iter().filter(|o| pred(o)).find_map(|o| {
            let card_id = o.card_id.as_deref()?;
            snap.cards
                .iter()
                .find(|c| c.id == card_id)
                .map(|c| c.callsign.clone())
        })
    })
}
