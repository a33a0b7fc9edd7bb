// src/store/mod.rs
//! Durable state behind the gateway.
//!
//! Every request is handled without in-process coordination; nonces, rate
//! windows, synced snapshots, the carrier event log and subscriber bindings
//! all live behind these traits. `postgres` is the deployed backend,
//! `memory` serves local runs and tests.

pub mod memory;
pub mod postgres;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::GatewayResult;
use crate::types::SyncStats;

pub use memory::MemoryStore;
pub use postgres::PostgresStore;

/// Consumed request nonces. Entries expire on their own after `ttl`.
#[async_trait]
pub trait NonceLedger: Send + Sync {
    /// Records `nonce`. Returns `false` if a live entry already exists.
    async fn insert_if_absent(&self, nonce: &str, ttl: Duration) -> GatewayResult<bool>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RateWindow {
    pub window_start: u64,
    pub count: u32,
}

#[async_trait]
pub trait CounterStore: Send + Sync {
    async fn load(&self, client_key: &str) -> GatewayResult<Option<RateWindow>>;
    async fn save(&self, client_key: &str, window: RateWindow, ttl: Duration) -> GatewayResult<()>;
}

#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Deletes everything owned by `snapshot.client_id`, then writes the snapshot.
    async fn replace_snapshot(&self, snapshot: &Snapshot) -> GatewayResult<SyncStats>;

    /// Case-insensitive match, newest card first.
    async fn cards_by_callsign(&self, callsign: &str) -> GatewayResult<Vec<CardMatch>>;

    /// Appends to the event log. `false` when the id is already present.
    async fn insert_event_if_absent(&self, event: &WebhookEvent) -> GatewayResult<bool>;

    async fn callsign_for_order(&self, order_id: &str) -> GatewayResult<Option<String>>;

    async fn callsign_for_waybill(&self, waybill_no: &str) -> GatewayResult<Option<String>>;

    async fn subscribers_for(&self, callsign: &str) -> GatewayResult<Vec<String>>;

    async fn bind_subscriber(&self, callsign: &str, openid: &str) -> GatewayResult<()>;
}

/// The three stores, usually backed by one connection pool.
#[derive(Clone)]
pub struct Backends {
    pub records: Arc<dyn RecordStore>,
    pub nonces: Arc<dyn NonceLedger>,
    pub counters: Arc<dyn CounterStore>,
}

impl Backends {
    pub fn memory(store: Arc<MemoryStore>) -> Self {
        Self {
            records: store.clone(),
            nonces: store.clone(),
            counters: store,
        }
    }

    pub fn postgres(store: PostgresStore) -> Self {
        let store = Arc::new(store);
        Self {
            records: store.clone(),
            nonces: store.clone(),
            counters: store,
        }
    }
}

// ---------- rows ---------- //

#[derive(Clone, Debug, PartialEq)]
pub struct ProjectRow {
    pub id: String,
    pub name: String,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Clone, Debug, PartialEq)]
pub struct CardRow {
    pub id: String,
    pub project_id: String,
    pub creator_id: Option<String>,
    pub callsign: String,
    pub qty: i64,
    pub serial: Option<i64>,
    pub status: String,
    pub metadata: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Clone, Debug, PartialEq)]
pub struct SenderRow {
    pub id: String,
    pub name: String,
    pub phone: String,
    pub mobile: Option<String>,
    pub province: String,
    pub city: String,
    pub district: String,
    pub address: String,
    pub is_default: bool,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Clone, Debug, PartialEq)]
pub struct OrderRow {
    pub id: String,
    pub order_id: String,
    pub waybill_no: Option<String>,
    pub card_id: Option<String>,
    pub status: String,
    pub pay_method: i64,
    pub cargo_name: String,
    pub sender_info: String,
    pub recipient_info: String,
    pub created_at: String,
    pub updated_at: String,
}

/// One client's complete dataset as of `sync_time`.
#[derive(Clone, Debug, PartialEq)]
pub struct Snapshot {
    pub client_id: String,
    pub sync_time: String,
    pub received_at: String,
    pub projects: Vec<ProjectRow>,
    pub cards: Vec<CardRow>,
    pub senders: Vec<SenderRow>,
    pub orders: Vec<OrderRow>,
}

impl Snapshot {
    pub fn stats(&self) -> SyncStats {
        SyncStats {
            projects: self.projects.len(),
            cards: self.cards.len(),
            sf_senders: self.senders.len(),
            sf_orders: self.orders.len(),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct CardMatch {
    pub id: String,
    pub project_name: Option<String>,
    pub status: String,
    pub metadata: Option<Value>,
    pub created_at: String,
}

/// A carrier route node as written to the event log. Immutable once stored.
#[derive(Clone, Debug, PartialEq)]
pub struct WebhookEvent {
    pub id: String,
    pub mail_no: Option<String>,
    pub order_id: Option<String>,
    pub op_code: Option<String>,
    pub accept_time: Option<String>,
    pub remark: Option<String>,
}
