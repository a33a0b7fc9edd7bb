// src/push.rs
//! Subscriber notifications for carrier route updates.
//!
//! Runs off the request path. Nothing here reports back to the carrier;
//! every failure ends in the log.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, error, info};

use crate::error::GatewayResult;
use crate::store::RecordStore;
use crate::types::WaybillRoute;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Notification {
    pub callsign: String,
    pub waybill_no: Option<String>,
    pub remark: Option<String>,
    pub accept_time: Option<String>,
    pub sandbox: bool,
}

/// The messaging platform subscribers opt into.
#[async_trait]
pub trait SubscriberChannel: Send + Sync {
    /// Trades an OAuth authorization code for the subscriber's channel id.
    async fn resolve_subscriber(&self, code: &str) -> anyhow::Result<String>;

    async fn send(&self, subscriber: &str, note: &Notification) -> anyhow::Result<()>;
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub shipments: usize,
    pub sent: usize,
    pub failed: usize,
}

/// Keeps one event per mail number: the one with the latest carrier
/// `acceptTime`. An event with a time beats one without; ties keep the
/// earlier entry. Events without a mail number are dropped.
pub fn latest_per_shipment(events: &[WaybillRoute]) -> Vec<&WaybillRoute> {
    let mut order: Vec<&str> = Vec::new();
    let mut latest: HashMap<&str, &WaybillRoute> = HashMap::new();

    for ev in events {
        let Some(mail_no) = ev.mailno.as_deref().filter(|m| !m.is_empty()) else {
            continue;
        };
        match latest.get(mail_no) {
            None => {
                order.push(mail_no);
                latest.insert(mail_no, ev);
            }
            Some(current) => {
                let newer = match (&ev.accept_time, &current.accept_time) {
                    (Some(t), Some(cur)) => t > cur,
                    (Some(_), None) => true,
                    _ => false,
                };
                if newer {
                    latest.insert(mail_no, ev);
                }
            }
        }
    }

    order.into_iter().filter_map(|m| latest.get(m).copied()).collect()
}

#[derive(Clone)]
pub struct PushDispatcher {
    store: Arc<dyn RecordStore>,
    channel: Option<Arc<dyn SubscriberChannel>>,
}

impl PushDispatcher {
    pub fn new(store: Arc<dyn RecordStore>, channel: Option<Arc<dyn SubscriberChannel>>) -> Self {
        Self { store, channel }
    }

    pub fn enabled(&self) -> bool {
        self.channel.is_some()
    }

    pub async fn dispatch(&self, events: &[WaybillRoute], sandbox: bool) -> DispatchReport {
        let mut report = DispatchReport::default();
        let Some(channel) = &self.channel else {
            return report;
        };

        for ev in latest_per_shipment(events) {
            report.shipments += 1;
            let callsign = match self.resolve_callsign(ev).await {
                Ok(Some(c)) => c,
                Ok(None) => {
                    debug!(mailno = ?ev.mailno, orderid = ?ev.orderid, "no card for shipment");
                    continue;
                }
                Err(e) => {
                    error!(mailno = ?ev.mailno, "callsign lookup failed: {e}");
                    continue;
                }
            };

            let subscribers = match self.store.subscribers_for(&callsign).await {
                Ok(s) => s,
                Err(e) => {
                    error!(%callsign, "subscriber lookup failed: {e}");
                    continue;
                }
            };

            let note = Notification {
                callsign: callsign.clone(),
                waybill_no: ev.mailno.clone(),
                remark: ev.remark.clone(),
                accept_time: ev.accept_time.clone(),
                sandbox,
            };
            for sub in &subscribers {
                match channel.send(sub, &note).await {
                    Ok(()) => report.sent += 1,
                    Err(e) => {
                        report.failed += 1;
                        error!(%callsign, subscriber = %sub, "push send failed: {e:#}");
                    }
                }
            }
        }

        info!(
            shipments = report.shipments,
            sent = report.sent,
            failed = report.failed,
            sandbox,
            "route push dispatched"
        );
        report
    }

    // Order id first, waybill number as fallback.
    async fn resolve_callsign(&self, ev: &WaybillRoute) -> GatewayResult<Option<String>> {
        if let Some(order_id) = ev.orderid.as_deref().filter(|o| !o.is_empty()) {
            if let Some(c) = self.store.callsign_for_order(order_id).await? {
                return Ok(Some(c));
            }
        }
        match ev.mailno.as_deref() {
            Some(mail_no) => self.store.callsign_for_waybill(mail_no).await,
            None => Ok(None),
        }
    }
}
