// src/store/postgres.rs
use std::time::Duration;

use async_trait::async_trait;
use sqlx::{postgres::PgPoolOptions, PgPool, Row};
use tracing::info;

use super::{
    CardMatch, CounterStore, NonceLedger, RateWindow, RecordStore, Snapshot, WebhookEvent,
};
use crate::error::GatewayResult;
use crate::types::SyncStats;

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS projects (
        client_id TEXT NOT NULL,
        id TEXT NOT NULL,
        name TEXT NOT NULL,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        PRIMARY KEY (client_id, id)
    )",
    "CREATE TABLE IF NOT EXISTS cards (
        client_id TEXT NOT NULL,
        id TEXT NOT NULL,
        project_id TEXT NOT NULL,
        creator_id TEXT,
        callsign TEXT NOT NULL,
        qty BIGINT NOT NULL,
        serial BIGINT,
        status TEXT NOT NULL,
        metadata TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        PRIMARY KEY (client_id, id)
    )",
    "CREATE INDEX IF NOT EXISTS idx_cards_callsign ON cards (upper(callsign))",
    "CREATE TABLE IF NOT EXISTS sf_senders (
        client_id TEXT NOT NULL,
        id TEXT NOT NULL,
        name TEXT NOT NULL,
        phone TEXT NOT NULL,
        mobile TEXT,
        province TEXT NOT NULL,
        city TEXT NOT NULL,
        district TEXT NOT NULL,
        address TEXT NOT NULL,
        is_default BOOLEAN NOT NULL DEFAULT FALSE,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        PRIMARY KEY (client_id, id)
    )",
    "CREATE TABLE IF NOT EXISTS sf_orders (
        client_id TEXT NOT NULL,
        id TEXT NOT NULL,
        order_id TEXT NOT NULL,
        waybill_no TEXT,
        card_id TEXT,
        status TEXT NOT NULL,
        pay_method BIGINT NOT NULL,
        cargo_name TEXT NOT NULL,
        sender_info TEXT NOT NULL,
        recipient_info TEXT NOT NULL,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        PRIMARY KEY (client_id, id)
    )",
    "CREATE INDEX IF NOT EXISTS idx_sf_orders_order_id ON sf_orders (order_id)",
    "CREATE INDEX IF NOT EXISTS idx_sf_orders_waybill ON sf_orders (waybill_no)",
    "CREATE TABLE IF NOT EXISTS sync_meta (
        client_id TEXT PRIMARY KEY,
        sync_time TEXT NOT NULL,
        received_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS sf_route_log (
        id TEXT PRIMARY KEY,
        mailno TEXT,
        orderid TEXT,
        op_code TEXT,
        accept_time TEXT,
        remark TEXT,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )",
    "CREATE TABLE IF NOT EXISTS callsign_openid_bindings (
        callsign TEXT NOT NULL,
        openid TEXT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        PRIMARY KEY (callsign, openid)
    )",
    "CREATE TABLE IF NOT EXISTS request_nonces (
        nonce TEXT PRIMARY KEY,
        expires_at TIMESTAMPTZ NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS rate_windows (
        client_key TEXT PRIMARY KEY,
        window_start BIGINT NOT NULL,
        count INTEGER NOT NULL,
        expires_at TIMESTAMPTZ NOT NULL
    )",
];

#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub async fn connect(url: &str) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .acquire_timeout(Duration::from_secs(5))
            .connect(url)
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> anyhow::Result<()> {
        for stmt in SCHEMA {
            sqlx::query(stmt).execute(&self.pool).await?;
        }
        info!("schema ready ({} statements)", SCHEMA.len());
        Ok(())
    }

    /// Drops expired nonces and rate windows. Returns the number of rows removed.
    pub async fn purge_expired(&self) -> GatewayResult<u64> {
        let nonces = sqlx::query("DELETE FROM request_nonces WHERE expires_at < now()")
            .execute(&self.pool)
            .await?;
        let windows = sqlx::query("DELETE FROM rate_windows WHERE expires_at < now()")
            .execute(&self.pool)
            .await?;
        Ok(nonces.rows_affected() + windows.rows_affected())
    }
}

#[async_trait]
impl NonceLedger for PostgresStore {
    async fn insert_if_absent(&self, nonce: &str, ttl: Duration) -> GatewayResult<bool> {
        // An expired row is taken over instead of rejecting the nonce.
        let res = sqlx::query(
            r#"
            INSERT INTO request_nonces (nonce, expires_at)
            VALUES ($1, now() + make_interval(secs => $2::float8))
            ON CONFLICT (nonce) DO UPDATE
              SET expires_at = EXCLUDED.expires_at
              WHERE request_nonces.expires_at < now()
            "#,
        )
        .bind(nonce)
        .bind(ttl.as_secs_f64())
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected() == 1)
    }
}

#[async_trait]
impl CounterStore for PostgresStore {
    async fn load(&self, client_key: &str) -> GatewayResult<Option<RateWindow>> {
        let row = sqlx::query(
            "SELECT window_start, count FROM rate_windows WHERE client_key=$1 AND expires_at > now()",
        )
        .bind(client_key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| RateWindow {
            window_start: r.get::<i64, _>("window_start") as u64,
            count: r.get::<i32, _>("count") as u32,
        }))
    }

    async fn save(&self, client_key: &str, window: RateWindow, ttl: Duration) -> GatewayResult<()> {
        sqlx::query(
            r#"
            INSERT INTO rate_windows (client_key, window_start, count, expires_at)
            VALUES ($1, $2, $3, now() + make_interval(secs => $4::float8))
            ON CONFLICT (client_key) DO UPDATE
              SET window_start=EXCLUDED.window_start,
                  count=EXCLUDED.count,
                  expires_at=EXCLUDED.expires_at
            "#,
        )
        .bind(client_key)
        .bind(window.window_start as i64)
        .bind(window.count as i32)
        .bind(ttl.as_secs_f64())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl RecordStore for PostgresStore {
    async fn replace_snapshot(&self, snap: &Snapshot) -> GatewayResult<SyncStats> {
        let mut tx = self.pool.begin().await?;

        for table in ["projects", "cards", "sf_senders", "sf_orders"] {
            sqlx::query(&format!("DELETE FROM {table} WHERE client_id=$1"))
                .bind(&snap.client_id)
                .execute(&mut *tx)
                .await?;
        }

        for p in &snap.projects {
            sqlx::query(
                "INSERT INTO projects (client_id, id, name, created_at, updated_at) VALUES ($1,$2,$3,$4,$5)",
            )
            .bind(&snap.client_id)
            .bind(&p.id)
            .bind(&p.name)
            .bind(&p.created_at)
            .bind(&p.updated_at)
            .execute(&mut *tx)
            .await?;
        }

        for c in &snap.cards {
            sqlx::query(
                r#"
                INSERT INTO cards (client_id, id, project_id, creator_id, callsign, qty, serial,
                                   status, metadata, created_at, updated_at)
                VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11)
                "#,
            )
            .bind(&snap.client_id)
            .bind(&c.id)
            .bind(&c.project_id)
            .bind(&c.creator_id)
            .bind(&c.callsign)
            .bind(c.qty)
            .bind(c.serial)
            .bind(&c.status)
            .bind(&c.metadata)
            .bind(&c.created_at)
            .bind(&c.updated_at)
            .execute(&mut *tx)
            .await?;
        }

        for s in &snap.senders {
            sqlx::query(
                r#"
                INSERT INTO sf_senders (client_id, id, name, phone, mobile, province, city, district,
                                        address, is_default, created_at, updated_at)
                VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12)
                "#,
            )
            .bind(&snap.client_id)
            .bind(&s.id)
            .bind(&s.name)
            .bind(&s.phone)
            .bind(&s.mobile)
            .bind(&s.province)
            .bind(&s.city)
            .bind(&s.district)
            .bind(&s.address)
            .bind(s.is_default)
            .bind(&s.created_at)
            .bind(&s.updated_at)
            .execute(&mut *tx)
            .await?;
        }

        for o in &snap.orders {
            sqlx::query(
                r#"
                INSERT INTO sf_orders (client_id, id, order_id, waybill_no, card_id, status, pay_method,
                                       cargo_name, sender_info, recipient_info, created_at, updated_at)
                VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12)
                "#,
            )
            .bind(&snap.client_id)
            .bind(&o.id)
            .bind(&o.order_id)
            .bind(&o.waybill_no)
            .bind(&o.card_id)
            .bind(&o.status)
            .bind(o.pay_method)
            .bind(&o.cargo_name)
            .bind(&o.sender_info)
            .bind(&o.recipient_info)
            .bind(&o.created_at)
            .bind(&o.updated_at)
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query(
            r#"
            INSERT INTO sync_meta (client_id, sync_time, received_at) VALUES ($1,$2,$3)
            ON CONFLICT (client_id) DO UPDATE
              SET sync_time=EXCLUDED.sync_time, received_at=EXCLUDED.received_at
            "#,
        )
        .bind(&snap.client_id)
        .bind(&snap.sync_time)
        .bind(&snap.received_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(snap.stats())
    }

    async fn cards_by_callsign(&self, callsign: &str) -> GatewayResult<Vec<CardMatch>> {
        let rows = sqlx::query(
            r#"
            SELECT c.id, c.status, c.metadata, c.created_at, p.name AS project_name
            FROM cards c
            LEFT JOIN projects p ON p.client_id = c.client_id AND p.id = c.project_id
            WHERE upper(c.callsign) = upper($1)
            ORDER BY c.created_at DESC
            "#,
        )
        .bind(callsign)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|r| CardMatch {
                id: r.get("id"),
                project_name: r.get("project_name"),
                status: r.get("status"),
                metadata: r
                    .get::<Option<String>, _>("metadata")
                    .and_then(|m| serde_json::from_str(&m).ok()),
                created_at: r.get("created_at"),
            })
            .collect())
    }

    async fn insert_event_if_absent(&self, e: &WebhookEvent) -> GatewayResult<bool> {
        let res = sqlx::query(
            r#"
            INSERT INTO sf_route_log (id, mailno, orderid, op_code, accept_time, remark)
            VALUES ($1,$2,$3,$4,$5,$6)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(&e.id)
        .bind(&e.mail_no)
        .bind(&e.order_id)
        .bind(&e.op_code)
        .bind(&e.accept_time)
        .bind(&e.remark)
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected() == 1)
    }

    async fn callsign_for_order(&self, order_id: &str) -> GatewayResult<Option<String>> {
        let row = sqlx::query(
            r#"
            SELECT c.callsign FROM sf_orders o
            JOIN cards c ON o.client_id = c.client_id AND o.card_id = c.id
            WHERE o.order_id = $1 LIMIT 1
            "#,
        )
        .bind(order_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| r.get("callsign")))
    }

    async fn callsign_for_waybill(&self, waybill_no: &str) -> GatewayResult<Option<String>> {
        let row = sqlx::query(
            r#"
            SELECT c.callsign FROM sf_orders o
            JOIN cards c ON o.client_id = c.client_id AND o.card_id = c.id
            WHERE o.waybill_no = $1 LIMIT 1
            "#,
        )
        .bind(waybill_no)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| r.get("callsign")))
    }

    async fn subscribers_for(&self, callsign: &str) -> GatewayResult<Vec<String>> {
        let rows = sqlx::query("SELECT openid FROM callsign_openid_bindings WHERE callsign=$1")
            .bind(callsign)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(|r| r.get("openid")).collect())
    }

    async fn bind_subscriber(&self, callsign: &str, openid: &str) -> GatewayResult<()> {
        sqlx::query(
            "INSERT INTO callsign_openid_bindings (callsign, openid) VALUES ($1,$2) ON CONFLICT DO NOTHING",
        )
        .bind(callsign)
        .bind(openid)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
