//! Postgres-backed stores (optional).
//!
//! The store traits are synchronous while SQLx is async, so each adapter keeps
//! a `tokio::runtime::Handle` and blocks on it. Call them from plain threads or
//! `spawn_blocking`, never from inside an async task on the same runtime.
//!
//! ## Error mapping
//!
//! | SQLx error | StoreError |
//! |------------|------------------|
//! | unique violation (`23505`) | `AlreadyExists` |
//! | check violation (`23514`) | `Corrupt` |
//! | anything else | `Unavailable` |

use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use tokio::runtime::Handle;
use tracing::instrument;

use stockguard_core::{AggregateRoot, OrderId, ProductId, StoreId};
use stockguard_inventory::{InventoryRecord, Reservation, ReservationStatus, StockChange, StockKey};

use super::{ReservationStore, StoreError, VersionedStore};

/// DDL for both tables. The `CHECK` keeps `reserved <= on_hand` true even
/// against writers that bypass the engine.
pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS inventory (
    store_id    UUID        NOT NULL,
    product_id  UUID        NOT NULL,
    on_hand     BIGINT      NOT NULL CHECK (on_hand >= 0),
    reserved    BIGINT      NOT NULL CHECK (reserved >= 0),
    version     BIGINT      NOT NULL DEFAULT 0,
    updated_at  TIMESTAMPTZ NOT NULL,
    PRIMARY KEY (store_id, product_id),
    CHECK (reserved <= on_hand)
);

CREATE TABLE IF NOT EXISTS reservations (
    order_id     VARCHAR(50) PRIMARY KEY,
    store_id     UUID        NOT NULL,
    product_id   UUID        NOT NULL,
    quantity     BIGINT      NOT NULL CHECK (quantity > 0),
    status       VARCHAR(16) NOT NULL,
    created_at   TIMESTAMPTZ NOT NULL,
    expires_at   TIMESTAMPTZ NOT NULL,
    finalized_at TIMESTAMPTZ
);

CREATE INDEX IF NOT EXISTS reservations_pending_expiry
    ON reservations (expires_at) WHERE status = 'PENDING';
"#;

#[derive(Debug, Clone)]
pub struct PostgresInventoryStore {
    pool: PgPool,
    handle: Handle,
}

impl PostgresInventoryStore {
    pub fn new(pool: PgPool, handle: Handle) -> Self {
        Self { pool, handle }
    }

    /// Create both tables if missing.
    pub async fn ensure_schema(pool: &PgPool) -> Result<(), StoreError> {
        sqlx::raw_sql(SCHEMA)
            .execute(pool)
            .await
            .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        Ok(())
    }

    #[instrument(skip(self, key), fields(key = %key), err)]
    pub async fn fetch(&self, key: &StockKey) -> Result<Option<InventoryRecord>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT store_id, product_id, on_hand, reserved, version, updated_at
            FROM inventory
            WHERE store_id = $1 AND product_id = $2
            "#,
        )
        .bind(key.store_id.as_uuid())
        .bind(key.product_id.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("fetch", e))?;

        row.map(|r| record_from_row(&r)).transpose()
    }

    #[instrument(skip(self, key, change, at), fields(key = %key), err)]
    pub async fn swap(
        &self,
        key: &StockKey,
        expected_version: u64,
        change: StockChange,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE inventory
            SET on_hand = $1, reserved = $2, version = version + 1, updated_at = $3
            WHERE store_id = $4 AND product_id = $5 AND version = $6
            "#,
        )
        .bind(to_i64(change.on_hand)?)
        .bind(to_i64(change.reserved)?)
        .bind(at)
        .bind(key.store_id.as_uuid())
        .bind(key.product_id.as_uuid())
        .bind(to_i64(expected_version)?)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("compare_and_swap", e))?;

        Ok(result.rows_affected() == 1)
    }

    pub async fn create(&self, record: &InventoryRecord) -> Result<(), StoreError> {
        let key = record.key();
        sqlx::query(
            r#"
            INSERT INTO inventory (store_id, product_id, on_hand, reserved, version, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(key.store_id.as_uuid())
        .bind(key.product_id.as_uuid())
        .bind(to_i64(record.on_hand())?)
        .bind(to_i64(record.reserved())?)
        .bind(to_i64(record.version())?)
        .bind(record.updated_at())
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("insert_inventory", e))?;
        Ok(())
    }

    pub async fn fetch_all(&self) -> Result<Vec<InventoryRecord>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT store_id, product_id, on_hand, reserved, version, updated_at
            FROM inventory
            ORDER BY store_id, product_id
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_inventory", e))?;

        rows.iter().map(record_from_row).collect()
    }
}

impl VersionedStore for PostgresInventoryStore {
    fn get(&self, key: &StockKey) -> Result<Option<InventoryRecord>, StoreError> {
        self.handle.block_on(self.fetch(key))
    }

    fn compare_and_swap(
        &self,
        key: &StockKey,
        expected_version: u64,
        change: StockChange,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        self.handle.block_on(self.swap(key, expected_version, change, at))
    }

    fn insert(&self, record: InventoryRecord) -> Result<(), StoreError> {
        self.handle.block_on(self.create(&record))
    }

    fn list(&self) -> Result<Vec<InventoryRecord>, StoreError> {
        self.handle.block_on(self.fetch_all())
    }
}

#[derive(Debug, Clone)]
pub struct PostgresReservationStore {
    pool: PgPool,
    handle: Handle,
}

impl PostgresReservationStore {
    pub fn new(pool: PgPool, handle: Handle) -> Self {
        Self { pool, handle }
    }

    pub async fn create(&self, r: &Reservation) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO reservations
                (order_id, store_id, product_id, quantity, status, created_at, expires_at, finalized_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(r.order_id.as_str())
        .bind(r.key.store_id.as_uuid())
        .bind(r.key.product_id.as_uuid())
        .bind(to_i64(r.quantity)?)
        .bind(r.status.as_str())
        .bind(r.created_at)
        .bind(r.expires_at)
        .bind(r.finalized_at)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("insert_reservation", e))?;
        Ok(())
    }

    pub async fn fetch(&self, order_id: &OrderId) -> Result<Option<Reservation>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT order_id, store_id, product_id, quantity, status, created_at, expires_at, finalized_at
            FROM reservations
            WHERE order_id = $1
            "#,
        )
        .bind(order_id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_reservation", e))?;

        row.map(|r| reservation_from_row(&r)).transpose()
    }

    #[instrument(skip(self, order_id, from, to, at), fields(order_id = %order_id, from = %from, to = %to), err)]
    pub async fn update_status(
        &self,
        order_id: &OrderId,
        from: ReservationStatus,
        to: ReservationStatus,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let finalized_at = to.is_terminal().then_some(at);
        let result = sqlx::query(
            r#"
            UPDATE reservations
            SET status = $1, finalized_at = $2
            WHERE order_id = $3 AND status = $4
            "#,
        )
        .bind(to.as_str())
        .bind(finalized_at)
        .bind(order_id.as_str())
        .bind(from.as_str())
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("transition", e))?;

        Ok(result.rows_affected() == 1)
    }

    pub async fn fetch_expired(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Reservation>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT order_id, store_id, product_id, quantity, status, created_at, expires_at, finalized_at
            FROM reservations
            WHERE status = 'PENDING' AND expires_at < $1
            ORDER BY expires_at ASC
            LIMIT $2
            "#,
        )
        .bind(now)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_expired", e))?;

        rows.iter().map(reservation_from_row).collect()
    }
}

impl ReservationStore for PostgresReservationStore {
    fn insert(&self, reservation: Reservation) -> Result<(), StoreError> {
        self.handle.block_on(self.create(&reservation))
    }

    fn get(&self, order_id: &OrderId) -> Result<Option<Reservation>, StoreError> {
        self.handle.block_on(self.fetch(order_id))
    }

    fn transition(
        &self,
        order_id: &OrderId,
        from: ReservationStatus,
        to: ReservationStatus,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        self.handle.block_on(self.update_status(order_id, from, to, at))
    }

    fn list_expired(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Reservation>, StoreError> {
        self.handle.block_on(self.fetch_expired(now, limit))
    }
}

fn record_from_row(row: &sqlx::postgres::PgRow) -> Result<InventoryRecord, StoreError> {
    let key = StockKey::new(
        StoreId::from_uuid(row.try_get("store_id").map_err(decode)?),
        ProductId::from_uuid(row.try_get("product_id").map_err(decode)?),
    );
    InventoryRecord::from_parts(
        key,
        to_u64(row.try_get("on_hand").map_err(decode)?)?,
        to_u64(row.try_get("reserved").map_err(decode)?)?,
        to_u64(row.try_get("version").map_err(decode)?)?,
        row.try_get("updated_at").map_err(decode)?,
    )
    .map_err(|e| StoreError::Corrupt(e.to_string()))
}

fn reservation_from_row(row: &sqlx::postgres::PgRow) -> Result<Reservation, StoreError> {
    let order_id: String = row.try_get("order_id").map_err(decode)?;
    let status: String = row.try_get("status").map_err(decode)?;

    Ok(Reservation {
        order_id: OrderId::parse(order_id).map_err(|e| StoreError::Corrupt(e.to_string()))?,
        key: StockKey::new(
            StoreId::from_uuid(row.try_get("store_id").map_err(decode)?),
            ProductId::from_uuid(row.try_get("product_id").map_err(decode)?),
        ),
        quantity: to_u64(row.try_get("quantity").map_err(decode)?)?,
        status: ReservationStatus::parse(&status).map_err(|e| StoreError::Corrupt(e.to_string()))?,
        created_at: row.try_get("created_at").map_err(decode)?,
        expires_at: row.try_get("expires_at").map_err(decode)?,
        finalized_at: row.try_get("finalized_at").map_err(decode)?,
    })
}

fn to_i64(value: u64) -> Result<i64, StoreError> {
    i64::try_from(value).map_err(|_| StoreError::Corrupt(format!("{value} does not fit BIGINT")))
}

fn to_u64(value: i64) -> Result<u64, StoreError> {
    u64::try_from(value).map_err(|_| StoreError::Corrupt(format!("negative quantity {value}")))
}

fn decode(e: sqlx::Error) -> StoreError {
    StoreError::Corrupt(format!("failed to decode row: {e}"))
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {operation}: {}", db_err.message());
            match db_err.code().as_deref() {
                Some("23505") => StoreError::AlreadyExists(msg),
                Some("23514") => StoreError::Corrupt(msg),
                _ => StoreError::Unavailable(msg),
            }
        }
        other => StoreError::Unavailable(format!("{operation}: {other}")),
    }
}
