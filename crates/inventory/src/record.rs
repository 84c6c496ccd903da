use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use stockguard_core::{AggregateRoot, DomainError, ProductId, StoreId};

/// Stock identity: one inventory row, one lock, one event stream.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StockKey {
    pub store_id: StoreId,
    pub product_id: ProductId,
}

impl StockKey {
    pub fn new(store_id: StoreId, product_id: ProductId) -> Self {
        Self {
            store_id,
            product_id,
        }
    }

    /// Name of the distributed lock guarding this row.
    pub fn lock_name(&self) -> String {
        format!("inventory_lock:{}:{}", self.product_id, self.store_id)
    }
}

impl core::fmt::Display for StockKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}/{}", self.store_id, self.product_id)
    }
}

/// Target quantities for one conditional write.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct StockChange {
    pub on_hand: u64,
    pub reserved: u64,
}

/// Aggregate root: InventoryRecord.
///
/// Invariant: `reserved <= on_hand`. Every accepted change produces a record
/// whose version is exactly one higher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryRecord {
    key: StockKey,
    on_hand: u64,
    reserved: u64,
    version: u64,
    updated_at: DateTime<Utc>,
}

impl InventoryRecord {
    /// A freshly registered row at version 0.
    pub fn new(key: StockKey, on_hand: u64, at: DateTime<Utc>) -> Self {
        Self {
            key,
            on_hand,
            reserved: 0,
            version: 0,
            updated_at: at,
        }
    }

    /// Rehydrate a row read from storage.
    pub fn from_parts(
        key: StockKey,
        on_hand: u64,
        reserved: u64,
        version: u64,
        updated_at: DateTime<Utc>,
    ) -> Result<Self, DomainError> {
        if reserved > on_hand {
            return Err(DomainError::invariant(format!(
                "reserved ({reserved}) exceeds on hand ({on_hand}) for {key}"
            )));
        }
        Ok(Self {
            key,
            on_hand,
            reserved,
            version,
            updated_at,
        })
    }

    pub fn key(&self) -> StockKey {
        self.key
    }

    pub fn on_hand(&self) -> u64 {
        self.on_hand
    }

    pub fn reserved(&self) -> u64 {
        self.reserved
    }

    pub fn available(&self) -> u64 {
        self.on_hand - self.reserved
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    /// Hold `quantity` units for a new reservation.
    pub fn plan_reserve(&self, quantity: u64) -> Result<StockChange, DomainError> {
        ensure_positive(quantity)?;
        if self.available() < quantity {
            return Err(DomainError::InsufficientStock {
                available: self.available(),
                requested: quantity,
            });
        }
        Ok(StockChange {
            on_hand: self.on_hand,
            reserved: self.reserved + quantity,
        })
    }

    /// Return `quantity` held units to availability (cancel, expiry).
    pub fn plan_release(&self, quantity: u64) -> Result<StockChange, DomainError> {
        ensure_positive(quantity)?;
        let reserved = self.reserved.checked_sub(quantity).ok_or_else(|| {
            DomainError::invariant(format!(
                "cannot release {quantity} units, only {} reserved for {}",
                self.reserved, self.key
            ))
        })?;
        Ok(StockChange {
            on_hand: self.on_hand,
            reserved,
        })
    }

    /// Ship `quantity` held units out of the store (confirm).
    ///
    /// Both counters drop: the units leave on-hand stock and stop being
    /// reserved in the same write.
    pub fn plan_commit(&self, quantity: u64) -> Result<StockChange, DomainError> {
        let released = self.plan_release(quantity)?;
        Ok(StockChange {
            on_hand: self.on_hand - quantity,
            reserved: released.reserved,
        })
    }

    /// Receive (`delta > 0`) or write off (`delta < 0`) unreserved stock.
    pub fn plan_adjust(&self, delta: i64) -> Result<StockChange, DomainError> {
        if delta == 0 {
            return Err(DomainError::validation("delta cannot be zero"));
        }

        let on_hand = if delta > 0 {
            self.on_hand
                .checked_add(delta.unsigned_abs())
                .ok_or_else(|| DomainError::validation("on hand quantity overflow"))?
        } else {
            self.on_hand
                .checked_sub(delta.unsigned_abs())
                .ok_or_else(|| DomainError::invariant("stock cannot go negative"))?
        };

        if on_hand < self.reserved {
            return Err(DomainError::invariant(format!(
                "on hand ({on_hand}) would drop below reserved ({})",
                self.reserved
            )));
        }

        Ok(StockChange {
            on_hand,
            reserved: self.reserved,
        })
    }

    /// The record as it reads after `change` commits on top of this version.
    pub fn with_change(&self, change: StockChange, at: DateTime<Utc>) -> Self {
        Self {
            key: self.key,
            on_hand: change.on_hand,
            reserved: change.reserved,
            version: self.version + 1,
            updated_at: at,
        }
    }
}

impl AggregateRoot for InventoryRecord {
    type Id = StockKey;

    fn id(&self) -> &Self::Id {
        &self.key
    }

    fn version(&self) -> u64 {
        self.version
    }
}

fn ensure_positive(quantity: u64) -> Result<(), DomainError> {
    if quantity == 0 {
        return Err(DomainError::validation("quantity must be positive"));
    }
    Ok(())
}
