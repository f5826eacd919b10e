//! Inventory records: per-SKU stock levels and time-bounded reservations.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Stock position for a SKU. `reserved + committed <= on_hand` always holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockLevel {
    pub on_hand: u32,
    /// Held by active reservations
    pub reserved: u32,
    /// Sold (committed reservations)
    pub committed: u32,
}

impl StockLevel {
    pub fn new(on_hand: u32) -> Self {
        Self {
            on_hand,
            reserved: 0,
            committed: 0,
        }
    }

    pub fn available(&self) -> u32 {
        self.on_hand
            .saturating_sub(self.reserved)
            .saturating_sub(self.committed)
    }

    pub fn is_consistent(&self) -> bool {
        u64::from(self.reserved) + u64::from(self.committed) <= u64::from(self.on_hand)
    }
}

/// Lifecycle of a reservation. Leaves `Active` exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReservationStatus {
    Active,
    Committed,
    Released,
    Expired,
}

impl ReservationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReservationStatus::Active => "active",
            ReservationStatus::Committed => "committed",
            ReservationStatus::Released => "released",
            ReservationStatus::Expired => "expired",
        }
    }
}

impl std::fmt::Display for ReservationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A hold on stock for a checkout session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: String,
    pub sku: String,
    pub quantity: u32,
    pub session_id: String,
    pub status: ReservationStatus,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
}

impl Reservation {
    pub fn is_active(&self) -> bool {
        self.status == ReservationStatus::Active
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.is_active() && now >= self.expires_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stock_available() {
        let stock = StockLevel {
            on_hand: 10,
            reserved: 3,
            committed: 4,
        };
        assert_eq!(stock.available(), 3);
        assert!(stock.is_consistent());

        let oversold = StockLevel {
            on_hand: 5,
            reserved: 3,
            committed: 3,
        };
        assert_eq!(oversold.available(), 0);
        assert!(!oversold.is_consistent());
    }
}
