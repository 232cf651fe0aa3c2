//! # Ledger Materializer
//!
//! Turns the append-only movement ledger into per-(variant, location) stock.
//!
//! ## Fold
//! ```text
//!   events (any order)
//!        │
//!        ▼
//!   ┌──────────────────────────────────────────────┐
//!   │ HashMap<(variant_id, location_id), i64>      │
//!   │   from = Some(A)  →  acc[(v, A)] -= qty      │
//!   │   to   = Some(B)  →  acc[(v, B)] += qty      │
//!   └──────────────────────────────────────────────┘
//!        │   addition is commutative, so every permutation
//!        │   of the input yields the same map
//!        ▼
//!   variants × locations (input order), default 0
//!        │
//!        ▼
//!   classify: qty <= 0 → OutOfStock
//!             qty <= threshold → Low
//!             otherwise → Healthy
//! ```
//!
//! Delta sync may deliver events out of timestamp order, so nothing here may
//! depend on event order.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use ts_rs::TS;

use crate::types::{Location, MovementEvent, StockRecord, StockStatus, Variant};

/// Thresholds used to classify stock records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockPolicy {
    /// Quantities at or below this (and above zero) are `Low`.
    pub low_stock_threshold: i64,
}

impl Default for StockPolicy {
    fn default() -> Self {
        StockPolicy {
            low_stock_threshold: 5,
        }
    }
}

impl StockPolicy {
    pub fn classify(&self, quantity: i64) -> StockStatus {
        if quantity <= 0 {
            StockStatus::OutOfStock
        } else if quantity <= self.low_stock_threshold {
            StockStatus::Low
        } else {
            StockStatus::Healthy
        }
    }
}

/// Signed per-(variant, location) balances, borrowed from the events.
pub type Balances<'a> = HashMap<(&'a str, &'a str), i64>;

/// Folds events into balances.
pub fn fold(events: &[MovementEvent]) -> Balances<'_> {
    let mut acc: Balances<'_> = HashMap::with_capacity(events.len());

    for event in events {
        let variant = event.variant_id.as_str();
        if let Some(from) = event.from_location_id.as_deref() {
            *acc.entry((variant, from)).or_insert(0) -= event.quantity;
        }
        if let Some(to) = event.to_location_id.as_deref() {
            *acc.entry((variant, to)).or_insert(0) += event.quantity;
        }
    }

    acc
}

/// Materializes a stock record for every (variant, location) combination.
///
/// Output order is variants-major, both in input order. Events referencing
/// variants or locations outside the given sets are folded but not emitted.
pub fn materialize(
    events: &[MovementEvent],
    variants: &[Variant],
    locations: &[Location],
    policy: &StockPolicy,
) -> Vec<StockRecord> {
    let balances = fold(events);
    let mut records = Vec::with_capacity(variants.len() * locations.len());

    for variant in variants {
        for location in locations {
            let quantity = balances
                .get(&(variant.id.as_str(), location.id.as_str()))
                .copied()
                .unwrap_or(0);
            records.push(StockRecord {
                variant_id: variant.id.clone(),
                location_id: location.id.clone(),
                quantity,
                status: policy.classify(quantity),
            });
        }
    }

    records
}

/// Balance for a single (variant, location), without materializing the grid.
pub fn stock_for(events: &[MovementEvent], variant_id: &str, location_id: &str) -> i64 {
    events
        .iter()
        .filter(|e| e.variant_id == variant_id)
        .map(|e| {
            let mut delta = 0;
            if e.from_location_id.as_deref() == Some(location_id) {
                delta -= e.quantity;
            }
            if e.to_location_id.as_deref() == Some(location_id) {
                delta += e.quantity;
            }
            delta
        })
        .sum()
}

/// Totals over a set of stock records.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct StockSummary {
    pub records: usize,
    pub out_of_stock: usize,
    pub low: usize,
    pub healthy: usize,
    /// Sum of positive quantities.
    pub units_on_hand: i64,
}

impl StockSummary {
    pub fn from_records(records: &[StockRecord]) -> Self {
        records.iter().fold(StockSummary::default(), |mut s, r| {
            s.records += 1;
            match r.status {
                StockStatus::OutOfStock => s.out_of_stock += 1,
                StockStatus::Low => s.low += 1,
                StockStatus::Healthy => s.healthy += 1,
            }
            s.units_on_hand += r.quantity.max(0);
            s
        })
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
