//! # ucp-engine
//!
//! The checkout orchestration engine: session state machine and completion
//! saga, inventory reservations, token exchange, orders, and webhook
//! delivery, all over a [`LedgerStore`](ucp_core::LedgerStore).
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                      CheckoutService                         │
//! │  create / update / mark_ready / complete / cancel            │
//! └───┬──────────────┬───────────────┬───────────────┬───────────┘
//!     │              │               │               │
//! ┌───▼──────┐ ┌─────▼──────┐ ┌──────▼──────┐ ┌──────▼────────────┐
//! │Inventory │ │ TokenBroker│ │ProfileCache │ │ WebhookDispatcher │
//! │ Manager  │ │(Exchange)  │ │  (TTL)      │ │ per-endpoint FIFO │
//! └───┬──────┘ └─────┬──────┘ └─────────────┘ └──────┬────────────┘
//!     └──────────────┴──────────┬────────────────────┘
//!                         ┌─────▼──────┐
//!                         │LedgerStore │
//!                         └────────────┘
//! ```
//!
//! [`RedbLedger`] is the durable store the daemon runs on; [`MemoryLedger`]
//! backs tests and throwaway runs.
//!
//! Per-key serialization (session, SKU, token, idempotency key, webhook
//! endpoint) comes from [`KeyedLocks`]; there is no global lock. Deadlines
//! are enforced by the [`Sweeper`].

pub mod broker;
pub mod checkout;
pub mod config;
pub mod inventory;
pub mod locks;
pub mod memory;
pub mod orders;
pub mod profile;
pub mod redb_ledger;
pub mod retry;
pub mod sweeper;
pub mod webhook;

#[cfg(test)]
mod testing;

// Re-exports for convenience
pub use broker::{MerchantKeyring, TokenBroker};
pub use checkout::{
    CheckoutService, CompleteRequest, CompletionResult, CreateSessionRequest, ReconcileReport,
    SessionPatch,
};
pub use config::EngineConfig;
pub use inventory::InventoryManager;
pub use locks::{KeyGuard, KeyedLocks};
pub use memory::MemoryLedger;
pub use orders::OrderService;
pub use profile::{ProfileCache, TomlProfileSource};
pub use redb_ledger::{LedgerDbError, RedbLedger};
pub use retry::RetryPolicy;
pub use sweeper::{SweepReport, Sweeper};
pub use webhook::{
    sign_payload, verify_signature, AlertSink, DeliveryConfig, DrainReport, HttpTransport,
    OutgoingDelivery, SignatureError, TracingAlertSink, WebhookDispatcher, WebhookTransport,
};
