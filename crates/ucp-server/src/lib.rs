//! # ucp-server
//!
//! The daemon around the checkout engine. There is no inbound API here: it
//! loads the business profile and webhook subscriptions, then runs the
//! background machinery until Ctrl-C.
//!
//! | Worker | Does |
//! |--------|------|
//! | Sweeper | Expires holds and idle sessions, reconciles stuck completions |
//! | Webhook dispatcher | Drains each endpoint's queue in order, with backoff |

pub mod config;
pub mod state;
pub mod workers;

pub use config::{AppConfig, LogFormat};
pub use state::AppState;
