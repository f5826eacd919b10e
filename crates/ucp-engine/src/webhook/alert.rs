//! Operator alerts for events that will not be delivered automatically.

use tracing::error;
use ucp_core::{DeadLetter, DeadLetterReason};

pub trait AlertSink: Send + Sync {
    fn dead_lettered(&self, letter: &DeadLetter);
}

/// Logs alerts at `error` under the `ucp::alert` target
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAlertSink;

impl AlertSink for TracingAlertSink {
    fn dead_lettered(&self, letter: &DeadLetter) {
        let reason = match &letter.reason {
            DeadLetterReason::Rejected { status } => format!("rejected with {status}"),
            DeadLetterReason::Exhausted {
                attempts,
                last_error,
            } => format!("{attempts} attempts exhausted, last error: {last_error}"),
        };
        error!(
            target: "ucp::alert",
            delivery_id = %letter.event.delivery_id,
            endpoint_id = %letter.event.endpoint_id,
            topic = %letter.event.topic,
            "🚨 Webhook dead-lettered: {}",
            reason
        );
    }
}
