//! # Webhook Dispatcher
//!
//! Fans lifecycle events out to subscribed endpoints and drains each
//! endpoint's queue with its own worker.
//!
//! Per endpoint, the head event blocks everything behind it until it is
//! delivered or dead-lettered, so receivers see events in enqueue order.
//! Endpoints are independent: a failing endpoint never delays another.
//!
//! ```text
//!  enqueue ──▶ ledger queue (per endpoint, by sequence)
//!                    │
//!        run() ──────┼── worker(ep1) ── send ─▶ 2xx ─▶ archive
//!                    │                     ├──▶ 4xx ─▶ dead letter
//!                    │                     └──▶ 5xx/net ─▶ backoff, retry ─▶ … ─▶ dead letter + alert
//!                    └── worker(ep2) ── …
//! ```

use super::alert::{AlertSink, TracingAlertSink};
use super::signing::sign_payload;
use super::transport::{OutgoingDelivery, WebhookTransport};
use crate::locks::KeyedLocks;
use crate::retry::RetryPolicy;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use ucp_core::{
    AttemptOutcome, CheckoutError, CheckoutResult, DeadLetter, DeadLetterReason, DeliveryAttempt,
    DeliveryStatus, EventTopic, SharedClock, SharedLedger, WebhookEvent, WebhookSubscription,
};
use uuid::Uuid;

/// Delivery tuning
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryConfig {
    /// Attempts before an event is dead-lettered
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    /// Per-request timeout
    pub timeout: Duration,
    /// How often the supervisor rescans for pending work without a wake-up
    pub poll_interval: Duration,
}

impl DeliveryConfig {
    pub fn backoff(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_attempts, self.base_backoff, self.max_backoff)
    }
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
            timeout: Duration::from_secs(10),
            poll_interval: Duration::from_secs(1),
        }
    }
}

/// What one drain of an endpoint queue did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub delivered: usize,
    pub dead_lettered: usize,
    pub attempts: u32,
}

pub struct WebhookDispatcher {
    ledger: SharedLedger,
    clock: SharedClock,
    transport: Arc<dyn WebhookTransport>,
    alerts: Arc<dyn AlertSink>,
    config: DeliveryConfig,
    backoff: RetryPolicy,
    /// Ledger retries, separate from delivery backoff
    retry: RetryPolicy,
    /// One drainer per endpoint at a time
    workers: KeyedLocks,
    wake: Notify,
}

impl WebhookDispatcher {
    pub fn new(
        ledger: SharedLedger,
        clock: SharedClock,
        transport: Arc<dyn WebhookTransport>,
        config: DeliveryConfig,
    ) -> Self {
        Self {
            ledger,
            clock,
            transport,
            alerts: Arc::new(TracingAlertSink),
            backoff: config.backoff(),
            retry: RetryPolicy::default(),
            config,
            workers: KeyedLocks::new("webhook-endpoint"),
            wake: Notify::new(),
        }
    }

    /// Builder: route dead-letter alerts somewhere other than the log
    pub fn with_alerts(mut self, alerts: Arc<dyn AlertSink>) -> Self {
        self.alerts = alerts;
        self
    }

    /// Builder: override the ledger retry policy
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn config(&self) -> &DeliveryConfig {
        &self.config
    }

    /// Register or replace an endpoint subscription
    #[instrument(skip(self, subscription), fields(endpoint_id = %subscription.endpoint_id))]
    pub async fn subscribe(&self, subscription: WebhookSubscription) -> CheckoutResult<()> {
        if subscription.endpoint_id.trim().is_empty() {
            return Err(CheckoutError::Validation("endpoint_id must not be empty".into()));
        }
        if !subscription.url.starts_with("http://") && !subscription.url.starts_with("https://") {
            return Err(CheckoutError::Validation(format!(
                "webhook url for {} must be http(s)",
                subscription.endpoint_id
            )));
        }
        if subscription.secret.is_empty() {
            return Err(CheckoutError::Validation(format!(
                "webhook secret for {} must not be empty",
                subscription.endpoint_id
            )));
        }
        self.retry
            .run("put_subscription", || self.ledger.put_subscription(&subscription))
            .await?;
        info!(
            "Subscribed endpoint {} -> {}",
            subscription.endpoint_id, subscription.url
        );
        Ok(())
    }

    /// Queue an event for every endpoint subscribed to `topic`, all in one
    /// ledger write. Returns the queued events (one per endpoint).
    #[instrument(skip(self, payload))]
    pub async fn enqueue(
        &self,
        topic: EventTopic,
        payload: serde_json::Value,
    ) -> CheckoutResult<Vec<WebhookEvent>> {
        let subscriptions = self
            .retry
            .run("subscriptions", || self.ledger.subscriptions())
            .await?;
        let now = self.clock.now();

        let events: Vec<_> = subscriptions
            .into_iter()
            .filter(|s| s.wants(topic))
            .map(|subscription| WebhookEvent {
                delivery_id: format!("dlv_{}", Uuid::new_v4().simple()),
                endpoint_id: subscription.endpoint_id,
                sequence: 0,
                topic,
                payload: payload.clone(),
                target_url: subscription.url,
                attempts: 0,
                status: DeliveryStatus::Pending,
                next_attempt_at: None,
                created_at: now,
            })
            .collect();
        if events.is_empty() {
            return Ok(events);
        }

        let queued = self
            .retry
            .run("enqueue_webhooks", || self.ledger.enqueue_webhooks(events.clone()))
            .await?;
        for event in &queued {
            debug!(
                "Queued {} for {} (#{}, {})",
                topic, event.endpoint_id, event.sequence, event.delivery_id
            );
        }
        self.wake.notify_one();
        Ok(queued)
    }

    /// Deliver everything queued for one endpoint, in order.
    ///
    /// Retries back off in place, so this returns only once the queue is
    /// empty (every event delivered or dead-lettered).
    #[instrument(skip(self))]
    pub async fn drain_endpoint(&self, endpoint_id: &str) -> CheckoutResult<DrainReport> {
        let _worker = self.workers.lock(endpoint_id).await;
        let mut report = DrainReport::default();

        while let Some(event) = self
            .retry
            .run("next_pending_webhook", || self.ledger.next_pending_webhook(endpoint_id))
            .await?
        {
            let secret = self.secret_for(endpoint_id).await?;
            self.deliver(event, &secret, &mut report).await?;
        }
        Ok(report)
    }

    /// Supervise per-endpoint workers until `shutdown` flips to `true`
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!("🔔 Webhook dispatcher started");
        let mut workers: HashMap<String, JoinHandle<()>> = HashMap::new();

        loop {
            workers.retain(|_, handle| !handle.is_finished());

            match self
                .retry
                .run("endpoints_with_pending", || self.ledger.endpoints_with_pending())
                .await
            {
                Ok(endpoints) => {
                    for endpoint_id in endpoints {
                        if workers.contains_key(&endpoint_id) {
                            continue;
                        }
                        let handle = self.spawn_worker(endpoint_id.clone(), shutdown.clone());
                        workers.insert(endpoint_id, handle);
                    }
                }
                Err(e) => warn!("Failed to list pending webhook endpoints: {}", e),
            }

            tokio::select! {
                _ = self.wake.notified() => {}
                _ = tokio::time::sleep(self.config.poll_interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        for (endpoint_id, handle) in workers {
            if let Err(e) = handle.await {
                warn!("Webhook worker for {} ended abnormally: {}", endpoint_id, e);
            }
        }
        info!("Webhook dispatcher stopped");
    }

    fn spawn_worker(
        self: &Arc<Self>,
        endpoint_id: String,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let dispatcher = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                result = dispatcher.drain_endpoint(&endpoint_id) => match result {
                    Ok(report) if report.attempts > 0 => debug!(
                        "Drained {}: {} delivered, {} dead-lettered, {} attempts",
                        endpoint_id, report.delivered, report.dead_lettered, report.attempts
                    ),
                    Ok(_) => {}
                    Err(e) => warn!("Webhook worker for {} failed: {}", endpoint_id, e),
                },
                _ = shutdown.changed() => {
                    debug!("Webhook worker for {} stopping", endpoint_id);
                }
            }
        })
    }

    /// Attempt one event until it is delivered or dead-lettered
    async fn deliver(
        &self,
        mut event: WebhookEvent,
        secret: &str,
        report: &mut DrainReport,
    ) -> CheckoutResult<()> {
        // Resume a backoff interrupted by a restart
        if let Some(next_at) = event.next_attempt_at {
            if let Ok(wait) = (next_at - self.clock.now()).to_std() {
                tokio::time::sleep(wait).await;
            }
        }

        let body = serde_json::to_vec(&envelope(&event))
            .map_err(|e| CheckoutError::InvariantViolation(format!("unserializable event: {e}")))?;

        loop {
            let now = self.clock.now();
            let attempt = event.attempts + 1;
            let outgoing = OutgoingDelivery {
                url: event.target_url.clone(),
                delivery_id: event.delivery_id.clone(),
                topic: event.topic,
                body: body.clone(),
                signature: sign_payload(secret, &body, now),
            };

            let outcome = self.transport.send(&outgoing).await;
            event.attempts = attempt;
            report.attempts += 1;

            if let AttemptOutcome::Delivered { status } = outcome {
                self.record_attempt(&event, attempt, outcome, None).await?;
                event.status = DeliveryStatus::Delivered;
                event.next_attempt_at = None;
                self.retry
                    .run("update_webhook", || self.ledger.update_webhook(&event))
                    .await?;
                self.retry
                    .run("archive_webhook", || self.ledger.archive_webhook(&event.delivery_id))
                    .await?;
                report.delivered += 1;
                info!(
                    "📬 Delivered {} to {} ({}, attempt {}, status {})",
                    event.topic, event.endpoint_id, event.delivery_id, attempt, status
                );
                return Ok(());
            }

            if let AttemptOutcome::Rejected { status } = outcome {
                self.record_attempt(&event, attempt, outcome, None).await?;
                warn!(
                    "Endpoint {} rejected {} with {}; not retrying",
                    event.endpoint_id, event.delivery_id, status
                );
                self.dead_letter(event, DeadLetterReason::Rejected { status })
                    .await?;
                report.dead_lettered += 1;
                return Ok(());
            }

            let last_error = describe(&outcome);
            if attempt >= self.config.max_attempts {
                self.record_attempt(&event, attempt, outcome, None).await?;
                let reason = DeadLetterReason::Exhausted {
                    attempts: attempt,
                    last_error,
                };
                let letter = self.dead_letter(event, reason).await?;
                self.alerts.dead_lettered(&letter);
                report.dead_lettered += 1;
                return Ok(());
            }

            let delay = self.backoff.delay_for(attempt);
            let delay_ms = delay.as_millis() as u64;
            self.record_attempt(&event, attempt, outcome, Some(delay_ms))
                .await?;
            event.next_attempt_at = Some(now + chrono::Duration::milliseconds(delay_ms as i64));
            self.retry
                .run("update_webhook", || self.ledger.update_webhook(&event))
                .await?;

            debug!(
                "Delivery {} attempt {} failed ({}); retrying in {}ms",
                event.delivery_id, attempt, last_error, delay_ms
            );
            tokio::time::sleep(delay).await;
        }
    }

    async fn record_attempt(
        &self,
        event: &WebhookEvent,
        attempt: u32,
        outcome: AttemptOutcome,
        backoff_ms: Option<u64>,
    ) -> CheckoutResult<()> {
        let record = DeliveryAttempt {
            delivery_id: event.delivery_id.clone(),
            attempt,
            at: self.clock.now(),
            outcome,
            backoff_ms,
        };
        self.retry
            .run("append_delivery_attempt", || self.ledger.append_delivery_attempt(&record))
            .await?;
        Ok(())
    }

    async fn dead_letter(
        &self,
        mut event: WebhookEvent,
        reason: DeadLetterReason,
    ) -> CheckoutResult<DeadLetter> {
        event.status = DeliveryStatus::DeadLettered;
        event.next_attempt_at = None;
        self.retry
            .run("update_webhook", || self.ledger.update_webhook(&event))
            .await?;

        let letter = DeadLetter {
            event,
            reason,
            dead_lettered_at: self.clock.now(),
        };
        self.retry
            .run("put_dead_letter", || self.ledger.put_dead_letter(&letter))
            .await?;
        self.retry
            .run("archive_webhook", || {
                self.ledger.archive_webhook(&letter.event.delivery_id)
            })
            .await?;
        Ok(letter)
    }

    async fn secret_for(&self, endpoint_id: &str) -> CheckoutResult<String> {
        self.retry
            .run("subscriptions", || self.ledger.subscriptions())
            .await?
            .into_iter()
            .find(|s| s.endpoint_id == endpoint_id)
            .map(|s| s.secret)
            .ok_or_else(|| {
                error!("Pending webhooks for unknown endpoint {}", endpoint_id);
                CheckoutError::Configuration(format!("no subscription for endpoint {endpoint_id}"))
            })
    }
}

/// Wire body. Stable across retries of the same delivery.
fn envelope(event: &WebhookEvent) -> serde_json::Value {
    serde_json::json!({
        "delivery_id": event.delivery_id,
        "topic": event.topic,
        "sequence": event.sequence,
        "created_at": event.created_at,
        "data": event.payload,
    })
}

fn describe(outcome: &AttemptOutcome) -> String {
    match outcome {
        AttemptOutcome::Delivered { status } => format!("delivered ({status})"),
        AttemptOutcome::Rejected { status } => format!("rejected ({status})"),
        AttemptOutcome::ServerError { status } => format!("server error ({status})"),
        AttemptOutcome::NetworkError { message } => format!("network error: {message}"),
    }
}
