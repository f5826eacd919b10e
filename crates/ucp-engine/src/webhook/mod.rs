//! # Webhook Delivery Engine
//!
//! At-least-once delivery of lifecycle events to platform endpoints:
//! signed, ordered per endpoint, retried with backoff, dead-lettered with an
//! operator alert when delivery cannot succeed.

pub mod alert;
pub mod dispatcher;
pub mod signing;
pub mod transport;

pub use alert::{AlertSink, TracingAlertSink};
pub use dispatcher::{DeliveryConfig, DrainReport, WebhookDispatcher};
pub use signing::{
    sign_payload, verify_signature, SignatureError, DELIVERY_ID_HEADER, SIGNATURE_HEADER,
    TOPIC_HEADER,
};
pub use transport::{HttpTransport, OutgoingDelivery, WebhookTransport};
