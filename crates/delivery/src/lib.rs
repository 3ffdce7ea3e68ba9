//! Mailbox admission, mailbox selection and the outbound transport seam.

pub mod engine;
pub mod rate_limiter;
pub mod transport;

pub use engine::{DeliveryEngine, Selection};
pub use rate_limiter::RateLimiter;
pub use transport::{LogTransport, MailTransport, OutboundEmail, RecordingTransport, TransportError};
