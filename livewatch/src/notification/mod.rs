//! Notification pipeline: fan-out into the durable queue and dispatch to
//! delivery endpoints.

pub mod channels;
pub mod dispatcher;
pub mod fanout;

pub use channels::{DeliveryOutcome, NotificationSink, TelegramConfig, TelegramSink};
pub use dispatcher::{DispatchReport, Dispatcher};
pub use fanout::FanoutPolicy;
