//! Domain types shared by the monitor, the store and the notification layer.

pub mod status;
pub mod transition;

pub use status::{ConfirmedStatus, StatusKind};
pub use transition::{ConfirmedTransition, EntityKey, NotificationKind};
