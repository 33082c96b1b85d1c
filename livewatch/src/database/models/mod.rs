//! Database models.

pub mod entity;
pub mod notification;
pub mod status_change;
pub mod subscription;

pub use entity::*;
pub use notification::*;
pub use status_change::*;
pub use subscription::*;
