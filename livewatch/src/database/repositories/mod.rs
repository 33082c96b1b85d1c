//! Repository layer for database access.
//!
//! Read-side operations live behind `*Repository` traits backed by the read
//! pool. Mutations that must commit together (raw updates, promotions and
//! fan-out) are exposed as `*TxOps` helpers running on an open
//! [`ImmediateTransaction`](crate::database::ImmediateTransaction).

pub mod block;
pub mod entity;
pub mod notification_queue;
pub mod status_log;
pub mod subscription;

pub use block::*;
pub use entity::*;
pub use notification_queue::*;
pub use status_log::*;
pub use subscription::*;
