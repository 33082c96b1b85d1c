//! livewatch library crate.
//!
//! Polls streaming sites for the live state of tracked entities, debounces
//! raw observations into confirmed transitions and queues notifications for
//! subscribers.

pub mod config;
pub mod database;
pub mod domain;
pub mod error;
pub mod logging;
pub mod monitor;
pub mod notification;
pub mod sites;
pub mod utils;

pub use error::{Error, Result};
