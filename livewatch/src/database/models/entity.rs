//! Tracked entity database model.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::domain::{ConfirmedStatus, EntityKey, StatusKind};

/// One row per (site, entity) ever observed or subscribed to.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct EntityDbModel {
    pub site: String,
    pub entity_id: String,
    /// Debounced status: unknown, offline, online
    pub confirmed_status: String,
    /// Latest raw observation
    pub unconfirmed_status: String,
    /// When the raw status took its current value (epoch ms)
    pub unconfirmed_timestamp: i64,
    pub prev_unconfirmed_status: String,
    pub prev_unconfirmed_timestamp: i64,
    /// Consecutive raw not-found observations
    pub not_found_count: i64,
    /// Always polled individually
    pub special: bool,
    pub image_url: Option<String>,
    pub created_at: i64,
}

impl EntityDbModel {
    pub fn key(&self) -> EntityKey {
        EntityKey::new(&self.site, &self.entity_id)
    }

    pub fn confirmed(&self) -> ConfirmedStatus {
        ConfirmedStatus::parse(&self.confirmed_status).unwrap_or_default()
    }

    pub fn unconfirmed(&self) -> StatusKind {
        StatusKind::parse(&self.unconfirmed_status).unwrap_or_default()
    }

    pub fn prev_unconfirmed(&self) -> StatusKind {
        StatusKind::parse(&self.prev_unconfirmed_status).unwrap_or_default()
    }
}
