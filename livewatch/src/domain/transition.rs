//! Confirmed transitions and notification kinds.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::status::ConfirmedStatus;

/// Identifies a tracked entity across sites.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityKey {
    pub site: String,
    pub entity_id: String,
}

impl EntityKey {
    pub fn new(site: impl Into<String>, entity_id: impl Into<String>) -> Self {
        Self {
            site: site.into(),
            entity_id: entity_id.into(),
        }
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.site, self.entity_id)
    }
}

/// A promotion produced by the confirmation sweep.
///
/// These are the only status changes subscribers ever see.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfirmedTransition {
    pub key: EntityKey,
    pub status: ConfirmedStatus,
    pub timestamp: DateTime<Utc>,
    /// Seconds the entity spent in its previous raw state, when known.
    pub time_diff: Option<i64>,
    pub image_url: Option<String>,
}

/// Kind of a queued notification.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    /// A confirmed online/offline transition.
    StatusChange,
    /// The entity was removed after repeated not-found responses.
    ProfileRemoved,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StatusChange => "status_change",
            Self::ProfileRemoved => "profile_removed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "status_change" => Some(Self::StatusChange),
            "profile_removed" => Some(Self::ProfileRemoved),
            _ => None,
        }
    }

    /// Regular notifications are suppressed for chats past the block threshold.
    pub fn is_regular(&self) -> bool {
        matches!(self, Self::StatusChange)
    }
}
