//! Raw and confirmed entity statuses.

use serde::{Deserialize, Serialize};

/// A single raw observation reported by a site adapter.
///
/// `Ambiguous` stands for "online or offline, not sure which" and is never
/// promoted by the confirmation sweep.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Default,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum StatusKind {
    #[default]
    Unknown,
    Offline,
    Online,
    NotFound,
    Denied,
    Ambiguous,
}

impl StatusKind {
    /// Convert to database string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Offline => "offline",
            Self::Online => "online",
            Self::NotFound => "not_found",
            Self::Denied => "denied",
            Self::Ambiguous => "ambiguous",
        }
    }

    /// Parse from database string representation.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "unknown" => Some(Self::Unknown),
            "offline" => Some(Self::Offline),
            "online" => Some(Self::Online),
            "not_found" => Some(Self::NotFound),
            "denied" => Some(Self::Denied),
            "ambiguous" => Some(Self::Ambiguous),
            _ => None,
        }
    }

    pub fn is_online(&self) -> bool {
        matches!(self, Self::Online)
    }

    /// Statuses a poll keeps reporting while they hold, as opposed to the
    /// plain online/offline edges the diff engine derives from online sets.
    pub fn is_detailed(&self) -> bool {
        matches!(self, Self::NotFound | Self::Denied | Self::Ambiguous)
    }

    /// The confirmed status this raw status settles to once its window elapses.
    ///
    /// Returns `None` for `Ambiguous`, which never settles.
    pub fn settles_to(&self) -> Option<ConfirmedStatus> {
        match self {
            Self::Online => Some(ConfirmedStatus::Online),
            Self::Offline | Self::Unknown | Self::NotFound | Self::Denied => {
                Some(ConfirmedStatus::Offline)
            }
            Self::Ambiguous => None,
        }
    }
}

/// The debounced, user-visible status.
///
/// `Unknown` only exists before the first promotion; afterwards an entity is
/// always either online or offline.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Default,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ConfirmedStatus {
    #[default]
    Unknown,
    Offline,
    Online,
}

impl ConfirmedStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Offline => "offline",
            Self::Online => "online",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "unknown" => Some(Self::Unknown),
            "offline" => Some(Self::Offline),
            "online" => Some(Self::Online),
            _ => None,
        }
    }

    pub fn is_online(&self) -> bool {
        matches!(self, Self::Online)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_status_kind_round_trips_through_db_strings() {
        for status in [
            StatusKind::Unknown,
            StatusKind::Offline,
            StatusKind::Online,
            StatusKind::NotFound,
            StatusKind::Denied,
            StatusKind::Ambiguous,
        ] {
            assert_eq!(StatusKind::parse(status.as_str()), Some(status));
            assert_eq!(StatusKind::from_str(&status.to_string()).unwrap(), status);
        }
        assert_eq!(StatusKind::parse("LIVE"), None);
    }

    #[test]
    fn test_settles_to_collapses_everything_but_online() {
        assert_eq!(StatusKind::Online.settles_to(), Some(ConfirmedStatus::Online));
        assert_eq!(StatusKind::NotFound.settles_to(), Some(ConfirmedStatus::Offline));
        assert_eq!(StatusKind::Denied.settles_to(), Some(ConfirmedStatus::Offline));
        assert_eq!(StatusKind::Unknown.settles_to(), Some(ConfirmedStatus::Offline));
        assert_eq!(StatusKind::Ambiguous.settles_to(), None);
    }

    #[test]
    fn test_serde_uses_snake_case() {
        let json = serde_json::to_string(&StatusKind::NotFound).unwrap();
        assert_eq!(json, "\"not_found\"");
    }
}
