//! JSON payload interpretation shared by the generic adapters.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use super::CheckResults;
use crate::domain::StatusKind;
use crate::{Error, Result};

/// Where ids, statuses and images live inside an upstream payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PayloadFormat {
    /// JSON pointer to the array of entries in a listing; empty for the root.
    pub list_pointer: String,
    /// Field holding an entry's id (string or number).
    pub id_field: String,
    /// Field holding an entry's status. Without one, every listed entry is online.
    pub status_field: Option<String>,
    pub image_field: Option<String>,
    /// JSON pointer to the status in a single-entity response.
    pub single_status_pointer: String,
    /// Extra status strings, merged over the built-in table.
    pub statuses: HashMap<String, StatusKind>,
}

impl Default for PayloadFormat {
    fn default() -> Self {
        Self {
            list_pointer: String::new(),
            id_field: "id".to_string(),
            status_field: None,
            image_field: None,
            single_status_pointer: "/status".to_string(),
            statuses: HashMap::new(),
        }
    }
}

fn builtin_status(s: &str) -> Option<StatusKind> {
    let status = match s {
        "online" | "live" | "public" | "on" => StatusKind::Online,
        "offline" | "off" | "idle" => StatusKind::Offline,
        "not_found" | "notfound" | "deleted" | "banned" | "suspended" => StatusKind::NotFound,
        "denied" | "private" | "password" | "restricted" => StatusKind::Denied,
        "unknown" => StatusKind::Unknown,
        "ambiguous" | "away" => StatusKind::Ambiguous,
        _ => return None,
    };
    Some(status)
}

impl PayloadFormat {
    /// Interpret a status value.
    ///
    /// Booleans map to online/offline, strings go through the status table,
    /// and anything unrecognised is reported as ambiguous.
    pub fn status_of(&self, value: &Value) -> StatusKind {
        match value {
            Value::Bool(true) => StatusKind::Online,
            Value::Bool(false) => StatusKind::Offline,
            Value::Null => StatusKind::Unknown,
            Value::String(s) => {
                let normalized = s.trim().to_ascii_lowercase();
                self.statuses
                    .get(&normalized)
                    .copied()
                    .or_else(|| builtin_status(&normalized))
                    .unwrap_or_else(|| {
                        debug!(status = %s, "Unrecognised status string");
                        StatusKind::Ambiguous
                    })
            }
            _ => StatusKind::Ambiguous,
        }
    }

    /// Parse a listing payload into statuses and images keyed by id.
    pub fn parse_listing(&self, payload: &Value) -> Result<CheckResults> {
        let entries = payload
            .pointer(&self.list_pointer)
            .and_then(Value::as_array)
            .ok_or_else(|| {
                Error::parse(format!(
                    "expected an array at '{}' in listing payload",
                    self.list_pointer
                ))
            })?;

        let mut results = CheckResults::default();
        for entry in entries {
            let Some(id) = entry.get(&self.id_field).and_then(id_string) else {
                debug!(field = %self.id_field, "Skipping listing entry without id");
                continue;
            };

            let status = match &self.status_field {
                Some(field) => self.status_of(entry.get(field).unwrap_or(&Value::Null)),
                None => StatusKind::Online,
            };

            if let Some(image) = self
                .image_field
                .as_ref()
                .and_then(|field| entry.get(field))
                .and_then(Value::as_str)
            {
                results.images.insert(id.clone(), image.to_string());
            }
            results.statuses.insert(id, status);
        }

        Ok(results)
    }

    /// Parse a single-entity payload.
    pub fn parse_single(&self, payload: &Value) -> Result<StatusKind> {
        payload
            .pointer(&self.single_status_pointer)
            .map(|value| self.status_of(value))
            .ok_or_else(|| {
                Error::parse(format!(
                    "no status at '{}' in single-entity payload",
                    self.single_status_pointer
                ))
            })
    }
}

fn id_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_listing_without_status_field_marks_online() {
        let format = PayloadFormat {
            list_pointer: "/data/rooms".to_string(),
            id_field: "username".to_string(),
            image_field: Some("thumb".to_string()),
            ..Default::default()
        };
        let payload = json!({
            "data": {
                "rooms": [
                    {"username": "alice", "thumb": "https://img/alice.jpg"},
                    {"username": "bob"},
                    {"nickname": "no-id"}
                ]
            }
        });

        let results = format.parse_listing(&payload).unwrap();
        assert_eq!(results.statuses.len(), 2);
        assert_eq!(results.statuses["alice"], StatusKind::Online);
        assert_eq!(results.statuses["bob"], StatusKind::Online);
        assert_eq!(results.images["alice"], "https://img/alice.jpg");
        assert!(!results.images.contains_key("bob"));
    }

    #[test]
    fn test_parse_listing_with_status_field_and_numeric_ids() {
        let format = PayloadFormat {
            status_field: Some("state".to_string()),
            statuses: HashMap::from([("group_show".to_string(), StatusKind::Denied)]),
            ..Default::default()
        };
        let payload = json!([
            {"id": 1, "state": "Live"},
            {"id": 2, "state": "group_show"},
            {"id": 3, "state": "something new"},
            {"id": 4, "state": false}
        ]);

        let results = format.parse_listing(&payload).unwrap();
        assert_eq!(results.statuses["1"], StatusKind::Online);
        assert_eq!(results.statuses["2"], StatusKind::Denied);
        assert_eq!(results.statuses["3"], StatusKind::Ambiguous);
        assert_eq!(results.statuses["4"], StatusKind::Offline);
    }

    #[test]
    fn test_parse_listing_rejects_non_array() {
        let format = PayloadFormat::default();
        let err = format.parse_listing(&json!({"rooms": []})).unwrap_err();
        assert!(matches!(err, Error::Parse(_)));
    }

    #[test]
    fn test_parse_single() {
        let format = PayloadFormat {
            single_status_pointer: "/user/online".to_string(),
            ..Default::default()
        };

        let status = format
            .parse_single(&json!({"user": {"online": true, "avatar": "a.png"}}))
            .unwrap();
        assert_eq!(status, StatusKind::Online);

        assert!(matches!(
            format.parse_single(&json!({"user": {}})),
            Err(Error::Parse(_))
        ));
    }
}
