#![allow(dead_code)]

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;

use livewatch::domain::StatusKind;
use livewatch::sites::{CheckMode, CheckResults, SiteChecker};
use livewatch::{Error, Result};

/// Checker whose answers are set by the test between cycles.
pub struct FakeSite {
    name: String,
    fixed_list: bool,
    answers: Mutex<HashMap<String, StatusKind>>,
}

impl FakeSite {
    pub fn new(name: &str, fixed_list: bool) -> Self {
        Self {
            name: name.to_string(),
            fixed_list,
            answers: Mutex::new(HashMap::new()),
        }
    }

    pub fn answer(&self, entries: &[(&str, StatusKind)]) {
        *self.answers.lock() = entries
            .iter()
            .map(|(id, status)| (id.to_string(), *status))
            .collect();
    }
}

#[async_trait]
impl SiteChecker for FakeSite {
    fn site(&self) -> &str {
        &self.name
    }

    async fn check_single(&self, id: &str) -> Result<StatusKind> {
        let status = self.answers.lock().get(id).copied();
        status.ok_or_else(|| Error::transport(format!("no answer for {id}")))
    }

    async fn check_many(&self, selector: &[String], mode: CheckMode) -> Result<CheckResults> {
        let mut results = CheckResults {
            statuses: self.answers.lock().clone(),
            images: HashMap::new(),
        };
        if mode == CheckMode::Existence {
            results.retain_selector(selector);
        }
        Ok(results)
    }

    fn uses_fixed_list(&self) -> bool {
        self.fixed_list
    }
}

pub fn sqlite_url(path: &std::path::Path) -> String {
    format!(
        "sqlite:{}?mode=rwc",
        path.to_string_lossy().replace('\\', "/")
    )
}
