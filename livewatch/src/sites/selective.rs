//! Selective adapter: asks about an explicit set of ids.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use super::{CheckMode, CheckResults, Fetched, PayloadFormat, SiteChecker, check_single_via, fetch_json};
use crate::domain::StatusKind;
use crate::utils::client_rotator::ClientRotator;
use crate::{Error, Result};

#[derive(Debug)]
pub struct SelectiveAdapter {
    site: String,
    /// URL template with `{ids}`, replaced by a comma-separated batch.
    many_url: Option<String>,
    /// URL template with `{id}`.
    single_url: Option<String>,
    batch_size: usize,
    format: PayloadFormat,
    rotator: Arc<ClientRotator>,
}

impl SelectiveAdapter {
    pub fn new(
        site: String,
        many_url: Option<String>,
        single_url: Option<String>,
        batch_size: usize,
        format: PayloadFormat,
        rotator: Arc<ClientRotator>,
    ) -> Self {
        Self {
            site,
            many_url,
            single_url,
            batch_size: batch_size.max(1),
            format,
            rotator,
        }
    }

    async fn fetch_batch(&self, template: &str, batch: &[String]) -> Result<CheckResults> {
        let url = template.replace("{ids}", &batch.join(","));
        let client = self.rotator.next();
        match fetch_json(&client, &url).await? {
            Fetched::Json(value) => self.format.parse_listing(&value),
            Fetched::Status(status) => Err(Error::transport(format!(
                "batch query for {} answered as {}",
                self.site, status
            ))),
        }
    }
}

#[async_trait]
impl SiteChecker for SelectiveAdapter {
    fn site(&self) -> &str {
        &self.site
    }

    async fn check_single(&self, id: &str) -> Result<StatusKind> {
        if let Some(template) = &self.single_url {
            let client = self.rotator.next();
            return check_single_via(&client, template, id, &self.format).await;
        }

        let template = self
            .many_url
            .as_deref()
            .ok_or_else(|| Error::config(format!("site {} has no query URL", self.site)))?;
        let results = self.fetch_batch(template, &[id.to_string()]).await?;
        Ok(results
            .statuses
            .get(id)
            .copied()
            .unwrap_or(StatusKind::NotFound))
    }

    async fn check_many(&self, selector: &[String], mode: CheckMode) -> Result<CheckResults> {
        let mut results = CheckResults::default();

        match &self.many_url {
            Some(template) => {
                for batch in selector.chunks(self.batch_size) {
                    let part = self.fetch_batch(template, batch).await?;
                    results.statuses.extend(part.statuses);
                    results.images.extend(part.images);
                }
            }
            None => {
                for id in selector {
                    let status = self.check_single(id).await?;
                    results.statuses.insert(id.clone(), status);
                }
            }
        }
        results.retain_selector(selector);

        if mode == CheckMode::Existence {
            for id in selector {
                results
                    .statuses
                    .entry(id.clone())
                    .or_insert(StatusKind::NotFound);
            }
        }

        debug!(
            site = %self.site,
            asked = selector.len(),
            answered = results.statuses.len(),
            "Selective query finished"
        );
        Ok(results)
    }

    fn uses_fixed_list(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sites::test_server::spawn_stub_server;
    use crate::utils::http_client::HttpClientSettings;

    fn rotator() -> Arc<ClientRotator> {
        Arc::new(ClientRotator::from_addresses(&HttpClientSettings::default(), &[]).unwrap())
    }

    fn adapter(base: &str, batch_size: usize) -> SelectiveAdapter {
        SelectiveAdapter::new(
            "site".to_string(),
            Some(format!("{base}/status?ids={{ids}}")),
            None,
            batch_size,
            PayloadFormat {
                status_field: Some("status".to_string()),
                ..Default::default()
            },
            rotator(),
        )
    }

    #[tokio::test]
    async fn test_existence_marks_absent_ids_not_found() {
        let base = spawn_stub_server(vec![(
            "/status?ids=a,b,c",
            200,
            r#"[{"id":"a","status":"online"},{"id":"b","status":"offline"},{"id":"x","status":"online"}]"#,
        )])
        .await;
        let adapter = adapter(&base, 10);
        let selector = vec!["a".to_string(), "b".to_string(), "c".to_string()];

        let results = adapter
            .check_many(&selector, CheckMode::Existence)
            .await
            .unwrap();
        assert_eq!(results.statuses.len(), 3);
        assert_eq!(results.statuses["a"], StatusKind::Online);
        assert_eq!(results.statuses["b"], StatusKind::Offline);
        assert_eq!(results.statuses["c"], StatusKind::NotFound);
    }

    #[tokio::test]
    async fn test_batches_and_online_mode() {
        let base = spawn_stub_server(vec![
            ("/status?ids=a,b", 200, r#"[{"id":"a","status":"online"}]"#),
            ("/status?ids=c", 200, r#"[{"id":"c","status":"private"}]"#),
        ])
        .await;
        let adapter = adapter(&base, 2);
        let selector = vec!["a".to_string(), "b".to_string(), "c".to_string()];

        let results = adapter.check_many(&selector, CheckMode::Online).await.unwrap();
        assert_eq!(results.statuses.len(), 2);
        assert_eq!(results.statuses["a"], StatusKind::Online);
        assert_eq!(results.statuses["c"], StatusKind::Denied);
        assert!(!results.statuses.contains_key("b"));
    }

    #[tokio::test]
    async fn test_failed_batch_fails_whole_query() {
        let base = spawn_stub_server(vec![
            ("/status?ids=a", 200, r#"[{"id":"a","status":"online"}]"#),
            ("/status?ids=b", 502, ""),
        ])
        .await;
        let adapter = adapter(&base, 1);
        let selector = vec!["a".to_string(), "b".to_string()];

        let err = adapter
            .check_many(&selector, CheckMode::Online)
            .await
            .unwrap_err();
        assert!(err.is_upstream());
    }
}
