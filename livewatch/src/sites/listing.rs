//! Full-listing adapter: one request returns everybody currently online.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use super::{CheckMode, CheckResults, Fetched, PayloadFormat, SiteChecker, check_single_via, fetch_json};
use crate::domain::StatusKind;
use crate::utils::client_rotator::ClientRotator;
use crate::{Error, Result};

#[derive(Debug)]
pub struct ListingAdapter {
    site: String,
    listing_url: String,
    single_url: Option<String>,
    format: PayloadFormat,
    rotator: Arc<ClientRotator>,
}

impl ListingAdapter {
    pub fn new(
        site: String,
        listing_url: String,
        single_url: Option<String>,
        format: PayloadFormat,
        rotator: Arc<ClientRotator>,
    ) -> Self {
        Self {
            site,
            listing_url,
            single_url,
            format,
            rotator,
        }
    }

    async fn fetch_listing(&self) -> Result<CheckResults> {
        let client = self.rotator.next();
        match fetch_json(&client, &self.listing_url).await? {
            Fetched::Json(value) => self.format.parse_listing(&value),
            Fetched::Status(status) => Err(Error::transport(format!(
                "listing for {} answered as {}",
                self.site, status
            ))),
        }
    }
}

#[async_trait]
impl SiteChecker for ListingAdapter {
    fn site(&self) -> &str {
        &self.site
    }

    async fn check_single(&self, id: &str) -> Result<StatusKind> {
        match &self.single_url {
            Some(template) => {
                let client = self.rotator.next();
                check_single_via(&client, template, id, &self.format).await
            }
            // Without a single-entity endpoint the listing is the only source.
            None => {
                let results = self.fetch_listing().await?;
                Ok(results
                    .statuses
                    .get(id)
                    .copied()
                    .unwrap_or(StatusKind::Offline))
            }
        }
    }

    /// The listing cannot tell "offline" from "gone", so both modes return
    /// whatever is listed; `Existence` only narrows it to the selector.
    async fn check_many(&self, selector: &[String], mode: CheckMode) -> Result<CheckResults> {
        let mut results = self.fetch_listing().await?;
        debug!(
            site = %self.site,
            listed = results.statuses.len(),
            "Fetched listing"
        );
        if mode == CheckMode::Existence {
            results.retain_selector(selector);
        }
        Ok(results)
    }

    fn uses_fixed_list(&self) -> bool {
        true
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

    #[tokio::test]
    async fn test_check_many_parses_listing() {
        let base = spawn_stub_server(vec![(
            "/online",
            200,
            r#"{"rooms":[{"id":"a","img":"a.jpg"},{"id":"b"}]}"#,
        )])
        .await;
        let adapter = ListingAdapter::new(
            "site".to_string(),
            format!("{base}/online"),
            None,
            PayloadFormat {
                list_pointer: "/rooms".to_string(),
                image_field: Some("img".to_string()),
                ..Default::default()
            },
            rotator(),
        );

        let results = adapter.check_many(&[], CheckMode::Online).await.unwrap();
        assert_eq!(results.statuses.len(), 2);
        assert_eq!(results.images["a"], "a.jpg");

        let narrowed = adapter
            .check_many(&["b".to_string(), "z".to_string()], CheckMode::Existence)
            .await
            .unwrap();
        assert_eq!(narrowed.statuses.len(), 1);
        assert_eq!(narrowed.statuses["b"], StatusKind::Online);
    }

    #[tokio::test]
    async fn test_check_single_maps_http_statuses() {
        let base = spawn_stub_server(vec![
            ("/users/gone", 404, ""),
            ("/users/private", 403, ""),
            ("/users/alice", 200, r#"{"status":"live"}"#),
            ("/users/broken", 200, "<html>"),
        ])
        .await;
        let adapter = ListingAdapter::new(
            "site".to_string(),
            format!("{base}/online"),
            Some(format!("{base}/users/{{id}}")),
            PayloadFormat::default(),
            rotator(),
        );

        assert_eq!(adapter.check_single("gone").await.unwrap(), StatusKind::NotFound);
        assert_eq!(adapter.check_single("private").await.unwrap(), StatusKind::Denied);
        assert_eq!(adapter.check_single("alice").await.unwrap(), StatusKind::Online);
        assert!(matches!(
            adapter.check_single("broken").await,
            Err(Error::Parse(_))
        ));
    }

    #[tokio::test]
    async fn test_listing_server_error_is_transport() {
        let base = spawn_stub_server(vec![("/online", 500, "oops")]).await;
        let adapter = ListingAdapter::new(
            "site".to_string(),
            format!("{base}/online"),
            None,
            PayloadFormat::default(),
            rotator(),
        );

        let err = adapter.check_many(&[], CheckMode::Online).await.unwrap_err();
        assert!(matches!(err, Error::Transport(_)));
    }
}
