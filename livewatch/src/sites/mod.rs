//! Site adapters.
//!
//! Every upstream source is reached through a [`SiteChecker`]. The shipped
//! adapters are driven entirely by configuration: a full-listing adapter that
//! downloads everything currently online, and a selective adapter that asks
//! about an explicit set of ids.

mod listing;
mod payload;
mod selective;

pub use listing::ListingAdapter;
pub use payload::PayloadFormat;
pub use selective::SelectiveAdapter;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::config::SiteConfig;
use crate::domain::StatusKind;
use crate::utils::client_rotator::ClientRotator;
use crate::{Error, Result};

/// What a multi-entity query should establish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckMode {
    /// Who is online right now.
    Online,
    /// Whether each id in the selector still exists; absent ids are not found.
    Existence,
}

/// Statuses and images reported by one query, keyed by entity id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CheckResults {
    pub statuses: HashMap<String, StatusKind>,
    pub images: HashMap<String, String>,
}

impl CheckResults {
    pub fn online_ids(&self) -> impl Iterator<Item = &String> {
        self.statuses
            .iter()
            .filter(|(_, status)| status.is_online())
            .map(|(id, _)| id)
    }

    /// Keep only the entries for ids in `selector`.
    pub fn retain_selector(&mut self, selector: &[String]) {
        self.statuses.retain(|id, _| selector.contains(id));
        self.images.retain(|id, _| selector.contains(id));
    }
}

/// Kind of adapter configured for a site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SiteKind {
    Listing,
    Selective,
}

/// Source adapter contract.
#[async_trait]
pub trait SiteChecker: Send + Sync + 'static {
    fn site(&self) -> &str;

    /// Query the status of one entity.
    async fn check_single(&self, id: &str) -> Result<StatusKind>;

    /// Query many entities at once. A failure covers the whole query.
    async fn check_many(&self, selector: &[String], mode: CheckMode) -> Result<CheckResults>;

    /// Full-listing checkers fetch everything online without a selector.
    fn uses_fixed_list(&self) -> bool;
}

/// The configured adapter for one site.
#[derive(Debug)]
pub enum SiteAdapter {
    Listing(ListingAdapter),
    Selective(SelectiveAdapter),
}

impl SiteAdapter {
    pub fn from_config(config: &SiteConfig, rotator: Arc<ClientRotator>) -> Result<Self> {
        let adapter = match config.kind {
            SiteKind::Listing => {
                let listing_url = config.listing_url.clone().ok_or_else(|| {
                    Error::config(format!("site {} needs a listing_url", config.name))
                })?;
                Self::Listing(ListingAdapter::new(
                    config.name.clone(),
                    listing_url,
                    config.single_url.clone(),
                    config.format.clone(),
                    rotator,
                ))
            }
            SiteKind::Selective => {
                if config.many_url.is_none() && config.single_url.is_none() {
                    return Err(Error::config(format!(
                        "site {} needs a many_url or a single_url",
                        config.name
                    )));
                }
                Self::Selective(SelectiveAdapter::new(
                    config.name.clone(),
                    config.many_url.clone(),
                    config.single_url.clone(),
                    config.batch_size,
                    config.format.clone(),
                    rotator,
                ))
            }
        };
        Ok(adapter)
    }
}

#[async_trait]
impl SiteChecker for SiteAdapter {
    fn site(&self) -> &str {
        match self {
            Self::Listing(a) => a.site(),
            Self::Selective(a) => a.site(),
        }
    }

    async fn check_single(&self, id: &str) -> Result<StatusKind> {
        match self {
            Self::Listing(a) => a.check_single(id).await,
            Self::Selective(a) => a.check_single(id).await,
        }
    }

    async fn check_many(&self, selector: &[String], mode: CheckMode) -> Result<CheckResults> {
        match self {
            Self::Listing(a) => a.check_many(selector, mode).await,
            Self::Selective(a) => a.check_many(selector, mode).await,
        }
    }

    fn uses_fixed_list(&self) -> bool {
        match self {
            Self::Listing(a) => a.uses_fixed_list(),
            Self::Selective(a) => a.uses_fixed_list(),
        }
    }
}

/// Result of an HTTP fetch before payload interpretation.
#[derive(Debug)]
pub(crate) enum Fetched {
    Json(Value),
    /// The HTTP status alone decides the entity status.
    Status(StatusKind),
}

/// GET `url` and decode the body as JSON.
///
/// 404/410 mean the entity does not exist and 401/403 that it is not
/// visible to us. Any other non-success status is a transport failure.
pub(crate) async fn fetch_json(client: &reqwest::Client, url: &str) -> Result<Fetched> {
    let response = client.get(url).send().await?;
    let status = response.status();

    match status.as_u16() {
        404 | 410 => return Ok(Fetched::Status(StatusKind::NotFound)),
        401 | 403 => return Ok(Fetched::Status(StatusKind::Denied)),
        _ if !status.is_success() => {
            return Err(Error::transport(format!("{url} returned HTTP {status}")));
        }
        _ => {}
    }

    let body = response.text().await?;
    match serde_json::from_str(&body) {
        Ok(value) => Ok(Fetched::Json(value)),
        Err(e) => {
            debug!(url = %url, payload = %body, "Unparseable upstream payload");
            Err(Error::parse(format!("{url}: {e}")))
        }
    }
}

/// Substitute `{id}` in a URL template.
pub(crate) fn single_url(template: &str, id: &str) -> String {
    template.replace("{id}", id)
}

/// Query one entity through a single-entity endpoint.
pub(crate) async fn check_single_via(
    client: &reqwest::Client,
    template: &str,
    id: &str,
    format: &PayloadFormat,
) -> Result<StatusKind> {
    match fetch_json(client, &single_url(template, id)).await? {
        Fetched::Status(status) => Ok(status),
        Fetched::Json(value) => format.parse_single(&value),
    }
}
