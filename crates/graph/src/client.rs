//! Graph API client.
//!
//! Async HTTP client using `reqwest`. Every request carries a bearer token
//! from the configured [`TokenProvider`]; metadata calls retry under the
//! metadata budget of the [`RetryPolicy`].

use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use spfetch_transfer::{
    BoxFuture, ChunkSource, EngineConfig, MetadataSource, OperationClass, RetryConfig, RetryError,
    RetryPolicy, SourceError, SourceOpener, TokenProvider, run_with_retry,
};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::DEFAULT_BASE_URL;
use crate::error::{GraphError, error_body, parse_retry_after};
use crate::source::HttpChunkSource;
use crate::types::{DriveItem, ItemLocator, ListedItem, Page, Site, encode_path, normalize_path};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Graph API client scoped to SharePoint sites and their default drive.
#[derive(Clone)]
pub struct GraphClient {
    http: reqwest::Client,
    base_url: String,
    token: Arc<dyn TokenProvider>,
    policy: RetryPolicy,
    request_timeout: Duration,
    cancel: CancellationToken,
}

impl GraphClient {
    pub fn new(token: Arc<dyn TokenProvider>) -> Result<Self, GraphError> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("spfetch/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(CONNECT_TIMEOUT)
            .build()?;
        let defaults = EngineConfig::default();

        Ok(Self {
            http,
            base_url: DEFAULT_BASE_URL.to_string(),
            token,
            policy: RetryPolicy::new(defaults.retry),
            request_timeout: defaults.io_timeout(),
            cancel: CancellationToken::new(),
        })
    }

    /// Points the client at another Graph endpoint (national clouds, tests).
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.policy = RetryPolicy::new(retry);
        self
    }

    /// Takes the retry budgets and per-request timeout from an engine config.
    pub fn with_config(mut self, config: &EngineConfig) -> Self {
        self.policy = RetryPolicy::new(config.retry);
        self.request_timeout = config.io_timeout();
        self
    }

    /// Cancels in-flight metadata calls and their backoff waits.
    pub fn with_cancel_token(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Resolves a server-provided `@odata.nextLink`.
    ///
    /// Links off the base URL's origin are refused; the bearer token only
    /// goes to the configured endpoint.
    fn next_link(&self, link: &str) -> Result<String, GraphError> {
        let base = reqwest::Url::parse(&self.base_url)
            .map_err(|e| GraphError::Protocol(format!("invalid base URL {}: {e}", self.base_url)))?;
        let next = base
            .join(link)
            .map_err(|e| GraphError::Protocol(format!("invalid nextLink {link}: {e}")))?;
        if next.origin() != base.origin() {
            return Err(GraphError::Protocol(format!(
                "nextLink leaves {}: {next}",
                base.origin().ascii_serialization()
            )));
        }
        Ok(next.to_string())
    }

    /// Performs one authenticated GET and decodes the JSON body.
    async fn get_once<T: DeserializeOwned>(&self, url: &str) -> Result<T, GraphError> {
        let token = self.token.token().await?;
        let resp = self
            .http
            .get(url)
            .bearer_auth(token)
            .timeout(self.request_timeout)
            .send()
            .await?;
        let status = resp.status();

        if !status.is_success() {
            let retry_after = parse_retry_after(resp.headers());
            let body = error_body(resp).await;
            return Err(GraphError::Api {
                status: status.as_u16(),
                body,
                retry_after,
            });
        }

        let body = resp.bytes().await?;
        Ok(serde_json::from_slice(&body)?)
    }

    /// GET with the metadata retry budget.
    async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T, GraphError> {
        let result = run_with_retry(
            &self.policy,
            OperationClass::Metadata,
            &self.cancel,
            GraphError::failure,
            move || self.get_once::<T>(url),
        )
        .await;
        match result {
            Ok(value) => Ok(value),
            Err(RetryError::Cancelled) => Err(GraphError::Cancelled),
            Err(RetryError::Exhausted { attempts, last, .. }) if attempts > 1 => {
                Err(GraphError::Exhausted {
                    attempts,
                    source: Box::new(last),
                })
            }
            Err(RetryError::Exhausted { last, .. }) => Err(last),
        }
    }

    /// Looks up a site by hostname and server-relative path (`/sites/team`).
    pub async fn site(&self, hostname: &str, site_path: &str) -> Result<Site, GraphError> {
        let hostname = hostname.trim();
        if hostname.is_empty() {
            return Err(GraphError::Protocol("hostname is empty".into()));
        }
        let site_path = normalize_path(site_path);
        let path = if site_path == "/" {
            format!("/sites/{hostname}")
        } else {
            format!("/sites/{hostname}:{}", encode_path(&site_path))
        };
        let site: Site = self.get_json(&self.url(&path)).await?;
        debug!(hostname, site_path = %site_path, site_id = %site.id, "resolved site");
        Ok(site)
    }

    pub async fn site_id(&self, hostname: &str, site_path: &str) -> Result<String, GraphError> {
        Ok(self.site(hostname, site_path).await?.id)
    }

    /// Returns drive item metadata for `file_path` in the site's default drive.
    pub async fn item(&self, site_id: &str, file_path: &str) -> Result<DriveItem, GraphError> {
        self.item_at(&ItemLocator::new(site_id, file_path)).await
    }

    pub async fn item_at(&self, locator: &ItemLocator) -> Result<DriveItem, GraphError> {
        self.get_json(&self.url(&locator.item_path())).await
    }

    /// Lists a folder, following `@odata.nextLink` until the last page.
    pub async fn children(&self, locator: &ItemLocator) -> Result<Vec<DriveItem>, GraphError> {
        let mut url = self.url(&locator.children_path());
        let mut items = Vec::new();
        let mut pages = 0u32;
        loop {
            let page: Page<DriveItem> = self.get_json(&url).await?;
            pages += 1;
            items.extend(page.value);
            let Some(link) = page.next_link else { break };
            let next = self.next_link(&link)?;
            if next == url {
                return Err(GraphError::Protocol(format!(
                    "nextLink repeats the current page: {next}"
                )));
            }
            url = next;
        }
        debug!(folder = %locator, items = items.len(), pages, "listed folder");
        Ok(items)
    }

    /// Lists `folder_path` in the site identified by hostname and site path.
    pub async fn ls(
        &self,
        hostname: &str,
        site_path: &str,
        folder_path: &str,
    ) -> Result<Vec<ListedItem>, GraphError> {
        let site_id = self.site_id(hostname, site_path).await?;
        let items = self
            .children(&ItemLocator::new(site_id, folder_path))
            .await?;
        Ok(items.into_iter().map(ListedItem::from).collect())
    }

    /// Ranged reader over the item's content.
    pub fn chunk_source(&self, locator: &ItemLocator) -> HttpChunkSource {
        HttpChunkSource::new(
            self.http.clone(),
            self.url(&locator.content_path()),
            self.token.clone(),
        )
    }
}

/// Single attempt; the session applies the metadata budget.
impl MetadataSource for GraphClient {
    fn resolve_size<'a>(
        &'a self,
        object_id: &'a str,
    ) -> BoxFuture<'a, Result<Option<u64>, SourceError>> {
        Box::pin(async move {
            let locator = ItemLocator::from_object_id(object_id)?;
            let item: DriveItem = self.get_once(&self.url(&locator.item_path())).await?;
            if item.is_folder() {
                return Err(SourceError::Permanent(format!("{locator} is a folder")));
            }
            Ok(item.size)
        })
    }
}

impl SourceOpener for GraphClient {
    fn open(&self, object_id: &str) -> Result<Box<dyn ChunkSource>, SourceError> {
        let locator = ItemLocator::from_object_id(object_id)?;
        Ok(Box::new(self.chunk_source(&locator)))
    }
}
