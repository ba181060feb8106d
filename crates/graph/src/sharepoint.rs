//! One-call downloads from SharePoint document libraries.

use std::sync::Arc;

use bytes::Bytes;
use spfetch_transfer::{
    EngineConfig, LogReporter, ProgressReporter, SinkFactory, TokenProvider, TransferReport,
    TransferSession, TransferSpec,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use crate::client::GraphClient;
use crate::error::GraphError;
use crate::types::{ItemLocator, ListedItem};

/// Resolves items through [`GraphClient`] and streams them into any
/// destination the [`SinkFactory`] can open.
pub struct SharePointClient {
    graph: GraphClient,
    config: EngineConfig,
    sinks: SinkFactory,
    reporter: Option<Arc<dyn ProgressReporter>>,
    cancel: CancellationToken,
}

impl SharePointClient {
    pub fn new(token: Arc<dyn TokenProvider>, config: EngineConfig) -> Result<Self, GraphError> {
        config.validate()?;
        let cancel = CancellationToken::new();
        let graph = GraphClient::new(token)?
            .with_config(&config)
            .with_cancel_token(cancel.clone());
        Ok(Self {
            graph,
            config,
            sinks: SinkFactory::new(),
            reporter: None,
            cancel,
        })
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.graph = self.graph.with_base_url(url);
        self
    }

    /// Replaces the default factory, e.g. to register object-store backends.
    pub fn with_sink_factory(mut self, sinks: SinkFactory) -> Self {
        self.sinks = sinks;
        self
    }

    /// Progress sink for every session. Defaults to a [`LogReporter`] per download.
    pub fn with_reporter(mut self, reporter: Arc<dyn ProgressReporter>) -> Self {
        self.reporter = Some(reporter);
        self
    }

    pub fn graph(&self) -> &GraphClient {
        &self.graph
    }

    pub fn sinks(&self) -> &SinkFactory {
        &self.sinks
    }

    /// Cancelling this token stops metadata calls and every session this client prepared.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub async fn ls(
        &self,
        hostname: &str,
        site_path: &str,
        folder_path: &str,
    ) -> Result<Vec<ListedItem>, GraphError> {
        self.graph.ls(hostname, site_path, folder_path).await
    }

    /// Resolves the item and builds a session without starting it.
    ///
    /// Callers that want to watch state or cancel one download take the
    /// session's handles before running it.
    pub async fn prepare(
        &self,
        hostname: &str,
        site_path: &str,
        file_path: &str,
        destination: &str,
    ) -> Result<TransferSession, GraphError> {
        let site_id = self.graph.site_id(hostname, site_path).await?;
        let locator = ItemLocator::new(site_id, file_path);
        let item = self.graph.item_at(&locator).await?;
        if item.is_folder() {
            return Err(GraphError::Protocol(format!(
                "{} is a folder",
                locator.path()
            )));
        }

        let mut spec = TransferSpec::new(locator.object_id(), destination, &self.config)?
            .with_total_size(item.size);
        match item.sha256() {
            Some(digest) if digest.len() == 64 && digest.chars().all(|c| c.is_ascii_hexdigit()) => {
                spec = spec.with_expected_sha256(digest);
            }
            Some(digest) => debug!(item = %locator.path(), digest, "ignoring malformed sha256Hash"),
            None => {}
        }

        let reporter: Arc<dyn ProgressReporter> = match &self.reporter {
            Some(reporter) => reporter.clone(),
            None => Arc::new(LogReporter::new(
                item.name.clone(),
                self.config.progress_interval(),
            )),
        };
        let session = TransferSession::new(spec, self.config.clone())?
            .with_reporter(reporter)
            .with_parent_token(&self.cancel);
        info!(
            session = %session.id(),
            item = %locator.path(),
            size = ?item.size,
            destination,
            "prepared download"
        );
        Ok(session)
    }

    /// Downloads `file_path` to `destination` (`file://`, `memory://`, `s3://`, ...).
    pub async fn download(
        &self,
        hostname: &str,
        site_path: &str,
        file_path: &str,
        destination: &str,
    ) -> Result<TransferReport, GraphError> {
        let session = self
            .prepare(hostname, site_path, file_path, destination)
            .await?;
        Ok(session.run(&self.graph, &self.graph, &self.sinks).await?)
    }

    /// Downloads a small file and returns its bytes.
    pub async fn download_to_memory(
        &self,
        hostname: &str,
        site_path: &str,
        file_path: &str,
    ) -> Result<Bytes, GraphError> {
        let name = format!("download-{}", Uuid::new_v4().simple());
        self.download(hostname, site_path, file_path, &format!("memory://{name}"))
            .await?;
        self.sinks
            .memory_store()
            .take(&name)
            .ok_or_else(|| GraphError::Protocol(format!("memory://{name} was not published")))
    }
}
