use crate::cache::{CacheEntry, CachePaths, DatasetCache};
use crate::cli::CommandLineArgs;
use crate::error::RelayError;
use crate::metrics;
use crate::models::Dataset;
use crate::oplog::FileOperationLog;
use crate::pipeline::{Pipeline, PipelineConfig};
use crate::s3_client::ObjectStore;

use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;
use tokio::io::AsyncBufRead;

/// Lock key shared by every artifact, since a single pipeline run produces all of them.
const REFRESH_KEY: &str = "openradiation";

/// Streamed contents of a dataset, from the local cache or object storage.
pub type DatasetReader = Pin<Box<dyn AsyncBufRead + Send>>;

/// Shared application state passed to each request handler.
pub struct AppState {
    /// Command line arguments.
    pub args: CommandLineArgs,

    /// Refresh pipeline.
    pub pipeline: Pipeline,

    /// Freshness checks of cached artifacts.
    pub cache: DatasetCache,

    /// Object store, if configured.
    pub store: Option<ObjectStore>,

    /// Operations log.
    pub log: Arc<FileOperationLog>,
}

impl AppState {
    /// Create and return an [AppState].
    pub fn new(args: &CommandLineArgs) -> Self {
        let config = PipelineConfig::from_args(args);
        let log = Arc::new(FileOperationLog::new(&config.paths.log));
        let store = ObjectStore::from_args(args);
        let pipeline = Pipeline::new(config, store.clone(), log.clone());

        Self {
            args: args.clone(),
            pipeline,
            cache: DatasetCache::new(args.max_cache_age()),
            store,
            log,
        }
    }

    pub fn paths(&self) -> &CachePaths {
        self.pipeline.paths()
    }

    /// Return a fresh entry for a cached artifact, running the pipeline first if needed.
    pub async fn ensure_fresh(&self, path: &Path) -> Result<CacheEntry, RelayError> {
        self.cache
            .ensure_fresh(REFRESH_KEY, path, || self.refresh())
            .await
    }

    /// Open a cached artifact, refreshing it first if stale.
    ///
    /// The file is opened before the refresh lock is released, so a concurrent cache reset
    /// cannot remove it in between.
    pub async fn open_fresh(&self, path: &Path) -> Result<DatasetReader, RelayError> {
        self.cache
            .with_fresh(REFRESH_KEY, path, || self.refresh(), |entry| async move {
                open_local(&entry).await
            })
            .await
    }

    async fn refresh(&self) -> Result<(), RelayError> {
        let result = self.pipeline.run().await;
        metrics::record_refresh(result.is_ok());
        result.map(|_| ())
    }

    /// Open a JSON lines dataset for streaming.
    ///
    /// The local copy is refreshed if stale. The dataset is then read from object storage when
    /// configured to do so, otherwise from the local cache.
    pub async fn open_dataset(&self, dataset: Dataset) -> Result<DatasetReader, RelayError> {
        let path = self.paths().dataset(dataset);
        if self.args.stream_from_object_store {
            let store = self.store.as_ref().ok_or(RelayError::ObjectStoreNotConfigured)?;
            self.ensure_fresh(&path).await?;
            store.dataset_reader(dataset).await
        } else {
            self.open_fresh(&path).await
        }
    }

    /// Open the extracted CSV for streaming, refreshing it if stale.
    pub async fn open_csv(&self) -> Result<DatasetReader, RelayError> {
        self.open_fresh(&self.paths().extract).await
    }

    /// Delete every cached artifact. The operations log is kept.
    ///
    /// Returns the number of files removed.
    pub async fn reset_cache(&self) -> Result<usize, RelayError> {
        let removed = self
            .cache
            .reset(REFRESH_KEY, &self.paths().artifacts())
            .await?;
        tracing::info!("Cache reset: {} files removed", removed);
        Ok(removed)
    }
}

async fn open_local(entry: &CacheEntry) -> Result<DatasetReader, RelayError> {
    let file = tokio::fs::File::open(&entry.path).await?;
    Ok(Box::pin(tokio::io::BufReader::new(file)))
}

/// AppState wrapped in an Atomic Reference Count (Arc) to allow multiple references.
pub type SharedAppState = Arc<AppState>;
