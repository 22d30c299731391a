//! One refresh cycle of the relay: download, extract, convert, partition and publish.

use crate::cache::CachePaths;
use crate::cli::CommandLineArgs;
use crate::error::RelayError;
use crate::export::{upload_json_lines, write_json_lines};
use crate::fetcher::{download_archive, extract_member};
use crate::loader::{read_csv, read_json_lines};
use crate::metrics;
use crate::models::Dataset;
use crate::normalize::{
    apparatus_table, devices_table, flights_table, measurements_table, sort_by_creation_desc,
};
use crate::oplog::OperationLog;
use crate::s3_client::ObjectStore;

use serde::Serialize;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use url::Url;

/// File name used for the archive when the source URL has no usable last segment.
const DEFAULT_ARCHIVE_NAME: &str = "openradiation_dataset.tar.gz";

/// Datasets derived from the feed.
const TABLES: [Dataset; 4] = [
    Dataset::Measurements,
    Dataset::Devices,
    Dataset::Apparatus,
    Dataset::Flights,
];

/// Where the pipeline reads the dataset from and writes its outputs to.
#[derive(Clone, Debug)]
pub struct PipelineConfig {
    pub source_url: String,
    pub member_name: String,
    pub delimiter: u8,
    pub paths: CachePaths,
}

impl PipelineConfig {
    pub fn from_args(args: &CommandLineArgs) -> Self {
        let member_file = Path::new(&args.member_name)
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| args.member_name.clone());
        Self {
            source_url: args.source_url.clone(),
            member_name: args.member_name.clone(),
            delimiter: args.delimiter,
            paths: CachePaths::new(
                &args.cache_dir_path(),
                &archive_name(&args.source_url),
                &member_file,
            ),
        }
    }
}

/// Last path segment of the source URL.
fn archive_name(source_url: &str) -> String {
    Url::parse(source_url)
        .ok()
        .and_then(|url| {
            url.path_segments()
                .and_then(|mut segments| segments.next_back().map(str::to_string))
        })
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| DEFAULT_ARCHIVE_NAME.to_string())
}

/// Row counts of the datasets written by a refresh.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct RefreshSummary {
    pub feed: usize,
    pub measurements: usize,
    pub devices: usize,
    pub apparatus: usize,
    pub flights: usize,
}

/// Refresh pipeline.
///
/// Stages are recorded in the operations log. Blocking and CPU-bound stages run on the tokio
/// blocking pool.
pub struct Pipeline {
    config: PipelineConfig,
    http: reqwest::Client,
    store: Option<ObjectStore>,
    log: Arc<dyn OperationLog>,
}

impl Pipeline {
    /// Create and return a [Pipeline].
    ///
    /// # Arguments
    ///
    /// * `config`: Source and cache layout
    /// * `store`: Object store to publish to, if any
    /// * `log`: Operations log
    pub fn new(
        config: PipelineConfig,
        store: Option<ObjectStore>,
        log: Arc<dyn OperationLog>,
    ) -> Self {
        Self {
            config,
            http: reqwest::Client::new(),
            store,
            log,
        }
    }

    pub fn paths(&self) -> &CachePaths {
        &self.config.paths
    }

    /// Refresh the feed and rebuild every table.
    #[tracing::instrument(level = "INFO", skip(self))]
    pub async fn run(&self) -> Result<RefreshSummary, RelayError> {
        let started = Instant::now();
        self.log.record("Refresh started");
        let result = async {
            self.refresh_feed().await?;
            self.build_tables().await
        }
        .await;
        match &result {
            Ok(summary) => self.log.record(&format!(
                "Refresh complete in {:.1}s: {} records, {} measurements, {} devices, {} apparatus, {} flights ({})",
                started.elapsed().as_secs_f64(),
                summary.feed,
                summary.measurements,
                summary.devices,
                summary.apparatus,
                summary.flights,
                metrics::memory_summary(),
            )),
            Err(err) => self.log.record(&format!("Refresh failed: {}", err)),
        }
        result
    }

    /// Download the archive, extract the measurements and write them newest first as the feed.
    ///
    /// Returns the number of records in the feed.
    pub async fn refresh_feed(&self) -> Result<usize, RelayError> {
        let paths = &self.config.paths;
        self.log
            .record(&format!("Downloading {}", self.config.source_url));
        let size = download_archive(&self.http, &self.config.source_url, &paths.archive).await?;
        self.log.record(&format!(
            "Download complete: {} bytes ({})",
            size,
            metrics::memory_summary()
        ));

        let archive = paths.archive.clone();
        let extract = paths.extract.clone();
        let feed_path = paths.dataset(Dataset::Feed);
        let member = self.config.member_name.clone();
        let delimiter = self.config.delimiter;
        let log = self.log.clone();
        let count = tokio::task::spawn_blocking(move || -> Result<usize, RelayError> {
            let extracted = extract_member(&archive, &member, &extract)?;
            log.record(&format!("Extracted {}: {} bytes", member, extracted));
            let mut records = read_csv(BufReader::new(File::open(&extract)?), delimiter)?;
            sort_by_creation_desc(&mut records);
            let count = write_json_lines(&records, &feed_path)?;
            log.record(&format!(
                "Feed written: {} records ({})",
                count,
                metrics::memory_summary()
            ));
            Ok(count)
        })
        .await??;

        self.upload(Dataset::Feed).await?;
        Ok(count)
    }

    /// Read the feed back and write each derived table.
    pub async fn build_tables(&self) -> Result<RefreshSummary, RelayError> {
        let paths = self.config.paths.clone();
        let log = self.log.clone();
        let summary = tokio::task::spawn_blocking(move || -> Result<RefreshSummary, RelayError> {
            let feed = File::open(paths.dataset(Dataset::Feed))?;
            let records = read_json_lines(BufReader::new(feed))?;
            log.record(&format!(
                "Feed loaded: {} records ({})",
                records.len(),
                metrics::memory_summary()
            ));
            let summary = RefreshSummary {
                feed: records.len(),
                measurements: write_json_lines(
                    &measurements_table(&records),
                    &paths.dataset(Dataset::Measurements),
                )?,
                devices: write_json_lines(
                    &devices_table(&records),
                    &paths.dataset(Dataset::Devices),
                )?,
                apparatus: write_json_lines(
                    &apparatus_table(&records),
                    &paths.dataset(Dataset::Apparatus),
                )?,
                flights: write_json_lines(
                    &flights_table(&records),
                    &paths.dataset(Dataset::Flights),
                )?,
            };
            log.record("Tables written");
            Ok(summary)
        })
        .await??;

        for dataset in TABLES {
            self.upload(dataset).await?;
        }
        Ok(summary)
    }

    async fn upload(&self, dataset: Dataset) -> Result<(), RelayError> {
        if let Some(store) = &self.store {
            upload_json_lines(store, dataset, &self.config.paths.dataset(dataset)).await?;
            self.log
                .record(&format!("Uploaded {}", store.object_key(dataset)));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oplog::MemoryOperationLog;
    use crate::s3_client::{S3Client, S3Credentials};
    use crate::test_utils::{serve, tar_gz, test_args, FEED_CSV};

    use axum::{
        http::StatusCode,
        routing::{get, put},
        Router,
    };
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn archive_router() -> Router {
        let archive = tar_gz(&[("export/measurements.csv", FEED_CSV.as_bytes())]);
        Router::new().route(
            "/openradiation_dataset.tar.gz",
            get(move || async move { archive }),
        )
    }

    fn make_pipeline(
        dir: &Path,
        base: &str,
        store: Option<ObjectStore>,
    ) -> (Pipeline, Arc<MemoryOperationLog>) {
        let args = test_args(dir, &format!("{}/openradiation_dataset.tar.gz", base));
        let log = Arc::new(MemoryOperationLog::new());
        let pipeline = Pipeline::new(PipelineConfig::from_args(&args), store, log.clone());
        (pipeline, log)
    }

    fn report_ids(path: &Path) -> Vec<String> {
        read_json_lines(BufReader::new(File::open(path).unwrap()))
            .unwrap()
            .into_iter()
            .map(|r| r.report_uuid.unwrap())
            .collect()
    }

    #[test]
    fn archive_names() {
        assert_eq!(
            "openradiation_dataset.tar.gz",
            archive_name("https://request.openradiation.net/openradiation_dataset.tar.gz")
        );
        assert_eq!("dump.tgz", archive_name("http://localhost:8000/a/b/dump.tgz?x=1"));
        assert_eq!(DEFAULT_ARCHIVE_NAME, archive_name("http://localhost:8000/"));
        assert_eq!(DEFAULT_ARCHIVE_NAME, archive_name("not a url"));
    }

    #[test]
    fn config_from_args() {
        let dir = tempfile::tempdir().unwrap();
        let mut args = test_args(dir.path(), "http://localhost/data/dump.tar.gz");
        args.member_name = "export/measurements.csv".to_string();
        let config = PipelineConfig::from_args(&args);
        assert_eq!(dir.path().join("dump.tar.gz"), config.paths.archive);
        assert_eq!(dir.path().join("measurements.csv"), config.paths.extract);
        assert_eq!("export/measurements.csv", config.member_name);
        assert_eq!(b';', config.delimiter);
    }

    #[tokio::test]
    async fn run_writes_every_dataset() {
        let base = serve(archive_router()).await;
        let dir = tempfile::tempdir().unwrap();
        let (pipeline, log) = make_pipeline(dir.path(), &base, None);

        let summary = pipeline.run().await.unwrap();
        assert_eq!(
            RefreshSummary {
                feed: 3,
                measurements: 3,
                devices: 2,
                apparatus: 1,
                flights: 1,
            },
            summary
        );

        let paths = pipeline.paths();
        for path in paths.artifacts() {
            assert!(path.exists(), "missing {}", path.display());
        }
        // Newest first.
        assert_eq!(
            vec!["r2025", "r2024", "r2023"],
            report_ids(&paths.dataset(Dataset::Feed))
        );
        let devices = std::fs::read_to_string(paths.dataset(Dataset::Devices)).unwrap();
        assert!(devices.contains("\"deviceUuid\":\"dev-1\""));
        assert!(devices.contains("\"deviceUuid\":\"dev-2\""));

        let messages = log.messages();
        assert_eq!("Refresh started", messages[0]);
        assert!(messages.iter().any(|m| m.starts_with("Extracted measurements.csv")));
        assert!(messages.last().unwrap().starts_with("Refresh complete"));
        assert!(!messages.iter().any(|m| m.starts_with("Uploaded")));
    }

    #[tokio::test]
    async fn run_uploads_when_store_configured() {
        let puts = Arc::new(AtomicUsize::new(0));
        let counter = puts.clone();
        let router = archive_router().route(
            "/relay/data/:file",
            put(move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                StatusCode::OK
            }),
        );
        let base = serve(router).await;
        let store = ObjectStore::new(
            S3Client::new(
                Some(&Url::parse(&base).unwrap()),
                "us-east-1",
                S3Credentials::access_key("user", "password"),
            ),
            "relay",
            "data",
        );
        let dir = tempfile::tempdir().unwrap();
        let (pipeline, log) = make_pipeline(dir.path(), &base, Some(store));

        pipeline.run().await.unwrap();
        assert_eq!(5, puts.load(Ordering::SeqCst));
        let messages = log.messages();
        assert!(messages.contains(&"Uploaded data/openradiation.jsonl".to_string()));
        assert!(messages.contains(&"Uploaded data/flights.jsonl".to_string()));
    }

    #[tokio::test]
    async fn run_fails_on_missing_archive() {
        let base = serve(Router::new()).await;
        let dir = tempfile::tempdir().unwrap();
        let (pipeline, log) = make_pipeline(dir.path(), &base, None);

        let result = pipeline.run().await;
        assert!(matches!(
            result,
            Err(RelayError::TransferStatus { status: 404, .. })
        ));
        assert!(!pipeline.paths().dataset(Dataset::Feed).exists());
        assert!(log.messages().last().unwrap().starts_with("Refresh failed"));
    }

    #[tokio::test]
    async fn run_fails_on_missing_member() {
        let archive = tar_gz(&[("export/other.csv", b"a;b\n".as_slice())]);
        let router = Router::new().route(
            "/openradiation_dataset.tar.gz",
            get(move || async move { archive }),
        );
        let base = serve(router).await;
        let dir = tempfile::tempdir().unwrap();
        let (pipeline, _) = make_pipeline(dir.path(), &base, None);

        let result = pipeline.run().await;
        assert!(matches!(result, Err(RelayError::MemberNotFound { .. })));
    }

    #[tokio::test]
    async fn build_tables_from_existing_feed() {
        let dir = tempfile::tempdir().unwrap();
        let (pipeline, _) = make_pipeline(dir.path(), "http://localhost", None);
        std::fs::write(
            pipeline.paths().dataset(Dataset::Feed),
            concat!(
                r#"{"reportUuid":"a","apparatusId":"'Z9'","flightId":"7"}"#,
                "\n",
                "garbage\n",
                r#"{"reportUuid":"b","apparatusId":"z9","storm":true}"#,
                "\n",
            ),
        )
        .unwrap();

        let summary = pipeline.build_tables().await.unwrap();
        assert_eq!(2, summary.feed);
        assert_eq!(2, summary.measurements);
        assert_eq!(0, summary.devices);
        assert_eq!(1, summary.apparatus);
        assert_eq!(1, summary.flights);
        assert_eq!(
            vec!["a", "b"],
            report_ids(&pipeline.paths().dataset(Dataset::Measurements))
        );
    }

    #[tokio::test]
    async fn build_tables_without_feed() {
        let dir = tempfile::tempdir().unwrap();
        let (pipeline, _) = make_pipeline(dir.path(), "http://localhost", None);
        let result = pipeline.build_tables().await;
        assert!(matches!(result, Err(RelayError::Io(_))));
    }
}
