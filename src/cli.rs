//! Command Line Interface (CLI) arguments.

use clap::Parser;
use expanduser::expanduser;
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

/// OpenRadiation relay command line interface
#[derive(Clone, Debug, Parser)]
pub struct CommandLineArgs {
    /// The IP address on which the server should listen
    #[arg(long, default_value = "0.0.0.0", env = "OPENRADIATION_HOST")]
    pub host: String,
    /// The port to which the server should bind
    #[arg(long, default_value_t = 8080, env = "OPENRADIATION_PORT")]
    pub port: u16,
    /// Flag indicating whether HTTPS should be used
    #[arg(long, default_value_t = false, env = "OPENRADIATION_HTTPS")]
    pub https: bool,
    /// Path to the certificate file to be used for HTTPS encryption
    #[arg(
        long,
        default_value = "~/.config/openradiation-relay/certs/cert.pem",
        env = "OPENRADIATION_CERT_FILE"
    )]
    pub cert_file: String,
    /// Path to the key file to be used for HTTPS encryption
    #[arg(
        long,
        default_value = "~/.config/openradiation-relay/certs/key.pem",
        env = "OPENRADIATION_KEY_FILE"
    )]
    pub key_file: String,
    /// Maximum time in seconds to wait for operations to complete upon receiving `ctrl+c` signal.
    #[arg(long, default_value_t = 60, env = "OPENRADIATION_SHUTDOWN_TIMEOUT")]
    pub graceful_shutdown_timeout: u64,
    /// Whether to enable sending traces to Jaeger.
    #[arg(long, default_value_t = false, env = "OPENRADIATION_ENABLE_JAEGER")]
    pub enable_jaeger: bool,
    /// URL of the gzip tar archive containing the dataset
    #[arg(
        long,
        default_value = "https://request.openradiation.net/openradiation_dataset.tar.gz",
        env = "OPENRADIATION_SOURCE_URL"
    )]
    pub source_url: String,
    /// Suffix of the archive entry holding the measurements
    #[arg(long, default_value = "measurements.csv", env = "OPENRADIATION_MEMBER_NAME")]
    pub member_name: String,
    /// Field separator of the measurements file
    #[arg(long, default_value = ";", value_parser = parse_delimiter, env = "OPENRADIATION_DELIMITER")]
    pub delimiter: u8,
    /// Directory holding the downloaded archive and the dataset exports
    #[arg(
        long,
        default_value = "~/.cache/openradiation-relay",
        env = "OPENRADIATION_CACHE_DIR"
    )]
    pub cache_dir: String,
    /// Time in seconds after which cached datasets are refreshed
    #[arg(long, default_value_t = 24 * 60 * 60, env = "OPENRADIATION_MAX_CACHE_AGE")]
    pub max_cache_age: u64,
    /// Object storage API URL. The AWS endpoint for the region is used if unset
    #[arg(long, env = "OPENRADIATION_S3_ENDPOINT")]
    pub s3_endpoint: Option<Url>,
    /// Bucket to publish datasets to. Object storage is disabled if unset
    #[arg(long, env = "S3_BUCKET_NAME")]
    pub s3_bucket: Option<String>,
    /// Key prefix of published datasets
    #[arg(long, default_value = "data", env = "OPENRADIATION_S3_PREFIX")]
    pub s3_prefix: String,
    /// Object storage region
    #[arg(long, default_value = "us-east-1", env = "AWS_REGION")]
    pub aws_region: String,
    /// Object storage access key
    #[arg(long, env = "AWS_ACCESS_KEY_ID", hide_env_values = true)]
    pub aws_access_key_id: Option<String>,
    /// Object storage secret key
    #[arg(long, env = "AWS_SECRET_ACCESS_KEY", hide_env_values = true)]
    pub aws_secret_access_key: Option<String>,
    /// Whether to stream JSON datasets from object storage rather than the local cache
    #[arg(long, default_value_t = false, env = "OPENRADIATION_STREAM_FROM_OBJECT_STORE")]
    pub stream_from_object_store: bool,
    /// Default validity in seconds of presigned download URLs
    #[arg(long, default_value_t = 3600, env = "OPENRADIATION_PRESIGN_EXPIRY")]
    pub presign_expiry: u64,
    /// Number of data lines per chunk of a streamed CSV response
    #[arg(long, default_value_t = 1000, env = "OPENRADIATION_CSV_CHUNK_LINES")]
    pub csv_chunk_lines: usize,
    /// Run a single refresh of every dataset and exit without serving
    #[arg(long, default_value_t = false)]
    pub refresh_only: bool,
}

impl CommandLineArgs {
    /// Absolute cache directory, with `~` expanded.
    pub fn cache_dir_path(&self) -> PathBuf {
        expanduser(&self.cache_dir)
            .expect("Failed to expand ~ to user name. Please provide an absolute path instead.")
    }

    pub fn max_cache_age(&self) -> Duration {
        Duration::from_secs(self.max_cache_age)
    }
}

/// Parse a single-byte ASCII field separator.
fn parse_delimiter(value: &str) -> Result<u8, String> {
    match value.as_bytes() {
        [byte] if byte.is_ascii() => Ok(*byte),
        _ => Err(format!(
            "delimiter must be a single ASCII character, got {:?}",
            value
        )),
    }
}

/// Returns parsed command line arguments.
pub fn parse() -> CommandLineArgs {
    CommandLineArgs::parse()
}
