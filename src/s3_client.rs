//! A simplified S3 client that supports whole-object uploads, streamed downloads and presigned
//! URLs. It attempts to hide the complexities of working with the AWS SDK for S3.

use crate::cli::CommandLineArgs;
use crate::error::RelayError;
use crate::models::Dataset;

use aws_credential_types::Credentials;
use aws_sdk_s3::config::BehaviorVersion;
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use aws_types::region::Region;
use std::path::Path;
use std::pin::Pin;
use std::time::Duration;
use tokio::io::AsyncBufRead;
use tracing::Instrument;
use url::Url;

/// Content type of uploaded datasets.
const JSON_LINES_CONTENT_TYPE: &str = "application/x-ndjson";

/// Streamed body of a downloaded object.
pub type ObjectReader = Pin<Box<dyn AsyncBufRead + Send>>;

#[derive(Clone, Eq, PartialEq)]
pub enum S3Credentials {
    AccessKey {
        access_key: String,
        secret_key: String,
    },
    None,
}

impl S3Credentials {
    /// Create an access key credential.
    pub fn access_key(access_key: &str, secret_key: &str) -> Self {
        S3Credentials::AccessKey {
            access_key: access_key.to_string(),
            secret_key: secret_key.to_string(),
        }
    }
}

/// S3 client object.
///
/// The underlying [aws_sdk_s3::Client] is relatively expensive to create, so one is built at
/// startup and cloned where needed.
#[derive(Clone)]
pub struct S3Client {
    /// Underlying AWS SDK S3 client object.
    client: Client,
}

impl S3Client {
    /// Creates an S3Client object
    ///
    /// # Arguments
    ///
    /// * `endpoint`: Optional object storage API URL. The AWS endpoint for `region` is used if
    ///   unset
    /// * `region`: Object storage region
    /// * `credentials`: Object storage account credentials
    pub fn new(endpoint: Option<&Url>, region: &str, credentials: S3Credentials) -> Self {
        let builder = aws_sdk_s3::Config::builder().behavior_version(BehaviorVersion::latest());
        let builder = match credentials {
            S3Credentials::AccessKey {
                access_key,
                secret_key,
            } => {
                let credentials = Credentials::from_keys(access_key, secret_key, None);
                builder.credentials_provider(credentials)
            }
            S3Credentials::None => builder,
        };
        let builder = builder.region(Some(Region::new(region.to_string())));
        let builder = match endpoint {
            Some(url) => builder.endpoint_url(url.to_string()).force_path_style(true),
            None => builder,
        };
        Self {
            client: Client::from_conf(builder.build()),
        }
    }

    /// Uploads a local file as a single object, replacing any existing object.
    ///
    /// # Arguments
    ///
    /// * `bucket`: Name of the bucket
    /// * `key`: Name of the object in the bucket
    /// * `path`: Local file to upload
    pub async fn upload_object(
        &self,
        bucket: &str,
        key: &str,
        path: &Path,
    ) -> Result<(), RelayError> {
        let body = ByteStream::from_path(path).await?;
        self.client
            .put_object()
            .bucket(bucket)
            .key(key)
            .content_type(JSON_LINES_CONTENT_TYPE)
            .body(body)
            .send()
            .instrument(tracing::Span::current())
            .await?;
        Ok(())
    }

    /// Starts downloading an object and returns a reader over its body.
    ///
    /// The body is fetched from object storage as the reader is consumed.
    ///
    /// # Arguments
    ///
    /// * `bucket`: Name of the bucket
    /// * `key`: Name of the object in the bucket
    pub async fn object_reader(&self, bucket: &str, key: &str) -> Result<ObjectReader, RelayError> {
        let response = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .send()
            .instrument(tracing::Span::current())
            .await?;
        Ok(Box::pin(response.body.into_async_read()))
    }

    /// Returns a presigned GET URL for an object.
    ///
    /// No request is made to object storage.
    ///
    /// # Arguments
    ///
    /// * `bucket`: Name of the bucket
    /// * `key`: Name of the object in the bucket
    /// * `expires_in`: Validity of the URL, at most one week
    pub async fn presigned_url(
        &self,
        bucket: &str,
        key: &str,
        expires_in: Duration,
    ) -> Result<String, RelayError> {
        let config = PresigningConfig::expires_in(expires_in)?;
        let request = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .presigned(config)
            .await?;
        Ok(request.uri().to_string())
    }
}

/// The bucket and key prefix under which datasets are published.
#[derive(Clone)]
pub struct ObjectStore {
    client: S3Client,
    bucket: String,
    prefix: String,
}

impl ObjectStore {
    /// Create and return an [crate::s3_client::ObjectStore].
    ///
    /// # Arguments
    ///
    /// * `client`: S3 client
    /// * `bucket`: Name of the bucket
    /// * `prefix`: Key prefix, e.g. `data`. May be empty
    pub fn new(client: S3Client, bucket: &str, prefix: &str) -> Self {
        Self {
            client,
            bucket: bucket.to_string(),
            prefix: prefix.trim_matches('/').to_string(),
        }
    }

    /// Build the object store described by the command line, if a bucket is configured.
    pub fn from_args(args: &CommandLineArgs) -> Option<Self> {
        let bucket = args.s3_bucket.as_deref()?;
        let credentials = match (&args.aws_access_key_id, &args.aws_secret_access_key) {
            (Some(access_key), Some(secret_key)) => S3Credentials::access_key(access_key, secret_key),
            _ => S3Credentials::None,
        };
        let client = S3Client::new(args.s3_endpoint.as_ref(), &args.aws_region, credentials);
        Some(Self::new(client, bucket, &args.s3_prefix))
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Key of a dataset's object, e.g. `data/devices.jsonl`.
    pub fn object_key(&self, dataset: Dataset) -> String {
        if self.prefix.is_empty() {
            dataset.file_name()
        } else {
            format!("{}/{}", self.prefix, dataset.file_name())
        }
    }

    /// Upload a dataset export.
    pub async fn put_dataset(&self, dataset: Dataset, path: &Path) -> Result<(), RelayError> {
        let key = self.object_key(dataset);
        tracing::info!("Uploading {} to s3://{}/{}", path.display(), self.bucket, key);
        self.client.upload_object(&self.bucket, &key, path).await
    }

    /// Open a dataset's object for streaming.
    pub async fn dataset_reader(&self, dataset: Dataset) -> Result<ObjectReader, RelayError> {
        self.client
            .object_reader(&self.bucket, &self.object_key(dataset))
            .await
    }

    /// Presigned GET URL for a dataset's object.
    pub async fn presign_dataset(
        &self,
        dataset: Dataset,
        expires_in: Duration,
    ) -> Result<String, RelayError> {
        self.client
            .presigned_url(&self.bucket, &self.object_key(dataset), expires_in)
            .await
    }
}
