//! Error handling.

use aws_sdk_s3::error::SdkError;
use aws_sdk_s3::operation::get_object::GetObjectError;
use aws_sdk_s3::operation::put_object::PutObjectError;
use aws_sdk_s3::presigning::PresigningConfigError;
use aws_smithy_types::byte_stream::error::Error as ByteStreamError;
use axum::{
    extract::rejection::QueryRejection,
    http::header,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use std::error::Error;
use thiserror::Error;
use tracing::{event, Level};

/// OpenRadiation relay error type
///
/// This type encapsulates the various errors that may occur while fetching, normalising,
/// exporting or serving the dataset.
/// Each variant may result in a different API error response.
#[derive(Debug, Error)]
pub enum RelayError {
    /// The requested dataset has not been materialised in the cache
    #[error("dataset {dataset} is not available")]
    DatasetMissing { dataset: String },

    /// Error opening or reading the archive or one of its entries
    #[error("failed to extract {member} from archive")]
    Extraction {
        member: String,
        #[source]
        source: std::io::Error,
    },

    /// The temporal filter was requested on a dataset without creation timestamps
    #[error("dataset {dataset} does not support the recent filter")]
    FilterUnsupported { dataset: String },

    /// Local cache I/O error
    #[error("cache I/O error")]
    Io(#[from] std::io::Error),

    /// A blocking task panicked or was cancelled
    #[error("background task failed")]
    Join(#[from] tokio::task::JoinError),

    /// No entry in the archive matched the expected member name
    #[error("{member} not found in archive")]
    MemberNotFound { member: String },

    /// No object store has been configured
    #[error("object storage is not configured")]
    ObjectStoreNotConfigured,

    /// Malformed delimited input
    #[error("failed to parse tabular data")]
    Parse(#[from] csv::Error),

    /// Invalid presigned URL expiry
    #[error("invalid presigned URL configuration")]
    Presigning(#[from] PresigningConfigError),

    /// Error deserialising query parameters
    #[error("request data is not valid")]
    QueryRejection(#[from] QueryRejection),

    /// Error validating query parameters
    #[error("request data is not valid")]
    RequestDataValidation(#[from] validator::ValidationErrors),

    /// Error reading object data from S3
    #[error("error receiving object from S3 storage")]
    S3ByteStream(#[from] ByteStreamError),

    /// Error while retrieving an object from S3
    #[error("error retrieving object from S3 storage")]
    S3GetObject(#[from] SdkError<GetObjectError>),

    /// Error serialising rows to JSON
    #[error("failed to serialise rows to JSON")]
    Serialization(#[from] serde_json::Error),

    /// Network failure while fetching the archive, or failure writing it to disk
    #[error("failed to transfer archive from {url}")]
    Transfer {
        url: String,
        #[source]
        source: Box<dyn Error + Send + Sync>,
    },

    /// The archive source answered with a non-success status
    #[error("archive source {url} returned HTTP status {status}")]
    TransferStatus { url: String, status: u16 },

    /// Error while storing an object in S3
    #[error("failed to upload object to S3 storage")]
    Upload(#[from] SdkError<PutObjectError>),
}

impl RelayError {
    /// Create a [RelayError::Transfer] from any underlying error.
    pub fn transfer<E>(url: &str, source: E) -> Self
    where
        E: Into<Box<dyn Error + Send + Sync>>,
    {
        RelayError::Transfer {
            url: url.to_string(),
            source: source.into(),
        }
    }

    /// Create a [RelayError::Extraction] for the given member.
    pub fn extraction(member: &str, source: std::io::Error) -> Self {
        RelayError::Extraction {
            member: member.to_string(),
            source,
        }
    }
}

impl IntoResponse for RelayError {
    /// Convert from a `RelayError` into an [axum::response::Response].
    fn into_response(self) -> Response {
        ErrorResponse::from(self).into_response()
    }
}

/// Body of error response
///
/// Implements serde (de)serialise.
#[derive(Deserialize, Serialize)]
struct ErrorBody {
    /// Main error message
    message: String,

    /// Optional list of causes
    #[serde(skip_serializing_if = "Option::is_none")]
    caused_by: Option<Vec<String>>,
}

impl ErrorBody {
    /// Return a new ErrorBody
    ///
    /// # Arguments
    ///
    /// * `error`: The error that occurred
    fn new<E>(error: &E) -> Self
    where
        E: std::error::Error + Send + Sync,
    {
        let message = error.to_string();
        let mut caused_by = None;
        let mut current = error.source();
        while let Some(source) = current {
            let mut causes: Vec<String> = caused_by.unwrap_or_default();
            causes.push(source.to_string());
            caused_by = Some(causes);
            current = source.source();
        }
        // Remove duplicate entries.
        if let Some(caused_by) = caused_by.as_mut() {
            caused_by.dedup()
        }
        ErrorBody { message, caused_by }
    }
}

/// A response to send in error cases
///
/// Implements serde (de)serialise.
#[derive(Deserialize, Serialize)]
struct ErrorResponse {
    /// HTTP status of the response
    #[serde(skip)]
    status: StatusCode,

    /// Response body
    error: ErrorBody,
}

impl ErrorResponse {
    /// Return a new ErrorResponse
    ///
    /// # Arguments
    ///
    /// * `status`: HTTP status of the response
    /// * `error`: The error that occurred. This will be formatted into a suitable `ErrorBody`
    fn new<E>(status: StatusCode, error: &E) -> Self
    where
        E: std::error::Error + Send + Sync,
    {
        ErrorResponse {
            status,
            error: ErrorBody::new(error),
        }
    }

    /// Return a 400 bad request ErrorResponse
    fn bad_request<E>(error: &E) -> Self
    where
        E: std::error::Error + Send + Sync,
    {
        Self::new(StatusCode::BAD_REQUEST, error)
    }

    /// Return a 404 not found ErrorResponse
    fn not_found<E>(error: &E) -> Self
    where
        E: std::error::Error + Send + Sync,
    {
        Self::new(StatusCode::NOT_FOUND, error)
    }

    /// Return a 500 internal server error ErrorResponse
    fn internal_server_error<E>(error: &E) -> Self
    where
        E: std::error::Error + Send + Sync,
    {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, error)
    }
}

impl From<RelayError> for ErrorResponse {
    /// Convert from a `RelayError` into an `ErrorResponse`.
    fn from(error: RelayError) -> Self {
        let response = match &error {
            // Bad request
            RelayError::FilterUnsupported { dataset: _ }
            | RelayError::Presigning(_)
            | RelayError::QueryRejection(_)
            | RelayError::RequestDataValidation(_) => Self::bad_request(&error),

            // Not found
            RelayError::DatasetMissing { dataset: _ } | RelayError::ObjectStoreNotConfigured => {
                Self::not_found(&error)
            }

            // Internal server error
            RelayError::Extraction {
                member: _,
                source: _,
            }
            | RelayError::Io(_)
            | RelayError::Join(_)
            | RelayError::MemberNotFound { member: _ }
            | RelayError::Parse(_)
            | RelayError::S3ByteStream(_)
            | RelayError::Serialization(_)
            | RelayError::Transfer { url: _, source: _ }
            | RelayError::TransferStatus { url: _, status: _ }
            | RelayError::Upload(_) => Self::internal_server_error(&error),

            RelayError::S3GetObject(sdk_error) => match sdk_error {
                // This is a more specific ServiceError variant, with GetObjectError as the
                // inner error.
                SdkError::ServiceError(get_obj_error) => match get_obj_error.err() {
                    GetObjectError::NoSuchKey(_) => Self::not_found(&error),
                    _ => Self::internal_server_error(&error),
                },
                _ => Self::internal_server_error(&error),
            },
        };

        // Log server errors.
        if response.status.is_server_error() {
            event!(Level::ERROR, "{}", error.to_string());
            let mut current = error.source();
            while let Some(source) = current {
                event!(Level::ERROR, "Caused by: {}", source.to_string());
                current = source.source();
            }
        }

        response
    }
}

impl IntoResponse for ErrorResponse {
    /// Convert from an `ErrorResponse` into an `axum::response::Response`.
    ///
    /// Renders the response as JSON.
    fn into_response(self) -> Response {
        let json_body = serde_json::to_string_pretty(&self);
        match json_body {
            Err(err) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to serialise error response: {}", err),
            )
                .into_response(),
            Ok(json_body) => (
                self.status,
                [(&header::CONTENT_TYPE, mime::APPLICATION_JSON.to_string())],
                json_body,
            )
                .into_response(),
        }
    }
}
