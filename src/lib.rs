//! This crate provides a relay for the public
//! [OpenRadiation](https://www.openradiation.org) dataset of crowd-sourced environmental
//! radiation measurements.
//!
//! The relay periodically downloads the published archive, converts the measurements to
//! line-delimited JSON, partitions them into measurement, device, apparatus and flight tables,
//! and publishes every dataset to an S3-compatible object store. Cached datasets are served over
//! HTTP as streamed responses, with an optional filter on recent measurements.
//!
//! The relay is built on top of a number of open source components.
//!
//! * [Tokio](tokio), the most popular asynchronous Rust runtime.
//! * [Axum](axum) web framework, built by the Tokio team, on top of the [hyper] HTTP library.
//! * [reqwest] downloads the archive, which is unpacked with [tar] and [flate2].
//! * [csv] and [Serde](serde) read and write the tabular data.
//! * [AWS SDK for S3](aws-sdk-s3) is used to interact with S3-compatible object stores.

#![recursion_limit = "256"]

pub mod app;
pub mod app_state;
pub mod cache;
pub mod cli;
pub mod error;
pub mod export;
pub mod fetcher;
pub mod loader;
pub mod metrics;
pub mod models;
pub mod normalize;
pub mod oplog;
pub mod pipeline;
pub mod s3_client;
pub mod server;
pub mod streaming;
#[cfg(test)]
pub mod test_utils;
pub mod tracing;
pub mod validated_query;
