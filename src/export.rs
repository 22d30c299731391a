//! Line-delimited JSON export and upload.

use crate::cache::staging_path;
use crate::error::RelayError;
use crate::models::Dataset;
use crate::s3_client::ObjectStore;

use serde::Serialize;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

/// Write rows as line-delimited JSON, one object per row in order.
///
/// The file is fully written to a staging path before being renamed over `path`, so readers
/// never observe a partial export.
///
/// Returns the number of rows written.
pub fn write_json_lines<T: Serialize>(rows: &[T], path: &Path) -> Result<usize, RelayError> {
    let staging = staging_path(path);
    match write_rows(rows, &staging) {
        Ok(()) => {
            std::fs::rename(&staging, path)?;
            Ok(rows.len())
        }
        Err(err) => {
            let _ = std::fs::remove_file(&staging);
            Err(err)
        }
    }
}

fn write_rows<T: Serialize>(rows: &[T], staging: &Path) -> Result<(), RelayError> {
    let file = File::create(staging).map_err(serde_json::Error::io)?;
    let mut writer = BufWriter::new(file);
    for row in rows {
        serde_json::to_writer(&mut writer, row)?;
        writer.write_all(b"\n").map_err(serde_json::Error::io)?;
    }
    writer.flush().map_err(serde_json::Error::io)?;
    Ok(())
}

/// Upload a finished export with a single whole-object put.
///
/// There is no retry; failures propagate to the caller.
#[tracing::instrument(level = "DEBUG", skip(store))]
pub async fn upload_json_lines(
    store: &ObjectStore,
    dataset: Dataset,
    path: &Path,
) -> Result<(), RelayError> {
    store.put_dataset(dataset, path).await
}
