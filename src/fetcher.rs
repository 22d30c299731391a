//! Archive download and member extraction.

use crate::cache::staging_path;
use crate::error::RelayError;

use flate2::read::GzDecoder;
use futures_util::StreamExt;
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Write};
use std::path::Path;
use tokio::io::AsyncWriteExt;

/// Download an archive to `dest`, streaming the body to disk.
///
/// The body is written to a staging file which is renamed over `dest` once complete, so a
/// failed transfer leaves any previous copy of `dest` in place.
///
/// Returns the number of bytes written.
///
/// # Arguments
///
/// * `client`: HTTP client
/// * `url`: Location of the archive
/// * `dest`: Path to store the archive at
#[tracing::instrument(level = "DEBUG", skip(client))]
pub async fn download_archive(
    client: &reqwest::Client,
    url: &str,
    dest: &Path,
) -> Result<u64, RelayError> {
    let response = client
        .get(url)
        .send()
        .await
        .map_err(|err| RelayError::transfer(url, err))?;
    if !response.status().is_success() {
        return Err(RelayError::TransferStatus {
            url: url.to_string(),
            status: response.status().as_u16(),
        });
    }

    let staging = staging_path(dest);
    let result = write_body(response, &staging, url).await;
    match result {
        Ok(written) => {
            tokio::fs::rename(&staging, dest)
                .await
                .map_err(|err| RelayError::transfer(url, err))?;
            tracing::debug!("Downloaded {} bytes from {}", written, url);
            Ok(written)
        }
        Err(err) => {
            // The staging file may not exist if creating it failed.
            let _ = tokio::fs::remove_file(&staging).await;
            Err(err)
        }
    }
}

async fn write_body(
    response: reqwest::Response,
    staging: &Path,
    url: &str,
) -> Result<u64, RelayError> {
    let mut file = tokio::fs::File::create(staging)
        .await
        .map_err(|err| RelayError::transfer(url, err))?;
    let mut written: u64 = 0;
    let mut body = response.bytes_stream();
    while let Some(chunk) = body.next().await {
        let chunk = chunk.map_err(|err| RelayError::transfer(url, err))?;
        file.write_all(&chunk)
            .await
            .map_err(|err| RelayError::transfer(url, err))?;
        written += chunk.len() as u64;
    }
    file.flush()
        .await
        .map_err(|err| RelayError::transfer(url, err))?;
    Ok(written)
}

/// Extract the first entry of a gzip tar archive whose path ends with `member`.
///
/// The entry is written to a staging file and renamed over `dest`. Nothing is written when no
/// entry matches.
///
/// Returns the number of bytes extracted.
///
/// # Arguments
///
/// * `archive`: Path to the `.tar.gz` archive
/// * `member`: Suffix of the entry to extract, e.g. `measurements.csv`
/// * `dest`: Path to store the extracted entry at
pub fn extract_member(archive: &Path, member: &str, dest: &Path) -> Result<u64, RelayError> {
    let file = File::open(archive).map_err(|err| RelayError::extraction(member, err))?;
    let mut archive = tar::Archive::new(GzDecoder::new(BufReader::new(file)));
    let entries = archive
        .entries()
        .map_err(|err| RelayError::extraction(member, err))?;
    for entry in entries {
        let mut entry = entry.map_err(|err| RelayError::extraction(member, err))?;
        let matches = entry
            .path()
            .map(|path| path.to_string_lossy().ends_with(member))
            .map_err(|err| RelayError::extraction(member, err))?;
        if !matches {
            continue;
        }
        let staging = staging_path(dest);
        return match copy_entry(&mut entry, &staging) {
            Ok(copied) => {
                std::fs::rename(&staging, dest)?;
                Ok(copied)
            }
            Err(err) => {
                let _ = std::fs::remove_file(&staging);
                Err(RelayError::extraction(member, err))
            }
        };
    }
    Err(RelayError::MemberNotFound {
        member: member.to_string(),
    })
}

fn copy_entry<R: io::Read>(entry: &mut R, staging: &Path) -> io::Result<u64> {
    let mut writer = BufWriter::new(File::create(staging)?);
    let copied = io::copy(entry, &mut writer)?;
    writer.flush()?;
    Ok(copied)
}
