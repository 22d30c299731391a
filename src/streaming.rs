//! Lazy response bodies for cached datasets.
//!
//! Both functions take ownership of an async buffered reader, either a local file or the body
//! of an object store response, and read from it only as the body is polled. Dropping the
//! stream releases the reader.

use crate::models::{parse_timestamp, CREATION_TIME_FIELD};

use bytes::Bytes;
use futures_util::{future, stream, Stream, StreamExt};
use serde_json::Value;
use std::io;
use time::{OffsetDateTime, UtcOffset};
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio_stream::wrappers::LinesStream;

/// Window of accepted creation years for the recent filter: the latest year and the one before.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct YearWindow {
    latest: i32,
}

/// What to do with one line of a filtered dataset.
#[derive(Debug, PartialEq)]
enum Verdict {
    Emit,
    Skip,
    Stop,
}

impl YearWindow {
    /// Window ending at `latest`.
    pub fn new(latest: i32) -> Self {
        Self { latest }
    }

    /// Window ending at the current UTC year.
    pub fn current() -> Self {
        Self::new(OffsetDateTime::now_utc().year())
    }

    pub fn contains(&self, year: i32) -> bool {
        year == self.latest || year == self.latest - 1
    }

    fn classify(&self, line: &str) -> Verdict {
        match creation_year(line) {
            Some(year) if self.contains(year) => Verdict::Emit,
            Some(_) => Verdict::Stop,
            None => Verdict::Skip,
        }
    }
}

/// UTC year of a JSON record's creation timestamp.
///
/// The timestamp may be a string in one of the formats accepted by [parse_timestamp] or a number
/// of milliseconds since the Unix epoch. The year is taken in UTC, matching the instant order
/// the feed is sorted in.
fn creation_year(line: &str) -> Option<i32> {
    let value: Value = serde_json::from_str(line).ok()?;
    let timestamp = match value.get(CREATION_TIME_FIELD)? {
        Value::String(s) => parse_timestamp(s)?,
        Value::Number(n) => {
            let millis = n.as_i64()?;
            OffsetDateTime::from_unix_timestamp_nanos(i128::from(millis) * 1_000_000).ok()?
        }
        _ => return None,
    };
    Some(timestamp.to_offset(UtcOffset::UTC).year())
}

/// Stream a JSON lines dataset, one newline-terminated record per item.
///
/// Blank lines are dropped. With a `filter`, records outside the window end the stream at the
/// first occurrence and records without a usable creation timestamp are skipped; the dataset is
/// expected to be sorted newest first. Read errors are passed through and terminate the body.
///
/// # Arguments
///
/// * `reader`: Source of the dataset
/// * `filter`: Optional recent filter
pub fn json_lines<R>(reader: R, filter: Option<YearWindow>) -> impl Stream<Item = io::Result<Bytes>>
where
    R: AsyncBufRead + Send + Unpin + 'static,
{
    LinesStream::new(reader.lines())
        .map(move |line| {
            let verdict = match (&line, filter) {
                (Ok(text), _) if text.trim().is_empty() => Verdict::Skip,
                (Ok(text), Some(window)) => window.classify(text),
                _ => Verdict::Emit,
            };
            (verdict, line)
        })
        .take_while(|(verdict, _)| future::ready(*verdict != Verdict::Stop))
        .filter_map(|(verdict, line)| {
            future::ready(match verdict {
                Verdict::Emit => Some(line.map(|mut text| {
                    text.push('\n');
                    Bytes::from(text)
                })),
                Verdict::Skip | Verdict::Stop => None,
            })
        })
}

/// Stream a delimited text file in chunks of lines.
///
/// The header line is emitted alone as the first chunk, followed by chunks of up to
/// `chunk_lines` data lines. Every line is newline-terminated.
pub fn csv_chunks<R>(reader: R, chunk_lines: usize) -> impl Stream<Item = io::Result<Bytes>>
where
    R: AsyncBufRead + Send + Unpin + 'static,
{
    let chunk_lines = chunk_lines.max(1);
    stream::unfold(Some((reader.lines(), 1)), move |state| async move {
        let (mut lines, limit) = state?;
        let mut chunk = String::new();
        let mut count = 0;
        while count < limit {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    chunk.push_str(&line);
                    chunk.push('\n');
                    count += 1;
                }
                Ok(None) => break,
                Err(err) => return Some((Err(err), None)),
            }
        }
        if count == 0 {
            return None;
        }
        // A short chunk means the reader is exhausted.
        let next = (count == limit).then_some((lines, chunk_lines));
        Some((Ok(Bytes::from(chunk)), next))
    })
}
