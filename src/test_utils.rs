use crate::cli::CommandLineArgs;
use crate::models::UnifiedRecord;

use axum::{response::Response, Router};
use std::net::SocketAddr;
use std::path::Path;

/// Create a UnifiedRecord with only the report ID set.
pub(crate) fn record(id: &str) -> UnifiedRecord {
    UnifiedRecord {
        report_uuid: Some(id.to_string()),
        ..Default::default()
    }
}

/// Build an in-memory gzip tar archive from (path, content) pairs.
pub(crate) fn tar_gz(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    let mut builder = tar::Builder::new(encoder);
    for (path, content) in entries {
        let mut header = tar::Header::new_gnu();
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, path, *content).unwrap();
    }
    builder.into_inner().unwrap().finish().unwrap()
}

/// Serve a router on an ephemeral local port and return its base URL.
pub(crate) async fn serve(router: Router) -> String {
    let addr = SocketAddr::from(([127, 0, 0, 1], 0));
    let server = axum::Server::bind(&addr).serve(router.into_make_service());
    let addr = server.local_addr();
    tokio::spawn(server);
    format!("http://{}", addr)
}

// Jump through the hoops to get the body as a string.
pub(crate) async fn body_string(response: Response) -> String {
    String::from_utf8(
        hyper::body::to_bytes(response.into_body())
            .await
            .unwrap()
            .to_vec(),
    )
    .unwrap()
}

/// Create a CommandLineArgs object for a local cache with no object store.
pub(crate) fn test_args(cache_dir: &Path, source_url: &str) -> CommandLineArgs {
    CommandLineArgs {
        host: "127.0.0.1".to_string(),
        port: 8080,
        https: false,
        cert_file: "~/.config/openradiation-relay/certs/cert.pem".to_string(),
        key_file: "~/.config/openradiation-relay/certs/key.pem".to_string(),
        graceful_shutdown_timeout: 60,
        enable_jaeger: false,
        source_url: source_url.to_string(),
        member_name: "measurements.csv".to_string(),
        delimiter: b';',
        cache_dir: cache_dir.display().to_string(),
        max_cache_age: 24 * 60 * 60,
        s3_endpoint: None,
        s3_bucket: None,
        s3_prefix: "data".to_string(),
        aws_region: "us-east-1".to_string(),
        aws_access_key_id: None,
        aws_secret_access_key: None,
        stream_from_object_store: false,
        presign_expiry: 3600,
        csv_chunk_lines: 1000,
        refresh_only: false,
    }
}

/// A semicolon-delimited feed with one record per year.
pub(crate) const FEED_CSV: &str = "\
reportUuid;deviceUuid;apparatusId;apparatusTubeType;value;rain;flightId;windowSeat;dateAndTimeOfCreation
r2023; DEV-1 ;X1;SBM-20;0.10;;;;2023-03-01T10:00:00.000Z
r2025;dev-1;x1;;0.30;1;12;true;2025-06-01T10:00:00.000Z
r2024;\"Dev-2\";;;0.20;0;12.0;;2024-09-01 08:30:00
";
