use axum::{body::Body, http::Request, response::Response};
use byte_unit::{Byte, UnitType};
use lazy_static::lazy_static;
use prometheus::{self, Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry};
use tracing::Span;

lazy_static! {
    // Registry for holding metric state
    pub static ref REGISTRY: Registry = Registry::new();
    // Simple request counter
    pub static ref INCOMING_REQUESTS: IntCounterVec = IntCounterVec::new(
        Opts::new("incoming_requests", "The number of HTTP requests received"),
        &["http_method"]
    ).unwrap();
    // Request counter by status code
    pub static ref RESPONSE_CODE_COLLECTOR: IntCounterVec = IntCounterVec::new(
        Opts::new("outgoing_response", "The number of responses sent."),
        &["status_code"]
    ).unwrap();
    // Request histogram by response time
    pub static ref RESPONSE_TIME_COLLECTOR: HistogramVec = HistogramVec::new(
        HistogramOpts{
            common_opts: Opts::new("response_time", "The time taken to respond to each request"),
            buckets: prometheus::DEFAULT_BUCKETS.to_vec(), // Change buckets here if desired
        },
        &[],
    ).unwrap();
    // Dataset refreshes by outcome
    pub static ref DATASET_REFRESHES: IntCounterVec = IntCounterVec::new(
        Opts::new("dataset_refreshes", "The number of dataset refresh cycles run"),
        &["outcome"]
    ).unwrap();
}

#[cfg(target_os = "linux")]
lazy_static! {
    // Process metrics of this server, read by the memory page
    static ref PROCESS_COLLECTOR: prometheus::process_collector::ProcessCollector =
        prometheus::process_collector::ProcessCollector::for_self();
}

pub fn register_metrics() {
    REGISTRY
        .register(Box::new(INCOMING_REQUESTS.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(RESPONSE_CODE_COLLECTOR.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(RESPONSE_TIME_COLLECTOR.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(DATASET_REFRESHES.clone()))
        .unwrap();
    #[cfg(target_os = "linux")]
    REGISTRY
        .register(Box::new(
            prometheus::process_collector::ProcessCollector::for_self(),
        ))
        .unwrap();
}

pub async fn metrics_handler() -> String {
    let encoder = prometheus::TextEncoder::new();
    let mut buffer = Vec::new();

    encoder.encode(&REGISTRY.gather(), &mut buffer).unwrap();

    let output = String::from_utf8(buffer.clone()).unwrap();
    buffer.clear();

    output
}

/// Increments the prometheus counter on all incoming requests, labelled by http method
pub fn request_counter(request: &Request<Body>, _span: &Span) {
    INCOMING_REQUESTS
        .with_label_values(&[&request.method().to_string().to_ascii_uppercase()])
        .inc();
}

/// Increment the prometheus counter on all outgoing responses, labelled by status code
pub fn record_response_metrics<B>(
    response: &Response<B>,
    latency: std::time::Duration,
    _span: &Span,
) {
    RESPONSE_CODE_COLLECTOR
        .with_label_values(&[response.status().as_str()])
        .inc();

    RESPONSE_TIME_COLLECTOR
        .with_label_values(&[])
        .observe(latency.as_secs_f64());
}

/// Increment the refresh counter, labelled by whether the refresh succeeded
pub fn record_refresh(success: bool) {
    let outcome = if success { "success" } else { "failure" };
    DATASET_REFRESHES.with_label_values(&[outcome]).inc();
}

/// Resident set size of this process in bytes, where the platform reports it.
#[cfg(target_os = "linux")]
pub fn resident_memory_bytes() -> Option<u64> {
    use prometheus::core::Collector;

    PROCESS_COLLECTOR
        .collect()
        .iter()
        .find(|family| family.get_name() == "process_resident_memory_bytes")
        .and_then(|family| family.get_metric().first())
        .map(|metric| metric.get_gauge().get_value() as u64)
}

#[cfg(not(target_os = "linux"))]
pub fn resident_memory_bytes() -> Option<u64> {
    None
}

/// Format a byte count with binary units, e.g. `1.50 MiB`.
pub fn human_bytes(bytes: u64) -> String {
    let adjusted = Byte::from_u64(bytes).get_appropriate_unit(UnitType::Binary);
    format!("{:.2}", adjusted)
}

/// One-line description of the current memory use, for the operations log.
pub fn memory_summary() -> String {
    match resident_memory_bytes() {
        Some(bytes) => format!("resident memory {}", human_bytes(bytes)),
        None => "resident memory unavailable".to_string(),
    }
}
