//! Prometheus metrics for the daemon

use once_cell::sync::Lazy;
use prometheus::{
    register_counter, register_counter_vec, register_gauge, register_histogram, Counter,
    CounterVec, Encoder, Gauge, Histogram, TextEncoder,
};

// ── Transport metrics ────────────────────────────────────────────────────────

pub static FRAMES_REJECTED: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "devscope_frames_rejected_total",
        "Frames that failed to decode",
        &["channel"]
    )
    .unwrap()
});

pub static HANDSHAKES: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "devscope_handshake_attempts_total",
        "Handshake attempts by sub-channel and result",
        &["channel", "result"]
    )
    .unwrap()
});

pub static CONTROL_REQUESTS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "devscope_control_requests_total",
        "Control requests by message type and result",
        &["kind", "result"]
    )
    .unwrap()
});

pub static CONTROL_LATENCY: Lazy<Histogram> = Lazy::new(|| {
    register_histogram!(
        "devscope_control_request_duration_seconds",
        "Control request round-trip latency",
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 5.0]
    )
    .unwrap()
});

pub static DATA_MESSAGES: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "devscope_data_messages_total",
        "Messages received on data sub-channels",
        &["kind"]
    )
    .unwrap()
});

// ── Pipeline metrics ─────────────────────────────────────────────────────────

pub static CHUNKS_DISPATCHED: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "devscope_chunks_dispatched_total",
        "Chunks handed to the upload workers",
        &["target"]
    )
    .unwrap()
});

pub static CHUNK_BYTES: Lazy<Counter> = Lazy::new(|| {
    register_counter!("devscope_chunk_bytes_total", "Bytes dispatched in chunks").unwrap()
});

pub static UPLOAD_FAILURES: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "devscope_upload_failures_total",
        "Chunks a worker failed to deliver",
        &["target"]
    )
    .unwrap()
});

pub static PENDING_CHUNKS: Lazy<Gauge> = Lazy::new(|| {
    register_gauge!(
        "devscope_pending_chunks",
        "Chunks dispatched but not yet delivered"
    )
    .unwrap()
});

// ── Job metrics ──────────────────────────────────────────────────────────────

pub static ACTIVE_TASKS: Lazy<Gauge> = Lazy::new(|| {
    register_gauge!("devscope_active_tasks", "Jobs currently in the task registry").unwrap()
});

pub static JOBS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "devscope_jobs_total",
        "Job requests by outcome",
        &["outcome"]
    )
    .unwrap()
});

pub static WATCHER_EVENTS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "devscope_watcher_events_total",
        "Sentinel events seen by the lifecycle watcher",
        &["kind"]
    )
    .unwrap()
});

/// Render all registered metrics to Prometheus text format.
pub fn encode_metrics() -> String {
    let encoder = TextEncoder::new();
    let families = prometheus::gather();
    let mut buffer = Vec::new();
    if encoder.encode(&families, &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
