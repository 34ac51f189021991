//! Prometheus metrics for copy, blob and eviction operations.
//!
//! Metrics carry no hashes or locations, only aggregate counts and bytes.

use prometheus::{
    self, Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry,
    TextEncoder,
};
use std::sync::{LazyLock, Once};

/// Global Prometheus registry for all metrics.
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

// Copy metrics
pub static COPY_ATTEMPTS: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "quarry_copy_attempts_total",
        "Total number of transport attempts made by the copier",
    )
    .expect("metric creation failed")
});

pub static COPY_FAILURES: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "quarry_copy_failures_total",
            "Total copy attempt failures by reason",
        ),
        &["reason"],
    )
    .expect("metric creation failed")
});

pub static COPY_BYTES: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "quarry_copy_bytes_total",
        "Total bytes copied from peers and committed locally",
    )
    .expect("metric creation failed")
});

pub static COPY_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    Histogram::with_opts(
        HistogramOpts::new(
            "quarry_copy_duration_seconds",
            "Time taken by a complete copy request",
        )
        .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0]),
    )
    .expect("metric creation failed")
});

// Blob metrics
pub static BLOB_PUTS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new("quarry_blob_puts_total", "Total blob puts by outcome"),
        &["outcome"],
    )
    .expect("metric creation failed")
});

pub static BLOB_BYTES_UPLOADED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "quarry_blob_bytes_uploaded_total",
        "Total bytes written to the shared blob store",
    )
    .expect("metric creation failed")
});

pub static BLOB_GETS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new("quarry_blob_gets_total", "Total blob gets by outcome"),
        &["outcome"],
    )
    .expect("metric creation failed")
});

pub static BLOB_BYTES_DOWNLOADED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "quarry_blob_bytes_downloaded_total",
        "Total bytes read from the shared blob store",
    )
    .expect("metric creation failed")
});

pub static BLOB_CAPACITY_REJECTIONS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "quarry_blob_capacity_rejections_total",
            "Total blob reservations rejected, by whether the remote counter was consulted",
        ),
        &["source"],
    )
    .expect("metric creation failed")
});

// Eviction metrics
pub static EVICTED_CONTENT: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "quarry_evicted_content_total",
        "Total number of content entries evicted",
    )
    .expect("metric creation failed")
});

pub static EVICTED_BYTES: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "quarry_evicted_bytes_total",
        "Total bytes reclaimed by eviction",
    )
    .expect("metric creation failed")
});

static REGISTER_ONCE: Once = Once::new();

/// Register all metrics with the global registry. Safe to call repeatedly.
pub fn register_metrics() {
    REGISTER_ONCE.call_once(|| {
        REGISTRY
            .register(Box::new(COPY_ATTEMPTS.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(COPY_FAILURES.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(COPY_BYTES.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(COPY_DURATION.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(BLOB_PUTS.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(BLOB_BYTES_UPLOADED.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(BLOB_GETS.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(BLOB_BYTES_DOWNLOADED.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(BLOB_CAPACITY_REJECTIONS.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(EVICTED_CONTENT.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(EVICTED_BYTES.clone()))
            .expect("metric registration failed");
    });
}

/// Encode the registry in the Prometheus text exposition format.
pub fn encode_text() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();

    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
}

/// Helper to record a copy attempt failure by reason.
pub fn record_copy_failure(reason: &str) {
    COPY_FAILURES.with_label_values(&[reason]).inc();
}
