//! Metric instrument factories for nbo-enrich.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"nbo-enrich"` meter.

use opentelemetry::metrics::{Counter, Histogram, Meter};

fn meter() -> Meter {
    opentelemetry::global::meter("nbo-enrich")
}

/// Counter: records returned by the source.
/// Labels: `pipeline`.
pub fn records_fetched() -> Counter<u64> {
    meter()
        .u64_counter("nbo.records.fetched")
        .with_description("Records fetched from the source")
        .build()
}

/// Counter: fetched records skipped because the dedup cache had them.
/// Labels: `pipeline`.
pub fn records_deduplicated() -> Counter<u64> {
    meter()
        .u64_counter("nbo.records.deduplicated")
        .with_description("Fetched records skipped as duplicates")
        .build()
}

/// Counter: record deliveries to a stage queue.
/// Labels: `stage`.
pub fn records_routed() -> Counter<u64> {
    meter()
        .u64_counter("nbo.records.routed")
        .with_description("Records routed to an enrichment stage")
        .build()
}

/// Counter: items handled by stage workers.
/// Labels: `stage`, `result` ("ok" | "error").
pub fn stage_items() -> Counter<u64> {
    meter()
        .u64_counter("nbo.stage.items")
        .with_description("Items processed by stage workers")
        .build()
}

/// Counter: enrichments that exceeded the stage's per-item timeout.
/// Labels: `stage`.
pub fn stage_timeouts() -> Counter<u64> {
    meter()
        .u64_counter("nbo.stage.timeouts")
        .with_description("Enrichments forwarded unenriched after a timeout")
        .build()
}

/// Counter: records upserted into the sink.
pub fn records_written() -> Counter<u64> {
    meter()
        .u64_counter("nbo.records.written")
        .with_description("Records written to the sink")
        .build()
}

/// Histogram: sink batch write duration in milliseconds.
pub fn batch_write_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("nbo.sink.batch_duration_ms")
        .with_description("Sink batch write duration in milliseconds")
        .with_unit("ms")
        .build()
}

/// Counter: finished or refused runs.
/// Labels: `pipeline`, `outcome` ("completed" | "failed" | "skipped").
pub fn run_outcomes() -> Counter<u64> {
    meter()
        .u64_counter("nbo.run.outcomes")
        .with_description("Pipeline run outcomes")
        .build()
}

/// Counter: worker pool size changes.
/// Labels: `pool`, `direction` ("up" | "down").
pub fn pool_size_changes() -> Counter<u64> {
    meter()
        .u64_counter("nbo.pool.size_changes")
        .with_description("Worker pool scaling events")
        .build()
}
