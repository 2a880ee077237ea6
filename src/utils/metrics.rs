//! OTel-native metrics instruments.
//!
//! Centralized metric definitions using OpenTelemetry meters.
//! All instruments are lazily initialized and feature-gated behind `otel`.
//!
//! Naming follows OTel semantic conventions (dot-separated).

use std::sync::LazyLock;

use opentelemetry::global;
use opentelemetry::metrics::{Counter, Meter};

static METER: LazyLock<Meter> = LazyLock::new(|| global::meter("notifier"));

// ============================================================================
// Publisher
// ============================================================================

/// Messages confirmed by the broker.
pub static BUS_PUBLISH_TOTAL: LazyLock<Counter<u64>> = LazyLock::new(|| {
    METER
        .u64_counter("notifier.bus.publish.total")
        .with_description("Messages confirmed by the broker")
        .build()
});

/// Messages placed in the replay buffer.
pub static BUS_BUFFERED_TOTAL: LazyLock<Counter<u64>> = LazyLock::new(|| {
    METER
        .u64_counter("notifier.bus.buffer.total")
        .with_description("Messages buffered while the broker was unavailable")
        .build()
});

/// Messages dropped because the buffer was full.
pub static BUS_DROPPED_TOTAL: LazyLock<Counter<u64>> = LazyLock::new(|| {
    METER
        .u64_counter("notifier.bus.buffer.dropped")
        .with_description("Messages dropped on buffer overflow")
        .build()
});

// ============================================================================
// Consumer
// ============================================================================

/// Deliveries dispatched to handlers.
pub static BUS_CONSUME_TOTAL: LazyLock<Counter<u64>> = LazyLock::new(|| {
    METER
        .u64_counter("notifier.bus.consume.total")
        .with_description("Deliveries dispatched to handlers")
        .build()
});

/// Handler failures (errors and panics).
pub static HANDLER_FAILED_TOTAL: LazyLock<Counter<u64>> = LazyLock::new(|| {
    METER
        .u64_counter("notifier.bus.handler.failed")
        .with_description("Deliveries whose handler failed")
        .build()
});
