// Private module declaration
mod server;

use prometheus::{Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry};

pub use server::start_metrics_server;

use crate::utils::CircuitState;

// ============================================================================
// Metrics Module - Prometheus metrics for the ingestion loop
// ============================================================================
//
// Covers:
// - Queue polling (polls, receive failures, messages received)
// - Per-message outcomes and processing latency
// - Decode, append, delete and dead-letter failures
// - Event store circuit breaker state
//
// Scraped via /metrics on the metrics server.
// ============================================================================

pub struct Metrics {
    registry: Registry,

    // Polling
    pub polls_total: IntCounter,
    pub receive_failures: IntCounter,
    pub messages_received: IntCounter,

    // Processing
    pub messages_processed: IntCounterVec,
    pub processing_duration: Histogram,
    pub decode_failures: IntCounterVec,
    pub append_failures: IntCounter,
    pub delete_failures: IntCounter,
    pub dead_letter_failures: IntCounter,

    // Circuit Breaker
    pub circuit_breaker_state: IntGauge,
    pub circuit_breaker_transitions: IntCounterVec,
}

impl Metrics {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();

        let polls_total = IntCounter::new("queue_polls_total", "Total receive calls issued to the queue")?;
        registry.register(Box::new(polls_total.clone()))?;

        let receive_failures = IntCounter::new(
            "queue_receive_failures_total",
            "Total receive calls that failed",
        )?;
        registry.register(Box::new(receive_failures.clone()))?;

        let messages_received = IntCounter::new(
            "queue_messages_received_total",
            "Total messages received from the queue",
        )?;
        registry.register(Box::new(messages_received.clone()))?;

        let messages_processed = IntCounterVec::new(
            Opts::new("messages_processed_total", "Messages processed, by outcome"),
            &["outcome"],
        )?;
        registry.register(Box::new(messages_processed.clone()))?;

        let processing_duration = Histogram::with_opts(
            HistogramOpts::new("message_processing_duration_seconds", "Time spent processing one message")
                .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
        )?;
        registry.register(Box::new(processing_duration.clone()))?;

        let decode_failures = IntCounterVec::new(
            Opts::new("decode_failures_total", "Message bodies that could not be decoded"),
            &["kind"],
        )?;
        registry.register(Box::new(decode_failures.clone()))?;

        let append_failures = IntCounter::new(
            "event_store_append_failures_total",
            "Appends to the event store that failed",
        )?;
        registry.register(Box::new(append_failures.clone()))?;

        let delete_failures = IntCounter::new(
            "queue_delete_failures_total",
            "Message deletions that failed",
        )?;
        registry.register(Box::new(delete_failures.clone()))?;

        let dead_letter_failures = IntCounter::new(
            "dead_letter_failures_total",
            "Messages that could not be written to the dead letter table",
        )?;
        registry.register(Box::new(dead_letter_failures.clone()))?;

        let circuit_breaker_state = IntGauge::new(
            "event_store_circuit_breaker_state",
            "Event store circuit breaker state (0=Closed, 1=Open, 2=HalfOpen)",
        )?;
        registry.register(Box::new(circuit_breaker_state.clone()))?;

        let circuit_breaker_transitions = IntCounterVec::new(
            Opts::new(
                "event_store_circuit_breaker_transitions_total",
                "Event store circuit breaker state transitions",
            ),
            &["from_state", "to_state"],
        )?;
        registry.register(Box::new(circuit_breaker_transitions.clone()))?;

        Ok(Self {
            registry,
            polls_total,
            receive_failures,
            messages_received,
            messages_processed,
            processing_duration,
            decode_failures,
            append_failures,
            delete_failures,
            dead_letter_failures,
            circuit_breaker_state,
            circuit_breaker_transitions,
        })
    }

    /// Get the Prometheus registry for exposing metrics via HTTP
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn record_poll(&self, received: usize) {
        self.polls_total.inc();
        self.messages_received.inc_by(received as u64);
    }

    pub fn record_outcome(&self, outcome: &str, duration_secs: f64) {
        self.messages_processed.with_label_values(&[outcome]).inc();
        self.processing_duration.observe(duration_secs);
    }

    pub fn record_decode_failure(&self, kind: &str) {
        self.decode_failures.with_label_values(&[kind]).inc();
    }

    pub fn record_circuit_transition(&self, from: CircuitState, to: CircuitState) {
        self.circuit_breaker_state.set(to.as_gauge());
        self.circuit_breaker_transitions
            .with_label_values(&[from.as_str(), to.as_str()])
            .inc();
    }
}
