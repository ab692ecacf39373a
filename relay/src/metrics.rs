use lazy_static::lazy_static;
use prometheus::{Counter, Encoder, Histogram, HistogramOpts, Opts, Registry, TextEncoder};

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();
    pub static ref SAMPLES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "relay_samples_total",
        "Telemetry samples received from the active source"
    ))
    .unwrap();
    pub static ref FRAMES_DROPPED_TOTAL: Counter = Counter::with_opts(Opts::new(
        "relay_frames_dropped_total",
        "Feed frames ignored for lacking position fields"
    ))
    .unwrap();
    pub static ref PARSE_ERRORS_TOTAL: Counter = Counter::with_opts(Opts::new(
        "relay_parse_errors_total",
        "Feed frames that failed to parse"
    ))
    .unwrap();
    pub static ref SOURCE_ERRORS_TOTAL: Counter = Counter::with_opts(Opts::new(
        "relay_source_errors_total",
        "Errors surfaced by the active receiver source"
    ))
    .unwrap();
    pub static ref DELIVERIES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "relay_deliveries_total",
        "Telemetry delivery attempts"
    ))
    .unwrap();
    pub static ref DELIVERY_FAILURES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "relay_delivery_failures_total",
        "Telemetry delivery attempts that did not succeed"
    ))
    .unwrap();
    pub static ref DELIVERY_LATENCY_SECONDS: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "relay_delivery_latency_seconds",
            "Time taken to post telemetry to the remote endpoint"
        )
        .buckets(vec![
            0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0
        ])
    )
    .unwrap();
    pub static ref OFFLINE_EMISSIONS_TOTAL: Counter = Counter::with_opts(Opts::new(
        "relay_offline_emissions_total",
        "Synthesized offline diagnostics emissions"
    ))
    .unwrap();
}

pub fn init_metrics() {
    REGISTRY.register(Box::new(SAMPLES_TOTAL.clone())).unwrap();
    REGISTRY
        .register(Box::new(FRAMES_DROPPED_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(PARSE_ERRORS_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(SOURCE_ERRORS_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(DELIVERIES_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(DELIVERY_FAILURES_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(DELIVERY_LATENCY_SECONDS.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(OFFLINE_EMISSIONS_TOTAL.clone()))
        .unwrap();
}

pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer).unwrap();
    String::from_utf8(buffer).unwrap()
}
