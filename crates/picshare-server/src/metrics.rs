use once_cell::sync::Lazy;
use prometheus::{
    register_counter_vec, register_histogram, register_histogram_vec, CounterVec, Histogram,
    HistogramTimer, HistogramVec,
};

pub static OPS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!("picshare_ops_total", "API operations by name", &["op"]).unwrap()
});

pub static OP_DURATION_SECONDS: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!("op_duration_seconds", "API operation latency", &["op"]).unwrap()
});

pub static AUTH_FAILURES_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "auth_failures_total",
        "Rejected requests by reason",
        &["reason"]
    )
    .unwrap()
});

pub static SNAPSHOT_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!("snapshot_total", "Snapshots by result", &["result"]).unwrap()
});

pub static SNAPSHOT_DURATION_SECONDS: Lazy<Histogram> =
    Lazy::new(|| register_histogram!("snapshot_duration_seconds", "Snapshot duration").unwrap());

// Counts the op and starts its latency timer; the timer observes on drop.
pub fn observe_op(op: &str) -> HistogramTimer {
    OPS_TOTAL.with_label_values(&[op]).inc();
    OP_DURATION_SECONDS.with_label_values(&[op]).start_timer()
}
