//! Prometheus metrics for the lifecycle manager.
//!
//! Metrics are registered with the default registry; embedders that want an
//! exposition endpoint call [`encode_text`].

use lazy_static::lazy_static;
use prometheus::{
    register_histogram, register_histogram_vec, register_int_counter, register_int_counter_vec,
    register_int_gauge, Histogram, HistogramVec, IntCounter, IntCounterVec, IntGauge, TextEncoder,
};

lazy_static! {
    /// Time from start request to the guest answering its first health probe.
    pub static ref VM_BOOT_DURATION: Histogram = register_histogram!(
        "burrow_vm_boot_duration_seconds",
        "Time from start request to guest readiness",
        vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]
    )
    .unwrap();

    /// VMs currently in Provisioning or Running state.
    pub static ref VMS_RUNNING: IntGauge = register_int_gauge!(
        "burrow_vms_running",
        "Number of live VMs on this host"
    )
    .unwrap();

    pub static ref VM_STARTS_TOTAL: IntCounter = register_int_counter!(
        "burrow_vm_starts_total",
        "Successful VM boots"
    )
    .unwrap();

    pub static ref VM_BOOT_RETRIES_TOTAL: IntCounter = register_int_counter!(
        "burrow_vm_boot_retries_total",
        "Boot attempts retried with a fresh golden clone"
    )
    .unwrap();

    pub static ref IDLE_EVICTIONS_TOTAL: IntCounter = register_int_counter!(
        "burrow_idle_evictions_total",
        "VMs stopped by the idle sweeper"
    )
    .unwrap();

    pub static ref GUEST_RPC_DURATION: HistogramVec = register_histogram_vec!(
        "burrow_guest_rpc_duration_seconds",
        "Guest RPC latency by operation",
        &["op"]
    )
    .unwrap();

    pub static ref SNAPSHOT_SAVE_DURATION: Histogram = register_histogram!(
        "burrow_snapshot_save_duration_seconds",
        "Time to durably upload a rootfs snapshot"
    )
    .unwrap();

    pub static ref SNAPSHOT_LOAD_DURATION: Histogram = register_histogram!(
        "burrow_snapshot_load_duration_seconds",
        "Time to materialize a rootfs from a snapshot"
    )
    .unwrap();

    pub static ref SNAPSHOT_BYTES: Histogram = register_histogram!(
        "burrow_snapshot_bytes",
        "Size of uploaded snapshots in bytes",
        prometheus::exponential_buckets(1024.0 * 1024.0, 4.0, 8).unwrap()
    )
    .unwrap();

    pub static ref ERRORS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "burrow_errors_total",
        "Errors by kind",
        &["kind"]
    )
    .unwrap();
}

/// Render all registered metrics in the Prometheus text format.
pub fn encode_text() -> String {
    let families = prometheus::gather();
    TextEncoder::new()
        .encode_to_string(&families)
        .unwrap_or_default()
}
