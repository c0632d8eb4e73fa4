#![allow(missing_docs)] // proc macros dont play nicely with docstrings

//! Coordination metrics.
//!
//! Metrics are lazily initialized on first access via `lazy_static!` and
//! registered in the default prometheus registry. Registration failures are
//! fatal.

use lazy_static::lazy_static;
use prometheus::{
    IntCounter, IntCounterVec, IntGauge, IntGaugeVec, register_int_counter,
    register_int_counter_vec, register_int_gauge, register_int_gauge_vec,
};
use prometheus_static_metric::make_static_metric;

make_static_metric! {
    pub label_enum SessionState {
        connected,
        connecting,
    }
    pub struct SessionStats: IntCounter {
        "state" => SessionState
    }
    pub label_enum EnsureResult {
        executed,
        deferred,
        already_gone,
        failed,
    }
    pub struct EnsureStats: IntCounter {
        "result" => EnsureResult
    }
}

lazy_static! {
    pub static ref SESSION_TRANSITION_VEC: IntCounterVec = register_int_counter_vec!(
        "coordination_session_transitions",
        "count of session state transitions",
        &["state"]
    )
    .unwrap();

    /// session transitions by target state
    pub static ref SESSION_TRANSITIONS: SessionStats = SessionStats::from(&SESSION_TRANSITION_VEC);

    pub static ref ENSURE_RESULT_VEC: IntCounterVec = register_int_counter_vec!(
        "coordination_ensure_results",
        "count of ensured operations by result",
        &["result"]
    )
    .unwrap();

    /// ensured operations by result, replays included
    pub static ref ENSURE_RESULTS: EnsureStats = EnsureStats::from(&ENSURE_RESULT_VEC);

    /// # of deferred operations waiting for the session
    pub static ref ENSURE_QUEUE_DEPTH: IntGauge = register_int_gauge!(
        "coordination_ensure_queue_depth",
        "count of deferred operations waiting for reconnect"
    )
    .unwrap();

    /// deferred operations replayed after reconnect
    pub static ref ENSURE_REPLAYED: IntCounter = register_int_counter!(
        "coordination_ensure_replayed",
        "count of deferred operations replayed on reconnect"
    )
    .unwrap();

    /// proxy operations skipped because the session was down
    pub static ref SKIPPED_OPS: IntCounterVec = register_int_counter_vec!(
        "coordination_skipped_ops",
        "count of proxy operations skipped while disconnected",
        &["op"]
    )
    .unwrap();

    /// member nodes created, by service
    pub static ref MEMBER_NODES_CREATED: IntCounterVec = register_int_counter_vec!(
        "presence_member_nodes_created",
        "count of presence member nodes created",
        &["service"]
    )
    .unwrap();

    /// directory entries, by service
    pub static ref DIRECTORY_SIZE: IntGaugeVec = register_int_gauge_vec!(
        "directory_size",
        "count of node ids currently in the directory",
        &["service"]
    )
    .unwrap();

    /// sibling payloads that could not be decoded, by service
    pub static ref DIRECTORY_DECODE_FAILURES: IntCounterVec = register_int_counter_vec!(
        "directory_decode_failures",
        "count of sibling payloads dropped because they failed to decode",
        &["service"]
    )
    .unwrap();
}
