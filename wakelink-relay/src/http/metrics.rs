//! Prometheus metrics endpoint.

use crate::server::WakeRelay;
use axum::{http::header::CONTENT_TYPE, response::IntoResponse, Extension};
use std::sync::Arc;

/// Prometheus metrics handler.
///
/// Returns metrics in Prometheus text format.
/// Includes both gauges (current state) and counters (monotonic since startup).
pub async fn metrics_handler(Extension(relay): Extension<Arc<WakeRelay>>) -> impl IntoResponse {
    (
        [(CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        render(&relay),
    )
}

fn render(relay: &WakeRelay) -> String {
    let stats = relay.stats();
    let m = relay.metrics().snapshot();

    let gauges = [
        ("connections_active", "Live push connections", stats.connected_peers as u64),
        ("queue_depth", "Packets waiting in peer queues", stats.queue_depth as u64),
        ("pending_waits", "Requests awaiting a response", stats.pending_waits as u64),
    ];
    let counters = [
        ("packets_pushed_total", "Packets pushed over live connections", m.packets_pushed),
        ("packets_queued_total", "Packets stored for later delivery", m.packets_queued),
        ("packets_evicted_total", "Queued packets evicted on overflow", m.packets_evicted),
        ("packets_rejected_total", "Packets rejected on overflow", m.packets_rejected),
        ("packets_expired_total", "Queued packets purged by retention", m.packets_expired),
        ("push_failures_total", "Pushes that fell back to the queue", m.push_failures),
        ("responses_delivered_total", "Responses handed to a waiter", m.responses_delivered),
        ("responses_dropped_total", "Responses with no waiter", m.responses_dropped),
        ("waits_timed_out_total", "Response waits that timed out", m.waits_timed_out),
        ("connections_total", "Connections registered", m.connections_total),
        ("rate_limit_hits_total", "Total rate limit rejections", m.rate_limit_hits),
    ];

    let mut body = format!(
        "# HELP wakelink_relay_info Server information\n\
         # TYPE wakelink_relay_info gauge\n\
         wakelink_relay_info{{version=\"{}\"}} 1\n",
        env!("CARGO_PKG_VERSION")
    );
    for (name, help, value) in gauges {
        body.push_str(&format!(
            "\n# HELP wakelink_relay_{name} {help}\n# TYPE wakelink_relay_{name} gauge\nwakelink_relay_{name} {value}\n"
        ));
    }
    for (name, help, value) in counters {
        body.push_str(&format!(
            "\n# HELP wakelink_relay_{name} {help}\n# TYPE wakelink_relay_{name} counter\nwakelink_relay_{name} {value}\n"
        ));
    }
    body
}
