// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Prometheus metrics for a running page server.

use std::sync::Arc;
use std::time::Duration;

use lazy_static::lazy_static;
use livesnap_core::PageServerStats;
use prometheus::{
    register_int_counter, register_int_counter_vec, register_int_gauge, IntCounter,
    IntCounterVec, IntGauge,
};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

lazy_static! {
    pub static ref CONNECTIONS_ACTIVE: IntGauge = register_int_gauge!(
        "livesnap_page_server_connections_active",
        "Number of open page server connections"
    )
    .unwrap();
    pub static ref CONNECTIONS_TOTAL: IntCounter = register_int_counter!(
        "livesnap_page_server_connections_total",
        "Total number of accepted page server connections"
    )
    .unwrap();
    pub static ref SNAPSHOTS: IntCounterVec = register_int_counter_vec!(
        "livesnap_page_server_snapshots_total",
        "Snapshot uploads by outcome",
        &["outcome"]
    )
    .unwrap();
    pub static ref PAGES: IntCounterVec = register_int_counter_vec!(
        "livesnap_page_server_pages_total",
        "Pages transferred by direction",
        &["direction"]
    )
    .unwrap();
    pub static ref BYTES_RECEIVED: IntCounter = register_int_counter!(
        "livesnap_page_server_bytes_received_total",
        "Total page payload bytes received"
    )
    .unwrap();
}

/// Start the metrics server in a background task.
pub fn start_metrics_server(port: u16) {
    // Force initialization of metrics
    lazy_static::initialize(&CONNECTIONS_ACTIVE);
    lazy_static::initialize(&CONNECTIONS_TOTAL);
    lazy_static::initialize(&SNAPSHOTS);
    lazy_static::initialize(&PAGES);
    lazy_static::initialize(&BYTES_RECEIVED);

    tokio::spawn(async move {
        let addr = format!("0.0.0.0:{}", port);
        match TcpListener::bind(&addr).await {
            Ok(listener) => {
                tracing::info!("Metrics server starting on {}", addr);
                loop {
                    if let Ok((mut socket, _)) = listener.accept().await {
                        tokio::spawn(async move {
                            let body = metrics_handler();
                            let response = format!(
                                "HTTP/1.0 200 OK\r\nConnection: close\r\nContent-Length: {}\r\nContent-Type: text/plain\r\n\r\n{}",
                                body.len(),
                                body
                            );
                            let _ = socket.write_all(response.as_bytes()).await;
                            let _ = socket.flush().await;
                        });
                    }
                }
            }
            Err(e) => {
                tracing::error!("Failed to bind metrics server: {}", e);
            }
        }
    });
}

/// Last exported value of each server counter.
#[derive(Debug, Default)]
struct Exported {
    connections: u64,
    committed: u64,
    discarded: u64,
    received: u64,
    served: u64,
    bytes: u64,
}

fn advance(counter: &IntCounter, last: &mut u64, current: u64) {
    if current > *last {
        counter.inc_by(current - *last);
        *last = current;
    }
}

/// Mirror the server's counters into the registry until `cancel` fires.
pub fn spawn_stats_exporter(stats: Arc<PageServerStats>, cancel: CancellationToken) {
    tokio::spawn(async move {
        let mut exported = Exported::default();
        let mut tick = tokio::time::interval(Duration::from_secs(1));
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tick.tick() => {}
            }

            CONNECTIONS_ACTIVE.set(PageServerStats::load(&stats.connections_active) as i64);
            advance(
                &CONNECTIONS_TOTAL,
                &mut exported.connections,
                PageServerStats::load(&stats.connections_total),
            );
            advance(
                &SNAPSHOTS.with_label_values(&["committed"]),
                &mut exported.committed,
                PageServerStats::load(&stats.snapshots_committed),
            );
            advance(
                &SNAPSHOTS.with_label_values(&["discarded"]),
                &mut exported.discarded,
                PageServerStats::load(&stats.snapshots_discarded),
            );
            advance(
                &PAGES.with_label_values(&["received"]),
                &mut exported.received,
                PageServerStats::load(&stats.pages_received),
            );
            advance(
                &PAGES.with_label_values(&["served"]),
                &mut exported.served,
                PageServerStats::load(&stats.pages_served),
            );
            advance(
                &BYTES_RECEIVED,
                &mut exported.bytes,
                PageServerStats::load(&stats.bytes_received),
            );
        }
    });
}

fn metrics_handler() -> String {
    use prometheus::Encoder;
    let encoder = prometheus::TextEncoder::new();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&prometheus::gather(), &mut buffer) {
        tracing::error!("Failed to encode metrics: {}", e);
    }

    String::from_utf8(buffer).unwrap_or_else(|_| String::from("Encoding error"))
}
