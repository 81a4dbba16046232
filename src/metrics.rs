// src/metrics.rs
//
// Prometheus registry and scrape endpoint. Gauges and counters follow the
// external metrics contract: connection state per exchange, reconnects,
// websocket messages, order latency, signal counts by strategy, realized
// PnL, drawdown, circuit state, and errors by category.

use prometheus::{
    Encoder, Gauge, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, IntGaugeVec,
    Opts, Registry, TextEncoder,
};
use tiny_http::{Header, Response, Server};

use crate::ops::HealthState;

#[derive(Clone)]
pub struct EngineMetrics {
    registry: Registry,
    pub connection_state: IntGaugeVec,
    pub reconnects: IntCounterVec,
    pub ws_messages: IntCounterVec,
    pub order_latency_ms: Histogram,
    pub feed_latency_ms: Histogram,
    pub signals_detected: IntCounterVec,
    pub signals_executed: IntCounterVec,
    pub signals_rejected: IntCounterVec,
    pub signals_dropped: IntCounter,
    pub realized_pnl_usd: Gauge,
    pub daily_pnl_usd: Gauge,
    pub drawdown_pct: Gauge,
    pub circuit_tripped: IntGauge,
    pub consecutive_losses: IntGauge,
    pub errors: IntCounterVec,
    pub rate_limit_wait_ms: IntCounterVec,
}

impl EngineMetrics {
    pub fn new() -> Self {
        let registry = Registry::new();
        let connection_state = IntGaugeVec::new(
            Opts::new("arbot_connection_state", "Connector state (1=streaming)"),
            &["exchange"],
        )
        .expect("connection state gauge");
        let reconnects = IntCounterVec::new(
            Opts::new("arbot_reconnects_total", "Reconnect attempts"),
            &["exchange"],
        )
        .expect("reconnects counter");
        let ws_messages = IntCounterVec::new(
            Opts::new("arbot_ws_messages_total", "Websocket messages received"),
            &["exchange"],
        )
        .expect("ws messages counter");
        let order_latency_ms = Histogram::with_opts(
            HistogramOpts::new("arbot_order_latency_ms", "Order submit-to-terminal latency")
                .buckets(vec![1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 1000.0, 5000.0]),
        )
        .expect("order latency histogram");
        let feed_latency_ms = Histogram::with_opts(
            HistogramOpts::new("arbot_feed_latency_ms", "Feed ingress minus event time")
                .buckets(vec![1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 1000.0]),
        )
        .expect("feed latency histogram");
        let signals_detected = IntCounterVec::new(
            Opts::new("arbot_signals_detected_total", "Signals detected"),
            &["strategy"],
        )
        .expect("signals detected counter");
        let signals_executed = IntCounterVec::new(
            Opts::new("arbot_signals_executed_total", "Signals executed"),
            &["strategy"],
        )
        .expect("signals executed counter");
        let signals_rejected = IntCounterVec::new(
            Opts::new("arbot_signals_rejected_total", "Signals rejected by reason"),
            &["strategy", "reason"],
        )
        .expect("signals rejected counter");
        let signals_dropped = IntCounter::with_opts(Opts::new(
            "arbot_signals_dropped_total",
            "Signals dropped on queue overflow",
        ))
        .expect("signals dropped counter");
        let realized_pnl_usd = Gauge::with_opts(Opts::new(
            "arbot_realized_pnl_usd",
            "Cumulative realized PnL",
        ))
        .expect("realized pnl gauge");
        let daily_pnl_usd =
            Gauge::with_opts(Opts::new("arbot_daily_pnl_usd", "Realized PnL today (UTC)"))
                .expect("daily pnl gauge");
        let drawdown_pct =
            Gauge::with_opts(Opts::new("arbot_drawdown_pct", "Current drawdown from HWM"))
                .expect("drawdown gauge");
        let circuit_tripped = IntGauge::with_opts(Opts::new(
            "arbot_circuit_breaker_tripped",
            "Circuit breaker state (1=tripped)",
        ))
        .expect("circuit gauge");
        let consecutive_losses = IntGauge::with_opts(Opts::new(
            "arbot_consecutive_losses",
            "Current consecutive closed losses",
        ))
        .expect("losses gauge");
        let errors = IntCounterVec::new(
            Opts::new("arbot_errors_total", "Errors by category"),
            &["category"],
        )
        .expect("errors counter");
        let rate_limit_wait_ms = IntCounterVec::new(
            Opts::new("arbot_rate_limit_wait_ms_total", "Time spent queued on rate limits"),
            &["exchange"],
        )
        .expect("rate limit counter");

        for metric in [
            Box::new(connection_state.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(reconnects.clone()),
            Box::new(ws_messages.clone()),
            Box::new(order_latency_ms.clone()),
            Box::new(feed_latency_ms.clone()),
            Box::new(signals_detected.clone()),
            Box::new(signals_executed.clone()),
            Box::new(signals_rejected.clone()),
            Box::new(signals_dropped.clone()),
            Box::new(realized_pnl_usd.clone()),
            Box::new(daily_pnl_usd.clone()),
            Box::new(drawdown_pct.clone()),
            Box::new(circuit_tripped.clone()),
            Box::new(consecutive_losses.clone()),
            Box::new(errors.clone()),
            Box::new(rate_limit_wait_ms.clone()),
        ] {
            registry.register(metric).expect("register metric");
        }

        Self {
            registry,
            connection_state,
            reconnects,
            ws_messages,
            order_latency_ms,
            feed_latency_ms,
            signals_detected,
            signals_executed,
            signals_rejected,
            signals_dropped,
            realized_pnl_usd,
            daily_pnl_usd,
            drawdown_pct,
            circuit_tripped,
            consecutive_losses,
            errors,
            rate_limit_wait_ms,
        }
    }

    pub fn inc_error(&self, category: &str) {
        self.errors.with_label_values(&[category]).inc();
    }

    pub fn gather(&self) -> String {
        let families = self.registry.gather();
        let mut buf = Vec::new();
        let encoder = TextEncoder::new();
        let _ = encoder.encode(&families, &mut buf);
        String::from_utf8(buf).unwrap_or_default()
    }
}

impl Default for EngineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Serve /metrics, /health, and /ready on a plain HTTP listener.
pub fn start_metrics_server(addr: &str, metrics: EngineMetrics, health: HealthState) {
    let addr = addr.to_string();
    std::thread::spawn(move || {
        let server = match Server::http(addr.as_str()) {
            Ok(server) => server,
            Err(err) => {
                eprintln!("WARN: metrics server failed to bind {addr}: {err}");
                return;
            }
        };
        for request in server.incoming_requests() {
            let response = match request.url() {
                "/metrics" => Response::from_string(metrics.gather()).with_header(
                    Header::from_bytes(&b"Content-Type"[..], &b"text/plain; version=0.0.4"[..])
                        .expect("static header"),
                ),
                "/health" => {
                    if health.is_healthy() {
                        Response::from_string("ok")
                    } else {
                        Response::from_string("unhealthy").with_status_code(503)
                    }
                }
                "/ready" => {
                    if health.is_ready() {
                        Response::from_string("ready")
                    } else {
                        Response::from_string("not_ready").with_status_code(503)
                    }
                }
                _ => Response::from_string("not found").with_status_code(404),
            };
            let _ = request.respond(response);
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gather_exposes_registered_metrics() {
        let metrics = EngineMetrics::new();
        metrics.connection_state.with_label_values(&["binance"]).set(1);
        metrics.signals_detected.with_label_values(&["SPATIAL"]).inc();
        metrics.inc_error("transient");
        let text = metrics.gather();
        assert!(text.contains("arbot_connection_state"));
        assert!(text.contains("arbot_signals_detected_total"));
        assert!(text.contains("category=\"transient\""));
    }
}
