// Numan Thabit 2025
// metrics.rs - Prometheus instruments for the datagram paths
use prometheus::{Histogram, HistogramOpts, IntCounter, IntGauge, Registry};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("prometheus error: {0}")]
    Prometheus(#[from] prometheus::Error),
}

#[derive(Debug, Clone)]
pub struct Metrics {
    registry: Registry,
    pub datagrams_sent: IntCounter,
    pub datagrams_received: IntCounter,
    pub send_batches: IntCounter,
    pub send_batch_size: Histogram,
    pub send_errors: IntCounter,
    pub send_eagain: IntCounter,
    pub recv_batches: IntCounter,
    pub recv_bytes: IntCounter,
    pub gro_fanout: IntCounter,
    pub read_passes: IntCounter,
    pub queue_depth: IntGauge,
}

impl Metrics {
    pub fn new() -> Result<Self, MetricsError> {
        let registry = Registry::new_custom(Some("dgramport".into()), None)?;

        macro_rules! register_counter {
            ($name:expr, $help:expr) => {{
                let counter = IntCounter::new($name, $help)?;
                registry.register(Box::new(counter.clone()))?;
                counter
            }};
        }

        macro_rules! register_gauge {
            ($name:expr, $help:expr) => {{
                let gauge = IntGauge::new($name, $help)?;
                registry.register(Box::new(gauge.clone()))?;
                gauge
            }};
        }

        macro_rules! register_histogram {
            ($name:expr, $help:expr, $buckets:expr) => {{
                let opts = HistogramOpts::new($name, $help).buckets($buckets.to_vec());
                let hist = Histogram::with_opts(opts)?;
                registry.register(Box::new(hist.clone()))?;
                hist
            }};
        }

        let datagrams_sent =
            register_counter!("datagrams_sent_total", "Datagrams handed to the kernel");
        let datagrams_received = register_counter!(
            "datagrams_received_total",
            "Datagrams delivered to the pipeline"
        );
        let send_batches =
            register_counter!("send_batches_total", "sendmmsg batches issued");
        let send_batch_size = register_histogram!(
            "send_batch_size",
            "Messages accepted per sendmmsg batch",
            &[1.0, 2.0, 4.0, 8.0, 16.0, 32.0, 64.0]
        );
        let send_errors =
            register_counter!("send_errors_total", "Per-message send failures");
        let send_eagain = register_counter!(
            "send_eagain_total",
            "Write passes interrupted by an unwritable socket"
        );
        let recv_batches =
            register_counter!("recv_batches_total", "recvmmsg batches issued");
        let recv_bytes =
            register_counter!("recv_bytes_total", "Payload bytes received");
        let gro_fanout = register_counter!(
            "gro_fanout_total",
            "GRO containers split into wire datagrams"
        );
        let read_passes =
            register_counter!("read_passes_total", "epoll-in dispatches handled");
        let queue_depth =
            register_gauge!("queue_depth", "Messages waiting in the outbound queue");

        Ok(Self {
            registry,
            datagrams_sent,
            datagrams_received,
            send_batches,
            send_batch_size,
            send_errors,
            send_eagain,
            recv_batches,
            recv_bytes,
            gro_fanout,
            read_passes,
            queue_depth,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn gather(&self) -> Vec<prometheus::proto::MetricFamily> {
        self.registry.gather()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn creates_metrics_registry() {
        let metrics = Metrics::new().expect("metrics");
        metrics.datagrams_sent.inc_by(3);
        metrics.send_batch_size.observe(3.0);
        metrics.queue_depth.set(2);
        assert!(!metrics.gather().is_empty());
    }
}
