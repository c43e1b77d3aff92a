use prometheus::{Encoder, Histogram, IntCounter, IntGauge, Registry, TextEncoder};
use std::time::Duration;

/// Per-instance counters. Each plugin owns its own registry so several
/// instances can live in one process.
pub struct PluginMetrics {
    registry: Registry,

    // Inbound
    pub messages_received: IntCounter,
    pub decode_errors: IntCounter,

    // Outbound
    pub publishes_total: IntCounter,
    pub publishes_failed: IntCounter,
    pub publish_duration: Histogram,
    pub pipes_total: IntCounter,

    // Lifecycle
    pub setup_failures: IntCounter,
    pub ready: IntGauge,
}

impl Default for PluginMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl PluginMetrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let messages_received = IntCounter::new(
            "pipeline_plugin_messages_received_total",
            "Inbound messages taken off input queues",
        )
        .expect("metric creation failed");
        let decode_errors = IntCounter::new(
            "pipeline_plugin_decode_errors_total",
            "Inbound messages dropped because they were not valid JSON",
        )
        .expect("metric creation failed");

        let publishes_total = IntCounter::new(
            "pipeline_plugin_publishes_total",
            "Individual queue publishes attempted",
        )
        .expect("metric creation failed");
        let publishes_failed = IntCounter::new(
            "pipeline_plugin_publishes_failed_total",
            "Individual queue publishes that failed or timed out",
        )
        .expect("metric creation failed");
        let publish_duration = Histogram::with_opts(prometheus::HistogramOpts::new(
            "pipeline_plugin_publish_duration_seconds",
            "Duration of a whole fan-out in seconds",
        ))
        .expect("metric creation failed");
        let pipes_total = IntCounter::new(
            "pipeline_plugin_pipes_total",
            "Results piped to output queues",
        )
        .expect("metric creation failed");

        let setup_failures = IntCounter::new(
            "pipeline_plugin_setup_failures_total",
            "Setup runs that ended in the Failed state",
        )
        .expect("metric creation failed");
        let ready = IntGauge::new("pipeline_plugin_ready", "1 once the plugin is ready")
            .expect("metric creation failed");

        registry
            .register(Box::new(messages_received.clone()))
            .unwrap();
        registry.register(Box::new(decode_errors.clone())).unwrap();
        registry.register(Box::new(publishes_total.clone())).unwrap();
        registry
            .register(Box::new(publishes_failed.clone()))
            .unwrap();
        registry
            .register(Box::new(publish_duration.clone()))
            .unwrap();
        registry.register(Box::new(pipes_total.clone())).unwrap();
        registry.register(Box::new(setup_failures.clone())).unwrap();
        registry.register(Box::new(ready.clone())).unwrap();

        Self {
            registry,
            messages_received,
            decode_errors,
            publishes_total,
            publishes_failed,
            publish_duration,
            pipes_total,
            setup_failures,
            ready,
        }
    }

    pub fn record_received(&self) {
        self.messages_received.inc();
    }

    pub fn record_decode_error(&self) {
        self.decode_errors.inc();
    }

    pub fn record_fan_out(&self, duration: Duration, attempted: usize, failed: usize) {
        self.publishes_total.inc_by(attempted as u64);
        self.publishes_failed.inc_by(failed as u64);
        self.publish_duration.observe(duration.as_secs_f64());
    }

    pub fn record_pipe(&self) {
        self.pipes_total.inc();
    }

    pub fn record_setup_failure(&self) {
        self.setup_failures.inc();
    }

    pub fn record_ready(&self) {
        self.ready.set(1);
    }

    pub fn gather_metrics(&self) -> Vec<prometheus::proto::MetricFamily> {
        self.registry.gather()
    }

    /// Text exposition format of every registered metric.
    pub fn render(&self) -> String {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        if let Err(e) = encoder.encode(&self.gather_metrics(), &mut buffer) {
            tracing::warn!("Failed to encode metrics: {}", e);
            return String::new();
        }
        String::from_utf8_lossy(&buffer).into_owned()
    }
}
