//! Prometheus metrics for one fleet process
//!
//! Each process owns a [`FleetMetrics`] with its own registry rather than
//! registering into the global default one. Request counters and
//! latencies are recorded by the HTTP layer; component gauges are copied
//! from the components' stats right before rendering.

use prometheus::{
    Encoder, GaugeVec, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder,
};

use crate::error::{Error, Result};

pub struct FleetMetrics {
    registry: Registry,
    requests: IntCounterVec,
    latency: HistogramVec,
    component: GaugeVec,
}

impl FleetMetrics {
    /// Metrics labelled with the component name (`leaf`, `zone-mixer`, ...)
    pub fn new(component: &str) -> Result<Self> {
        let registry = Registry::new_custom(Some("fleet".to_string()), None)?;

        let requests = IntCounterVec::new(
            Opts::new("requests_total", "Requests handled by route and outcome code")
                .const_label("component", component),
            &["route", "code"],
        )?;
        let latency = HistogramVec::new(
            HistogramOpts::new("request_duration_seconds", "Request latency in seconds")
                .const_label("component", component)
                .buckets(vec![0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
            &["route"],
        )?;
        let gauges = GaugeVec::new(
            Opts::new("component_stat", "Component counters and sizes")
                .const_label("component", component),
            &["stat"],
        )?;

        registry.register(Box::new(requests.clone()))?;
        registry.register(Box::new(latency.clone()))?;
        registry.register(Box::new(gauges.clone()))?;

        Ok(Self {
            registry,
            requests,
            latency,
            component: gauges,
        })
    }

    #[inline]
    pub fn record_request(&self, route: &str, code: &str, duration_secs: f64) {
        self.requests.with_label_values(&[route, code]).inc();
        self.latency
            .with_label_values(&[route])
            .observe(duration_secs);
    }

    /// Set component gauges from `(name, value)` pairs
    pub fn set_stats<'a>(&self, stats: impl IntoIterator<Item = (&'a str, f64)>) {
        for (name, value) in stats {
            self.component.with_label_values(&[name]).set(value);
        }
    }

    /// Text exposition format
    pub fn render(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer)
            .map_err(|e| Error::Internal(format!("metrics contain invalid UTF-8: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_contains_recorded_series() {
        let metrics = FleetMetrics::new("leaf").unwrap();
        metrics.record_request("/leaf/write", "ok", 0.002);
        metrics.set_stats([("series", 3.0), ("snapshot_version", 7.0)]);

        let text = metrics.render().unwrap();
        assert!(text.contains("fleet_requests_total"));
        assert!(text.contains(r#"route="/leaf/write""#));
        assert!(text.contains(r#"stat="snapshot_version""#));
        assert!(text.contains(r#"component="leaf""#));
    }

    #[test]
    fn test_registries_are_independent() {
        let a = FleetMetrics::new("leaf").unwrap();
        let b = FleetMetrics::new("leaf").unwrap();
        a.record_request("/x", "ok", 0.1);
        assert!(!b.render().unwrap().contains(r#"route="/x""#));
    }
}
