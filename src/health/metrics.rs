/// Prometheus text exposition
///
/// Metric names are prefixed with `replica_router_`. Counters end in
/// `_total`; everything else is a gauge.
use std::fmt::Write;

pub const PREFIX: &str = "replica_router_";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    Counter,
    Gauge,
}

impl MetricKind {
    fn as_str(self) -> &'static str {
        match self {
            MetricKind::Counter => "counter",
            MetricKind::Gauge => "gauge",
        }
    }
}

/// Accumulates metric families into exposition text
#[derive(Debug, Default)]
pub struct PrometheusWriter {
    out: String,
}

impl PrometheusWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a family; samples for it must follow before the next family
    pub fn family(&mut self, name: &str, kind: MetricKind, help: &str) -> &mut Self {
        let _ = writeln!(self.out, "# HELP {}{} {}", PREFIX, name, help);
        let _ = writeln!(self.out, "# TYPE {}{} {}", PREFIX, name, kind.as_str());
        self
    }

    pub fn sample(&mut self, name: &str, labels: &[(&str, &str)], value: f64) -> &mut Self {
        let _ = write!(self.out, "{}{}", PREFIX, name);
        if !labels.is_empty() {
            self.out.push('{');
            for (i, (key, val)) in labels.iter().enumerate() {
                if i > 0 {
                    self.out.push(',');
                }
                let _ = write!(self.out, "{}=\"{}\"", key, escape_label(val));
            }
            self.out.push('}');
        }
        let _ = writeln!(self.out, " {}", format_value(value));
        self
    }

    /// Family with a single unlabeled sample
    pub fn single(&mut self, name: &str, kind: MetricKind, help: &str, value: f64) -> &mut Self {
        self.family(name, kind, help).sample(name, &[], value)
    }

    /// Append pre-rendered exposition text
    pub fn append(&mut self, text: &str) -> &mut Self {
        self.out.push_str(text);
        self
    }

    pub fn finish(self) -> String {
        self.out
    }
}

fn escape_label(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}

fn format_value(value: f64) -> String {
    if value.is_nan() {
        "NaN".to_string()
    } else if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        format!("{}", value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exposition_format() {
        let mut w = PrometheusWriter::new();
        w.family("replication_lag_ms", MetricKind::Gauge, "Replica lag in milliseconds")
            .sample("replication_lag_ms", &[("replica", "replica-1")], 6000.0)
            .sample("replication_lag_ms", &[("replica", "replica-2")], 12.5);
        w.single("queries_total", MetricKind::Counter, "Queries routed", 3.0);
        let text = w.finish();

        assert!(text.contains("# TYPE replica_router_replication_lag_ms gauge"));
        assert!(text.contains("replica_router_replication_lag_ms{replica=\"replica-1\"} 6000\n"));
        assert!(text.contains("replica_router_replication_lag_ms{replica=\"replica-2\"} 12.5\n"));
        assert!(text.contains("replica_router_queries_total 3\n"));
    }

    #[test]
    fn test_label_escaping() {
        let mut w = PrometheusWriter::new();
        w.sample("x", &[("node", "a\"b")], 1.0);
        assert_eq!(w.finish(), "replica_router_x{node=\"a\\\"b\"} 1\n");
    }
}
