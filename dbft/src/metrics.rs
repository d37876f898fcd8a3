use metrics::{Counter, Gauge, Histogram, Metrics, NoMetrics};
use prometheus::{Encoder, TextEncoder};
use tracing::warn;

#[derive(Clone, Debug)]
pub struct PromCounter(prometheus::Counter);

impl Counter for PromCounter {
    fn add(&self, amount: usize) {
        self.0.inc_by(amount as f64);
    }
}

#[derive(Clone, Debug)]
pub struct PromGauge(prometheus::Gauge);

impl Gauge for PromGauge {
    fn set(&self, amount: usize) {
        self.0.set(amount as f64);
    }

    fn update(&self, delta: i64) {
        self.0.add(delta as f64);
    }
}

#[derive(Clone, Debug)]
pub struct PromHistogram(prometheus::Histogram);

impl Histogram for PromHistogram {
    fn add_point(&self, point: f64) {
        self.0.observe(point);
    }
}

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum PrometheusError {
    #[error("prometheus error: {0}")]
    Prometheus(#[from] prometheus::Error),

    #[error("metrics output is not utf-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
}

/// A `Metrics` backend writing to a prometheus registry.
#[derive(Clone, Debug, Default)]
pub struct PrometheusMetrics {
    registry: prometheus::Registry,
}

impl PrometheusMetrics {
    /// All registered metrics in the prometheus text format.
    pub fn export(&self) -> Result<String, PrometheusError> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }

    fn opts(name: &str, unit_label: Option<&str>) -> prometheus::Opts {
        prometheus::Opts::new(name, unit_label.unwrap_or(name))
    }

    fn register<M>(&self, m: M) -> Result<M, prometheus::Error>
    where
        M: prometheus::core::Collector + Clone + 'static,
    {
        self.registry.register(Box::new(m.clone()))?;
        Ok(m)
    }
}

impl Metrics for PrometheusMetrics {
    fn create_counter(&self, name: &str, unit_label: Option<&str>) -> Box<dyn Counter> {
        let c = prometheus::Counter::with_opts(Self::opts(name, unit_label))
            .and_then(|c| self.register(c));
        match c {
            Ok(c) => Box::new(PromCounter(c)),
            Err(err) => {
                warn!(%name, %err, "failed to create counter");
                Box::new(NoMetrics)
            }
        }
    }

    fn create_gauge(&self, name: &str, unit_label: Option<&str>) -> Box<dyn Gauge> {
        let g = prometheus::Gauge::with_opts(Self::opts(name, unit_label))
            .and_then(|g| self.register(g));
        match g {
            Ok(g) => Box::new(PromGauge(g)),
            Err(err) => {
                warn!(%name, %err, "failed to create gauge");
                Box::new(NoMetrics)
            }
        }
    }

    fn create_histogram(&self, name: &str, unit_label: Option<&str>) -> Box<dyn Histogram> {
        let h = prometheus::Histogram::with_opts(Self::opts(name, unit_label).into())
            .and_then(|h| self.register(h));
        match h {
            Ok(h) => Box::new(PromHistogram(h)),
            Err(err) => {
                warn!(%name, %err, "failed to create histogram");
                Box::new(NoMetrics)
            }
        }
    }
}
