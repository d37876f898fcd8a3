//! Metrics API.
//!
//! Components declare the metrics they report against the `Metrics` trait and
//! hold on to the returned handles. `NoMetrics` discards everything and is the
//! default wherever no backend has been configured.

use std::fmt::Debug;

use dyn_clone::DynClone;

pub trait Metrics: Send + Sync + DynClone + Debug {
    fn create_counter(&self, name: &str, unit_label: Option<&str>) -> Box<dyn Counter>;
    fn create_gauge(&self, name: &str, unit_label: Option<&str>) -> Box<dyn Gauge>;
    fn create_histogram(&self, name: &str, unit_label: Option<&str>) -> Box<dyn Histogram>;
}

pub trait Counter: Send + Sync + DynClone + Debug {
    fn add(&self, amount: usize);
}

pub trait Gauge: Send + Sync + DynClone + Debug {
    fn set(&self, amount: usize);
    fn update(&self, delta: i64);
}

pub trait Histogram: Send + Sync + DynClone + Debug {
    fn add_point(&self, point: f64);
}

dyn_clone::clone_trait_object!(Metrics);
dyn_clone::clone_trait_object!(Counter);
dyn_clone::clone_trait_object!(Gauge);
dyn_clone::clone_trait_object!(Histogram);

#[derive(Debug, Clone, Copy, Default)]
pub struct NoMetrics;

impl Metrics for NoMetrics {
    fn create_counter(&self, _: &str, _: Option<&str>) -> Box<dyn Counter> {
        Box::new(NoMetrics)
    }

    fn create_gauge(&self, _: &str, _: Option<&str>) -> Box<dyn Gauge> {
        Box::new(NoMetrics)
    }

    fn create_histogram(&self, _: &str, _: Option<&str>) -> Box<dyn Histogram> {
        Box::new(NoMetrics)
    }
}

impl Counter for NoMetrics {
    fn add(&self, _: usize) {}
}

impl Gauge for NoMetrics {
    fn set(&self, _: usize) {}
    fn update(&self, _: i64) {}
}

impl Histogram for NoMetrics {
    fn add_point(&self, _: f64) {}
}
