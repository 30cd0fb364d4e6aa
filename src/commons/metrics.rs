//! Metrics points and counters.
//!
//! Components hand measurement points to a [`MetricsSink`]. Shipping them to
//! a time series database is left to the sink; the sinks here log points or
//! keep them in memory.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use log::info;
use serde::Serialize;

use crate::constants::METRICS_LOG_TARGET;

//------------ FieldValue ----------------------------------------------------

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(untagged)]
pub enum FieldValue {
    Int(i64),
    Float(f64),
    Str(String),
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        FieldValue::Int(v)
    }
}

impl From<u16> for FieldValue {
    fn from(v: u16) -> Self {
        FieldValue::Int(v.into())
    }
}

impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        FieldValue::Float(v)
    }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        FieldValue::Str(v.to_string())
    }
}

//------------ MetricsPoint --------------------------------------------------

#[derive(Clone, Debug, Serialize)]
pub struct MetricsPoint {
    pub measurement: String,
    pub tags: BTreeMap<String, String>,
    pub fields: BTreeMap<String, FieldValue>,
    pub time: DateTime<Utc>,
}

impl MetricsPoint {
    pub fn new(measurement: &str) -> Self {
        MetricsPoint {
            measurement: measurement.to_string(),
            tags: BTreeMap::new(),
            fields: BTreeMap::new(),
            time: Utc::now(),
        }
    }

    pub fn tag(mut self, key: &str, value: impl fmt::Display) -> Self {
        self.tags.insert(key.to_string(), value.to_string());
        self
    }

    pub fn field(mut self, key: &str, value: impl Into<FieldValue>) -> Self {
        self.fields.insert(key.to_string(), value.into());
        self
    }

    pub fn get_tag(&self, key: &str) -> Option<&str> {
        self.tags.get(key).map(String::as_str)
    }
}

//------------ MetricsSink ---------------------------------------------------

pub trait MetricsSink: fmt::Debug + Send + Sync {
    fn add_point(&self, point: MetricsPoint);
}

/// Logs every point as a JSON line.
#[derive(Debug, Default)]
pub struct LogMetrics;

impl MetricsSink for LogMetrics {
    fn add_point(&self, point: MetricsPoint) {
        if let Ok(json) = serde_json::to_string(&point) {
            info!(target: METRICS_LOG_TARGET, "{}", json);
        }
    }
}

/// Keeps all points in memory.
#[derive(Debug, Default)]
pub struct MemoryMetrics {
    points: Mutex<Vec<MetricsPoint>>,
}

impl MemoryMetrics {
    pub fn points(&self) -> Vec<MetricsPoint> {
        self.points.lock().map(|p| p.clone()).unwrap_or_default()
    }

    pub fn points_for(&self, measurement: &str) -> Vec<MetricsPoint> {
        self.points()
            .into_iter()
            .filter(|p| p.measurement == measurement)
            .collect()
    }
}

impl MetricsSink for MemoryMetrics {
    fn add_point(&self, point: MetricsPoint) {
        if let Ok(mut points) = self.points.lock() {
            points.push(point);
        }
    }
}

//------------ Counters ------------------------------------------------------

/// Named monotonic counters.
#[derive(Debug, Default)]
pub struct Counters {
    counts: Mutex<BTreeMap<String, u64>>,
}

impl Counters {
    pub fn increment(&self, name: &str) {
        if let Ok(mut counts) = self.counts.lock() {
            *counts.entry(name.to_string()).or_default() += 1;
        }
    }

    pub fn get(&self, name: &str) -> u64 {
        self.counts
            .lock()
            .ok()
            .and_then(|counts| counts.get(name).copied())
            .unwrap_or_default()
    }

    pub fn snapshot(&self) -> BTreeMap<String, u64> {
        self.counts.lock().map(|c| c.clone()).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_count() {
        let counters = Counters::default();
        counters.increment("good");
        counters.increment("good");
        counters.increment("notfound");
        assert_eq!(counters.get("good"), 2);
        assert_eq!(counters.get("notfound"), 1);
        assert_eq!(counters.get("servererror"), 0);
    }

    #[test]
    fn points_keep_tags_and_fields() {
        let sink = MemoryMetrics::default();
        sink.add_point(
            MetricsPoint::new("upper_ca_info")
                .tag("host", "https://ca")
                .field("status", 200u16),
        );
        let points = sink.points_for("upper_ca_info");
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].get_tag("host"), Some("https://ca"));
        assert_eq!(points[0].fields["status"], FieldValue::Int(200));
    }
}
