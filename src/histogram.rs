//! # Latency Histogram Accumulation
//!
//! A [`RunData`] keeps a frequency table of latency samples for one source:
//! a CPU core, a measurement thread, or the `system` aggregate. Memory use is
//! bounded by the number of distinct latency values, not by run length, so a
//! multi-hour run sampling tens of thousands of events per second costs the
//! same as a short one.
//!
//! Summary statistics are derived on demand by [`RunData::reduce`]; only
//! `min`, `max` and the sample count are maintained as samples arrive.

use crate::report::ReportNode;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

/// Kind of latency source a histogram describes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    /// A single CPU core or measurement thread
    Core,
    /// Aggregate over all cores
    System,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Core => "core",
            SourceKind::System => "system",
        }
    }
}

impl std::fmt::Display for SourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Statistics derived from a latency histogram (all values in microseconds)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LatencyStatistics {
    pub mean: f64,
    pub mode: u64,
    pub median: f64,
    pub range: u64,
    pub mean_absolute_deviation: f64,
    pub variance: f64,
    pub std_dev: f64,
}

/// Per-source latency histogram with on-demand reduction
#[derive(Debug, Clone)]
pub struct RunData {
    id: String,
    kind: SourceKind,
    priority: u32,
    description: String,
    samples: BTreeMap<u64, u64>,
    sample_count: u64,
    min: Option<u64>,
    max: Option<u64>,
    stats: LatencyStatistics,
}

impl RunData {
    /// Create an empty histogram for a source
    pub fn new(id: impl Into<String>, kind: SourceKind, priority: u32) -> Self {
        Self {
            id: id.into(),
            kind,
            priority,
            description: String::new(),
            samples: BTreeMap::new(),
            sample_count: 0,
            min: None,
            max: None,
            stats: LatencyStatistics::default(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> SourceKind {
        self.kind
    }

    pub fn priority(&self) -> u32 {
        self.priority
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn set_description(&mut self, description: impl Into<String>) {
        self.description = description.into();
    }

    /// Record a single latency observation
    pub fn sample(&mut self, value: u64) {
        self.bucket(value, 1);
    }

    /// Add `count` observations of latency `index`
    ///
    /// Zero counts are kept in the table (histogram-mode samplers report every
    /// bucket in their fixed range) but never affect `min`, `max` or the
    /// sample count.
    pub fn bucket(&mut self, index: u64, count: u64) {
        *self.samples.entry(index).or_insert(0) += count;
        if count == 0 {
            return;
        }
        self.min = Some(self.min.map_or(index, |m| m.min(index)));
        self.max = Some(self.max.map_or(index, |m| m.max(index)));
        self.sample_count += count;
    }

    /// Total number of samples recorded
    pub fn sample_count(&self) -> u64 {
        self.sample_count
    }

    /// Smallest latency with a non-zero count
    pub fn min(&self) -> Option<u64> {
        self.min
    }

    /// Largest latency with a non-zero count
    pub fn max(&self) -> Option<u64> {
        self.max
    }

    /// Statistics computed by the last [`reduce`](Self::reduce) call
    pub fn statistics(&self) -> &LatencyStatistics {
        &self.stats
    }

    /// Iterate over non-empty buckets in ascending latency order
    pub fn buckets(&self) -> impl Iterator<Item = (u64, u64)> + '_ {
        self.samples
            .iter()
            .filter(|&(_, &count)| count > 0)
            .map(|(&value, &count)| (value, count))
    }

    /// Compute summary statistics from the frequency table
    ///
    /// Idempotent for unchanged samples. With fewer than two samples the
    /// dispersion measures are defined as zero; a single sample is its own
    /// mean, median and mode.
    pub fn reduce(&mut self) -> &LatencyStatistics {
        let n = self.sample_count;
        if n <= 1 {
            debug!("skipping {} ({} samples)", self.id, n);
            let only = if n == 1 { self.min.unwrap_or(0) } else { 0 };
            self.stats = LatencyStatistics {
                mean: only as f64,
                mode: only,
                median: only as f64,
                ..LatencyStatistics::default()
            };
            return &self.stats;
        }

        debug!("reducing {} ({} samples)", self.id, n);
        let mid = n / 2;
        let mut cumulative = 0u64;
        let mut weighted_sum = 0.0f64;
        let mut mode = 0u64;
        let mut mode_count = 0u64;
        let mut median = None;
        let mut previous: Option<u64> = None;

        for (value, count) in self.buckets() {
            if median.is_none() && mid >= cumulative && mid < cumulative + count {
                // An even split landing exactly on a bucket boundary straddles
                // two values; average them.
                let straddles = n % 2 == 0 && cumulative == mid;
                median = Some(match (straddles, previous) {
                    (true, Some(prev)) => (prev as f64 + value as f64) / 2.0,
                    _ => value as f64,
                });
            }
            cumulative += count;
            weighted_sum += value as f64 * count as f64;
            if count > mode_count {
                mode_count = count;
                mode = value;
            }
            previous = Some(value);
        }

        let mean = weighted_sum / n as f64;
        let range = match (self.min, self.max) {
            (Some(low), Some(high)) => high - low,
            _ => 0,
        };

        let mut abs_sum = 0.0f64;
        let mut sq_sum = 0.0f64;
        for (value, count) in self.buckets() {
            let delta = value as f64 - mean;
            abs_sum += delta.abs() * count as f64;
            sq_sum += delta * delta * count as f64;
        }
        let variance = sq_sum / (n - 1) as f64;

        self.stats = LatencyStatistics {
            mean,
            mode,
            median: median.unwrap_or(0.0),
            range,
            mean_absolute_deviation: abs_sum / n as f64,
            variance,
            std_dev: variance.sqrt(),
        };
        &self.stats
    }

    /// Build the report subtree for this source
    pub fn make_report(&self) -> ReportNode {
        let mut node = ReportNode::new(self.kind.as_str());
        node = match self.kind {
            SourceKind::System => node.attr("description", &self.description),
            SourceKind::Core => node
                .attr("id", &self.id)
                .attr("priority", self.priority)
                .attr("description", &self.description),
        };

        let us = |name: &str, value: String| ReportNode::leaf(name, value).attr("unit", "us");
        let stats = &self.stats;
        let statistics = ReportNode::new("statistics")
            .child(ReportNode::leaf("samples", self.sample_count))
            .child(us("minimum", self.min.unwrap_or(0).to_string()))
            .child(us("maximum", self.max.unwrap_or(0).to_string()))
            .child(us("median", stats.median.to_string()))
            .child(us("mode", stats.mode.to_string()))
            .child(us("range", stats.range.to_string()))
            .child(us("mean", stats.mean.to_string()))
            .child(us(
                "mean_absolute_deviation",
                stats.mean_absolute_deviation.to_string(),
            ))
            .child(us("variance", stats.variance.to_string()))
            .child(us("standard_deviation", stats.std_dev.to_string()));

        let mut histogram = ReportNode::new("histogram");
        let mut nbuckets = 0usize;
        for (index, count) in self.buckets() {
            histogram.push(
                ReportNode::new("bucket")
                    .attr("index", index)
                    .attr("value", count),
            );
            nbuckets += 1;
        }
        histogram.set_attr("nbuckets", nbuckets);

        node.child(statistics).child(histogram)
    }
}
