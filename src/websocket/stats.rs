//! Stats sampler for container resource monitoring
//!
//! Converts cumulative counters into per-interval deltas. Engines without
//! native interval reporting emit one raw sample per second; those are buffered
//! and summed until a full interval has been seen.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::engine::{EngineFeatures, RawReport, RawSample};

const LEGACY_SAMPLE_PERIOD: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct Counters {
    cpu_nanos: u64,
    net_input: u64,
    net_output: u64,
    block_input: u64,
    block_output: u64,
}

impl Counters {
    fn of(sample: &RawSample) -> Self {
        Self {
            cpu_nanos: sample.cpu_nanos,
            net_input: sample.net_input,
            net_output: sample.net_output,
            block_input: sample.block_input,
            block_output: sample.block_output,
        }
    }

    /// A counter that went backwards was reset; its current value is the delta.
    fn delta_since(&self, previous: &Counters) -> Counters {
        fn delta(current: u64, previous: u64) -> u64 {
            current.checked_sub(previous).unwrap_or(current)
        }

        Counters {
            cpu_nanos: delta(self.cpu_nanos, previous.cpu_nanos),
            net_input: delta(self.net_input, previous.net_input),
            net_output: delta(self.net_output, previous.net_output),
            block_input: delta(self.block_input, previous.block_input),
            block_output: delta(self.block_output, previous.block_output),
        }
    }

    fn add(&mut self, other: &Counters) {
        self.cpu_nanos = self.cpu_nanos.saturating_add(other.cpu_nanos);
        self.net_input = self.net_input.saturating_add(other.net_input);
        self.net_output = self.net_output.saturating_add(other.net_output);
        self.block_input = self.block_input.saturating_add(other.block_input);
        self.block_output = self.block_output.saturating_add(other.block_output);
    }
}

/// One resource's share of an interval
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResourceStats {
    pub id: String,
    pub name: String,
    /// Cores in use, averaged over the interval.
    pub cpu: f64,
    pub memory: u64,
    pub memory_limit: u64,
    pub net_input: u64,
    pub net_output: u64,
    pub block_input: u64,
    pub block_output: u64,
    #[serde(skip)]
    pub cpu_nanos: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StatsTotals {
    pub cpu: f64,
    pub memory: u64,
    pub net_input: u64,
    pub net_output: u64,
    pub block_input: u64,
    pub block_output: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatsSummary {
    pub read: DateTime<Utc>,
    pub interval_secs: f64,
    pub stats: Vec<ResourceStats>,
    pub total: StatsTotals,
}

impl StatsSummary {
    pub fn is_first(&self) -> bool {
        self.interval_secs == 0.0
    }
}

#[derive(Default)]
struct Accumulated {
    name: String,
    memory: u64,
    memory_limit: u64,
    counters: Counters,
}

pub struct StatsSampler {
    features: EngineFeatures,
    interval: Duration,
    window: usize,
    previous: HashMap<String, Counters>,
    last_read: Option<DateTime<Utc>>,
    pending: Vec<RawReport>,
}

impl StatsSampler {
    pub fn new(features: EngineFeatures, interval: Duration) -> Self {
        let interval = interval.max(LEGACY_SAMPLE_PERIOD);
        let window = (interval.as_secs() as usize).max(1);

        Self {
            features,
            interval,
            window,
            previous: HashMap::new(),
            last_read: None,
            pending: Vec::with_capacity(window),
        }
    }

    /// How often the engine feed should be asked to report.
    pub fn poll_interval(&self) -> Duration {
        if self.features.native_interval {
            self.interval
        } else {
            LEGACY_SAMPLE_PERIOD
        }
    }

    /// Feeds one raw report; returns a summary once an interval is complete.
    pub fn push(&mut self, mut report: RawReport) -> Option<StatsSummary> {
        if self.features.reversed_network {
            for sample in &mut report.samples {
                std::mem::swap(&mut sample.net_input, &mut sample.net_output);
            }
        }

        self.pending.push(report);

        let complete = self.features.native_interval
            || self.last_read.is_none()
            || self.pending.len() >= self.window;
        if !complete {
            return None;
        }

        let reports = std::mem::take(&mut self.pending);
        Some(self.summarize(reports))
    }

    fn summarize(&mut self, reports: Vec<RawReport>) -> StatsSummary {
        let first = self.last_read.is_none();
        let read = reports.last().map(|r| r.read).unwrap_or_else(Utc::now);

        let mut order: Vec<String> = Vec::new();
        let mut accumulated: HashMap<String, Accumulated> = HashMap::new();

        for report in &reports {
            for sample in &report.samples {
                let current = Counters::of(sample);
                let delta = match self.previous.get(&sample.id) {
                    Some(previous) => current.delta_since(previous),
                    None => current,
                };
                self.previous.insert(sample.id.clone(), current);

                let entry = accumulated.entry(sample.id.clone()).or_insert_with(|| {
                    order.push(sample.id.clone());
                    Accumulated::default()
                });
                entry.name = sample.name.clone();
                entry.memory = sample.memory;
                entry.memory_limit = sample.memory_limit;
                entry.counters.add(&delta);
            }
        }

        // forget resources that went away so a comeback counts as new
        self.previous.retain(|id, _| accumulated.contains_key(id));

        let elapsed = match self.last_read {
            Some(last) => {
                let secs = (read - last).num_milliseconds() as f64 / 1000.0;
                if secs > 0.0 { secs } else { self.interval.as_secs_f64() }
            }
            None => 0.0,
        };
        self.last_read = Some(read);

        let mut total = StatsTotals::default();
        let mut stats = Vec::with_capacity(order.len());

        for id in order {
            let Some(entry) = accumulated.remove(&id) else {
                continue;
            };
            // the very first report is cumulative since container start
            let counters = if first { Counters::default() } else { entry.counters };
            let cpu = if elapsed > 0.0 {
                counters.cpu_nanos as f64 / 1e9 / elapsed
            } else {
                0.0
            };

            total.cpu += cpu;
            total.memory = total.memory.saturating_add(entry.memory);
            total.net_input = total.net_input.saturating_add(counters.net_input);
            total.net_output = total.net_output.saturating_add(counters.net_output);
            total.block_input = total.block_input.saturating_add(counters.block_input);
            total.block_output = total.block_output.saturating_add(counters.block_output);

            stats.push(ResourceStats {
                id,
                name: entry.name,
                cpu,
                memory: entry.memory,
                memory_limit: entry.memory_limit,
                net_input: counters.net_input,
                net_output: counters.net_output,
                block_input: counters.block_input,
                block_output: counters.block_output,
                cpu_nanos: counters.cpu_nanos,
            });
        }

        StatsSummary {
            read,
            interval_secs: elapsed,
            stats,
            total,
        }
    }
}
