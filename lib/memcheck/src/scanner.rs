// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Single-pass extraction of memory metrics from an inference log.
//!
//! The scanner owns a metric extraction table: each row pairs a [`MetricKey`]
//! with a regular expression carrying exactly one `digits.digits` capture
//! group. Every line is tested against every row and each match appends its
//! value to the series for that key, in log order. Rows are independent, so a
//! line may feed more than one series.
//!
//! Order matters for two derived values: the KV allocation series is split in
//! half (the first half belongs to the profiling pass) and the KV cache
//! fraction takes the last reported value.

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::sync::OnceLock;

use memcheck_config::DEFAULT_KV_FRACTION;
use regex::Regex;
use serde::Serialize;

use crate::error::{MemCheckError, Result};

/// Metrics recognised in the inference log
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKey {
    /// `[MemUsageChange] Allocated <x> GiB`: KV cache allocation, once per pass and rank.
    KvAllocation,
    /// `fraction is set <x>,`: KV cache share of free device memory.
    Fraction,
    /// `device total memory <x> GiB`
    DeviceTotal,
    /// Peak memory during profiling, torch and non-torch combined.
    PeakMemory,
    /// Memory used outside torch during profiling (NCCL, CUDA graphs).
    ExtraMemory,
    /// Memory dynamically allocated inside torch during profiling.
    ActivationMemory,
    /// Memory used inside torch after loading the weights.
    ModelMemory,
    /// `tmp kv_mem <x> GiB`: temporary KV cache created for profiling.
    TmpKvMemory,
    /// Memory used outside torch after loading the weights.
    StartTimeMemory,
}

impl MetricKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKey::KvAllocation => "kv_allocation",
            MetricKey::Fraction => "fraction",
            MetricKey::DeviceTotal => "device_total",
            MetricKey::PeakMemory => "peak_memory",
            MetricKey::ExtraMemory => "extra_memory",
            MetricKey::ActivationMemory => "activation_memory",
            MetricKey::ModelMemory => "model_memory",
            MetricKey::TmpKvMemory => "tmp_kv_memory",
            MetricKey::StartTimeMemory => "start_time_memory",
        }
    }
}

impl fmt::Display for MetricKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Built-in extraction table. Patterns mirror the producer's INFO-level log text.
pub const METRIC_TABLE: &[(MetricKey, &str)] = &[
    (
        MetricKey::KvAllocation,
        r"\[MemUsageChange\] Allocated (\d+\.\d+) GiB ",
    ),
    (MetricKey::Fraction, r"fraction is set (\d+\.\d+), "),
    (MetricKey::DeviceTotal, r"device total memory (\d+\.\d+) GiB"),
    (
        MetricKey::PeakMemory,
        r"Peak memory during memory usage profiling \(torch \+ non-torch\): (\d+\.\d+) GiB",
    ),
    (
        MetricKey::ExtraMemory,
        r"Memory used outside torch \(e\.g\., NCCL and CUDA graphs\) in memory usage profiling: (\d+\.\d+) GiB",
    ),
    (
        MetricKey::ActivationMemory,
        r"Memory dynamically allocated during inference \(inside torch\) in memory usage profiling: (\d+\.\d+) GiB",
    ),
    (
        MetricKey::ModelMemory,
        r"Memory used after loading model weights \(inside torch\) in memory usage profiling: (\d+\.\d+) GiB",
    ),
    (MetricKey::TmpKvMemory, r"tmp kv_mem (\d+\.\d+) GiB"),
    (
        MetricKey::StartTimeMemory,
        r"Memory used after loading model weights \(outside torch\) in memory usage profiling: (\d+\.\d+) GiB",
    ),
];

static DEFAULT_EXTRACTORS: OnceLock<Vec<MetricExtractor>> = OnceLock::new();

fn default_extractors() -> &'static [MetricExtractor] {
    DEFAULT_EXTRACTORS.get_or_init(|| {
        METRIC_TABLE
            .iter()
            .map(|(key, pattern)| {
                MetricExtractor::new(*key, pattern).expect("Failed to compile metric regex")
            })
            .collect()
    })
}

/// One row of the extraction table.
#[derive(Debug, Clone)]
pub struct MetricExtractor {
    key: MetricKey,
    regex: Regex,
}

impl MetricExtractor {
    /// Compile a row. The pattern's first capture group must hold the value.
    pub fn new(key: MetricKey, pattern: &str) -> Result<Self> {
        let invalid = |reason: String| MemCheckError::InvalidExtractor {
            metric: key,
            reason,
        };
        let regex = Regex::new(pattern).map_err(|e| invalid(e.to_string()))?;
        // Group 0 is the whole match.
        if regex.captures_len() < 2 {
            return Err(invalid("pattern has no capture group".to_string()));
        }
        Ok(Self { key, regex })
    }

    pub fn key(&self) -> MetricKey {
        self.key
    }

    /// Value of the first match on `line`, if any.
    pub fn extract(&self, line: &str) -> Option<f64> {
        self.regex
            .captures(line)
            .and_then(|caps| caps.get(1))
            .and_then(|m| m.as_str().parse::<f64>().ok())
    }
}

/// Per-metric values in GiB, in the order they appeared in the log.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct ExtractedSeries {
    values: BTreeMap<MetricKey, Vec<f64>>,
}

impl ExtractedSeries {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, key: MetricKey, value: f64) {
        self.values.entry(key).or_default().push(value);
    }

    /// Samples for `key`; empty when the metric never appeared.
    pub fn get(&self, key: MetricKey) -> &[f64] {
        self.values.get(&key).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn iter(&self) -> impl Iterator<Item = (MetricKey, &[f64])> {
        self.values.iter().map(|(k, v)| (*k, v.as_slice()))
    }

    pub fn is_empty(&self) -> bool {
        self.values.values().all(Vec::is_empty)
    }

    fn max(&self, key: MetricKey) -> Option<f64> {
        self.get(key).iter().copied().reduce(f64::max)
    }

    fn min(&self, key: MetricKey) -> Option<f64> {
        self.get(key).iter().copied().reduce(f64::min)
    }

    fn sum(&self, key: MetricKey) -> f64 {
        self.get(key).iter().sum()
    }
}

impl FromIterator<(MetricKey, f64)> for ExtractedSeries {
    fn from_iter<I: IntoIterator<Item = (MetricKey, f64)>>(iter: I) -> Self {
        let mut series = Self::new();
        for (key, value) in iter {
            series.push(key, value);
        }
        series
    }
}

/// Extracted series plus the per-rank scalars derived from them.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MemoryStats {
    pub series: ExtractedSeries,
    pub ranks: usize,
    /// Last reported KV cache fraction, or the default.
    pub fraction: f64,
    /// Mean of the second half of the KV allocation series, per rank.
    pub kv_mem_size: f64,
    /// Sum of temporary KV allocations, per rank.
    pub tmp_kv: f64,
    /// Non-torch memory after weight loading, less a 1 GiB baseline per rank.
    /// Zero when the log never reports it, rather than `-ranks` as a plain
    /// `sum - ranks` over an empty series would give.
    pub start_time_mem: f64,
}

impl MemoryStats {
    /// Derive the scalars from raw series.
    ///
    /// Fails with [`MemCheckError::MalformedLog`] when the KV allocation
    /// series does not hold a complete pair of passes.
    pub fn derive(series: ExtractedSeries, ranks: usize, default_fraction: f64) -> Result<Self> {
        if ranks == 0 {
            return Err(MemCheckError::InvalidRanks);
        }
        let ranks_f = ranks as f64;

        let kv = series.get(MetricKey::KvAllocation);
        if kv.len() % 2 != 0 {
            return Err(MemCheckError::MalformedLog {
                kv_samples: kv.len(),
            });
        }
        let steady = &kv[kv.len() / 2..];
        let kv_mean = if steady.is_empty() {
            0.0
        } else {
            steady.iter().sum::<f64>() / steady.len() as f64
        };

        // One 1 GiB baseline per rank; nothing to subtract when the metric is absent.
        let start_time = series.get(MetricKey::StartTimeMemory);
        let start_time_mem = if start_time.is_empty() {
            0.0
        } else {
            start_time.iter().sum::<f64>() - ranks_f
        };

        let fraction = series
            .get(MetricKey::Fraction)
            .last()
            .copied()
            .unwrap_or(default_fraction);

        Ok(Self {
            ranks,
            fraction,
            kv_mem_size: kv_mean / ranks_f,
            tmp_kv: series.sum(MetricKey::TmpKvMemory) / ranks_f,
            start_time_mem,
            series,
        })
    }

    /// Largest profiled peak.
    pub fn peak(&self) -> Option<f64> {
        self.series.max(MetricKey::PeakMemory)
    }

    /// Smallest device total across ranks.
    pub fn min_total(&self) -> Option<f64> {
        self.series.min(MetricKey::DeviceTotal)
    }

    pub fn model_size(&self) -> Option<f64> {
        self.series.max(MetricKey::ModelMemory)
    }

    pub fn extra(&self) -> Option<f64> {
        self.series.max(MetricKey::ExtraMemory)
    }

    pub fn activation(&self) -> &[f64] {
        self.series.get(MetricKey::ActivationMemory)
    }
}

/// Applies an extraction table to a log source.
#[derive(Debug, Clone)]
pub struct LogScanner {
    extractors: Cow<'static, [MetricExtractor]>,
    default_fraction: f64,
}

impl Default for LogScanner {
    fn default() -> Self {
        Self {
            extractors: Cow::Borrowed(default_extractors()),
            default_fraction: DEFAULT_KV_FRACTION,
        }
    }
}

impl LogScanner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the extraction table.
    pub fn with_extractors(mut self, extractors: Vec<MetricExtractor>) -> Self {
        self.extractors = Cow::Owned(extractors);
        self
    }

    /// Fraction reported when the log never sets one.
    pub fn with_default_fraction(mut self, fraction: f64) -> Self {
        self.default_fraction = fraction;
        self
    }

    pub fn extractors(&self) -> &[MetricExtractor] {
        &self.extractors
    }

    /// Apply every row of the table to one line.
    pub fn scan_line(&self, line: &str, series: &mut ExtractedSeries) {
        for extractor in self.extractors.iter() {
            if let Some(value) = extractor.extract(line) {
                series.push(extractor.key, value);
            }
        }
    }

    /// Read `reader` to the end and derive the memory statistics.
    ///
    /// The source must be complete; a log still being written is not supported.
    /// Lines that are not valid UTF-8 are decoded lossily.
    pub fn scan<R: BufRead>(&self, mut reader: R, ranks: usize) -> Result<MemoryStats> {
        if ranks == 0 {
            return Err(MemCheckError::InvalidRanks);
        }

        let mut series = ExtractedSeries::new();
        let mut buf = Vec::new();
        let mut lines = 0usize;
        loop {
            buf.clear();
            if reader.read_until(b'\n', &mut buf)? == 0 {
                break;
            }
            lines += 1;
            self.scan_line(&String::from_utf8_lossy(&buf), &mut series);
        }

        tracing::debug!(
            lines,
            kv_samples = series.get(MetricKey::KvAllocation).len(),
            "scanned memory log"
        );

        MemoryStats::derive(series, ranks, self.default_fraction)
    }

    pub fn scan_str(&self, text: &str, ranks: usize) -> Result<MemoryStats> {
        self.scan(text.as_bytes(), ranks)
    }

    pub fn scan_path(&self, path: impl AsRef<Path>, ranks: usize) -> Result<MemoryStats> {
        let file = File::open(path.as_ref())?;
        self.scan(BufReader::new(file), ranks)
    }
}
