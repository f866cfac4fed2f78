// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Pass/fail decision for a single run's memory envelope.
//!
//! The verifier scans a finished log, derives the KV cache budget the engine
//! should have claimed, and compares observed values against expectations:
//!
//! - `peak - tmp_kv <= expected_peak + start_time_mem + tolerance`
//! - `kv_mem_size >= (min_total - (expected_peak + start_time_mem)) * fraction - tolerance`
//!
//! Model-size and extra-memory comparisons are always computed and reported,
//! and only enforced when the [`CheckPolicy`] enables them.

use std::fmt;
use std::io::BufRead;

use memcheck_config::{CheckPolicy, MemCheckConfig, ModelExpectation};
use serde::Serialize;

use crate::error::{MemCheckError, Result};
use crate::scanner::{LogScanner, MemoryStats, MetricKey};

/// Caller-supplied expectations, in GiB per rank.
///
/// `kv_size` is accepted for call-site compatibility but never read: the
/// expected KV budget is always derived from the log (see [`kv_budget`]).
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ExpectedUsage {
    pub peak: f64,
    pub model_size: f64,
    pub kv_size: f64,
    pub extra: f64,
}

impl ExpectedUsage {
    /// Expectation with only a peak, the common case.
    pub fn peak(peak: f64) -> Self {
        Self {
            peak,
            ..Default::default()
        }
    }
}

impl From<[f64; 4]> for ExpectedUsage {
    fn from([peak, model_size, kv_size, extra]: [f64; 4]) -> Self {
        Self {
            peak,
            model_size,
            kv_size,
            extra,
        }
    }
}

impl From<&ModelExpectation> for ExpectedUsage {
    fn from(expectation: &ModelExpectation) -> Self {
        Self::peak(expectation.peak_gib)
    }
}

/// Device memory left after the non-KV peak, scaled by the KV cache fraction.
pub fn kv_budget(min_total: f64, used: f64, fraction: f64) -> f64 {
    (min_total - used) * fraction
}

/// A single memory comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckKind {
    Peak,
    KvFloor,
    ModelSize,
    Extra,
}

impl CheckKind {
    fn enforced(&self, policy: &CheckPolicy) -> bool {
        match self {
            CheckKind::Peak => policy.peak,
            CheckKind::KvFloor => policy.kv_floor,
            CheckKind::ModelSize => policy.model_size,
            CheckKind::Extra => policy.extra,
        }
    }
}

impl fmt::Display for CheckKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CheckKind::Peak => "peak memory",
            CheckKind::KvFloor => "kv memory size",
            CheckKind::ModelSize => "model memory",
            CheckKind::Extra => "extra memory size",
        };
        f.write_str(name)
    }
}

/// Outcome of one comparison.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Comparison {
    pub check: CheckKind,
    pub observed: f64,
    pub expected: f64,
    /// Bound after tolerance is applied.
    pub limit: f64,
    pub passed: bool,
    pub enforced: bool,
}

/// An enforced comparison that failed.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Violation {
    pub check: CheckKind,
    pub observed: f64,
    pub expected: f64,
    pub limit: f64,
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let relation = match self.check {
            CheckKind::KvFloor => "smaller",
            _ => "larger",
        };
        write!(
            f,
            "{} {:.2} GiB is {relation} than expected {:.2} GiB (limit {:.2} GiB)",
            self.check, self.observed, self.expected, self.limit
        )
    }
}

impl From<&Comparison> for Violation {
    fn from(c: &Comparison) -> Self {
        Self {
            check: c.check,
            observed: c.observed,
            expected: c.expected,
            limit: c.limit,
        }
    }
}

/// Expected versus observed memory for one run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MemoryReport {
    pub expected: ExpectedUsage,
    /// Expected peak including start-time non-torch memory.
    pub expected_peak: f64,
    /// Derived KV budget; replaces `expected.kv_size`.
    pub expected_kv: f64,
    pub stats: MemoryStats,
    pub peak: f64,
    pub min_total: f64,
    pub comparisons: Vec<Comparison>,
}

impl MemoryReport {
    pub fn violations(&self) -> Vec<Violation> {
        self.comparisons
            .iter()
            .filter(|c| c.enforced && !c.passed)
            .map(Violation::from)
            .collect()
    }
}

fn fmt_opt(value: Option<f64>) -> String {
    value.map_or_else(|| "n/a".to_string(), |v| format!("{v:.2}"))
}

impl fmt::Display for MemoryReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Expected memory usage: peak mem {:.2}, model mem {:.2}, kv mem {:.2}, extra {:.2}, total {:.2}",
            self.expected_peak,
            self.expected.model_size,
            self.expected_kv,
            self.expected.extra,
            self.min_total,
        )?;
        write!(
            f,
            "Running memory information: peak mem {:.2}, model mem {}, kv mem {:.2}, extra {}, total {:.2}, activation {:?}, tmp_kv {:.2}, fraction {:.2}, none-torch memory at starttime {:.2}",
            self.peak,
            fmt_opt(self.stats.model_size()),
            self.stats.kv_mem_size,
            fmt_opt(self.stats.extra()),
            self.min_total,
            self.stats.activation(),
            self.stats.tmp_kv,
            self.stats.fraction,
            self.stats.start_time_mem,
        )
    }
}

/// Result of a verification that did not fail.
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    /// Verification disabled or no log captured.
    Skipped,
    Passed(Box<MemoryReport>),
}

impl Verdict {
    pub fn is_skipped(&self) -> bool {
        matches!(self, Verdict::Skipped)
    }

    pub fn report(&self) -> Option<&MemoryReport> {
        match self {
            Verdict::Skipped => None,
            Verdict::Passed(report) => Some(&**report),
        }
    }
}

/// Checks a run's memory envelope against expectations.
#[derive(Debug, Clone)]
pub struct MemoryVerifier {
    config: MemCheckConfig,
    scanner: LogScanner,
}

impl Default for MemoryVerifier {
    fn default() -> Self {
        Self::new(&MemCheckConfig::default())
    }
}

impl MemoryVerifier {
    pub fn new(config: &MemCheckConfig) -> Self {
        Self {
            config: config.clone(),
            scanner: LogScanner::new().with_default_fraction(config.default_fraction),
        }
    }

    /// Verifier built from the process-wide configuration.
    pub fn from_settings() -> Self {
        Self::new(MemCheckConfig::global())
    }

    /// False when verification is switched off; every call is then a no-op.
    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Scan `log` and check it against `expected`.
    ///
    /// Returns [`Verdict::Skipped`] without reading anything when verification
    /// is disabled or `log` is `None`.
    pub fn verify<R: BufRead>(
        &self,
        log: Option<R>,
        expected: &ExpectedUsage,
        ranks: usize,
    ) -> Result<Verdict> {
        if !self.is_enabled() {
            tracing::debug!("memory usage verification disabled");
            return Ok(Verdict::Skipped);
        }
        let Some(log) = log else {
            tracing::debug!("no log captured, skipping memory usage verification");
            return Ok(Verdict::Skipped);
        };

        let stats = self.scanner.scan(log, ranks)?;
        let report = self.evaluate(stats, expected)?;
        Ok(Verdict::Passed(Box::new(report)))
    }

    /// Verify against the named expectation from the configuration.
    ///
    /// Models without an expectation are skipped.
    pub fn verify_model<R: BufRead>(&self, log: Option<R>, model: &str) -> Result<Verdict> {
        let Some(expectation) = self.config.expectation(model) else {
            tracing::debug!(model, "no memory expectation configured, skipping");
            return Ok(Verdict::Skipped);
        };
        self.verify(log, &ExpectedUsage::from(expectation), expectation.ranks)
    }

    /// Compare already-derived statistics against `expected`.
    pub fn evaluate(&self, stats: MemoryStats, expected: &ExpectedUsage) -> Result<MemoryReport> {
        let peak = stats.peak().ok_or(MemCheckError::MissingMetric {
            metric: MetricKey::PeakMemory,
        })?;
        let min_total = stats.min_total().ok_or(MemCheckError::MissingMetric {
            metric: MetricKey::DeviceTotal,
        })?;

        let expected_peak = expected.peak + stats.start_time_mem;
        let expected_kv = kv_budget(min_total, expected_peak, stats.fraction);
        let tol = self.config.tolerance_gib;

        let observed_peak = peak - stats.tmp_kv;
        let mut comparisons = vec![
            self.compare_ceiling(CheckKind::Peak, observed_peak, expected_peak),
            self.compare_floor(CheckKind::KvFloor, stats.kv_mem_size, expected_kv),
        ];

        match stats.model_size() {
            Some(model) => comparisons.push(self.compare_ceiling(
                CheckKind::ModelSize,
                model,
                expected.model_size,
            )),
            None if self.config.checks.model_size => {
                return Err(MemCheckError::MissingMetric {
                    metric: MetricKey::ModelMemory,
                });
            }
            None => {}
        }
        match stats.extra() {
            Some(extra) => {
                comparisons.push(self.compare_ceiling(CheckKind::Extra, extra, expected.extra))
            }
            None if self.config.checks.extra => {
                return Err(MemCheckError::MissingMetric {
                    metric: MetricKey::ExtraMemory,
                });
            }
            None => {}
        }

        let report = MemoryReport {
            expected: *expected,
            expected_peak,
            expected_kv,
            peak,
            min_total,
            stats,
            comparisons,
        };
        tracing::info!(tolerance = tol, "{report}");

        let violations = report.violations();
        if !violations.is_empty() {
            for v in &violations {
                tracing::error!("{v}");
            }
            return Err(MemCheckError::Violations(violations));
        }
        Ok(report)
    }

    fn compare_ceiling(&self, check: CheckKind, observed: f64, expected: f64) -> Comparison {
        let limit = expected + self.config.tolerance_gib;
        Comparison {
            check,
            observed,
            expected,
            limit,
            passed: observed <= limit,
            enforced: check.enforced(&self.config.checks),
        }
    }

    fn compare_floor(&self, check: CheckKind, observed: f64, expected: f64) -> Comparison {
        let limit = expected - self.config.tolerance_gib;
        Comparison {
            check,
            observed,
            expected,
            limit,
            passed: observed >= limit,
            enforced: check.enforced(&self.config.checks),
        }
    }
}

/// Verify with the process-wide configuration.
///
/// ```rust,ignore
/// let log = std::io::BufReader::new(std::fs::File::open("run.log")?);
/// memcheck::check_mem_usage(Some(log), [18.60, 0.0, 0.0, 0.0], 1)?;
/// ```
pub fn check_mem_usage<R: BufRead>(
    log: Option<R>,
    mem_info: impl Into<ExpectedUsage>,
    ranks: usize,
) -> Result<Verdict> {
    MemoryVerifier::from_settings().verify(log, &mem_info.into(), ranks)
}
