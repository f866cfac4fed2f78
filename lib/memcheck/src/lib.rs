// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Log-derived memory usage verification for LLM inference runs.
//!
//! An inference process writes its memory profiling results to a text log.
//! After the process exits, [`LogScanner`] extracts the memory metrics in a
//! single pass and [`MemoryVerifier`] decides whether the run stayed within
//! its expected envelope. The [`output`] module provides the matching oracle
//! for generated text.
//!
//! Verification is switched off globally with `TEST_MEM_USAGE=0` or
//! `MEMCHECK_ENABLED=false`; see [`MemCheckConfig`].

pub mod error;
pub mod logging;
pub mod output;
pub mod scanner;
pub mod verifier;

pub use error::{MemCheckError, Result};
pub use memcheck_config::{CheckPolicy, ConfigError, MemCheckConfig, ModelExpectation, env_toggle};
pub use output::{KeywordScore, check_keywords, parse_generated_output};
pub use scanner::{ExtractedSeries, LogScanner, MemoryStats, MetricExtractor, MetricKey};
pub use verifier::{
    CheckKind, Comparison, ExpectedUsage, MemoryReport, MemoryVerifier, Verdict, Violation,
    check_mem_usage, kv_budget,
};
