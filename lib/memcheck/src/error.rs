// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use memcheck_config::ConfigError;
use thiserror::Error;

use crate::output::KeywordScore;
use crate::scanner::MetricKey;
use crate::verifier::Violation;

/// Errors raised while scanning a log or evaluating its memory envelope
#[derive(Debug, Error)]
pub enum MemCheckError {
    #[error("no enough memory usage information in log: {kv_samples} KV allocation samples, expected an even count")]
    MalformedLog { kv_samples: usize },

    #[error("log contains no '{metric}' samples")]
    MissingMetric { metric: MetricKey },

    #[error("invalid '{metric}' extraction pattern: {reason}")]
    InvalidExtractor { metric: MetricKey, reason: String },

    #[error("rank count must be at least 1")]
    InvalidRanks,

    #[error("memory usage check failed: {}", join(.0))]
    Violations(Vec<Violation>),

    #[error("incorrect generated output: {}", join(.0))]
    OutputMismatch(Vec<KeywordScore>),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

fn join<T: std::fmt::Display>(items: &[T]) -> String {
    items
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

pub type Result<T> = std::result::Result<T, MemCheckError>;
