// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Per-metric enforcement policy.

use serde::{Deserialize, Serialize};

/// Which memory comparisons fail a run.
///
/// Every comparison is always computed and reported; these flags only decide
/// whether a violated comparison is turned into an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckPolicy {
    /// Observed non-KV peak must not exceed the expected peak.
    #[serde(deserialize_with = "figment::util::bool_from_str_or_int")]
    pub peak: bool,

    /// Observed KV cache allocation must reach the derived KV budget.
    #[serde(deserialize_with = "figment::util::bool_from_str_or_int")]
    pub kv_floor: bool,

    /// Largest model weight footprint must not exceed the expected model size.
    #[serde(deserialize_with = "figment::util::bool_from_str_or_int")]
    pub model_size: bool,

    /// Largest out-of-framework allocation must not exceed the expected extra memory.
    #[serde(deserialize_with = "figment::util::bool_from_str_or_int")]
    pub extra: bool,
}

impl Default for CheckPolicy {
    fn default() -> Self {
        Self {
            peak: true,
            kv_floor: true,
            model_size: false,
            extra: false,
        }
    }
}

impl CheckPolicy {
    /// Policy with every comparison enforced.
    pub fn all() -> Self {
        Self {
            peak: true,
            kv_floor: true,
            model_size: true,
            extra: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policy() {
        let policy = CheckPolicy::default();
        assert!(policy.peak);
        assert!(policy.kv_floor);
        assert!(!policy.model_size);
        assert!(!policy.extra);
    }

    #[test]
    fn test_all_policy() {
        let policy = CheckPolicy::all();
        assert!(policy.model_size && policy.extra);
    }
}
