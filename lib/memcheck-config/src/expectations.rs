// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Named per-model memory expectations.
//!
//! Lets a suite keep its expected peak table in TOML instead of in code:
//!
//! ```toml
//! [expectations."Llama3.1-8B-BF16"]
//! peak_gib = 18.60
//!
//! [expectations."DeepSeek-R1-FP4"]
//! peak_gib = 85.6
//! ranks = 8
//! ```

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

fn default_ranks() -> usize {
    1
}

/// Expected memory envelope for a single named model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct ModelExpectation {
    /// Expected peak non-KV memory per rank, in GiB.
    #[validate(range(min = 0.0))]
    pub peak_gib: f64,

    /// Number of ranks the model is deployed across.
    #[validate(range(min = 1))]
    #[serde(default = "default_ranks")]
    pub ranks: usize,
}

impl ModelExpectation {
    pub fn new(peak_gib: f64) -> Self {
        Self {
            peak_gib,
            ranks: default_ranks(),
        }
    }

    pub fn with_ranks(mut self, ranks: usize) -> Self {
        self.ranks = ranks;
        self
    }
}

pub(crate) fn validate_expectations(
    expectations: &BTreeMap<String, ModelExpectation>,
) -> Result<(), ValidationError> {
    for (model, expectation) in expectations {
        if let Err(e) = expectation.validate() {
            let mut error = ValidationError::new("model_expectation");
            error.message = Some(format!("invalid expectation for '{model}': {e}").into());
            return Err(error);
        }
    }
    Ok(())
}
