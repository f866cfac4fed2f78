// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Keyword oracle for generated text.
//!
//! Quickstart-style runs print one block per prompt:
//!
//! ```text
//! [0] Prompt: 'Describe the image.', Generated text: 'A city skyline at night ...'
//! [1] Prompt: 'What is shown?', Generated text: 'Two dogs playing ...'
//! ```
//!
//! [`parse_generated_output`] recovers the generated strings in order and
//! [`check_keywords`] scores each one against a list of expected keywords.

use std::fmt;
use std::sync::OnceLock;

use regex::Regex;
use serde::Serialize;

use crate::error::{MemCheckError, Result};

static PROMPT_REGEX: OnceLock<Regex> = OnceLock::new();

static GENERATED_REGEX: OnceLock<Regex> = OnceLock::new();

fn get_prompt_regex() -> &'static Regex {
    PROMPT_REGEX
        .get_or_init(|| Regex::new(r"\[\d+\] Prompt:").expect("Failed to compile prompt regex"))
}

fn get_generated_regex() -> &'static Regex {
    GENERATED_REGEX.get_or_init(|| {
        Regex::new(r"Generated text: '(.*?)'").expect("Failed to compile generated text regex")
    })
}

/// Extract every `Generated text: '...'` payload, in order.
///
/// Line breaks inside a prompt block are removed before matching, so a
/// generation that spans several lines comes back as one string.
pub fn parse_generated_output(text: &str) -> Vec<String> {
    get_prompt_regex()
        .split(text)
        .flat_map(|block| {
            let block: String = block.chars().filter(|c| *c != '\n' && *c != '\r').collect();
            get_generated_regex()
                .captures_iter(&block)
                .filter_map(|caps| caps.get(1).map(|m| m.as_str().to_string()))
                .collect::<Vec<_>>()
        })
        .collect()
}

/// How one generated string fared against its keywords.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KeywordScore {
    pub generated: String,
    pub keywords: Vec<String>,
    /// Per-keyword hit flags, parallel to `keywords`.
    pub matches: Vec<bool>,
    pub ratio: f64,
    pub threshold: f64,
}

impl KeywordScore {
    pub fn score(generated: &str, keywords: &[String], threshold: f64) -> Self {
        let haystack = generated.to_lowercase();
        let matches: Vec<bool> = keywords
            .iter()
            .map(|k| haystack.contains(&k.to_lowercase()))
            .collect();
        let ratio = if matches.is_empty() {
            1.0
        } else {
            matches.iter().filter(|m| **m).count() as f64 / matches.len() as f64
        };
        Self {
            generated: generated.to_string(),
            keywords: keywords.to_vec(),
            matches,
            ratio,
            threshold,
        }
    }

    pub fn passed(&self) -> bool {
        self.ratio >= self.threshold
    }
}

impl fmt::Display for KeywordScore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "generated {:?}, expected keywords {:?}, matched {:?}, observed match ratio {:.2} below threshold {:.2}",
            self.generated, self.keywords, self.matches, self.ratio, self.threshold
        )
    }
}

/// Score `outputs` against `expected` pairwise.
///
/// Pairs stop at the shorter of the two lists. Returns every score when all
/// pass, otherwise [`MemCheckError::OutputMismatch`] with the failing ones.
pub fn check_keywords(
    outputs: &[String],
    expected: &[Vec<String>],
    match_ratio: f64,
) -> Result<Vec<KeywordScore>> {
    if outputs.len() != expected.len() {
        tracing::warn!(
            outputs = outputs.len(),
            expected = expected.len(),
            "generated output count differs from expectation count"
        );
    }

    let scores: Vec<KeywordScore> = outputs
        .iter()
        .zip(expected)
        .map(|(generated, keywords)| KeywordScore::score(generated, keywords, match_ratio))
        .collect();

    let failures: Vec<KeywordScore> = scores.iter().filter(|s| !s.passed()).cloned().collect();
    if !failures.is_empty() {
        for failure in &failures {
            tracing::error!("Incorrect output: {failure}");
        }
        return Err(MemCheckError::OutputMismatch(failures));
    }
    Ok(scores)
}
