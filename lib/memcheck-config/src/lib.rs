// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Memcheck Configuration Library
//!
//! Provides the settings consumed by the memory usage verifier: the global
//! on/off toggle, the comparison tolerance, the default KV cache fraction,
//! which comparisons are enforced, and a table of named model expectations.

mod checks;
mod expectations;

pub use checks::CheckPolicy;
pub use expectations::ModelExpectation;

use std::collections::BTreeMap;
use std::sync::OnceLock;

use figment::{
    Figment, Metadata, Profile, Provider,
    providers::{Env, Format, Serialized, Toml},
    value::{Dict, Map},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use validator::{Validate, ValidationErrors};

/// ENV pointing at an optional TOML configuration file
pub const CONFIG_PATH_ENV: &str = "MEMCHECK_CONFIG_PATH";

/// System-wide TOML configuration file
pub const SYSTEM_CONFIG_PATH: &str = "/opt/memcheck/etc/memcheck.toml";

/// ENV switching verification on or off
pub const ENABLED_ENV: &str = "MEMCHECK_ENABLED";

/// Legacy toggle kept for suites that already export it
pub const LEGACY_TOGGLE_ENV: &str = "TEST_MEM_USAGE";

/// Slack applied to every threshold comparison, in GiB
pub const DEFAULT_TOLERANCE_GIB: f64 = 0.3;

/// KV cache fraction assumed when the log never reports one
pub const DEFAULT_KV_FRACTION: f64 = 0.90;

static GLOBAL: OnceLock<MemCheckConfig> = OnceLock::new();

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to extract configuration: {0}")]
    Extraction(#[from] Box<figment::Error>),

    #[error("Configuration validation failed: {0}")]
    Validation(#[from] ValidationErrors),
}

fn default_enabled() -> bool {
    true
}

fn default_tolerance() -> f64 {
    DEFAULT_TOLERANCE_GIB
}

fn default_fraction() -> f64 {
    DEFAULT_KV_FRACTION
}

/// Top-level memory verification configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct MemCheckConfig {
    /// Global switch. When false every verification is a no-op.
    #[serde(
        default = "default_enabled",
        deserialize_with = "figment::util::bool_from_str_or_int"
    )]
    pub enabled: bool,

    /// Absolute tolerance for all comparisons, in GiB.
    #[validate(range(min = 0.0))]
    #[serde(default = "default_tolerance")]
    pub tolerance_gib: f64,

    /// Fraction used when no `fraction is set` line appears in the log.
    #[validate(range(exclusive_min = 0.0, max = 1.0))]
    #[serde(default = "default_fraction")]
    pub default_fraction: f64,

    /// Which comparisons are enforced.
    #[serde(default)]
    pub checks: CheckPolicy,

    /// Expected envelopes keyed by model name.
    #[validate(custom(function = "expectations::validate_expectations"))]
    #[serde(default)]
    pub expectations: BTreeMap<String, ModelExpectation>,
}

impl Default for MemCheckConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            tolerance_gib: default_tolerance(),
            default_fraction: default_fraction(),
            checks: CheckPolicy::default(),
            expectations: BTreeMap::new(),
        }
    }
}

impl MemCheckConfig {
    /// Create a Figment configuration with all sources merged.
    ///
    /// Configuration sources in priority order (lowest to highest):
    /// 1. Code defaults
    /// 2. System config file at /opt/memcheck/etc/memcheck.toml
    /// 3. TOML file from MEMCHECK_CONFIG_PATH environment variable
    /// 4. Environment variables (MEMCHECK_* prefixed)
    /// 5. The on/off toggle, see [`env_toggle`]
    pub fn figment() -> Figment {
        let config_path = std::env::var(CONFIG_PATH_ENV).unwrap_or_default();

        let figment = Figment::new()
            .merge(Serialized::defaults(MemCheckConfig::default()))
            .merge(Toml::file(SYSTEM_CONFIG_PATH))
            .merge(Toml::file(&config_path))
            // Top level: MEMCHECK_TOLERANCE_GIB, MEMCHECK_DEFAULT_FRACTION
            .merge(Env::prefixed("MEMCHECK_").only(&["tolerance_gib", "default_fraction"]))
            // Check policy: MEMCHECK_CHECKS_PEAK, MEMCHECK_CHECKS_MODEL_SIZE, etc.
            .merge(
                Env::prefixed("MEMCHECK_CHECKS_")
                    .map(|k| format!("checks.{}", k.as_str().to_lowercase()).into()),
            );

        match env_toggle() {
            Some(enabled) => figment.merge(("enabled", enabled)),
            None => figment,
        }
    }

    /// Load configuration from default figment (env and files).
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::extract_from(Self::figment())
    }

    /// Extract configuration from any provider and validate it.
    pub fn extract_from<T: Provider>(provider: T) -> Result<Self, ConfigError> {
        let config: Self = Figment::from(provider)
            .extract()
            .map_err(|e| ConfigError::Extraction(Box::new(e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Build a figment from defaults, then merge a custom provider.
    ///
    /// # Example
    /// ```rust,ignore
    /// let figment = MemCheckConfig::figment_with(("tolerance_gib", 0.5));
    /// let config = MemCheckConfig::extract_from(figment)?;
    /// ```
    pub fn figment_with<T: Provider>(extra: T) -> Figment {
        Self::figment().merge(extra)
    }

    /// Process-wide configuration, loaded from the environment on first use.
    ///
    /// A configuration that fails to load or validate falls back to the
    /// defaults. The on/off toggle is still honored in that case.
    pub fn global() -> &'static MemCheckConfig {
        GLOBAL.get_or_init(Self::from_env_or_default)
    }

    fn from_env_or_default() -> Self {
        match Self::from_env() {
            Ok(config) => config,
            Err(e) => {
                let enabled = env_toggle().unwrap_or_else(default_enabled);
                tracing::warn!(enabled, "Failed to load memcheck configuration, using defaults: {e}");
                Self {
                    enabled,
                    ..Default::default()
                }
            }
        }
    }

    /// A configuration with verification switched off.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Default::default()
        }
    }

    /// Look up the expected envelope for a named model.
    pub fn expectation(&self, model: &str) -> Option<&ModelExpectation> {
        self.expectations.get(model)
    }
}

impl Provider for MemCheckConfig {
    fn metadata(&self) -> Metadata {
        Metadata::named("MemCheckConfig")
    }

    fn data(&self) -> Result<Map<Profile, Dict>, figment::Error> {
        Serialized::defaults(self).data()
    }
}

/// The on/off toggle from the environment, if either variable is set.
///
/// `MEMCHECK_ENABLED` wins over the legacy `TEST_MEM_USAGE`. Values are read
/// with [`env_is_truthy`].
pub fn env_toggle() -> Option<bool> {
    std::env::var(ENABLED_ENV)
        .or_else(|_| std::env::var(LEGACY_TOGGLE_ENV))
        .ok()
        .map(|value| env_is_truthy(&value))
}

/// Interpret a toggle value the way shell-driven test suites set it.
///
/// `0`, `false`, `no`, `off` and the empty string switch the toggle off;
/// anything else switches it on.
pub fn env_is_truthy(value: &str) -> bool {
    !matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "" | "0" | "false" | "no" | "off"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_ENV: [&str; 8] = [
        CONFIG_PATH_ENV,
        LEGACY_TOGGLE_ENV,
        ENABLED_ENV,
        "MEMCHECK_TOLERANCE_GIB",
        "MEMCHECK_DEFAULT_FRACTION",
        "MEMCHECK_CHECKS_PEAK",
        "MEMCHECK_CHECKS_MODEL_SIZE",
        "MEMCHECK_CHECKS_EXTRA",
    ];

    #[test]
    fn test_default_config() {
        let config = MemCheckConfig::default();
        assert!(config.enabled);
        assert_eq!(config.tolerance_gib, 0.3);
        assert_eq!(config.default_fraction, 0.90);
        assert_eq!(config.checks, CheckPolicy::default());
        assert!(config.expectations.is_empty());
    }

    #[test]
    fn test_figment_defaults() {
        temp_env::with_vars_unset(ALL_ENV, || {
            let config = MemCheckConfig::from_env().unwrap();
            assert!(config.enabled);
            assert_eq!(config.tolerance_gib, DEFAULT_TOLERANCE_GIB);
        });
    }

    #[test]
    fn test_legacy_toggle_disables() {
        temp_env::with_vars(
            [
                (LEGACY_TOGGLE_ENV, Some("0")),
                (CONFIG_PATH_ENV, None),
                ("MEMCHECK_ENABLED", None),
            ],
            || {
                let config = MemCheckConfig::from_env().unwrap();
                assert!(!config.enabled);
            },
        );
    }

    #[test]
    fn test_prefixed_env_overrides_legacy_toggle() {
        temp_env::with_vars(
            [
                (LEGACY_TOGGLE_ENV, Some("false")),
                ("MEMCHECK_ENABLED", Some("true")),
                (CONFIG_PATH_ENV, None),
            ],
            || {
                let config = MemCheckConfig::from_env().unwrap();
                assert!(config.enabled);
            },
        );
    }

    #[test]
    fn test_enabled_env_accepts_shell_values() {
        for value in ["off", "no", "", "0", "false"] {
            temp_env::with_vars(
                [
                    (ENABLED_ENV, Some(value)),
                    (LEGACY_TOGGLE_ENV, None),
                    (CONFIG_PATH_ENV, None),
                ],
                || {
                    let config = MemCheckConfig::from_env().unwrap();
                    assert!(!config.enabled, "{value:?}");
                },
            );
        }
        temp_env::with_vars(
            [
                (ENABLED_ENV, Some("on")),
                (LEGACY_TOGGLE_ENV, Some("0")),
                (CONFIG_PATH_ENV, None),
            ],
            || assert!(MemCheckConfig::from_env().unwrap().enabled),
        );
    }

    #[test]
    fn test_toggle_survives_invalid_config() {
        temp_env::with_vars(
            [
                (LEGACY_TOGGLE_ENV, Some("0")),
                (ENABLED_ENV, None),
                ("MEMCHECK_TOLERANCE_GIB", Some("0.3GiB")),
                (CONFIG_PATH_ENV, None),
            ],
            || {
                assert!(MemCheckConfig::from_env().is_err());
                let config = MemCheckConfig::from_env_or_default();
                assert!(!config.enabled);
                assert_eq!(config.tolerance_gib, DEFAULT_TOLERANCE_GIB);
            },
        );
    }

    #[test]
    fn test_invalid_config_falls_back_enabled() {
        temp_env::with_vars(
            [
                (LEGACY_TOGGLE_ENV, None),
                (ENABLED_ENV, None),
                ("MEMCHECK_DEFAULT_FRACTION", Some("2.0")),
                (CONFIG_PATH_ENV, None),
            ],
            || assert!(MemCheckConfig::from_env_or_default().enabled),
        );
    }

    #[test]
    fn test_env_override_tolerance_and_checks() {
        temp_env::with_vars(
            [
                ("MEMCHECK_TOLERANCE_GIB", Some("0.5")),
                ("MEMCHECK_CHECKS_MODEL_SIZE", Some("true")),
                ("MEMCHECK_CHECKS_PEAK", Some("false")),
                (CONFIG_PATH_ENV, None),
            ],
            || {
                let config = MemCheckConfig::from_env().unwrap();
                assert_eq!(config.tolerance_gib, 0.5);
                assert!(config.checks.model_size);
                assert!(!config.checks.peak);
                assert!(config.checks.kv_floor);
            },
        );
    }

    #[test]
    fn test_toml_file_expectations() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        std::io::Write::write_all(
            &mut file,
            br#"
tolerance_gib = 0.25

[expectations."Llama3.1-8B-BF16"]
peak_gib = 18.60

[expectations."DeepSeek-R1-FP4"]
peak_gib = 85.6
ranks = 8
"#,
        )
        .unwrap();
        let path = file.path().to_str().unwrap().to_string();

        temp_env::with_vars(
            [
                (CONFIG_PATH_ENV, Some(path.as_str())),
                (LEGACY_TOGGLE_ENV, None),
                ("MEMCHECK_TOLERANCE_GIB", None),
            ],
            || {
                let config = MemCheckConfig::from_env().unwrap();
                assert_eq!(config.tolerance_gib, 0.25);
                let llama = config.expectation("Llama3.1-8B-BF16").unwrap();
                assert_eq!(llama.peak_gib, 18.60);
                assert_eq!(llama.ranks, 1);
                assert_eq!(config.expectation("DeepSeek-R1-FP4").unwrap().ranks, 8);
                assert!(config.expectation("unknown").is_none());
            },
        );
    }

    #[test]
    fn test_invalid_fraction_rejected() {
        temp_env::with_vars_unset(ALL_ENV, || {
            let result = MemCheckConfig::extract_from(MemCheckConfig::figment_with((
                "default_fraction",
                1.5,
            )));
            assert!(matches!(result, Err(ConfigError::Validation(_))));
        });
    }

    #[test]
    fn test_invalid_expectation_rejected() {
        temp_env::with_vars_unset(ALL_ENV, || {
            let mut config = MemCheckConfig::default();
            config
                .expectations
                .insert("bad".to_string(), ModelExpectation::new(10.0).with_ranks(0));
            let result = MemCheckConfig::extract_from(&config);
            assert!(matches!(result, Err(ConfigError::Validation(_))));
        });
    }

    #[test]
    fn test_config_as_provider() {
        let original = MemCheckConfig {
            tolerance_gib: 0.1,
            checks: CheckPolicy::all(),
            ..Default::default()
        };

        let extracted: MemCheckConfig = Figment::from(&original).extract().unwrap();
        assert_eq!(extracted.tolerance_gib, 0.1);
        assert_eq!(extracted.checks, CheckPolicy::all());
    }

    #[test]
    fn test_env_is_truthy() {
        for value in ["1", "true", "True", "yes", "on", "anything"] {
            assert!(env_is_truthy(value), "{value}");
        }
        for value in ["", "0", "false", "FALSE", "no", "off", " 0 "] {
            assert!(!env_is_truthy(value), "{value}");
        }
    }
}
