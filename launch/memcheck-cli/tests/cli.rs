// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use std::io::Write;
use std::process::{Command, Output};

use tempfile::NamedTempFile;

const PASSING_LOG: &str = "\
[MemUsageChange] Allocated 2.00 GiB for max tokens
Peak memory during memory usage profiling (torch + non-torch): 10.00 GiB
device total memory 80.00 GiB
[MemUsageChange] Allocated 70.00 GiB for max tokens
";

fn memcheck() -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_memcheck"));
    cmd.env_remove("TEST_MEM_USAGE")
        .env_remove("MEMCHECK_ENABLED")
        .env_remove("MEMCHECK_CONFIG_PATH")
        .env("MEMCHECK_LOG", "error");
    cmd
}

fn write_file(contents: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).to_string()
}

#[test]
fn verify_passes_within_envelope() {
    let log = write_file(PASSING_LOG);
    let output = memcheck()
        .args(["verify", "--peak", "9.8", "--log"])
        .arg(log.path())
        .output()
        .unwrap();
    assert!(output.status.success(), "{output:?}");
    assert!(stdout(&output).contains("memory usage within expectations"));
}

#[test]
fn verify_fails_over_peak() {
    let log = write_file(PASSING_LOG);
    let output = memcheck()
        .args(["verify", "--peak", "9.0", "--log"])
        .arg(log.path())
        .output()
        .unwrap();
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("peak memory 10.00 GiB is larger than expected 9.00 GiB"), "{stderr}");
}

#[test]
fn verify_skipped_when_disabled() {
    let log = write_file("[MemUsageChange] Allocated 2.00 GiB \n");
    let output = memcheck()
        .env("TEST_MEM_USAGE", "0")
        .args(["verify", "--peak", "0.0", "--log"])
        .arg(log.path())
        .output()
        .unwrap();
    assert!(output.status.success(), "{output:?}");
    assert!(stdout(&output).contains("skipped"));
}

#[test]
fn verify_disabled_does_not_open_log() {
    let output = memcheck()
        .env("TEST_MEM_USAGE", "0")
        .args(["verify", "--peak", "9.8", "--log", "/nonexistent/memcheck/run.log"])
        .output()
        .unwrap();
    assert!(output.status.success(), "{output:?}");
    assert!(stdout(&output).contains("skipped"));
}

#[test]
fn verify_disabled_ignores_invalid_config() {
    let output = memcheck()
        .env("TEST_MEM_USAGE", "0")
        .env("MEMCHECK_TOLERANCE_GIB", "0.3GiB")
        .args(["verify", "--peak", "9.8", "--log", "/nonexistent/memcheck/run.log"])
        .output()
        .unwrap();
    assert!(output.status.success(), "{output:?}");
    assert!(stdout(&output).contains("skipped"));
}

#[test]
fn verify_missing_log_fails_when_enabled() {
    let output = memcheck()
        .args(["verify", "--peak", "9.8", "--log", "/nonexistent/memcheck/run.log"])
        .output()
        .unwrap();
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("failed to open log"), "{stderr}");
}

fn model_config() -> NamedTempFile {
    write_file("[expectations.\"Llama3.1-8B-BF16\"]\npeak_gib = 9.8\n")
}

#[test]
fn verify_model_uses_configured_expectation() {
    let config = model_config();
    let log = write_file(PASSING_LOG);
    let output = memcheck()
        .env("MEMCHECK_CONFIG_PATH", config.path())
        .args(["verify", "--model", "Llama3.1-8B-BF16", "--log"])
        .arg(log.path())
        .output()
        .unwrap();
    assert!(output.status.success(), "{output:?}");
    assert!(stdout(&output).contains("memory usage within expectations"));
}

#[test]
fn verify_model_ranks_flag_overrides_expectation() {
    let config = model_config();
    let log = write_file(PASSING_LOG);
    // Two ranks halve the per-rank KV size: 35.00 GiB against a 63.18 GiB budget.
    let output = memcheck()
        .env("MEMCHECK_CONFIG_PATH", config.path())
        .args(["verify", "--model", "Llama3.1-8B-BF16", "--ranks", "2", "--log"])
        .arg(log.path())
        .output()
        .unwrap();
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("kv memory size 35.00 GiB is smaller"), "{stderr}");
}

#[test]
fn verify_unknown_model_is_skipped() {
    let config = model_config();
    let log = write_file(PASSING_LOG);
    let output = memcheck()
        .env("MEMCHECK_CONFIG_PATH", config.path())
        .args(["verify", "--model", "Nemotron-H-8B", "--log"])
        .arg(log.path())
        .output()
        .unwrap();
    assert!(output.status.success(), "{output:?}");
    assert!(stdout(&output).contains("skipped"));
}

#[test]
fn scan_emits_json() {
    let log = write_file(PASSING_LOG);
    let output = memcheck()
        .args(["scan", "--json", "--log"])
        .arg(log.path())
        .output()
        .unwrap();
    assert!(output.status.success(), "{output:?}");
    let json: serde_json::Value = serde_json::from_str(&stdout(&output)).unwrap();
    assert_eq!(json["kv_mem_size"], 70.0);
    assert_eq!(json["series"]["peak_memory"][0], 10.0);
}

#[test]
fn keywords_reports_mismatch() {
    let output_file = write_file(
        "[0] Prompt: 'a', Generated text: 'a red car on the road'\n\
         [1] Prompt: 'b', Generated text: 'nothing useful'\n",
    );
    let expected = write_file(r#"[["red", "car", "road"], ["cat", "sofa"]]"#);
    let output = memcheck()
        .args(["keywords", "--ratio", "0.6", "--output"])
        .arg(output_file.path())
        .arg("--expected")
        .arg(expected.path())
        .output()
        .unwrap();
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("nothing useful"), "{stderr}");
}
