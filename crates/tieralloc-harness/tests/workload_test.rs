use tieralloc_core::{AllocMode, AllocatorLogLevel};
use tieralloc_harness::{
    ChurnConfig, OomConfig, parse_log_level, run_churn, run_oom, run_reuse, write_jsonl,
};

fn churn(seed: u64, mode: AllocMode) -> ChurnConfig {
    ChurnConfig {
        seed,
        ops: 4000,
        max_size: 300,
        mode,
        log_level: None,
    }
}

#[test]
fn churn_is_deterministic_and_clean() {
    let a = run_churn(&churn(0xDEAD_BEEF, AllocMode::Strict)).unwrap().report;
    let b = run_churn(&churn(0xDEAD_BEEF, AllocMode::Strict)).unwrap().report;
    assert_eq!(a, b);
    assert_eq!(a.corrupted_blocks, 0);
    assert_eq!(a.outstanding_system_blocks, 0);
    assert!(a.small_requests > 0 && a.large_requests > 0);
    assert_eq!(a.stats.rejected_frees, 0);
    assert!(a.stats.free_list_hits > 0);
}

#[test]
fn hardened_churn_matches_strict_behavior() {
    let strict = run_churn(&churn(7, AllocMode::Strict)).unwrap().report;
    let hardened = run_churn(&churn(7, AllocMode::Hardened)).unwrap().report;
    assert_eq!(hardened.mode, "hardened");
    assert_eq!(hardened.corrupted_blocks, 0);
    assert_eq!(hardened.stats.rejected_frees, 0);
    assert_eq!(strict.stats.heap_size, hardened.stats.heap_size);
    assert_eq!(strict.stats.free_blocks, hardened.stats.free_blocks);
}

#[test]
fn reuse_checks_pass() {
    let out = run_reuse(None).unwrap();
    assert!(out.report.passed, "{:?}", out.report);
    assert_eq!(out.report.refill_strides, vec![8; 19]);
    assert!(out.records.is_empty());
}

#[test]
fn oom_handler_invoked_per_failure() {
    for k in 0..4 {
        let out = run_oom(&OomConfig {
            fail_first: k,
            with_handler: true,
            size: 4096,
            log_level: None,
        })
        .unwrap();
        assert_eq!(out.report.outcome, "success");
        assert_eq!(out.report.handler_invocations, k as u64);
        assert_eq!(out.report.system_allocate_calls, k + 1);
    }
}

#[test]
fn oom_without_handler_reports_failure() {
    let out = run_oom(&OomConfig {
        fail_first: 1,
        with_handler: false,
        size: 4096,
        log_level: Some(AllocatorLogLevel::Warn),
    })
    .unwrap();
    assert_eq!(out.report.outcome, "out of memory: 4096 bytes requested");
    assert_eq!(out.report.handler_invocations, 0);
    assert!(out.records.iter().any(|r| r.event == "large_alloc" && r.outcome == "oom"));
}

#[test]
fn small_oom_escalates_through_large_path() {
    let out = run_oom(&OomConfig {
        fail_first: 2,
        with_handler: true,
        size: 24,
        log_level: None,
    })
    .unwrap();
    assert_eq!(out.report.path, "small");
    assert_eq!(out.report.outcome, "success");
    assert_eq!(out.report.stats.oom_escalations, 1);
    assert_eq!(out.report.handler_invocations, 1);
}

#[test]
fn churn_log_round_trips_through_jsonl() {
    let mut config = churn(99, AllocMode::Strict);
    config.ops = 500;
    config.log_level = parse_log_level("debug").unwrap();
    let out = run_churn(&config).unwrap();
    assert!(!out.records.is_empty());

    let path = std::env::temp_dir().join(format!("tieralloc-churn-{}.jsonl", std::process::id()));
    write_jsonl(&path, &out.records).unwrap();
    let text = std::fs::read_to_string(&path).unwrap();
    std::fs::remove_file(&path).unwrap();

    assert_eq!(text.lines().count(), out.records.len());
    for line in text.lines() {
        let value: serde_json::Value = serde_json::from_str(line).unwrap();
        assert!(value["trace_id"].as_str().unwrap().starts_with("tieralloc::"));
    }
}
