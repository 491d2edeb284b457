use fleetrun::managers::report::ResultAggregator;
use fleetrun::model::ExecutionOutcome;
use std::sync::Arc;

fn sample() -> ResultAggregator {
    let aggregator = ResultAggregator::new();
    aggregator.record("web-2", ExecutionOutcome::success("up 3 days\n"));
    aggregator.record("db-1", ExecutionOutcome::error("connect to 10.0.0.9:22 failed: refused"));
    aggregator.record(
        "web-1",
        ExecutionOutcome::failure("exit status 1", "inactive\n"),
    );
    aggregator.record("cache", ExecutionOutcome::success("line one\nline two"));
    aggregator
}

#[test]
fn render_orders_blocks_and_sorts_names() {
    let text = sample().report().render(false);
    let expected = "  cache:\n    line one\n    line two\n\n  web-2:\n    up 3 days\n\n  web-1:\n    inactive\n    (exit status 1)\n\n  db-1:\n    connect to 10.0.0.9:22 failed: refused\n\nSuccess: 2 Failure: 1 Error: 1\n";
    assert_eq!(text, expected);
}

#[test]
fn suppressed_successes_still_count() {
    let text = sample().report().render(true);
    assert!(!text.contains("cache:"));
    assert!(!text.contains("web-2:"));
    assert!(text.contains("  web-1:\n"));
    assert!(text.contains("  db-1:\n"));
    assert!(text.ends_with("Success: 2 Failure: 1 Error: 1\n"));
}

#[test]
fn empty_report_renders_summary_only() {
    let text = ResultAggregator::new().report().render(false);
    assert_eq!(text, "Success: 0 Failure: 0 Error: 0\n");
}

#[test]
fn concurrent_records_all_land() {
    let aggregator = Arc::new(ResultAggregator::new());
    let handles: Vec<_> = (0..32)
        .map(|i| {
            let aggregator = aggregator.clone();
            std::thread::spawn(move || {
                let outcome = if i % 2 == 0 {
                    ExecutionOutcome::success("")
                } else {
                    ExecutionOutcome::error("x")
                };
                aggregator.record(&format!("t{}", i), outcome);
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
    let summary = aggregator.summary();
    assert_eq!(summary.success_count, 16);
    assert_eq!(summary.error_count, 16);
    assert_eq!(aggregator.report().len(), 32);
}
