//! End-to-end scenarios driving the transaction workload and the checker.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use waitless_harness::{checker, twopl_stress};
use waitless_twopl::{TableMode, TransactionManager};
use waitless_types::RecordId;

fn record_sum(manager: &TransactionManager) -> i64 {
    (1..=manager.record_count())
        .map(|id| manager.record_value(RecordId::new(id)))
        .sum()
}

/// Eight workers over ten records for a thousand commits: the replay must be
/// clean, and since every commit adds exactly +1 to the record set, the final
/// sum is the initial 1000 plus one per commit.
#[test]
fn eight_workers_thousand_commits_replay_clean() {
    let dir = tempfile::tempdir().unwrap();
    let manager = TransactionManager::new(10, 1_000, TableMode::LockFree, dir.path());
    let stop = AtomicBool::new(false);

    twopl_stress::run_workers(&manager, 8, &stop).unwrap();

    let report = checker::verify(dir.path(), 10, 1_000).unwrap();
    assert!(report.correct, "replay diverged from the commit logs");
    assert_eq!(report.log_count, 1_000);
    assert_eq!(record_sum(&manager), 10 * 100 + 1_000);
}

/// The reference global-mutex mode must satisfy the same external contract.
#[test]
fn global_mutex_mode_replay_clean() {
    let dir = tempfile::tempdir().unwrap();
    let manager = TransactionManager::new(8, 300, TableMode::GlobalMutex, dir.path());
    let stop = AtomicBool::new(false);

    twopl_stress::run_workers(&manager, 4, &stop).unwrap();

    let report = checker::verify(dir.path(), 8, 300).unwrap();
    assert!(report.correct);
    assert_eq!(record_sum(&manager), 8 * 100 + 300);
}

/// With a single record no worker can ever pick three distinct ids, so the
/// workload spins without committing until stopped from outside.
#[test]
fn single_record_workload_commits_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let manager = TransactionManager::new(1, 0, TableMode::LockFree, dir.path());
    let stop = AtomicBool::new(false);

    let manager_ref = &manager;
    let stop_ref = &stop;
    std::thread::scope(|scope| {
        let runner = scope.spawn(move || twopl_stress::run_workers(manager_ref, 2, stop_ref));
        std::thread::sleep(Duration::from_millis(200));
        stop.store(true, Ordering::Relaxed);
        runner.join().unwrap().unwrap();
    });

    let report = checker::verify(dir.path(), 1, 0).unwrap();
    assert_eq!(report.log_count, 0, "no transaction can commit with one record");
    assert_eq!(manager.record_value(RecordId::new(1)), 100);
}

/// A single worker over exactly three records commits its full quota and the
/// logs replay cleanly.
#[test]
fn single_worker_three_records() {
    let dir = tempfile::tempdir().unwrap();
    let manager = TransactionManager::new(3, 25, TableMode::LockFree, dir.path());
    let stop = AtomicBool::new(false);

    twopl_stress::run_workers(&manager, 1, &stop).unwrap();

    let report = checker::verify(dir.path(), 3, 25).unwrap();
    assert!(report.correct);
    assert_eq!(record_sum(&manager), 3 * 100 + 25);
}

/// The full `run` entry point wires the manager, workers, and metrics
/// together.
#[test]
fn run_reports_recycling_under_contention() {
    let dir = tempfile::tempdir().unwrap();
    let config = twopl_stress::TwoplStressConfig {
        thread_count: 4,
        record_count: 4,
        last_commit_id: 400,
        mode: TableMode::LockFree,
        log_dir: dir.path().to_path_buf(),
    };

    let report = twopl_stress::run(&config).unwrap();
    assert_eq!(report.last_commit_id, 400);
    assert!(report.recycle.obtained_total >= 3 * 400);
    assert!(
        report.recycle.recycled_pct() > 0.0,
        "a 400-commit contended run must recycle some requests"
    );

    let check = checker::verify(dir.path(), 4, 400).unwrap();
    assert!(check.correct);
}
