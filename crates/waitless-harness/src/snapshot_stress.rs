//! Writer stress for the wait-free snapshot engine.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use rand::Rng;
use serde::Serialize;
use tracing::info;
use waitless_snapshot::AtomicSnapshot;

/// Outcome of one stress run.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct SnapshotStressReport {
    pub thread_count: usize,
    pub total_updates: u64,
    pub elapsed_ms: u128,
}

/// Spawn `thread_count` writers; each registers a slot and calls
/// `update(random i32)` until `duration` elapses.
#[must_use]
pub fn run(thread_count: usize, duration: Duration) -> SnapshotStressReport {
    let engine = AtomicSnapshot::new(thread_count);
    let total_updates = AtomicU64::new(0);
    let start = Instant::now();

    let engine = &engine;
    let total_updates_ref = &total_updates;
    std::thread::scope(|scope| {
        for _ in 0..thread_count {
            scope.spawn(move || {
                let index = engine.register_thread();
                let mut rng = rand::thread_rng();
                let mut updates = 0_u64;
                while start.elapsed() < duration {
                    engine.update(rng.gen::<i32>(), index);
                    updates += 1;
                }
                total_updates_ref.fetch_add(updates, Ordering::Relaxed);
            });
        }
    });

    let report = SnapshotStressReport {
        thread_count,
        total_updates: total_updates.load(Ordering::Relaxed),
        elapsed_ms: start.elapsed().as_millis(),
    };
    info!(
        thread_count,
        total_updates = report.total_updates,
        elapsed_ms = report.elapsed_ms,
        "snapshot stress finished"
    );
    report
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_run_makes_progress() {
        let report = run(2, Duration::from_millis(100));
        assert_eq!(report.thread_count, 2);
        assert!(report.total_updates > 0, "writers made no progress");
    }

    #[test]
    fn report_serializes() {
        let report = run(1, Duration::from_millis(10));
        let json = serde_json::to_string(&report).unwrap();
        assert!(json.contains("total_updates"));
    }
}
