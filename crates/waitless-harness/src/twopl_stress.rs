//! Transaction workers for the two-phase-locking stress workload.
//!
//! Each worker loops: pick three distinct random records (i, j, k), then run
//! one transaction that reads Ri, adds `Ri + 1` to Rj, subtracts Ri from Rk,
//! and commits. A deadlocked transaction aborts and retries; a commit past
//! the cap ends the worker. Every commit adds exactly +1 to the sum of all
//! record values, which the scenario tests exploit.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use rand::Rng;
use serde::Serialize;
use tracing::info;
use waitless_error::Result;
use waitless_twopl::{RecycleMetrics, TableMode, TransactionManager};
use waitless_types::RecordId;

/// Parameters for one stress run.
#[derive(Debug, Clone)]
pub struct TwoplStressConfig {
    pub thread_count: usize,
    pub record_count: u32,
    pub last_commit_id: u64,
    pub mode: TableMode,
    /// Directory receiving the per-thread `thread<N>.txt` commit logs.
    pub log_dir: PathBuf,
}

/// Outcome of one stress run.
#[derive(Debug, Clone, Serialize)]
pub struct TwoplStressReport {
    pub thread_count: usize,
    pub record_count: u32,
    pub last_commit_id: u64,
    pub elapsed_ms: u128,
    pub commits_per_ms: f64,
    pub recycle: RecycleMetrics,
}

/// Run the full workload to completion.
///
/// # Errors
///
/// Propagates commit-log I/O failures from the workers.
pub fn run(config: &TwoplStressConfig) -> Result<TwoplStressReport> {
    let manager = TransactionManager::new(
        config.record_count,
        config.last_commit_id,
        config.mode,
        &config.log_dir,
    );
    let stop = AtomicBool::new(false);
    let start = Instant::now();

    run_workers(&manager, config.thread_count, &stop)?;

    let elapsed = start.elapsed();
    let elapsed_ms = elapsed.as_millis();
    let report = TwoplStressReport {
        thread_count: config.thread_count,
        record_count: config.record_count,
        last_commit_id: config.last_commit_id,
        elapsed_ms,
        commits_per_ms: config.last_commit_id as f64 / elapsed.as_secs_f64() / 1_000.0,
        recycle: manager.recycle_metrics(),
    };
    info!(
        thread_count = report.thread_count,
        elapsed_ms = report.elapsed_ms,
        recycled_pct = report.recycle.recycled_pct(),
        "twopl stress finished"
    );
    Ok(report)
}

/// Spawn `thread_count` workers over an existing manager and wait for all of
/// them to finish.
///
/// Workers normally exit when commit reports the cap; raising `stop` ends
/// them at their next loop entry, which bounds workloads that can never
/// commit (fewer than three records).
///
/// # Errors
///
/// The first worker error, after all workers have exited.
pub fn run_workers(
    manager: &TransactionManager,
    thread_count: usize,
    stop: &AtomicBool,
) -> Result<()> {
    let record_count = manager.record_count();
    std::thread::scope(|scope| {
        let workers: Vec<_> = (0..thread_count)
            .map(|_| scope.spawn(move || worker_loop(manager, record_count, stop)))
            .collect();
        let mut outcome = Ok(());
        for worker in workers {
            let result = worker.join().expect("stress worker panicked");
            if outcome.is_ok() {
                outcome = result;
            }
        }
        outcome
    })
}

fn worker_loop(
    manager: &TransactionManager,
    record_count: u32,
    stop: &AtomicBool,
) -> Result<()> {
    let mut rng = rand::thread_rng();

    loop {
        if stop.load(Ordering::Relaxed) {
            return Ok(());
        }

        // Three distinct records are required; with fewer than three in the
        // table the workload can never form a transaction and spins here
        // until `stop` is raised.
        if record_count < 3 {
            std::thread::yield_now();
            continue;
        }
        let i = rng.gen_range(1..=record_count);
        let j = rng.gen_range(1..=record_count);
        let k = rng.gen_range(1..=record_count);
        if i == j || i == k || j == k {
            continue;
        }

        manager.begin();

        let record_i = match manager.find(RecordId::new(i)) {
            Ok(value) => value,
            Err(err) if err.is_transient() => {
                manager.abort();
                continue;
            }
            Err(err) => return Err(err),
        };

        if let Err(err) = manager.update(RecordId::new(j), record_i + 1) {
            if err.is_transient() {
                manager.abort();
                continue;
            }
            return Err(err);
        }

        if let Err(err) = manager.update(RecordId::new(k), -record_i) {
            if err.is_transient() {
                manager.abort();
                continue;
            }
            return Err(err);
        }

        if manager.commit()?.is_none() {
            return Ok(());
        }
    }
}
