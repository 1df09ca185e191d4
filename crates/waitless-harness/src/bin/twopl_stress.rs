//! Two-phase-locking stress runner.
//!
//! Usage: `twopl-stress THREAD_COUNT RECORD_COUNT LAST_COMMIT_ID [--global-mutex]`
//!
//! Runs the read-two-write workload until the commit cap is reached, then
//! replays the per-thread commit logs from the current directory and prints a
//! summary block. `--global-mutex` selects the reference table mode.

use std::env;
use std::path::Path;
use std::process;

use tracing_subscriber::EnvFilter;
use waitless_harness::{checker, twopl_stress};
use waitless_twopl::TableMode;

fn parse_positional<T: std::str::FromStr>(args: &[String], index: usize, name: &str) -> T {
    match args.get(index).map(|raw| raw.parse::<T>()) {
        Some(Ok(value)) => value,
        _ => {
            eprintln!("{name} must be an unsigned integer");
            process::exit(2);
        }
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args: Vec<String> = env::args().skip(1).collect();
    if args.len() < 3 {
        eprintln!("usage: twopl-stress THREAD_COUNT RECORD_COUNT LAST_COMMIT_ID [--global-mutex]");
        process::exit(2);
    }

    let thread_count: usize = parse_positional(&args, 0, "THREAD_COUNT");
    let record_count: u32 = parse_positional(&args, 1, "RECORD_COUNT");
    let last_commit_id: u64 = parse_positional(&args, 2, "LAST_COMMIT_ID");
    let mode = if args.iter().any(|arg| arg == "--global-mutex") {
        TableMode::GlobalMutex
    } else {
        TableMode::LockFree
    };

    let config = twopl_stress::TwoplStressConfig {
        thread_count,
        record_count,
        last_commit_id,
        mode,
        log_dir: ".".into(),
    };

    let report = match twopl_stress::run(&config) {
        Ok(report) => report,
        Err(err) => {
            eprintln!("stress run failed: {err}");
            process::exit(1);
        }
    };

    let check = match checker::verify(Path::new("."), record_count, last_commit_id) {
        Ok(check) => check,
        Err(err) => {
            eprintln!("log verification failed: {err}");
            process::exit(1);
        }
    };

    println!("#########################################################################################");
    println!("1. The number of threads : {thread_count}");
    println!("2. The number of records : {record_count}");
    println!("3. Last commit ID : {last_commit_id}");
    println!(
        "4. Throughput (total number of commits / milliseconds) : {}",
        report.commits_per_ms
    );
    println!("5. Correctness : {}", check.correct);
    println!(
        "6. Percentage of recycled locks : {}",
        report.recycle.recycled_pct()
    );
    println!("#########################################################################################");

    if !check.correct {
        process::exit(1);
    }
}
