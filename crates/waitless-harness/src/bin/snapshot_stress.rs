//! Wait-free snapshot stress runner.
//!
//! Usage: `snapshot-stress THREAD_COUNT`
//!
//! Spawns the requested number of writer threads, runs random updates for 60
//! wall-clock seconds, and prints the total update count.

use std::env;
use std::process;
use std::time::Duration;

use tracing_subscriber::EnvFilter;
use waitless_harness::snapshot_stress;

const RUN_DURATION: Duration = Duration::from_secs(60);

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args: Vec<String> = env::args().skip(1).collect();
    if args.is_empty() {
        eprintln!("usage: snapshot-stress THREAD_COUNT");
        process::exit(2);
    }

    let thread_count: usize = match args[0].parse() {
        Ok(count) if count > 0 => count,
        _ => {
            eprintln!("THREAD_COUNT must be a positive integer");
            process::exit(2);
        }
    };

    println!("Total thread count is {thread_count}");

    let report = snapshot_stress::run(thread_count, RUN_DURATION);

    println!("Total update count is {}", report.total_updates);
}
