//! Deterministic commit-log replay.
//!
//! Reads every `thread<N>.txt` in a directory, checks that the total line
//! count equals the configured commit cap, sorts all entries by commit id,
//! replays the workload from a fresh record table, and compares each logged
//! value triple against the replay. Because strict two-phase locking makes
//! the commit order a valid serialization order, any divergence means a
//! correctness bug in the lock manager.

use std::fs;
use std::path::Path;

use serde::Serialize;
use tracing::{debug, warn};
use waitless_error::{Result, WaitlessError};
use waitless_twopl::INITIAL_RECORD_VALUE;

/// One parsed commit log line: `commit_id i j k vi vj vk`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogEntry {
    pub commit_id: u64,
    /// Record ids in the order the transaction touched them.
    pub record_ids: [u32; 3],
    /// Post-update record values observed at commit time.
    pub values: [i64; 3],
}

/// Outcome of a verification pass.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct CheckReport {
    /// Total commit log lines found.
    pub log_count: u64,
    /// Whether every logged value matched the deterministic replay.
    pub correct: bool,
}

/// Read and parse every `thread<N>.txt` under `dir`.
///
/// Files that do not match the `thread<digits>.txt` pattern are ignored.
///
/// # Errors
///
/// I/O failures and malformed log lines.
pub fn read_log_dir(dir: &Path) -> Result<Vec<LogEntry>> {
    let mut entries = Vec::new();
    for dirent in fs::read_dir(dir)? {
        let dirent = dirent?;
        let file_name = dirent.file_name();
        let Some(name) = file_name.to_str() else {
            continue;
        };
        if !is_thread_log(name) {
            continue;
        }
        parse_log_file(&dirent.path(), &mut entries)?;
    }
    Ok(entries)
}

/// Verify the logs under `dir` against a fresh table of `record_count`
/// records.
///
/// # Errors
///
/// [`WaitlessError::LogCountMismatch`] when the number of lines differs from
/// `last_commit_id`, plus any read/parse failure.
pub fn verify(dir: &Path, record_count: u32, last_commit_id: u64) -> Result<CheckReport> {
    let mut entries = read_log_dir(dir)?;

    let log_count = entries.len() as u64;
    if log_count != last_commit_id {
        return Err(WaitlessError::LogCountMismatch {
            expected: last_commit_id,
            actual: log_count,
        });
    }

    entries.sort_by_key(|entry| entry.commit_id);

    let mut table = vec![INITIAL_RECORD_VALUE; record_count as usize];
    for entry in &entries {
        let [i, j, k] = entry.record_ids.map(|id| (id - 1) as usize);
        table[j] += table[i] + 1;
        table[k] -= table[i];
        if table[i] != entry.values[0]
            || table[j] != entry.values[1]
            || table[k] != entry.values[2]
        {
            warn!(
                commit_id = entry.commit_id,
                logged = ?entry.values,
                replayed = ?[table[i], table[j], table[k]],
                "commit log diverges from replay"
            );
            return Ok(CheckReport {
                log_count,
                correct: false,
            });
        }
    }

    debug!(log_count, "commit log replay clean");
    Ok(CheckReport {
        log_count,
        correct: true,
    })
}

fn is_thread_log(name: &str) -> bool {
    name.strip_prefix("thread")
        .and_then(|rest| rest.strip_suffix(".txt"))
        .is_some_and(|digits| !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()))
}

fn parse_log_file(path: &Path, entries: &mut Vec<LogEntry>) -> Result<()> {
    let contents = fs::read_to_string(path)?;
    for (line_index, line) in contents.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        entries.push(parse_line(path, line_index + 1, line)?);
    }
    Ok(())
}

fn parse_line(path: &Path, line_number: usize, line: &str) -> Result<LogEntry> {
    let malformed = |detail: &str| WaitlessError::LogParse {
        path: path.to_path_buf(),
        line: line_number,
        detail: detail.to_owned(),
    };

    let tokens: Vec<&str> = line.split_whitespace().collect();
    if tokens.len() != 7 {
        return Err(malformed("expected 7 fields: commit_id i j k vi vj vk"));
    }

    let commit_id = tokens[0]
        .parse::<u64>()
        .map_err(|_| malformed("commit id is not an unsigned integer"))?;

    let mut record_ids = [0_u32; 3];
    for (slot, token) in record_ids.iter_mut().zip(&tokens[1..4]) {
        *slot = token
            .parse::<u32>()
            .map_err(|_| malformed("record id is not an unsigned integer"))?;
        if *slot == 0 {
            return Err(malformed("record ids are 1-based"));
        }
    }

    let mut values = [0_i64; 3];
    for (slot, token) in values.iter_mut().zip(&tokens[4..7]) {
        *slot = token
            .parse::<i64>()
            .map_err(|_| malformed("record value is not an integer"))?;
    }

    Ok(LogEntry {
        commit_id,
        record_ids,
        values,
    })
}
