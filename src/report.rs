//! Result aggregation and the final run report.

use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::Serialize;
use uuid::Uuid;

use crate::controller::Trigger;
use crate::transport::ThroughputSnapshot;
use crate::worker::WorkerResult;

/// Aggregate view of a whole run.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Summary {
    pub run_id: Uuid,
    pub trigger: Trigger,
    pub requests: u64,
    pub succeeded: u64,
    pub network_failed: u64,
    pub bad_status: u64,
    /// Successful requests per elapsed whole second.
    pub success_rate: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub read_throughput: u64,
    pub write_throughput: u64,
    pub elapsed_secs: u64,
}

/// Merge per-worker results and the byte counters into a [`Summary`].
///
/// Rates divide by elapsed whole seconds, floored to 1.
pub fn aggregate(
    run_id: Uuid,
    trigger: Trigger,
    workers: &[WorkerResult],
    throughput: ThroughputSnapshot,
    elapsed: Duration,
) -> Summary {
    let totals = workers.iter().fold(WorkerResult::default(), |acc, w| WorkerResult {
        requests: acc.requests + w.requests,
        succeeded: acc.succeeded + w.succeeded,
        network_failed: acc.network_failed + w.network_failed,
        bad_status: acc.bad_status + w.bad_status,
    });

    let elapsed_secs = elapsed.as_secs().max(1);

    Summary {
        run_id,
        trigger,
        requests: totals.requests,
        succeeded: totals.succeeded,
        network_failed: totals.network_failed,
        bad_status: totals.bad_status,
        success_rate: totals.succeeded / elapsed_secs,
        bytes_read: throughput.bytes_read,
        bytes_written: throughput.bytes_written,
        read_throughput: throughput.bytes_read / elapsed_secs,
        write_throughput: throughput.bytes_written / elapsed_secs,
        elapsed_secs,
    }
}

/// Render the fixed-format human-readable report.
pub fn format_summary(summary: &Summary) -> String {
    let rows: [(&str, u64, &str); 8] = [
        ("Requests:", summary.requests, "hits"),
        ("Successful requests:", summary.succeeded, "hits"),
        ("Network failed:", summary.network_failed, "hits"),
        ("Bad requests failed (!2xx):", summary.bad_status, "hits"),
        ("Successful requests rate:", summary.success_rate, "hits/sec"),
        ("Read throughput:", summary.read_throughput, "bytes/sec"),
        ("Write throughput:", summary.write_throughput, "bytes/sec"),
        ("Test time:", summary.elapsed_secs, "sec"),
    ];

    let mut out = String::new();
    for (label, value, unit) in rows {
        out.push_str(&format!("{:<32}{:>10} {}\n", label, value, unit));
    }
    out
}

// ---------------------------------------------------------------------------
// Reporter
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReportFormat {
    #[default]
    Text,
    Json,
}

/// Emits the summary at most once, whichever trigger gets there first.
#[derive(Debug, Default)]
pub struct Reporter {
    format: ReportFormat,
    fired: AtomicBool,
}

impl Reporter {
    pub fn new(format: ReportFormat) -> Self {
        Self {
            format,
            fired: AtomicBool::new(false),
        }
    }

    /// Write the report to `out`. Returns `false` without writing if a
    /// report was already emitted.
    pub fn emit<W: Write>(&self, summary: &Summary, out: &mut W) -> io::Result<bool> {
        if self.fired.swap(true, Ordering::SeqCst) {
            return Ok(false);
        }

        match self.format {
            ReportFormat::Text => out.write_all(format_summary(summary).as_bytes())?,
            ReportFormat::Json => {
                serde_json::to_writer_pretty(&mut *out, summary)?;
                out.write_all(b"\n")?;
            }
        }
        out.flush()?;
        Ok(true)
    }

    pub fn has_fired(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }
}
