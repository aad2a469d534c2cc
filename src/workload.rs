/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use crate::range::KeyRange;
use anyhow::Context;
use hdrhistogram::serialization::{Serializer, V2Serializer};
use hdrhistogram::Histogram;
use serde::{Deserialize, Serialize};
use std::{
    fs::{self, File},
    io::Write,
    path::{Path, PathBuf},
    sync::atomic::{AtomicBool, Ordering},
    time::{Duration, Instant},
};
use tracing::info;

/// Suffix of the timestamped directory a workload writes its probe files
/// into. Result harvesting locates leaf directories by this suffix.
pub const WORKLOAD_OUTPUT_SUFFIX: &str = "-workload-output";
pub const THROUGHPUT_FILE: &str = "throughput-latency.csv";
pub const PERCENTILE_FILE: &str = "percentiles.csv";
pub const HISTOGRAM_FILE: &str = "latency.hlog";

// latencies are recorded in nanoseconds, up to 5 hours
const HISTOGRAM_MAX_NS: u64 = 5 * 60 * 60 * 1_000_000_000;
const HISTOGRAM_SIGFIGS: u8 = 3;

/// Built-in workload operations. The set is closed: operations carry only
/// data so a step can cross the wire, and the agent's dispatcher stays total.
#[derive(Debug, Deserialize, PartialEq, Serialize, Clone)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Operation {
    /// Measures pure harness overhead.
    Noop,
    /// Busy-spins for a fixed number of nanoseconds.
    Spin { nanos: u64 },
    /// Sleeps for a fixed number of microseconds.
    Sleep { micros: u64 },
}
impl Operation {
    /// Runs one iteration for `key`. The built-in operations are
    /// key-independent; the key exists for operation variants that address
    /// a keyspace.
    pub fn invoke(&self, _key: i64) -> anyhow::Result<()> {
        match self {
            Operation::Noop => Ok(()),
            Operation::Spin { nanos } => {
                let end = Instant::now() + Duration::from_nanos(*nanos);
                while Instant::now() < end {
                    std::hint::spin_loop();
                }
                Ok(())
            }
            Operation::Sleep { micros } => {
                std::thread::sleep(Duration::from_micros(*micros));
                Ok(())
            }
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Operation::Noop => "noop".to_string(),
            Operation::Spin { nanos } => format!("spin({}ns)", nanos),
            Operation::Sleep { micros } => format!("sleep({}us)", micros),
        }
    }
}

#[derive(Debug, Deserialize, PartialEq, Serialize, Clone, Copy)]
pub struct WorkloadParams {
    #[serde(default = "default_duration_secs")]
    pub duration_secs: u64,
    #[serde(default)]
    pub warmup_secs: u64,
    #[serde(default = "default_threads")]
    pub threads: usize,
    /// Size of the keyspace `[0, keys)` partitioned across the workers of
    /// the role and then across their threads.
    #[serde(default = "default_keys")]
    pub keys: u64,
}
impl Default for WorkloadParams {
    fn default() -> Self {
        WorkloadParams {
            duration_secs: default_duration_secs(),
            warmup_secs: 0,
            threads: default_threads(),
            keys: default_keys(),
        }
    }
}

fn default_duration_secs() -> u64 {
    1
}

fn default_threads() -> usize {
    num_cpus::get() * 2
}

fn default_keys() -> u64 {
    1_000_000
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct WorkloadReport {
    pub output_dir: PathBuf,
    pub total_ops: u64,
    pub mean_ops_per_sec: f64,
}

struct ThreadRecorder {
    histogram: Histogram<u64>,
    ops_per_sec: Vec<u64>,
    latency_sum_ns: Vec<u64>,
}
impl ThreadRecorder {
    fn new(duration_secs: u64) -> anyhow::Result<Self> {
        let histogram = Histogram::<u64>::new_with_bounds(1, HISTOGRAM_MAX_NS, HISTOGRAM_SIGFIGS)
            .map_err(|e| anyhow::anyhow!("failed to create latency histogram: {:?}", e))?;
        Ok(ThreadRecorder {
            histogram,
            ops_per_sec: vec![0; duration_secs as usize],
            latency_sum_ns: vec![0; duration_secs as usize],
        })
    }

    fn record(&mut self, second: usize, elapsed_ns: u64) {
        self.histogram.saturating_record(elapsed_ns.max(1));
        if second < self.ops_per_sec.len() {
            self.ops_per_sec[second] += 1;
            self.latency_sum_ns[second] += elapsed_ns;
        }
    }
}

/// Drives the operation in a closed loop on `params.threads` OS threads for
/// warmup + duration, recording per-operation latency into one histogram per
/// thread, then merges the histograms by addition and writes the probe files.
/// `key_range` is this worker's share of the keyspace; each thread walks its
/// own contiguous slice of it cyclically.
///
/// Callers on an async runtime should wrap this in `spawn_blocking`.
pub fn run(
    operation: &Operation,
    params: &WorkloadParams,
    key_range: KeyRange,
    output_dir: &Path,
) -> anyhow::Result<WorkloadReport> {
    if params.threads == 0 {
        return Err(anyhow::anyhow!("workload must run with at least 1 thread"));
    }
    if params.duration_secs == 0 {
        return Err(anyhow::anyhow!("workload duration must be at least 1 second"));
    }

    info!(
        "running workload {} for {}s (warmup {}s) on {} threads over keys {:?}",
        operation.describe(),
        params.duration_secs,
        params.warmup_secs,
        params.threads,
        key_range
    );

    let warmup = Duration::from_secs(params.warmup_secs);
    let duration = Duration::from_secs(params.duration_secs);
    let stop = AtomicBool::new(false);

    let recorders = std::thread::scope(|scope| {
        let mut handles = vec![];
        for slice in key_range.slice(params.threads) {
            let stop = &stop;
            handles.push(scope.spawn(move || -> anyhow::Result<ThreadRecorder> {
                let mut recorder = ThreadRecorder::new(params.duration_secs)?;
                let warmup_end = Instant::now() + warmup;
                let measure_end = warmup_end + duration;
                let mut key = slice.min();

                loop {
                    let op_start = Instant::now();
                    if op_start >= measure_end || stop.load(Ordering::Relaxed) {
                        break;
                    }

                    if let Err(e) = operation.invoke(key) {
                        stop.store(true, Ordering::Relaxed);
                        return Err(e.context("workload operation failed"));
                    }
                    key += 1;
                    if key >= slice.max() {
                        key = slice.min();
                    }

                    if op_start >= warmup_end {
                        let elapsed_ns = op_start.elapsed().as_nanos() as u64;
                        let second = (op_start - warmup_end).as_secs() as usize;
                        recorder.record(second, elapsed_ns);
                    }
                }

                Ok(recorder)
            }));
        }

        let mut recorders = vec![];
        for handle in handles {
            let recorder = handle
                .join()
                .map_err(|_| anyhow::anyhow!("workload thread panicked"))?;
            recorders.push(recorder?);
        }
        Ok::<_, anyhow::Error>(recorders)
    })?;

    // merge thread histograms and per-second counters
    let mut aggregate = Histogram::<u64>::new_with_bounds(1, HISTOGRAM_MAX_NS, HISTOGRAM_SIGFIGS)
        .map_err(|e| anyhow::anyhow!("failed to create latency histogram: {:?}", e))?;
    let mut ops_per_sec = vec![0u64; params.duration_secs as usize];
    let mut latency_sum_ns = vec![0u64; params.duration_secs as usize];
    for recorder in recorders.iter() {
        aggregate
            .add(&recorder.histogram)
            .map_err(|e| anyhow::anyhow!("failed to merge latency histograms: {:?}", e))?;
        for (second, count) in recorder.ops_per_sec.iter().enumerate() {
            ops_per_sec[second] += count;
            latency_sum_ns[second] += recorder.latency_sum_ns[second];
        }
    }

    let probe_dir = output_dir.join(format!(
        "{}{}",
        chrono::Local::now().format("%Y%m%d-%H%M%S"),
        WORKLOAD_OUTPUT_SUFFIX
    ));
    fs::create_dir_all(&probe_dir).context(format!("Unable to create {:?}", probe_dir))?;

    write_throughput_file(&probe_dir, operation, &ops_per_sec, &latency_sum_ns)?;
    write_percentile_file(&probe_dir, operation, &aggregate)?;
    write_histogram_file(output_dir, &aggregate)?;

    let total_ops = aggregate.len();
    let report = WorkloadReport {
        output_dir: probe_dir,
        total_ops,
        mean_ops_per_sec: total_ops as f64 / params.duration_secs as f64,
    };
    info!(
        "workload finished: {} ops, {:.2} ops/second",
        report.total_ops, report.mean_ops_per_sec
    );
    Ok(report)
}

fn write_throughput_file(
    probe_dir: &Path,
    operation: &Operation,
    ops_per_sec: &[u64],
    latency_sum_ns: &[u64],
) -> anyhow::Result<()> {
    let path = probe_dir.join(THROUGHPUT_FILE);
    let mut file = File::create(&path).context(format!("Unable to create {:?}", path))?;

    writeln!(file, "-- {}", chrono::Local::now().to_rfc3339())?;
    writeln!(file, "-- operation: {}", operation.describe())?;
    writeln!(file, "** second,opsPerSecond,avgLatency")?;
    for (second, count) in ops_per_sec.iter().enumerate() {
        let avg_latency_us = if *count > 0 {
            latency_sum_ns[second] as f64 / *count as f64 / 1000.0
        } else {
            0.0
        };
        writeln!(file, "{},{:.2},{:.2}", second, *count as f64, avg_latency_us)?;
    }

    Ok(())
}

/// Writes the latency distribution as (bucketStart, fractionOfTotal) pairs in
/// microseconds, linear buckets sized so the distribution spans roughly two
/// hundred lines.
fn write_percentile_file(
    probe_dir: &Path,
    operation: &Operation,
    histogram: &Histogram<u64>,
) -> anyhow::Result<()> {
    let path = probe_dir.join(PERCENTILE_FILE);
    let mut file = File::create(&path).context(format!("Unable to create {:?}", path))?;

    writeln!(file, "-- {}", chrono::Local::now().to_rfc3339())?;
    writeln!(file, "-- operation: {}", operation.describe())?;
    writeln!(file, "** bucketStart,fractionOfTotal")?;

    let total = histogram.len();
    if total == 0 {
        return Ok(());
    }

    let max_us = histogram.max() / 1000;
    let bucket_us = (max_us / 200).max(1);
    let mut buckets = std::collections::BTreeMap::new();
    for value in histogram.iter_recorded() {
        let bucket = value.value_iterated_to() / 1000 / bucket_us * bucket_us;
        *buckets.entry(bucket).or_insert(0u64) += value.count_at_value();
    }
    for (bucket_start, count) in buckets {
        writeln!(
            file,
            "{},{}",
            bucket_start,
            count as f64 / total as f64
        )?;
    }

    Ok(())
}

fn write_histogram_file(output_dir: &Path, histogram: &Histogram<u64>) -> anyhow::Result<()> {
    let path = output_dir.join(HISTOGRAM_FILE);
    let mut file = File::create(&path).context(format!("Unable to create {:?}", path))?;
    V2Serializer::new()
        .serialize(histogram, &mut file)
        .map_err(|e| anyhow::anyhow!("failed to serialize latency histogram: {:?}", e))?;
    Ok(())
}
