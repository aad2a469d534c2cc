/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

pub mod hdr;
pub mod percentile;
pub mod report;
pub mod throughput;

use crate::errors::{HarnessError, HarnessResult};
use crate::workload::WORKLOAD_OUTPUT_SUFFIX;
use anyhow::Context;
use itertools::Itertools;
use std::path::{Path, PathBuf};
use tracing::debug;

/// One named figure a probe reports, e.g. "average ops/second".
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeFigure {
    pub description: String,
    pub value: f64,
}

impl ProbeFigure {
    pub fn new(description: &str, value: f64) -> Self {
        ProbeFigure {
            description: description.to_string(),
            value,
        }
    }
}

/// Parses one kind of raw measurement file. A parser accumulates data across
/// every worker directory of a run, reports its figures, and is reset before
/// the next run.
pub trait ProbeParser {
    /// Folds one worker's probe output directory into the running state.
    fn parse(&mut self, probe_dir: &Path) -> HarnessResult<()>;

    /// Back to a clean state, ready for another run.
    fn reset(&mut self);

    fn results(&self) -> HarnessResult<Vec<ProbeFigure>>;
}

/// Strips comment lines from a probe file. Lines starting `--`, `@@` or `**`
/// carry metadata and column headers.
pub(crate) fn data_lines(contents: &str) -> impl Iterator<Item = &str> {
    contents.lines().filter(|line| {
        !line.starts_with("--") && !line.starts_with("@@") && !line.starts_with("**")
    })
}

// ******** ******** ********
// **       DISCOVERY      **
// ******** ******** ********

/// Result trees sometimes wrap their benchmark directories in a
/// `benchmarks_*` directory; descend into it when present.
fn find_benchmark_root(base: &Path) -> HarnessResult<PathBuf> {
    let is_wrapper = |name: &str| name.starts_with("benchmarks_");

    if base
        .file_name()
        .map(|name| is_wrapper(&name.to_string_lossy()))
        .unwrap_or(false)
    {
        return Ok(base.to_path_buf());
    }

    for entry in sorted_subdirs(base)? {
        if entry
            .file_name()
            .map(|name| is_wrapper(&name.to_string_lossy()))
            .unwrap_or(false)
        {
            debug!("descending into wrapper directory {:?}", entry);
            return Ok(entry);
        }
    }
    Ok(base.to_path_buf())
}

fn sorted_subdirs(dir: &Path) -> HarnessResult<Vec<PathBuf>> {
    let entries = std::fs::read_dir(dir)
        .context(format!("Unable to read directory {:?}", dir))?
        .collect::<Result<Vec<_>, _>>()
        .context(format!("Unable to read directory {:?}", dir))?;
    Ok(entries
        .into_iter()
        .map(|entry| entry.path())
        .filter(|path| path.is_dir())
        .sorted()
        .collect())
}

/// Locates the probe output directory of every worker under one benchmark's
/// result directory. Worker directories hold exactly one output directory
/// each; directories without one are not worker output and are skipped.
fn workload_output_dirs(benchmark_dir: &Path) -> HarnessResult<Vec<PathBuf>> {
    let mut leaves = vec![];
    for worker_dir in sorted_subdirs(benchmark_dir)? {
        let matches: Vec<PathBuf> = sorted_subdirs(&worker_dir)?
            .into_iter()
            .filter(|path| {
                path.file_name()
                    .map(|name| name.to_string_lossy().ends_with(WORKLOAD_OUTPUT_SUFFIX))
                    .unwrap_or(false)
            })
            .collect();

        match &matches[..] {
            [] => continue,
            [leaf] => leaves.push(leaf.clone()),
            _ => {
                return Err(HarnessError::Other(anyhow::anyhow!(
                    "Expected one workload output directory in {:?}, found {}",
                    worker_dir,
                    matches.len()
                )))
            }
        }
    }
    Ok(leaves)
}

// ******** ******** ********
// **      COMPARISON      **
// ******** ******** ********

#[derive(Debug, Clone, PartialEq)]
pub struct ProbeComparison {
    pub description: String,
    pub baseline: f64,
    pub candidate: f64,
}

impl ProbeComparison {
    /// Relative change of the candidate against the baseline.
    pub fn difference(&self) -> f64 {
        (self.candidate - self.baseline) / self.baseline
    }

    /// True when the two figures are within noise of each other, so CI jobs
    /// can gate on "no regression" without chasing jitter.
    pub fn is_equivalent(&self) -> bool {
        let ratio = (self.candidate / self.baseline).abs();
        ratio > 0.95 && ratio < 1.05
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BenchmarkComparison {
    pub name: String,
    pub probes: Vec<ProbeComparison>,
}

/// A full candidate-vs-baseline comparison across every benchmark found in
/// both result trees.
#[derive(Debug, Clone, PartialEq)]
pub struct RunComparison {
    pub benchmarks: Vec<BenchmarkComparison>,
}

impl RunComparison {
    pub fn is_equivalent(&self) -> bool {
        self.benchmarks
            .iter()
            .flat_map(|benchmark| benchmark.probes.iter())
            .all(ProbeComparison::is_equivalent)
    }
}

fn default_probes() -> Vec<Box<dyn ProbeParser>> {
    vec![
        Box::new(throughput::ThroughputParser::new()),
        Box::new(percentile::PercentileParser::new()),
        Box::new(hdr::HdrParser::new()),
    ]
}

fn probe_figures(
    probe: &mut Box<dyn ProbeParser>,
    leaves: &[PathBuf],
) -> HarnessResult<Vec<ProbeFigure>> {
    probe.reset();
    for leaf in leaves {
        probe.parse(leaf)?;
    }
    probe.results()
}

/// Walks the candidate tree, matches each benchmark against the baseline
/// tree and runs every probe over both.
pub fn analyze(candidate_dir: &Path, baseline_dir: &Path) -> HarnessResult<RunComparison> {
    let candidate_root = find_benchmark_root(candidate_dir)?;
    let baseline_root = find_benchmark_root(baseline_dir)?;
    let mut probes = default_probes();

    let mut benchmarks = vec![];
    for benchmark_dir in sorted_subdirs(&candidate_root)? {
        let name = benchmark_dir
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .context(format!("Benchmark directory {:?} has no name", benchmark_dir))?;

        let candidate_leaves = workload_output_dirs(&benchmark_dir)?;
        if candidate_leaves.is_empty() {
            debug!("skipping {:?}, no workload output inside", benchmark_dir);
            continue;
        }
        let baseline_leaves = workload_output_dirs(&baseline_root.join(&name)).context(format!(
            "Benchmark {} is missing from the baseline tree",
            name
        ))?;

        let mut rows = vec![];
        for probe in probes.iter_mut() {
            let candidate_figures = probe_figures(probe, &candidate_leaves)?;
            let baseline_figures = probe_figures(probe, &baseline_leaves)?;

            for (candidate, baseline) in candidate_figures.iter().zip(baseline_figures.iter()) {
                rows.push(ProbeComparison {
                    description: candidate.description.clone(),
                    baseline: baseline.value,
                    candidate: candidate.value,
                });
            }
        }
        benchmarks.push(BenchmarkComparison { name, probes: rows });
    }

    if benchmarks.is_empty() {
        return Err(HarnessError::Other(anyhow::anyhow!(
            "No benchmark results found under {:?}",
            candidate_dir
        )));
    }
    Ok(RunComparison { benchmarks })
}
