// This Source Code Form is subject to the terms of the Mozilla
// Public License, v. 2.0. If a copy of the MPL was not distributed
// with this file, You can obtain one at http://mozilla.org/MPL/2.0/.

use crate::analysis::{data_lines, ProbeFigure, ProbeParser};
use crate::errors::{HarnessError, HarnessResult};
use crate::workload::PERCENTILE_FILE;
use anyhow::anyhow;
use std::path::Path;

pub const PERCENTILE_DESCRIPTION: &str = "99th percentile latency";

const PERCENTILE: f64 = 99.0;

// Tolerance used both when deciding whether the bucket fractions need
// rescaling and when walking them toward a target percentile.
const EPSILON: f64 = 0.0001;

struct Bucket {
    start: u64,
    fraction: f64,
}

/// Estimates latency percentiles from the bucketed distribution each worker
/// writes. Buckets from multiple workers are kept side by side and their
/// fractions rescaled to sum to one, which weights every worker's
/// distribution by the share of samples it contributed.
pub struct PercentileParser {
    buckets: Vec<Bucket>,
}

impl PercentileParser {
    pub fn new() -> Self {
        PercentileParser { buckets: vec![] }
    }

    fn value_at_percentile(&self, percentile: f64) -> HarnessResult<f64> {
        if !(0.0..=100.0).contains(&percentile) {
            return Err(HarnessError::Other(anyhow!(
                "percentile must lie between 0 and 100, got {}",
                percentile
            )));
        }
        if self.buckets.is_empty() {
            return Err(HarnessError::Other(anyhow!(
                "no percentile data has been parsed"
            )));
        }
        if self.buckets.len() == 1 {
            return Ok(self.buckets[0].start as f64);
        }

        let total: f64 = self.buckets.iter().map(|bucket| bucket.fraction).sum();
        let scale = if (1.0 - total).abs() > EPSILON {
            total
        } else {
            1.0
        };
        let fraction_of = |index: usize| self.buckets[index].fraction / scale;

        let target = percentile / 100.0;
        let mut index = 0;
        let mut accumulated = fraction_of(0);
        while target - accumulated > EPSILON {
            index += 1;
            if index >= self.buckets.len() {
                return Err(HarnessError::Other(anyhow!(
                    "bucket fractions sum below the {}th percentile",
                    percentile
                )));
            }
            accumulated += fraction_of(index);
        }

        let bucket = &self.buckets[index];
        let width = match self.buckets.get(index + 1) {
            Some(next) => next.start - bucket.start,
            None => bucket.start - self.buckets[index - 1].start,
        };
        let overshoot = (accumulated - target) / fraction_of(index);
        Ok(bucket.start as f64 + width as f64 * (1.0 - overshoot))
    }
}

impl Default for PercentileParser {
    fn default() -> Self {
        Self::new()
    }
}

impl ProbeParser for PercentileParser {
    fn parse(&mut self, probe_dir: &Path) -> HarnessResult<()> {
        let path = probe_dir.join(PERCENTILE_FILE);
        if !path.exists() {
            return Err(HarnessError::MissingProbeData(path));
        }
        let contents = std::fs::read_to_string(&path)
            .map_err(|e| anyhow::Error::new(e).context(format!("Unable to read {:?}", path)))?;

        for line in data_lines(&contents) {
            let fields: Vec<&str> = line.split(',').collect();
            let malformed = || HarnessError::MalformedLine {
                path: path.clone(),
                line: line.to_string(),
            };

            let [start, fraction] = &fields[..] else {
                return Err(malformed());
            };
            let start = start.parse::<u64>().map_err(|_| malformed())?;
            let fraction = fraction.parse::<f64>().map_err(|_| malformed())?;
            self.buckets.push(Bucket { start, fraction });
        }
        Ok(())
    }

    fn reset(&mut self) {
        self.buckets = vec![];
    }

    fn results(&self) -> HarnessResult<Vec<ProbeFigure>> {
        let value = self.value_at_percentile(PERCENTILE)?;
        Ok(vec![ProbeFigure::new(PERCENTILE_DESCRIPTION, value)])
    }
}
