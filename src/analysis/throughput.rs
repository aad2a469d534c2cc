use crate::analysis::{data_lines, ProbeFigure, ProbeParser};
use crate::errors::{HarnessError, HarnessResult};
use crate::workload::THROUGHPUT_FILE;
use std::path::Path;
use tracing::warn;

pub const AVERAGE_DESCRIPTION: &str = "average ops/second";
pub const STDDEV_DESCRIPTION: &str = "ops/second standard deviation";
pub const STDERR_DESCRIPTION: &str = "ops/second standard error";

struct Datapoint {
    ops_per_sec: f64,
}

/// Aggregates the per-second throughput lines of every worker and reports
/// the mean ops/second with its spread. A worker that produced no throughput
/// file is tolerated; aggregation proceeds over whatever data exists.
pub struct ThroughputParser {
    datapoints: Vec<Datapoint>,
}

impl ThroughputParser {
    pub fn new() -> Self {
        ThroughputParser { datapoints: vec![] }
    }

    fn average(&self) -> f64 {
        let sum: f64 = self
            .datapoints
            .iter()
            .map(|datapoint| datapoint.ops_per_sec)
            .sum();
        sum / self.datapoints.len() as f64
    }

    fn standard_deviation(&self, average: f64) -> f64 {
        let sum: f64 = self
            .datapoints
            .iter()
            .map(|datapoint| {
                let deviation = datapoint.ops_per_sec - average;
                deviation * deviation
            })
            .sum();
        (sum / (self.datapoints.len() as f64 - 1.0)).sqrt()
    }
}

impl Default for ThroughputParser {
    fn default() -> Self {
        Self::new()
    }
}

impl ProbeParser for ThroughputParser {
    fn parse(&mut self, probe_dir: &Path) -> HarnessResult<()> {
        let path = probe_dir.join(THROUGHPUT_FILE);
        let contents = match std::fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!("result file {:?} missing", path);
                return Ok(());
            }
            Err(e) => {
                return Err(HarnessError::Other(
                    anyhow::anyhow!(e).context(format!("Unable to read {:?}", path)),
                ))
            }
        };

        for line in data_lines(&contents) {
            let fields: Vec<&str> = line.split(',').collect();
            let malformed = || HarnessError::MalformedLine {
                path: path.clone(),
                line: line.to_string(),
            };

            let [_second, ops_per_sec, _avg_latency] = &fields[..] else {
                return Err(malformed());
            };
            let ops_per_sec = ops_per_sec.parse::<f64>().map_err(|_| malformed())?;
            self.datapoints.push(Datapoint { ops_per_sec });
        }
        Ok(())
    }

    fn reset(&mut self) {
        self.datapoints = vec![];
    }

    fn results(&self) -> HarnessResult<Vec<ProbeFigure>> {
        let average = self.average();
        let standard_deviation = self.standard_deviation(average);
        let standard_error = standard_deviation / (self.datapoints.len() as f64).sqrt();

        Ok(vec![
            ProbeFigure::new(AVERAGE_DESCRIPTION, average),
            ProbeFigure::new(STDERR_DESCRIPTION, standard_error),
            ProbeFigure::new(STDDEV_DESCRIPTION, standard_deviation),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn scratch_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("flotilla-throughput-{}", nanoid::nanoid!(5)));
        std::fs::create_dir_all(&dir).expect("scratch dir should be creatable");
        dir
    }

    fn write_probe_file(dir: &Path, lines: &[&str]) {
        let mut contents = String::from("-- 2026-08-21T10:15:00\n** second,opsPerSecond,avgLatency\n");
        for line in lines {
            contents.push_str(line);
            contents.push('\n');
        }
        std::fs::write(dir.join(THROUGHPUT_FILE), contents).expect("probe file should be writable");
    }

    #[test]
    fn aggregates_lines_across_workers() -> anyhow::Result<()> {
        let worker_a = scratch_dir();
        let worker_b = scratch_dir();
        write_probe_file(&worker_a, &["0,10.0,1.5", "1,20.0,1.5"]);
        write_probe_file(&worker_b, &["0,30.0,1.5", "1,40.0,1.5"]);

        let mut parser = ThroughputParser::new();
        parser.parse(&worker_a)?;
        parser.parse(&worker_b)?;

        let figures = parser.results()?;
        assert_eq!(figures[0].description, AVERAGE_DESCRIPTION);
        assert!((figures[0].value - 25.0).abs() < 1e-9);

        // sample stddev of 10,20,30,40 and its standard error
        let stddev = figures
            .iter()
            .find(|figure| figure.description == STDDEV_DESCRIPTION)
            .map(|figure| figure.value)
            .unwrap_or(f64::NAN);
        assert!((stddev - 12.909944487358056).abs() < 1e-9);
        let stderr = figures
            .iter()
            .find(|figure| figure.description == STDERR_DESCRIPTION)
            .map(|figure| figure.value)
            .unwrap_or(f64::NAN);
        assert!((stderr - stddev / 2.0).abs() < 1e-9);

        std::fs::remove_dir_all(&worker_a)?;
        std::fs::remove_dir_all(&worker_b)?;
        Ok(())
    }

    #[test]
    fn a_missing_file_only_warns() -> anyhow::Result<()> {
        let empty_worker = scratch_dir();
        let mut parser = ThroughputParser::new();
        parser.parse(&empty_worker)?;

        let figures = parser.results()?;
        assert!(figures[0].value.is_nan());

        std::fs::remove_dir_all(&empty_worker)?;
        Ok(())
    }

    #[test]
    fn malformed_lines_are_rejected() -> anyhow::Result<()> {
        let worker = scratch_dir();
        write_probe_file(&worker, &["0,ten,1.5"]);

        let mut parser = ThroughputParser::new();
        let err = parser.parse(&worker).unwrap_err();
        assert!(matches!(err, HarnessError::MalformedLine { .. }));

        let worker_short = scratch_dir();
        write_probe_file(&worker_short, &["0,10.0"]);
        let mut parser = ThroughputParser::new();
        assert!(parser.parse(&worker_short).is_err());

        std::fs::remove_dir_all(&worker)?;
        std::fs::remove_dir_all(&worker_short)?;
        Ok(())
    }

    #[test]
    fn reset_clears_accumulated_data() -> anyhow::Result<()> {
        let worker = scratch_dir();
        write_probe_file(&worker, &["0,10.0,1.5"]);

        let mut parser = ThroughputParser::new();
        parser.parse(&worker)?;
        parser.reset();
        parser.parse(&worker)?;

        let figures = parser.results()?;
        assert!((figures[0].value - 10.0).abs() < 1e-9);

        std::fs::remove_dir_all(&worker)?;
        Ok(())
    }
}
