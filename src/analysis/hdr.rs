use crate::analysis::{ProbeFigure, ProbeParser};
use crate::errors::{HarnessError, HarnessResult};
use crate::workload::HISTOGRAM_FILE;
use anyhow::anyhow;
use hdrhistogram::serialization::Deserializer;
use hdrhistogram::Histogram;
use std::io::BufReader;
use std::path::Path;

pub const HDR_DESCRIPTION: &str = "HDR 99th percentile latency";

/// Merges the full-resolution latency histograms recorded by each worker.
/// Unlike the bucketed percentile probe this one reports nanoseconds, read
/// from the histogram log the workload writer leaves next to its probe
/// output rather than inside it.
pub struct HdrParser {
    histogram: Option<Histogram<u64>>,
}

impl HdrParser {
    pub fn new() -> Self {
        HdrParser { histogram: None }
    }
}

impl Default for HdrParser {
    fn default() -> Self {
        Self::new()
    }
}

impl ProbeParser for HdrParser {
    fn parse(&mut self, probe_dir: &Path) -> HarnessResult<()> {
        let worker_dir = probe_dir.parent().unwrap_or(probe_dir);
        let path = worker_dir.join(HISTOGRAM_FILE);
        if !path.exists() {
            return Err(HarnessError::MissingProbeData(path));
        }

        let file = std::fs::File::open(&path)
            .map_err(|e| anyhow::Error::new(e).context(format!("Unable to open {:?}", path)))?;
        let histogram: Histogram<u64> = Deserializer::new()
            .deserialize(&mut BufReader::new(file))
            .map_err(|e| anyhow!("Unable to decode histogram {:?}: {:?}", path, e))?;

        match &mut self.histogram {
            Some(accumulated) => accumulated
                .add(&histogram)
                .map_err(|e| anyhow!("Unable to merge histogram {:?}: {:?}", path, e))?,
            None => self.histogram = Some(histogram),
        }
        Ok(())
    }

    fn reset(&mut self) {
        self.histogram = None;
    }

    fn results(&self) -> HarnessResult<Vec<ProbeFigure>> {
        let histogram = self
            .histogram
            .as_ref()
            .ok_or_else(|| anyhow!("no histogram data has been parsed"))?;
        Ok(vec![ProbeFigure::new(
            HDR_DESCRIPTION,
            histogram.value_at_quantile(0.99) as f64,
        )])
    }
}
