use anyhow::anyhow;
use flotilla::analysis;
use flotilla::analysis::hdr::HDR_DESCRIPTION;
use flotilla::analysis::percentile::PERCENTILE_DESCRIPTION;
use flotilla::analysis::throughput::{
    AVERAGE_DESCRIPTION, STDDEV_DESCRIPTION, STDERR_DESCRIPTION,
};
use flotilla::workload::{
    HISTOGRAM_FILE, PERCENTILE_FILE, THROUGHPUT_FILE, WORKLOAD_OUTPUT_SUFFIX,
};
use hdrhistogram::serialization::{Serializer, V2Serializer};
use hdrhistogram::Histogram;
use std::path::{Path, PathBuf};

fn scratch_dir() -> PathBuf {
    std::env::temp_dir().join(format!("flotilla-compare-{}", nanoid::nanoid!(5)))
}

/// Lays down one worker's results the way a run leaves them on disk: the
/// two probe files inside the timestamped output directory and the latency
/// histogram next to it.
fn write_worker(
    benchmark_dir: &Path,
    role: &str,
    id: usize,
    ops_per_second: &[f64],
    buckets: &[(u64, f64)],
    latency_ns: u64,
) -> anyhow::Result<()> {
    let worker_dir = benchmark_dir.join(format!("{}-{}", role, id));
    let probe_dir = worker_dir.join(format!("20260822-101500{}", WORKLOAD_OUTPUT_SUFFIX));
    std::fs::create_dir_all(&probe_dir)?;

    let mut throughput = String::from("** second,opsPerSecond,avgLatency\n");
    for (second, ops) in ops_per_second.iter().enumerate() {
        throughput.push_str(&format!("{},{:.2},0.50\n", second, ops));
    }
    std::fs::write(probe_dir.join(THROUGHPUT_FILE), throughput)?;

    let mut percentiles = String::from("** bucketStart,fractionOfTotal\n");
    for (start, fraction) in buckets {
        percentiles.push_str(&format!("{},{}\n", start, fraction));
    }
    std::fs::write(probe_dir.join(PERCENTILE_FILE), percentiles)?;

    let mut histogram = Histogram::<u64>::new(3)?;
    histogram.record_n(latency_ns, 100)?;
    let mut buffer = vec![];
    V2Serializer::new()
        .serialize(&histogram, &mut buffer)
        .map_err(|e| anyhow!("serialize failed: {:?}", e))?;
    std::fs::write(worker_dir.join(HISTOGRAM_FILE), buffer)?;

    Ok(())
}

#[test]
fn compares_two_result_trees_probe_by_probe() -> anyhow::Result<()> {
    let base = scratch_dir();
    let candidate = base.join("candidate").join("put_throughput");
    let baseline = base.join("baseline").join("put_throughput");

    // candidate: throughput up, latency down
    write_worker(&candidate, "client", 0, &[10.0, 20.0], &[(0, 0.0), (100, 0.5), (200, 0.5)], 1_000)?;
    write_worker(&candidate, "client", 1, &[30.0, 40.0], &[(0, 0.0), (100, 0.5), (200, 0.5)], 3_000)?;
    write_worker(&baseline, "client", 0, &[18.0, 22.0], &[(0, 0.0), (150, 0.5), (300, 0.5)], 1_500)?;
    write_worker(&baseline, "client", 1, &[18.0, 22.0], &[(0, 0.0), (150, 0.5), (300, 0.5)], 1_500)?;

    // a second benchmark with different figures, so nothing can leak from
    // one benchmark's accumulation into the next
    let candidate_sleep = base.join("candidate").join("sleep_baseline");
    let baseline_sleep = base.join("baseline").join("sleep_baseline");
    write_worker(&candidate_sleep, "client", 0, &[5.0], &[(200, 1.0)], 2_000)?;
    write_worker(&candidate_sleep, "client", 1, &[5.0], &[(200, 1.0)], 2_000)?;
    write_worker(&baseline_sleep, "client", 0, &[10.0], &[(300, 1.0)], 2_000)?;
    write_worker(&baseline_sleep, "client", 1, &[10.0], &[(300, 1.0)], 2_000)?;

    let comparison = analysis::analyze(&base.join("candidate"), &base.join("baseline"))?;

    assert_eq!(comparison.benchmarks.len(), 2);
    let benchmark = &comparison.benchmarks[0];
    assert_eq!(benchmark.name, "put_throughput");
    assert_eq!(
        benchmark
            .probes
            .iter()
            .map(|probe| probe.description.as_str())
            .collect::<Vec<_>>(),
        vec![
            AVERAGE_DESCRIPTION,
            STDERR_DESCRIPTION,
            STDDEV_DESCRIPTION,
            PERCENTILE_DESCRIPTION,
            HDR_DESCRIPTION,
        ]
    );

    let average = &benchmark.probes[0];
    assert!((average.candidate - 25.0).abs() < 1e-9);
    assert!((average.baseline - 20.0).abs() < 1e-9);
    assert!((average.difference() - 0.25).abs() < 1e-9);

    let standard_error = &benchmark.probes[1];
    assert!((standard_error.candidate - 6.454972243679028).abs() < 1e-9);
    assert!((standard_error.baseline - 1.1547005383792515).abs() < 1e-9);

    let standard_deviation = &benchmark.probes[2];
    assert!((standard_deviation.candidate - 12.909944487358056).abs() < 1e-9);
    assert!((standard_deviation.baseline - 2.309401076758503).abs() < 1e-9);

    // worker bucket lists sit side by side, so their fractions are rescaled
    // by the combined total before the percentile walk
    let percentile = &benchmark.probes[3];
    assert!((percentile.candidate - 296.0).abs() < 0.01);
    assert!((percentile.baseline - 444.0).abs() < 0.01);
    assert!((percentile.difference() + 1.0 / 3.0).abs() < 1e-4);

    let hdr = &benchmark.probes[4];
    assert!((2_990.0..=3_010.0).contains(&hdr.candidate));
    assert!((1_490.0..=1_510.0).contains(&hdr.baseline));

    let sleep = &comparison.benchmarks[1];
    assert_eq!(sleep.name, "sleep_baseline");
    let average = &sleep.probes[0];
    assert!((average.candidate - 5.0).abs() < 1e-9);
    assert!((average.baseline - 10.0).abs() < 1e-9);
    assert!((average.difference() + 0.5).abs() < 1e-9);
    // every sample in one bucket collapses the interpolation width to zero
    let percentile = &sleep.probes[3];
    assert!((percentile.candidate - 200.0).abs() < 1e-9);
    assert!((percentile.baseline - 300.0).abs() < 1e-9);

    assert!(!comparison.is_equivalent());

    let mut rendered = vec![];
    analysis::report::write_text(&comparison, &mut rendered)?;
    let rendered = String::from_utf8(rendered)?;
    assert!(rendered.contains("put_throughput"));
    assert!(rendered.contains("Difference:  +25.0%"));
    assert!(rendered.contains("Difference:  -33.3%"));

    std::fs::remove_dir_all(&base)?;
    Ok(())
}

#[test]
fn skips_junk_directories_and_descends_into_wrappers() -> anyhow::Result<()> {
    let base = scratch_dir();
    let candidate_root = base.join("candidate").join("benchmarks_20260822");
    let baseline_root = base.join("baseline");

    write_worker(
        &candidate_root.join("put_throughput"),
        "client",
        0,
        &[10.0],
        &[(0, 0.0), (100, 0.5), (200, 0.5)],
        1_000,
    )?;
    // stray directories a run leaves around: neither holds workload output
    std::fs::create_dir_all(candidate_root.join("put_throughput").join("logs"))?;
    std::fs::create_dir_all(candidate_root.join("metadata"))?;

    write_worker(
        &baseline_root.join("put_throughput"),
        "client",
        0,
        &[10.0],
        &[(0, 0.0), (100, 0.5), (200, 0.5)],
        1_000,
    )?;

    let comparison = analysis::analyze(&base.join("candidate"), &baseline_root)?;

    assert_eq!(comparison.benchmarks.len(), 1);
    assert_eq!(comparison.benchmarks[0].name, "put_throughput");
    assert_eq!(comparison.benchmarks[0].probes.len(), 5);
    assert!(comparison.is_equivalent());

    std::fs::remove_dir_all(&base)?;
    Ok(())
}

#[test]
fn a_benchmark_absent_from_the_baseline_is_an_error() -> anyhow::Result<()> {
    let base = scratch_dir();
    let candidate = base.join("candidate");
    let baseline = base.join("baseline");

    write_worker(
        &candidate.join("put_throughput"),
        "client",
        0,
        &[10.0],
        &[(0, 0.0), (100, 0.5), (200, 0.5)],
        1_000,
    )?;
    std::fs::create_dir_all(&baseline)?;

    let err = analysis::analyze(&candidate, &baseline).unwrap_err();
    assert!(err.to_string().contains("missing from the baseline tree"));

    std::fs::remove_dir_all(&base)?;
    Ok(())
}
