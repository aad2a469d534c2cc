use crate::analysis::{BenchmarkComparison, ProbeComparison, RunComparison};
use colored::*;
use std::io;
use term_table::{row, row::Row, rows, table_cell::*, Table, TableStyle};

/// Writes the comparison in the fixed-width text form kept for diffing and
/// archiving alongside the result trees.
pub fn write_text<W: io::Write>(comparison: &RunComparison, writer: &mut W) -> io::Result<()> {
    for benchmark in &comparison.benchmarks {
        writeln!(writer, "{}", benchmark.name)?;
        for probe in &benchmark.probes {
            writeln!(
                writer,
                "  {:>30}  Baseline: {:12.2}  Test: {:12.2}  Difference: {:+6.1}%",
                probe.description,
                probe.baseline,
                probe.candidate,
                probe.difference() * 100.0
            )?;
        }
    }
    Ok(())
}

fn difference_cell(probe: &ProbeComparison) -> ColoredString {
    let difference = probe.difference() * 100.0;
    match difference.is_nan() {
        true => "--".bright_black(),
        false => {
            let rendered = format!("{:+.1}%", difference);
            if probe.is_equivalent() {
                rendered.bright_black()
            } else {
                rendered.yellow()
            }
        }
    }
}

fn render_benchmark(benchmark: &BenchmarkComparison) -> String {
    let mut probe_rows = rows![row![
        TableCell::builder("Probe".bold()).build(),
        TableCell::builder("Baseline".bold()).build(),
        TableCell::builder("Test".bold()).build(),
        TableCell::builder("Difference".bold()).build()
    ]];
    for probe in &benchmark.probes {
        probe_rows.push(row![
            TableCell::new(&probe.description),
            TableCell::new(format!("{:.2}", probe.baseline)),
            TableCell::new(format!("{:.2}", probe.candidate)),
            TableCell::new(difference_cell(probe))
        ]);
    }

    let table = Table::builder()
        .rows(probe_rows)
        .style(TableStyle::rounded())
        .build();
    table.render()
}

/// Renders the comparison to the console, one rounded table per benchmark.
pub fn print_summary(comparison: &RunComparison) {
    println!("\n{}", " Comparison ".reversed().green());
    for benchmark in &comparison.benchmarks {
        println!("{}:", benchmark.name.green());
        println!("{}", render_benchmark(benchmark));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::ProbeComparison;

    fn sample_comparison() -> RunComparison {
        RunComparison {
            benchmarks: vec![BenchmarkComparison {
                name: "put_throughput".to_string(),
                probes: vec![
                    ProbeComparison {
                        description: "average ops/second".to_string(),
                        baseline: 20.0,
                        candidate: 25.0,
                    },
                    ProbeComparison {
                        description: "99th percentile latency".to_string(),
                        baseline: 300.0,
                        candidate: 303.0,
                    },
                ],
            }],
        }
    }

    #[test]
    fn text_report_uses_fixed_columns() -> anyhow::Result<()> {
        let mut rendered = vec![];
        write_text(&sample_comparison(), &mut rendered)?;
        let rendered = String::from_utf8(rendered)?;

        assert!(rendered.starts_with("put_throughput\n"));
        assert!(rendered.contains("            average ops/second"));
        assert!(rendered.contains("Baseline:        20.00"));
        assert!(rendered.contains("Test:        25.00"));
        assert!(rendered.contains("Difference:  +25.0%"));
        assert!(rendered.contains("Difference:   +1.0%"));
        Ok(())
    }

    #[test]
    fn table_lists_every_probe() {
        let comparison = sample_comparison();
        let rendered = render_benchmark(&comparison.benchmarks[0]);

        assert!(rendered.contains("average ops/second"));
        assert!(rendered.contains("99th percentile latency"));
        assert!(rendered.contains("+25.0%"));
        assert!(rendered.contains("303.00"));
    }
}
