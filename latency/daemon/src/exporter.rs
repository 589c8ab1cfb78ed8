//! Result exporters
//!
//! Records stream out as JSON lines while the loops run; the final
//! statistics can additionally be written as a Prometheus text snapshot.

use crate::types::{ResultRecord, StatisticsReport};
use anyhow::{Context, Result};
use std::{
    fs::File,
    io::{self, BufWriter, Write},
    path::{Path, PathBuf},
};

/// Sink for result records
pub trait RecordExporter: Send {
    /// Export one record
    ///
    /// # Arguments
    ///
    /// * `record` - Result record to emit
    ///
    /// # Returns
    ///
    /// Result indicating success or failure
    fn export(&mut self, record: &ResultRecord) -> Result<()>;

    /// Flush buffered output
    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Export format for the final statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum ExporterType {
    /// JSON lines
    Json,
    /// Prometheus text exposition format
    Prometheus,
}

/// Compact JSON, one record per line
///
/// Writes to stdout unless quiet, and additionally to a file when one is
/// configured.
pub struct JsonExporter {
    stdout: Option<io::Stdout>,
    file: Option<BufWriter<File>>,
    output_path: Option<PathBuf>,
}

impl JsonExporter {
    /// Create a new JSON exporter
    ///
    /// # Arguments
    ///
    /// * `output_path` - Optional file receiving a copy of every record
    /// * `quiet` - Suppress stdout output
    pub fn new(output_path: Option<PathBuf>, quiet: bool) -> Result<Self> {
        let file = match &output_path {
            Some(path) => Some(BufWriter::new(
                File::create(path)
                    .with_context(|| format!("Failed to create output file: {:?}", path))?,
            )),
            None => None,
        };

        Ok(Self {
            stdout: (!quiet).then(io::stdout),
            file,
            output_path,
        })
    }
}

impl RecordExporter for JsonExporter {
    fn export(&mut self, record: &ResultRecord) -> Result<()> {
        let json = serde_json::to_string(record)?;

        if let Some(stdout) = &self.stdout {
            let mut out = stdout.lock();
            writeln!(out, "{}", json).context("Failed to write to stdout")?;
            out.flush().context("Failed to flush stdout")?;
        }

        if let Some(file) = &mut self.file {
            writeln!(file, "{}", json)
                .with_context(|| format!("Failed to write to output file: {:?}", self.output_path))?;
        }

        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        if let Some(file) = &mut self.file {
            file.flush()
                .with_context(|| format!("Failed to flush output file: {:?}", self.output_path))?;
        }
        Ok(())
    }
}

/// Collects records in memory
impl RecordExporter for Vec<ResultRecord> {
    fn export(&mut self, record: &ResultRecord) -> Result<()> {
        self.push(record.clone());
        Ok(())
    }
}

/// Sends every record to both exporters, first then second
pub struct Tee<A, B>(pub A, pub B);

impl<A: RecordExporter, B: RecordExporter> RecordExporter for Tee<A, B> {
    fn export(&mut self, record: &ResultRecord) -> Result<()> {
        self.0.export(record)?;
        self.1.export(record)
    }

    fn flush(&mut self) -> Result<()> {
        self.0.flush()?;
        self.1.flush()
    }
}

impl<E: RecordExporter> RecordExporter for Option<E> {
    fn export(&mut self, record: &ResultRecord) -> Result<()> {
        match self {
            Some(exporter) => exporter.export(record),
            None => Ok(()),
        }
    }

    fn flush(&mut self) -> Result<()> {
        match self {
            Some(exporter) => exporter.flush(),
            None => Ok(()),
        }
    }
}

/// Prometheus exporter
pub struct PrometheusExporter {
    output_path: PathBuf,
    direction: &'static str,
}

impl PrometheusExporter {
    /// Create a new Prometheus exporter
    ///
    /// # Arguments
    ///
    /// * `output_path` - Path to output file
    /// * `direction` - `tx` or `rx`, used as a label
    pub fn new(output_path: PathBuf, direction: &'static str) -> Self {
        Self {
            output_path,
            direction,
        }
    }

    /// Convert statistics to Prometheus format
    fn to_prometheus_format(stats: &StatisticsReport, direction: &str) -> String {
        let mut output = String::new();

        output.push_str("# HELP txrx_latency_samples_total Number of timing samples\n");
        output.push_str("# TYPE txrx_latency_samples_total counter\n");
        output.push_str(&format!(
            "txrx_latency_samples_total{{direction=\"{}\"}} {}\n",
            direction, stats.count
        ));
        output.push('\n');

        output.push_str("# HELP txrx_latency_outliers_total Samples above the histogram ceiling\n");
        output.push_str("# TYPE txrx_latency_outliers_total counter\n");
        output.push_str(&format!(
            "txrx_latency_outliers_total{{direction=\"{}\"}} {}\n",
            direction, stats.outliers
        ));
        output.push('\n');

        output.push_str("# HELP txrx_latency_deviation_microseconds Observed deviation bounds\n");
        output.push_str("# TYPE txrx_latency_deviation_microseconds gauge\n");
        output.push_str(&format!(
            "txrx_latency_deviation_microseconds{{direction=\"{}\",bound=\"min\"}} {}\n",
            direction, stats.min
        ));
        output.push_str(&format!(
            "txrx_latency_deviation_microseconds{{direction=\"{}\",bound=\"max\"}} {}\n",
            direction, stats.max
        ));
        output.push('\n');

        output.push_str("# HELP txrx_latency_jitter_nanoseconds Interval jitter over the sample window\n");
        output.push_str("# TYPE txrx_latency_jitter_nanoseconds gauge\n");
        output.push_str(&format!(
            "txrx_latency_jitter_nanoseconds{{direction=\"{}\",stat=\"rms\"}} {}\n",
            direction, stats.rms_nsec
        ));
        output.push_str(&format!(
            "txrx_latency_jitter_nanoseconds{{direction=\"{}\",stat=\"max\"}} {}\n",
            direction, stats.max_nsec
        ));
        output.push('\n');

        // Cumulative buckets, one per microsecond
        output.push_str("# HELP txrx_latency_deviation_bucket Deviation histogram (us)\n");
        output.push_str("# TYPE txrx_latency_deviation_bucket histogram\n");
        let mut cumulative: u64 = 0;
        for (usec, count) in stats.histogram.iter().enumerate() {
            cumulative += *count as u64;
            if *count == 0 {
                continue;
            }
            output.push_str(&format!(
                "txrx_latency_deviation_bucket{{direction=\"{}\",le=\"{}\"}} {}\n",
                direction,
                usec + 1,
                cumulative
            ));
        }
        output.push_str(&format!(
            "txrx_latency_deviation_bucket{{direction=\"{}\",le=\"+Inf\"}} {}\n",
            direction, stats.count
        ));
        output.push('\n');

        output
    }

    /// Write a snapshot of `stats`
    pub fn export_statistics(&self, stats: &StatisticsReport) -> Result<()> {
        write_file(&self.output_path, &Self::to_prometheus_format(stats, self.direction))
    }
}

impl RecordExporter for PrometheusExporter {
    /// Only aggregates have a Prometheus rendering; other records are skipped
    fn export(&mut self, record: &ResultRecord) -> Result<()> {
        match record {
            ResultRecord::Histogram(stats) => self.export_statistics(stats),
            _ => Ok(()),
        }
    }
}

fn write_file(path: &Path, contents: &str) -> Result<()> {
    let mut file =
        File::create(path).with_context(|| format!("Failed to create output file: {:?}", path))?;

    file.write_all(contents.as_bytes())
        .with_context(|| format!("Failed to write to output file: {:?}", path))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SequenceError;

    fn create_test_statistics() -> StatisticsReport {
        StatisticsReport {
            count: 1000,
            min: 0,
            max: 42,
            outliers: 2,
            rms_nsec: 1_250,
            max_nsec: -42_000,
            histogram: vec![900, 98, 0, 0],
        }
    }

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("txrx-{}-{}", std::process::id(), name))
    }

    #[test]
    fn test_prometheus_format() {
        let stats = create_test_statistics();
        let prometheus = PrometheusExporter::to_prometheus_format(&stats, "tx");

        assert!(prometheus.contains("txrx_latency_samples_total{direction=\"tx\"} 1000"));
        assert!(prometheus.contains("txrx_latency_outliers_total{direction=\"tx\"} 2"));
        assert!(prometheus.contains("stat=\"max\"} -42000"));
        assert!(prometheus.contains("le=\"1\"} 900"));
        assert!(prometheus.contains("le=\"2\"} 998"));
        assert!(!prometheus.contains("le=\"3\""));
        assert!(prometheus.contains("le=\"+Inf\"} 1000"));
    }

    #[test]
    fn test_json_exporter_writes_lines() {
        let path = temp_path("records.json");
        let mut exporter = JsonExporter::new(Some(path.clone()), true).unwrap();

        exporter
            .export(&ResultRecord::RxError(SequenceError {
                stream_id: 0,
                sequence_number: 5,
                dropped_packets: 1,
                sequence_error: false,
            }))
            .unwrap();
        exporter
            .export(&ResultRecord::Histogram(create_test_statistics()))
            .unwrap();
        exporter.flush().unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with(r#"{"type":"rx-error""#));
        assert!(lines[1].starts_with(r#"{"type":"histogram""#));

        std::fs::remove_file(path).ok();
    }

    #[test]
    fn test_prometheus_exporter_skips_measurements() {
        let path = temp_path("stats.prom");
        let mut exporter = PrometheusExporter::new(path.clone(), "rx");

        exporter
            .export(&ResultRecord::RxError(SequenceError {
                stream_id: 0,
                sequence_number: 1,
                dropped_packets: 0,
                sequence_error: true,
            }))
            .unwrap();
        assert!(!path.exists());

        exporter
            .export(&ResultRecord::Histogram(create_test_statistics()))
            .unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("direction=\"rx\""));

        std::fs::remove_file(path).ok();
    }

    #[test]
    fn test_tee_and_optional_exporters() {
        let record = ResultRecord::RxError(SequenceError {
            stream_id: 1,
            sequence_number: 9,
            dropped_packets: 0,
            sequence_error: true,
        });

        let mut both = Tee(Vec::<ResultRecord>::new(), Some(Vec::<ResultRecord>::new()));
        both.export(&record).unwrap();
        both.flush().unwrap();
        assert_eq!(both.0, vec![record.clone()]);
        assert_eq!(both.1, Some(vec![record.clone()]));

        let mut first_only = Tee(Vec::<ResultRecord>::new(), None::<Vec<ResultRecord>>);
        first_only.export(&record).unwrap();
        assert_eq!(first_only.0.len(), 1);
    }
}
