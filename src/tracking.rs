//! Experiment tracking sinks. A sink is handed to the trainer explicitly for the length of
//! one run: `start` once, any number of `record` calls, then `finish`.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use burn::module::{Module, ModuleVisitor, Param};
use burn::tensor::Tensor;
use burn::tensor::backend::Backend;
use serde::{Deserialize, Deserializer, Serialize};
use tracing::{debug, info};

use crate::config::{SinkKind, TrackingConfig};

#[derive(Clone, Debug, Serialize)]
pub struct RunInfo {
    pub project: String,
    pub run_dir: PathBuf,
    /// Resolved configuration of the run, stored alongside the metrics.
    pub config: serde_json::Value,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MetricRecord {
    pub step: usize,
    pub name: String,
    #[serde(flatten)]
    pub value: MetricValue,
}

/// JSON has no NaN or infinity: non-finite numbers are written as `null` and read back
/// as NaN.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MetricValue {
    Scalar {
        #[serde(deserialize_with = "nan_from_null")]
        value: f64,
    },
    Table {
        columns: Vec<String>,
        rows: Vec<Vec<String>>,
    },
    Tensor {
        shape: Vec<usize>,
        #[serde(deserialize_with = "nan_elements_from_null")]
        values: Vec<f32>,
    },
}

fn nan_from_null<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
    Ok(Option::<f64>::deserialize(deserializer)?.unwrap_or(f64::NAN))
}

fn nan_elements_from_null<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<f32>, D::Error> {
    Ok(Vec::<Option<f32>>::deserialize(deserializer)?
        .into_iter()
        .map(|value| value.unwrap_or(f32::NAN))
        .collect())
}

impl MetricRecord {
    pub fn scalar(step: usize, name: impl Into<String>, value: f64) -> Self {
        Self {
            step,
            name: name.into(),
            value: MetricValue::Scalar { value },
        }
    }

    /// Single-column text table, one row per entry.
    pub fn text_column(step: usize, name: impl Into<String>, column: &str, texts: &[String]) -> Self {
        Self {
            step,
            name: name.into(),
            value: MetricValue::Table {
                columns: vec![column.to_string()],
                rows: texts.iter().map(|text| vec![text.clone()]).collect(),
            },
        }
    }

    pub fn tensor(step: usize, snapshot: ParameterSnapshot) -> Self {
        Self {
            step,
            name: snapshot.name,
            value: MetricValue::Tensor {
                shape: snapshot.shape,
                values: snapshot.values,
            },
        }
    }
}

pub trait MetricSink {
    fn start(&mut self, run: &RunInfo) -> Result<()> {
        let _ = run;
        Ok(())
    }

    fn record(&mut self, record: &MetricRecord) -> Result<()>;

    fn finish(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Appends one JSON object per record to `<run_dir>/metrics.jsonl` and writes the run
/// description to `<run_dir>/run.json`.
pub struct JsonlSink {
    run_dir: PathBuf,
    writer: Option<BufWriter<File>>,
}

impl JsonlSink {
    pub fn new(run_dir: impl Into<PathBuf>) -> Self {
        Self {
            run_dir: run_dir.into(),
            writer: None,
        }
    }

    pub fn metrics_path(&self) -> PathBuf {
        self.run_dir.join("metrics.jsonl")
    }
}

impl MetricSink for JsonlSink {
    fn start(&mut self, run: &RunInfo) -> Result<()> {
        fs::create_dir_all(&self.run_dir).with_context(|| {
            format!("failed to create run directory {}", self.run_dir.display())
        })?;

        let run_path = self.run_dir.join("run.json");
        let payload = serde_json::to_string_pretty(run).context("failed to serialize run info")?;
        fs::write(&run_path, payload)
            .with_context(|| format!("failed to write {}", run_path.display()))?;

        let metrics_path = self.metrics_path();
        let file = File::create(&metrics_path)
            .with_context(|| format!("failed to create {}", metrics_path.display()))?;
        self.writer = Some(BufWriter::new(file));
        Ok(())
    }

    fn record(&mut self, record: &MetricRecord) -> Result<()> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| anyhow!("jsonl sink used before start"))?;
        serde_json::to_writer(&mut *writer, record).context("failed to serialize metric")?;
        writer.write_all(b"\n").context("failed to write metric")?;
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush().context("failed to flush metrics")?;
        }
        Ok(())
    }
}

/// Forwards records to `tracing`. Tensor dumps are summarized at debug level.
#[derive(Default)]
pub struct ConsoleSink;

impl MetricSink for ConsoleSink {
    fn start(&mut self, run: &RunInfo) -> Result<()> {
        info!(
            "tracking run for project `{}` in {}",
            run.project,
            run.run_dir.display()
        );
        Ok(())
    }

    fn record(&mut self, record: &MetricRecord) -> Result<()> {
        match &record.value {
            MetricValue::Scalar { value } => {
                info!("[step {}] {} = {value:.4}", record.step, record.name);
            }
            MetricValue::Table { rows, .. } => {
                info!("[step {}] {}:", record.step, record.name);
                for row in rows {
                    info!("  {}", row.join(" | "));
                }
            }
            MetricValue::Tensor { shape, values } => {
                let (min, max) = values
                    .iter()
                    .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), v| {
                        (lo.min(*v), hi.max(*v))
                    });
                let mean = values.iter().sum::<f32>() / values.len().max(1) as f32;
                debug!(
                    "[step {}] {} shape={shape:?} mean={mean:.4} min={min:.4} max={max:.4}",
                    record.step, record.name
                );
            }
        }
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        info!("tracking run finished");
        Ok(())
    }
}

/// Keeps every record in memory.
#[derive(Default, Debug)]
pub struct MemorySink {
    pub records: Vec<MetricRecord>,
    pub started: bool,
    pub finished: bool,
}

impl MemorySink {
    pub fn scalars(&self, name: &str) -> Vec<(usize, f64)> {
        self.records
            .iter()
            .filter(|record| record.name == name)
            .filter_map(|record| match record.value {
                MetricValue::Scalar { value } => Some((record.step, value)),
                _ => None,
            })
            .collect()
    }

    pub fn named(&self, name: &str) -> impl Iterator<Item = &MetricRecord> {
        self.records.iter().filter(move |record| record.name == name)
    }
}

impl MetricSink for MemorySink {
    fn start(&mut self, _run: &RunInfo) -> Result<()> {
        self.started = true;
        Ok(())
    }

    fn record(&mut self, record: &MetricRecord) -> Result<()> {
        self.records.push(record.clone());
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        self.finished = true;
        Ok(())
    }
}

/// Fans every call out to each inner sink in order.
#[derive(Default)]
pub struct MultiSink {
    sinks: Vec<Box<dyn MetricSink>>,
}

impl MultiSink {
    pub fn new(sinks: Vec<Box<dyn MetricSink>>) -> Self {
        Self { sinks }
    }

    pub fn push(&mut self, sink: Box<dyn MetricSink>) {
        self.sinks.push(sink);
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl MetricSink for MultiSink {
    fn start(&mut self, run: &RunInfo) -> Result<()> {
        self.sinks.iter_mut().try_for_each(|sink| sink.start(run))
    }

    fn record(&mut self, record: &MetricRecord) -> Result<()> {
        self.sinks.iter_mut().try_for_each(|sink| sink.record(record))
    }

    fn finish(&mut self) -> Result<()> {
        self.sinks.iter_mut().try_for_each(|sink| sink.finish())
    }
}

/// Sinks requested by the tracking configuration, writing files under `run_dir`.
pub fn build_sinks(config: &TrackingConfig, run_dir: &Path) -> MultiSink {
    let mut sinks = MultiSink::default();
    for kind in &config.sinks {
        match kind {
            SinkKind::Jsonl => sinks.push(Box::new(JsonlSink::new(run_dir))),
            SinkKind::Console => sinks.push(Box::new(ConsoleSink)),
        }
    }
    sinks
}

/// Values of one float parameter tensor, flattened in row-major order.
#[derive(Clone, Debug, PartialEq)]
pub struct ParameterSnapshot {
    pub name: String,
    pub shape: Vec<usize>,
    pub values: Vec<f32>,
}

/// Copy every float parameter of `module` to the host, in visiting order.
pub fn collect_parameters<B: Backend, M: Module<B>>(module: &M) -> Result<Vec<ParameterSnapshot>> {
    let mut collector = ParameterCollector {
        snapshots: Vec::new(),
        error: None,
    };
    module.visit(&mut collector);
    match collector.error {
        Some(err) => Err(err),
        None => Ok(collector.snapshots),
    }
}

struct ParameterCollector {
    snapshots: Vec<ParameterSnapshot>,
    error: Option<anyhow::Error>,
}

impl<B: Backend> ModuleVisitor<B> for ParameterCollector {
    fn visit_float<const D: usize>(&mut self, param: &Param<Tensor<B, D>>) {
        if self.error.is_some() {
            return;
        }
        let tensor = param.val();
        let shape = tensor.dims().to_vec();
        match tensor.to_data().convert::<f32>().into_vec::<f32>() {
            Ok(values) => self.snapshots.push(ParameterSnapshot {
                name: format!("Model Parameter {}", param.id),
                shape,
                values,
            }),
            Err(err) => {
                self.error = Some(anyhow!("failed to read parameter {}: {err:?}", param.id));
            }
        }
    }
}

/// Read back a metrics file written by [`JsonlSink`].
pub fn read_metrics(path: &Path) -> Result<Vec<MetricRecord>> {
    let text =
        fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    text.lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| serde_json::from_str(line).context("failed to parse metric record"))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn run_info(dir: &Path) -> RunInfo {
        RunInfo {
            project: "test".into(),
            run_dir: dir.to_path_buf(),
            config: serde_json::json!({ "training": { "max_iters": 3 } }),
        }
    }

    #[test]
    fn jsonl_sink_writes_readable_records() {
        let dir = tempdir().expect("tempdir");
        let mut sink = JsonlSink::new(dir.path());
        sink.start(&run_info(dir.path())).expect("start");
        let records = vec![
            MetricRecord::scalar(0, "Training Loss", 2.5),
            MetricRecord::text_column(0, "Argmax Texts", "Texts", &["ab".to_string()]),
            MetricRecord::tensor(
                0,
                ParameterSnapshot {
                    name: "Model Parameter 1".into(),
                    shape: vec![2],
                    values: vec![0.5, -0.5],
                },
            ),
        ];
        for record in &records {
            sink.record(record).expect("record");
        }
        sink.finish().expect("finish");

        let read = read_metrics(&sink.metrics_path()).expect("read back");
        assert_eq!(read, records);
        assert!(dir.path().join("run.json").is_file());
    }

    #[test]
    fn non_finite_values_read_back_as_nan() {
        let dir = tempdir().expect("tempdir");
        let mut sink = JsonlSink::new(dir.path());
        sink.start(&run_info(dir.path())).expect("start");
        sink.record(&MetricRecord::scalar(3, "Validation Loss", f64::NAN))
            .expect("record");
        sink.record(&MetricRecord::scalar(3, "Validation Perplexity", f64::INFINITY))
            .expect("record");
        sink.record(&MetricRecord::tensor(
            3,
            ParameterSnapshot {
                name: "Model Parameter 2".into(),
                shape: vec![2],
                values: vec![f32::NAN, 1.5],
            },
        ))
        .expect("record");
        sink.finish().expect("finish");

        let read = read_metrics(&sink.metrics_path()).expect("read back");
        assert_eq!(read.len(), 3);
        for record in &read[..2] {
            match record.value {
                MetricValue::Scalar { value } => assert!(value.is_nan(), "{}", record.name),
                ref other => panic!("unexpected value {other:?}"),
            }
        }
        match &read[2].value {
            MetricValue::Tensor { shape, values } => {
                assert_eq!(shape, &vec![2]);
                assert!(values[0].is_nan());
                assert_eq!(values[1], 1.5);
            }
            other => panic!("unexpected value {other:?}"),
        }
    }

    #[test]
    fn jsonl_sink_requires_start() {
        let dir = tempdir().expect("tempdir");
        let mut sink = JsonlSink::new(dir.path());
        assert!(sink.record(&MetricRecord::scalar(0, "x", 1.0)).is_err());
    }

    #[test]
    fn multi_sink_fans_out() {
        let dir = tempdir().expect("tempdir");
        let mut multi = MultiSink::new(vec![Box::new(MemorySink::default()), Box::new(ConsoleSink)]);
        multi.start(&run_info(dir.path())).expect("start");
        multi.record(&MetricRecord::scalar(1, "Validation Loss", 1.0)).expect("record");
        multi.finish().expect("finish");
        assert!(!multi.is_empty());
    }
}
