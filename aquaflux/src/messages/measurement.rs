use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    fs::{File, OpenOptions},
    io::{BufRead, BufReader, Write},
    path::{Path, PathBuf},
    sync::{Mutex, PoisonError},
};
use tracing::{info, warn};
use uuid::Uuid;

/// Names used for the measurements written by the outputs.
pub const DURATION_TIME: &str = "duration_time";
pub const VOLUME: &str = "volume";
pub const TOTAL_DURATION: &str = "total_duration";
pub const DUTY_CYCLE: &str = "duty_cycle";

/// One value destined for the time-series store.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct Measurement {
    pub measurement: String,
    pub unit: String,
    pub value: f64,
    /// When set, the store uses this instead of the write time. Dispensing
    /// always sets it to the start of the operation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl Measurement {
    pub fn new(measurement: &str, unit: &str, value: f64) -> Self {
        Self {
            measurement: measurement.to_owned(),
            unit: unit.to_owned(),
            value,
            timestamp: None,
        }
    }

    /// Seconds the actuator was driven on.
    pub fn duration_time(seconds: f64) -> Self {
        Self::new(DURATION_TIME, "s", seconds)
    }

    /// Volume dispensed in millilitres.
    pub fn volume(ml: f64) -> Self {
        Self::new(VOLUME, "ml", ml)
    }

    /// Wall clock length of the whole dispense, off periods included.
    pub fn total_duration(seconds: f64) -> Self {
        Self::new(TOTAL_DURATION, "s", seconds)
    }

    /// PWM duty cycle in percent.
    pub fn duty_cycle(percent: f64) -> Self {
        Self::new(DUTY_CYCLE, "percent", percent)
    }

    /// Tag the measurement with an explicit timestamp.
    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }
}

/// A batch of measurements for one channel of one output.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct MeasurementRecord {
    pub output_id: Uuid,
    pub channel: u8,
    pub measurements: Vec<Measurement>,
}

/// Write-only connection to the time-series store.
pub trait MeasurementSink: Send + Sync {
    fn record(&self, output_id: Uuid, channel: u8, measurements: Vec<Measurement>);

    /// Most recent value written for a measurement, used by the
    /// `last_known` startup policy. Stores that cannot answer return `None`.
    fn last_value(&self, _output_id: Uuid, _channel: u8, _measurement: &str) -> Option<f64> {
        None
    }
}

/// Sink that only writes the measurements to the log.
#[derive(Default, Debug, Clone, Copy)]
pub struct LogSink;

impl MeasurementSink for LogSink {
    fn record(&self, output_id: Uuid, channel: u8, measurements: Vec<Measurement>) {
        for m in measurements {
            info!(
                output = %output_id,
                channel,
                measurement = %m.measurement,
                unit = %m.unit,
                value = m.value,
                timestamp = ?m.timestamp,
                "measurement"
            );
        }
    }
}

/// Keeps every record in memory.
#[derive(Default, Debug)]
pub struct MemorySink {
    records: Mutex<Vec<MeasurementRecord>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything recorded so far.
    pub fn records(&self) -> Vec<MeasurementRecord> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl MeasurementSink for MemorySink {
    fn record(&self, output_id: Uuid, channel: u8, measurements: Vec<Measurement>) {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(MeasurementRecord {
                output_id,
                channel,
                measurements,
            });
    }

    fn last_value(&self, output_id: Uuid, channel: u8, measurement: &str) -> Option<f64> {
        let records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        last_in(records.iter(), output_id, channel, measurement)
    }
}

fn last_in<'a>(
    records: impl DoubleEndedIterator<Item = &'a MeasurementRecord>,
    output_id: Uuid,
    channel: u8,
    measurement: &str,
) -> Option<f64> {
    records
        .rev()
        .filter(|r| r.output_id == output_id && r.channel == channel)
        .flat_map(|r| r.measurements.iter().rev())
        .find(|m| m.measurement == measurement)
        .map(|m| m.value)
}

type LastValueKey = (Uuid, u8, String);

/// Appends one JSON line per record to a file. Used by the daemon when
/// no external store is wired up.
#[derive(Debug)]
pub struct JsonLinesSink {
    path: PathBuf,
    file: Mutex<File>,
    last: Mutex<HashMap<LastValueKey, f64>>,
}

impl JsonLinesSink {
    /// Open (or create) the log, reading back existing lines so that the
    /// last known values survive a restart.
    ///
    /// * `path`: file to append to.
    pub fn open<P: AsRef<Path>>(path: P) -> std::io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut last = HashMap::new();
        if path.is_file() {
            for line in BufReader::new(File::open(&path)?).lines() {
                match serde_json::from_str::<MeasurementRecord>(&line?) {
                    Ok(record) => remember(&mut last, &record),
                    Err(err) => warn!("skipping malformed measurement line: {err}"),
                }
            }
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            file: Mutex::new(file),
            last: Mutex::new(last),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn remember(last: &mut HashMap<LastValueKey, f64>, record: &MeasurementRecord) {
    for m in &record.measurements {
        last.insert(
            (record.output_id, record.channel, m.measurement.clone()),
            m.value,
        );
    }
}

impl MeasurementSink for JsonLinesSink {
    fn record(&self, output_id: Uuid, channel: u8, measurements: Vec<Measurement>) {
        let record = MeasurementRecord {
            output_id,
            channel,
            measurements,
        };
        remember(
            &mut self.last.lock().unwrap_or_else(PoisonError::into_inner),
            &record,
        );
        let line = match serde_json::to_string(&record) {
            Ok(line) => line,
            Err(err) => {
                warn!(output = %output_id, "could not serialise measurement: {err}");
                return;
            }
        };
        let mut file = self.file.lock().unwrap_or_else(PoisonError::into_inner);
        if let Err(err) = writeln!(file, "{line}") {
            warn!(path = %self.path.display(), "could not write measurement: {err}");
        }
    }

    fn last_value(&self, output_id: Uuid, channel: u8, measurement: &str) -> Option<f64> {
        self.last
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(output_id, channel, measurement.to_owned()))
            .copied()
    }
}
