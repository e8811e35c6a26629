use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

use crate::types::{NormalizedSample, Reading, SensorId};

/// Recorder snapshot for status displays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecorderStatus {
    pub active: bool,
    pub rows: usize,
    pub started_at_ms: Option<i64>,
}

/// Unfiltered capture of every normalized sample while a recording is active.
#[derive(Debug, Default)]
pub struct Recorder {
    active: bool,
    started_at_ms: Option<i64>,
    rows: Vec<NormalizedSample>,
}

impl Recorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Begin a new recording. Rows from any previous recording are discarded.
    pub fn start(&mut self, now_ms: i64) {
        self.rows.clear();
        self.active = true;
        self.started_at_ms = Some(now_ms);
    }

    /// Stop recording, keeping rows for export. Returns whether a recording was active.
    pub fn stop(&mut self) -> bool {
        std::mem::replace(&mut self.active, false)
    }

    /// Append a sample if recording. Returns whether it was kept.
    pub fn record(&mut self, sample: &NormalizedSample) -> bool {
        if !self.active {
            return false;
        }
        self.rows.push(*sample);
        true
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn status(&self) -> RecorderStatus {
        RecorderStatus {
            active: self.active,
            rows: self.rows.len(),
            started_at_ms: self.started_at_ms,
        }
    }

    /// Snapshot rows for export. `None` means there is nothing to export.
    pub fn export(&self) -> Option<RecordingExport> {
        if self.rows.is_empty() {
            return None;
        }
        Some(RecordingExport {
            started_at_ms: self.started_at_ms.unwrap_or_else(|| self.rows[0].ts_ms),
            rows: self.rows.clone(),
        })
    }
}

/// Recorded rows, in normalization order.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordingExport {
    pub started_at_ms: i64,
    pub rows: Vec<NormalizedSample>,
}

/// One output row: timestamp plus one cell per column after `ts_ms`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TableRow {
    pub ts_ms: i64,
    pub cells: Vec<Option<f64>>,
}

/// One sheet of the export artifact.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Table {
    pub name: String,
    pub columns: Vec<&'static str>,
    pub rows: Vec<TableRow>,
}

pub const VECTOR_COLUMNS: [&str; 7] = ["ts_ms", "x", "y", "z", "mag", "theta_deg", "phi_deg"];
pub const ENVIRONMENT_TABLE: &str = "environment";
const ENVIRONMENT_SENSORS: [SensorId; 3] = [SensorId::Temp, SensorId::Pressure, SensorId::Altitude];

impl RecordingExport {
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn by_sensor(&self) -> BTreeMap<SensorId, Vec<NormalizedSample>> {
        let mut groups: BTreeMap<SensorId, Vec<NormalizedSample>> = BTreeMap::new();
        for row in &self.rows {
            groups.entry(row.sensor).or_default().push(*row);
        }
        groups
    }

    /// Shape rows into tables: one per vector sensor, plus one wide
    /// environment table joining scalar sensors on exact timestamp.
    pub fn tables(&self) -> Vec<Table> {
        let groups = self.by_sensor();
        let mut tables: Vec<Table> = groups
            .iter()
            .filter(|(sensor, _)| sensor.is_vector())
            .map(|(sensor, rows)| vector_table(*sensor, rows))
            .collect();

        let environment = self.environment_table();
        if !environment.rows.is_empty() {
            tables.push(environment);
        }
        tables
    }

    fn environment_table(&self) -> Table {
        let mut rows: Vec<TableRow> = Vec::new();
        let mut by_ts: HashMap<i64, usize> = HashMap::new();

        for sample in &self.rows {
            let (Some(column), Reading::Value(value)) = (
                ENVIRONMENT_SENSORS.iter().position(|s| *s == sample.sensor),
                sample.reading,
            ) else {
                continue;
            };

            let existing = by_ts
                .get(&sample.ts_ms)
                .copied()
                .filter(|&idx| rows[idx].cells[column].is_none());
            let idx = match existing {
                Some(idx) => idx,
                None => {
                    rows.push(TableRow {
                        ts_ms: sample.ts_ms,
                        cells: vec![None; ENVIRONMENT_SENSORS.len()],
                    });
                    by_ts.insert(sample.ts_ms, rows.len() - 1);
                    rows.len() - 1
                }
            };
            rows[idx].cells[column] = Some(value);
        }

        let mut columns = vec!["ts_ms"];
        columns.extend(ENVIRONMENT_SENSORS.iter().map(|s| s.as_str()));
        Table {
            name: ENVIRONMENT_TABLE.to_string(),
            columns,
            rows,
        }
    }
}

fn vector_table(sensor: SensorId, samples: &[NormalizedSample]) -> Table {
    let rows = samples
        .iter()
        .filter_map(|sample| {
            let v = sample.vector()?;
            Some(TableRow {
                ts_ms: sample.ts_ms,
                cells: vec![
                    Some(v.x),
                    Some(v.y),
                    Some(v.z),
                    Some(v.mag),
                    Some(v.theta_deg),
                    Some(v.phi_deg),
                ],
            })
        })
        .collect();
    Table {
        name: sensor.as_str().to_string(),
        columns: VECTOR_COLUMNS.to_vec(),
        rows,
    }
}
