use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::error::{PResult, PipelineError};
use crate::ingress::IngressQueue;
use crate::types::{NormalizedSample, SensorId, VectorFields};
use crate::window::{WindowBuffer, WindowConfig};

/// Most samples a single tick will move from the queue into the window.
pub const MAX_PER_TICK: usize = 400;

/// Channels the display wants batches for. Capture is never filtered.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelSelection {
    #[default]
    All,
    Only(BTreeSet<SensorId>),
}

impl ChannelSelection {
    /// Parse `all` or a comma separated list of sensor ids.
    pub fn parse(spec: &str) -> PResult<Self> {
        if spec.trim().eq_ignore_ascii_case("all") {
            return Ok(ChannelSelection::All);
        }
        let ids = spec.split(',').map(str::trim).filter(|s| !s.is_empty());
        Self::from_ids(ids)
    }

    pub fn from_ids<'a>(ids: impl IntoIterator<Item = &'a str>) -> PResult<Self> {
        let mut sensors = BTreeSet::new();
        for id in ids {
            if id.eq_ignore_ascii_case("all") {
                return Ok(ChannelSelection::All);
            }
            let sensor = SensorId::parse(id)
                .ok_or_else(|| PipelineError::InvalidParameters(format!("unknown channel {id}")))?;
            sensors.insert(sensor);
        }
        if sensors.is_empty() {
            return Err(PipelineError::InvalidParameters(
                "channel selection is empty".to_string(),
            ));
        }
        Ok(ChannelSelection::Only(sensors))
    }

    pub fn includes(&self, sensor: SensorId) -> bool {
        match self {
            ChannelSelection::All => true,
            ChannelSelection::Only(sensors) => sensors.contains(&sensor),
        }
    }
}

/// Newly buffered points for one channel. Append-only delta, not the whole window.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct FlushBatch {
    pub sensor: SensorId,
    /// Retained point count the display should trim its series to.
    pub capacity: usize,
    pub points: Vec<NormalizedSample>,
}

/// Latest vector reading, for single-value panels and dials.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct Orientation {
    pub sensor: SensorId,
    pub ts_ms: i64,
    #[serde(flatten)]
    pub fields: VectorFields,
}

/// Everything one tick produced.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FlushOutput {
    pub batches: Vec<FlushBatch>,
    pub orientation: Option<Orientation>,
    pub drained: usize,
    /// Samples discarded this tick because the queue lagged more than one window.
    pub lag_dropped: usize,
}

impl FlushOutput {
    pub fn is_empty(&self) -> bool {
        self.drained == 0
    }
}

/// Owns the window buffer and turns queued samples into display batches.
#[derive(Debug)]
pub struct Scheduler {
    window: WindowBuffer,
    selection: ChannelSelection,
    paused: bool,
    max_per_tick: usize,
}

impl Scheduler {
    pub fn new(config: &WindowConfig) -> Self {
        Scheduler {
            window: WindowBuffer::new(config.capacity()),
            selection: ChannelSelection::All,
            paused: false,
            max_per_tick: MAX_PER_TICK,
        }
    }

    pub fn with_max_per_tick(mut self, max_per_tick: usize) -> Self {
        self.max_per_tick = max_per_tick.max(1);
        self
    }

    pub fn window(&self) -> &WindowBuffer {
        &self.window
    }

    pub fn selection(&self) -> &ChannelSelection {
        &self.selection
    }

    pub fn set_selection(&mut self, selection: ChannelSelection) {
        self.selection = selection;
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// Pausing stops batch delivery only; the window keeps filling.
    pub fn set_paused(&mut self, paused: bool) {
        self.paused = paused;
    }

    /// Run one flush tick against `queue` using the config as it is right now.
    pub fn tick(&mut self, config: &WindowConfig, queue: &mut IngressQueue) -> FlushOutput {
        let capacity = config.capacity();
        if self.window.capacity() != capacity {
            log::debug!(
                "[SCHED] Window capacity {} -> {}",
                self.window.capacity(),
                capacity
            );
            self.window.set_capacity(capacity);
        }

        let mut output = FlushOutput::default();

        if queue.len() > capacity {
            output.lag_dropped = queue.discard_oldest(queue.len() - capacity);
            log::debug!(
                "[SCHED] Queue lagging, dropped {} oldest samples",
                output.lag_dropped
            );
        }

        let drained = queue.drain_up_to(self.max_per_tick);
        output.drained = drained.len();

        let mut per_channel: BTreeMap<SensorId, Vec<NormalizedSample>> = BTreeMap::new();
        for sample in drained {
            self.window.push(sample);
            if let Some(fields) = sample.vector() {
                output.orientation = Some(Orientation {
                    sensor: sample.sensor,
                    ts_ms: sample.ts_ms,
                    fields: *fields,
                });
            }
            per_channel.entry(sample.sensor).or_default().push(sample);
        }

        if !self.paused {
            output.batches = per_channel
                .into_iter()
                .filter(|(sensor, _)| self.selection.includes(*sensor))
                .map(|(sensor, points)| FlushBatch {
                    sensor,
                    capacity,
                    points,
                })
                .collect();
        }

        output
    }
}
