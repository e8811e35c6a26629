use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};

use crate::types::{NormalizedSample, SensorId};

pub const MIN_WINDOW_SECONDS: u32 = 1;
pub const MAX_WINDOW_SECONDS: u32 = 10;
pub const MIN_RATE_HZ: u32 = 1;
pub const MAX_RATE_HZ: u32 = 240;

/// Display window length and expected sample rate. Out-of-range input is clamped.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowConfig {
    window_seconds: u32,
    rate_hz: u32,
}

impl WindowConfig {
    pub fn new(window_seconds: i64, rate_hz: i64) -> Self {
        WindowConfig {
            window_seconds: clamp(window_seconds, MIN_WINDOW_SECONDS, MAX_WINDOW_SECONDS),
            rate_hz: clamp(rate_hz, MIN_RATE_HZ, MAX_RATE_HZ),
        }
    }

    pub fn window_seconds(&self) -> u32 {
        self.window_seconds
    }

    pub fn rate_hz(&self) -> u32 {
        self.rate_hz
    }

    pub fn set_window_seconds(&mut self, seconds: i64) {
        self.window_seconds = clamp(seconds, MIN_WINDOW_SECONDS, MAX_WINDOW_SECONDS);
    }

    pub fn set_rate_hz(&mut self, hz: i64) {
        self.rate_hz = clamp(hz, MIN_RATE_HZ, MAX_RATE_HZ);
    }

    /// Points retained per channel.
    pub fn capacity(&self) -> usize {
        ((self.window_seconds * self.rate_hz) as usize).max(1)
    }
}

impl Default for WindowConfig {
    fn default() -> Self {
        WindowConfig::new(2, 60)
    }
}

fn clamp(value: i64, min: u32, max: u32) -> u32 {
    value.clamp(min as i64, max as i64) as u32
}

/// Summary of what a channel currently retains.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ChannelStats {
    pub sensor: SensorId,
    pub len: usize,
    pub capacity: usize,
    pub latest_ts_ms: i64,
    /// Spread between the oldest and newest timestamp held, whatever the arrival order.
    pub span_ms: i64,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub latest: f64,
}

/// Per-channel FIFO of the most recent `capacity` samples.
#[derive(Debug)]
pub struct WindowBuffer {
    channels: BTreeMap<SensorId, VecDeque<NormalizedSample>>,
    capacity: usize,
}

impl WindowBuffer {
    pub fn new(capacity: usize) -> Self {
        WindowBuffer {
            channels: BTreeMap::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Apply a new capacity. Shrinking trims every channel immediately.
    pub fn set_capacity(&mut self, capacity: usize) {
        self.capacity = capacity.max(1);
        for points in self.channels.values_mut() {
            trim(points, self.capacity);
        }
    }

    pub fn push(&mut self, sample: NormalizedSample) {
        let points = self
            .channels
            .entry(sample.sensor)
            .or_insert_with(|| VecDeque::with_capacity(self.capacity.min(2400)));
        points.push_back(sample);
        trim(points, self.capacity);
    }

    pub fn len(&self, sensor: SensorId) -> usize {
        self.channels.get(&sensor).map(|p| p.len()).unwrap_or(0)
    }

    pub fn points(&self, sensor: SensorId) -> impl Iterator<Item = &NormalizedSample> {
        self.channels.get(&sensor).into_iter().flatten()
    }

    pub fn channels(&self) -> impl Iterator<Item = SensorId> + '_ {
        self.channels.keys().copied()
    }

    pub fn stats(&self, sensor: SensorId) -> Option<ChannelStats> {
        let points = self.channels.get(&sensor)?;
        let latest = points.back()?;

        let mut min = f64::INFINITY;
        let mut max = f64::NEG_INFINITY;
        let mut sum = 0.0;
        let mut oldest_ts = i64::MAX;
        let mut newest_ts = i64::MIN;
        for point in points {
            let level = point.level();
            min = min.min(level);
            max = max.max(level);
            sum += level;
            oldest_ts = oldest_ts.min(point.ts_ms);
            newest_ts = newest_ts.max(point.ts_ms);
        }

        Some(ChannelStats {
            sensor,
            len: points.len(),
            capacity: self.capacity,
            latest_ts_ms: latest.ts_ms,
            span_ms: newest_ts - oldest_ts,
            min,
            max,
            mean: sum / points.len() as f64,
            latest: latest.level(),
        })
    }

    pub fn all_stats(&self) -> Vec<ChannelStats> {
        self.channels().filter_map(|s| self.stats(s)).collect()
    }
}

fn trim(points: &mut VecDeque<NormalizedSample>, capacity: usize) {
    if points.len() > capacity {
        let excess = points.len() - capacity;
        points.drain(..excess);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Reading;
    use approx::assert_relative_eq;

    fn temp(ts_ms: i64, value: f64) -> NormalizedSample {
        NormalizedSample {
            sensor: SensorId::Temp,
            ts_ms,
            reading: Reading::Value(value),
        }
    }

    #[test]
    fn test_config_clamps() {
        let config = WindowConfig::new(0, 1000);
        assert_eq!(config.window_seconds(), 1);
        assert_eq!(config.rate_hz(), 240);
        assert_eq!(config.capacity(), 240);

        let mut config = WindowConfig::default();
        assert_eq!(config.capacity(), 120);
        config.set_window_seconds(-3);
        config.set_rate_hz(0);
        assert_eq!(config.capacity(), 1);
        config.set_window_seconds(10);
        config.set_rate_hz(240);
        assert_eq!(config.capacity(), 2400);
    }

    #[test]
    fn test_buffer_keeps_most_recent() {
        let mut window = WindowBuffer::new(3);
        for ts in 0..10 {
            window.push(temp(ts, ts as f64));
        }
        let kept: Vec<i64> = window.points(SensorId::Temp).map(|p| p.ts_ms).collect();
        assert_eq!(kept, vec![7, 8, 9]);
        assert_eq!(window.len(SensorId::Accel), 0);
    }

    #[test]
    fn test_shrink_trims_never_grows() {
        let mut window = WindowBuffer::new(5);
        for ts in 0..5 {
            window.push(temp(ts, 0.0));
        }
        window.set_capacity(2);
        assert_eq!(window.len(SensorId::Temp), 2);
        window.set_capacity(10);
        assert_eq!(window.len(SensorId::Temp), 2);
        let kept: Vec<i64> = window.points(SensorId::Temp).map(|p| p.ts_ms).collect();
        assert_eq!(kept, vec![3, 4]);
    }

    #[test]
    fn test_out_of_order_arrival() {
        let mut window = WindowBuffer::new(3);
        for ts in [10, 30, 20, 5] {
            window.push(temp(ts, ts as f64));
        }
        let kept: Vec<i64> = window.points(SensorId::Temp).map(|p| p.ts_ms).collect();
        assert_eq!(kept, vec![30, 20, 5]);
        let stats = window.stats(SensorId::Temp).unwrap();
        assert_eq!(stats.span_ms, 25);
        assert_eq!(stats.latest_ts_ms, 5);
    }

    #[test]
    fn test_stats() {
        let mut window = WindowBuffer::new(4);
        for (ts, value) in [(1, 2.0), (2, 4.0), (3, 9.0)] {
            window.push(temp(ts, value));
        }
        let stats = window.stats(SensorId::Temp).unwrap();
        assert_eq!(stats.len, 3);
        assert_eq!(stats.capacity, 4);
        assert_relative_eq!(stats.min, 2.0);
        assert_relative_eq!(stats.max, 9.0);
        assert_relative_eq!(stats.mean, 5.0);
        assert_relative_eq!(stats.latest, 9.0);
        assert!(window.stats(SensorId::Gyro).is_none());
    }
}
