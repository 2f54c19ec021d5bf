use std::collections::VecDeque;

/// Onset timestamps retained for tempo estimation.
pub const ONSET_HISTORY_CAPACITY: usize = 100;
/// Number of most recent onsets considered per estimate.
const TEMPO_WINDOW: usize = 8;
/// Estimates need at least this many intervals surviving outlier rejection.
const MIN_USABLE_INTERVALS: usize = 2;
pub const DEFAULT_TEMPO_BPM: f64 = 120.0;

/// Bounded FIFO of onset timestamps (seconds).
#[derive(Debug, Clone)]
pub struct OnsetHistory {
    times: VecDeque<f64>,
    capacity: usize,
}

impl OnsetHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            times: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&mut self, time: f64) {
        if self.times.len() == self.capacity {
            self.times.pop_front();
        }
        self.times.push_back(time);
    }

    pub fn len(&self) -> usize {
        self.times.len()
    }

    pub fn is_empty(&self) -> bool {
        self.times.is_empty()
    }

    pub fn latest(&self, count: usize) -> impl Iterator<Item = f64> + '_ {
        self.times.iter().skip(self.times.len().saturating_sub(count)).copied()
    }
}

impl Default for OnsetHistory {
    fn default() -> Self {
        Self::new(ONSET_HISTORY_CAPACITY)
    }
}

/// Inter-onset-interval tempo tracker. The estimate holds its last value
/// until enough consistent intervals arrive to replace it.
#[derive(Debug, Clone)]
pub struct TempoEstimator {
    history: OnsetHistory,
    min_bpm: f64,
    max_bpm: f64,
    bpm: f64,
}

impl TempoEstimator {
    pub fn new(min_bpm: f64, max_bpm: f64) -> Self {
        Self {
            history: OnsetHistory::default(),
            min_bpm,
            max_bpm,
            bpm: DEFAULT_TEMPO_BPM.clamp(min_bpm, max_bpm),
        }
    }

    pub fn bpm(&self) -> f64 {
        self.bpm
    }

    pub fn history(&self) -> &OnsetHistory {
        &self.history
    }

    /// Records an onset and re-estimates. Returns the current tempo.
    pub fn record_onset(&mut self, time: f64) -> f64 {
        self.history.push(time);
        if let Some(bpm) = self.estimate() {
            self.bpm = bpm;
        }
        self.bpm
    }

    fn estimate(&self) -> Option<f64> {
        if self.history.len() < 2 {
            return None;
        }

        let recent: Vec<f64> = self.history.latest(TEMPO_WINDOW).collect();
        let intervals: Vec<f64> = recent.windows(2).map(|pair| pair[1] - pair[0]).collect();
        let median = median(&intervals)?;
        if median <= 0.0 {
            return None;
        }

        let usable: Vec<f64> = intervals
            .into_iter()
            .filter(|interval| (0.5 * median..=2.0 * median).contains(interval))
            .collect();
        if usable.len() < MIN_USABLE_INTERVALS {
            return None;
        }

        let mean = usable.iter().sum::<f64>() / usable.len() as f64;
        Some((60.0 / mean).clamp(self.min_bpm, self.max_bpm))
    }
}

fn median(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let mid = sorted.len() / 2;
    Some(if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    })
}
