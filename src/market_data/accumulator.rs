// =============================================================================
// Bar accumulator — two-level OHLCV roll-up with bounded history
// =============================================================================
//
// Incoming atomic bars (1-second aggregates from the stream) fold into an
// active first-level bar; every completed first-level bar folds into an
// active second-level bar. Both finished histories are trimmed from the front
// to the configured size. The second-level window must be an integer multiple
// of the first. Reads merge the denser layer that can satisfy the request,
// then sort by timestamp and dedupe so consumers always see a strictly
// monotone sequence.
// =============================================================================

use parking_lot::Mutex;
use tracing::debug;

use crate::error::{EngineError, EngineResult};
use crate::types::Bar;

struct AccumulatorInner {
    l1_history: Vec<Bar>,
    l2_history: Vec<Bar>,
    l1_active: Bar,
    l2_active: Bar,
    l1_count: u32,
    l2_count: u32,
    l1_window_start_ms: i64,
    l2_window_start_ms: i64,
}

impl AccumulatorInner {
    fn new() -> Self {
        Self {
            l1_history: Vec::new(),
            l2_history: Vec::new(),
            l1_active: Bar::default(),
            l2_active: Bar::default(),
            l1_count: 0,
            l2_count: 0,
            l1_window_start_ms: 0,
            l2_window_start_ms: 0,
        }
    }
}

pub struct BarAccumulator {
    inner: Mutex<AccumulatorInner>,
    l1_period: u32,
    l2_period: u32,
    max_history: usize,
}

/// An active bar only counts once it has folded real prices.
fn active_is_valid(bar: &Bar, count: u32) -> bool {
    count > 0 && bar.open > 0.0 && bar.close > 0.0
}

impl BarAccumulator {
    pub fn new(l1_period: u32, l2_period: u32, max_history: usize) -> EngineResult<Self> {
        if l1_period == 0 || l2_period == 0 {
            return Err(EngineError::BadConfig(
                "accumulation periods must be greater than zero".into(),
            ));
        }
        if l2_period % l1_period != 0 {
            return Err(EngineError::BadConfig(
                "second-level period must be a multiple of the first-level period".into(),
            ));
        }
        if max_history == 0 {
            return Err(EngineError::BadConfig(
                "bar history size must be greater than zero".into(),
            ));
        }
        Ok(Self {
            inner: Mutex::new(AccumulatorInner::new()),
            l1_period,
            l2_period,
            max_history,
        })
    }

    /// Fold one incoming bar. Bars with non-positive prices or unparseable
    /// timestamps are dropped.
    pub fn add_bar(&self, incoming: &Bar) {
        if incoming.open <= 0.0
            || incoming.high <= 0.0
            || incoming.low <= 0.0
            || incoming.close <= 0.0
        {
            return;
        }
        let Some(timestamp_ms) = incoming.timestamp_ms() else {
            debug!(timestamp = %incoming.timestamp, "bar dropped, unparseable timestamp");
            return;
        };

        let mut inner = self.inner.lock();
        if inner.l1_count == 0 {
            inner.l1_window_start_ms = timestamp_ms;
            inner.l1_active = incoming.clone();
            inner.l1_count = 1;
        } else {
            inner.l1_active.high = inner.l1_active.high.max(incoming.high);
            inner.l1_active.low = inner.l1_active.low.min(incoming.low);
            inner.l1_active.close = incoming.close;
            inner.l1_active.volume += incoming.volume;
            inner.l1_count += 1;

            if inner.l1_count >= self.l1_period {
                self.finalize_l1(&mut inner);
            }
        }
    }

    fn finalize_l1(&self, inner: &mut AccumulatorInner) {
        if inner.l1_count > 0 {
            let completed = inner.l1_active.clone();
            inner.l1_history.push(completed.clone());
            if inner.l1_history.len() > self.max_history {
                let excess = inner.l1_history.len() - self.max_history;
                inner.l1_history.drain(..excess);
            }
            self.fold_into_l2(inner, &completed);
        }
        inner.l1_count = 0;
        inner.l1_active = Bar::default();
        inner.l1_window_start_ms = 0;
    }

    fn fold_into_l2(&self, inner: &mut AccumulatorInner, completed: &Bar) {
        let Some(timestamp_ms) = completed.timestamp_ms() else {
            return;
        };

        if inner.l2_count == 0 {
            inner.l2_window_start_ms = timestamp_ms;
            inner.l2_active = completed.clone();
            inner.l2_count = 1;
        } else {
            inner.l2_active.high = inner.l2_active.high.max(completed.high);
            inner.l2_active.low = inner.l2_active.low.min(completed.low);
            inner.l2_active.close = completed.close;
            inner.l2_active.volume += completed.volume;
            inner.l2_active.timestamp = completed.timestamp.clone();
            inner.l2_count += 1;

            let l1_bars_per_l2 = self.l2_period / self.l1_period;
            if inner.l2_count >= l1_bars_per_l2 {
                self.finalize_l2(inner);
            }
        }
    }

    fn finalize_l2(&self, inner: &mut AccumulatorInner) {
        if inner.l2_count > 0 {
            let completed = inner.l2_active.clone();
            inner.l2_history.push(completed);
            if inner.l2_history.len() > self.max_history {
                let excess = inner.l2_history.len() - self.max_history;
                inner.l2_history.drain(..excess);
            }
        }
        inner.l2_count = 0;
        inner.l2_active = Bar::default();
        inner.l2_window_start_ms = 0;
    }

    /// Return up to `max_bars` bars, strictly monotone and deduped by
    /// timestamp, preferring the denser layer that can already supply the
    /// request (counting valid in-progress bars).
    pub fn accumulated_bars(&self, max_bars: usize) -> Vec<Bar> {
        if max_bars == 0 {
            return Vec::new();
        }
        let inner = self.inner.lock();

        let l1_available = inner.l1_history.len()
            + usize::from(active_is_valid(&inner.l1_active, inner.l1_count));
        let l2_available = inner.l2_history.len()
            + usize::from(active_is_valid(&inner.l2_active, inner.l2_count));

        let mut bars: Vec<Bar> = Vec::new();

        if l1_available >= max_bars {
            let take = max_bars.min(inner.l1_history.len());
            bars.extend_from_slice(&inner.l1_history[inner.l1_history.len() - take..]);
            if bars.len() < max_bars && active_is_valid(&inner.l1_active, inner.l1_count) {
                bars.push(inner.l1_active.clone());
            }
        } else if l2_available >= max_bars {
            let take = max_bars.min(inner.l2_history.len());
            bars.extend_from_slice(&inner.l2_history[inner.l2_history.len() - take..]);
            if bars.len() < max_bars && active_is_valid(&inner.l2_active, inner.l2_count) {
                bars.push(inner.l2_active.clone());
            }
        } else {
            bars.extend_from_slice(&inner.l1_history);
            if active_is_valid(&inner.l1_active, inner.l1_count) {
                bars.push(inner.l1_active.clone());
            }
            if bars.len() < max_bars && !inner.l2_history.is_empty() {
                let remaining = max_bars - bars.len();
                let take = remaining.min(inner.l2_history.len());
                bars.extend_from_slice(&inner.l2_history[inner.l2_history.len() - take..]);
            }
        }
        drop(inner);

        if bars.is_empty() {
            return bars;
        }

        bars.sort_by(|a, b| match (a.timestamp_ms(), b.timestamp_ms()) {
            (Some(ta), Some(tb)) => ta.cmp(&tb),
            _ => a.timestamp.cmp(&b.timestamp),
        });
        bars.dedup_by(|a, b| a.timestamp == b.timestamp);
        if bars.len() > max_bars {
            let excess = bars.len() - max_bars;
            bars.drain(..excess);
        }
        bars
    }

    /// Total bars visible to a reader: the fuller layer, counting valid
    /// in-progress bars.
    pub fn accumulated_bars_count(&self) -> usize {
        let inner = self.inner.lock();
        let l1 = inner.l1_history.len()
            + usize::from(active_is_valid(&inner.l1_active, inner.l1_count));
        let l2 = inner.l2_history.len()
            + usize::from(active_is_valid(&inner.l2_active, inner.l2_count));
        l1.max(l2)
    }

    pub fn clear(&self) {
        *self.inner.lock() = AccumulatorInner::new();
    }
}
