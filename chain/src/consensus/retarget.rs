//! Windowed difficulty retargeting.
//!
//! Difficulty is recomputed once per window of `diff_interval` applied
//! blocks, from the ratio between the intended window duration and the
//! observed one. The full history of targets and window time ranges is
//! kept so that rollbacks through a window boundary can restore the
//! previous target exactly.

use crate::types::Block;

/// First and last timestamp of the blocks in one retarget window.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct TimeRange {
    pub first: i64,
    pub last: i64,
}

/// Difficulty state: the stack of past targets plus the active window.
#[derive(Clone, Debug, PartialEq)]
pub struct DifficultyRetargeter {
    /// History of target values, one per completed window.
    target: Vec<u8>,
    /// History of completed window time ranges, parallel to `target`
    /// pushes after the initial value.
    target_times: Vec<TimeRange>,
    /// The window currently being filled.
    current: TimeRange,
    /// Applied blocks within the current window.
    local_block_count: i64,
    /// Applied blocks since genesis (never resets).
    global_block_count: i64,
}

impl DifficultyRetargeter {
    pub fn new(initial_difficulty: u8) -> Self {
        DifficultyRetargeter {
            target: vec![initial_difficulty],
            target_times: Vec::new(),
            current: TimeRange::default(),
            // Counting starts at -1 so the genesis block lands on zero.
            local_block_count: -1,
            global_block_count: -1,
        }
    }

    /// The difficulty every new block is expected to carry.
    pub fn current_difficulty(&self) -> u8 {
        *self.target.last().expect("target history is never empty")
    }

    pub fn target_history(&self) -> &[u8] {
        &self.target
    }

    pub fn window_history(&self) -> &[TimeRange] {
        &self.target_times
    }

    pub fn global_block_count(&self) -> i64 {
        self.global_block_count
    }

    /// Records one applied block; closes the window when full.
    ///
    /// A window whose `first` timestamp is zero started at the genesis
    /// block and copies the current difficulty instead of recomputing;
    /// genesis carries the timestamp-zero sentinel all nodes share.
    pub fn collect_statistics(&mut self, b: &Block, diff_interval: u64, block_interval: u64) {
        self.global_block_count += 1;
        self.local_block_count += 1;

        if self.local_block_count >= diff_interval as i64 {
            self.current.last = b.timestamp;

            let next = if self.current.first == 0 {
                self.current_difficulty()
            } else {
                self.calculate_new_difficulty(self.current, diff_interval, block_interval)
            };
            self.target.push(next);
            self.target_times.push(self.current);
            tracing::info!(difficulty = next, "retarget window closed");

            self.local_block_count = 0;
            self.current = TimeRange {
                first: b.timestamp,
                last: 0,
            };
        }
    }

    /// Undoes exactly one [`collect_statistics`](Self::collect_statistics).
    ///
    /// Rolling back through a window boundary pops the target and window
    /// histories and re-opens the previous window. The genesis block is
    /// never rolled back.
    pub fn collect_statistics_rollback(&mut self, diff_interval: u64) {
        self.global_block_count -= 1;

        if self.local_block_count == 0 && self.global_block_count != 0 {
            if self.target.len() < 2 || self.target_times.is_empty() {
                // Cannot happen on a consistent history; refuse to pop
                // past the initial target rather than corrupting it.
                tracing::warn!("retarget rollback past initial target refused");
                return;
            }
            self.local_block_count = diff_interval as i64 - 1;
            self.target.pop();
            let reopened = self.target_times.pop().expect("checked non-empty");
            self.current.first = reopened.first;
        } else {
            self.local_block_count -= 1;
        }
    }

    /// Log2 retarget with rounding half away from zero and a ±3 clamp.
    fn calculate_new_difficulty(
        &self,
        t: TimeRange,
        diff_interval: u64,
        block_interval: u64,
    ) -> u8 {
        // Time difference between the first and last block of the window.
        let diff_now = t.last - t.first;

        // How long the window should have taken.
        let diff_wanted = (block_interval * diff_interval) as f64;

        // Non-positive durations cannot be retargeted from; keep the
        // current difficulty rather than panicking on the log.
        if diff_now <= 0 {
            return self.current_difficulty();
        }

        // Each extra leading zero bit makes the lottery twice as hard.
        let mut change = (diff_wanted / diff_now as f64).log2();

        if change > 0.0 {
            change += 0.5;
        } else if change < 0.0 {
            change -= 0.5;
        }

        // At most 8x harder or easier per window.
        change = change.clamp(-3.0, 3.0);

        let delta = change.trunc() as i16;
        (self.current_difficulty() as i16 + delta).clamp(0, 255) as u8
    }
}
